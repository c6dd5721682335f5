//! Hook for inspecting request bytes.
//!
//! The event loop hands every chunk it reads to an [`Observer`] before
//! replying. Observers see the data; they never influence the reply.

use tracing::info;

/// Receives the raw bytes of each read.
pub trait Observer: Send + 'static {
    fn observe(&mut self, conn_id: usize, bytes: &[u8]);
}

/// Logs each chunk as a numeric byte array.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn observe(&mut self, conn_id: usize, bytes: &[u8]) {
        info!(conn_id, len = bytes.len(), bytes = %render_bytes(bytes), "Received");
    }
}

/// Render bytes as `[b0, b1, ...]` without decoding them.
pub fn render_bytes(bytes: &[u8]) -> String {
    format!("{bytes:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_bytes() {
        assert_eq!(render_bytes(b"ping"), "[112, 105, 110, 103]");
        assert_eq!(render_bytes(&[0xff, 0x00]), "[255, 0]");
        assert_eq!(render_bytes(b""), "[]");
    }
}
