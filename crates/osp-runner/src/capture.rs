// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded stream capture and UTF-8-safe truncation.

/// Capture buffer that retains a bounded prefix while counting everything.
#[derive(Debug, Clone)]
pub struct StreamCapture {
    /// Retained prefix, at most the configured capacity.
    pub buffer: Vec<u8>,
    /// Total bytes observed on the stream.
    pub total_bytes: u64,
    cap: usize,
}

impl StreamCapture {
    /// New capture retaining at most `cap` bytes.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            buffer: Vec::new(),
            total_bytes: 0,
            cap,
        }
    }

    /// Feed a chunk: the prefix is retained up to capacity, the rest is
    /// counted and dropped.
    pub fn push(&mut self, chunk: &[u8]) {
        self.total_bytes += chunk.len() as u64;
        let room = self.cap.saturating_sub(self.buffer.len());
        if room > 0 {
            self.buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }
}

/// Lossily decode at most `max_bytes` of `bytes`, cutting at a character
/// boundary so the inline slice is always valid UTF-8.
#[must_use]
pub fn truncate_utf8(bytes: &[u8], max_bytes: usize) -> String {
    let slice = if bytes.len() <= max_bytes {
        bytes
    } else {
        let mut end = max_bytes;
        // Back off from a continuation byte to the previous boundary.
        while end > 0 && (bytes[end] & 0b1100_0000) == 0b1000_0000 {
            end -= 1;
        }
        &bytes[..end]
    };
    String::from_utf8_lossy(slice).into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
