//! Bounded accumulation of streamed output text.

use crate::estimate::estimate_text_tokens;

/// Cap on collected output text. Pathologically long responses stop
/// accumulating here; estimation then works from what was captured.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Collects text and tool-argument deltas from a live stream for
/// end-of-stream token estimation.
#[derive(Debug, Default)]
pub struct OutputAccumulator {
    buf: String,
    truncated: bool,
}

impl OutputAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) {
        if self.truncated {
            return;
        }
        let remaining = MAX_CAPTURE_BYTES.saturating_sub(self.buf.len());
        if fragment.len() <= remaining {
            self.buf.push_str(fragment);
            return;
        }
        // Cut on a char boundary at or below the remaining budget.
        let mut cut = remaining;
        while cut > 0 && !fragment.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buf.push_str(&fragment[..cut]);
        self.truncated = true;
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn estimated_tokens(&self) -> u64 {
        estimate_text_tokens(&self.buf)
    }
}
