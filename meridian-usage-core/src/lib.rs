pub mod accumulate;
pub mod estimate;
pub mod patch;
pub mod snapshot;

pub use accumulate::OutputAccumulator;
pub use estimate::{estimate_request_tokens, estimate_text_tokens};
pub use patch::{UsageEstimate, patch_claude_usage, patch_responses_usage};
pub use snapshot::UsageSnapshot;
