pub mod claude;
pub mod error_body;
pub mod openai;

pub use claude::{ClaudeCacheCreation, ClaudeUsage};
pub use error_body::{UpstreamErrorBody, UpstreamErrorObject, UpstreamNestedError};
pub use openai::{ResponsesInputTokensDetails, ResponsesUsage};
