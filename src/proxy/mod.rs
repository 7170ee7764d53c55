mod context;
mod headers;
mod pipeline;

pub use context::conversation_id;
pub use headers::upstream_headers;
pub use pipeline::{DispatchPlan, DispatchSuccess, ProxyEngine};
