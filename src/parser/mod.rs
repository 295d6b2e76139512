mod extract;
mod stream;

pub use extract::{ExtractOutcome, ExtractedCall, extract_tool_calls};
pub use stream::{DetectorEvent, FinishReason, StreamingDetector};

/// Hard bound on accumulated envelope bytes before the response degrades to
/// prose instead of growing without limit.
pub const ENVELOPE_CAP_BYTES: usize = 256 * 1024;

pub(crate) const TOOL_CALLS_OPEN: &str = "<tool_calls>";
pub(crate) const TOOL_CALLS_CLOSE: &str = "</tool_calls>";
pub(crate) const TOOL_CALL_OPEN: &str = "<tool_call>";
pub(crate) const TOOL_CALL_CLOSE: &str = "</tool_call>";
pub(crate) const THINK_OPEN: &str = "<think>";
pub(crate) const THINK_CLOSE: &str = "</think>";

/// Tool call ids are unique within a response and stable across the deltas
/// of one streaming call.
pub fn new_call_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..12])
}
