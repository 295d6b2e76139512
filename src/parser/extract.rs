use super::{
    THINK_CLOSE, THINK_OPEN, TOOL_CALLS_CLOSE, TOOL_CALLS_OPEN, TOOL_CALL_CLOSE, TOOL_CALL_OPEN,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCall {
    pub name: String,
    /// Literal tag contents, byte-exact. Usually valid JSON, but forwarded
    /// as-is either way so the client can report schema errors itself.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// No trigger token outside think regions: the text is plain prose.
    NoTrigger,
    /// Trigger found and at least one complete call parsed.
    ToolCalls {
        prose: String,
        calls: Vec<ExtractedCall>,
    },
    /// Trigger found but no parsable envelope followed; the caller surfaces
    /// the full text as prose.
    Garbled,
}

/// Runs the extraction algorithm over a complete assistant text.
///
/// Text before the trigger is the visible message, text after it is the
/// envelope. Think regions pass through inside the prose and are never
/// scanned for the trigger.
pub fn extract_tool_calls(text: &str, trigger: &str) -> ExtractOutcome {
    if trigger.is_empty() {
        return ExtractOutcome::NoTrigger;
    }
    let Some(pos) = find_trigger_outside_think(text, trigger) else {
        return ExtractOutcome::NoTrigger;
    };
    let prose = &text[..pos];
    let envelope = &text[pos + trigger.len()..];
    let calls = parse_envelope(envelope);
    if calls.is_empty() {
        ExtractOutcome::Garbled
    } else {
        ExtractOutcome::ToolCalls {
            prose: prose.to_string(),
            calls,
        }
    }
}

/// First occurrence of the trigger at think-depth zero. Think tags nest.
fn find_trigger_outside_think(text: &str, trigger: &str) -> Option<usize> {
    let mut depth: u32 = 0;
    let mut i = 0;
    while i < text.len() {
        let rest = &text[i..];
        if rest.starts_with(THINK_OPEN) {
            depth += 1;
            i += THINK_OPEN.len();
            continue;
        }
        if rest.starts_with(THINK_CLOSE) {
            depth = depth.saturating_sub(1);
            i += THINK_CLOSE.len();
            continue;
        }
        if depth == 0 && rest.starts_with(trigger) {
            return Some(i);
        }
        i += rest.chars().next().map(|c| c.len_utf8()).unwrap_or(1);
    }
    None
}

/// Collects every complete `<tool_call>` element. A missing `</tool_calls>`
/// (truncated stream) still yields the complete elements seen.
fn parse_envelope(envelope: &str) -> Vec<ExtractedCall> {
    let region = match envelope.find(TOOL_CALLS_OPEN) {
        Some(i) => &envelope[i + TOOL_CALLS_OPEN.len()..],
        None => envelope,
    };
    let region = match region.find(TOOL_CALLS_CLOSE) {
        Some(i) => &region[..i],
        None => region,
    };

    let mut calls = Vec::new();
    let mut rest = region;
    loop {
        let Some(open) = rest.find(TOOL_CALL_OPEN) else {
            break;
        };
        let after = &rest[open + TOOL_CALL_OPEN.len()..];
        let Some(close) = after.find(TOOL_CALL_CLOSE) else {
            break;
        };
        if let Some(call) = parse_call_block(&after[..close]) {
            calls.push(call);
        }
        rest = &after[close + TOOL_CALL_CLOSE.len()..];
    }
    calls
}

/// Parses one `<tool_call>` body. The name is required and trimmed; the
/// arguments keep their exact bytes.
pub(crate) fn parse_call_block(block: &str) -> Option<ExtractedCall> {
    let name = tag_contents(block, "name")?.trim().to_string();
    if name.is_empty() {
        return None;
    }
    let arguments = tag_contents(block, "arguments")
        .map(|s| s.to_string())
        .unwrap_or_else(|| "{}".to_string());
    if serde_json::from_str::<serde_json::Value>(&arguments).is_err() {
        tracing::debug!(tool = %name, "tool call arguments are not valid JSON, forwarding verbatim");
    }
    Some(ExtractedCall { name, arguments })
}

fn tag_contents<'a>(block: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = block.find(&open)? + open.len();
    let end = block[start..].find(&close)? + start;
    Some(&block[start..end])
}
