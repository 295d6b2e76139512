use super::extract::parse_call_block;
use super::{
    THINK_CLOSE, THINK_OPEN, TOOL_CALLS_CLOSE, TOOL_CALL_CLOSE, TOOL_CALL_OPEN, new_call_id,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
        }
    }
}

/// Frames produced by the detector, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorEvent {
    /// Prose safe to forward as a content delta.
    Content(String),
    /// One fully parsed tool call. The id is already assigned and stays
    /// stable for every delta derived from this event.
    ToolCall {
        index: usize,
        id: String,
        name: String,
        arguments: String,
    },
    /// Stream is complete; no further events will follow.
    Finish(FinishReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Prose,
    InThink,
    InEnvelope,
    Terminal,
}

/// Incremental trigger/envelope detector fed with assistant content deltas.
///
/// While detecting, a tail that could still turn into the trigger token or a
/// think tag is held back, so no partial trigger ever leaks downstream and
/// output is identical for every chunking of the same byte sequence. Once
/// the trigger matches, content emission stops and complete `<tool_call>`
/// elements are emitted as they arrive.
pub struct StreamingDetector {
    trigger: String,
    state: State,
    think_depth: u32,
    buffer: String,
    envelope: String,
    envelope_pos: usize,
    envelope_cap: usize,
    next_index: usize,
}

enum EnvelopeStep {
    Call {
        consumed: usize,
        call: Option<(String, String)>,
    },
    Closed,
    Incomplete,
}

impl StreamingDetector {
    pub fn new(trigger: &str, envelope_cap: usize) -> Self {
        Self {
            trigger: trigger.to_string(),
            state: State::Prose,
            think_depth: 0,
            buffer: String::new(),
            envelope: String::new(),
            envelope_pos: 0,
            envelope_cap,
            next_index: 0,
        }
    }

    /// Consumes one content delta and returns whatever frames became safe to
    /// emit. Blocking the caller blocks the whole pipeline; nothing is
    /// dropped.
    pub fn feed(&mut self, delta: &str) -> Vec<DetectorEvent> {
        match self.state {
            State::Terminal => Vec::new(),
            State::InEnvelope => {
                self.envelope.push_str(delta);
                self.drain_envelope()
            }
            State::Prose | State::InThink => {
                self.buffer.push_str(delta);
                self.scan()
            }
        }
    }

    /// Upstream stream closed: flush held bytes and settle the finish
    /// reason. Idempotent once terminal.
    pub fn finish(&mut self) -> Vec<DetectorEvent> {
        match self.state {
            State::Terminal => Vec::new(),
            State::Prose | State::InThink => {
                let mut events = Vec::new();
                if !self.buffer.is_empty() {
                    events.push(DetectorEvent::Content(std::mem::take(&mut self.buffer)));
                }
                self.state = State::Terminal;
                events.push(DetectorEvent::Finish(FinishReason::Stop));
                events
            }
            State::InEnvelope => {
                let mut events = self.drain_envelope();
                if self.state != State::Terminal {
                    // Truncated envelope: keep whatever complete calls came
                    // through, or fall back to prose when none did.
                    events.extend(self.terminate_envelope());
                }
                events
            }
        }
    }

    fn scan(&mut self) -> Vec<DetectorEvent> {
        let buf = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        let mut emit = String::new();
        let mut i = 0;

        while i < buf.len() {
            let rest = &buf[i..];
            if rest.starts_with(THINK_OPEN) {
                self.think_depth += 1;
                self.state = State::InThink;
                emit.push_str(THINK_OPEN);
                i += THINK_OPEN.len();
                continue;
            }
            if rest.starts_with(THINK_CLOSE) {
                self.think_depth = self.think_depth.saturating_sub(1);
                self.state = if self.think_depth > 0 {
                    State::InThink
                } else {
                    State::Prose
                };
                emit.push_str(THINK_CLOSE);
                i += THINK_CLOSE.len();
                continue;
            }
            if self.think_depth == 0 && rest.starts_with(&self.trigger) {
                if !emit.is_empty() {
                    events.push(DetectorEvent::Content(emit));
                }
                self.state = State::InEnvelope;
                self.envelope = buf[i + self.trigger.len()..].to_string();
                events.extend(self.drain_envelope());
                return events;
            }
            if self.is_partial_token(rest) {
                break;
            }
            let ch_len = rest.chars().next().map(|c| c.len_utf8()).unwrap_or(1);
            emit.push_str(&rest[..ch_len]);
            i += ch_len;
        }

        self.buffer = buf[i..].to_string();
        if !emit.is_empty() {
            events.push(DetectorEvent::Content(emit));
        }
        events
    }

    /// True when `rest` could still grow into a token that must not be
    /// emitted byte-by-byte: the trigger (outside think regions) or a think
    /// tag boundary.
    fn is_partial_token(&self, rest: &str) -> bool {
        (rest.len() < THINK_OPEN.len() && THINK_OPEN.starts_with(rest))
            || (rest.len() < THINK_CLOSE.len() && THINK_CLOSE.starts_with(rest))
            || (self.think_depth == 0
                && rest.len() < self.trigger.len()
                && self.trigger.starts_with(rest))
    }

    fn drain_envelope(&mut self) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        loop {
            if self.state == State::Terminal {
                return events;
            }
            if self.envelope.len() > self.envelope_cap {
                tracing::warn!(
                    bytes = self.envelope.len(),
                    "tool call envelope exceeded size cap"
                );
                events.extend(self.terminate_envelope());
                return events;
            }
            let step = {
                let rest = &self.envelope[self.envelope_pos..];
                let open_call = rest.find(TOOL_CALL_OPEN);
                let close_env = rest.find(TOOL_CALLS_CLOSE);
                match (open_call, close_env) {
                    (Some(open), close) if close.map(|c| open < c).unwrap_or(true) => {
                        let after = &rest[open + TOOL_CALL_OPEN.len()..];
                        match after.find(TOOL_CALL_CLOSE) {
                            Some(end) => EnvelopeStep::Call {
                                consumed: open
                                    + TOOL_CALL_OPEN.len()
                                    + end
                                    + TOOL_CALL_CLOSE.len(),
                                call: parse_call_block(&after[..end])
                                    .map(|c| (c.name, c.arguments)),
                            },
                            None => EnvelopeStep::Incomplete,
                        }
                    }
                    (_, Some(_)) => EnvelopeStep::Closed,
                    _ => EnvelopeStep::Incomplete,
                }
            };
            match step {
                EnvelopeStep::Call { consumed, call } => {
                    self.envelope_pos += consumed;
                    if let Some((name, arguments)) = call {
                        let index = self.next_index;
                        self.next_index += 1;
                        events.push(DetectorEvent::ToolCall {
                            index,
                            id: new_call_id(),
                            name,
                            arguments,
                        });
                    }
                }
                EnvelopeStep::Closed => {
                    events.extend(self.terminate_envelope());
                    return events;
                }
                EnvelopeStep::Incomplete => return events,
            }
        }
    }

    /// Settles the envelope: tool_calls finish when at least one call came
    /// through; otherwise the trigger and the unusable tail are surfaced as
    /// prose with a stop finish.
    fn terminate_envelope(&mut self) -> Vec<DetectorEvent> {
        self.state = State::Terminal;
        if self.next_index > 0 {
            vec![DetectorEvent::Finish(FinishReason::ToolCalls)]
        } else {
            let mut raw = self.trigger.clone();
            raw.push_str(&self.envelope);
            vec![
                DetectorEvent::Content(raw),
                DetectorEvent::Finish(FinishReason::Stop),
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ENVELOPE_CAP_BYTES;
    use std::collections::HashSet;

    const TRIG: &str = "\u{a7}\u{a7}\u{a7}FC\u{a7}\u{a7}\u{a7}"; // §§§FC§§§

    fn run(chunks: &[&str]) -> Vec<DetectorEvent> {
        let mut detector = StreamingDetector::new(TRIG, ENVELOPE_CAP_BYTES);
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(detector.feed(chunk));
        }
        events.extend(detector.finish());
        events
    }

    fn content_of(events: &[DetectorEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                DetectorEvent::Content(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    fn finish_of(events: &[DetectorEvent]) -> FinishReason {
        match events.last() {
            Some(DetectorEvent::Finish(reason)) => *reason,
            other => panic!("expected finish event, got {other:?}"),
        }
    }

    #[test]
    fn prose_passes_through_byte_for_byte() {
        let input = "Hello, how can I help you today?";
        let events = run(&[input]);
        assert_eq!(content_of(&events), input);
        assert_eq!(finish_of(&events), FinishReason::Stop);
    }

    #[test]
    fn output_is_invariant_under_chunking() {
        let text = format!(
            "intro <think>plan {TRIG} here</think> middle{TRIG}<tool_calls><tool_call><name>ping</name><arguments>{{}}</arguments></tool_call></tool_calls>"
        );
        let whole = run(&[&text]);
        for size in [1, 2, 3, 5, 7, 11, 20] {
            let chunks: Vec<String> = text
                .chars()
                .collect::<Vec<_>>()
                .chunks(size)
                .map(|c| c.iter().collect())
                .collect();
            let refs: Vec<&str> = chunks.iter().map(|s| s.as_str()).collect();
            let mut detector = StreamingDetector::new(TRIG, ENVELOPE_CAP_BYTES);
            let mut events = Vec::new();
            for chunk in refs {
                events.extend(detector.feed(chunk));
            }
            events.extend(detector.finish());
            assert_eq!(content_of(&events), content_of(&whole), "chunk size {size}");
            let calls = |evs: &[DetectorEvent]| {
                evs.iter()
                    .filter_map(|e| match e {
                        DetectorEvent::ToolCall { name, arguments, .. } => {
                            Some((name.clone(), arguments.clone()))
                        }
                        _ => None,
                    })
                    .collect::<Vec<_>>()
            };
            assert_eq!(calls(&events), calls(&whole), "chunk size {size}");
        }
    }

    #[test]
    fn partial_trigger_never_leaks() {
        // Trigger split across two chunks: the held-back prefix must not be
        // emitted, and the prose before it must be.
        let events = run(&[
            "Thinking\u{2026} \u{a7}\u{a7}\u{a7}",
            "FC\u{a7}\u{a7}\u{a7}<tool_calls><tool_call><name>ping</name><arguments>{}</arguments></tool_call></tool_calls>",
        ]);
        assert_eq!(content_of(&events), "Thinking\u{2026} ");
        let call = events
            .iter()
            .find_map(|e| match e {
                DetectorEvent::ToolCall {
                    index,
                    name,
                    arguments,
                    ..
                } => Some((*index, name.clone(), arguments.clone())),
                _ => None,
            })
            .expect("tool call event");
        assert_eq!(call, (0, "ping".to_string(), "{}".to_string()));
        assert_eq!(finish_of(&events), FinishReason::ToolCalls);
        assert!(!content_of(&events).contains(TRIG));
    }

    #[test]
    fn abandoned_partial_trigger_is_flushed_as_prose() {
        let events = run(&["count: \u{a7}\u{a7}", " done"]);
        assert_eq!(content_of(&events), "count: \u{a7}\u{a7} done");
        assert_eq!(finish_of(&events), FinishReason::Stop);
    }

    #[test]
    fn trigger_inside_think_region_is_ignored() {
        let text = format!("<think>about to call {TRIG}</think>answer");
        let events = run(&[&text]);
        assert_eq!(content_of(&events), text);
        assert_eq!(finish_of(&events), FinishReason::Stop);
    }

    #[test]
    fn think_tag_split_across_chunks_is_still_recognized() {
        let text_a = "<thi";
        let text_b = format!("nk>{TRIG}</think>visible");
        let events = run(&[text_a, &text_b]);
        assert_eq!(content_of(&events), format!("<think>{TRIG}</think>visible"));
        assert_eq!(finish_of(&events), FinishReason::Stop);
    }

    #[test]
    fn indices_are_monotonic_and_ids_unique() {
        let envelope = format!(
            "{TRIG}<tool_calls>\
             <tool_call><name>a</name><arguments>{{\"n\":1}}</arguments></tool_call>\
             <tool_call><name>b</name><arguments>{{\"n\":2}}</arguments></tool_call>\
             <tool_call><name>c</name><arguments>{{\"n\":3}}</arguments></tool_call>\
             </tool_calls>"
        );
        let events = run(&[&envelope]);
        let mut indices = Vec::new();
        let mut ids = HashSet::new();
        for event in &events {
            if let DetectorEvent::ToolCall { index, id, .. } = event {
                indices.push(*index);
                assert!(id.starts_with("call_"));
                assert!(ids.insert(id.clone()), "duplicate id {id}");
            }
        }
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(finish_of(&events), FinishReason::ToolCalls);
    }

    #[test]
    fn calls_are_emitted_before_the_envelope_closes() {
        let mut detector = StreamingDetector::new(TRIG, ENVELOPE_CAP_BYTES);
        let mut events = detector.feed(&format!(
            "{TRIG}<tool_calls><tool_call><name>first</name><arguments>{{}}</arguments></tool_call>"
        ));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, DetectorEvent::ToolCall { name, .. } if name == "first"))
        );
        events = detector.feed("</tool_calls>");
        assert_eq!(
            events,
            vec![DetectorEvent::Finish(FinishReason::ToolCalls)]
        );
    }

    #[test]
    fn truncated_envelope_keeps_complete_calls() {
        let events = run(&[&format!(
            "{TRIG}<tool_calls><tool_call><name>a</name><arguments>{{}}</arguments></tool_call><tool_call><name>b</name><argum"
        )]);
        let names: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                DetectorEvent::ToolCall { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["a".to_string()]);
        assert_eq!(finish_of(&events), FinishReason::ToolCalls);
    }

    #[test]
    fn garbled_envelope_falls_back_to_prose() {
        let tail = " oops, no xml";
        let events = run(&[&format!("before {TRIG}{tail}")]);
        assert_eq!(content_of(&events), format!("before {TRIG}{tail}"));
        assert_eq!(finish_of(&events), FinishReason::Stop);
    }

    #[test]
    fn oversized_envelope_degrades_to_prose() {
        let mut detector = StreamingDetector::new(TRIG, 64);
        let mut events = detector.feed(&format!("{TRIG}<tool_calls>"));
        let filler = "x".repeat(80);
        events.extend(detector.feed(&filler));
        events.extend(detector.finish());
        assert_eq!(finish_of(&events), FinishReason::Stop);
        assert!(content_of(&events).contains(&filler));
    }

    #[test]
    fn empty_stream_finishes_with_stop() {
        let mut detector = StreamingDetector::new(TRIG, ENVELOPE_CAP_BYTES);
        let events = detector.finish();
        assert_eq!(events, vec![DetectorEvent::Finish(FinishReason::Stop)]);
        assert!(detector.finish().is_empty());
    }
}
