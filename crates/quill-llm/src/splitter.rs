//! Tag-aware splitter that routes streamed model text into visible content
//! and reasoning channels.
//!
//! Some backends interleave chain-of-thought into the content stream wrapped
//! in markers such as `<think>...</think>`; others omit the opening marker
//! and start the response mid-reasoning. The splitter buffers just enough
//! text to classify it without ever emitting a partial marker to either
//! channel, no matter how the stream is chunked.

use quill_core::ReasoningTagConfig;

/// A classified run of text produced by [`TagSplitter::push`] or
/// [`TagSplitter::finish`]. Marker text itself is never emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitEvent {
    Content(String),
    Reasoning(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Start of the response: we do not yet know whether it opens with a
    /// start marker, opens mid-reasoning (end marker first), or uses no
    /// markers at all.
    Detecting,
    Content,
    Reasoning,
}

pub struct TagSplitter {
    state: State,
    buf: String,
    start_markers: Vec<String>,
    end_markers: Vec<String>,
    detection_threshold: usize,
    guard: usize,
    /// Set once detection gives up: the rest of the session is plain
    /// content and markers are no longer searched for.
    markerless: bool,
}

impl TagSplitter {
    pub fn new(cfg: &ReasoningTagConfig) -> Self {
        Self {
            state: State::Detecting,
            buf: String::new(),
            start_markers: cfg.start_markers.clone(),
            end_markers: cfg.end_markers.clone(),
            detection_threshold: cfg.detection_threshold,
            guard: cfg.effective_guard(),
            markerless: false,
        }
    }

    /// Feed the next chunk of streamed content. Returns zero or more
    /// classified runs; text near a possible marker stays buffered until a
    /// later chunk or [`TagSplitter::finish`] resolves it.
    pub fn push(&mut self, text: &str) -> Vec<SplitEvent> {
        let mut out = Vec::new();
        if text.is_empty() {
            return out;
        }
        if self.markerless {
            out.push(SplitEvent::Content(text.to_owned()));
            return out;
        }
        self.buf.push_str(text);
        self.drain(&mut out, false);
        out
    }

    /// End of stream: classify whatever is still buffered. In the detecting
    /// state this re-runs marker detection over the full remainder, so short
    /// responses whose markers never crossed the emission guard still split
    /// correctly.
    pub fn finish(&mut self) -> Vec<SplitEvent> {
        let mut out = Vec::new();
        self.drain(&mut out, true);
        out
    }

    fn drain(&mut self, out: &mut Vec<SplitEvent>, at_end: bool) {
        loop {
            match self.state {
                State::Detecting => {
                    let start = find_marker(&self.buf, &self.start_markers);
                    let end = find_marker(&self.buf, &self.end_markers);
                    match pick_earliest(start, end) {
                        Some(Found::Start(pos, len)) => {
                            self.emit_range(out, pos, len, SplitEvent::Content);
                            self.state = State::Reasoning;
                        }
                        Some(Found::End(pos, len)) => {
                            // Implicit reasoning: everything before the end
                            // marker was chain-of-thought.
                            self.emit_range(out, pos, len, SplitEvent::Reasoning);
                            self.state = State::Content;
                        }
                        None => {
                            if at_end {
                                self.flush_all(out, SplitEvent::Content);
                                self.state = State::Content;
                                return;
                            }
                            if self.buf.chars().count() > self.detection_threshold {
                                // This response evidently does not use
                                // markers; stop looking for them.
                                self.markerless = true;
                                self.state = State::Content;
                                self.flush_all(out, SplitEvent::Content);
                            }
                            return;
                        }
                    }
                }
                State::Content => {
                    if self.markerless {
                        self.flush_all(out, SplitEvent::Content);
                        return;
                    }
                    match find_marker(&self.buf, &self.start_markers) {
                        Some((pos, len)) => {
                            self.emit_range(out, pos, len, SplitEvent::Content);
                            self.state = State::Reasoning;
                        }
                        None => {
                            self.flush_guarded(out, at_end, SplitEvent::Content);
                            return;
                        }
                    }
                }
                State::Reasoning => match find_marker(&self.buf, &self.end_markers) {
                    Some((pos, len)) => {
                        self.emit_range(out, pos, len, SplitEvent::Reasoning);
                        self.state = State::Content;
                    }
                    None => {
                        self.flush_guarded(out, at_end, SplitEvent::Reasoning);
                        return;
                    }
                },
            }
        }
    }

    /// Emit `buf[..pos]` as `kind` and discard the marker at `pos..pos+len`.
    fn emit_range(
        &mut self,
        out: &mut Vec<SplitEvent>,
        pos: usize,
        len: usize,
        kind: fn(String) -> SplitEvent,
    ) {
        if pos > 0 {
            out.push(kind(self.buf[..pos].to_owned()));
        }
        self.buf.drain(..pos + len);
    }

    fn flush_all(&mut self, out: &mut Vec<SplitEvent>, kind: fn(String) -> SplitEvent) {
        if !self.buf.is_empty() {
            out.push(kind(std::mem::take(&mut self.buf)));
        }
    }

    /// Emit buffered text except for a short tail that could still be the
    /// beginning of a marker split across chunks. At end-of-stream no marker
    /// can arrive anymore, so the tail is emitted too.
    fn flush_guarded(
        &mut self,
        out: &mut Vec<SplitEvent>,
        at_end: bool,
        kind: fn(String) -> SplitEvent,
    ) {
        if at_end {
            self.flush_all(out, kind);
            return;
        }
        let total = self.buf.chars().count();
        if total <= self.guard {
            return;
        }
        let cut = self
            .buf
            .char_indices()
            .nth(total - self.guard)
            .map(|(i, _)| i)
            .unwrap_or(0);
        if cut == 0 {
            return;
        }
        let emitted = self.buf[..cut].to_owned();
        self.buf.drain(..cut);
        out.push(kind(emitted));
    }
}

enum Found {
    /// (byte offset, marker byte length)
    Start(usize, usize),
    End(usize, usize),
}

fn pick_earliest(start: Option<(usize, usize)>, end: Option<(usize, usize)>) -> Option<Found> {
    match (start, end) {
        (Some((sp, sl)), Some((ep, el))) => {
            if sp <= ep {
                Some(Found::Start(sp, sl))
            } else {
                Some(Found::End(ep, el))
            }
        }
        (Some((sp, sl)), None) => Some(Found::Start(sp, sl)),
        (None, Some((ep, el))) => Some(Found::End(ep, el)),
        (None, None) => None,
    }
}

/// Earliest case-insensitive occurrence of any marker. Markers are ASCII, so
/// byte-window comparison is safe and every match lands on a char boundary.
fn find_marker(haystack: &str, markers: &[String]) -> Option<(usize, usize)> {
    let bytes = haystack.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    for marker in markers {
        let m = marker.as_bytes();
        if m.is_empty() || m.len() > bytes.len() {
            continue;
        }
        for pos in 0..=bytes.len() - m.len() {
            if bytes[pos..pos + m.len()].eq_ignore_ascii_case(m) {
                match best {
                    Some((bp, bl)) if bp < pos || (bp == pos && bl >= m.len()) => {}
                    _ => best = Some((pos, m.len())),
                }
                break;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn default_splitter() -> TagSplitter {
        TagSplitter::new(&ReasoningTagConfig::default())
    }

    /// Push `input` in chunks of `chunk_size` chars then finish, returning
    /// the concatenated (content, reasoning) channels.
    fn run_chunked(input: &str, chunk_size: usize) -> (String, String) {
        let mut splitter = default_splitter();
        let mut content = String::new();
        let mut reasoning = String::new();
        let chars: Vec<char> = input.chars().collect();
        for chunk in chars.chunks(chunk_size) {
            let piece: String = chunk.iter().collect();
            for ev in splitter.push(&piece) {
                match ev {
                    SplitEvent::Content(s) => content.push_str(&s),
                    SplitEvent::Reasoning(s) => reasoning.push_str(&s),
                }
            }
        }
        for ev in splitter.finish() {
            match ev {
                SplitEvent::Content(s) => content.push_str(&s),
                SplitEvent::Reasoning(s) => reasoning.push_str(&s),
            }
        }
        (content, reasoning)
    }

    #[test]
    fn splits_explicit_think_block() {
        let (content, reasoning) = run_chunked("Hello <think>plan the answer</think> world", 1000);
        assert_eq!(content, "Hello  world");
        assert_eq!(reasoning, "plan the answer");
    }

    #[test]
    fn marker_split_across_every_chunk_boundary() {
        let input = "pre<think>inner thought</think>post";
        let expected = run_chunked(input, 1000);
        for size in 1..input.len() {
            assert_eq!(run_chunked(input, size), expected, "chunk size {size}");
        }
        assert_eq!(expected.0, "prepost");
        assert_eq!(expected.1, "inner thought");
    }

    #[test]
    fn implicit_reasoning_when_end_marker_comes_first() {
        let (content, reasoning) = run_chunked("I should check the docs.</think>The answer is 42.", 7);
        assert_eq!(reasoning, "I should check the docs.");
        assert_eq!(content, "The answer is 42.");
    }

    #[test]
    fn markerless_long_response_is_all_content() {
        let input = "x".repeat(3500);
        let (content, reasoning) = run_chunked(&input, 100);
        assert_eq!(content, input);
        assert_eq!(reasoning, "");
    }

    #[test]
    fn markerless_commitment_is_permanent() {
        let mut splitter = default_splitter();
        let filler = "y".repeat(3200);
        let mut content = String::new();
        for ev in splitter.push(&filler) {
            match ev {
                SplitEvent::Content(s) => content.push_str(&s),
                SplitEvent::Reasoning(_) => panic!("unexpected reasoning"),
            }
        }
        // Markers after the detection window are treated as literal text.
        for ev in splitter.push("<think>not reasoning</think>") {
            match ev {
                SplitEvent::Content(s) => content.push_str(&s),
                SplitEvent::Reasoning(_) => panic!("unexpected reasoning"),
            }
        }
        for ev in splitter.finish() {
            match ev {
                SplitEvent::Content(s) => content.push_str(&s),
                SplitEvent::Reasoning(_) => panic!("unexpected reasoning"),
            }
        }
        assert_eq!(content, format!("{filler}<think>not reasoning</think>"));
    }

    #[test]
    fn short_response_detects_markers_at_finish() {
        let (content, reasoning) = run_chunked("<think>x</think>ok", 3);
        assert_eq!(reasoning, "x");
        assert_eq!(content, "ok");
    }

    #[test]
    fn short_markerless_response_flushes_as_content() {
        let (content, reasoning) = run_chunked("just a plain reply", 4);
        assert_eq!(content, "just a plain reply");
        assert_eq!(reasoning, "");
    }

    #[test]
    fn markers_are_case_insensitive() {
        let (content, reasoning) = run_chunked("a<THINK>b</Think>c", 2);
        assert_eq!(content, "ac");
        assert_eq!(reasoning, "b");
    }

    #[test]
    fn thinking_variant_is_recognized() {
        let (content, reasoning) = run_chunked("<thinking>deep</thinking>surface", 5);
        assert_eq!(reasoning, "deep");
        assert_eq!(content, "surface");
    }

    #[test]
    fn partial_marker_is_never_emitted_early() {
        let mut splitter = default_splitter();
        let mut events = splitter.push("some long enough prefix text <thi");
        // Nothing emitted may contain the dangling "<thi".
        for ev in &events {
            if let SplitEvent::Content(s) = ev {
                assert!(!s.contains('<'), "partial marker leaked: {s:?}");
            }
        }
        events.extend(splitter.push("nk>secret</think>done"));
        events.extend(splitter.finish());
        let mut content = String::new();
        let mut reasoning = String::new();
        for ev in events {
            match ev {
                SplitEvent::Content(s) => content.push_str(&s),
                SplitEvent::Reasoning(s) => reasoning.push_str(&s),
            }
        }
        assert_eq!(content, "some long enough prefix text done");
        assert_eq!(reasoning, "secret");
    }

    #[test]
    fn alternating_blocks_split_in_order() {
        let input = "a<think>1</think>b<think>2</think>c";
        let (content, reasoning) = run_chunked(input, 3);
        assert_eq!(content, "abc");
        assert_eq!(reasoning, "12");
    }

    #[test]
    fn multibyte_text_survives_guard_boundaries() {
        let input = "héllo wörld <think>日本語の思考</think> déjà vu";
        for size in 1..=8 {
            let (content, reasoning) = run_chunked(input, size);
            assert_eq!(content, "héllo wörld  déjà vu");
            assert_eq!(reasoning, "日本語の思考");
        }
    }

    proptest! {
        /// The split result must not depend on how the stream was chunked.
        #[test]
        fn chunking_is_invariant(chunk_size in 1usize..40) {
            let input = "intro text <think>first thought</think> middle \
                         <thinking>second thought</thinking> outro";
            let (content, reasoning) = run_chunked(input, chunk_size);
            prop_assert_eq!(content, "intro text  middle  outro");
            prop_assert_eq!(reasoning, "first thoughtsecond thought");
        }
    }
}
