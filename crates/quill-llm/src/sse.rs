//! Minimal Server-Sent Events reader for streaming completion bodies.
//!
//! Reads complete lines from the underlying byte stream, so multi-byte
//! UTF-8 characters split across network reads are never decoded partially.
//! Only the fields the chat backends use are handled: `data:` payloads
//! (multi-line data joined with newlines), an optional `event:` name, and
//! `:` comment lines used as keep-alives.

use std::io::{self, BufRead, BufReader, Read};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

pub struct SseFrameReader<R: Read> {
    reader: BufReader<R>,
    /// Partial line carried across calls. A timed-out read may have
    /// appended bytes here before erroring; they are kept so the caller
    /// can retry `next_event` without losing data.
    line: Vec<u8>,
    event: Option<String>,
    data: String,
    eof: bool,
}

impl<R: Read> SseFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: Vec::new(),
            event: None,
            data: String::new(),
            eof: false,
        }
    }

    /// Next dispatched event, or `None` at end of stream. A final event
    /// whose terminating blank line is missing is still flushed.
    ///
    /// Errors leave the reader in a resumable state: calling again
    /// continues from where the failed read stopped.
    pub fn next_event(&mut self) -> io::Result<Option<SseEvent>> {
        loop {
            if self.eof {
                return Ok(None);
            }
            let read = self.reader.read_until(b'\n', &mut self.line)?;
            if read == 0 {
                self.eof = true;
                if !self.line.is_empty() {
                    let line = std::mem::take(&mut self.line);
                    self.consume_line(&line);
                }
                if !self.data.is_empty() || self.event.is_some() {
                    return Ok(Some(self.take_event()));
                }
                return Ok(None);
            }
            if !self.line.ends_with(b"\n") {
                // EOF cut the line short; the next read settles it.
                continue;
            }
            let line = std::mem::take(&mut self.line);
            if self.consume_line(&line) {
                return Ok(Some(self.take_event()));
            }
        }
    }

    /// Apply one line to the pending event; true means a blank line asked
    /// for the event to be dispatched.
    fn consume_line(&mut self, line: &[u8]) -> bool {
        let mut line = line;
        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() {
            return !self.data.is_empty() || self.event.is_some();
        }
        let text = String::from_utf8_lossy(line);
        if let Some(rest) = text.strip_prefix("data:") {
            let payload = rest.strip_prefix(' ').unwrap_or(rest);
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(payload);
        } else if let Some(rest) = text.strip_prefix("event:") {
            self.event = Some(rest.trim().to_owned());
        }
        // Comment lines (":keep-alive") and unknown fields are ignored.
        false
    }

    fn take_event(&mut self) -> SseEvent {
        SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields the input in fixed-size byte slices, regardless of UTF-8
    /// boundaries, to mimic arbitrary network framing.
    struct Dribble {
        bytes: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Dribble {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            let end = (self.pos + self.step).min(self.bytes.len());
            let n = (end - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn collect(input: &str, step: usize) -> Vec<SseEvent> {
        let mut reader = SseFrameReader::new(Dribble {
            bytes: input.as_bytes().to_vec(),
            pos: 0,
            step,
        });
        let mut events = Vec::new();
        while let Ok(Some(ev)) = reader.next_event() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn parses_simple_data_frames() {
        let events = collect("data: one\n\ndata: two\n\n", 1024);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn data_without_space_after_colon() {
        let events = collect("data:[DONE]\n\n", 1024);
        assert_eq!(events[0].data, "[DONE]");
    }

    #[test]
    fn multi_line_data_joined_with_newline() {
        let events = collect("data: first\ndata: second\n\n", 1024);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "first\nsecond");
    }

    #[test]
    fn event_name_is_captured_and_reset() {
        let events = collect("event: delta\ndata: x\n\ndata: y\n\n", 1024);
        assert_eq!(events[0].event.as_deref(), Some("delta"));
        assert_eq!(events[1].event, None);
    }

    #[test]
    fn crlf_line_endings_are_handled() {
        let events = collect("data: hello\r\n\r\ndata: bye\r\n\r\n", 1024);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[1].data, "bye");
    }

    #[test]
    fn comment_lines_are_skipped() {
        let events = collect(": keep-alive\n\ndata: real\n\n", 1024);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn trailing_event_without_blank_line_is_flushed() {
        let events = collect("data: last", 1024);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "last");
    }

    /// Scripted reader: each call yields the next chunk or error.
    struct Stutter {
        steps: std::collections::VecDeque<io::Result<Vec<u8>>>,
    }

    impl Read for Stutter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(err)) => Err(err),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn resumes_after_a_timed_out_read_without_losing_bytes() {
        let steps = std::collections::VecDeque::from([
            Ok(b"data: he".to_vec()),
            Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
            Ok(b"llo\n\n".to_vec()),
        ]);
        let mut reader = SseFrameReader::new(Stutter { steps });

        let err = reader.next_event().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        // Retrying continues mid-line; the bytes read before the error are
        // not dropped.
        let event = reader.next_event().unwrap().unwrap();
        assert_eq!(event.data, "hello");
        assert!(reader.next_event().unwrap().is_none());
    }

    #[test]
    fn multibyte_chars_survive_arbitrary_read_boundaries() {
        let input = "data: héllo 日本語 wörld\n\ndata: déjà\n\n";
        for step in 1..=7 {
            let events = collect(input, step);
            assert_eq!(events.len(), 2, "step {step}");
            assert_eq!(events[0].data, "héllo 日本語 wörld");
            assert_eq!(events[1].data, "déjà");
        }
    }
}
