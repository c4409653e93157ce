// Sans-I/O SSE parser. The carry-over buffer is the only state; feeding
// the same byte stream in any chunking produces the same event sequence.

use serde_json::Value;

/// Incremental parser for a `text/event-stream` byte stream.
///
/// Recognizes `data:` lines, dispatching the `[DONE]` sentinel and JSON
/// payloads separately. Lines may end with `\n`, `\r\n`, a bare `\r`, or
/// end-of-stream; a trailing `\r` straddling a chunk boundary is retained
/// and combined with the next chunk.
#[derive(Debug, Default)]
pub struct SseParser {
    carry: Vec<u8>,
    done: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` sentinel has been seen; further input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one chunk of bytes.
    ///
    /// `on_event` receives each parsed JSON payload, `on_done` fires once on
    /// the `[DONE]` sentinel, and `on_raw_line` sees every non-`data:`,
    /// non-empty line for diagnostics. Malformed JSON payloads are skipped
    /// quietly.
    pub fn push<E, D, R>(&mut self, chunk: &[u8], mut on_event: E, mut on_done: D, mut on_raw_line: R)
    where
        E: FnMut(Value),
        D: FnMut(),
        R: FnMut(&str),
    {
        if self.done {
            return;
        }

        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);

        let mut start = 0;
        let mut i = 0;
        while i < buf.len() {
            match buf[i] {
                b'\n' => {
                    self.dispatch(&buf[start..i], &mut on_event, &mut on_done, &mut on_raw_line);
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    if i + 1 < buf.len() {
                        self.dispatch(&buf[start..i], &mut on_event, &mut on_done, &mut on_raw_line);
                        i += if buf[i + 1] == b'\n' { 2 } else { 1 };
                        start = i;
                    } else {
                        // Trailing CR may be half of a CRLF split across
                        // chunks; keep the whole line in the carry-over.
                        break;
                    }
                }
                _ => i += 1,
            }

            if self.done {
                return;
            }
        }

        self.carry = buf[start..].to_vec();
    }

    /// Flush the carry-over at end-of-stream (the final line may be
    /// unterminated).
    pub fn finish<E, D, R>(&mut self, mut on_event: E, mut on_done: D, mut on_raw_line: R)
    where
        E: FnMut(Value),
        D: FnMut(),
        R: FnMut(&str),
    {
        if self.done {
            return;
        }
        let carry = std::mem::take(&mut self.carry);
        let line = carry.strip_suffix(b"\r").unwrap_or(&carry);
        self.dispatch(line, &mut on_event, &mut on_done, &mut on_raw_line);
    }

    fn dispatch<E, D, R>(&mut self, line: &[u8], on_event: &mut E, on_done: &mut D, on_raw_line: &mut R)
    where
        E: FnMut(Value),
        D: FnMut(),
        R: FnMut(&str),
    {
        if line.is_empty() {
            return;
        }

        let line = String::from_utf8_lossy(line);
        let Some(payload) = line.strip_prefix("data:") else {
            on_raw_line(&line);
            return;
        };

        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        if payload == "[DONE]" {
            self.done = true;
            on_done();
            return;
        }

        if let Ok(value) = serde_json::from_str::<Value>(payload) {
            on_event(value);
        }
    }

    /// Convenience wrapper collecting events; returns `(events, done)`.
    pub fn push_collect(&mut self, chunk: &[u8]) -> (Vec<Value>, bool) {
        let mut events = Vec::new();
        let mut done = false;
        self.push(chunk, |v| events.push(v), || done = true, |_| {});
        (events, done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_all(chunks: &[&[u8]]) -> (Vec<Value>, bool, Vec<String>) {
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        let mut done = false;
        let mut raw = Vec::new();
        for chunk in chunks {
            parser.push(
                chunk,
                |v| events.push(v),
                || done = true,
                |l| raw.push(l.to_string()),
            );
        }
        parser.finish(|v| events.push(v), || done = true, |l| raw.push(l.to_string()));
        (events, done, raw)
    }

    #[test]
    fn test_basic_data_lines() {
        let (events, done, _) =
            parse_all(&[b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\ndata: [DONE]\n\n"]);
        assert_eq!(events, vec![json!({"a":1}), json!({"b":2})]);
        assert!(done);
    }

    #[test]
    fn test_crlf_lines() {
        let (events, done, _) = parse_all(&[b"data: {\"a\":1}\r\n\r\ndata: [DONE]\r\n"]);
        assert_eq!(events, vec![json!({"a":1})]);
        assert!(done);
    }

    #[test]
    fn test_crlf_straddles_chunk_boundary() {
        let (events, done, _) =
            parse_all(&[b"data: {\"a\":1}\r", b"\ndata: {\"b\":2}\r", b"\ndata: [DONE]\n"]);
        assert_eq!(events, vec![json!({"a":1}), json!({"b":2})]);
        assert!(done);
    }

    #[test]
    fn test_bare_cr_terminates_line() {
        let (events, _, _) = parse_all(&[b"data: {\"a\":1}\rdata: {\"b\":2}\n"]);
        assert_eq!(events, vec![json!({"a":1}), json!({"b":2})]);
    }

    #[test]
    fn test_data_split_mid_payload() {
        let (events, _, _) = parse_all(&[b"data: {\"text\":\"he", b"llo\"}\n"]);
        assert_eq!(events, vec![json!({"text":"hello"})]);
    }

    #[test]
    fn test_invalid_json_skipped_quietly() {
        let (events, done, _) = parse_all(&[b"data: {broken\ndata: {\"ok\":true}\n"]);
        assert_eq!(events, vec![json!({"ok":true})]);
        assert!(!done);
    }

    #[test]
    fn test_non_data_lines_reach_raw_hook() {
        let (events, _, raw) = parse_all(&[b"event: ping\n: comment\ndata: {\"a\":1}\n"]);
        assert_eq!(events, vec![json!({"a":1})]);
        assert_eq!(raw, vec!["event: ping", ": comment"]);
    }

    #[test]
    fn test_no_space_after_colon() {
        let (events, _, _) = parse_all(&[b"data:{\"a\":1}\n"]);
        assert_eq!(events, vec![json!({"a":1})]);
    }

    #[test]
    fn test_input_after_done_is_ignored() {
        let mut parser = SseParser::new();
        let (_, done) = parser.push_collect(b"data: [DONE]\n");
        assert!(done);
        let (events, _) = parser.push_collect(b"data: {\"a\":1}\n");
        assert!(events.is_empty());
        assert!(parser.is_done());
    }

    #[test]
    fn test_unterminated_final_line_flushed_on_finish() {
        let (events, _, _) = parse_all(&[b"data: {\"a\":1}"]);
        assert_eq!(events, vec![json!({"a":1})]);
    }

    #[test]
    fn test_every_byte_split_produces_same_events() {
        let stream = b"event: ping\r\ndata: {\"a\":1}\r\ndata: {\"b\":\"x\"}\ndata: [DONE]\r\n";
        let (expected_events, expected_done, expected_raw) = parse_all(&[stream]);

        for split in 0..stream.len() {
            let (events, done, raw) = parse_all(&[&stream[..split], &stream[split..]]);
            assert_eq!(events, expected_events, "split at {}", split);
            assert_eq!(done, expected_done, "split at {}", split);
            assert_eq!(raw, expected_raw, "split at {}", split);
        }
    }
}
