//! Minimal SSE plumbing shared by the streaming backends.

/// Parse a single SSE line: `event: <type>` or `data: <payload>`.
pub(crate) fn parse_sse_line(line: &str) -> Option<SseLine> {
    if let Some(event) = line.strip_prefix("event: ") {
        Some(SseLine::Event(event.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseLine::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub(crate) enum SseLine {
    Event(String),
    Data(String),
}

/// Splits a byte stream into complete lines, keeping the trailing partial
/// line buffered across chunks.
#[derive(Default)]
pub(crate) struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=newline).collect();
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_reassembled_across_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push("data: par").is_empty());
        let lines = buffer.push("tial\ndata: next\nrest");
        assert_eq!(lines, vec!["data: partial", "data: next"]);
        assert_eq!(buffer.push("\n"), vec!["rest"]);
    }

    #[test]
    fn sse_lines_parse_into_event_and_data() {
        match parse_sse_line("event: message_start") {
            Some(SseLine::Event(e)) => assert_eq!(e, "message_start"),
            other => panic!("unexpected: {other:?}"),
        }
        match parse_sse_line("data: {\"x\":1}") {
            Some(SseLine::Data(d)) => assert_eq!(d, "{\"x\":1}"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parse_sse_line(": keepalive").is_none());
    }
}
