//! Incremental Server-Sent Events parser. Chunk-driven: bytes arrive as they're
//! read off the origin socket and a complete event is only produced once a full
//! `\n\n` / `\r\n\r\n` record has been buffered.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub retry: Option<u64>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `chunk` into the parser, returning every event whose terminating
    /// blank line has now been seen.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ParsedSseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some((record, rest_at)) = next_record(&self.buffer) {
            if let Some(event) = parse_record(&record) {
                events.push(event);
            }
            self.buffer.drain(..rest_at);
        }

        events
    }

    /// Emits the final event if the stream ended without a trailing blank
    /// line, discarding whatever's left in the buffer either way.
    pub fn flush(&mut self) -> Option<ParsedSseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let record = std::mem::take(&mut self.buffer);
        parse_record(&record)
    }
}

/// Finds the first blank-line-terminated record in `buf`. Returns the record's
/// bytes (without the trailing blank line) and the offset of what follows it.
fn next_record(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((buf[..i].to_vec(), i + 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((buf[..i].to_vec(), i + 4));
        }
        i += 1;
    }
    None
}

fn parse_record(record: &[u8]) -> Option<ParsedSseEvent> {
    let text = String::from_utf8_lossy(record);
    let mut event = None;
    let mut id = None;
    let mut retry = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.split(['\n']) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };

        match field {
            "event" => event = Some(value.to_string()),
            "id" => id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    retry = Some(ms);
                }
            }
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(ParsedSseEvent {
        event,
        id,
        retry,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_data_line() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn joins_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn ignores_comments_and_emits_event_id_retry() {
        let mut parser = SseParser::new();
        let events = parser.push(b": heartbeat\nevent: ping\nid: 7\nretry: 3000\ndata: ok\n\n");
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.event.as_deref(), Some("ping"));
        assert_eq!(e.id.as_deref(), Some("7"));
        assert_eq!(e.retry, Some(3000));
        assert_eq!(e.data, "ok");
    }

    #[test]
    fn no_event_without_data() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: ping\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn handles_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: par").is_empty());
        let events = parser.push(b"tial\n\n");
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn handles_crlf_terminator() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: hi\r\n\r\n");
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn flush_emits_unterminated_trailing_event() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: first\n\ndata: trailing").is_empty());
        let event = parser.flush().unwrap();
        assert_eq!(event.data, "trailing");
        assert!(parser.flush().is_none());
    }
}
