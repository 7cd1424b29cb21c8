//! Incremental Server-Sent Events Decoder
//!
//! A streaming `text/event-stream` decoder consuming raw bytes and
//! emitting complete events. The decoder is an explicit state machine
//! over a byte buffer: it never requires a whole event (or even a whole
//! line) to arrive in one read, which is exactly what network chunking
//! does to SSE frames.
//!
//! Field handling follows the event-stream format: `name:value` lines,
//! one optional leading space stripped from values, events terminated by
//! a blank line, comment lines (leading `:`) and unknown field names
//! ignored, absent `event` defaulting to `"message"`, and multi-line
//! `data` joined with `\n`.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use bytes::BytesMut;

// Layer 3: Internal module imports
// (none)

/// One decoded SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the last `id:` field seen in this event, if any
    pub id: Option<String>,
    /// Event type; `"message"` when the frame carried no `event:` field
    pub event: String,
    /// Concatenated `data:` lines, joined with `\n`
    pub data: String,
}

/// Incremental SSE decoder
///
/// Feed arbitrary byte chunks with [`SseParser::feed`]; complete events
/// are returned as they terminate. Partial lines and partial events stay
/// buffered until later chunks complete them.
///
/// # Examples
///
/// ```rust
/// use tether_mcp::transport::sse::SseParser;
///
/// let mut parser = SseParser::new();
/// // The frame is split mid-line across two reads.
/// let first = parser.feed(b"event: message\nda");
/// assert!(first.is_empty());
/// let second = parser.feed(b"ta: {\"x\":1}\n\n");
/// assert_eq!(second.len(), 1);
/// assert_eq!(second[0].data, "{\"x\":1}");
/// ```
#[derive(Debug, Default)]
pub struct SseParser {
    /// Bytes not yet consumed as complete lines
    buffer: BytesMut,
    /// `data:` lines accumulated for the event in progress
    data_lines: Vec<String>,
    /// `event:` value for the event in progress
    event_type: Option<String>,
    /// `id:` value for the event in progress
    event_id: Option<String>,
}

impl SseParser {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of bytes, returning every event it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(line_end + 1);
            // Drop the trailing \n (and \r for CRLF streams).
            line.truncate(line_end);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }

        events
    }

    /// Process one complete line; returns an event on the blank terminator
    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // Comment line (servers use these as keep-alives).
            return None;
        }

        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            // A line without a colon is a field name with an empty value.
            None => (line, ""),
        };

        match name {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event_type = Some(value.to_string()),
            "id" => self.event_id = Some(value.to_string()),
            // "retry" and anything nonstandard are ignored.
            _ => {}
        }
        None
    }

    /// Terminate the event in progress
    ///
    /// Per the event-stream format an event with an empty data buffer is
    /// discarded rather than dispatched.
    fn dispatch(&mut self) -> Option<SseEvent> {
        let event_type = self.event_type.take();
        let event_id = self.event_id.take();
        if self.data_lines.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data_lines).join("\n");
        Some(SseEvent {
            id: event_id,
            event: event_type.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Render one event in wire format (used by tests and by transports that
/// need to frame events without an HTTP layer in between)
pub fn encode_event(event: &SseEvent) -> String {
    let mut out = String::new();
    out.push_str("event: ");
    out.push_str(&event.event);
    out.push('\n');
    if let Some(id) = &event.id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn feed_all(parser: &mut SseParser, input: &str) -> Vec<SseEvent> {
        parser.feed(input.as_bytes())
    }

    #[test]
    fn parses_a_minimal_event() {
        let mut parser = SseParser::new();
        let events = feed_all(&mut parser, "data: hello\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                id: None,
                event: "message".to_string(),
                data: "hello".to_string(),
            }]
        );
    }

    #[test]
    fn parses_event_with_type_and_id() {
        let mut parser = SseParser::new();
        let events = feed_all(
            &mut parser,
            "event: message\nid: stream1_4\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"x\"}\n\n",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("stream1_4"));
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn joins_multi_line_data_with_newlines() {
        let mut parser = SseParser::new();
        let events = feed_all(&mut parser, "data: line one\ndata: line two\n\n");
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn ignores_comments_and_unknown_fields() {
        let mut parser = SseParser::new();
        let events = feed_all(
            &mut parser,
            ": keep-alive\nretry: 5000\nwhatever: x\ndata: payload\n\n",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "payload");
    }

    #[test]
    fn blank_line_without_data_dispatches_nothing() {
        let mut parser = SseParser::new();
        let events = feed_all(&mut parser, "event: ping\n\n");
        assert!(events.is_empty());
        // State must be reset: the next event does not inherit the type.
        let events = feed_all(&mut parser, "data: x\n\n");
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn handles_crlf_line_endings() {
        let mut parser = SseParser::new();
        let events = feed_all(&mut parser, "event: message\r\ndata: a\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a");
    }

    #[test]
    fn value_keeps_additional_leading_spaces() {
        let mut parser = SseParser::new();
        // Only one leading space is stripped.
        let events = feed_all(&mut parser, "data:  spaced\n\n");
        assert_eq!(events[0].data, " spaced");
    }

    #[test]
    fn split_across_reads_at_every_boundary() {
        let input = "event: message\nid: s_1\ndata: {\"k\":\"v\"}\n\ndata: second\n\n";
        for split in 0..input.len() {
            let mut parser = SseParser::new();
            let mut events = parser.feed(input[..split].as_bytes());
            events.extend(parser.feed(input[split..].as_bytes()));
            assert_eq!(events.len(), 2, "split at byte {split}");
            assert_eq!(events[0].id.as_deref(), Some("s_1"));
            assert_eq!(events[1].data, "second");
        }
    }

    #[test]
    fn encode_event_round_trips_through_the_parser() {
        let event = SseEvent {
            id: Some("abc_7".to_string()),
            event: "message".to_string(),
            data: "{\"a\":1}\n{\"b\":2}".to_string(),
        };
        let mut parser = SseParser::new();
        let events = parser.feed(encode_event(&event).as_bytes());
        assert_eq!(events, vec![event]);
    }

    proptest! {
        /// Chunking must never change what the decoder produces.
        #[test]
        fn arbitrary_chunking_is_equivalent_to_one_read(
            payloads in proptest::collection::vec("[a-zA-Z0-9 {}:,\"]{1,40}", 1..8),
            chunk_sizes in proptest::collection::vec(1usize..16, 1..64),
        ) {
            let mut wire = String::new();
            for (i, payload) in payloads.iter().enumerate() {
                wire.push_str(&format!("id: ev_{i}\ndata: {payload}\n\n"));
            }

            let mut whole = SseParser::new();
            let expected = whole.feed(wire.as_bytes());

            let mut chunked = SseParser::new();
            let mut produced = Vec::new();
            let bytes = wire.as_bytes();
            let mut offset = 0;
            let mut sizes = chunk_sizes.iter().cycle();
            while offset < bytes.len() {
                let size = (*sizes.next().unwrap()).min(bytes.len() - offset);
                produced.extend(chunked.feed(&bytes[offset..offset + size]));
                offset += size;
            }

            prop_assert_eq!(expected, produced);
        }
    }
}
