//! Server-sent-event framing shared by the SSE and streamable HTTP adapters.
//!
//! Buffers raw bytes across chunk boundaries, splits on blank lines, and
//! folds `event:` / `data:` / `id:` fields into [`SseEvent`]s.

use futures::stream::{Stream, StreamExt};

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the server sent none.
    pub event: String,
    /// Concatenated `data:` lines, joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return every event it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        let text = String::from_utf8_lossy(bytes);
        self.buffer.push_str(&text.replace("\r\n", "\n").replace('\r', "\n"));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            None
        } else {
            parse_block(&rest)
        }
    }
}

/// Parse one blank-line-terminated block. Comment-only blocks yield `None`.
fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();
    let mut id = None;

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            "id" => id = Some(value.to_string()),
            _ => {}
        }
    }

    if data_lines.is_empty() && event.is_none() {
        return None;
    }

    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
        id,
    })
}

/// Drive a byte stream through the decoder, calling `on_event` for each event.
///
/// Returns `Err` with a reason when the stream fails, `Ok` when it ends.
pub async fn pump<S, B, E, F>(stream: S, mut on_event: F) -> Result<(), String>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    F: FnMut(SseEvent) -> bool,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::new();
    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| format!("stream read error: {e}"))?;
        for event in decoder.push(bytes.as_ref()) {
            if !on_event(event) {
                return Ok(());
            }
        }
    }
    if let Some(event) = decoder.finish() {
        on_event(event);
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: endpoint\nda").is_empty());
        let events = decoder.push(b"ta: /messages?sessionId=abc\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?sessionId=abc");
    }

    #[test]
    fn default_event_type_is_message() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"id\":1}\n\n");
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"id\":1}");
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: first\ndata: second\nid: 42\n\n");
        assert_eq!(events[0].data, "first\nsecond");
        assert_eq!(events[0].id.as_deref(), Some("42"));
    }

    #[test]
    fn comments_and_crlf_are_handled() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\r\n\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        let last = decoder.finish().unwrap();
        assert_eq!(last.data, "tail");
        assert!(decoder.finish().is_none());
    }

    #[tokio::test]
    async fn pump_stops_when_callback_declines() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"data: one\n\ndata: two\n\n".to_vec()),
            Ok(b"data: three\n\n".to_vec()),
        ];
        let mut seen = Vec::new();
        pump(futures::stream::iter(chunks), |event| {
            seen.push(event.data);
            seen.len() < 2
        })
        .await
        .unwrap();
        assert_eq!(seen, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn pump_reports_stream_errors() {
        let chunks: Vec<Result<Vec<u8>, String>> =
            vec![Ok(b"data: one\n\n".to_vec()), Err("reset by peer".into())];
        let err = pump(futures::stream::iter(chunks), |_| true).await.unwrap_err();
        assert!(err.contains("reset by peer"));
    }
}
