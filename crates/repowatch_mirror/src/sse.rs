//! Incremental decoder for `text/event-stream` bodies.
//!
//! Chunks may split lines and frames anywhere; the decoder buffers partial
//! lines and emits a frame at each blank line. A line or frame larger than
//! the decoder's limit is dropped whole.

use tracing::warn;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name, `message` when the frame had no `event:` field.
    pub event: String,
    /// Value of the frame's `id:` field.
    pub id: Option<String>,
    /// Data lines joined with `\n`.
    pub data: String,
}

const DEFAULT_EVENT: &str = "message";

/// Default limit for one line and for one frame's data, in bytes.
const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Stateful SSE parser.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: String,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
    data_len: usize,
    last_event_id: Option<String>,
    retry: Option<u64>,
    max_line_len: usize,
    // Skipping the rest of an oversized line.
    discarding: bool,
    // Ignoring fields until the current frame ends.
    dropped: bool,
}

impl SseDecoder {
    /// Creates an empty decoder with the default size limit.
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            event: None,
            id: None,
            data: Vec::new(),
            data_len: 0,
            last_event_id: None,
            retry: None,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            discarding: false,
            dropped: false,
        }
    }

    /// Sets the size limit for a single line and for a frame's data.
    pub fn with_max_line_len(mut self, max: usize) -> Self {
        self.max_line_len = max;
        self
    }

    /// Feeds a chunk and returns every frame it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=end).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            if line.len() > self.max_line_len {
                self.drop_frame(line.len());
                continue;
            }
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        if self.buffer.len() > self.max_line_len {
            // No newline yet; keep nothing of the partial line.
            let len = self.buffer.len();
            self.buffer.clear();
            if !self.discarding {
                self.drop_frame(len);
                self.discarding = true;
            }
        }
        frames
    }

    /// Returns the most recent `id:` seen on the stream.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Returns the reconnect delay the server asked for, in millis.
    pub fn retry(&self) -> Option<u64> {
        self.retry
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') || self.dropped {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_len += value.len() + 1;
                if self.data_len > self.max_line_len {
                    self.drop_frame(self.data_len);
                } else {
                    self.data.push(value.to_string());
                }
            }
            "id" if !value.contains('\0') => {
                self.id = Some(value.to_string());
                self.last_event_id = Some(value.to_string());
            }
            "retry" => {
                if let Ok(millis) = value.parse() {
                    self.retry = Some(millis);
                }
            }
            _ => {}
        }
        None
    }

    fn drop_frame(&mut self, len: usize) {
        warn!(len, max = self.max_line_len, "oversized event-stream frame dropped");
        self.event = None;
        self.id = None;
        self.data.clear();
        self.data_len = 0;
        self.dropped = true;
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        self.data_len = 0;
        self.dropped = false;
        if self.data.is_empty() {
            return None;
        }

        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            id,
            data,
        })
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed("event: state_change\nid: 4\ndata: {\"a\":1}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "state_change".into(),
                id: Some("4".into()),
                data: "{\"a\":1}".into(),
            }]
        );
        assert_eq!(decoder.last_event_id(), Some("4"));
    }

    #[test]
    fn split_across_chunks_with_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed("event:state_ch").is_empty());
        assert!(decoder.feed("ange\r\nda").is_empty());
        assert!(decoder.feed("ta:x\r").is_empty());
        let frames = decoder.feed("\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "state_change");
        assert_eq!(frames[0].data, "x");
        assert_eq!(frames[0].id, None);
    }

    #[test]
    fn comments_and_keep_alives_are_skipped() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(":\n\n: keep-alive\n\n").is_empty());
        let frames = decoder.feed(": hi\ndata: one\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
    }

    #[test]
    fn multi_line_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed("data: first\ndata\ndata: third\n\n");
        assert_eq!(frames[0].data, "first\n\nthird");
    }

    #[test]
    fn event_without_data_is_dropped() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed("event: state_change\nid: 9\n\n").is_empty());
        // The event name does not leak into the next frame.
        let frames = decoder.feed("data: x\n\n");
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].id, None);
        assert_eq!(decoder.last_event_id(), Some("9"));
    }

    #[test]
    fn retry_field() {
        let mut decoder = SseDecoder::new();
        decoder.feed("retry: 3000\nretry: soon\n\n");
        assert_eq!(decoder.retry(), Some(3000));
    }

    #[test]
    fn several_frames_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed("id:1\ndata:a\n\nid:2\ndata:b\n\n");
        let ids: Vec<_> = frames.iter().map(|f| f.id.as_deref()).collect();
        assert_eq!(ids, vec![Some("1"), Some("2")]);
    }

    #[test]
    fn oversized_line_is_dropped_and_stream_resumes() {
        let mut decoder = SseDecoder::new().with_max_line_len(16);

        assert!(decoder.feed("event: e\ndata: ").is_empty());
        assert!(decoder.feed(&"x".repeat(40)).is_empty());
        assert!(decoder.buffer.is_empty());
        assert!(decoder.feed(&"y".repeat(40)).is_empty());
        // End of the oversized line, then the blank line of its frame.
        assert!(decoder.feed("zz\n\n").is_empty());

        let frames = decoder.feed("data: ok\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "ok");
    }

    #[test]
    fn oversized_frame_data_is_dropped() {
        let mut decoder = SseDecoder::new().with_max_line_len(16);

        let frames = decoder
            .feed("data: 0123456789\ndata: 0123456789\ndata: 1\n\ndata: a\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "a");
    }
}
