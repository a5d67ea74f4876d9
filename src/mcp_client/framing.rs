//! Line-delimited JSON framing.
//!
//! One JSON object per line. Lines that do not parse as a JSON object are
//! reported to a callback and skipped (servers commonly print log output on
//! stdout), so a bad line never ends the stream. The channel is single-use:
//! once it reports end of stream it keeps doing so.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Callback invoked with `(line, reason)` for every malformed line.
pub type MalformedHandler = Box<dyn FnMut(&str, &str) + Send>;

/// Longest line excerpt included in malformed-line diagnostics.
const EXCERPT_CHARS: usize = 200;

/// Default cap on a single line read from a server.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

// ─── FramedChannel ───────────────────────────────────────────────────────────

/// Turns a byte stream into a sequence of JSON object frames.
pub struct FramedChannel<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    on_malformed: MalformedHandler,
    malformed: Arc<AtomicU64>,
    max_frame_bytes: usize,
    finished: bool,
}

impl<R: AsyncRead + Unpin> FramedChannel<R> {
    /// Wrap `reader`, logging malformed lines under `server`'s name.
    pub fn new(server: &str, reader: R) -> Self {
        let server = server.to_string();
        Self::with_handler(
            reader,
            Box::new(move |line, reason| {
                tracing::debug!(
                    server = %server,
                    line = %excerpt(line),
                    reason,
                    "skipping malformed frame"
                );
            }),
        )
    }

    /// Wrap `reader` with a custom malformed-line callback.
    pub fn with_handler(reader: R, on_malformed: MalformedHandler) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::with_capacity(4096),
            on_malformed,
            malformed: Arc::new(AtomicU64::new(0)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            finished: false,
        }
    }

    /// Shared counter of malformed lines seen so far.
    pub fn malformed_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.malformed)
    }

    /// Whether the stream has ended.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Lines longer than `max` bytes are reported as malformed and skipped.
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` at end of stream, and on every call after that.
    /// An I/O error also ends the stream.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<serde_json::Value>> {
        while !self.finished {
            let oversized = match self.read_line().await {
                Ok(Some(oversized)) => oversized,
                Ok(None) => {
                    self.finished = true;
                    break;
                }
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            };

            let line = trim_ascii(&self.buf);
            if oversized {
                let reason = format!("frame exceeds {} bytes", self.max_frame_bytes);
                Self::report(&self.malformed, &mut self.on_malformed, line, &reason);
                continue;
            }
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<serde_json::Value>(line) {
                Ok(value) if value.is_object() => return Ok(Some(value)),
                Ok(_) => Self::report(
                    &self.malformed,
                    &mut self.on_malformed,
                    line,
                    "frame is not a JSON object",
                ),
                Err(e) => {
                    let reason = e.to_string();
                    Self::report(&self.malformed, &mut self.on_malformed, line, &reason);
                }
            }
        }

        Ok(None)
    }

    /// Fill `buf` with the next line, keeping at most `max_frame_bytes` of
    /// it. `Ok(None)` at end of stream, otherwise whether the line was cut.
    async fn read_line(&mut self) -> std::io::Result<Option<bool>> {
        self.buf.clear();
        let mut seen_any = false;
        let mut oversized = false;

        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(seen_any.then_some(oversized));
            }
            seen_any = true;

            let (chunk, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (&available[..=i], true),
                None => (available, false),
            };
            let used = chunk.len();

            let room = self.max_frame_bytes.saturating_sub(self.buf.len());
            if used > room {
                oversized = true;
            }
            self.buf.extend_from_slice(&chunk[..used.min(room)]);
            self.reader.consume(used);

            if complete {
                return Ok(Some(oversized));
            }
        }
    }

    fn report(counter: &AtomicU64, handler: &mut MalformedHandler, line: &[u8], reason: &str) {
        counter.fetch_add(1, Ordering::Relaxed);
        let text = String::from_utf8_lossy(line);
        (*handler)(&text, reason);
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn excerpt(line: &str) -> String {
    if line.chars().count() <= EXCERPT_CHARS {
        line.to_string()
    } else {
        let mut out: String = line.chars().take(EXCERPT_CHARS).collect();
        out.push_str("...(truncated)");
        out
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn test_reads_frames_until_eof() {
        let input: &[u8] = b"{\"id\":1,\"result\":{}}\n{\"id\":2,\"result\":{}}\n";
        let mut channel = FramedChannel::new("test", input);

        let first = channel.next_frame().await.unwrap().unwrap();
        assert_eq!(first["id"], 1);
        let second = channel.next_frame().await.unwrap().unwrap();
        assert_eq!(second["id"], 2);
        assert!(channel.next_frame().await.unwrap().is_none());
        assert!(channel.is_finished());
        // Not restartable: stays at end of stream
        assert!(channel.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped_and_reported() {
        let input: &[u8] = b"starting server...\n[1, 2]\n\n{\"id\":7,\"result\":null}\n";
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut channel = FramedChannel::with_handler(
            input,
            Box::new(move |line, _reason| sink.lock().unwrap().push(line.to_string())),
        );
        let counter = channel.malformed_counter();

        let frame = channel.next_frame().await.unwrap().unwrap();
        assert_eq!(frame["id"], 7);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["starting server...".to_string(), "[1, 2]".to_string()]
        );
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_last_line_without_newline() {
        let input: &[u8] = b"  {\"id\":3,\"result\":true}  ";
        let mut channel = FramedChannel::new("test", input);
        let frame = channel.next_frame().await.unwrap().unwrap();
        assert_eq!(frame["result"], true);
        assert!(channel.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_malformed_not_fatal() {
        let input: &[u8] = b"\xff\xfe garbage\n{\"id\":1,\"result\":1}\n";
        let mut channel = FramedChannel::new("test", input);
        let counter = channel.malformed_counter();
        let frame = channel.next_frame().await.unwrap().unwrap();
        assert_eq!(frame["id"], 1);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped() {
        let input: &[u8] = b"{\"pad\":\"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\"}\n{\"id\":1}\n";
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        let mut channel = FramedChannel::with_handler(
            input,
            Box::new(move |_line, reason| sink.lock().unwrap().push(reason.to_string())),
        )
        .with_max_frame_bytes(16);
        let counter = channel.malformed_counter();

        let frame = channel.next_frame().await.unwrap().unwrap();
        assert_eq!(frame["id"], 1);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(*reasons.lock().unwrap(), vec!["frame exceeds 16 bytes".to_string()]);
        assert!(channel.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_line_without_newline_at_eof() {
        let input: &[u8] = b"{\"id\":1}\nxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx";
        let mut channel = FramedChannel::new("test", input).with_max_frame_bytes(16);
        let counter = channel.malformed_counter();
        assert_eq!(channel.next_frame().await.unwrap().unwrap()["id"], 1);
        assert!(channel.next_frame().await.unwrap().is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_excerpt_truncates_long_lines() {
        let long = "x".repeat(500);
        let short = excerpt(&long);
        assert!(short.ends_with("...(truncated)"));
        assert_eq!(short.len(), EXCERPT_CHARS + "...(truncated)".len());
    }

    #[test]
    fn test_trim_ascii() {
        assert_eq!(trim_ascii(b"  {}\r\n"), b"{}");
        assert_eq!(trim_ascii(b"   "), b"");
    }
}
