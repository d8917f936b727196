use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tether_core::{ChatId, ChatTransport, MessageId, SendOptions, TransportError};

/// Longest single message; longer text is split on line boundaries.
const MAX_MESSAGE_CHARS: usize = 4000;

/// Prints chat messages to a terminal. Each message gets an id (`m1`,
/// `m2`, ...) so tool output can be revealed with `/show`.
pub struct ConsoleTransport {
    out: Mutex<Box<dyn Write + Send>>,
    next_id: AtomicU64,
}

impl ConsoleTransport {
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            next_id: AtomicU64::new(0),
        }
    }

    fn print(&self, line: &str) -> Result<(), TransportError> {
        let mut out = self.out.lock().unwrap();
        writeln!(out, "{line}")
            .and_then(|_| out.flush())
            .map_err(|e| TransportError(e.to_string()))
    }
}

#[async_trait::async_trait]
impl ChatTransport for ConsoleTransport {
    async fn send_message(
        &self,
        _chat_id: &ChatId,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageId, TransportError> {
        let id = MessageId::new(format!("m{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1));
        let prefix = if options.silent {
            format!("[{id}]")
        } else {
            format!("[{id}] ›")
        };
        self.print(&format!("{prefix} {text}"))?;
        Ok(id)
    }

    async fn send_long_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        options: SendOptions,
    ) -> Result<Vec<MessageId>, TransportError> {
        let mut ids = Vec::new();
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            ids.push(self.send_message(chat_id, &chunk, options.clone()).await?);
        }
        Ok(ids)
    }

    async fn set_reaction(
        &self,
        _chat_id: &ChatId,
        message_id: &MessageId,
        reaction: &str,
    ) -> Result<(), TransportError> {
        self.print(&format!("  ↳ {message_id} {reaction}"))
    }
}

/// Split `text` into chunks of at most `max` chars, preferring line breaks.
fn split_message(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > max && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > max {
            // A single overlong line is hard-wrapped.
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
        .into_iter()
        .map(|chunk| chunk.trim_end_matches('\n').to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
        assert_eq!(split_message("", 10), vec![""]);
    }

    #[test]
    fn splits_on_line_boundaries() {
        let chunks = split_message("aaaa\nbbbb\ncccc", 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb", "cccc"]);
    }

    #[test]
    fn hard_wraps_overlong_lines() {
        let chunks = split_message(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[tokio::test]
    async fn messages_get_sequential_ids() {
        let buffer = Buffer::default();
        let console = ConsoleTransport::new(Box::new(buffer.clone()));
        let chat = ChatId::from("console");

        let first = console
            .send_message(&chat, "hi", SendOptions::default())
            .await
            .unwrap();
        let second = console
            .send_message(&chat, "🔧 bash", SendOptions::silent())
            .await
            .unwrap();
        console.set_reaction(&chat, &second, "✅").await.unwrap();

        assert_eq!(first, MessageId::from("m1"));
        assert_eq!(second, MessageId::from("m2"));
        assert_eq!(buffer.text(), "[m1] › hi\n[m2] 🔧 bash\n  ↳ m2 ✅\n");
    }
}
