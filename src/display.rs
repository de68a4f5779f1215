//! Split-screen console display
//!
//! Both drain workers send lines here; a single writer task owns the output
//! and renders each line with one write call, so lines from the two processes
//! never interleave.

use std::io::Write;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use unicode_width::UnicodeWidthStr;

/// Fallback when the terminal width cannot be detected
const DEFAULT_TERMINAL_WIDTH: usize = 80;

/// Which half of the terminal a process renders into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplaySide {
    Left,
    Right,
}

impl DisplaySide {
    /// Human-readable label shown in front of every line
    pub fn label(self) -> &'static str {
        match self {
            DisplaySide::Left => "Server",
            DisplaySide::Right => "Client",
        }
    }
}

impl std::fmt::Display for DisplaySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One line of process output waiting to be rendered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayLine {
    pub side: DisplaySide,
    pub text: String,
}

/// Render a line for its side of the screen.
///
/// Left lines are padded out to `column_width` display columns, right lines
/// are indented by it. Text is never truncated.
pub fn render_line(side: DisplaySide, text: &str, column_width: usize) -> String {
    let tagged = format!("[{}] {}", side.label(), text);
    match side {
        DisplaySide::Left => {
            let pad = column_width.saturating_sub(tagged.width());
            let mut rendered = tagged;
            rendered.push_str(&" ".repeat(pad));
            rendered
        }
        DisplaySide::Right => {
            let mut rendered = " ".repeat(column_width);
            rendered.push_str(&tagged);
            rendered
        }
    }
}

/// Detect the terminal width in columns.
///
/// Checks `COLUMNS` first, then asks the terminal attached to stdout, then
/// falls back to 80.
pub fn terminal_width() -> usize {
    if let Some(cols) = std::env::var("COLUMNS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&c| c > 0)
    {
        return cols;
    }

    query_terminal_columns().unwrap_or(DEFAULT_TERMINAL_WIDTH)
}

#[cfg(unix)]
fn query_terminal_columns() -> Option<usize> {
    let mut size: libc::winsize = unsafe { std::mem::zeroed() };

    // SAFETY: TIOCGWINSZ only writes into the winsize struct we pass
    let result = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut size) };

    if result == -1 || size.ws_col == 0 {
        None
    } else {
        Some(usize::from(size.ws_col))
    }
}

#[cfg(not(unix))]
fn query_terminal_columns() -> Option<usize> {
    None
}

/// Cloneable handle used by drain workers to submit lines
#[derive(Debug, Clone)]
pub struct DisplaySender {
    tx: mpsc::UnboundedSender<DisplayLine>,
}

impl DisplaySender {
    /// Create a sender together with the receiving end of its queue
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DisplayLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a line. Returns false if the display has already shut down.
    pub fn send(&self, side: DisplaySide, text: impl Into<String>) -> bool {
        self.tx
            .send(DisplayLine {
                side,
                text: text.into(),
            })
            .is_ok()
    }
}

/// Single owner of the console output
pub struct Display {
    sender: DisplaySender,
    writer: JoinHandle<std::io::Result<usize>>,
}

impl Display {
    /// Render to stdout using half of the given terminal width per side
    pub fn stdout(terminal_width: usize) -> Self {
        Self::spawn(std::io::stdout(), terminal_width)
    }

    /// Render to an arbitrary writer
    pub fn spawn<W>(mut out: W, terminal_width: usize) -> Self
    where
        W: Write + Send + 'static,
    {
        let (sender, mut rx) = DisplaySender::channel();
        let column_width = terminal_width / 2;

        // Console writes are blocking, keep them off the async workers
        let writer = tokio::task::spawn_blocking(move || {
            let mut rendered_lines = 0;
            while let Some(line) = rx.blocking_recv() {
                let mut rendered = render_line(line.side, &line.text, column_width);
                rendered.push('\n');
                out.write_all(rendered.as_bytes())?;
                out.flush()?;
                rendered_lines += 1;
            }
            Ok(rendered_lines)
        });

        Self { sender, writer }
    }

    pub fn sender(&self) -> DisplaySender {
        self.sender.clone()
    }

    /// Close the queue and wait until every submitted line has been written.
    ///
    /// Lines still held by live senders keep the writer running, so drop
    /// every sender clone before calling this.
    pub async fn finish(self) -> std::io::Result<usize> {
        drop(self.sender);
        self.writer
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Writer that collects everything into a shared buffer
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_labels() {
        assert_eq!(DisplaySide::Left.label(), "Server");
        assert_eq!(DisplaySide::Right.label(), "Client");
        assert_eq!(DisplaySide::Right.to_string(), "Client");
    }

    #[test]
    fn test_left_line_is_padded_to_column() {
        let rendered = render_line(DisplaySide::Left, "ok", 20);
        assert_eq!(rendered, "[Server] ok         ");
        assert_eq!(rendered.width(), 20);
    }

    #[test]
    fn test_right_line_is_indented() {
        let rendered = render_line(DisplaySide::Right, "ok", 10);
        assert_eq!(rendered, "          [Client] ok");
    }

    #[test]
    fn test_long_text_is_not_truncated() {
        let text = "x".repeat(50);
        let rendered = render_line(DisplaySide::Left, &text, 10);
        assert_eq!(rendered, format!("[Server] {}", text));
    }

    #[test]
    fn test_padding_counts_display_columns() {
        // Each CJK character occupies two columns
        let rendered = render_line(DisplaySide::Left, "小红", 20);
        assert_eq!(rendered.width(), 20);
        assert!(rendered.starts_with("[Server] 小红"));
    }

    #[tokio::test]
    async fn test_display_writes_whole_lines() {
        let buffer = SharedBuffer::default();
        let display = Display::spawn(buffer.clone(), 20);

        let sender = display.sender();
        assert!(sender.send(DisplaySide::Left, "hello"));
        assert!(sender.send(DisplaySide::Right, "world"));
        drop(sender);

        let written = display.finish().await.unwrap();
        assert_eq!(written, 2);

        let contents = buffer.contents();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["[Server] hello", "          [Client] world"]);
    }

    #[test]
    fn test_send_without_receiver_is_rejected() {
        let (sender, rx) = DisplaySender::channel();
        drop(rx);
        assert!(!sender.send(DisplaySide::Left, "nobody listening"));
    }
}
