//! Output Drainer
//!
//! One worker per process. It reads stdout and stderr line by line, forwards
//! each non-empty line to the display, and only finishes once both streams
//! are exhausted and the process has exited.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::launcher::Liveness;
use crate::display::{DisplaySender, DisplaySide};

/// Counts output lines containing a marker string
pub struct MarkerTap {
    marker: String,
    hits: watch::Sender<u64>,
}

impl MarkerTap {
    /// Create a tap and a receiver that observes its hit count
    pub fn new(marker: impl Into<String>) -> (Self, watch::Receiver<u64>) {
        let (hits, rx) = watch::channel(0);
        (
            Self {
                marker: marker.into(),
                hits,
            },
            rx,
        )
    }

    fn observe(&self, line: &str) {
        if line.contains(&self.marker) {
            self.hits.send_modify(|n| *n += 1);
        }
    }
}

/// What a drain worker saw before finishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainSummary {
    pub side: DisplaySide,
    /// Lines forwarded to the display
    pub lines: usize,
    /// Process state when the worker finished
    pub exit: Liveness,
    /// The worker was stopped by the run deadline
    pub cancelled: bool,
}

/// Reads one process's merged output for as long as it lives
pub struct DrainWorker {
    side: DisplaySide,
    display: DisplaySender,
    liveness: watch::Receiver<Liveness>,
    tap: Option<MarkerTap>,
    cancel: Option<watch::Receiver<bool>>,
}

enum Event {
    Stdout(std::io::Result<Option<Vec<u8>>>),
    Stderr(std::io::Result<Option<Vec<u8>>>),
    Cancelled,
}

impl DrainWorker {
    pub fn new(
        side: DisplaySide,
        display: DisplaySender,
        liveness: watch::Receiver<Liveness>,
    ) -> Self {
        Self {
            side,
            display,
            liveness,
            tap: None,
            cancel: None,
        }
    }

    /// Count lines containing the tap's marker
    pub fn with_marker(mut self, tap: MarkerTap) -> Self {
        self.tap = Some(tap);
        self
    }

    /// Stop early once the flag turns true
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run the worker on its own task
    pub fn spawn<O, E>(self, stdout: O, stderr: E) -> JoinHandle<DrainSummary>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(self.run(stdout, stderr))
    }

    async fn run<O, E>(mut self, stdout: O, stderr: E) -> DrainSummary
    where
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin,
    {
        let mut stdout = BufReader::new(stdout).split(b'\n');
        let mut stderr = BufReader::new(stderr).split(b'\n');
        let (mut stdout_open, mut stderr_open) = (true, true);
        let mut lines = 0;

        while stdout_open || stderr_open {
            let event = tokio::select! {
                segment = stdout.next_segment(), if stdout_open => Event::Stdout(segment),
                segment = stderr.next_segment(), if stderr_open => Event::Stderr(segment),
                _ = cancelled(&mut self.cancel) => Event::Cancelled,
            };

            match event {
                Event::Stdout(segment) => stdout_open = self.consume(segment, "stdout", &mut lines),
                Event::Stderr(segment) => stderr_open = self.consume(segment, "stderr", &mut lines),
                Event::Cancelled => return self.summary(lines, true),
            }
        }

        // Streams are exhausted, but the process may still be shutting down
        let cancelled_early = tokio::select! {
            _ = self.liveness.wait_for(Liveness::is_exited) => false,
            _ = cancelled(&mut self.cancel) => true,
        };
        debug!(side = %self.side, lines, "Drain worker finished");
        self.summary(lines, cancelled_early)
    }

    /// Handle one read result; returns whether the stream is still open
    fn consume(
        &self,
        segment: std::io::Result<Option<Vec<u8>>>,
        stream: &str,
        lines: &mut usize,
    ) -> bool {
        match segment {
            Ok(Some(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                let text = text.trim();
                if text.is_empty() {
                    return true;
                }
                if let Some(tap) = &self.tap {
                    tap.observe(text);
                }
                if !self.display.send(self.side, text) {
                    trace!(side = %self.side, "Display closed, dropping line");
                }
                *lines += 1;
                true
            }
            Ok(None) => {
                trace!(side = %self.side, stream, "End of stream");
                false
            }
            Err(e) => {
                debug!(side = %self.side, stream, "Read failed, treating as end of stream: {}", e);
                false
            }
        }
    }

    fn summary(&self, lines: usize, cancelled: bool) -> DrainSummary {
        DrainSummary {
            side: self.side,
            lines,
            exit: *self.liveness.borrow(),
            cancelled,
        }
    }
}

/// Resolve once the cancel flag is set; never resolves without a flag
async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = cancel {
        if rx.wait_for(|&set| set).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::display::DisplayLine;

    fn collect(rx: &mut UnboundedReceiver<DisplayLine>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line.text);
        }
        out
    }

    #[tokio::test]
    async fn test_forwards_trimmed_non_empty_lines() {
        let (display, mut rx) = DisplaySender::channel();
        let (_liveness_tx, liveness) = watch::channel(Liveness::Exited { code: Some(0) });

        let stdout: &[u8] = b"  hello  \r\n\n   \nworld";
        let stderr: &[u8] = b"";
        let summary = DrainWorker::new(DisplaySide::Left, display, liveness)
            .spawn(stdout, stderr)
            .await
            .unwrap();

        assert_eq!(summary.lines, 2);
        assert!(!summary.cancelled);
        assert_eq!(collect(&mut rx), vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn test_merges_stdout_and_stderr() {
        let (display, mut rx) = DisplaySender::channel();
        let (_liveness_tx, liveness) = watch::channel(Liveness::Exited { code: None });

        let stdout: &[u8] = b"out\n";
        let stderr: &[u8] = b"err\n";
        let summary = DrainWorker::new(DisplaySide::Right, display, liveness)
            .spawn(stdout, stderr)
            .await
            .unwrap();

        assert_eq!(summary.side, DisplaySide::Right);
        let mut lines = collect(&mut rx);
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_the_stream() {
        let (display, mut rx) = DisplaySender::channel();
        let (_liveness_tx, liveness) = watch::channel(Liveness::Exited { code: Some(0) });

        let stdout: &[u8] = b"bad \xff byte\nafter\n";
        let summary = DrainWorker::new(DisplaySide::Left, display, liveness)
            .spawn(stdout, tokio::io::empty())
            .await
            .unwrap();

        assert_eq!(summary.lines, 2);
        assert_eq!(collect(&mut rx)[1], "after");
    }

    #[tokio::test]
    async fn test_waits_for_exit_after_end_of_stream() {
        let (display, _rx) = DisplaySender::channel();
        let (liveness_tx, liveness) = watch::channel(Liveness::Running);

        let mut handle = DrainWorker::new(DisplaySide::Left, display, liveness)
            .spawn(tokio::io::empty(), tokio::io::empty());

        // Output is exhausted but the process is alive
        let early = tokio::time::timeout(Duration::from_millis(50), &mut handle).await;
        assert!(early.is_err());

        liveness_tx.send_replace(Liveness::Exited { code: Some(0) });
        let summary = handle.await.unwrap();
        assert_eq!(summary.exit, Liveness::Exited { code: Some(0) });
    }

    #[tokio::test]
    async fn test_keeps_reading_while_process_is_silent() {
        let (display, mut rx) = DisplaySender::channel();
        let (liveness_tx, liveness) = watch::channel(Liveness::Running);
        let (mut writer, reader) = tokio::io::duplex(64);

        let handle = DrainWorker::new(DisplaySide::Left, display, liveness)
            .spawn(reader, tokio::io::empty());

        writer.write_all(b"first\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.write_all(b"second\n").await.unwrap();
        drop(writer);
        liveness_tx.send_replace(Liveness::Exited { code: Some(0) });

        let summary = handle.await.unwrap();
        assert_eq!(summary.lines, 2);
        assert_eq!(collect(&mut rx), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_marker_tap_counts_matching_lines() {
        let (display, _rx) = DisplaySender::channel();
        let (_liveness_tx, liveness) = watch::channel(Liveness::Exited { code: Some(0) });
        let (tap, hits) = MarkerTap::new("Rucbase>");

        let stdout: &[u8] = b"Rucbase> ready\nother\nRucbase> ok\n";
        DrainWorker::new(DisplaySide::Right, display, liveness)
            .with_marker(tap)
            .spawn(stdout, tokio::io::empty())
            .await
            .unwrap();

        assert_eq!(*hits.borrow(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_a_stuck_worker() {
        let (display, _rx) = DisplaySender::channel();
        let (_liveness_tx, liveness) = watch::channel(Liveness::Running);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (_writer, reader) = tokio::io::duplex(64);

        let handle = DrainWorker::new(DisplaySide::Left, display, liveness)
            .with_cancel(cancel_rx)
            .spawn(reader, tokio::io::empty());

        cancel_tx.send_replace(true);
        let summary = handle.await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.exit, Liveness::Running);
    }
}
