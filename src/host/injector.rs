//! Command Injector
//!
//! Writes a command script into a process's input, one flushed line at a
//! time, pacing between writes.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::script::CommandScript;

/// Failure writing to the process input
#[derive(Debug, Error)]
#[error("Failed to write command {index} ({command:?}): {source}")]
pub struct WriteError {
    /// Zero-based position of the command in its script
    pub index: usize,
    pub command: String,
    #[source]
    pub source: std::io::Error,
}

/// How to wait between consecutive writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Sleep a fixed interval
    Fixed(Duration),
    /// Wait for the receiver to print its marker again, at most `timeout`
    Ack { timeout: Duration },
}

/// Outcome of injecting a script
#[derive(Debug, Default)]
pub struct InjectionReport {
    /// Commands fully written and flushed
    pub delivered: usize,
    /// The write that stopped injection, if any
    pub error: Option<WriteError>,
}

impl InjectionReport {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Writes command scripts into a process's input stream
#[derive(Debug, Clone)]
pub struct CommandInjector {
    pacing: Pacing,
    acks: Option<watch::Receiver<u64>>,
    /// Lines delivered across every script this injector has written
    delivered: usize,
    /// Marker count taken just before the previous write, if there was one
    last_seen: Option<u64>,
}

impl CommandInjector {
    pub fn new(pacing: Pacing) -> Self {
        Self {
            pacing,
            acks: None,
            delivered: 0,
            last_seen: None,
        }
    }

    /// Marker hit counter used by `Pacing::Ack`
    pub fn with_acks(mut self, acks: watch::Receiver<u64>) -> Self {
        self.acks = Some(acks);
        self
    }

    /// Write every command in order.
    ///
    /// Stops at the first failed write; commands already delivered stay
    /// delivered. Pacing also applies before the first command when this
    /// injector has written before.
    pub async fn inject<W>(&mut self, writer: &mut W, script: &CommandScript) -> InjectionReport
    where
        W: AsyncWrite + Unpin,
    {
        let mut report = InjectionReport::default();

        for (index, command) in script.iter().enumerate() {
            if let Err(source) = self.send(writer, command).await {
                let err = WriteError {
                    index,
                    command: command.to_string(),
                    source,
                };
                error!("{}; skipping {} remaining command(s)", err, script.len() - index - 1);
                report.error = Some(err);
                break;
            }
            debug!(index, command, "Command sent");
            report.delivered += 1;
            self.delivered += 1;
        }

        report
    }

    /// Write a single line, paced after whatever this injector wrote last.
    /// Not counted in `delivered`.
    pub async fn send<W>(&mut self, writer: &mut W, line: &str) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(seen) = self.last_seen.take() {
            self.pace(seen).await;
        }

        let seen = self.ack_count();
        send_line(writer, line).await?;
        self.last_seen = Some(seen);
        Ok(())
    }

    /// Total lines delivered so far, including scripts cut short
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    fn ack_count(&self) -> u64 {
        self.acks.as_ref().map(|rx| *rx.borrow()).unwrap_or(0)
    }

    /// Wait before the next write. `seen` is the marker count taken just
    /// before the previous write.
    async fn pace(&mut self, seen: u64) {
        match self.pacing {
            Pacing::Fixed(interval) => tokio::time::sleep(interval).await,
            Pacing::Ack { timeout } => {
                let delivered = self.delivered;
                let Some(acks) = self.acks.as_mut() else {
                    return;
                };
                let acked = tokio::time::timeout(timeout, acks.wait_for(|&n| n > seen)).await;
                if acked.is_err() {
                    warn!(delivered, "No acknowledgement within {:?}, continuing", timeout);
                }
            }
        }
    }
}

/// Write one line and flush it immediately
pub async fn send_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    writer.write_all(buf.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio_test::io::Builder;

    fn script(commands: &[&str]) -> CommandScript {
        CommandScript::new(commands.iter().copied()).unwrap()
    }

    #[tokio::test]
    async fn test_writes_commands_in_order() {
        let mut writer = Builder::new()
            .write(b"create table t (id int);\n")
            .write(b"insert into t values (1);\n")
            .build();

        let mut injector = CommandInjector::new(Pacing::Fixed(Duration::ZERO));
        let report = injector
            .inject(
                &mut writer,
                &script(&["create table t (id int);", "insert into t values (1);"]),
            )
            .await;

        assert_eq!(report.delivered, 2);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_write_failure_abandons_remaining_commands() {
        let mut writer = Builder::new()
            .write(b"c1\n")
            .write(b"c2\n")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
            .build();

        let mut injector = CommandInjector::new(Pacing::Fixed(Duration::ZERO));
        let report = injector
            .inject(&mut writer, &script(&["c1", "c2", "c3", "c4", "c5"]))
            .await;

        assert_eq!(report.delivered, 2);
        assert_eq!(injector.delivered(), 2);
        let err = report.error.unwrap();
        assert_eq!(err.index, 2);
        assert_eq!(err.command, "c3");
        assert_eq!(err.source.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_empty_script_writes_nothing() {
        let mut writer: Vec<u8> = Vec::new();
        let mut injector = CommandInjector::new(Pacing::Fixed(Duration::from_millis(100)));
        let report = injector.inject(&mut writer, &CommandScript::parse("")).await;

        assert_eq!(report.delivered, 0);
        assert!(writer.is_empty());
    }

    #[tokio::test]
    async fn test_send_line_terminates_with_newline() {
        let mut writer: Vec<u8> = Vec::new();
        send_line(&mut writer, "exit").await.unwrap();
        assert_eq!(writer, b"exit\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_pacing_sleeps_between_writes_only() {
        let mut writer: Vec<u8> = Vec::new();
        let mut injector = CommandInjector::new(Pacing::Fixed(Duration::from_millis(100)));

        let start = tokio::time::Instant::now();
        injector
            .inject(&mut writer, &script(&["a", "b", "c"]))
            .await;

        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(writer, b"a\nb\nc\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_continues_across_scripts_and_final_line() {
        let mut writer: Vec<u8> = Vec::new();
        let mut injector = CommandInjector::new(Pacing::Fixed(Duration::from_millis(300)));

        let start = tokio::time::Instant::now();
        injector.inject(&mut writer, &script(&["a;", "b;"])).await;
        assert_eq!(start.elapsed(), Duration::from_millis(300));

        injector.inject(&mut writer, &script(&["drop table t;"])).await;
        assert_eq!(start.elapsed(), Duration::from_millis(600));

        injector.send(&mut writer, "exit").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(900));

        assert_eq!(writer, b"a;\nb;\ndrop table t;\nexit\n");
        assert_eq!(injector.delivered(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_line_waits_for_last_acknowledgement() {
        let (acks_tx, acks_rx) = watch::channel(0u64);
        let mut writer: Vec<u8> = Vec::new();
        let mut injector = CommandInjector::new(Pacing::Ack {
            timeout: Duration::from_secs(60),
        })
        .with_acks(acks_rx);

        injector.inject(&mut writer, &script(&["a;"])).await;

        let acker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            acks_tx.send_replace(1);
            acks_tx
        });

        let start = tokio::time::Instant::now();
        injector.send(&mut writer, "exit").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(writer, b"a;\nexit\n");
        drop(acker.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_pacing_waits_for_marker() {
        let (acks_tx, acks_rx) = watch::channel(1u64);
        let (mut writer, mut reader) = tokio::io::duplex(256);

        let acker = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut received = Vec::new();
            let mut buf = [0u8; 64];
            loop {
                let n = reader.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                // Acknowledge each complete line
                let lines = received.iter().filter(|&&b| b == b'\n').count() as u64;
                acks_tx.send_replace(1 + lines);
            }
            received
        });

        let mut injector = CommandInjector::new(Pacing::Ack {
            timeout: Duration::from_secs(60),
        })
        .with_acks(acks_rx);

        let start = tokio::time::Instant::now();
        let report = injector
            .inject(&mut writer, &script(&["a", "b", "c"]))
            .await;
        drop(writer);

        assert_eq!(report.delivered, 3);
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(acker.await.unwrap(), b"a\nb\nc\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_pacing_times_out_and_continues() {
        let (_acks_tx, acks_rx) = watch::channel(0u64);
        let mut writer: Vec<u8> = Vec::new();
        let mut injector = CommandInjector::new(Pacing::Ack {
            timeout: Duration::from_millis(500),
        })
        .with_acks(acks_rx);

        let report = injector.inject(&mut writer, &script(&["a", "b"])).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(writer, b"a\nb\n");
    }
}
