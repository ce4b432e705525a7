//! Subprocess transport speaking newline-delimited JSON over stdio

use crate::messages::TransportEvent;
use crate::{Result, TalkbackError};
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct ProcessTransport {
    binary: String,
    child: Child,
    stdin: ChildStdin,
    /// Until the reader task takes it
    stdout: Option<ChildStdout>,
    reader: Option<JoinHandle<()>>,
    stderr_reader: Option<JoinHandle<()>>,
}

impl ProcessTransport {
    /// Spawn the backend process
    ///
    /// A missing binary or unusable working directory is a `Connection` error.
    pub fn spawn(binary: &str, args: &[String], working_dir: &Path) -> Result<Self> {
        info!(binary, ?args, dir = %working_dir.display(), "starting backend subprocess");

        let mut child = Command::new(binary)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TalkbackError::Connection(format!("failed to start {}: {}", binary, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TalkbackError::Connection("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TalkbackError::Connection("failed to capture stdout".into()))?;

        let stderr_reader = child.stderr.take().map(|stderr| {
            let binary = binary.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(binary = %binary, "stderr: {}", line);
                }
            })
        });

        Ok(Self {
            binary: binary.to_string(),
            child,
            stdin,
            stdout: Some(stdout),
            reader: None,
            stderr_reader,
        })
    }

    /// Forward stdout lines to `tx` from a background task
    pub fn start_reader(&mut self, tx: UnboundedSender<TransportEvent>) -> Result<()> {
        let stdout = self
            .stdout
            .take()
            .ok_or_else(|| TalkbackError::Connection("stdout reader already started".into()))?;
        let binary = self.binary.clone();

        self.reader = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if tx.send(TransportEvent::Message(line.to_string())).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break format!("{} closed stdout", binary),
                    Err(e) => break format!("{} stdout read error: {}", binary, e),
                }
            };
            warn!(%reason, "backend subprocess output ended");
            let _ = tx.send(TransportEvent::Closed(reason));
        }));

        Ok(())
    }

    /// Write one JSON line
    pub async fn send_line<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');

        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TalkbackError::Send(format!("failed to write to stdin: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| TalkbackError::Send(format!("failed to flush stdin: {}", e)))
    }

    /// Health check: the process must still be running
    pub fn probe(&mut self) -> Result<()> {
        match self.child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(TalkbackError::Connection(format!(
                "{} exited with {}",
                self.binary, status
            ))),
            Err(e) => Err(TalkbackError::Connection(format!(
                "failed to poll {}: {}",
                self.binary, e
            ))),
        }
    }

    pub async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(reader) = self.stderr_reader.take() {
            reader.abort();
        }
        if let Err(e) = self.child.kill().await {
            debug!(binary = %self.binary, error = %e, "kill on close");
        }
        info!(binary = %self.binary, "backend subprocess terminated");
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(reader) = self.stderr_reader.take() {
            reader.abort();
        }
    }
}
