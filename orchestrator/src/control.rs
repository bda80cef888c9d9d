//! Out-of-band signals to a running kernel: STOP, operator confirmations,
//! and wake-ups for a paused run.
//!
//! The kernel drains its [`ControlSource`] at the start of every step, so a
//! STOP sent at any time takes effect before the next action is authorized.
//! A signal is acknowledged only after the kernel has recorded its effect in
//! the log; until then every poll returns it again.
//!
//! [`FileControlInbox`] lets a separate process (the `keel stop` and
//! `keel confirm` commands) signal a run through its directory:
//!
//! ```text
//! <run_dir>/
//!   control.jsonl   one ControlSignal per line, appended by senders
//!   control.offset  number of lines the run has already consumed
//! ```

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use keel_kernel::schema::TaskId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONTROL_FILENAME: &str = "control.jsonl";
const OFFSET_FILENAME: &str = "control.offset";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ControlSignal {
    Stop {
        note: String,
    },
    Confirm {
        task_id: TaskId,
        approved: bool,
        operator: String,
    },
    /// Re-check a paused run, e.g. after an external dependency finished.
    Wake,
}

/// Where the kernel reads its signals from.
pub trait ControlSource: Send {
    /// Unacknowledged signals, oldest first.
    ///
    /// # Errors
    ///
    /// The source cannot be read.
    fn poll(&mut self) -> Result<Vec<ControlSignal>, ControlError>;

    /// Mark the oldest signal of the last poll as handled.
    ///
    /// # Errors
    ///
    /// The acknowledgement cannot be persisted.
    fn ack(&mut self) -> Result<(), ControlError>;
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("control offset {path} holds {found:?}, not a line count")]
    Offset { path: String, found: String },

    #[error("cannot encode control signal: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A source that never signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoControl;

impl ControlSource for NoControl {
    fn poll(&mut self) -> Result<Vec<ControlSignal>, ControlError> {
        Ok(Vec::new())
    }

    fn ack(&mut self) -> Result<(), ControlError> {
        Ok(())
    }
}

/// In-process inbox. Clones share one queue, so a handle kept by the caller
/// can signal a kernel that owns another.
#[derive(Debug, Clone, Default)]
pub struct ControlInbox {
    queue: Arc<Mutex<VecDeque<ControlSignal>>>,
}

impl ControlInbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, signal: ControlSignal) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(signal);
    }

    pub fn stop(&self, note: impl Into<String>) {
        self.send(ControlSignal::Stop { note: note.into() });
    }
}

impl ControlSource for ControlInbox {
    fn poll(&mut self) -> Result<Vec<ControlSignal>, ControlError> {
        Ok(self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect())
    }

    fn ack(&mut self) -> Result<(), ControlError> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Ok(())
    }
}

/// File-backed inbox in a run directory.
#[derive(Debug, Clone)]
pub struct FileControlInbox {
    dir: PathBuf,
    /// Line count to persist as the offset once each polled signal is acked.
    unacked: VecDeque<usize>,
}

impl FileControlInbox {
    #[must_use]
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: run_dir.into(),
            unacked: VecDeque::new(),
        }
    }

    fn control_path(&self) -> PathBuf {
        self.dir.join(CONTROL_FILENAME)
    }

    fn offset_path(&self) -> PathBuf {
        self.dir.join(OFFSET_FILENAME)
    }

    /// Append `signal` for the run in `run_dir` to pick up.
    ///
    /// # Errors
    ///
    /// I/O or encoding errors.
    pub fn send(run_dir: &Path, signal: &ControlSignal) -> Result<(), ControlError> {
        let path = run_dir.join(CONTROL_FILENAME);
        let io = |source| ControlError::Io {
            path: path.display().to_string(),
            source,
        };
        let mut line = serde_json::to_string(signal)?;
        line.push('\n');
        fs::create_dir_all(run_dir).map_err(io)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io)?;
        file.write_all(line.as_bytes()).map_err(io)?;
        file.sync_all().map_err(io)
    }

    fn consumed(&self) -> Result<usize, ControlError> {
        let path = self.offset_path();
        match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse().map_err(|_| ControlError::Offset {
                path: path.display().to_string(),
                found: text.trim().to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(ControlError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    fn write_offset(&self, lines: usize) -> Result<(), ControlError> {
        let path = self.offset_path();
        let tmp = self.dir.join(format!("{OFFSET_FILENAME}.tmp"));
        let io = |source| ControlError::Io {
            path: path.display().to_string(),
            source,
        };
        fs::write(&tmp, lines.to_string()).map_err(io)?;
        fs::rename(&tmp, &path).map_err(io)
    }
}

impl ControlSource for FileControlInbox {
    fn poll(&mut self) -> Result<Vec<ControlSignal>, ControlError> {
        self.unacked.clear();
        let path = self.control_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ControlError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        // Only complete lines; a sender may be mid-write.
        let complete = content.rfind('\n').map_or("", |end| &content[..end]);
        let lines: Vec<&str> = complete.lines().collect();
        let consumed = self.consumed()?;
        if lines.len() <= consumed {
            return Ok(Vec::new());
        }
        let mut signals = Vec::new();
        for (n, line) in lines.iter().enumerate().skip(consumed) {
            match serde_json::from_str(line) {
                Ok(signal) => {
                    signals.push(signal);
                    self.unacked.push_back(n + 1);
                }
                Err(e) => tracing::warn!(line = n + 1, error = %e, "ignoring malformed control line"),
            }
        }
        // Malformed lines after the last signal can never be handled.
        match self.unacked.back_mut() {
            Some(last) => *last = lines.len(),
            None => self.write_offset(lines.len())?,
        }
        Ok(signals)
    }

    fn ack(&mut self) -> Result<(), ControlError> {
        match self.unacked.pop_front() {
            Some(lines) => self.write_offset(lines),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(source: &mut impl ControlSource) -> Vec<ControlSignal> {
        let signals = source.poll().unwrap();
        for _ in &signals {
            source.ack().unwrap();
        }
        signals
    }

    #[test]
    fn inbox_clones_share_a_queue() {
        let sender = ControlInbox::new();
        let mut receiver = sender.clone();
        sender.stop("operator");
        sender.send(ControlSignal::Wake);
        assert_eq!(
            drain(&mut receiver),
            vec![
                ControlSignal::Stop {
                    note: "operator".into()
                },
                ControlSignal::Wake
            ]
        );
        assert!(receiver.poll().unwrap().is_empty());
    }

    #[test]
    fn unacked_signals_are_polled_again() {
        let sender = ControlInbox::new();
        let mut receiver = sender.clone();
        sender.stop("first");
        sender.send(ControlSignal::Wake);
        assert_eq!(receiver.poll().unwrap().len(), 2);
        receiver.ack().unwrap();
        assert_eq!(receiver.poll().unwrap(), vec![ControlSignal::Wake]);
    }

    #[test]
    fn file_inbox_consumes_each_line_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut inbox = FileControlInbox::new(dir.path());
        assert!(drain(&mut inbox).is_empty());

        FileControlInbox::send(dir.path(), &ControlSignal::Wake).unwrap();
        let confirm = ControlSignal::Confirm {
            task_id: TaskId::from_seq(2),
            approved: true,
            operator: "ops".into(),
        };
        FileControlInbox::send(dir.path(), &confirm).unwrap();
        assert_eq!(drain(&mut inbox), vec![ControlSignal::Wake, confirm]);
        assert!(drain(&mut inbox).is_empty());

        // A fresh reader (a restarted process) resumes after the offset.
        let mut reopened = FileControlInbox::new(dir.path());
        assert!(drain(&mut reopened).is_empty());
        FileControlInbox::send(dir.path(), &ControlSignal::Stop { note: "x".into() }).unwrap();
        assert_eq!(drain(&mut reopened).len(), 1);
    }

    #[test]
    fn file_signal_survives_a_restart_before_ack() {
        let dir = tempfile::tempdir().unwrap();
        let stop = ControlSignal::Stop {
            note: "halt".into(),
        };
        FileControlInbox::send(dir.path(), &ControlSignal::Wake).unwrap();
        FileControlInbox::send(dir.path(), &stop).unwrap();

        let mut inbox = FileControlInbox::new(dir.path());
        assert_eq!(inbox.poll().unwrap().len(), 2);
        inbox.ack().unwrap();
        drop(inbox);

        let mut reopened = FileControlInbox::new(dir.path());
        assert_eq!(reopened.poll().unwrap(), vec![stop]);
    }

    #[test]
    fn malformed_and_torn_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONTROL_FILENAME),
            "not json\n{\"signal\":\"wake\"}\nbroken\n{\"signal\":\"st",
        )
        .unwrap();
        let mut inbox = FileControlInbox::new(dir.path());
        assert_eq!(drain(&mut inbox), vec![ControlSignal::Wake]);
        assert_eq!(
            fs::read_to_string(dir.path().join(OFFSET_FILENAME)).unwrap(),
            "3"
        );
    }

    #[test]
    fn corrupt_offset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        FileControlInbox::send(dir.path(), &ControlSignal::Wake).unwrap();
        fs::write(dir.path().join(OFFSET_FILENAME), "many").unwrap();
        let mut inbox = FileControlInbox::new(dir.path());
        assert!(matches!(inbox.poll(), Err(ControlError::Offset { .. })));
    }

    #[test]
    fn signal_wire_shape() {
        let json = serde_json::to_string(&ControlSignal::Stop { note: "n".into() }).unwrap();
        assert_eq!(json, r#"{"signal":"stop","note":"n"}"#);
    }
}
