//! Directory-backed event log.
//!
//! # Layout
//!
//! ```text
//! <root>/<run_id>/
//!   events.jsonl                  one EventV1 per line, append-only
//!   snapshots/<index:020>.json    SnapshotV1 taken after event <index>
//! ```
//!
//! Every append is fsynced before returning. Snapshots are written to a
//! temporary file and renamed into place.
//!
//! # Fail-closed reading
//!
//! - A line that does not parse → error (including a torn final line)
//! - An event whose index or run id does not match its position → error
//! - A snapshot whose file name disagrees with its `event_index` → error

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::backend::{check_next, BackendError, EventBackend, EventHead};
use super::snapshot::SnapshotV1;
use crate::event::EventV1;
use crate::schema::RunId;

const EVENTS_FILENAME: &str = "events.jsonl";
const SNAPSHOT_DIRNAME: &str = "snapshots";

#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BackendError + '_ {
    move |source| BackendError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl FileBackend {
    /// Backend rooted at `root`. The directory is created on first append.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `run_id`'s log.
    ///
    /// # Errors
    ///
    /// [`BackendError::InvalidRunId`] if the id is not a plain file name.
    pub fn run_dir(&self, run_id: &RunId) -> Result<PathBuf, BackendError> {
        let id = run_id.as_str();
        let usable = !id.is_empty()
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if usable {
            Ok(self.root.join(id))
        } else {
            Err(BackendError::InvalidRunId {
                run_id: run_id.clone(),
            })
        }
    }

    fn events_path(&self, run_id: &RunId) -> Result<PathBuf, BackendError> {
        Ok(self.run_dir(run_id)?.join(EVENTS_FILENAME))
    }

    fn snapshot_dir(&self, run_id: &RunId) -> Result<PathBuf, BackendError> {
        Ok(self.run_dir(run_id)?.join(SNAPSHOT_DIRNAME))
    }

    fn load(&self, run_id: &RunId) -> Result<Vec<EventV1>, BackendError> {
        let path = self.events_path(run_id)?;
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&path)(e)),
        };
        let mut events = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(io_err(&path))?;
            let location = format!("{}:{}", path.display(), lineno + 1);
            let event: EventV1 =
                serde_json::from_str(&line).map_err(|e| BackendError::Corrupt {
                    location: location.clone(),
                    detail: e.to_string(),
                })?;
            if event.index != events.len() as u64 || &event.run_id != run_id {
                return Err(BackendError::Corrupt {
                    location,
                    detail: format!(
                        "event {} of run {} out of place",
                        event.index, event.run_id
                    ),
                });
            }
            events.push(event);
        }
        Ok(events)
    }
}

impl EventBackend for FileBackend {
    fn append(&mut self, event: &EventV1) -> Result<(), BackendError> {
        let dir = self.run_dir(&event.run_id)?;
        let head = self.head(&event.run_id)?;
        check_next(&event.run_id, head.as_ref(), event)?;

        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let path = dir.join(EVENTS_FILENAME);
        let mut line = serde_json::to_string(event).map_err(|e| BackendError::Corrupt {
            location: path.display().to_string(),
            detail: e.to_string(),
        })?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        file.write_all(line.as_bytes()).map_err(io_err(&path))?;
        file.sync_all().map_err(io_err(&path))?;
        Ok(())
    }

    fn read_from(&self, run_id: &RunId, from: u64) -> Result<Vec<EventV1>, BackendError> {
        let start = usize::try_from(from).unwrap_or(usize::MAX);
        Ok(self.load(run_id)?.into_iter().skip(start).collect())
    }

    fn head(&self, run_id: &RunId) -> Result<Option<EventHead>, BackendError> {
        Ok(self.load(run_id)?.last().map(EventHead::of))
    }

    fn put_snapshot(&mut self, snapshot: &SnapshotV1) -> Result<(), BackendError> {
        let head = self.head(&snapshot.run_id)?;
        if head.is_none_or(|h| snapshot.event_index > h.index) {
            return Err(BackendError::SnapshotAhead {
                run_id: snapshot.run_id.clone(),
                index: snapshot.event_index,
            });
        }
        let dir = self.snapshot_dir(&snapshot.run_id)?;
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let path = dir.join(format!("{:020}.json", snapshot.event_index));
        let tmp = dir.join(format!("{:020}.json.tmp", snapshot.event_index));
        let bytes = serde_json::to_vec(snapshot).map_err(|e| BackendError::Corrupt {
            location: path.display().to_string(),
            detail: e.to_string(),
        })?;
        {
            let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
            file.write_all(&bytes).map_err(io_err(&tmp))?;
            file.sync_all().map_err(io_err(&tmp))?;
        }
        fs::rename(&tmp, &path).map_err(io_err(&path))?;
        Ok(())
    }

    fn latest_snapshot(&self, run_id: &RunId) -> Result<Option<SnapshotV1>, BackendError> {
        let dir = self.snapshot_dir(run_id)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&dir)(e)),
        };
        let mut latest: Option<(u64, PathBuf)> = None;
        for entry in entries {
            let path = entry.map_err(io_err(&dir))?.path();
            let Some(index) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            if latest.as_ref().is_none_or(|(best, _)| index > *best) {
                latest = Some((index, path));
            }
        }
        let Some((index, path)) = latest else {
            return Ok(None);
        };
        let bytes = fs::read(&path).map_err(io_err(&path))?;
        let snapshot: SnapshotV1 =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::Corrupt {
                location: path.display().to_string(),
                detail: e.to_string(),
            })?;
        if snapshot.event_index != index || &snapshot.run_id != run_id {
            return Err(BackendError::Corrupt {
                location: path.display().to_string(),
                detail: format!(
                    "file names event {index}, snapshot is of event {} in run {}",
                    snapshot.event_index, snapshot.run_id
                ),
            });
        }
        Ok(Some(snapshot))
    }
}
