//! Persistent store of test-run traces and results.
//!
//! # Layout
//!
//! ```text
//! <root>/<key>/
//!   events.jsonl        one EventV1 per line
//!   trace_digest.txt    TraceDigest-domain hash of the canonical event list
//!   result.json         the TestResultV1 for this run
//! ```
//!
//! A key is the run id, suffixed `.2`, `.3`, ... when an earlier trace of
//! the same run is already present. Directories are claimed with
//! `create_dir`, so two writers never share one.
//!
//! Loading is fail-closed: a trace whose chain or digest does not verify is
//! an error, never a partial result.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use keel_kernel::event::EventV1;
use keel_kernel::proof::canon::{canonical_bytes, CanonError};
use keel_kernel::proof::hash::{canonical_hash, ContentHash, HashDomain};
use keel_kernel::schema::RunId;
use keel_kernel::store::{self, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::TestResultV1;

const EVENTS_FILENAME: &str = "events.jsonl";
const DIGEST_FILENAME: &str = "trace_digest.txt";
const RESULT_FILENAME: &str = "result.json";
const MAX_CLAIM_ATTEMPTS: u32 = 1_000;

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is missing")]
    Missing { path: String },

    #[error("{path}:{line}: {source}")]
    Parse {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("no free trace directory for run {run_id}")]
    Exhausted { run_id: RunId },

    #[error("key {key:?} is not a trace directory name")]
    InvalidKey { key: String },

    #[error("stored digest {stored} does not match recomputed {recomputed}")]
    DigestMismatch {
        stored: String,
        recomputed: ContentHash,
    },

    #[error(transparent)]
    Canon(#[from] CanonError),

    #[error("trace chain: {0}")]
    Chain(#[from] StoreError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LogStoreError + '_ {
    move |source| LogStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Where a persisted trace lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRef {
    pub key: String,
    pub digest: ContentHash,
    pub events: u64,
}

/// A trace read back and verified.
#[derive(Debug, Clone)]
pub struct StoredTrace {
    pub key: String,
    pub events: Vec<EventV1>,
    pub digest: ContentHash,
}

/// Digest of an event list, independent of how it is laid out on disk.
///
/// # Errors
///
/// Canonicalization errors.
pub fn trace_digest(events: &[EventV1]) -> Result<ContentHash, CanonError> {
    Ok(canonical_hash(HashDomain::TraceDigest, &canonical_bytes(events)?))
}

#[derive(Debug, Clone)]
pub struct TestLogStore {
    root: PathBuf,
}

impl TestLogStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, key: &str) -> Result<PathBuf, LogStoreError> {
        let usable = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if usable {
            Ok(self.root.join(key))
        } else {
            Err(LogStoreError::InvalidKey {
                key: key.to_string(),
            })
        }
    }

    fn claim(&self, run_id: &RunId) -> Result<(String, PathBuf), LogStoreError> {
        fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;
        for n in 1..=MAX_CLAIM_ATTEMPTS {
            let key = if n == 1 {
                run_id.as_str().to_string()
            } else {
                format!("{run_id}.{n}")
            };
            let dir = self.dir(&key)?;
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((key, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_err(&dir)(e)),
            }
        }
        Err(LogStoreError::Exhausted {
            run_id: run_id.clone(),
        })
    }

    /// Write `events` under a fresh key for `run_id`.
    ///
    /// # Errors
    ///
    /// I/O, encoding and canonicalization errors.
    pub fn persist_trace(
        &self,
        run_id: &RunId,
        events: &[EventV1],
    ) -> Result<TraceRef, LogStoreError> {
        let digest = trace_digest(events)?;
        let (key, dir) = self.claim(run_id)?;

        let mut jsonl = String::new();
        for event in events {
            let line = serde_json::to_string(event).map_err(|source| LogStoreError::Encode {
                what: "event",
                source,
            })?;
            jsonl.push_str(&line);
            jsonl.push('\n');
        }
        write_atomic(&dir.join(EVENTS_FILENAME), jsonl.as_bytes())?;
        write_atomic(
            &dir.join(DIGEST_FILENAME),
            format!("{digest}\n").as_bytes(),
        )?;
        tracing::debug!(%key, events = events.len(), %digest, "trace persisted");
        Ok(TraceRef {
            key,
            digest,
            events: events.len() as u64,
        })
    }

    /// Write the result next to its trace.
    ///
    /// # Errors
    ///
    /// I/O and encoding errors.
    pub fn write_result(&self, result: &TestResultV1) -> Result<(), LogStoreError> {
        let dir = self.dir(&result.trace.key)?;
        let mut json =
            serde_json::to_vec_pretty(result).map_err(|source| LogStoreError::Encode {
                what: "result",
                source,
            })?;
        json.push(b'\n');
        write_atomic(&dir.join(RESULT_FILENAME), &json)
    }

    /// Read a trace back, verifying its chain and digest.
    ///
    /// # Errors
    ///
    /// Missing files, unparseable lines, a broken chain or a digest that
    /// does not match.
    pub fn load_trace(&self, key: &str) -> Result<StoredTrace, LogStoreError> {
        let dir = self.dir(key)?;
        let digest_path = dir.join(DIGEST_FILENAME);
        let stored = read_required(&digest_path)?;
        let stored = stored.trim();

        let events_path = dir.join(EVENTS_FILENAME);
        let file = match File::open(&events_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LogStoreError::Missing {
                    path: events_path.display().to_string(),
                })
            }
            Err(e) => return Err(io_err(&events_path)(e)),
        };
        let mut events = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(io_err(&events_path))?;
            let event = serde_json::from_str(&line).map_err(|source| LogStoreError::Parse {
                path: events_path.display().to_string(),
                line: n + 1,
                source,
            })?;
            events.push(event);
        }
        store::verify_chain(&events)?;

        let recomputed = trace_digest(&events)?;
        if recomputed.as_str() != stored {
            return Err(LogStoreError::DigestMismatch {
                stored: stored.to_string(),
                recomputed,
            });
        }
        Ok(StoredTrace {
            key: key.to_string(),
            events,
            digest: recomputed,
        })
    }

    /// Read the result stored under `key`.
    ///
    /// # Errors
    ///
    /// A missing or unparseable `result.json`.
    pub fn load_result(&self, key: &str) -> Result<TestResultV1, LogStoreError> {
        let path = self.dir(key)?.join(RESULT_FILENAME);
        let json = read_required(&path)?;
        serde_json::from_str(&json).map_err(|source| LogStoreError::Parse {
            path: path.display().to_string(),
            line: source.line(),
            source,
        })
    }

    /// Keys present in the store, sorted.
    ///
    /// # Errors
    ///
    /// I/O errors reading the root. A missing root is an empty store.
    pub fn keys(&self) -> Result<Vec<String>, LogStoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.root)(e)),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn read_required(path: &Path) -> Result<String, LogStoreError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(LogStoreError::Missing {
            path: path.display().to_string(),
        }),
        Err(e) => Err(io_err(path)(e)),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), LogStoreError> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
    file.write_all(bytes).map_err(io_err(&tmp))?;
    file.sync_all().map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))
}
