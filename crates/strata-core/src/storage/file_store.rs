//! File backend: one directory per agent
//!
//! ```text
//! <root>/<agent>/
//!   delta_00000000
//!   delta_00000001
//!   sequence.json      {"first":0,"current":2,"committed_at":"..."}
//! ```
//!
//! A delta is written to a uniquely named staging file and renamed into place
//! on commit; `sequence.json` is then replaced the same way. A crash before
//! the second rename leaves an unreferenced delta file, which is overwritten
//! when that number is written again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{PersistenceError, Result, ResultExt};
use crate::storage::DeltaStore;
use crate::types::SequenceNumbers;

const SEQUENCE_FILE: &str = "sequence.json";
const DELTA_PREFIX: &str = "delta_";

/// Commit record stored in `sequence.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SequenceRecord {
    first: u32,
    current: u32,
    committed_at: DateTime<Utc>,
}

/// Deltas of one agent stored as plain files
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

/// Delta being written to its staging file
#[derive(Debug)]
pub struct FileOutput {
    delta: u32,
    staging: PathBuf,
    writer: BufWriter<File>,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl FileStore {
    /// Open (or create) the directory for `agent` under `root`
    pub fn open(root: impl AsRef<Path>, agent: &str) -> Result<Self> {
        let dir = root.as_ref().join(agent);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Creating delta directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn delta_path(&self, delta: u32) -> PathBuf {
        self.dir.join(format!("{}{:08}", DELTA_PREFIX, delta))
    }

    fn write_sequence(&self, sequence: SequenceNumbers) -> Result<()> {
        let record = SequenceRecord {
            first: sequence.first,
            current: sequence.current,
            committed_at: Utc::now(),
        };
        let tmp = self
            .dir
            .join(format!("{}.{}.tmp", SEQUENCE_FILE, Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(&record)?;

        let written = File::create(&tmp)
            .and_then(|mut file| {
                file.write_all(&json)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp, self.dir.join(SEQUENCE_FILE)));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e).context("Replacing sequence record");
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Removing '{}'", path.display())),
    }
}

impl DeltaStore for FileStore {
    type Output = FileOutput;
    type Input = BufReader<File>;

    fn read_sequence_numbers(&self) -> Result<Option<SequenceNumbers>> {
        let bytes = match fs::read(self.dir.join(SEQUENCE_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Reading sequence record"),
        };
        let record: SequenceRecord = serde_json::from_slice(&bytes)?;
        if record.first > record.current {
            return Err(PersistenceError::InvalidConfig(format!(
                "sequence record in '{}' has first {} > current {}",
                self.dir.display(),
                record.first,
                record.current
            )));
        }
        Ok(Some(SequenceNumbers::new(record.first, record.current)))
    }

    fn open_output(&self, delta: u32) -> Result<Self::Output> {
        let staging = self
            .dir
            .join(format!("{}{:08}.{}.staging", DELTA_PREFIX, delta, Uuid::new_v4()));
        let file = File::create(&staging)
            .with_context(|| format!("Creating staging file '{}'", staging.display()))?;
        Ok(FileOutput {
            delta,
            staging,
            writer: BufWriter::new(file),
        })
    }

    fn close_output(&self, retain: SequenceNumbers, output: Self::Output) -> Result<()> {
        let FileOutput {
            delta,
            staging,
            writer,
        } = output;
        let file = match writer.into_inner() {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_file(&staging);
                return Err(e.into_error()).context("Flushing delta");
            }
        };
        if let Err(e) = file.sync_all() {
            let _ = fs::remove_file(&staging);
            return Err(e).context("Syncing delta");
        }
        drop(file);

        let path = self.delta_path(delta);
        if let Err(e) = fs::rename(&staging, &path) {
            let _ = fs::remove_file(&staging);
            return Err(e).with_context(|| format!("Committing delta {}", delta));
        }
        // Not committed until the sequence record names it.
        if let Err(e) = self.write_sequence(retain) {
            if let Err(remove_err) = remove_if_present(&path) {
                tracing::warn!(delta, error = %remove_err, "Failed to remove uncommitted delta");
            }
            return Err(e);
        }
        Ok(())
    }

    fn abort_output(&self, _retain: SequenceNumbers, output: Self::Output) -> Result<()> {
        let FileOutput {
            delta,
            staging,
            writer,
        } = output;
        drop(writer);
        tracing::debug!(delta, staging = %staging.display(), "Removing aborted delta");
        remove_if_present(&staging)
    }

    fn open_input(&self, delta: u32) -> Result<Self::Input> {
        match File::open(self.delta_path(delta)) {
            Ok(file) => Ok(BufReader::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(PersistenceError::DeltaNotFound(delta))
            }
            Err(e) => Err(e).with_context(|| format!("Opening delta {}", delta)),
        }
    }

    fn cleanup_deltas(&self, range: Range<u32>) -> Result<()> {
        for delta in self.list_deltas()? {
            if range.contains(&delta) {
                remove_if_present(&self.delta_path(delta))?;
            }
        }
        Ok(())
    }

    fn delete_all(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Deleting delta directory"),
        }
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn list_deltas(&self) -> Result<Vec<u32>> {
        let mut deltas = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Staging files carry a suffix and do not parse.
            if let Some(delta) = name
                .strip_prefix(DELTA_PREFIX)
                .and_then(|n| n.parse::<u32>().ok())
            {
                deltas.push(delta);
            }
        }
        deltas.sort_unstable();
        Ok(deltas)
    }
}
