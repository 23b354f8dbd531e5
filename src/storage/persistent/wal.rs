//! Write-ahead log.
//!
//! Every mutation of the entity index or the observation ledger is appended
//! here before it is applied in memory, and replayed on open.
//!
//! # File format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [record 1: codec-framed WalEntry]
//! [record 2: codec-framed WalEntry]
//! ...
//! ```
//!
//! Sequence numbers keep increasing across truncations so that a snapshot
//! segment can state which prefix of the log it already contains.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Claim, Entity, EntityId};
use crate::feature::FeatureSet;
use crate::observation::{Observation, ObservationId};

use super::codec;

/// A single logged mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// The mutation.
    pub kind: WalEntryKind,
}

/// Logged mutation kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// A new observation entered the ledger.
    ObservationAppended(Observation),
    /// The resolved feature set of an observation was stored.
    FeaturesRecorded {
        /// Observation id.
        observation: ObservationId,
        /// Features as resolved.
        features: FeatureSet,
    },
    /// An observation's back-reference was stored.
    ObservationResolved {
        /// Observation id.
        observation: ObservationId,
        /// Entity it resolved to.
        entity: EntityId,
    },
    /// An entity was created, fully formed.
    EntityCreated(Entity),
    /// Claims were attached to an entity.
    ClaimsAttached {
        /// Target entity.
        entity: EntityId,
        /// Claims offered (duplicates are dropped on apply).
        claims: Vec<Claim>,
        /// Mutation time.
        at: DateTime<Utc>,
    },
    /// Entities were merged into the lowest id.
    EntitiesMerged {
        /// Merged ids.
        ids: Vec<EntityId>,
        /// Mutation time.
        at: DateTime<Utc>,
    },
    /// All entries up to this sequence are in a snapshot segment.
    Checkpoint {
        /// Last sequence covered.
        up_to_sequence: u64,
    },
}

struct WalWriter {
    file: BufWriter<File>,
    sequence: u64,
}

/// Append-only log, safe to share between stores.
pub struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WalWriter>,
    sync_on_write: bool,
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal")
}

impl WriteAheadLog {
    /// Opens or creates a log file.
    ///
    /// A corrupted or torn tail is cut off at the last intact record so that
    /// new appends stay readable.
    ///
    /// # Errors
    /// I/O failures, or `InvalidData` if the file is not a KyroLink log.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        let sequence = if len < codec::HEADER_LEN {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
            0
        } else {
            let (last_sequence, valid_len) = Self::scan(path)?;
            if valid_len < len {
                tracing::warn!(
                    path = %path.display(),
                    kept_bytes = valid_len,
                    dropped_bytes = len - valid_len,
                    "truncating corrupted WAL tail"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            last_sequence
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WalWriter {
                file: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalWriter>> {
        self.inner.lock().map_err(|_| poisoned())
    }

    /// Appends an entry and returns its sequence number.
    ///
    /// # Errors
    /// I/O failures. The sequence is not advanced on failure.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut inner = self.lock()?;
        let sequence = inner.sequence + 1;
        let entry = WalEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        };
        let encoded = codec::encode(&entry)?;

        inner.file.write_all(&encoded)?;
        inner.file.flush()?;
        if self.sync_on_write {
            inner.file.get_ref().sync_data()?;
        }
        inner.sequence = sequence;
        Ok(sequence)
    }

    /// Iterates over the logged entries.
    ///
    /// # Errors
    /// I/O failures opening the file.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last appended entry.
    ///
    /// # Errors
    /// `Other` if the writer lock is poisoned.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// Moves the sequence forward so new entries sort after `sequence`.
    ///
    /// # Errors
    /// `Other` if the writer lock is poisoned.
    pub fn advance_to(&self, sequence: u64) -> IoResult<()> {
        let mut inner = self.lock()?;
        inner.sequence = inner.sequence.max(sequence);
        Ok(())
    }

    /// Size of the log file in bytes.
    ///
    /// # Errors
    /// I/O failures reading metadata.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Empties the log, keeping the sequence counter.
    ///
    /// Only call after the entries are safe in a segment.
    ///
    /// # Errors
    /// I/O failures.
    pub fn truncate(&self) -> IoResult<()> {
        let mut inner = self.lock()?;
        inner.file.flush()?;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        codec::write_header(&mut file)?;
        file.sync_all()?;
        drop(file);

        let file = OpenOptions::new().append(true).open(&self.path)?;
        inner.file = BufWriter::new(file);
        Ok(())
    }

    /// Returns the last intact sequence and the byte length covering it.
    fn scan(path: &Path) -> IoResult<(u64, u64)> {
        let mut iter = WalIterator::new(path)?;
        let mut last_sequence = 0;
        let mut valid_len = codec::HEADER_LEN;
        while let Some(entry) = iter.next() {
            match entry {
                Ok(entry) => {
                    last_sequence = entry.sequence;
                    valid_len = iter.position()?;
                }
                Err(e) => {
                    tracing::warn!(
                        after_sequence = last_sequence,
                        error = %e,
                        "WAL corruption detected"
                    );
                    break;
                }
            }
        }
        Ok((last_sequence, valid_len))
    }
}

/// Iterator over the entries of a log file.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
    done: bool,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self {
            reader,
            file_size,
            done: false,
        })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        }
        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
