//! Snapshot segments.
//!
//! A segment is an immutable file holding the full entity index and ledger
//! as of a WAL sequence number. Compaction writes a new segment through a
//! temp file and an atomic rename, then retires the older ones. Opening a
//! database loads the newest segment and replays the WAL entries after it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::index::EntityIndex;
use crate::ledger::LedgerState;

use super::codec;

const SEGMENT_EXT: &str = "seg";
const TEMP_SUFFIX: &str = ".tmp";

/// Segment file header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// Last WAL sequence contained in the snapshot.
    pub sequence_end: u64,
    /// Live entities in the snapshot.
    pub entity_count: u64,
    /// Observations in the snapshot.
    pub observation_count: u64,
    /// When the segment was written.
    pub created_at: DateTime<Utc>,
}

/// Borrowed view written by [`SegmentWriter`].
#[derive(Serialize)]
pub struct SnapshotRef<'a> {
    /// Entity arena.
    pub entities: &'a EntityIndex,
    /// Observation ledger.
    pub ledger: &'a LedgerState,
}

/// Snapshot contents read back from disk, lookups rebuilt.
#[derive(Debug, Default, Deserialize)]
pub struct SegmentData {
    /// Entity arena.
    pub entities: EntityIndex,
    /// Observation ledger.
    pub ledger: LedgerState,
}

/// An immutable segment on disk.
#[derive(Debug, Clone)]
pub struct Segment {
    path: PathBuf,
    id: u32,
    /// Last WAL sequence contained in this segment.
    pub sequence_end: u64,
}

impl Segment {
    /// Opens an existing segment, reading only its header.
    ///
    /// # Errors
    /// I/O failures or a malformed header.
    pub fn open(path: &Path, id: u32) -> IoResult<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        codec::read_header(&mut reader)?;
        let header: SegmentHeader = codec::decode(&mut reader)?;
        Ok(Self {
            path: path.to_path_buf(),
            id,
            sequence_end: header.sequence_end,
        })
    }

    /// Path of the segment file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot.
    ///
    /// # Errors
    /// I/O failures, or `InvalidData` for a corrupted segment.
    pub fn read_all(&self) -> IoResult<SegmentData> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        codec::read_header(&mut reader)?;
        let _header: SegmentHeader = codec::decode(&mut reader)?;
        let mut data: SegmentData = codec::decode(&mut reader)?;
        data.entities.rebuild_lookups();
        data.ledger.rebuild_lookups();
        Ok(data)
    }
}

/// Writes one segment through a temp file; nothing is visible until
/// [`finalize`](Self::finalize) renames it into place.
pub struct SegmentWriter {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    id: u32,
    writer: Option<BufWriter<File>>,
    sequence_end: Option<u64>,
}

impl SegmentWriter {
    fn new(final_path: PathBuf, id: u32) -> IoResult<Self> {
        let mut name = final_path.as_os_str().to_owned();
        name.push(TEMP_SUFFIX);
        let temp_path = PathBuf::from(name);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path,
            id,
            writer: Some(writer),
            sequence_end: None,
        })
    }

    /// Writes the snapshot. May be called once.
    ///
    /// # Errors
    /// I/O or serialization failures, or a second call.
    pub fn write(&mut self, snapshot: &SnapshotRef<'_>, sequence_end: u64) -> IoResult<()> {
        if self.sequence_end.is_some() {
            return Err(IoError::new(ErrorKind::Other, "segment data already written"));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "segment writer already consumed"))?;

        let header = SegmentHeader {
            sequence_end,
            entity_count: snapshot.entities.len() as u64,
            observation_count: snapshot.ledger.len() as u64,
            created_at: Utc::now(),
        };
        writer.write_all(&codec::encode(&header)?)?;
        writer.write_all(&codec::encode(snapshot)?)?;
        self.sequence_end = Some(sequence_end);
        Ok(())
    }

    /// Flushes, syncs and renames the segment into place.
    ///
    /// # Errors
    /// I/O failures, or no data was written.
    pub fn finalize(mut self) -> IoResult<Segment> {
        let sequence_end = self
            .sequence_end
            .ok_or_else(|| IoError::new(ErrorKind::Other, "segment has no data"))?;
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "segment writer already consumed"))?;
        let temp_path = self
            .temp_path
            .take()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "segment temp path already consumed"))?;

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&temp_path, &self.final_path)?;

        Ok(Segment {
            path: self.final_path.clone(),
            id: self.id,
            sequence_end,
        })
    }

    /// Discards the temp file.
    ///
    /// # Errors
    /// I/O failures removing the file.
    pub fn abort(mut self) -> IoResult<()> {
        self.writer.take();
        if let Some(temp_path) = self.temp_path.take() {
            if temp_path.exists() {
                fs::remove_file(temp_path)?;
            }
        }
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if let Some(temp_path) = self.temp_path.take() {
            let _ = fs::remove_file(temp_path);
        }
    }
}

/// Tracks the segment files of a data directory.
#[derive(Debug)]
pub struct SegmentManager {
    dir: PathBuf,
    segments: Vec<Segment>,
    next_id: u32,
}

fn parse_segment_id(path: &Path) -> Option<u32> {
    if path.extension()? != SEGMENT_EXT {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("segment_")?
        .parse()
        .ok()
}

impl SegmentManager {
    /// Scans `dir`, creating it if needed. Leftover temp files are removed.
    ///
    /// # Errors
    /// I/O failures listing the directory.
    pub fn open(dir: &Path) -> IoResult<Self> {
        fs::create_dir_all(dir)?;

        let mut segments = Vec::new();
        let mut next_id = 1u32;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();

            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TEMP_SUFFIX));
            if is_temp {
                tracing::warn!(path = %path.display(), "removing stale segment temp file");
                let _ = fs::remove_file(&path);
                continue;
            }

            let Some(id) = parse_segment_id(&path) else {
                continue;
            };
            next_id = next_id.max(id.saturating_add(1));
            match Segment::open(&path, id) {
                Ok(segment) => segments.push(segment),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable segment");
                }
            }
        }
        segments.sort_by_key(|s| s.id);

        Ok(Self {
            dir: dir.to_path_buf(),
            segments,
            next_id,
        })
    }

    /// Segment directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of segment files.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Newest segment.
    #[must_use]
    pub fn latest(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// Highest WAL sequence already in a segment.
    #[must_use]
    pub fn persisted_sequence(&self) -> u64 {
        self.latest().map_or(0, |s| s.sequence_end)
    }

    /// Loads the newest snapshot, if any.
    ///
    /// # Errors
    /// I/O or decoding failures.
    pub fn load_latest(&self) -> IoResult<Option<SegmentData>> {
        self.latest().map(Segment::read_all).transpose()
    }

    /// Starts writing the next segment.
    ///
    /// # Errors
    /// I/O failures creating the temp file.
    pub fn create_writer(&mut self) -> IoResult<SegmentWriter> {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        let path = self.dir.join(format!("segment_{id:05}.{SEGMENT_EXT}"));
        SegmentWriter::new(path, id)
    }

    /// Registers a finalized segment and deletes the ones it supersedes.
    ///
    /// Returns how many older segments were removed.
    pub fn install(&mut self, segment: Segment) -> usize {
        let old = std::mem::take(&mut self.segments);
        self.segments.push(segment);
        let mut removed = 0;
        for stale in old {
            match fs::remove_file(stale.path()) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %stale.path().display(), error = %e, "failed to remove old segment");
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Claim;
    use crate::kind::AttributeKind;
    use crate::observation::{Observation, SourceId};
    use tempfile::tempdir;

    fn sample() -> (EntityIndex, LedgerState) {
        let mut ledger = LedgerState::new();
        let (obs, _) = ledger.append(Observation::new(SourceId::new("s").unwrap(), "Ada"));
        let mut index = EntityIndex::new();
        let entity = index.prepare(
            vec![Claim::new(AttributeKind::Person, "Ada", 0.4, Some(obs))],
            Utc::now(),
        );
        index.insert_new(entity).unwrap();
        (index, ledger)
    }

    #[test]
    fn test_open_empty_dir() {
        let dir = tempdir().unwrap();
        let manager = SegmentManager::open(&dir.path().join("segments")).unwrap();
        assert_eq!(manager.segment_count(), 0);
        assert_eq!(manager.persisted_sequence(), 0);
        assert!(manager.load_latest().unwrap().is_none());
    }

    #[test]
    fn test_write_install_and_reload() {
        let dir = tempdir().unwrap();
        let (index, ledger) = sample();
        let mut manager = SegmentManager::open(dir.path()).unwrap();

        for sequence_end in [4, 9] {
            let mut writer = manager.create_writer().unwrap();
            let snapshot = SnapshotRef {
                entities: &index,
                ledger: &ledger,
            };
            writer.write(&snapshot, sequence_end).unwrap();
            let segment = writer.finalize().unwrap();
            manager.install(segment);
        }
        assert_eq!(manager.segment_count(), 1);

        let reopened = SegmentManager::open(dir.path()).unwrap();
        assert_eq!(reopened.segment_count(), 1);
        assert_eq!(reopened.persisted_sequence(), 9);
        let data = reopened.load_latest().unwrap().unwrap();
        assert_eq!(data.entities.partition(), index.partition());
        assert_eq!(data.ledger.ids(), ledger.ids());
    }

    #[test]
    fn test_abort_and_stale_temp_cleanup() {
        let dir = tempdir().unwrap();
        let mut manager = SegmentManager::open(dir.path()).unwrap();

        let writer = manager.create_writer().unwrap();
        let temp = writer.temp_path.clone().unwrap();
        assert!(temp.exists());
        writer.abort().unwrap();
        assert!(!temp.exists());

        fs::write(dir.path().join("segment_00007.seg.tmp"), b"junk").unwrap();
        let reopened = SegmentManager::open(dir.path()).unwrap();
        assert_eq!(reopened.segment_count(), 0);
        assert!(!dir.path().join("segment_00007.seg.tmp").exists());
    }
}
