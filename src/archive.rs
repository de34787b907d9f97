use std::collections::BTreeMap;
use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use fnv::{FnvHashMap, FnvHasher};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_BYTES_PER_FILE: u64 = 10_000_000;
pub const DEFAULT_DEDUP_WINDOW: usize = 4000;

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Rotate to a new output file once one grows past this many bytes.
    pub bytes_per_file: u64,
    /// How many recent image hashes the duplicate filter remembers.
    pub dedup_window: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            bytes_per_file: DEFAULT_BYTES_PER_FILE,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

/// Request context stored alongside each archived image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMeta {
    #[serde(rename = "h")]
    pub headers: BTreeMap<String, String>,
    #[serde(rename = "a")]
    pub remote_addr: String,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "t")]
    pub timestamp_ms: i64,
}

/// One archived submission: metadata plus the raw image bytes, CBOR-encoded
/// with single-letter keys and concatenated into `ima_*.cbor` files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    #[serde(rename = "m")]
    pub meta: RecordMeta,
    #[serde(rename = "i", with = "serde_bytes")]
    pub image: Vec<u8>,
}

pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn image_hash(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

/// Recently seen hashes: a fixed ring of slots plus a count map so lookup is
/// O(1). The counts always equal the multiset of occupied ring slots; an
/// eviction decrements before the insertion increments.
struct DedupWindow {
    ring: Vec<Option<u64>>,
    counts: FnvHashMap<u64, u32>,
    pos: usize,
}

impl DedupWindow {
    fn new(window: usize) -> Self {
        Self {
            ring: vec![None; window.max(1)],
            counts: FnvHashMap::default(),
            pos: 0,
        }
    }

    /// Returns true when the hash is already in the window; otherwise
    /// advances the ring and remembers it. The position moves forward
    /// before the evicted slot is read, so the first insertion lands in
    /// slot 1 and slot 0 fills only after wraparound.
    fn note(&mut self, hash: u64) -> bool {
        if self.counts.contains_key(&hash) {
            return true;
        }
        self.pos = (self.pos + 1) % self.ring.len();
        if let Some(evicted) = self.ring[self.pos].take() {
            match self.counts.get_mut(&evicted) {
                Some(count) if *count > 1 => *count -= 1,
                _ => {
                    self.counts.remove(&evicted);
                }
            }
        }
        self.ring[self.pos] = Some(hash);
        *self.counts.entry(hash).or_insert(0) += 1;
        false
    }
}

struct ArchiveState {
    dedup: DedupWindow,
    out: Option<File>,
    out_path: PathBuf,
    bytes_written: u64,
}

/// Appends submitted images to size-capped CBOR record files, dropping
/// recent duplicates. All methods are fire-and-forget: failures are logged
/// and never surface to the caller.
pub struct ImageArchiver {
    dir: PathBuf,
    config: ArchiveConfig,
    state: Mutex<ArchiveState>,
}

impl ImageArchiver {
    pub fn new(dir: impl Into<PathBuf>, config: ArchiveConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let archiver = Self {
            dir,
            state: Mutex::new(ArchiveState {
                dedup: DedupWindow::new(config.dedup_window),
                out: None,
                out_path: PathBuf::new(),
                bytes_written: 0,
            }),
            config,
        };
        if let Err(err) = archiver.prewarm() {
            warn!(
                "{}: duplicate-filter pre-warm: {err}",
                archiver.dir.display()
            );
        }
        Ok(archiver)
    }

    /// Records one submission unless its bytes were seen recently. The
    /// record is encoded before the lock is taken; the duplicate check and
    /// the append happen in one critical section.
    pub fn archive(&self, image: &[u8], meta: RecordMeta) {
        let hash = image_hash(image);
        let record = ArchiveRecord {
            meta,
            image: image.to_vec(),
        };
        let mut encoded = Vec::new();
        if let Err(err) = ciborium::ser::into_writer(&record, &mut encoded) {
            warn!("archive record encode: {err}");
            return;
        }

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.dedup.note(hash) {
            debug!("duplicate image dropped");
            return;
        }
        if state.out.is_none() || state.bytes_written > self.config.bytes_per_file {
            if let Err(err) = self.rotate(&mut state) {
                state.out = None;
                warn!("{}: archive rotate: {err}", self.dir.display());
                return;
            }
        }
        if let Some(out) = state.out.as_mut() {
            match out.write_all(&encoded) {
                Ok(()) => state.bytes_written += encoded.len() as u64,
                Err(err) => {
                    let path = state.out_path.clone();
                    state.out = None;
                    warn!("{}: archive write: {err}", path.display());
                }
            }
        }
    }

    fn rotate(&self, state: &mut ArchiveState) -> std::io::Result<()> {
        state.out = None;
        let name = format!("ima_{}_{}.cbor", unix_millis(), rand::random::<u32>());
        let path = self.dir.join(name);
        let file = File::create(&path)?;
        info!("archiving to {}", path.display());
        state.out = Some(file);
        state.out_path = path;
        state.bytes_written = 0;
        Ok(())
    }

    /// Replays the newest archive file's image hashes into the duplicate
    /// filter. Best effort: a record that fails to decode ends the replay.
    fn prewarm(&self) -> Result<()> {
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.starts_with("ima_") && name.ends_with(".cbor")) {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
                continue;
            };
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, entry.path()));
            }
        }
        let Some((_, path)) = newest else {
            return Ok(());
        };

        let mut reader = BufReader::new(File::open(&path)?);
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut warmed = 0usize;
        while let Ok(record) = ciborium::de::from_reader::<ArchiveRecord, _>(&mut reader) {
            state.dedup.note(image_hash(&record.image));
            warmed += 1;
        }
        debug!("pre-warmed {warmed} hashes from {}", path.display());
        Ok(())
    }
}

/// Streams every record out of one archive file, in file order.
pub fn read_archive_file(path: &Path) -> Result<Vec<ArchiveRecord>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    while let Ok(record) = ciborium::de::from_reader::<ArchiveRecord, _>(&mut reader) {
        records.push(record);
    }
    Ok(records)
}
