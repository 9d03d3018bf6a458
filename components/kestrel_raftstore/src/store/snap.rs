// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Snapshot file management.
//!
//! A snapshot is a single file named by `SnapKey { region_id, term, index }`
//! with a `gen` prefix on the sending side and a `rev` prefix on the
//! receiving side. The file holds a sequence of bincode-framed
//! `{cf, key, value}` records terminated by a `None` marker and a crc32 of
//! everything before it. The manager tracks which files are in active use
//! so garbage collection never deletes a snapshot mid-flight.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use raft::eraftpb::Snapshot as RaftSnapshot;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SNAP_GEN_PREFIX: &str = "gen";
const SNAP_REV_PREFIX: &str = "rev";
const SNAP_SUFFIX: &str = ".snap";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Error)]
pub enum SnapError {
    #[error("snap file {0} not exists")]
    NotExists(PathBuf),
    #[error("snap checksum mismatch, expect {expect}, got {got}")]
    ChecksumMismatch { expect: u32, got: u32 },
    #[error("Io {0}")]
    Io(#[from] io::Error),
    #[error("Codec {0}")]
    Codec(#[from] bincode::Error),
}

pub type SnapResult<T> = std::result::Result<T, SnapError>;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct SnapKey {
    pub region_id: u64,
    pub term: u64,
    pub idx: u64,
}

impl SnapKey {
    pub fn new(region_id: u64, term: u64, idx: u64) -> SnapKey {
        SnapKey {
            region_id,
            term,
            idx,
        }
    }

    pub fn from_region_snap(region_id: u64, snap: &RaftSnapshot) -> SnapKey {
        let meta = snap.get_metadata();
        SnapKey::new(region_id, meta.get_term(), meta.get_index())
    }
}

impl Display for SnapKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.region_id, self.term, self.idx)
    }
}

/// Marks a snapshot file as being produced or consumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapEntry {
    Generating,
    Sending,
    Receiving,
    Applying,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct SnapRecord {
    cf: String,
    key: Vec<u8>,
    value: Vec<u8>,
}

struct SnapManagerCore {
    base: PathBuf,
    registry: Mutex<HashMap<SnapKey, Vec<SnapEntry>>>,
}

#[derive(Clone)]
pub struct SnapManager {
    core: Arc<SnapManagerCore>,
}

impl SnapManager {
    pub fn new<P: Into<PathBuf>>(path: P) -> SnapManager {
        SnapManager {
            core: Arc::new(SnapManagerCore {
                base: path.into(),
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn init(&self) -> SnapResult<()> {
        fs::create_dir_all(&self.core.base)?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.core.base
    }

    fn file_path(&self, key: SnapKey, sending: bool) -> PathBuf {
        let prefix = if sending {
            SNAP_GEN_PREFIX
        } else {
            SNAP_REV_PREFIX
        };
        self.core
            .base
            .join(format!("{}_{}{}", prefix, key, SNAP_SUFFIX))
    }

    pub fn register(&self, key: SnapKey, entry: SnapEntry) {
        let mut registry = self.core.registry.lock().unwrap();
        registry.entry(key).or_default().push(entry);
    }

    pub fn deregister(&self, key: SnapKey, entry: SnapEntry) {
        let mut registry = self.core.registry.lock().unwrap();
        if let Some(entries) = registry.get_mut(&key) {
            if let Some(pos) = entries.iter().position(|e| *e == entry) {
                entries.remove(pos);
            }
            if entries.is_empty() {
                registry.remove(&key);
            }
        }
    }

    fn is_registered(&self, key: SnapKey) -> bool {
        self.core.registry.lock().unwrap().contains_key(&key)
    }

    /// Opens a builder writing the sending-side file for `key`. The caller
    /// streams records into it and finishes with `save`.
    pub fn get_snapshot_for_building(&self, key: SnapKey) -> SnapResult<SnapshotBuilder> {
        self.register(key, SnapEntry::Generating);
        SnapshotBuilder::create(self.clone(), key, SnapEntry::Generating, true)
    }

    pub fn get_snapshot_for_sending(&self, key: SnapKey) -> SnapResult<SnapFile> {
        SnapFile::open(key, self.file_path(key, true))
    }

    /// Stores an already-framed snapshot stream received from another
    /// store.
    pub fn save_received_snapshot(&self, key: SnapKey, data: &[u8]) -> SnapResult<()> {
        self.register(key, SnapEntry::Receiving);
        let res = (|| {
            let path = self.file_path(key, false);
            let tmp = path.with_extension("snap.tmp");
            let mut f = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })();
        self.deregister(key, SnapEntry::Receiving);
        res
    }

    pub fn get_snapshot_for_applying(&self, key: SnapKey) -> SnapResult<SnapFile> {
        SnapFile::open(key, self.file_path(key, false))
    }

    /// All snapshot files not currently in use, as `(key, is_sending)`.
    pub fn list_idle_snap(&self) -> SnapResult<Vec<(SnapKey, bool)>> {
        let mut snaps = Vec::new();
        for dir_entry in fs::read_dir(&self.core.base)? {
            let name = dir_entry?.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if name.ends_with(TMP_SUFFIX) || !name.ends_with(SNAP_SUFFIX) {
                continue;
            }
            let stem = &name[..name.len() - SNAP_SUFFIX.len()];
            let mut parts = stem.split('_');
            let prefix = parts.next();
            let sending = match prefix {
                Some(SNAP_GEN_PREFIX) => true,
                Some(SNAP_REV_PREFIX) => false,
                _ => continue,
            };
            let nums: Vec<u64> = parts.filter_map(|p| p.parse().ok()).collect();
            if nums.len() != 3 {
                continue;
            }
            let key = SnapKey::new(nums[0], nums[1], nums[2]);
            if self.is_registered(key) {
                continue;
            }
            snaps.push((key, sending));
        }
        snaps.sort_by_key(|(k, sending)| (k.region_id, k.term, k.idx, *sending));
        Ok(snaps)
    }

    /// Removes the file unless it is registered. Returns whether a file
    /// was actually deleted.
    pub fn delete_snapshot(&self, key: SnapKey, sending: bool) -> bool {
        if self.is_registered(key) {
            return false;
        }
        let path = self.file_path(key, sending);
        fs::remove_file(path).is_ok()
    }
}

/// Streams records into a snapshot file; the final `save` seals the frame
/// with the terminator and checksum and moves it into place.
pub struct SnapshotBuilder {
    mgr: SnapManager,
    key: SnapKey,
    entry: SnapEntry,
    path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    digest: crc32fast::Hasher,
    written_bytes: u64,
    saved: bool,
}

impl SnapshotBuilder {
    fn create(
        mgr: SnapManager,
        key: SnapKey,
        entry: SnapEntry,
        sending: bool,
    ) -> SnapResult<SnapshotBuilder> {
        let path = mgr.file_path(key, sending);
        let tmp_path = path.with_extension("snap.tmp");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        Ok(SnapshotBuilder {
            mgr,
            key,
            entry,
            path,
            tmp_path,
            writer: BufWriter::new(file),
            digest: crc32fast::Hasher::new(),
            written_bytes: 0,
            saved: false,
        })
    }

    pub fn add_entry(&mut self, cf: &str, key: &[u8], value: &[u8]) -> SnapResult<()> {
        let record = Some(SnapRecord {
            cf: cf.to_owned(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        let buf = bincode::serialize(&record)?;
        self.digest.update(&buf);
        self.written_bytes += buf.len() as u64;
        self.writer.write_all(&buf)?;
        Ok(())
    }

    /// Seals and publishes the file, returning its total size.
    pub fn save(mut self) -> SnapResult<u64> {
        let terminator = bincode::serialize(&Option::<SnapRecord>::None)?;
        self.digest.update(&terminator);
        self.written_bytes += terminator.len() as u64;
        self.writer.write_all(&terminator)?;
        let checksum = self.digest.clone().finalize();
        self.writer.write_u32::<BigEndian>(checksum)?;
        self.written_bytes += 4;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        self.saved = true;
        self.mgr.deregister(self.key, self.entry);
        Ok(self.written_bytes)
    }
}

impl Drop for SnapshotBuilder {
    fn drop(&mut self) {
        if !self.saved {
            let _ = fs::remove_file(&self.tmp_path);
            self.mgr.deregister(self.key, self.entry);
        }
    }
}

/// A sealed snapshot file.
pub struct SnapFile {
    pub key: SnapKey,
    pub path: PathBuf,
}

impl SnapFile {
    fn open(key: SnapKey, path: PathBuf) -> SnapResult<SnapFile> {
        if !path.exists() {
            return Err(SnapError::NotExists(path));
        }
        Ok(SnapFile { key, path })
    }

    pub fn total_size(&self) -> SnapResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    pub fn modified(&self) -> SnapResult<SystemTime> {
        Ok(fs::metadata(&self.path)?.modified()?)
    }

    pub fn load(&self) -> SnapResult<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }

    /// Streams records to `f`, verifying the trailing checksum. The
    /// checksum error is reported even if the caller consumed every
    /// record, so apply never trusts a torn file.
    pub fn scan<F>(&self, mut f: F) -> SnapResult<()>
    where
        F: FnMut(&str, &[u8], &[u8]) -> SnapResult<()>,
    {
        let file = File::open(&self.path)?;
        let mut reader = HashReader {
            inner: BufReader::new(file),
            digest: crc32fast::Hasher::new(),
        };
        loop {
            let record: Option<SnapRecord> = bincode::deserialize_from(&mut reader)?;
            match record {
                Some(r) => f(&r.cf, &r.key, &r.value)?,
                None => break,
            }
        }
        let expect = reader.digest.clone().finalize();
        let got = reader.inner.read_u32::<BigEndian>()?;
        if expect != got {
            return Err(SnapError::ChecksumMismatch { expect, got });
        }
        Ok(())
    }
}

struct HashReader<R: Read> {
    inner: R,
    digest: crc32fast::Hasher,
}

impl<R: Read> Read for HashReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_mgr(dir: &TempDir) -> SnapManager {
        let mgr = SnapManager::new(dir.path());
        mgr.init().unwrap();
        mgr
    }

    #[test]
    fn test_build_and_scan() {
        let dir = TempDir::new().unwrap();
        let mgr = new_mgr(&dir);
        let key = SnapKey::new(1, 5, 10);

        let mut builder = mgr.get_snapshot_for_building(key).unwrap();
        builder.add_entry("default", b"k1", b"v1").unwrap();
        builder.add_entry("write", b"k2", b"v2").unwrap();
        let size = builder.save().unwrap();
        assert!(size > 0);

        let file = mgr.get_snapshot_for_sending(key).unwrap();
        assert_eq!(file.total_size().unwrap(), size);

        let mut records = vec![];
        file.scan(|cf, k, v| {
            records.push((cf.to_owned(), k.to_vec(), v.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], ("default".to_owned(), b"k1".to_vec(), b"v1".to_vec()));
    }

    #[test]
    fn test_corrupted_file_detected() {
        let dir = TempDir::new().unwrap();
        let mgr = new_mgr(&dir);
        let key = SnapKey::new(1, 5, 10);
        let mut builder = mgr.get_snapshot_for_building(key).unwrap();
        builder.add_entry("default", b"k", b"v").unwrap();
        builder.save().unwrap();

        // Flip a byte in the middle of the file.
        let file = mgr.get_snapshot_for_sending(key).unwrap();
        let mut data = file.load().unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xFF;
        fs::write(&file.path, &data).unwrap();

        let file = mgr.get_snapshot_for_sending(key).unwrap();
        assert!(file.scan(|_, _, _| Ok(())).is_err());
    }

    #[test]
    fn test_send_receive_round_trip() {
        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        let sender = new_mgr(&dir1);
        let receiver = new_mgr(&dir2);
        let key = SnapKey::new(3, 7, 42);

        let mut builder = sender.get_snapshot_for_building(key).unwrap();
        builder.add_entry("default", b"a", b"b").unwrap();
        builder.save().unwrap();

        let data = sender.get_snapshot_for_sending(key).unwrap().load().unwrap();
        receiver.save_received_snapshot(key, &data).unwrap();

        let file = receiver.get_snapshot_for_applying(key).unwrap();
        let mut n = 0;
        file.scan(|_, _, _| {
            n += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_gc_skips_registered() {
        let dir = TempDir::new().unwrap();
        let mgr = new_mgr(&dir);
        let key = SnapKey::new(1, 2, 3);
        let mut builder = mgr.get_snapshot_for_building(key).unwrap();
        builder.add_entry("default", b"k", b"v").unwrap();
        builder.save().unwrap();

        assert_eq!(mgr.list_idle_snap().unwrap(), vec![(key, true)]);

        mgr.register(key, SnapEntry::Sending);
        assert!(mgr.list_idle_snap().unwrap().is_empty());
        assert!(!mgr.delete_snapshot(key, true));

        mgr.deregister(key, SnapEntry::Sending);
        assert!(mgr.delete_snapshot(key, true));
        assert!(mgr.get_snapshot_for_sending(key).is_err());
    }
}
