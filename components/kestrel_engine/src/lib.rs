// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Engine trait surface for the two key-value stores every Kestrel node
//! runs on: `kv` (user data, apply state, region-local state) and `raft`
//! (raft log and hard state). The engine contract is deliberately small:
//! point reads, range scans, atomic write batches, and point-in-time
//! snapshots. Callers coordinate nothing beyond that.

mod errors;
mod memory;

use serde::{de::DeserializeOwned, Serialize};

pub use crate::errors::{Error, Result};
pub use crate::memory::{MemEngine, MemSnapshot, MemWriteBatch};

pub const CF_DEFAULT: &str = "default";
pub const CF_LOCK: &str = "lock";
pub const CF_WRITE: &str = "write";
pub const ALL_CFS: &[&str] = &[CF_DEFAULT, CF_LOCK, CF_WRITE];

/// Point reads.
pub trait Peekable {
    fn get_value_cf(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_value_cf(CF_DEFAULT, key)
    }

    fn get_msg_cf<M: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<M>> {
        match self.get_value_cf(cf, key)? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    fn get_msg<M: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<M>> {
        self.get_msg_cf(CF_DEFAULT, key)
    }
}

/// Range scans over `[start_key, end_key)`. The callback returns `false`
/// to stop the scan early.
pub trait Iterable {
    fn scan_cf<F>(&self, cf: &str, start_key: &[u8], end_key: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>;

    fn scan<F>(&self, start_key: &[u8], end_key: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        self.scan_cf(CF_DEFAULT, start_key, end_key, f)
    }
}

/// Buffered mutations. Nothing is visible until the batch is written.
pub trait Mutable: Send {
    fn put_cf(&mut self, cf: &str, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete_cf(&mut self, cf: &str, key: &[u8]) -> Result<()>;
    fn delete_range_cf(&mut self, cf: &str, start_key: &[u8], end_key: &[u8]) -> Result<()>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_cf(CF_DEFAULT, key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.delete_cf(CF_DEFAULT, key)
    }

    fn put_msg_cf<M: Serialize>(&mut self, cf: &str, key: &[u8], m: &M) -> Result<()> {
        let v = bincode::serialize(m)?;
        self.put_cf(cf, key, &v)
    }

    fn put_msg<M: Serialize>(&mut self, key: &[u8], m: &M) -> Result<()> {
        self.put_msg_cf(CF_DEFAULT, key, m)
    }
}

pub trait WriteBatch: Mutable {
    fn count(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.count() == 0
    }
    fn clear(&mut self);
    /// Marks a rollback point for a speculative group of mutations.
    fn set_save_point(&mut self);
    /// Discards the most recent save point, keeping its mutations.
    fn pop_save_point(&mut self) -> Result<()>;
    /// Drops every mutation recorded after the most recent save point.
    fn rollback_to_save_point(&mut self) -> Result<()>;
}

/// A consistent point-in-time view of the engine.
pub trait Snapshot: Peekable + Iterable + Clone + Send + 'static {}

pub trait KvEngine: Peekable + Iterable + Clone + Send + Sync + 'static {
    type Snapshot: Snapshot;
    type WriteBatch: WriteBatch;

    fn write_batch(&self) -> Self::WriteBatch;
    /// Applies the whole batch atomically.
    fn write(&self, wb: &Self::WriteBatch) -> Result<()>;
    fn snapshot(&self) -> Self::Snapshot;
}

/// The raft/kv engine pair owned by one store.
#[derive(Clone)]
pub struct Engines<E: KvEngine> {
    pub kv: E,
    pub raft: E,
}

impl<E: KvEngine> Engines<E> {
    pub fn new(kv: E, raft: E) -> Engines<E> {
        Engines { kv, raft }
    }

    pub fn write_kv(&self, wb: &E::WriteBatch) -> Result<()> {
        self.kv.write(wb)
    }

    pub fn write_raft(&self, wb: &E::WriteBatch) -> Result<()> {
        self.raft.write(wb)
    }
}
