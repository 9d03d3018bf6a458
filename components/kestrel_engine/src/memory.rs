// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! An ordered in-memory engine. It backs the test clusters and the demo
//! binary; a production deployment would plug a persistent engine behind
//! the same traits.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Included, Unbounded};
use std::sync::{Arc, RwLock};

use crate::{
    Error, Iterable, KvEngine, Mutable, Peekable, Result, Snapshot, WriteBatch, ALL_CFS,
};

type Cf = BTreeMap<Vec<u8>, Vec<u8>>;

/// An empty `end_key` scans to the end of the key space.
fn range_iter<'a>(
    tree: &'a Cf,
    start_key: &[u8],
    end_key: &[u8],
) -> Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a> {
    if end_key.is_empty() {
        Box::new(tree.range((Included(start_key.to_vec()), Unbounded)))
    } else {
        Box::new(tree.range(start_key.to_vec()..end_key.to_vec()))
    }
}

fn scan_cfs<F>(
    cfs: &HashMap<String, Cf>,
    cf: &str,
    start_key: &[u8],
    end_key: &[u8],
    mut f: F,
) -> Result<()>
where
    F: FnMut(&[u8], &[u8]) -> Result<bool>,
{
    let tree = cfs.get(cf).ok_or_else(|| Error::CfName(cf.to_owned()))?;
    for (k, v) in range_iter(tree, start_key, end_key) {
        if !f(k, v)? {
            break;
        }
    }
    Ok(())
}

fn get_cfs(cfs: &HashMap<String, Cf>, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let tree = cfs.get(cf).ok_or_else(|| Error::CfName(cf.to_owned()))?;
    Ok(tree.get(key).cloned())
}

#[derive(Clone)]
pub struct MemEngine {
    cfs: Arc<RwLock<HashMap<String, Cf>>>,
}

impl MemEngine {
    pub fn new() -> MemEngine {
        let mut cfs = HashMap::new();
        for cf in ALL_CFS {
            cfs.insert(cf.to_string(), Cf::new());
        }
        MemEngine {
            cfs: Arc::new(RwLock::new(cfs)),
        }
    }

    /// Total byte size of keys and values in one column family, used by
    /// tests to reason about split mass conservation.
    pub fn total_size_cf(&self, cf: &str) -> u64 {
        let cfs = self.cfs.read().unwrap();
        cfs.get(cf)
            .map(|t| t.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum())
            .unwrap_or(0)
    }
}

impl Default for MemEngine {
    fn default() -> MemEngine {
        MemEngine::new()
    }
}

impl Peekable for MemEngine {
    fn get_value_cf(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cfs = self.cfs.read().unwrap();
        get_cfs(&cfs, cf, key)
    }
}

impl Iterable for MemEngine {
    fn scan_cf<F>(&self, cf: &str, start_key: &[u8], end_key: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let cfs = self.cfs.read().unwrap();
        scan_cfs(&cfs, cf, start_key, end_key, f)
    }
}

impl KvEngine for MemEngine {
    type Snapshot = MemSnapshot;
    type WriteBatch = MemWriteBatch;

    fn write_batch(&self) -> MemWriteBatch {
        MemWriteBatch {
            ops: Vec::new(),
            save_points: Vec::new(),
        }
    }

    fn write(&self, wb: &MemWriteBatch) -> Result<()> {
        let mut cfs = self.cfs.write().unwrap();
        for op in &wb.ops {
            let tree = cfs
                .get_mut(op.cf())
                .ok_or_else(|| Error::CfName(op.cf().to_owned()))?;
            match op {
                WbOp::Put { key, value, .. } => {
                    tree.insert(key.clone(), value.clone());
                }
                WbOp::Delete { key, .. } => {
                    tree.remove(key);
                }
                WbOp::DeleteRange {
                    start_key, end_key, ..
                } => {
                    let keys: Vec<Vec<u8>> = range_iter(tree, start_key, end_key)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in keys {
                        tree.remove(&k);
                    }
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> MemSnapshot {
        let cfs = self.cfs.read().unwrap();
        MemSnapshot {
            cfs: Arc::new(cfs.clone()),
        }
    }
}

#[derive(Debug)]
enum WbOp {
    Put {
        cf: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: String,
        key: Vec<u8>,
    },
    DeleteRange {
        cf: String,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
    },
}

impl WbOp {
    fn cf(&self) -> &str {
        match self {
            WbOp::Put { cf, .. } | WbOp::Delete { cf, .. } | WbOp::DeleteRange { cf, .. } => cf,
        }
    }
}

pub struct MemWriteBatch {
    ops: Vec<WbOp>,
    save_points: Vec<usize>,
}

impl Mutable for MemWriteBatch {
    fn put_cf(&mut self, cf: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.ops.push(WbOp::Put {
            cf: cf.to_owned(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn delete_cf(&mut self, cf: &str, key: &[u8]) -> Result<()> {
        self.ops.push(WbOp::Delete {
            cf: cf.to_owned(),
            key: key.to_vec(),
        });
        Ok(())
    }

    fn delete_range_cf(&mut self, cf: &str, start_key: &[u8], end_key: &[u8]) -> Result<()> {
        self.ops.push(WbOp::DeleteRange {
            cf: cf.to_owned(),
            start_key: start_key.to_vec(),
            end_key: end_key.to_vec(),
        });
        Ok(())
    }
}

impl WriteBatch for MemWriteBatch {
    fn count(&self) -> usize {
        self.ops.len()
    }

    fn clear(&mut self) {
        self.ops.clear();
        self.save_points.clear();
    }

    fn set_save_point(&mut self) {
        self.save_points.push(self.ops.len());
    }

    fn pop_save_point(&mut self) -> Result<()> {
        self.save_points
            .pop()
            .map(|_| ())
            .ok_or_else(|| Error::Other("no save point".to_owned()))
    }

    fn rollback_to_save_point(&mut self) -> Result<()> {
        match self.save_points.pop() {
            Some(point) => {
                self.ops.truncate(point);
                Ok(())
            }
            None => Err(Error::Other("no save point".to_owned())),
        }
    }
}

#[derive(Clone)]
pub struct MemSnapshot {
    cfs: Arc<HashMap<String, Cf>>,
}

impl Peekable for MemSnapshot {
    fn get_value_cf(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        get_cfs(&self.cfs, cf, key)
    }
}

impl Iterable for MemSnapshot {
    fn scan_cf<F>(&self, cf: &str, start_key: &[u8], end_key: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        scan_cfs(&self.cfs, cf, start_key, end_key, f)
    }
}

impl Snapshot for MemSnapshot {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CF_DEFAULT;

    #[test]
    fn test_write_batch_atomic() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        wb.put(b"a", b"1").unwrap();
        wb.put_cf(CF_DEFAULT, b"b", b"2").unwrap();
        assert_eq!(engine.get_value(b"a").unwrap(), None);
        engine.write(&wb).unwrap();
        assert_eq!(engine.get_value(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get_value(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_snapshot_isolation() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        wb.put(b"k", b"v1").unwrap();
        engine.write(&wb).unwrap();

        let snap = engine.snapshot();
        let mut wb = engine.write_batch();
        wb.put(b"k", b"v2").unwrap();
        engine.write(&wb).unwrap();

        assert_eq!(snap.get_value(b"k").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(engine.get_value(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_delete_range() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        for k in [b"a", b"b", b"c", b"d"] {
            wb.put(k, b"v").unwrap();
        }
        engine.write(&wb).unwrap();

        let mut wb = engine.write_batch();
        wb.delete_range_cf(CF_DEFAULT, b"b", b"d").unwrap();
        engine.write(&wb).unwrap();

        assert!(engine.get_value(b"a").unwrap().is_some());
        assert!(engine.get_value(b"b").unwrap().is_none());
        assert!(engine.get_value(b"c").unwrap().is_none());
        assert!(engine.get_value(b"d").unwrap().is_some());
    }

    #[test]
    fn test_scan_stops_early() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        for k in [b"a", b"b", b"c"] {
            wb.put(k, b"v").unwrap();
        }
        engine.write(&wb).unwrap();

        let mut seen = vec![];
        engine
            .scan(b"", b"", |k, _| {
                seen.push(k.to_vec());
                Ok(seen.len() < 2)
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_save_point_rollback() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        wb.put(b"a", b"1").unwrap();
        wb.set_save_point();
        wb.put(b"b", b"2").unwrap();
        wb.rollback_to_save_point().unwrap();
        wb.set_save_point();
        wb.put(b"c", b"3").unwrap();
        wb.pop_save_point().unwrap();
        engine.write(&wb).unwrap();

        assert!(engine.get_value(b"a").unwrap().is_some());
        assert!(engine.get_value(b"b").unwrap().is_none());
        assert!(engine.get_value(b"c").unwrap().is_some());
        assert!(wb.pop_save_point().is_err());
    }

    #[test]
    fn test_msg_round_trip() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        wb.put_msg(b"m", &(42u64, vec![1u8, 2, 3])).unwrap();
        engine.write(&wb).unwrap();
        let m: Option<(u64, Vec<u8>)> = engine.get_msg(b"m").unwrap();
        assert_eq!(m, Some((42, vec![1, 2, 3])));
    }
}
