// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use std::fmt;

use kestrel_engine::{Iterable, Peekable, Snapshot};
use kestrel_proto::metapb::Region;

use crate::keys::{self, enc_end_key, enc_start_key};
use crate::store::util;
use crate::Result;

/// An engine snapshot scoped to one region: reads outside the region's key
/// range fail with `KeyNotInRegion`, scans are clamped to it. Handed to
/// clients through `Snap` responses.
#[derive(Clone)]
pub struct RegionSnapshot<S: Snapshot> {
    snap: S,
    region: Region,
}

impl<S: Snapshot> RegionSnapshot<S> {
    pub fn new(snap: S, region: Region) -> RegionSnapshot<S> {
        RegionSnapshot { snap, region }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn get_value_cf(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        util::check_key_in_region(key, &self.region)?;
        let data_key = keys::data_key(key);
        Ok(self.snap.get_value_cf(cf, &data_key)?)
    }

    pub fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_value_cf(kestrel_engine::CF_DEFAULT, key)
    }

    /// Scans `[start_key, end_key)` clamped to the region range. Keys are
    /// handed to the callback without the data prefix.
    pub fn scan_cf<F>(&self, cf: &str, start_key: &[u8], end_key: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let start = if start_key < self.region.start_key.as_slice() {
            enc_start_key(&self.region)
        } else {
            keys::data_key(start_key)
        };
        let region_end = enc_end_key(&self.region);
        let end = if end_key.is_empty() {
            region_end
        } else {
            region_end.min(keys::data_key(end_key))
        };
        if start >= end {
            return Ok(());
        }
        self.snap.scan_cf(cf, &start, &end, |k, v| {
            f(keys::origin_key(k), v).map_err(|e| kestrel_engine::Error::Other(e.to_string()))
        })?;
        Ok(())
    }
}

impl<S: Snapshot> fmt::Debug for RegionSnapshot<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegionSnapshot {{ region: {:?} }}", self.region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_engine::{KvEngine, MemEngine, Mutable, WriteBatch};

    fn prepare() -> (MemEngine, Region) {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        for k in [b"a1", b"b1", b"c1"] {
            wb.put(&keys::data_key(k), b"v").unwrap();
        }
        engine.write(&wb).unwrap();
        let region = Region {
            id: 1,
            start_key: b"b".to_vec(),
            end_key: b"c".to_vec(),
            ..Default::default()
        };
        (engine, region)
    }

    #[test]
    fn test_region_scoped_get() {
        let (engine, region) = prepare();
        let snap = RegionSnapshot::new(engine.snapshot(), region);
        assert_eq!(snap.get_value(b"b1").unwrap(), Some(b"v".to_vec()));
        assert!(snap.get_value(b"a1").is_err());
        assert!(snap.get_value(b"c1").is_err());
    }

    #[test]
    fn test_scan_clamped() {
        let (engine, region) = prepare();
        let snap = RegionSnapshot::new(engine.snapshot(), region);
        let mut seen = vec![];
        snap.scan_cf(kestrel_engine::CF_DEFAULT, b"", b"", |k, _| {
            seen.push(k.to_vec());
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, vec![b"b1".to_vec()]);
    }
}
