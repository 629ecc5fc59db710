use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

use bgp_wire::{Afi, AsPath, Nlri, Safi};

use crate::bmf::Label;
use crate::context::unix_now;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RibError {
    #[error("attribute bucket collision limit reached")]
    AttrBucketOverflow,
    #[error("prefix bucket collision limit reached")]
    PrefixBucketOverflow,
}

/// Prefix-table key: address family, prefix bits, mask length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrefixKey {
    pub afi: Afi,
    pub safi: Safi,
    pub plen: u8,
    pub prefix: Vec<u8>,
}

impl PrefixKey {
    pub fn from_nlri(nlri: &Nlri) -> Self {
        Self {
            afi: nlri.afi,
            safi: nlri.safi,
            plen: nlri.plen,
            prefix: nlri.prefix.clone(),
        }
    }

    fn bucket(&self, buckets: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        (hasher.finish() % buckets as u64) as usize
    }
}

/// One interned path-attribute string with the parsed fields the labeler
/// compares, reference-counted by the prefixes pointing at it.
#[derive(Debug)]
pub struct AttrEntry {
    bytes: Vec<u8>,
    hash: u64,
    pub as_path: Option<AsPath>,
    pub origin: Option<u8>,
    pub next_hop: Option<Vec<u8>>,
    refcount: AtomicU32,
    /// Back-references for the RIB dump walker.
    prefixes: Mutex<Vec<PrefixKey>>,
}

impl AttrEntry {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn prefixes(&self) -> Vec<PrefixKey> {
        self.prefixes.lock().unwrap().clone()
    }

    fn add_prefix(&self, key: &PrefixKey) {
        self.prefixes.lock().unwrap().push(key.clone());
    }

    fn remove_prefix(&self, key: &PrefixKey) {
        let mut prefixes = self.prefixes.lock().unwrap();
        if let Some(pos) = prefixes.iter().position(|p| p == key) {
            prefixes.swap_remove(pos);
        }
    }
}

#[derive(Debug)]
struct PrefixSlot {
    key: PrefixKey,
    attr: Option<Arc<AttrEntry>>,
    timestamp: i64,
    announce_count: u64,
    withdraw_count: u64,
}

/// Per-session Adj-RIB-In: a prefix table and an attribute table, each a
/// fixed bucket array with an independent reader/writer lock per bucket.
/// The per-bucket lock is the only lock the labeling path holds while
/// mutating the table.
#[derive(Debug)]
pub struct Rib {
    prefix_buckets: Vec<RwLock<Vec<PrefixSlot>>>,
    attr_buckets: Vec<RwLock<Vec<Arc<AttrEntry>>>>,
    max_collisions: usize,
}

impl Rib {
    pub fn new(prefix_buckets: usize, attr_buckets: usize, max_collisions: usize) -> Self {
        Self {
            prefix_buckets: (0..prefix_buckets.max(1)).map(|_| RwLock::new(Vec::new())).collect(),
            attr_buckets: (0..attr_buckets.max(1)).map(|_| RwLock::new(Vec::new())).collect(),
            max_collisions: max_collisions.max(1),
        }
    }

    pub fn attr_bucket_count(&self) -> usize {
        self.attr_buckets.len()
    }

    pub fn prefix_count(&self) -> usize {
        self.prefix_buckets
            .iter()
            .map(|b| b.read().unwrap().iter().filter(|s| s.attr.is_some()).count())
            .sum()
    }

    pub fn attr_count(&self) -> usize {
        self.attr_buckets.iter().map(|b| b.read().unwrap().len()).sum()
    }

    fn attr_bucket_of(&self, hash: u64) -> &RwLock<Vec<Arc<AttrEntry>>> {
        &self.attr_buckets[(hash % self.attr_buckets.len() as u64) as usize]
    }

    /// Look up or insert a canonical attribute string, taking one reference
    /// on the returned entry.
    pub fn intern_attrs(
        &self,
        canonical: Vec<u8>,
        as_path: Option<AsPath>,
        origin: Option<u8>,
        next_hop: Option<Vec<u8>>,
    ) -> Result<Arc<AttrEntry>, RibError> {
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        let hash = hasher.finish();

        let mut bucket = self.attr_bucket_of(hash).write().unwrap();
        if let Some(entry) = bucket.iter().find(|e| e.hash == hash && e.bytes == canonical) {
            entry.refcount.fetch_add(1, Ordering::SeqCst);
            return Ok(entry.clone());
        }
        if bucket.len() >= self.max_collisions {
            return Err(RibError::AttrBucketOverflow);
        }
        let entry = Arc::new(AttrEntry {
            bytes: canonical,
            hash,
            as_path,
            origin,
            next_hop,
            refcount: AtomicU32::new(1),
            prefixes: Mutex::new(Vec::new()),
        });
        bucket.push(entry.clone());
        Ok(entry)
    }

    /// Drop one reference; the entry is unlinked from its bucket when the
    /// count reaches zero.
    fn release_attrs(&self, entry: &Arc<AttrEntry>) {
        if entry.refcount.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let mut bucket = self.attr_bucket_of(entry.hash).write().unwrap();
        // Re-check under the bucket lock: a concurrent intern may have
        // resurrected the entry.
        if entry.refcount.load(Ordering::SeqCst) == 0 {
            if let Some(pos) = bucket.iter().position(|e| Arc::ptr_eq(e, entry)) {
                bucket.swap_remove(pos);
            }
        }
    }

    /// Apply one withdrawn NLRI.
    pub fn withdraw(&self, nlri: &Nlri) -> Label {
        let key = PrefixKey::from_nlri(nlri);
        let mut bucket = self.prefix_buckets[key.bucket(self.prefix_buckets.len())]
            .write()
            .unwrap();
        let Some(slot) = bucket.iter_mut().find(|s| s.key == key) else {
            return Label::DuplicateWithdraw;
        };
        let Some(old) = slot.attr.take() else {
            slot.withdraw_count += 1;
            return Label::DuplicateWithdraw;
        };
        slot.withdraw_count += 1;
        slot.timestamp = unix_now();
        old.remove_prefix(&key);
        self.release_attrs(&old);
        Label::Withdraw
    }

    /// Apply one announced NLRI carrying `entry` (already interned, one
    /// reference held by the caller on our behalf).
    pub fn announce(&self, nlri: &Nlri, entry: Arc<AttrEntry>) -> Result<Label, RibError> {
        let key = PrefixKey::from_nlri(nlri);
        let mut bucket = self.prefix_buckets[key.bucket(self.prefix_buckets.len())]
            .write()
            .unwrap();

        let Some(slot) = bucket.iter_mut().find(|s| s.key == key) else {
            if bucket.len() >= self.max_collisions {
                self.release_attrs(&entry);
                return Err(RibError::PrefixBucketOverflow);
            }
            entry.add_prefix(&key);
            bucket.push(PrefixSlot {
                key,
                attr: Some(entry),
                timestamp: unix_now(),
                announce_count: 1,
                withdraw_count: 0,
            });
            return Ok(Label::NewAnnounce);
        };

        slot.announce_count += 1;
        slot.timestamp = unix_now();
        let Some(old) = slot.attr.clone() else {
            // Previously withdrawn; the prefix returns as a fresh announce.
            entry.add_prefix(&key);
            slot.attr = Some(entry);
            return Ok(Label::NewAnnounce);
        };

        if Arc::ptr_eq(&old, &entry) {
            // Net effect on the refcount is zero.
            self.release_attrs(&entry);
            return Ok(Label::DuplicateAnnounce);
        }

        let label = if old.as_path == entry.as_path {
            Label::SamePath
        } else {
            Label::DifferentPath
        };
        old.remove_prefix(&key);
        self.release_attrs(&old);
        entry.add_prefix(&key);
        slot.attr = Some(entry);
        Ok(label)
    }

    /// Current attribute handle of a prefix, if any.
    pub fn lookup(&self, nlri: &Nlri) -> Option<Arc<AttrEntry>> {
        let key = PrefixKey::from_nlri(nlri);
        let bucket = self.prefix_buckets[key.bucket(self.prefix_buckets.len())]
            .read()
            .unwrap();
        bucket.iter().find(|s| s.key == key).and_then(|s| s.attr.clone())
    }

    /// Snapshot one attribute bucket for the dump walker: the canonical
    /// bytes and prefix list of every node, taken under the bucket's read
    /// lock.
    pub fn attr_bucket_snapshot(&self, index: usize) -> Vec<(Vec<u8>, Vec<PrefixKey>)> {
        let Some(bucket) = self.attr_buckets.get(index) else {
            return Vec::new();
        };
        let bucket = bucket.read().unwrap();
        bucket
            .iter()
            .map(|e| (e.bytes.clone(), e.prefixes()))
            .collect()
    }
}
