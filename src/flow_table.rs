use super::flow_key::{FlowBuildHasher, FlowKey};
use crate::error::DpError;
use crate::util;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

pub const MAX_FLOWS: usize = 65_536;

// A flow entry's statistics are individually-atomic so the hit path can
// update them without holding the table lock, and a concurrent
// control-plane read never observes a torn 64-bit value. Only the entry
// that was just looked up is written, so there's no cross-entry race.
#[derive(Debug)]
pub struct FlowEntry {
    pub actions: Mutex<Vec<u8>>,
    pub packet_count: AtomicU64,
    pub byte_count: AtomicU64,
    pub used: AtomicU64,
    pub tcp_flags: AtomicU8,
}

impl FlowEntry {
    fn new(actions: Vec<u8>) -> FlowEntry {
        FlowEntry {
            actions: Mutex::new(actions),
            packet_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
            used: AtomicU64::new(0),
            tcp_flags: AtomicU8::new(0),
        }
    }

    pub fn record_hit(&self, size: u64, tcp_flags: u8) {
        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count.fetch_add(size, Ordering::Relaxed);
        self.used.store(util::now_msec(), Ordering::Relaxed);
        if tcp_flags != 0 {
            self.tcp_flags.fetch_or(tcp_flags, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> FlowStats {
        FlowStats {
            packet_count: self.packet_count.load(Ordering::Relaxed),
            byte_count: self.byte_count.load(Ordering::Relaxed),
            used: self.used.load(Ordering::Relaxed),
            tcp_flags: self.tcp_flags.load(Ordering::Relaxed),
        }
    }

    pub fn zero_stats(&self) {
        self.packet_count.store(0, Ordering::Relaxed);
        self.byte_count.store(0, Ordering::Relaxed);
        self.tcp_flags.store(0, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FlowStats {
    pub packet_count: u64,
    pub byte_count: u64,
    pub used: u64,
    pub tcp_flags: u8,
}

pub struct FlowTable {
    inner: Mutex<HashMap<FlowKey, Arc<FlowEntry>, FlowBuildHasher>>,
}

#[derive(Debug)]
pub enum PutResult {
    Created(Arc<FlowEntry>),
    Modified(Arc<FlowEntry>),
}

impl FlowTable {
    pub fn new() -> FlowTable {
        FlowTable { inner: Mutex::new(HashMap::default()) }
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<Arc<FlowEntry>> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    // 'create' and 'modify' mirror flow_put's CREATE/MODIFY flags: a key
    // that already exists needs 'modify' set or fails EXISTS; a missing
    // key needs 'create' set or fails NO_ENTRY. CREATE fails TOO_BIG once
    // the table is at MAX_FLOWS. Both flags set means upsert.
    pub fn put(&self, key: FlowKey, actions: Vec<u8>, create: bool, modify: bool) -> Result<PutResult, DpError> {
        let mut table = self.inner.lock().unwrap();
        if let Some(existing) = table.get(&key) {
            if !modify {
                return Err(DpError::Exists);
            }
            *existing.actions.lock().unwrap() = actions;
            return Ok(PutResult::Modified(existing.clone()));
        }
        if !create {
            return Err(DpError::NoEntry);
        }
        if table.len() >= MAX_FLOWS {
            return Err(DpError::TooBig);
        }
        let entry = Arc::new(FlowEntry::new(actions));
        table.insert(key, entry.clone());
        Ok(PutResult::Created(entry))
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<FlowEntry>> {
        self.inner.lock().unwrap().remove(key)
    }

    pub fn flush(&self) {
        self.inner.lock().unwrap().clear();
    }

    // Snapshot the current key set for a resumable dump. Keys inserted
    // after the snapshot is taken are not visited; keys removed before
    // their turn are silently skipped by next().
    pub fn dump_start(&self) -> Cursor {
        let keys: Vec<FlowKey> = self.inner.lock().unwrap().keys().cloned().collect();
        Cursor { keys, pos: 0 }
    }
}

pub struct Cursor {
    keys: Vec<FlowKey>,
    pos: usize,
}

impl Cursor {
    pub fn next(&mut self, table: &FlowTable) -> Option<(FlowKey, Arc<FlowEntry>)> {
        while self.pos < self.keys.len() {
            let key = self.keys[self.pos].clone();
            self.pos += 1;
            if let Some(entry) = table.lookup(&key) {
                return Some((key, entry));
            }
        }
        None
    }
}

#[cfg(test)]
mod selftest {
    use super::*;
    use crate::flow_key::FlowKey;

    fn key(in_port: u32) -> FlowKey {
        FlowKey { in_port, ..Default::default() }
    }

    #[test]
    fn put_and_lookup() {
        let t = FlowTable::new();
        t.put(key(1), vec![1, 2, 3], true, false).unwrap();
        let e = t.lookup(&key(1)).unwrap();
        assert_eq!(*e.actions.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn create_rejects_duplicate() {
        let t = FlowTable::new();
        t.put(key(1), vec![], true, false).unwrap();
        assert_eq!(t.put(key(1), vec![], true, false).unwrap_err(), DpError::Exists);
    }

    #[test]
    fn modify_rejects_missing() {
        let t = FlowTable::new();
        assert_eq!(t.put(key(1), vec![], false, true).unwrap_err(), DpError::NoEntry);
    }

    #[test]
    fn capacity_bound_enforced() {
        let t = FlowTable::new();
        for i in 0..MAX_FLOWS {
            t.put(key(i as u32), vec![], true, false).unwrap();
        }
        assert_eq!(t.count(), MAX_FLOWS);
        assert_eq!(t.put(key(999_999), vec![], true, false).unwrap_err(), DpError::TooBig);
        t.remove(&key(0));
        assert!(t.put(key(999_999), vec![], true, false).is_ok());
    }

    #[test]
    fn hit_updates_dont_need_the_table_lock() {
        let t = FlowTable::new();
        t.put(key(1), vec![], true, false).unwrap();
        let e = t.lookup(&key(1)).unwrap();
        e.record_hit(64, 0x02);
        let stats = e.snapshot();
        assert_eq!(stats.packet_count, 1);
        assert_eq!(stats.byte_count, 64);
        assert_eq!(stats.tcp_flags, 0x02);
    }

    #[test]
    fn cursor_visits_every_key_once() {
        let t = FlowTable::new();
        for i in 0..5 { t.put(key(i), vec![], true, false).unwrap(); }
        let mut cursor = t.dump_start();
        let mut seen = std::collections::HashSet::new();
        while let Some((k, _)) = cursor.next(&t) {
            seen.insert(k.in_port);
        }
        assert_eq!(seen.len(), 5);
    }
}
