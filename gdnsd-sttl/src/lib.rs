// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The packed `(state, ttl)` value ("sttl") and the process-wide monitor
//! state table (C1 of the core spec). No I/O lives here; this crate is a
//! pure data structure shared by every resolver plugin and the daemon.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use arc_swap::ArcSwap;

/// Bit 31 marks a down state; the low 24 bits hold the TTL in seconds.
const DOWN_BIT: u32 = 1 << 31;
const TTL_MASK: u32 = (1 << 24) - 1;

/// Default TTL (seconds) assigned when a monitor is registered but has not
/// yet reported.
pub const DEFAULT_TTL: u32 = 60;

/// A packed `(state, ttl)` pair, per GLOSSARY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sttl(u32);

impl Sttl {
    pub const fn new(down: bool, ttl: u32) -> Self {
        let ttl = ttl & TTL_MASK;
        if down {
            Sttl(ttl | DOWN_BIT)
        } else {
            Sttl(ttl)
        }
    }

    pub const fn up(ttl: u32) -> Self {
        Self::new(false, ttl)
    }

    pub const fn down(ttl: u32) -> Self {
        Self::new(true, ttl)
    }

    pub const fn is_down(self) -> bool {
        self.0 & DOWN_BIT != 0
    }

    pub const fn ttl(self) -> u32 {
        self.0 & TTL_MASK
    }

    pub const fn with_down(self, down: bool) -> Self {
        Self::new(down, self.ttl())
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn from_raw(raw: u32) -> Self {
        Sttl(raw)
    }

    /// "minimum-of-two" per GLOSSARY: DOWN wins over up; otherwise the
    /// lesser TTL wins.
    pub fn min2(a: Sttl, b: Sttl) -> Sttl {
        let down = a.is_down() || b.is_down();
        let ttl = a.ttl().min(b.ttl());
        Sttl::new(down, ttl)
    }
}

impl Default for Sttl {
    fn default() -> Self {
        Sttl::up(DEFAULT_TTL)
    }
}

/// A dense, stable handle into the [`MonitorTable`], issued sequentially
/// from zero at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitorIndex(u32);

impl MonitorIndex {
    /// Constructs an index directly; used by callers that enumerate
    /// `0..table.len()` against a snapshot rather than holding on to the
    /// indices returned from `register_admin`.
    pub const fn from_raw(raw: u32) -> Self {
        MonitorIndex(raw)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

struct Registry {
    descriptions: Vec<String>,
}

/// Process-wide table of monitor `sttl` values. Monitor indices are dense
/// and stable for the process lifetime.
///
/// Writers (the monitor thread, and config-load code registering admin
/// monitors) serialize through `registry`; the `sttl` array itself is
/// published via an atomic pointer swap so that readers (DNS I/O threads)
/// never block and never observe a torn update.
pub struct MonitorTable {
    registry: Mutex<Registry>,
    sttl: ArcSwap<Vec<u32>>,
    len: AtomicUsize,
}

impl Default for MonitorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorTable {
    pub fn new() -> Self {
        MonitorTable {
            registry: Mutex::new(Registry {
                descriptions: Vec::new(),
            }),
            sttl: ArcSwap::from_pointee(Vec::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Allocates a new monitor index with an initial `up` state at the
    /// default TTL. Indices are dense and issued in registration order.
    pub fn register_admin(&self, description: impl Into<String>) -> MonitorIndex {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let idx = reg.descriptions.len() as u32;
        reg.descriptions.push(description.into());
        drop(reg);

        let mut next = (**self.sttl.load()).clone();
        next.push(Sttl::default().raw());
        self.len.store(next.len(), Ordering::Release);
        self.sttl.store(std::sync::Arc::new(next));
        MonitorIndex(idx)
    }

    /// Sets `index`'s state to `up` on `success`, `down` otherwise, keeping
    /// its current TTL. Called only from the monitor thread at runtime.
    pub fn update(&self, index: MonitorIndex, success: bool) {
        self.update_with_ttl(index, success, None);
    }

    /// As [`MonitorTable::update`], but also sets a new TTL (used by admin
    /// force-state paths that carry their own TTL).
    pub fn update_with_ttl(&self, index: MonitorIndex, success: bool, ttl: Option<u32>) {
        let idx = index.index();
        let mut next = (**self.sttl.load()).clone();
        assert!(idx < next.len(), "monitor index out of range");
        let cur = Sttl::from_raw(next[idx]);
        let new_ttl = ttl.unwrap_or(cur.ttl());
        next[idx] = Sttl::new(!success, new_ttl).raw();
        self.sttl.store(std::sync::Arc::new(next));
    }

    /// Returns a read-only, internally-consistent view of every monitor's
    /// current sttl, valid for the duration of one query.
    pub fn snapshot(&self) -> SttlSnapshot {
        SttlSnapshot(self.sttl.load_full())
    }

    pub fn description(&self, index: MonitorIndex) -> String {
        let reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.descriptions
            .get(index.index())
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A read-only snapshot of the monitor table, as returned by
/// [`MonitorTable::snapshot`]. Cheap to clone (reference-counted).
#[derive(Clone)]
pub struct SttlSnapshot(std::sync::Arc<Vec<u32>>);

impl SttlSnapshot {
    pub fn get(&self, index: MonitorIndex) -> Sttl {
        Sttl::from_raw(self.0[index.index()])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sttl_packing_roundtrips() {
        let s = Sttl::up(300);
        assert!(!s.is_down());
        assert_eq!(s.ttl(), 300);

        let d = Sttl::down(10);
        assert!(d.is_down());
        assert_eq!(d.ttl(), 10);
    }

    #[test]
    fn min2_down_wins() {
        let up = Sttl::up(500);
        let down = Sttl::down(10);
        let m = Sttl::min2(up, down);
        assert!(m.is_down());
        assert_eq!(m.ttl(), 10);
    }

    #[test]
    fn min2_lesser_ttl_wins_when_both_up() {
        let a = Sttl::up(500);
        let b = Sttl::up(30);
        let m = Sttl::min2(a, b);
        assert!(!m.is_down());
        assert_eq!(m.ttl(), 30);
    }

    #[test]
    fn register_and_update() {
        let table = MonitorTable::new();
        let idx0 = table.register_admin("svc-a");
        let idx1 = table.register_admin("svc-b");

        let snap = table.snapshot();
        assert!(!snap.get(idx0).is_down());
        assert!(!snap.get(idx1).is_down());

        table.update(idx0, false);
        let snap2 = table.snapshot();
        assert!(snap2.get(idx0).is_down());
        assert!(!snap2.get(idx1).is_down());

        // old snapshot is untouched (internally consistent view)
        assert!(!snap.get(idx0).is_down());
    }

    #[test]
    fn dense_indices() {
        let table = MonitorTable::new();
        let idxs: Vec<_> = (0..8).map(|i| table.register_admin(format!("m{i}"))).collect();
        for (i, idx) in idxs.iter().enumerate() {
            assert_eq!(idx.index(), i);
        }
        assert_eq!(table.len(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_readers_never_see_torn_state() {
        let table = std::sync::Arc::new(MonitorTable::new());
        let idxs: Vec<_> = (0..16).map(|i| table.register_admin(format!("m{i}"))).collect();

        let writer_table = table.clone();
        let writer_idxs = idxs.clone();
        let writer = tokio::spawn(async move {
            for round in 0..200 {
                for idx in &writer_idxs {
                    writer_table.update(*idx, round % 2 == 0);
                }
            }
        });

        let mut readers = Vec::new();
        for _ in 0..4 {
            let t = table.clone();
            let idxs = idxs.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let snap = t.snapshot();
                    // every index must be readable without panicking
                    for idx in &idxs {
                        let _ = snap.get(*idx);
                    }
                }
            }));
        }

        writer.await.unwrap();
        for r in readers {
            r.await.unwrap();
        }
    }
}
