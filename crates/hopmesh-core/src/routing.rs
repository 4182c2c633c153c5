//! # Routing
//!
//! Distance-vector routing table maintained via periodic link-state
//! advertisements and short-form keep-alives. Owns the routing table AND the
//! neighbor table behind a single mutex — both are read and mutated from the
//! receive dispatcher, the keep-alive ticker, the periodic broadcaster, and
//! the chunker, and the "mutate + broadcast" sequence must be serialized to
//! avoid fanning out a stale advertisement.
//!
//! Routing exposes itself as a plain `Arc<Routing>` handle rather than a
//! back-reference into the chunker: the chunker only ever *reads*
//! `next_hop`/`neighbors`, so there is no cycle to break.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use rand::RngExt;
use tokio::sync::mpsc;

use hopmesh_wire::{LinkStateFrame, NodeId};

/// Neighbor liveness window: a neighbor is evicted once its miss-counter
/// exceeds this many consecutive keep-alive ticks without a frame seen.
const MAX_MISSES: u8 = 4;

#[derive(Debug, Default)]
struct Tables {
    /// destination -> (cost, next_hop)
    table: HashMap<NodeId, (u8, NodeId)>,
    /// neighbor -> consecutive keep-alive ticks missed
    neighbors: HashMap<NodeId, u8>,
    /// broadcasts remaining in the current "fan out the last change" window
    quiet_period: u8,
}

#[derive(Debug)]
pub struct Routing {
    own_id: NodeId,
    state: Mutex<Tables>,
    background_tx: mpsc::UnboundedSender<LinkStateFrame>,
}

impl Routing {
    pub fn new(own_id: NodeId, background_tx: mpsc::UnboundedSender<LinkStateFrame>) -> Routing {
        Routing {
            own_id,
            state: Mutex::new(Tables::default()),
            background_tx,
        }
    }

    pub fn next_hop(&self, dest: NodeId) -> NodeId {
        self.state
            .lock()
            .unwrap()
            .table
            .get(&dest)
            .map(|&(_, hop)| hop)
            .unwrap_or(NodeId::NONE)
    }

    /// All currently reachable destinations (not just direct neighbors).
    pub fn neighbors(&self) -> HashSet<NodeId> {
        self.state.lock().unwrap().table.keys().copied().collect()
    }

    pub fn table_len(&self) -> usize {
        self.state.lock().unwrap().table.len()
    }

    fn own_link_state(&self) -> LinkStateFrame {
        let state = self.state.lock().unwrap();
        let entries = state.table.iter().map(|(&d, &(c, _))| (d, c)).collect();
        LinkStateFrame { source: self.own_id, entries }
    }

    fn broadcast(&self) {
        let frame = self.own_link_state();
        let _ = self.background_tx.send(frame);
    }

    /// A keep-alive was received directly from `sender`.
    pub fn on_keep_alive(&self, sender: NodeId) {
        if sender == self.own_id || !sender.is_assigned() {
            return;
        }
        let installed = {
            let mut state = self.state.lock().unwrap();
            state.neighbors.insert(sender, 0);
            if !state.table.contains_key(&sender) {
                state.table.insert(sender, (1, sender));
                true
            } else {
                false
            }
        };
        if installed {
            tracing::info!(neighbor = %sender, "installed direct neighbor route");
            self.broadcast();
        }
    }

    /// A link-state advertisement was received from `source` with `entries`.
    pub fn on_link_state(&self, source: NodeId, entries: &[(NodeId, u8)]) {
        if source == self.own_id || !source.is_assigned() {
            return;
        }
        let advertised: HashSet<NodeId> = entries.iter().map(|&(d, _)| d).collect();
        let mut changed = false;

        let should_broadcast = {
            let mut state = self.state.lock().unwrap();

            // 1. Drop destinations routed via `source` that it no longer advertises.
            let stale: Vec<NodeId> = state
                .table
                .iter()
                .filter(|(&d, &(_, hop))| hop == source && d != source && !advertised.contains(&d))
                .map(|(&d, _)| d)
                .collect();
            for d in stale {
                state.table.remove(&d);
                changed = true;
            }

            // 2. Refresh source's own miss-counter.
            state.neighbors.insert(source, 0);

            // 3. Install source itself as a direct neighbor if new.
            if !state.table.contains_key(&source) {
                state.table.insert(source, (1, source));
                changed = true;
            }

            // 4. Merge advertised entries.
            for &(d, c) in entries {
                if d == self.own_id {
                    continue;
                }
                let candidate = c.saturating_add(1);
                match state.table.get(&d) {
                    None => {
                        state.table.insert(d, (candidate, source));
                        changed = true;
                    }
                    Some(&(cost, _)) if candidate < cost => {
                        state.table.insert(d, (candidate, source));
                        changed = true;
                    }
                    // Equal or worse cost: keep the existing route (stability).
                    _ => {}
                }
            }

            // 5. Decide whether to re-broadcast.
            if changed {
                state.quiet_period = 3;
                true
            } else if state.quiet_period > 0 {
                state.quiet_period -= 1;
                true
            } else {
                false
            }
        };

        if should_broadcast {
            self.broadcast();
        }
    }

    /// One keep-alive ticker iteration: emit a keep-alive, age out neighbors
    /// that have missed too many ticks, and broadcast the resulting table.
    pub async fn keep_alive_tick(&self, keep_alive_tx: &mpsc::UnboundedSender<NodeId>) {
        let _ = keep_alive_tx.send(self.own_id);

        let removed: Vec<NodeId> = {
            let mut state = self.state.lock().unwrap();
            let mut dead = Vec::new();
            for (&n, miss) in state.neighbors.iter_mut() {
                *miss += 1;
                if *miss > MAX_MISSES {
                    dead.push(n);
                }
            }
            for &n in &dead {
                state.neighbors.remove(&n);
            }
            if !dead.is_empty() {
                let dead_set: HashSet<NodeId> = dead.iter().copied().collect();
                state
                    .table
                    .retain(|&d, &mut (_, hop)| !dead_set.contains(&hop) && !dead_set.contains(&d));
            }
            dead
        };

        for n in &removed {
            tracing::warn!(neighbor = %n, "neighbor missed too many keep-alives, evicted");
        }
        self.broadcast();
    }

    /// Runs the keep-alive ticker: initial random delay, then a fixed period
    /// drawn once at startup.
    pub async fn run_keep_alive_ticker(&self, keep_alive_tx: mpsc::UnboundedSender<NodeId>) {
        let initial = Duration::from_millis(rand::rng().random_range(2000..4000));
        tokio::time::sleep(initial).await;
        self.keep_alive_tick(&keep_alive_tx).await;

        let period = Duration::from_secs(rand::rng().random_range(40..60));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // consume the immediate first tick
        loop {
            ticker.tick().await;
            self.keep_alive_tick(&keep_alive_tx).await;
        }
    }

    /// Periodic unconditional link-state broadcast, every 80-100s.
    pub async fn run_periodic_broadcaster(&self) {
        loop {
            let delay = Duration::from_secs(rand::rng().random_range(80..100));
            tokio::time::sleep(delay).await;
            self.broadcast();
        }
    }

    /// Startup bootstrap: broadcast every 15s until the table has >= 3
    /// entries, then return so the caller can transition to `Ready`.
    pub async fn run_bootstrap(&self) {
        while self.table_len() < 3 {
            self.broadcast();
            tokio::time::sleep(Duration::from_secs(15)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn routing(own: u8) -> (Routing, mpsc::UnboundedReceiver<LinkStateFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Routing::new(id(own), tx), rx)
    }

    #[test]
    fn keep_alive_installs_direct_route() {
        let (r, _rx) = routing(1);
        r.on_keep_alive(id(2));
        assert_eq!(r.next_hop(id(2)), id(2));
        assert_eq!(r.neighbors(), HashSet::from([id(2)]));
    }

    #[test]
    fn link_state_installs_two_hop_route() {
        let (r, _rx) = routing(1);
        r.on_keep_alive(id(2));
        r.on_link_state(id(2), &[(id(3), 1)]);
        assert_eq!(r.next_hop(id(3)), id(2));
        assert_eq!(r.neighbors(), HashSet::from([id(2), id(3)]));
    }

    #[test]
    fn equal_cost_does_not_replace_existing_route() {
        let (r, _rx) = routing(1);
        r.on_keep_alive(id(2));
        r.on_keep_alive(id(3));
        r.on_link_state(id(2), &[(id(4), 1)]); // installs 4 via 2, cost 2
        r.on_link_state(id(3), &[(id(4), 1)]); // same cost via 3: keep via 2
        assert_eq!(r.next_hop(id(4)), id(2));
    }

    #[test]
    fn shorter_route_replaces_longer() {
        let (r, _rx) = routing(1);
        r.on_keep_alive(id(2));
        r.on_keep_alive(id(3));
        r.on_link_state(id(2), &[(id(4), 5)]); // cost 6 via 2
        r.on_link_state(id(3), &[(id(4), 1)]); // cost 2 via 3: better
        assert_eq!(r.next_hop(id(4)), id(3));
    }

    #[test]
    fn own_id_never_routed() {
        let (r, _rx) = routing(1);
        r.on_keep_alive(id(2));
        r.on_link_state(id(2), &[(id(1), 1)]);
        assert_eq!(r.next_hop(id(1)), NodeId::NONE);
    }

    #[tokio::test]
    async fn keep_alive_tick_evicts_dead_neighbor_and_its_routes() {
        let (r, _rx) = routing(1);
        r.on_keep_alive(id(2));
        r.on_link_state(id(2), &[(id(5), 1)]);
        let (tx, _rx2) = mpsc::unbounded_channel();
        for _ in 0..5 {
            r.keep_alive_tick(&tx).await;
        }
        assert_eq!(r.next_hop(id(2)), NodeId::NONE);
        assert_eq!(r.next_hop(id(5)), NodeId::NONE);
    }

    #[test]
    fn link_state_drops_destination_source_no_longer_advertises() {
        let (r, _rx) = routing(1);
        r.on_keep_alive(id(2));
        r.on_link_state(id(2), &[(id(5), 1)]);
        assert_eq!(r.next_hop(id(5)), id(2));
        r.on_link_state(id(2), &[]);
        assert_eq!(r.next_hop(id(5)), NodeId::NONE);
    }
}
