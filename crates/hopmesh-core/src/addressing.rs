//! # Addressing
//!
//! Self-assignment of a 5-bit node id on first boot, with best-effort
//! collision avoidance: explore, listen for ~8s, then either merge into a
//! reply we saw or pick a uniformly random free id.
//!
//! The historical implementation re-picks an id whenever it sees a reply
//! frame, even after it already has one. That is gated here on `own_id ==
//! NONE`: re-selection only ever happens inside [`Addressing::run`], which
//! executes exactly once per node before `own_id` is published; incoming
//! addressing traffic handled afterwards via [`Addressing::handle_incoming`]
//! only ever merges into `known`, never reassigns.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use rand::RngExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

use hopmesh_wire::{AddressingFrame, NodeId};

use crate::mac::{BackgroundFrame, Mac};
use hopmesh_wire::Frame;

/// Total listen window after exploring, per §4.2 ("five 1600ms ticks").
const LISTEN_WINDOW: Duration = Duration::from_millis(1600 * 5);

pub struct Addressing {
    own_id: Mutex<NodeId>,
    known: Mutex<HashSet<NodeId>>,
}

impl Addressing {
    pub fn new() -> Addressing {
        Addressing { own_id: Mutex::new(NodeId::NONE), known: Mutex::new(HashSet::new()) }
    }

    pub fn own_id(&self) -> NodeId {
        *self.own_id.lock().unwrap()
    }

    pub fn known(&self) -> HashSet<NodeId> {
        self.known.lock().unwrap().clone()
    }

    fn pick_unused(known: &HashSet<NodeId>) -> NodeId {
        let free: Vec<u8> = (NodeId::MIN..=NodeId::MAX)
            .filter(|&b| !known.contains(&NodeId::new(b).unwrap()))
            .collect();
        if free.is_empty() {
            // Address space exhausted (>31 nodes is out of scope); fall back
            // to a collision rather than panicking.
            return NodeId::new(rand::rng().random_range(NodeId::MIN..=NodeId::MAX)).unwrap();
        }
        let idx = rand::rng().random_range(0..free.len());
        NodeId::new(free[idx]).unwrap()
    }

    /// Explore → listen → self-assign. Consumes `inbound` for the duration of
    /// the listen window only; the caller must keep routing frames into it
    /// after `run` returns, via [`Addressing::handle_incoming`].
    pub async fn run(
        &self,
        mac: &Mac,
        inbound: &mut mpsc::UnboundedReceiver<AddressingFrame>,
    ) -> NodeId {
        mac.enqueue_background(BackgroundFrame::Data(Frame::Addressing(AddressingFrame {
            is_reply: false,
            source: NodeId::NONE,
            known: vec![],
        })));

        let deadline = Instant::now() + LISTEN_WINDOW;
        let mut seen_reply = false;
        let mut seen: HashSet<NodeId> = HashSet::new();

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, inbound.recv()).await {
                Ok(Some(frame)) => {
                    if frame.is_reply {
                        seen_reply = true;
                    }
                    seen.extend(frame.known.iter().copied());
                }
                Ok(None) => break,
                Err(_) => break, // deadline elapsed while awaiting
            }
        }

        let chosen = if seen_reply {
            let id = Self::pick_unused(&seen);
            seen.insert(id);
            id
        } else {
            let id = NodeId::new(rand::rng().random_range(NodeId::MIN..=NodeId::MAX)).unwrap();
            seen.clear();
            seen.insert(id);
            id
        };

        *self.own_id.lock().unwrap() = chosen;
        *self.known.lock().unwrap() = seen.clone();

        if seen_reply {
            mac.enqueue_background(BackgroundFrame::Data(Frame::Addressing(AddressingFrame {
                is_reply: true,
                source: chosen,
                known: seen.into_iter().collect(),
            })));
        }

        tracing::info!(id = %chosen, "self-assigned node id");
        chosen
    }

    /// Handle addressing traffic received after `own_id` is already assigned.
    /// Returns a reply frame to enqueue on the background sender, if any.
    pub fn handle_incoming(&self, frame: AddressingFrame) -> Option<AddressingFrame> {
        let own = self.own_id();
        if !own.is_assigned() {
            return None;
        }

        if !frame.source.is_assigned() {
            // Exploration request from a newcomer: gossip our known set back,
            // non-final.
            let known = self.known.lock().unwrap().clone();
            return Some(AddressingFrame {
                is_reply: false,
                source: own,
                known: known.into_iter().collect(),
            });
        }

        // Reply or gossip from an already-addressed peer: merge only.
        self.known.lock().unwrap().extend(frame.known.iter().copied());
        None
    }
}

impl Default for Addressing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> NodeId {
        NodeId::new(n).unwrap()
    }

    #[tokio::test]
    async fn no_replies_picks_random_id_and_seeds_known() {
        let (egress_tx, _egress_rx) = mpsc::unbounded_channel();
        let mac = Mac::new(egress_tx);
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let addressing = Addressing::new();

        let chosen = addressing.run(&mac, &mut rx).await;
        assert!(chosen.is_assigned());
        assert_eq!(addressing.known(), HashSet::from([chosen]));
    }

    #[tokio::test]
    async fn reply_seen_avoids_known_ids() {
        let (egress_tx, _egress_rx) = mpsc::unbounded_channel();
        let mac = Mac::new(egress_tx);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(AddressingFrame { is_reply: true, source: id(5), known: vec![id(5)] })
            .unwrap();
        drop(tx);

        let addressing = Addressing::new();
        let chosen = addressing.run(&mac, &mut rx).await;
        assert_ne!(chosen, id(5));
        assert!(addressing.known().contains(&id(5)));
        assert!(addressing.known().contains(&chosen));
    }

    #[test]
    fn post_assignment_exploration_gets_gossip_reply() {
        let addressing = Addressing::new();
        *addressing.own_id.lock().unwrap() = id(3);
        addressing.known.lock().unwrap().insert(id(3));

        let reply = addressing
            .handle_incoming(AddressingFrame { is_reply: false, source: NodeId::NONE, known: vec![] })
            .unwrap();
        assert!(!reply.is_reply);
        assert_eq!(reply.source, id(3));
        assert!(reply.known.contains(&id(3)));
    }

    #[test]
    fn post_assignment_reply_never_reassigns_own_id() {
        let addressing = Addressing::new();
        *addressing.own_id.lock().unwrap() = id(7);
        addressing.known.lock().unwrap().insert(id(7));

        let reply = addressing.handle_incoming(AddressingFrame {
            is_reply: true,
            source: id(9),
            known: vec![id(9), id(10)],
        });
        assert!(reply.is_none());
        assert_eq!(addressing.own_id(), id(7));
        assert!(addressing.known().contains(&id(10)));
    }
}
