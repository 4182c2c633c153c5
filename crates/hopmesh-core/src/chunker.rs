//! # Chunker
//!
//! Splits a UTF-8 payload into `<=23`-byte fragments and hands a complete
//! [`UnicastFrame`] series to the reliability queue, one destination series
//! at a time for broadcast.

use bytes::Bytes;
use rand::RngExt;
use tokio::sync::mpsc;

use hopmesh_wire::{NodeId, UnicastFrame};

use crate::routing::Routing;
use hopmesh_wire::frame::MAX_FRAGMENT_PAYLOAD;
use std::sync::Arc;

#[derive(Debug)]
pub struct Chunker {
    own_id: NodeId,
    routing: Arc<Routing>,
    outbound_tx: mpsc::UnboundedSender<UnicastFrame>,
}

impl Chunker {
    pub fn new(
        own_id: NodeId,
        routing: Arc<Routing>,
        outbound_tx: mpsc::UnboundedSender<UnicastFrame>,
    ) -> Chunker {
        Chunker { own_id, routing, outbound_tx }
    }

    /// Send `payload` to a single destination as one fragment series.
    pub fn unicast(&self, destination: NodeId, payload: &[u8]) {
        let nonce = random_nonce();
        self.send_series(destination, payload, nonce);
    }

    /// Send `payload` to every currently reachable destination, each as its
    /// own fragment series with an independent nonce.
    pub fn broadcast(&self, payload: &[u8]) {
        for destination in self.routing.neighbors() {
            self.send_series(destination, payload, random_nonce());
        }
    }

    fn send_series(&self, destination: NodeId, payload: &[u8], nonce: [u8; 2]) {
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[][..]]
        } else {
            payload.chunks(MAX_FRAGMENT_PAYLOAD).collect()
        };
        let fragment_count = chunks.len() as u8;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let next_hop = self.routing.next_hop(destination);
            if !next_hop.is_assigned() {
                tracing::warn!(
                    destination = %destination,
                    sent = i,
                    total = fragment_count,
                    "no route at fragment construction time, aborting series"
                );
                return;
            }
            let frame = UnicastFrame {
                fragment_count,
                next_hop,
                source: self.own_id,
                destination,
                sequence: (i + 1) as u8,
                previous_hop: self.own_id,
                nonce,
                payload: Bytes::copy_from_slice(chunk),
            };
            if self.outbound_tx.send(frame).is_err() {
                return;
            }
        }
    }
}

fn random_nonce() -> [u8; 2] {
    let mut rng = rand::rng();
    [rng.random(), rng.random()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc as tmpsc;

    fn id(n: u8) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn chunker(own: u8) -> (Chunker, Arc<Routing>, mpsc::UnboundedReceiver<UnicastFrame>) {
        let (bg_tx, _bg_rx) = tmpsc::unbounded_channel();
        let routing = Arc::new(Routing::new(id(own), bg_tx));
        let (outbound_tx, outbound_rx) = tmpsc::unbounded_channel();
        (Chunker::new(id(own), routing.clone(), outbound_tx), routing, outbound_rx)
    }

    #[test]
    fn unicast_splits_into_23_byte_fragments() {
        let (chunker, routing, mut rx) = chunker(1);
        routing.on_keep_alive(id(2));
        let payload = vec![b'x'; 30];
        chunker.unicast(id(2), &payload);

        let f1 = rx.try_recv().unwrap();
        let f2 = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(f1.fragment_count, 2);
        assert_eq!(f1.sequence, 1);
        assert_eq!(f1.payload.len(), 23);
        assert_eq!(f2.sequence, 2);
        assert_eq!(f2.payload.len(), 7);
        assert_eq!(f1.nonce, f2.nonce);
    }

    #[test]
    fn broadcast_emits_one_series_per_destination() {
        let (chunker, routing, mut rx) = chunker(1);
        routing.on_keep_alive(id(2));
        routing.on_keep_alive(id(3));
        chunker.broadcast(b"hi");

        let mut destinations = std::collections::HashSet::new();
        while let Ok(frame) = rx.try_recv() {
            destinations.insert(frame.destination);
        }
        assert_eq!(destinations, std::collections::HashSet::from([id(2), id(3)]));
    }

    #[test]
    fn aborts_series_when_no_route() {
        let (chunker, _routing, mut rx) = chunker(1);
        chunker.unicast(id(9), b"hello");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_with_one_unreachable_destination_does_not_affect_others() {
        let (chunker, routing, mut rx) = chunker(1);
        routing.on_keep_alive(id(2));
        chunker.broadcast(b"hi");
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.destination, id(2));
        assert!(rx.try_recv().is_err());
    }
}
