//! # Reliability & forwarding
//!
//! Stop-and-wait unicast delivery, one fragment at a time, plus multi-hop
//! forwarding with loop/duplicate suppression and hop-by-hop ACKs.
//!
//! An ACK's payload id is the *previous hop's own id*, echoed back from the
//! fragment's `previous_hop` field — not the id of the node sending the ACK.
//! A node recognizes an ACK as "for me" when that echoed id equals its own,
//! which is exactly the literal `on_ack(id): if id == own_id` rule from the
//! design.
//!
//! Duplicate-forward suppression is tracked per `(source, destination,
//! sequence)` rather than as one single global nonce, so two independent
//! senders don't suppress each other's traffic (§9 resolved Open Question).
//! The sequence number has to be part of the key: a chunker series shares one
//! nonce across every fragment, so keying on `(source, destination, nonce)`
//! alone would make fragment 2 of a series look like a replay of fragment 1
//! at the relay and drop it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

use hopmesh_wire::{DataShort, NodeId, UnicastFrame};

use crate::mac::Mac;
use crate::reassembler::{Printer, Reassembler};
use crate::routing::Routing;

#[derive(Debug)]
pub struct Reliability {
    own_id: NodeId,
    mac: Arc<Mac>,
    routing: Arc<Routing>,
    reassembler: Arc<Reassembler>,
    printer: Arc<dyn Printer>,
    in_flight_target: Mutex<bool>,
    advance: Notify,
    forward_nonces: Mutex<HashMap<(NodeId, NodeId, u8), [u8; 2]>>,
    outbound_tx: mpsc::UnboundedSender<UnicastFrame>,
}

impl Reliability {
    pub fn new(
        own_id: NodeId,
        mac: Arc<Mac>,
        routing: Arc<Routing>,
        reassembler: Arc<Reassembler>,
        printer: Arc<dyn Printer>,
    ) -> (Reliability, mpsc::UnboundedReceiver<UnicastFrame>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let reliability = Reliability {
            own_id,
            mac,
            routing,
            reassembler,
            printer,
            in_flight_target: Mutex::new(false),
            advance: Notify::new(),
            forward_nonces: Mutex::new(HashMap::new()),
            outbound_tx,
        };
        (reliability, outbound_rx)
    }

    /// Producer handle shared with the chunker and the forwarding path.
    pub fn outbound_sender(&self) -> mpsc::UnboundedSender<UnicastFrame> {
        self.outbound_tx.clone()
    }

    /// Drains the reliability queue, handing one fragment at a time to MAC
    /// and blocking until [`Reliability::on_ack`] confirms it.
    pub async fn run_outbound(&self, mut queue: mpsc::UnboundedReceiver<UnicastFrame>) {
        while let Some(frame) = queue.recv().await {
            *self.in_flight_target.lock().unwrap() = true;
            if frame.sequence == 1 {
                self.mac.arm_first(frame);
            } else {
                self.mac.enqueue_normal(frame);
            }
            self.advance.notified().await;
        }
    }

    /// An ACK arrived from the medium, echoing `target` back. A node
    /// recognizes an ACK as meant for it when the echoed id is its own.
    pub fn on_ack(&self, target: NodeId) {
        if target != self.own_id {
            return;
        }
        let mut in_flight = self.in_flight_target.lock().unwrap();
        if *in_flight {
            *in_flight = false;
            drop(in_flight);
            self.mac.ack_received();
            self.advance.notify_one();
        }
    }

    /// A DATA fragment arrived whose `next_hop` equals our id.
    pub fn process_normal(&self, mut frame: UnicastFrame) {
        // Every hop ACKs its immediate upstream — the node that handed us
        // this frame, identified by its own id in `previous_hop`.
        self.mac.enqueue_ack(DataShort::Ack(frame.previous_hop));

        if frame.destination == self.own_id {
            self.reassembler.accept(&frame, self.printer.as_ref());
            return;
        }

        if !self.should_forward(frame.source, frame.destination, frame.sequence, frame.nonce) {
            tracing::debug!(
                source = %frame.source, destination = %frame.destination,
                "dropping duplicate forward"
            );
            return;
        }

        let next_hop = self.routing.next_hop(frame.destination);
        if !next_hop.is_assigned() {
            tracing::warn!(destination = %frame.destination, "no route, dropping fragment");
            return;
        }

        frame.next_hop = next_hop;
        frame.previous_hop = self.own_id;
        let _ = self.outbound_tx.send(frame);
    }

    fn should_forward(&self, source: NodeId, destination: NodeId, sequence: u8, nonce: [u8; 2]) -> bool {
        let mut nonces = self.forward_nonces.lock().unwrap();
        let key = (source, destination, sequence);
        if nonces.get(&key) == Some(&nonce) {
            false
        } else {
            nonces.insert(key, nonce);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembler::Reassembler;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc as tmpsc;

    fn id(n: u8) -> NodeId {
        NodeId::new(n).unwrap()
    }

    #[derive(Debug)]
    struct CapturePrinter(StdMutex<Vec<(NodeId, String)>>);
    impl Printer for CapturePrinter {
        fn deliver(&self, source: NodeId, message: String) {
            self.0.lock().unwrap().push((source, message));
        }
    }

    fn setup(own: u8) -> (Reliability, mpsc::UnboundedReceiver<UnicastFrame>, Arc<CapturePrinter>, Arc<Routing>) {
        let (egress_tx, _egress_rx) = tmpsc::unbounded_channel();
        let mac = Arc::new(Mac::new(egress_tx));
        let (bg_tx, _bg_rx) = tmpsc::unbounded_channel();
        let routing = Arc::new(Routing::new(id(own), bg_tx));
        let reassembler = Arc::new(Reassembler::new());
        let printer = Arc::new(CapturePrinter(StdMutex::new(Vec::new())));
        let (reliability, outbound_rx) =
            Reliability::new(id(own), mac, routing.clone(), reassembler, printer.clone());
        (reliability, outbound_rx, printer, routing)
    }

    fn frame(source: u8, dest: u8, next_hop: u8, prev_hop: u8, seq: u8, total: u8, nonce: [u8; 2]) -> UnicastFrame {
        UnicastFrame {
            fragment_count: total,
            next_hop: id(next_hop),
            source: id(source),
            destination: id(dest),
            sequence: seq,
            previous_hop: id(prev_hop),
            nonce,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn final_destination_delivers_and_acks_previous_hop() {
        let (reliability, _outbound_rx, printer, _routing) = setup(7);
        reliability.process_normal(frame(5, 7, 7, 5, 1, 1, [1, 1]));
        assert_eq!(printer.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn forwards_with_no_route_drops() {
        let (reliability, mut outbound_rx, _printer, _routing) = setup(3);
        reliability.process_normal(frame(2, 4, 3, 2, 1, 1, [1, 1]));
        assert!(outbound_rx.try_recv().is_err());
    }

    #[test]
    fn forwards_with_route_rewrites_and_requeues() {
        let (reliability, mut outbound_rx, _printer, routing) = setup(3);
        routing.on_keep_alive(id(4));
        reliability.process_normal(frame(2, 4, 3, 2, 1, 1, [1, 1]));
        let forwarded = outbound_rx.try_recv().unwrap();
        assert_eq!(forwarded.next_hop, id(4));
        assert_eq!(forwarded.previous_hop, id(3));
    }

    #[test]
    fn duplicate_forward_is_dropped() {
        let (reliability, mut outbound_rx, _printer, routing) = setup(3);
        routing.on_keep_alive(id(4));
        reliability.process_normal(frame(2, 4, 3, 2, 1, 2, [7, 7]));
        outbound_rx.try_recv().unwrap();
        reliability.process_normal(frame(2, 4, 3, 2, 1, 2, [7, 7]));
        assert!(outbound_rx.try_recv().is_err());
    }

    #[test]
    fn distinct_sequence_in_same_series_is_not_treated_as_duplicate() {
        let (reliability, mut outbound_rx, _printer, routing) = setup(3);
        routing.on_keep_alive(id(4));
        reliability.process_normal(frame(2, 4, 3, 2, 1, 2, [7, 7]));
        outbound_rx.try_recv().unwrap();
        reliability.process_normal(frame(2, 4, 3, 2, 2, 2, [7, 7]));
        outbound_rx.try_recv().unwrap();
    }

    #[tokio::test]
    async fn on_ack_only_matches_own_id() {
        let (reliability, _outbound_rx, _printer, _routing) = setup(5);
        *reliability.in_flight_target.lock().unwrap() = true;
        reliability.on_ack(id(9));
        assert!(*reliability.in_flight_target.lock().unwrap());
        reliability.on_ack(id(5));
        assert!(!*reliability.in_flight_target.lock().unwrap());
    }
}
