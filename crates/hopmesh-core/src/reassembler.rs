//! # Reassembler (Printer)
//!
//! Reconstructs chunked messages per originating sender and hands completed
//! text to an injectable [`Printer`] sink — the design note in §9 calls for
//! decoupling "global colored printing" behind exactly this kind of seam.

use std::collections::HashMap;
use std::sync::Mutex;

use hopmesh_wire::{NodeId, UnicastFrame};

/// Delivery sink for completed messages. A console/TUI front-end implements
/// this to render with color; tests implement it to assert on output.
pub trait Printer: Send + Sync + std::fmt::Debug {
    fn deliver(&self, source: NodeId, message: String);
}

/// Prints to stdout without any of the color/formatting concerns, which live
/// in the CLI front-end instead.
#[derive(Debug)]
pub struct StdoutPrinter;

impl Printer for StdoutPrinter {
    fn deliver(&self, source: NodeId, message: String) {
        println!("Message from {source}: {message}");
    }
}

#[derive(Default, Debug)]
struct PerSender {
    expected_seq: u8,
    buffer: Vec<u8>,
    total: u8,
    last_nonce: Option<[u8; 2]>,
}

/// Per-(sender) reassembly state. One `Reassembler` per node.
#[derive(Debug)]
pub struct Reassembler {
    senders: Mutex<HashMap<NodeId, PerSender>>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler { senders: Mutex::new(HashMap::new()) }
    }

    /// Accept one fragment already confirmed to be addressed to us.
    pub fn accept(&self, frame: &UnicastFrame, printer: &dyn Printer) {
        let mut senders = self.senders.lock().unwrap();
        let entry = senders.entry(frame.source).or_default();

        if frame.sequence != entry.expected_seq + 1 {
            tracing::debug!(
                source = %frame.source,
                got = frame.sequence,
                expected = entry.expected_seq + 1,
                "dropping out-of-sequence fragment"
            );
            return;
        }

        if frame.sequence == 1 {
            entry.buffer = Vec::with_capacity(23 * frame.fragment_count as usize);
            entry.total = frame.fragment_count;
        }
        entry.buffer.extend_from_slice(&frame.payload);
        entry.expected_seq = frame.sequence;

        if frame.sequence == entry.total {
            if entry.last_nonce != Some(frame.nonce) {
                let message = String::from_utf8_lossy(&entry.buffer).into_owned();
                entry.last_nonce = Some(frame.nonce);
                entry.expected_seq = 0;
                printer.deliver(frame.source, message);
            } else {
                tracing::debug!(source = %frame.source, "suppressing duplicate completed message");
                entry.expected_seq = 0;
            }
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
