//! # Node orchestrator
//!
//! Wires every subsystem together and drives the startup state machine from
//! the design notes: `AddressPending` (self-assignment in progress) →
//! `RoutingBootstrapping` (waiting for ≥3 routing entries) → `Ready` (user
//! input is consumed). The receive-dispatch loop itself does not need to
//! branch on state: routing and reliability live behind a [`OnceCell`] that
//! is empty until addressing completes, so link-state/unicast traffic
//! arriving early is simply dropped rather than requiring an explicit guard,
//! and [`Addressing::handle_incoming`] already no-ops before `own_id` is
//! published.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, OnceCell};

use hopmesh_wire::{AddressingFrame, DataShort, Frame, NodeId};

use crate::addressing::Addressing;
use crate::chunker::Chunker;
use crate::console::{self, Command};
use crate::mac::{BackgroundFrame, Mac, OutboundFrame};
use crate::medium::{MediumCommand, MediumEvent};
use crate::reassembler::{Printer, Reassembler};
use crate::reliability::Reliability;
use crate::routing::Routing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    AddressPending,
    RoutingBootstrapping,
    Ready,
}

pub struct Node {
    state: Mutex<NodeState>,
    addressing: Arc<Addressing>,
    addressing_inbound: OnceCell<mpsc::UnboundedSender<AddressingFrame>>,
    mac: Arc<Mac>,
    routing: OnceCell<Arc<Routing>>,
    reliability: OnceCell<Arc<Reliability>>,
    chunker: OnceCell<Arc<Chunker>>,
}

impl Node {
    pub fn state(&self) -> NodeState {
        *self.state.lock().unwrap()
    }

    pub fn own_id(&self) -> NodeId {
        self.addressing.own_id()
    }

    /// Handles one decoded frame off the medium. Always safe to call,
    /// regardless of startup phase.
    fn dispatch_frame(&self, frame: Frame) {
        match frame {
            Frame::Addressing(af) => self.dispatch_addressing(af),
            Frame::LinkState(ls) => {
                if let Some(routing) = self.routing.get() {
                    routing.on_link_state(ls.source, &ls.entries);
                }
            }
            Frame::Unicast(uf) => {
                if uf.next_hop != self.own_id() {
                    return;
                }
                // The previous hop is always a direct neighbor in a
                // single-hop-at-a-time medium, so any frame from it is as
                // good a liveness signal as a keep-alive.
                if let Some(routing) = self.routing.get() {
                    routing.on_keep_alive(uf.previous_hop);
                }
                if let Some(reliability) = self.reliability.get() {
                    reliability.process_normal(uf);
                }
            }
        }
    }

    fn dispatch_addressing(&self, af: AddressingFrame) {
        // Always offered to the addressing-phase listener; harmless once its
        // receiver is dropped after self-assignment completes.
        let _ = self.addressing_inbound.get().map(|tx| tx.send(af.clone()));
        if let Some(reply) = self.addressing.handle_incoming(af) {
            self.mac.enqueue_background(BackgroundFrame::Data(Frame::Addressing(reply)));
        }
    }

    fn dispatch_short(&self, short: DataShort) {
        match short {
            DataShort::Ack(id) => {
                if let Some(reliability) = self.reliability.get() {
                    reliability.on_ack(id);
                }
            }
            DataShort::KeepAlive(id) => {
                if let Some(routing) = self.routing.get() {
                    routing.on_keep_alive(id);
                }
            }
        }
    }
}

/// Runs a node to completion (until the medium sends END or closes).
///
/// `force_id` bypasses address self-assignment entirely; it exists only for
/// test harnesses that want deterministic ids (§10.4).
pub async fn run(
    force_id: Option<NodeId>,
    commands: mpsc::UnboundedSender<MediumCommand>,
    mut events: mpsc::UnboundedReceiver<MediumEvent>,
    printer: Arc<dyn Printer>,
    mut stdin_lines: mpsc::UnboundedReceiver<String>,
) -> anyhow::Result<()> {
    let (egress_tx, mut egress_rx) = mpsc::unbounded_channel();
    let mac = Arc::new(Mac::new(egress_tx));

    {
        let mac = mac.clone();
        tokio::spawn(async move { mac.run_background_sender().await });
    }
    {
        let mac = mac.clone();
        tokio::spawn(async move { mac.run_ack_sender().await });
    }
    {
        let mac = mac.clone();
        tokio::spawn(async move { mac.run_normal_sender().await });
    }
    {
        let commands = commands.clone();
        tokio::spawn(async move {
            while let Some(frame) = egress_rx.recv().await {
                let command = outbound_to_command(frame);
                if commands.send(command).is_err() {
                    break;
                }
            }
        });
    }

    let (addressing_tx, mut addressing_rx) = mpsc::unbounded_channel::<AddressingFrame>();
    let node = Arc::new(Node {
        state: Mutex::new(NodeState::AddressPending),
        addressing: Arc::new(Addressing::new()),
        addressing_inbound: OnceCell::new_with(Some(addressing_tx)),
        mac: mac.clone(),
        routing: OnceCell::new(),
        reliability: OnceCell::new(),
        chunker: OnceCell::new(),
    });

    // The receive-dispatch loop (concurrent activity 1/2): demultiplexes
    // every medium event for the lifetime of the node.
    let dispatch_node = node.clone();
    let dispatch = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MediumEvent::ChannelFree(free) => dispatch_node.mac.channel_state(free),
                MediumEvent::Data(frame) => dispatch_node.dispatch_frame(frame),
                MediumEvent::DataShort(short) => dispatch_node.dispatch_short(short),
                MediumEvent::End => break,
                MediumEvent::Hello
                | MediumEvent::Sending
                | MediumEvent::DoneSending
                | MediumEvent::TokenAccepted
                | MediumEvent::TokenRejected => {
                    tracing::debug!(?event, "medium control event");
                }
            }
        }
    });

    // --- AddressPending ---
    let own_id = if let Some(forced) = force_id {
        tracing::warn!(id = %forced, "address self-assignment bypassed by --force-id");
        forced
    } else {
        node.addressing.run(&mac, &mut addressing_rx).await
    };
    drop(addressing_rx);

    let (background_tx, mut background_rx) = mpsc::unbounded_channel();
    let routing = Arc::new(Routing::new(own_id, background_tx));
    node.routing.set(routing.clone()).expect("routing set once");
    {
        let mac = mac.clone();
        tokio::spawn(async move {
            while let Some(link_state) = background_rx.recv().await {
                mac.enqueue_background(BackgroundFrame::Data(Frame::LinkState(link_state)));
            }
        });
    }

    let (keep_alive_tx, mut keep_alive_rx) = mpsc::unbounded_channel();
    {
        let mac = mac.clone();
        tokio::spawn(async move {
            while let Some(id) = keep_alive_rx.recv().await {
                mac.enqueue_background(BackgroundFrame::Short(DataShort::KeepAlive(id)));
            }
        });
    }
    {
        let routing = routing.clone();
        tokio::spawn(async move { routing.run_keep_alive_ticker(keep_alive_tx).await });
    }
    {
        let routing = routing.clone();
        tokio::spawn(async move { routing.run_periodic_broadcaster().await });
    }

    let reassembler = Arc::new(Reassembler::new());
    let (reliability, outbound_rx) =
        Reliability::new(own_id, mac.clone(), routing.clone(), reassembler, printer);
    let reliability = Arc::new(reliability);
    node.reliability.set(reliability.clone()).expect("reliability set once");
    {
        let reliability = reliability.clone();
        tokio::spawn(async move { reliability.run_outbound(outbound_rx).await });
    }

    let chunker =
        Arc::new(Chunker::new(own_id, routing.clone(), reliability.outbound_sender()));
    node.chunker.set(chunker.clone()).expect("chunker set once");

    // --- RoutingBootstrapping ---
    *node.state.lock().unwrap() = NodeState::RoutingBootstrapping;
    routing.run_bootstrap().await;
    *node.state.lock().unwrap() = NodeState::Ready;
    tracing::info!(id = %own_id, "node ready");

    // --- Ready: user input loop ---
    while let Some(line) = stdin_lines.recv().await {
        match console::parse(&line) {
            Ok(Command::Whisper { destination, text }) => chunker.unicast(destination, text.as_bytes()),
            Ok(Command::Broadcast { text }) => chunker.broadcast(text.as_bytes()),
            Ok(Command::Online) => {
                let mut ids: Vec<NodeId> = routing.neighbors().into_iter().collect();
                ids.sort();
                println!("ONLINE: {ids:?}");
            }
            Err(invalid) => println!("invalid command: {}", invalid.0),
        }
    }

    dispatch.abort();
    Ok(())
}

fn outbound_to_command(frame: OutboundFrame) -> MediumCommand {
    match frame {
        OutboundFrame::Unicast(uf) => MediumCommand::Data(Frame::Unicast(uf)),
        OutboundFrame::Background(BackgroundFrame::Data(frame)) => MediumCommand::Data(frame),
        OutboundFrame::Background(BackgroundFrame::Short(short)) => MediumCommand::DataShort(short),
        OutboundFrame::AckShort(short) => MediumCommand::DataShort(short),
    }
}
