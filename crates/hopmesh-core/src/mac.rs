//! # MAC arbitration
//!
//! Serializes outbound frames onto the shared half-duplex medium: carrier
//! sense against a channel busy/free signal, binary exponential backoff for
//! normal (user data) traffic, and a priority split across three concurrent
//! senders — ACK, normal, and background.
//!
//! MAC never reports failure upward (§7): a frame that never gets ACKed is
//! retried indefinitely by the normal sender.

use std::sync::Mutex;
use std::time::Duration;

use rand::RngExt;
use tokio::sync::{mpsc, watch, Notify};

use hopmesh_wire::{DataShort, Frame, UnicastFrame};

const INITIAL_BACKOFF: Duration = Duration::from_millis(3000);
const MAX_BACKOFF_CAP: Duration = Duration::from_millis(15000);
const BACKOFF_STEP: Duration = Duration::from_millis(1000);

/// A frame handed to the medium by one of the three MAC senders.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Unicast(UnicastFrame),
    Background(BackgroundFrame),
    AckShort(DataShort),
}

/// Anything the background sender is allowed to carry: link-state,
/// addressing, and keep-alive frames.
#[derive(Debug, Clone)]
pub enum BackgroundFrame {
    Data(Frame),
    Short(DataShort),
}

#[derive(Debug)]
struct Backoff {
    /// Whether the normal sender currently holds the send-grant for a fresh
    /// transmission (as opposed to a retransmit after an ACK timeout).
    can_send: bool,
    max_backoff: Duration,
}

impl Backoff {
    fn fresh() -> Backoff {
        Backoff { can_send: true, max_backoff: INITIAL_BACKOFF }
    }
}

/// Shared MAC state and the three egress queues.
#[derive(Debug)]
pub struct Mac {
    channel_free_tx: watch::Sender<bool>,
    channel_free_rx: watch::Receiver<bool>,
    backoff: Mutex<Backoff>,
    ack_notify: Notify,
    normal_tx: mpsc::UnboundedSender<UnicastFrame>,
    normal_rx: Mutex<Option<mpsc::UnboundedReceiver<UnicastFrame>>>,
    background_tx: mpsc::UnboundedSender<BackgroundFrame>,
    background_rx: Mutex<Option<mpsc::UnboundedReceiver<BackgroundFrame>>>,
    ack_tx: mpsc::UnboundedSender<DataShort>,
    ack_rx: Mutex<Option<mpsc::UnboundedReceiver<DataShort>>>,
    egress: mpsc::UnboundedSender<OutboundFrame>,
}

impl Mac {
    pub fn new(egress: mpsc::UnboundedSender<OutboundFrame>) -> Mac {
        let (channel_free_tx, channel_free_rx) = watch::channel(true);
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        let (background_tx, background_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        Mac {
            channel_free_tx,
            channel_free_rx,
            backoff: Mutex::new(Backoff::fresh()),
            ack_notify: Notify::new(),
            normal_tx,
            normal_rx: Mutex::new(Some(normal_rx)),
            background_tx,
            background_rx: Mutex::new(Some(background_rx)),
            ack_tx,
            ack_rx: Mutex::new(Some(ack_rx)),
            egress,
        }
    }

    /// Update the channel busy/free signal, as reported by the medium.
    pub fn channel_state(&self, free: bool) {
        let _ = self.channel_free_tx.send(free);
    }

    pub fn enqueue_ack(&self, ack: DataShort) {
        let _ = self.ack_tx.send(ack);
    }

    pub fn enqueue_background(&self, frame: BackgroundFrame) {
        let _ = self.background_tx.send(frame);
    }

    /// Signal that `frame` opens a brand new stop-and-wait series: clears any
    /// stale backoff state before handing it to the normal queue.
    pub fn arm_first(&self, frame: UnicastFrame) {
        *self.backoff.lock().unwrap() = Backoff::fresh();
        let _ = self.normal_tx.send(frame);
    }

    /// Hand the next fragment of an already-armed series to the normal queue.
    pub fn enqueue_normal(&self, frame: UnicastFrame) {
        let _ = self.normal_tx.send(frame);
    }

    /// The reliability layer confirms the in-flight normal frame was ACKed.
    pub fn ack_received(&self) {
        *self.backoff.lock().unwrap() = Backoff::fresh();
        self.ack_notify.notify_one();
    }

    async fn wait_until_free(&self) {
        let mut rx = self.channel_free_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Background sender: while the channel is free, pull the next
    /// background frame, jitter, then commit.
    pub async fn run_background_sender(&self) {
        let mut rx = self
            .background_rx
            .lock()
            .unwrap()
            .take()
            .expect("run_background_sender must only be spawned once");
        while let Some(frame) = rx.recv().await {
            self.wait_until_free().await;
            let jitter = Duration::from_millis(rand::rng().random_range(150..300));
            tokio::time::sleep(jitter).await;
            let _ = self.egress.send(OutboundFrame::Background(frame));
        }
    }

    /// ACK sender: waits 5s to let the sender listen, then emits.
    pub async fn run_ack_sender(&self) {
        let mut rx = self
            .ack_rx
            .lock()
            .unwrap()
            .take()
            .expect("run_ack_sender must only be spawned once");
        while let Some(ack) = rx.recv().await {
            tokio::time::sleep(Duration::from_millis(5000)).await;
            let _ = self.egress.send(OutboundFrame::AckShort(ack));
        }
    }

    /// Normal sender: stop-and-wait with exponential backoff, one fragment
    /// at a time, retried indefinitely until ACKed.
    pub async fn run_normal_sender(&self) {
        let mut rx = self
            .normal_rx
            .lock()
            .unwrap()
            .take()
            .expect("run_normal_sender must only be spawned once");

        while let Some(frame) = rx.recv().await {
            loop {
                self.wait_until_free().await;

                let (can_send, backoff_ceiling) = {
                    let b = self.backoff.lock().unwrap();
                    (b.can_send, b.max_backoff)
                };

                let delay_ms = if backoff_ceiling.is_zero() {
                    0
                } else {
                    rand::rng().random_range(0..backoff_ceiling.as_millis() as u64)
                };
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                self.wait_until_free().await;
                let _ = self.egress.send(OutboundFrame::Unicast(frame.clone()));

                let ack_wait = if can_send {
                    Duration::from_millis(rand::rng().random_range(4000..12000))
                } else {
                    Duration::from_millis(rand::rng().random_range(6000..15000))
                };

                tokio::select! {
                    _ = self.ack_notify.notified() => {
                        break;
                    }
                    _ = tokio::time::sleep(ack_wait) => {
                        let mut b = self.backoff.lock().unwrap();
                        b.can_send = false;
                        b.max_backoff = (b.max_backoff + BACKOFF_STEP).min(MAX_BACKOFF_CAP);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopmesh_wire::NodeId;

    fn frame() -> UnicastFrame {
        UnicastFrame {
            fragment_count: 1,
            next_hop: NodeId::new(2).unwrap(),
            source: NodeId::new(1).unwrap(),
            destination: NodeId::new(2).unwrap(),
            sequence: 1,
            previous_hop: NodeId::new(1).unwrap(),
            nonce: [1, 2],
            payload: bytes::Bytes::from_static(b"hi"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn normal_sender_retransmits_until_acked() {
        let (egress_tx, mut egress_rx) = mpsc::unbounded_channel();
        let mac = Mac::new(egress_tx);
        mac.arm_first(frame());

        let mac_ref: &'static Mac = Box::leak(Box::new(mac));
        tokio::spawn(mac_ref.run_normal_sender());

        // First transmission arrives quickly (bounded by max_backoff=3000ms).
        let first = egress_rx.recv().await.unwrap();
        assert!(matches!(first, OutboundFrame::Unicast(_)));

        // No ack: it must retransmit after the ack-wait timeout.
        let second = tokio::time::timeout(Duration::from_secs(20), egress_rx.recv())
            .await
            .expect("expected a retransmission")
            .unwrap();
        assert!(matches!(second, OutboundFrame::Unicast(_)));

        mac_ref.ack_received();
        // Queue is now empty; no further sends should occur promptly.
        let res = tokio::time::timeout(Duration::from_secs(3), egress_rx.recv()).await;
        assert!(res.is_err(), "no more frames expected after ack with empty queue");
    }

    #[tokio::test]
    async fn busy_channel_blocks_background_sender() {
        let (egress_tx, mut egress_rx) = mpsc::unbounded_channel();
        let mac = Mac::new(egress_tx);
        mac.channel_state(false);
        mac.enqueue_background(BackgroundFrame::Short(DataShort::KeepAlive(
            NodeId::new(3).unwrap(),
        )));

        let mac_ref: &'static Mac = Box::leak(Box::new(mac));
        tokio::spawn(mac_ref.run_background_sender());

        let res = tokio::time::timeout(Duration::from_millis(200), egress_rx.recv()).await;
        assert!(res.is_err(), "must not send while channel is busy");

        mac_ref.channel_state(true);
        let sent = tokio::time::timeout(Duration::from_secs(1), egress_rx.recv())
            .await
            .expect("should send once channel frees up");
        assert!(sent.is_some());
    }
}
