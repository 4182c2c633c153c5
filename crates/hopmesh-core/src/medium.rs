//! # Medium
//!
//! The framing server is reached over a byte stream (TCP in production, an
//! in-process loopback for tests) using a small tag protocol: every message
//! in either direction starts with a one-byte tag, some tags carry a length
//! prefix, and DATA/DATA_SHORT payloads on the wire are themselves decoded
//! by [`hopmesh_wire`].
//!
//! Outbound tags: `0x03` DATA, `0x06` DATA_SHORT, `0x09` CONNECT (24-bit
//! frequency), `0x0A` TOKEN.
//!
//! Inbound tags: `0x01` FREE, `0x02` BUSY, `0x03` DATA, `0x04` SENDING,
//! `0x05` DONE_SENDING, `0x06` DATA_SHORT, `0x08` END, `0x09` HELLO, `0x0A`
//! TOKEN_ACCEPTED, `0x0B` TOKEN_REJECTED.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use hopmesh_wire::{DataShort, Frame};

const TAG_FREE: u8 = 0x01;
const TAG_BUSY: u8 = 0x02;
const TAG_DATA: u8 = 0x03;
const TAG_SENDING: u8 = 0x04;
const TAG_DONE_SENDING: u8 = 0x05;
const TAG_DATA_SHORT: u8 = 0x06;
const TAG_END: u8 = 0x08;
const TAG_HELLO: u8 = 0x09;
const TAG_TOKEN_ACCEPTED: u8 = 0x0A;
const TAG_TOKEN_REJECTED: u8 = 0x0B;
// Same byte values as their inbound counterparts above but distinct tags in
// the outbound direction: 0x09 means CONNECT, 0x0A means TOKEN.
const TAG_CONNECT: u8 = 0x09;
const TAG_TOKEN: u8 = 0x0A;

/// An event arriving from the medium, demultiplexed for the receive
/// dispatcher (concurrent activity 1/2 in the design).
#[derive(Debug)]
pub enum MediumEvent {
    Hello,
    ChannelFree(bool),
    Data(Frame),
    Sending,
    DoneSending,
    DataShort(DataShort),
    TokenAccepted,
    TokenRejected,
    End,
}

/// What a node can hand to the medium for transmission.
#[derive(Debug, Clone)]
pub enum MediumCommand {
    Data(Frame),
    DataShort(DataShort),
    Connect { frequency: u32 },
    Token(Bytes),
}

/// A transport to the framing server: split into an event stream and a
/// command sink so the caller can hold both ends independently.
pub trait Medium {
    fn commands(&self) -> mpsc::UnboundedSender<MediumCommand>;
}

/// Runs the tag protocol over any `AsyncRead + AsyncWrite`, translating
/// [`MediumCommand`]s into outbound bytes and inbound bytes into
/// [`MediumEvent`]s.
pub struct StreamMedium {
    command_tx: mpsc::UnboundedSender<MediumCommand>,
    command_rx: Option<mpsc::UnboundedReceiver<MediumCommand>>,
}

impl StreamMedium {
    pub fn new() -> StreamMedium {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        StreamMedium { command_tx, command_rx: Some(command_rx) }
    }

    pub async fn connect(host: &str, port: u16) -> io::Result<TcpStream> {
        TcpStream::connect((host, port)).await
    }

    /// Runs both halves of the tag protocol to completion: reads drive
    /// `events`, writes drain the command channel. Returns once the stream
    /// closes or an END tag is observed.
    pub async fn run<S>(
        &mut self,
        stream: S,
        events: mpsc::UnboundedSender<MediumEvent>,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut command_rx = self.command_rx.take().expect("run must only be called once");

        loop {
            tokio::select! {
                tagged = read_event(&mut reader) => {
                    match tagged? {
                        Some(event) => {
                            let is_end = matches!(event, MediumEvent::End);
                            if events.send(event).is_err() || is_end {
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }
                command = command_rx.recv() => {
                    match command {
                        Some(command) => write_command(&mut write_half, command).await?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

impl Default for StreamMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl Medium for StreamMedium {
    fn commands(&self) -> mpsc::UnboundedSender<MediumCommand> {
        self.command_tx.clone()
    }
}

async fn read_event<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> io::Result<Option<MediumEvent>> {
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    let event = match tag {
        TAG_HELLO => MediumEvent::Hello,
        TAG_FREE => MediumEvent::ChannelFree(true),
        TAG_BUSY => MediumEvent::ChannelFree(false),
        TAG_SENDING => MediumEvent::Sending,
        TAG_DONE_SENDING => MediumEvent::DoneSending,
        TAG_END => MediumEvent::End,
        TAG_TOKEN_ACCEPTED => MediumEvent::TokenAccepted,
        TAG_TOKEN_REJECTED => MediumEvent::TokenRejected,
        TAG_DATA => {
            let len = reader.read_u8().await? as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            let frame = Frame::decode(&buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            MediumEvent::Data(frame)
        }
        TAG_DATA_SHORT => {
            let len = reader.read_u8().await? as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            let short = DataShort::decode(&buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            MediumEvent::DataShort(short)
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown medium tag 0x{other:02x}"),
            ))
        }
    };
    Ok(Some(event))
}

async fn write_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    command: MediumCommand,
) -> io::Result<()> {
    let mut buf = BytesMut::new();
    match command {
        MediumCommand::Data(frame) => {
            let encoded = frame.encode();
            buf.put_u8(TAG_DATA);
            buf.put_u8(encoded.len() as u8);
            buf.extend_from_slice(&encoded);
        }
        MediumCommand::DataShort(short) => {
            let encoded = short.encode();
            buf.put_u8(TAG_DATA_SHORT);
            buf.put_u8(encoded.len() as u8);
            buf.extend_from_slice(&encoded);
        }
        MediumCommand::Connect { frequency } => {
            buf.put_u8(TAG_CONNECT);
            buf.put_u8(((frequency >> 16) & 0xFF) as u8);
            buf.put_u8(((frequency >> 8) & 0xFF) as u8);
            buf.put_u8((frequency & 0xFF) as u8);
        }
        MediumCommand::Token(token) => {
            buf.put_u8(TAG_TOKEN);
            buf.put_u8(token.len() as u8);
            buf.extend_from_slice(&token);
        }
    }
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// An in-process loopback: two nodes wired directly together with no real
/// socket, for deterministic integration tests (§10.5).
pub struct LoopbackMedium {
    pub events: mpsc::UnboundedReceiver<MediumEvent>,
    pub commands: mpsc::UnboundedSender<MediumCommand>,
}

impl Medium for LoopbackMedium {
    fn commands(&self) -> mpsc::UnboundedSender<MediumCommand> {
        self.commands.clone()
    }
}

/// Builds a pair of loopback mediums whose `Data`/`DataShort` commands on
/// one side appear as events on the other, as if carried by the external
/// framing server's channel-free broadcast semantics.
pub fn loopback_pair() -> (LoopbackMedium, LoopbackMedium) {
    let (a_events_tx, a_events_rx) = mpsc::unbounded_channel();
    let (b_events_tx, b_events_rx) = mpsc::unbounded_channel();
    let (a_cmd_tx, mut a_cmd_rx) = mpsc::unbounded_channel();
    let (b_cmd_tx, mut b_cmd_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(command) = a_cmd_rx.recv().await {
            if let Some(event) = command_to_event(command) {
                if b_events_tx.send(event).is_err() {
                    break;
                }
            }
        }
    });
    tokio::spawn(async move {
        while let Some(command) = b_cmd_rx.recv().await {
            if let Some(event) = command_to_event(command) {
                if a_events_tx.send(event).is_err() {
                    break;
                }
            }
        }
    });

    (
        LoopbackMedium { events: a_events_rx, commands: a_cmd_tx },
        LoopbackMedium { events: b_events_rx, commands: b_cmd_tx },
    )
}

fn command_to_event(command: MediumCommand) -> Option<MediumEvent> {
    match command {
        MediumCommand::Data(frame) => Some(MediumEvent::Data(frame)),
        MediumCommand::DataShort(short) => Some(MediumEvent::DataShort(short)),
        MediumCommand::Connect { .. } | MediumCommand::Token(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopmesh_wire::NodeId;

    #[tokio::test]
    async fn loopback_carries_data_short_between_both_sides() {
        let (mut a, b) = loopback_pair();
        b.commands
            .send(MediumCommand::DataShort(DataShort::Ack(NodeId::new(5).unwrap())))
            .unwrap();
        match a.events.recv().await.unwrap() {
            MediumEvent::DataShort(DataShort::Ack(id)) => assert_eq!(id, NodeId::new(5).unwrap()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn write_command_token_uses_tag_0a() {
        // Exercised indirectly via write_command in integration coverage;
        // this just pins the tag constant against accidental renumbering.
        assert_eq!(TAG_TOKEN_ACCEPTED, 0x0A);
        assert_eq!(TAG_TOKEN_REJECTED, 0x0B);
    }
}
