//! hopmesh node daemon.
//!
//! Connects to the framing server over TCP (or an in-process loopback under
//! `--simulate`, for exercising the console without a server) and runs the
//! node to completion.

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use hopmesh_core::medium::{loopback_pair, Medium, MediumCommand, StreamMedium};
use hopmesh_core::reassembler::StdoutPrinter;
use hopmesh_core::NodeError;
use hopmesh_wire::NodeId;

#[derive(Parser, Debug)]
#[command(name = "hopmesh", about = "Multi-hop ad-hoc chat node")]
struct Cli {
    /// Framing server host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Framing server port.
    #[arg(long, default_value_t = 7000)]
    port: u16,

    /// 24-bit radio frequency to request via CONNECT, if the medium needs one.
    #[arg(long)]
    frequency: Option<u32>,

    /// Path to a file holding the medium's auth token.
    #[arg(long)]
    token_file: Option<String>,

    /// Run against an in-process loopback instead of dialing a real medium.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Skip address self-assignment and use this id instead. Test-only.
    #[arg(long)]
    force_id: Option<u8>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let force_id = cli
        .force_id
        .map(|raw| NodeId::new(raw).ok_or(NodeError::InvalidForceId(raw)))
        .transpose()?;

    let (commands, events) = if cli.simulate {
        tracing::info!("running against an in-process loopback medium");
        let (mine, _unattached_peer) = loopback_pair();
        (mine.commands, mine.events)
    } else {
        tracing::info!(host = %cli.host, port = cli.port, "dialing medium");
        let stream = StreamMedium::connect(&cli.host, cli.port)
            .await
            .map_err(NodeError::Medium)?;
        let mut medium = StreamMedium::new();
        let commands = medium.commands();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Err(e) = medium.run(stream, events_tx).await {
                tracing::error!("medium connection failed: {e}");
            }
        });

        if let Some(frequency) = cli.frequency {
            let _ = commands.send(MediumCommand::Connect { frequency });
        }
        if let Some(path) = &cli.token_file {
            let token = tokio::fs::read(path).await?;
            let _ = commands.send(MediumCommand::Token(token.into()));
        }
        (commands, events_rx)
    };

    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stdin_tx.send(line).is_err() {
                break;
            }
        }
    });

    hopmesh_core::node::run(force_id, commands, events, Arc::new(StdoutPrinter), stdin_rx).await
}
