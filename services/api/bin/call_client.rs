//! Call-leg Test Client
//!
//! Connects to a running relay as if it were the telephony provider, streams
//! a raw audio file in real-time sized frames, and records whatever audio the
//! relay sends back.

use anyhow::Context;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::{path::PathBuf, time::Duration};
use tokio::{fs, io::AsyncWriteExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Streams a raw audio file into the call relay", long_about = None)]
struct Args {
    /// Relay WebSocket URL
    #[arg(short, long, default_value = "ws://localhost:8766")]
    url: String,

    /// Raw audio file to send (already in the call-leg format)
    #[arg(short, long)]
    input: PathBuf,

    /// File that receives every binary frame sent back by the relay
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Bytes per outgoing frame (320 is 20 ms of 8 kHz PCM16)
    #[arg(long, default_value_t = 320)]
    frame_bytes: usize,

    /// Milliseconds between outgoing frames
    #[arg(long, default_value_t = 20)]
    frame_ms: u64,

    /// Reconnect this many seconds after the relay closes the call
    #[arg(long)]
    reconnect_secs: Option<u64>,
}

#[derive(Debug, Default)]
struct CallStats {
    frames_sent: usize,
    bytes_received: usize,
    text_frames: usize,
}

async fn run_call(args: &Args, audio: &[u8]) -> anyhow::Result<CallStats> {
    let (ws, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", args.url))?;
    info!(url = %args.url, "Connected to relay");
    let (mut tx, mut rx) = ws.split();

    let mut output = match &args.output {
        Some(path) => Some(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => None,
    };

    let mut stats = CallStats::default();
    let mut chunks = audio.chunks(args.frame_bytes.max(1));
    let mut pacing = tokio::time::interval(Duration::from_millis(args.frame_ms.max(1)));
    let mut sending = true;

    loop {
        tokio::select! {
            _ = pacing.tick(), if sending => match chunks.next() {
                Some(chunk) => {
                    tx.send(Message::Binary(chunk.to_vec().into())).await?;
                    stats.frames_sent += 1;
                }
                None => {
                    info!(frames = stats.frames_sent, "Finished streaming input");
                    sending = false;
                }
            },
            msg = rx.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    stats.bytes_received += data.len();
                    if let Some(file) = output.as_mut() {
                        file.write_all(&data).await?;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    stats.text_frames += 1;
                    info!(text = %text.as_str(), "Received text frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Relay closed the call");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                None => break,
            },
        }
    }

    if let Some(file) = output.as_mut() {
        file.flush().await?;
    }
    Ok(stats)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    let args = Args::parse();

    let audio = fs::read(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    info!(file = %args.input.display(), bytes = audio.len(), "Loaded input audio");

    loop {
        match run_call(&args, &audio).await {
            Ok(stats) => info!(?stats, "Call finished"),
            Err(e) => error!(error = %e, "Call failed"),
        }
        let Some(secs) = args.reconnect_secs else {
            break;
        };
        info!(secs, "Reconnecting...");
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
    Ok(())
}
