//! LoRa serial reader/writer (part of C5), bridging the UART to the frame
//! codec's streaming parser as two async tasks over `tokio_serial`: one
//! reads and feeds the frame parser, the other sends with retry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::frame::{Frame, FrameCodecStats, StreamingParser};
use crate::router::LoraSend;

pub struct SerialLink {
    port: String,
    baud: u32,
    write_tx: mpsc::Sender<Vec<u8>>,
}

pub struct LoraResponder {
    write_tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl LoraSend for LoraResponder {
    async fn send_response(&self, address: u16, channel: u8, body: String) -> Result<()> {
        let wire = crate::frame::encode_response(address, channel, &body);
        self.write_tx
            .send(wire)
            .await
            .context("serial writer task stopped")
    }
}

impl SerialLink {
    /// Opens the link and spawns the reader/writer tasks. Returns a handle
    /// for sending responses and a receiver yielding decoded frames.
    pub fn start(
        port: String,
        baud: u32,
        stats: Arc<AsyncMutex<FrameCodecStats>>,
        cancel: CancellationToken,
    ) -> (Arc<LoraResponder>, mpsc::Receiver<Frame>, tokio::task::JoinHandle<()>) {
        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(64);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(256);

        let handle = tokio::spawn(run_serial_loop(port, baud, write_rx, frame_tx, stats, cancel));
        (Arc::new(LoraResponder { write_tx }), frame_rx, handle)
    }
}

async fn run_serial_loop(
    port: String,
    baud: u32,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    frame_tx: mpsc::Sender<Frame>,
    stats: Arc<AsyncMutex<FrameCodecStats>>,
    cancel: CancellationToken,
) {
    let mut parser = StreamingParser::new();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let mut stream = match tokio_serial::new(&port, baud).open_native_async() {
            Ok(s) => s,
            Err(err) => {
                error!(error = %err, port = %port, "failed to open LoRa serial port, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                }
                continue;
            }
        };

        let mut read_buf = [0u8; 256];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                to_write = write_rx.recv() => {
                    let Some(bytes) = to_write else { return };
                    if let Err(err) = stream.write_all(&bytes).await {
                        warn!(error = %err, "serial write failed");
                        break;
                    }
                    stats.lock().await.messages_sent += 1;
                }
                read = stream.read(&mut read_buf) => {
                    match read {
                        Ok(0) => continue,
                        Ok(n) => {
                            parser.feed(&read_buf[..n]);
                            while let Some(result) = parser.poll() {
                                match result {
                                    Ok(frame) => {
                                        if frame_tx.send(frame).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(err) => debug!(error = %err, "dropped malformed LoRa frame"),
                                }
                            }
                            *stats.lock().await = parser.stats;
                        }
                        Err(err) => {
                            warn!(error = %err, "serial read error, reopening port");
                            break;
                        }
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
