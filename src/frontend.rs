//! Frontend listener: accepts clients, frames their requests, validates
//! supported commands, and forwards them to the pool — then reassembles
//! replies into per-client FIFO order even when requests pipeline across
//! different backends.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::stream::FuturesOrdered;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, warn};

use crate::pool::DispatchRequest;
use crate::resp::{self, FrameScan, KeyPos};
use crate::stats::SharedStats;

const UNSUPPORTED_COMMANDS: &[&str] = &[
    "MULTI",
    "EXEC",
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "PSUBSCRIBE",
    "PUNSUBSCRIBE",
    "WATCH",
    "DISCARD",
];

/// Commands that take one key per argument (`CMD key [key ...]`); rejected
/// once more than one key is given, since a multi-key form can span shards.
const MULTI_KEY_ONE_PER_ARG: &[&str] = &["MGET", "SUNION", "SINTER", "SDIFF", "PFCOUNT"];

/// Commands that take alternating key/value pairs (`CMD key value [key value ...]`).
const MULTI_KEY_PAIRS: &[&str] = &["MSET", "MSETNX"];

/// Commands that take a destination plus one or more source keys
/// (`CMD dest key [key ...]`); only a single source key is allowed.
const MULTI_KEY_DEST_PLUS_SOURCES: &[&str] = &["SUNIONSTORE", "SINTERSTORE", "SDIFFSTORE", "PFMERGE"];

/// True if `cmd_upper`'s multi-key variant is in play: a command whose
/// single-key form is fine to route, but whose multi-key form would need to
/// fan out across shards, which this proxy does not support (spec.md §6).
fn is_unsupported_multi_key(cmd_upper: &str, args: &[Vec<u8>]) -> bool {
    if MULTI_KEY_ONE_PER_ARG.contains(&cmd_upper) {
        return args.len() > 2;
    }
    if MULTI_KEY_PAIRS.contains(&cmd_upper) {
        return args.len() > 3;
    }
    if MULTI_KEY_DEST_PLUS_SOURCES.contains(&cmd_upper) {
        return args.len() > 3;
    }
    false
}

/// The handful of per-listener settings a client reader needs that don't
/// belong to the pool itself.
#[derive(Clone)]
pub struct FrontendConfig {
    pub hash_tag: Option<(u8, u8)>,
    pub dispatch_tx: mpsc::Sender<DispatchRequest>,
    pub stats: Arc<SharedStats>,
}

/// What to do with one parsed client frame before it reaches the pool.
enum Validated {
    Forward { frame: Vec<u8>, key: KeyPos },
    Reject(Vec<u8>),
}

fn validate_command(frame: &[u8], hash_tag: Option<(u8, u8)>) -> Result<Validated, Vec<u8>> {
    let args = resp::split_args(frame).map_err(|_| resp::proxy_error("Invalid redis protocol"))?;
    let Some(cmd) = args.first() else {
        return Ok(Validated::Reject(resp::proxy_error("Unsupported command")));
    };
    let cmd_upper = String::from_utf8_lossy(cmd).to_uppercase();

    if UNSUPPORTED_COMMANDS.contains(&cmd_upper.as_str()) {
        return Ok(Validated::Reject(resp::proxy_error("Unsupported command")));
    }

    if is_unsupported_multi_key(&cmd_upper, &args) {
        return Ok(Validated::Reject(resp::proxy_error("Unsupported command")));
    }

    if cmd_upper == "EVAL" {
        let numkeys = args
            .get(2)
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse::<i64>().ok());
        if numkeys != Some(1) {
            return Ok(Validated::Reject(resp::proxy_error("Scripts must have 1 key")));
        }
    }

    Ok(Validated::Forward {
        frame: frame.to_vec(),
        key: resp::extract_key(&args, hash_tag),
    })
}

/// Accepts clients on `listen_port` for the lifetime of the listener task;
/// cancelled by dropping the returned `TcpListener` when `SWITCHCONFIG` or
/// `SHUTDOWN` removes this port.
pub async fn run_listener(
    listen_port: u16,
    config: FrontendConfig,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
    let config = Arc::new(config);
    loop {
        let (socket, peer) = listener.accept().await?;
        let config = config.clone();
        config.stats.accepted_clients.fetch_add(1, Ordering::Relaxed);
        config.stats.client_connections.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            if let Err(error) = handle_client(socket, config.clone()).await {
                warn!(%peer, %error, "client connection closed with error");
            }
            config.stats.client_connections.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

#[instrument(skip(socket, config))]
async fn handle_client(mut socket: TcpStream, config: Arc<FrontendConfig>) -> std::io::Result<()> {
    socket.set_nodelay(true).ok();
    let (mut reader, mut writer) = socket.split();

    let mut read_buf = bytes::BytesMut::with_capacity(8192);
    let mut in_flight: FuturesOrdered<oneshot::Receiver<Vec<u8>>> = FuturesOrdered::new();

    loop {
        tokio::select! {
            biased;

            Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                let bytes = result.unwrap_or_else(|_| resp::proxy_error("Not connected"));
                config.stats.send_client_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                writer.write_all(&bytes).await?;
            }

            read_result = reader.read_buf(&mut read_buf) => {
                let n = read_result?;
                if n == 0 {
                    break;
                }
                config.stats.recv_client_bytes.fetch_add(n as u64, Ordering::Relaxed);
                while let FrameScan::Complete(end) = resp::scan_frame(&read_buf)
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad frame"))?
                {
                    let frame = read_buf.split_to(end);
                    match validate_command(&frame, config.hash_tag) {
                        Ok(Validated::Reject(err)) => {
                            config.stats.send_client_bytes.fetch_add(err.len() as u64, Ordering::Relaxed);
                            writer.write_all(&err).await?;
                        }
                        Ok(Validated::Forward { frame, key }) => {
                            let (tx, rx) = oneshot::channel();
                            let req = DispatchRequest { frame, key, reply: tx };
                            if config.dispatch_tx.send(req).await.is_err() {
                                let err = resp::proxy_error("Not connected");
                                config.stats.send_client_bytes.fetch_add(err.len() as u64, Ordering::Relaxed);
                                writer.write_all(&err).await?;
                            } else {
                                in_flight.push_back(rx);
                            }
                        }
                        Err(err) => {
                            config.stats.send_client_bytes.fetch_add(err.len() as u64, Ordering::Relaxed);
                            writer.write_all(&err).await?;
                        }
                    }
                    if read_buf.is_empty() {
                        break;
                    }
                }
            }
        }
    }

    // Drain replies for requests already dispatched before the client went away.
    while let Some(result) = in_flight.next().await {
        let bytes = result.unwrap_or_default();
        config.stats.send_client_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        if writer.write_all(&bytes).await.is_err() {
            break;
        }
    }
    Ok(())
}
