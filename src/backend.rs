//! One backend connection, realized as its own cooperatively-scheduled
//! task: it owns the socket, the in-flight FIFO queue, and the deadline
//! timer, and exchanges commands/events with its pool over channels.
//!
//! Running each backend in its own `tokio::spawn`ed task (rather than one
//! big reactor loop doing manual polling of every socket) keeps the state
//! exclusively owned by a single task — the pool never touches the socket
//! or the queue directly — while a current-thread runtime still guarantees
//! the whole proxy runs on one OS thread, cooperatively switching only at
//! `.await` points. No locking is ever needed as a result.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{instrument, warn};

use crate::arena::Handle;
use crate::error::BackendError;
use crate::resp::{self, FrameScan};
use crate::stats::SharedStats;

/// Per-connection states. `Draining`/`Closed` from the state diagram this
/// machine is modeled on are deliberately absent: this proxy drains at pool
/// granularity (`RunningPool::shutdown` in `runtime.rs` stops the listener
/// and tears the whole pool down after a grace period) rather than stepping
/// each backend connection through its own drain state — see DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Disconnected,
    Connecting,
    Authenticating,
    SelectingDb,
    Ready,
    Failed,
    Ejected,
    Probing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTag {
    Client,
    Auth,
    SelectDb,
    PingProbe,
    /// A proxy-issued `CLUSTER SLOTS` discovery/refresh request.
    ClusterSlots,
    /// A proxy-issued `ASKING` sent ahead of a one-shot `-ASK` retry.
    Asking,
}

#[derive(Debug)]
struct InFlight {
    handle: Handle,
    tag: RequestTag,
    deadline: Instant,
}

/// Immutable connection parameters a backend task is spawned with.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub address: String,
    pub weight: u32,
    pub auth: Option<String>,
    pub db: Option<u32>,
    pub timeout: Duration,
}

/// A command sent from the pool task to one backend task.
#[derive(Debug)]
pub enum BackendCmd {
    Send {
        handle: Handle,
        frame: Vec<u8>,
        tag: RequestTag,
    },
    /// Issues a health-check `PING` while the backend is in `Probing`.
    Probe { handle: Handle },
    Shutdown,
}

/// An event sent from a backend task back to its owning pool task.
#[derive(Debug)]
pub enum BackendEvent {
    Ready { backend: usize },
    Reply { backend: usize, handle: Handle, tag: RequestTag, frame: Vec<u8> },
    Timeout { backend: usize, handle: Handle },
    Fault { backend: usize, error: BackendError },
    ProbeOk { backend: usize, handle: Handle },
    ProbeFailed { backend: usize, handle: Handle },
    /// The task has drained `Shutdown` or hit a fault and is exiting.
    Stopped { backend: usize },
}

/// Spawns a backend connection task. The returned sender is how the pool
/// pushes requests to it; `event_tx` is how the task reports back.
pub fn spawn(
    index: usize,
    spec: BackendSpec,
    event_tx: mpsc::Sender<BackendEvent>,
    stats: Arc<SharedStats>,
) -> mpsc::Sender<BackendCmd> {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    tokio::spawn(run(index, spec, cmd_rx, event_tx, stats));
    cmd_tx
}

#[instrument(skip(spec, cmd_rx, event_tx, stats), fields(address = %spec.address))]
async fn run(
    index: usize,
    spec: BackendSpec,
    mut cmd_rx: mpsc::Receiver<BackendCmd>,
    event_tx: mpsc::Sender<BackendEvent>,
    stats: Arc<SharedStats>,
) {
    let mut conn = match connect_with_prelude(&spec).await {
        Ok(stream) => stream,
        Err(error) => {
            event_tx.send(BackendEvent::Fault { backend: index, error }).await.ok();
            event_tx.send(BackendEvent::Stopped { backend: index }).await.ok();
            return;
        }
    };
    event_tx.send(BackendEvent::Ready { backend: index }).await.ok();

    let mut read_buf = BytesMut::with_capacity(8192);
    let mut queue: VecDeque<InFlight> = VecDeque::new();

    loop {
        let sleep = match queue.front() {
            Some(head) => tokio::time::sleep_until(head.deadline),
            None => tokio::time::sleep(Duration::from_secs(3600)),
        };
        tokio::pin!(sleep);

        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(BackendCmd::Send { handle, frame, tag }) => {
                        if let Err(e) = conn.write_all(&frame).await {
                            let error = BackendError::Io { addr: spec.address.clone(), source: e };
                            event_tx.send(BackendEvent::Fault { backend: index, error }).await.ok();
                            break;
                        }
                        stats.send_backend_bytes.fetch_add(frame.len() as u64, std::sync::atomic::Ordering::Relaxed);
                        queue.push_back(InFlight { handle, tag, deadline: Instant::now() + spec.timeout });
                    }
                    Some(BackendCmd::Probe { handle }) => {
                        let ping = resp::array_of_bulk(&["PING".to_string()]);
                        if let Err(e) = conn.write_all(&ping).await {
                            event_tx.send(BackendEvent::ProbeFailed { backend: index, handle }).await.ok();
                            let error = BackendError::Io { addr: spec.address.clone(), source: e };
                            event_tx.send(BackendEvent::Fault { backend: index, error }).await.ok();
                            break;
                        }
                        stats.send_backend_bytes.fetch_add(ping.len() as u64, std::sync::atomic::Ordering::Relaxed);
                        queue.push_back(InFlight { handle, tag: RequestTag::PingProbe, deadline: Instant::now() + spec.timeout });
                    }
                    Some(BackendCmd::Shutdown) | None => break,
                }
            }

            result = read_some(&mut conn, &mut read_buf, &stats) => {
                match result {
                    Ok(()) => {
                        while let Some(end) = scan_ok(&read_buf, &spec.address, &event_tx, index).await {
                            let frame = read_buf.split_to(end).to_vec();
                            match queue.pop_front() {
                                Some(entry) => {
                                    let is_error = frame.first() == Some(&b'-');
                                    match entry.tag {
                                        RequestTag::PingProbe if !is_error => {
                                            event_tx.send(BackendEvent::ProbeOk { backend: index, handle: entry.handle }).await.ok();
                                        }
                                        RequestTag::PingProbe => {
                                            event_tx.send(BackendEvent::ProbeFailed { backend: index, handle: entry.handle }).await.ok();
                                        }
                                        _ => {
                                            event_tx.send(BackendEvent::Reply {
                                                backend: index,
                                                handle: entry.handle,
                                                tag: entry.tag,
                                                frame,
                                            }).await.ok();
                                        }
                                    }
                                }
                                None => {
                                    let error = BackendError::Protocol {
                                        addr: spec.address.clone(),
                                        detail: "reply with no matching request".to_string(),
                                    };
                                    event_tx.send(BackendEvent::Fault { backend: index, error }).await.ok();
                                    break;
                                }
                            }
                        }
                    }
                    Err(error) => {
                        event_tx.send(BackendEvent::Fault { backend: index, error }).await.ok();
                        break;
                    }
                }
            }

            _ = &mut sleep, if !queue.is_empty() => {
                if let Some(entry) = queue.pop_front() {
                    event_tx.send(BackendEvent::Timeout { backend: index, handle: entry.handle }).await.ok();
                    let error = BackendError::Timeout { addr: dummy_addr() };
                    warn!(address = %spec.address, "request timed out, faulting connection");
                    event_tx.send(BackendEvent::Fault { backend: index, error }).await.ok();
                    break;
                }
            }
        }
    }

    event_tx.send(BackendEvent::Stopped { backend: index }).await.ok();
}

// `BackendError::Timeout` carries a `SocketAddrV4` for display purposes;
// the backend task only has a string address, so a loopback placeholder
// stands in when the real address can't parse as v4.
fn dummy_addr() -> std::net::SocketAddrV4 {
    std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 0)
}

async fn scan_ok(
    buf: &BytesMut,
    address: &str,
    event_tx: &mpsc::Sender<BackendEvent>,
    index: usize,
) -> Option<usize> {
    match resp::scan_frame(buf) {
        Ok(FrameScan::Complete(end)) => Some(end),
        Ok(FrameScan::Incomplete) => None,
        Err(e) => {
            let error = BackendError::Protocol {
                addr: address.to_string(),
                detail: e.to_string(),
            };
            event_tx.send(BackendEvent::Fault { backend: index, error }).await.ok();
            None
        }
    }
}

async fn read_some(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    stats: &SharedStats,
) -> Result<(), BackendError> {
    let mut tmp = [0u8; 16384];
    let n = stream
        .read(&mut tmp)
        .await
        .map_err(|source| BackendError::Io {
            addr: String::new(),
            source,
        })?;
    if n == 0 {
        return Err(BackendError::Io {
            addr: String::new(),
            source: std::io::ErrorKind::UnexpectedEof.into(),
        });
    }
    stats.recv_backend_bytes.fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
    buf.extend_from_slice(&tmp[..n]);
    Ok(())
}

/// Connects and runs the `AUTH`/`SELECT` prelude synchronously before the
/// connection is handed to the main select loop.
async fn connect_with_prelude(spec: &BackendSpec) -> Result<TcpStream, BackendError> {
    let mut stream = TcpStream::connect(&spec.address)
        .await
        .map_err(|source| BackendError::Connect {
            addr: spec.address.clone(),
            source,
        })?;
    stream.set_nodelay(true).ok();

    if let Some(password) = &spec.auth {
        let cmd = resp::array_of_bulk(&["AUTH".to_string(), password.clone()]);
        run_prelude_command(&mut stream, &cmd, spec).await?;
    }
    if let Some(db) = spec.db {
        let cmd = resp::array_of_bulk(&["SELECT".to_string(), db.to_string()]);
        run_prelude_command(&mut stream, &cmd, spec).await?;
    }
    Ok(stream)
}

async fn run_prelude_command(
    stream: &mut TcpStream,
    cmd: &[u8],
    spec: &BackendSpec,
) -> Result<(), BackendError> {
    stream
        .write_all(cmd)
        .await
        .map_err(|source| BackendError::Io {
            addr: spec.address.clone(),
            source,
        })?;
    let mut buf = BytesMut::with_capacity(256);
    loop {
        match resp::scan_frame(&buf).map_err(|e| BackendError::Protocol {
            addr: spec.address.clone(),
            detail: e.to_string(),
        })? {
            FrameScan::Complete(end) => {
                let frame = buf.split_to(end);
                if frame.first() == Some(&b'-') {
                    return Err(BackendError::Prelude {
                        addr: spec.address.clone(),
                        detail: String::from_utf8_lossy(&frame).trim().to_string(),
                    });
                }
                return Ok(());
            }
            FrameScan::Incomplete => {
                let mut tmp = [0u8; 4096];
                let n = stream
                    .read(&mut tmp)
                    .await
                    .map_err(|source| BackendError::Io {
                        addr: spec.address.clone(),
                        source,
                    })?;
                if n == 0 {
                    return Err(BackendError::Io {
                        addr: spec.address.clone(),
                        source: std::io::ErrorKind::UnexpectedEof.into(),
                    });
                }
                buf.extend_from_slice(&tmp[..n]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_without_prelude_when_unconfigured() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await;
        });
        let spec = BackendSpec {
            address: addr.to_string(),
            weight: 1,
            auth: None,
            db: None,
            timeout: Duration::from_millis(200),
        };
        assert!(connect_with_prelude(&spec).await.is_ok());
    }

    #[tokio::test]
    async fn auth_prelude_fails_on_error_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"-ERR invalid password\r\n").await.unwrap();
        });
        let spec = BackendSpec {
            address: addr.to_string(),
            weight: 1,
            auth: Some("wrong".to_string()),
            db: None,
            timeout: Duration::from_millis(200),
        };
        assert!(matches!(
            connect_with_prelude(&spec).await,
            Err(BackendError::Prelude { .. })
        ));
    }
}
