//! The in-band RESP admin channel: `INFO`, `STATS`, `LOADCONFIG <path>`,
//! `SWITCHCONFIG`, `SHUTDOWN`.
//!
//! Deliberately its own listener and command path rather than routed
//! through a pool, so a saturated client pool can never starve admin
//! commands.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, warn};

use crate::resp::{self, FrameScan};

pub enum AdminCmd {
    Info { reply: oneshot::Sender<Vec<u8>> },
    Stats { reply: oneshot::Sender<Vec<u8>> },
    LoadConfig { path: String, reply: oneshot::Sender<Vec<u8>> },
    SwitchConfig { reply: oneshot::Sender<Vec<u8>> },
    Shutdown { reply: oneshot::Sender<Vec<u8>> },
}

fn parse_admin_command(args: &[Vec<u8>]) -> Result<AdminCmd, Vec<u8>> {
    let cmd = args
        .first()
        .map(|b| String::from_utf8_lossy(b).to_uppercase())
        .unwrap_or_default();
    match cmd.as_str() {
        "INFO" => Ok(AdminCmd::Info { reply: dummy() }),
        "STATS" => Ok(AdminCmd::Stats { reply: dummy() }),
        "SWITCHCONFIG" => Ok(AdminCmd::SwitchConfig { reply: dummy() }),
        "SHUTDOWN" => Ok(AdminCmd::Shutdown { reply: dummy() }),
        "LOADCONFIG" => {
            let path = args
                .get(1)
                .map(|b| String::from_utf8_lossy(b).to_string())
                .ok_or_else(|| resp::proxy_error("LOADCONFIG requires a path argument"))?;
            Ok(AdminCmd::LoadConfig { path, reply: dummy() })
        }
        _ => Err(resp::proxy_error("Unsupported command")),
    }
}

/// Placeholder; real callers replace this with their own oneshot before
/// sending, see [`with_reply`].
fn dummy() -> oneshot::Sender<Vec<u8>> {
    oneshot::channel().0
}

fn with_reply(cmd: AdminCmd, reply: oneshot::Sender<Vec<u8>>) -> AdminCmd {
    match cmd {
        AdminCmd::Info { .. } => AdminCmd::Info { reply },
        AdminCmd::Stats { .. } => AdminCmd::Stats { reply },
        AdminCmd::LoadConfig { path, .. } => AdminCmd::LoadConfig { path, reply },
        AdminCmd::SwitchConfig { .. } => AdminCmd::SwitchConfig { reply },
        AdminCmd::Shutdown { .. } => AdminCmd::Shutdown { reply },
    }
}

pub async fn run_admin_listener(
    port: u16,
    supervisor_tx: mpsc::Sender<AdminCmd>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    loop {
        let (socket, peer) = listener.accept().await?;
        let supervisor_tx = supervisor_tx.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_admin_client(socket, supervisor_tx).await {
                warn!(%peer, %error, "admin connection closed with error");
            }
        });
    }
}

#[instrument(skip(socket, supervisor_tx))]
async fn handle_admin_client(
    mut socket: TcpStream,
    supervisor_tx: mpsc::Sender<AdminCmd>,
) -> std::io::Result<()> {
    let mut buf = bytes::BytesMut::with_capacity(4096);
    loop {
        let scan = resp::scan_frame(&buf)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad frame"))?;
        let end = match scan {
            FrameScan::Complete(end) => end,
            FrameScan::Incomplete => {
                let mut tmp = [0u8; 4096];
                let n = socket.read(&mut tmp).await?;
                if n == 0 {
                    return Ok(());
                }
                buf.extend_from_slice(&tmp[..n]);
                continue;
            }
        };
        let frame = buf.split_to(end);
        let args = resp::split_args(&frame)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad frame"))?;

        let reply_bytes = match parse_admin_command(&args) {
            Err(err) => err,
            Ok(cmd) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let cmd = with_reply(cmd, reply_tx);
                if supervisor_tx.send(cmd).await.is_err() {
                    resp::proxy_error("Not connected")
                } else {
                    reply_rx.await.unwrap_or_else(|_| resp::proxy_error("Not connected"))
                }
            }
        };
        socket.write_all(&reply_bytes).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_loadconfig_path() {
        let args = vec![b"LOADCONFIG".to_vec(), b"/tmp/x.toml".to_vec()];
        match parse_admin_command(&args).unwrap() {
            AdminCmd::LoadConfig { path, .. } => assert_eq!(path, "/tmp/x.toml"),
            _ => panic!("expected LoadConfig"),
        }
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(parse_admin_command(&[b"FOO".to_vec()]).is_err());
    }

    #[test]
    fn loadconfig_without_path_is_rejected() {
        assert!(parse_admin_command(&[b"LOADCONFIG".to_vec()]).is_err());
    }
}
