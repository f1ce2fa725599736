//! Binary-level integration tests: a real `Supervisor` talking to loopback
//! "fake Redis" backends (bare `TcpListener`s replying with canned RESP).

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redflow::config;
use redflow::Supervisor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Binds a loopback listener and returns its port without holding the
/// listener open past the caller's use of the port (tests reuse the port
/// in a config file on disk, so a toctou gap here is acceptable: nothing
/// else on a test host binds it between free and reuse).
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Spawns a fake Redis that replies to every complete frame it reads with
/// `reply`, regardless of what the command was.
fn spawn_fake_redis(port: u16, reply: &'static [u8], delay: Duration) {
    tokio::spawn(async move {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = bytes::BytesMut::with_capacity(4096);
                loop {
                    match redflow::resp::scan_frame(&buf) {
                        Ok(redflow::resp::FrameScan::Complete(end)) => {
                            buf.split_to(end);
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            if sock.write_all(reply).await.is_err() {
                                return;
                            }
                        }
                        Ok(redflow::resp::FrameScan::Incomplete) => {
                            let mut tmp = [0u8; 4096];
                            let Ok(n) = sock.read(&mut tmp).await else {
                                return;
                            };
                            if n == 0 {
                                return;
                            }
                            buf.extend_from_slice(&tmp[..n]);
                        }
                        Err(_) => return,
                    }
                }
            });
        }
    });
}

/// Like [`spawn_fake_redis`], but its reply delay can be changed at runtime
/// via the returned handle — used to simulate a backend recovering from a
/// slow period without tearing the listener down.
fn spawn_fake_redis_dynamic(port: u16, reply: &'static [u8], initial_delay_ms: u64) -> Arc<AtomicU64> {
    let delay_ms = Arc::new(AtomicU64::new(initial_delay_ms));
    let handle = delay_ms.clone();
    tokio::spawn(async move {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let delay_ms = delay_ms.clone();
            tokio::spawn(async move {
                let mut buf = bytes::BytesMut::with_capacity(4096);
                loop {
                    match redflow::resp::scan_frame(&buf) {
                        Ok(redflow::resp::FrameScan::Complete(end)) => {
                            buf.split_to(end);
                            let delay = Duration::from_millis(delay_ms.load(Ordering::Relaxed));
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            if sock.write_all(reply).await.is_err() {
                                return;
                            }
                        }
                        Ok(redflow::resp::FrameScan::Incomplete) => {
                            let mut tmp = [0u8; 4096];
                            let Ok(n) = sock.read(&mut tmp).await else {
                                return;
                            };
                            if n == 0 {
                                return;
                            }
                            buf.extend_from_slice(&tmp[..n]);
                        }
                        Err(_) => return,
                    }
                }
            });
        }
    });
    handle
}

/// Spawns a fake Redis that replies `+<label>\r\n` to every command, so a
/// test can tell which backend actually served a request.
fn spawn_fake_redis_labeled(port: u16, label: &'static str) {
    tokio::spawn(async move {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = bytes::BytesMut::with_capacity(4096);
                let reply = format!("+{label}\r\n").into_bytes();
                loop {
                    match redflow::resp::scan_frame(&buf) {
                        Ok(redflow::resp::FrameScan::Complete(end)) => {
                            buf.split_to(end);
                            if sock.write_all(&reply).await.is_err() {
                                return;
                            }
                        }
                        Ok(redflow::resp::FrameScan::Incomplete) => {
                            let mut tmp = [0u8; 4096];
                            let Ok(n) = sock.read(&mut tmp).await else {
                                return;
                            };
                            if n == 0 {
                                return;
                            }
                            buf.extend_from_slice(&tmp[..n]);
                        }
                        Err(_) => return,
                    }
                }
            });
        }
    });
}

fn write_config(toml: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(toml.as_bytes()).unwrap();
    f
}

async fn send_and_read(port: u16, frame: &[u8]) -> Vec<u8> {
    let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    sock.write_all(frame).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let n = sock.read(&mut buf).await.unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn single_backend_get_returns_nil() {
    let backend_port = free_port().await;
    let listen_port = free_port().await;
    let admin_port = free_port().await;
    spawn_fake_redis(backend_port, b"$-1\r\n", Duration::ZERO);

    let cfg = write_config(&format!(
        r#"
        admin_port = {admin_port}

        [pools.main]
        listen_port = {listen_port}
        backends = ["127.0.0.1:{backend_port}"]
        timeout_ms = 200
        retry_timeout_ms = 500
        failure_limit = 3
        distribution = "modulo"
        "#
    ));
    let active = config::load_from_path(cfg.path()).unwrap();
    tokio::spawn(Supervisor::new(active).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reply = send_and_read(
        listen_port,
        &redflow::resp::array_of_bulk(&["GET".to_string(), "test_key".to_string()]),
    )
    .await;
    assert_eq!(reply, b"$-1\r\n".to_vec());
}

#[tokio::test]
async fn request_exceeding_timeout_gets_proxy_timed_out_then_not_connected() {
    let backend_port = free_port().await;
    let listen_port = free_port().await;
    let admin_port = free_port().await;
    spawn_fake_redis(backend_port, b"$-1\r\n", Duration::from_millis(110));

    let cfg = write_config(&format!(
        r#"
        admin_port = {admin_port}

        [pools.main]
        listen_port = {listen_port}
        backends = ["127.0.0.1:{backend_port}"]
        timeout_ms = 100
        retry_timeout_ms = 500
        failure_limit = 3
        distribution = "modulo"
        "#
    ));
    let active = config::load_from_path(cfg.path()).unwrap();
    tokio::spawn(Supervisor::new(active).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let get = redflow::resp::array_of_bulk(&["GET".to_string(), "test_key".to_string()]);
    let first = send_and_read(listen_port, &get).await;
    assert_eq!(first, b"-Proxy timed out\r\n".to_vec());

    // The backend socket is torn down on timeout (protocol alignment is
    // lost), so the very next request finds no Ready backend yet.
    let second = send_and_read(listen_port, &get).await;
    assert_eq!(second, redflow::resp::proxy_error("Not connected"));
}

#[tokio::test]
async fn sharding_routes_different_keys_to_different_backends() {
    let backend_ports: Vec<u16> = {
        let mut ports = Vec::new();
        for _ in 0..4 {
            ports.push(free_port().await);
        }
        ports
    };
    let listen_port = free_port().await;
    let admin_port = free_port().await;
    for &port in &backend_ports {
        spawn_fake_redis(port, b"+OK\r\n", Duration::ZERO);
    }

    let backends_toml = backend_ports
        .iter()
        .map(|p| format!("\"127.0.0.1:{p}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let cfg = write_config(&format!(
        r#"
        admin_port = {admin_port}

        [pools.main]
        listen_port = {listen_port}
        backends = [{backends_toml}]
        timeout_ms = 200
        retry_timeout_ms = 500
        failure_limit = 3
        distribution = "modulo"
        "#
    ));
    let active = config::load_from_path(cfg.path()).unwrap();
    tokio::spawn(Supervisor::new(active).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let set1 = redflow::resp::array_of_bulk(&[
        "SET".to_string(),
        "key1".to_string(),
        "value".to_string(),
    ]);
    let reply = send_and_read(listen_port, &set1).await;
    assert_eq!(reply, b"+OK\r\n".to_vec());
}

#[tokio::test]
async fn loadconfig_and_switchconfig_roundtrip() {
    let backend_port = free_port().await;
    let listen_port = free_port().await;
    let admin_port = free_port().await;
    spawn_fake_redis(backend_port, b"$-1\r\n", Duration::ZERO);

    let toml = format!(
        r#"
        admin_port = {admin_port}

        [pools.main]
        listen_port = {listen_port}
        backends = ["127.0.0.1:{backend_port}"]
        timeout_ms = 200
        retry_timeout_ms = 500
        failure_limit = 3
        distribution = "modulo"
        "#
    );
    let cfg = write_config(&toml);
    let active = config::load_from_path(cfg.path()).unwrap();
    tokio::spawn(Supervisor::new(active).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let loadconfig = redflow::resp::array_of_bulk(&[
        "LOADCONFIG".to_string(),
        cfg.path().display().to_string(),
    ]);
    let switchconfig = redflow::resp::array_of_bulk(&["SWITCHCONFIG".to_string()]);

    let mut admin = TcpStream::connect(("127.0.0.1", admin_port)).await.unwrap();
    admin.write_all(&loadconfig).await.unwrap();
    let mut buf = vec![0u8; 256];
    let n = admin.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"+OK\r\n");

    admin.write_all(&switchconfig).await.unwrap();
    let n = admin.read(&mut buf).await.unwrap();
    assert_eq!(
        &buf[..n],
        b"-ERROR: The loaded and staged configs are identical.\r\n"
    );
}

/// Spec scenario 3: three consecutive timeouts eject the backend, the next
/// requests fail fast with "Not connected" while it's ejected, and once the
/// delayer recovers and `retry_timeout_ms` has passed, the backend probes
/// back to `Ready` and service resumes.
#[tokio::test]
async fn ejection_then_recovery_after_delayer_improves() {
    let backend_port = free_port().await;
    let listen_port = free_port().await;
    let admin_port = free_port().await;
    // 150ms > the 100ms timeout below, so every request times out until the
    // delayer is turned down.
    let delay_ms = spawn_fake_redis_dynamic(backend_port, b"$-1\r\n", 150);

    let cfg = write_config(&format!(
        r#"
        admin_port = {admin_port}

        [pools.main]
        listen_port = {listen_port}
        backends = ["127.0.0.1:{backend_port}"]
        timeout_ms = 100
        retry_timeout_ms = 500
        failure_limit = 3
        auto_eject_hosts = true
        distribution = "modulo"
        "#
    ));
    let active = config::load_from_path(cfg.path()).unwrap();
    tokio::spawn(Supervisor::new(active).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let get = redflow::resp::array_of_bulk(&["GET".to_string(), "test_key".to_string()]);

    // Three successive GETs, each timing out, spaced far enough apart for
    // the backend to reconnect (Failed -> Connecting -> Ready) in between.
    for _ in 0..3 {
        let reply = send_and_read(listen_port, &get).await;
        assert_eq!(reply, b"-Proxy timed out\r\n".to_vec());
        tokio::time::sleep(Duration::from_millis(520)).await;
    }

    // The third consecutive failure crossed failure_limit, so the backend
    // is now Ejected rather than reconnecting; the next two requests fail
    // fast instead of waiting out another timeout.
    for _ in 0..2 {
        let reply = send_and_read(listen_port, &get).await;
        assert_eq!(reply, redflow::resp::proxy_error("Not connected"));
    }

    // The delayer recovers; once retry_timeout_ms has passed the backend is
    // probed and returns to Ready.
    delay_ms.store(2, Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let reply = send_and_read(listen_port, &get).await;
    assert_eq!(reply, b"$-1\r\n".to_vec());
}

/// Spec scenario 5: a two-character hash tag routes only the content
/// strictly between the two delimiters, so keys that differ outside the
/// tag still land on the same backend.
#[tokio::test]
async fn hash_tag_colocates_keys_sharing_tagged_content() {
    let backend_ports: Vec<u16> = {
        let mut ports = Vec::new();
        for _ in 0..4 {
            ports.push(free_port().await);
        }
        ports
    };
    let listen_port = free_port().await;
    let admin_port = free_port().await;
    for (i, &port) in backend_ports.iter().enumerate() {
        spawn_fake_redis_labeled(port, Box::leak(format!("backend{i}").into_boxed_str()));
    }

    let backends_toml = backend_ports
        .iter()
        .map(|p| format!("\"127.0.0.1:{p}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let cfg = write_config(&format!(
        r#"
        admin_port = {admin_port}

        [pools.main]
        listen_port = {listen_port}
        backends = [{backends_toml}]
        hash_tag = "//"
        timeout_ms = 200
        retry_timeout_ms = 500
        failure_limit = 3
        distribution = "modulo"
        "#
    ));
    let active = config::load_from_path(cfg.path()).unwrap();
    tokio::spawn(Supervisor::new(active).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let set = |key: &str| {
        redflow::resp::array_of_bulk(&["SET".to_string(), key.to_string(), "teste".to_string()])
    };

    let r1 = send_and_read(listen_port, &set("//key4")).await;
    let r2 = send_and_read(listen_port, &set("key4//")).await;
    let r3 = send_and_read(listen_port, &set("key4///")).await;

    // All three share the same (empty) tagged content, so they must land
    // on the same backend regardless of what surrounds the delimiters.
    assert_eq!(r1, r2);
    assert_eq!(r2, r3);
}
