//! The supervisor: owns the active and staged configs, the set of running
//! pools, and the admin command loop. Everything here runs on one task, so
//! `SWITCHCONFIG` diffing and application is atomic by construction: no
//! other task can ever observe a half-applied config.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::admin::AdminCmd;
use crate::config::{self, Config, PoolConfig};
use crate::frontend::{self, FrontendConfig};
use crate::pool::{Pool, PoolControl};
use crate::resp;
use crate::stats::Stats;

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct RunningPool {
    config: PoolConfig,
    dispatch_tx: mpsc::Sender<crate::pool::DispatchRequest>,
    control_tx: mpsc::Sender<PoolControl>,
    pool_task: JoinHandle<()>,
    listener_task: JoinHandle<()>,
}

impl RunningPool {
    /// Stops accepting new clients immediately, gives in-flight requests
    /// `grace` to complete (their replies still flow through the running
    /// pool task), then tears the pool down; anything still in-flight past
    /// the grace period is abandoned.
    async fn shutdown(self, grace: Duration) {
        self.listener_task.abort();
        drop(self.dispatch_tx);
        tokio::time::sleep(grace).await;
        self.control_tx.send(PoolControl::Shutdown).await.ok();
        let _ = tokio::time::timeout(Duration::from_millis(200), self.pool_task).await;
    }
}

pub struct Supervisor {
    active: Config,
    staged: Option<Config>,
    pools: HashMap<String, RunningPool>,
    admin_listener_task: Option<JoinHandle<()>>,
    admin_tx: Option<mpsc::Sender<AdminCmd>>,
    started_at: Instant,
}

impl Supervisor {
    pub fn new(active: Config) -> Self {
        Self {
            active,
            staged: None,
            pools: HashMap::new(),
            admin_listener_task: None,
            admin_tx: None,
            started_at: Instant::now(),
        }
    }

    fn spawn_pool(name: String, pool_config: PoolConfig) -> RunningPool {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(4096);
        let (control_tx, control_rx) = mpsc::channel(16);
        let pool = Pool::new(name.clone(), &pool_config);
        let stats = pool.shared_stats();
        let pool_task = tokio::spawn(pool.run(dispatch_rx, control_rx));

        let frontend_config = FrontendConfig {
            hash_tag: pool_config.parsed_hash_tag(),
            dispatch_tx: dispatch_tx.clone(),
            stats,
        };
        let listen_port = pool_config.listen_port;
        let listener_task = tokio::spawn(async move {
            if let Err(error) = frontend::run_listener(listen_port, frontend_config).await {
                error!(%error, port = listen_port, "frontend listener exited");
            }
        });

        RunningPool {
            config: pool_config,
            dispatch_tx,
            control_tx,
            pool_task,
            listener_task,
        }
    }

    fn spawn_admin_listener(&mut self, admin_tx: mpsc::Sender<AdminCmd>, port: u16) {
        if let Some(task) = self.admin_listener_task.take() {
            task.abort();
        }
        self.admin_listener_task = Some(tokio::spawn(async move {
            if let Err(error) = crate::admin::run_admin_listener(port, admin_tx).await {
                error!(%error, port, "admin listener exited");
            }
        }));
    }

    /// Starts every pool named in the active config and the admin listener,
    /// then processes admin commands until `SHUTDOWN`.
    pub async fn run(mut self) {
        for (name, pool_config) in self.active.pools.clone() {
            self.pools.insert(name.clone(), Self::spawn_pool(name, pool_config));
        }

        let (admin_tx, mut admin_rx) = mpsc::channel(64);
        self.admin_tx = Some(admin_tx.clone());
        self.spawn_admin_listener(admin_tx, self.active.admin_port);

        while let Some(cmd) = admin_rx.recv().await {
            match cmd {
                AdminCmd::Info { reply } => {
                    let uptime = self.started_at.elapsed().as_secs();
                    let body = format!("redflow version:{VERSION} uptime_seconds:{uptime}");
                    reply.send(resp::bulk_string(&body)).ok();
                }
                AdminCmd::Stats { reply } => {
                    reply.send(self.collect_stats_reply().await).ok();
                }
                AdminCmd::LoadConfig { path, reply } => {
                    reply.send(self.load_config(&path).await).ok();
                }
                AdminCmd::SwitchConfig { reply } => {
                    reply.send(self.switch_config().await).ok();
                }
                AdminCmd::Shutdown { reply } => {
                    reply.send(resp::simple_ok()).ok();
                    self.shutdown_all().await;
                    break;
                }
            }
        }
    }

    async fn collect_stats_reply(&self) -> Vec<u8> {
        let mut total = Stats::default();
        for running in self.pools.values() {
            let (tx, rx) = oneshot::channel();
            if running.control_tx.send(PoolControl::StatsSnapshot(tx)).await.is_ok() {
                if let Ok(snapshot) = rx.await {
                    total.merge(&snapshot);
                }
            }
        }
        resp::array_of_bulk(&total.to_lines())
    }

    async fn load_config(&mut self, path: &str) -> Vec<u8> {
        match config::load_from_path(Path::new(path)) {
            Ok(staged) => {
                self.staged = Some(staged);
                resp::simple_ok()
            }
            Err(e) => resp::proxy_error(&e.to_string()),
        }
    }

    /// Compares staged vs active and applies the minimal-disruption diff:
    /// reuse unchanged pools, drain+close removed ones, spawn added/changed
    /// ones.
    async fn switch_config(&mut self) -> Vec<u8> {
        let Some(staged) = self.staged.take() else {
            return resp::proxy_error("No staged config to switch to.");
        };
        if staged == self.active {
            self.staged = Some(staged);
            return resp::proxy_error("The loaded and staged configs are identical.");
        }

        let grace = Duration::from_millis(self.active.shutdown_grace_ms);
        let mut next_pools = HashMap::new();
        for (name, pool_config) in &staged.pools {
            if let Some(existing) = self.pools.get(name) {
                if &existing.config == pool_config {
                    next_pools.insert(name.clone(), self.pools.remove(name).unwrap());
                    continue;
                }
            }
            next_pools.insert(name.clone(), Self::spawn_pool(name.clone(), pool_config.clone()));
        }

        for (name, leftover) in self.pools.drain() {
            info!(pool = %name, "draining pool removed by config switch");
            leftover.shutdown(grace).await;
        }

        let admin_port_changed = staged.admin_port != self.active.admin_port;
        self.pools = next_pools;
        self.active = staged;

        if admin_port_changed {
            if let Some(admin_tx) = self.admin_tx.clone() {
                // Reuses the same command channel into `run`'s loop; only
                // the listener task (the producer side) is replaced, so
                // clients observe a reset on the old port and a working
                // socket on the new one with no gap in command processing.
                self.spawn_admin_listener(admin_tx, self.active.admin_port);
            }
        }

        resp::simple_ok()
    }

    async fn shutdown_all(&mut self) {
        let grace = Duration::from_millis(self.active.shutdown_grace_ms);
        if let Some(task) = self.admin_listener_task.take() {
            task.abort();
        }
        for (_, running) in self.pools.drain() {
            running.shutdown(grace).await;
        }
    }
}
