//! `redflow` — a Redis-protocol sharding proxy.
//!
//! Accepts RESP client connections on one or more listeners, routes each
//! request to a backend Redis server according to a pool's routing policy
//! (modulo, Ketama consistent-hash, or Redis Cluster slot), and streams the
//! reply back. Failing backends are ejected and later re-probed; an in-band
//! RESP admin channel supports `INFO`, `STATS`, and hot config reload.
//!
//! The whole proxy runs on a single current-thread tokio runtime: every
//! pool, backend connection, and listener is its own task, but cooperative
//! `.await` scheduling (not OS threads) is what interleaves them, matching
//! the single-threaded reactor this system was designed around.

pub mod admin;
pub mod arena;
pub mod backend;
pub mod config;
pub mod error;
pub mod frontend;
pub mod pool;
pub mod resp;
pub mod router;
pub mod runtime;
pub mod stats;

pub use config::Config;
pub use runtime::Supervisor;
