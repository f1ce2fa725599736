//! Counters exposed by the admin `STATS` command.
//!
//! [`SharedStats`] is the live, atomic form shared by a pool's dispatch
//! logic, its backend tasks, and the frontend listener's client tasks —
//! all of which increment counters from different tokio tasks. [`Stats`]
//! is the plain snapshot type taken for a `STATS` reply or merged across
//! pools.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SharedStats {
    pub accepted_clients: AtomicU64,
    pub client_connections: AtomicU64,
    pub requests: AtomicU64,
    pub responses: AtomicU64,
    pub send_client_bytes: AtomicU64,
    pub recv_client_bytes: AtomicU64,
    pub send_backend_bytes: AtomicU64,
    pub recv_backend_bytes: AtomicU64,
}

impl SharedStats {
    pub fn snapshot(&self) -> Stats {
        Stats {
            accepted_clients: self.accepted_clients.load(Ordering::Relaxed),
            client_connections: self.client_connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            send_client_bytes: self.send_client_bytes.load(Ordering::Relaxed),
            recv_client_bytes: self.recv_client_bytes.load(Ordering::Relaxed),
            send_backend_bytes: self.send_backend_bytes.load(Ordering::Relaxed),
            recv_backend_bytes: self.recv_backend_bytes.load(Ordering::Relaxed),
        }
    }

}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub accepted_clients: u64,
    pub client_connections: u64,
    pub requests: u64,
    pub responses: u64,
    pub send_client_bytes: u64,
    pub recv_client_bytes: u64,
    pub send_backend_bytes: u64,
    pub recv_backend_bytes: u64,
}

impl Stats {
    pub fn merge(&mut self, other: &Stats) {
        self.accepted_clients += other.accepted_clients;
        self.client_connections += other.client_connections;
        self.requests += other.requests;
        self.responses += other.responses;
        self.send_client_bytes += other.send_client_bytes;
        self.recv_client_bytes += other.recv_client_bytes;
        self.send_backend_bytes += other.send_backend_bytes;
        self.recv_backend_bytes += other.recv_backend_bytes;
    }

    /// Renders as the newline-joined `name:value` lines `STATS` replies with.
    pub fn to_lines(&self) -> Vec<String> {
        vec![
            format!("accepted_clients:{}", self.accepted_clients),
            format!("client_connections:{}", self.client_connections),
            format!("requests:{}", self.requests),
            format!("responses:{}", self.responses),
            format!("send_client_bytes:{}", self.send_client_bytes),
            format!("recv_client_bytes:{}", self.recv_client_bytes),
            format!("send_backend_bytes:{}", self.send_backend_bytes),
            format!("recv_backend_bytes:{}", self.recv_backend_bytes),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_every_field() {
        let mut a = Stats { requests: 1, ..Default::default() };
        let b = Stats { requests: 2, responses: 1, ..Default::default() };
        a.merge(&b);
        assert_eq!(a.requests, 3);
        assert_eq!(a.responses, 1);
    }

    #[test]
    fn to_lines_includes_all_counters() {
        let stats = Stats::default();
        assert_eq!(stats.to_lines().len(), 8);
    }

    #[test]
    fn shared_stats_snapshot_reflects_increments() {
        let shared = SharedStats::default();
        shared.requests.fetch_add(2, Ordering::Relaxed);
        shared.send_client_bytes.fetch_add(10, Ordering::Relaxed);
        shared.recv_client_bytes.fetch_add(20, Ordering::Relaxed);
        shared.send_backend_bytes.fetch_add(5, Ordering::Relaxed);
        shared.recv_backend_bytes.fetch_add(7, Ordering::Relaxed);
        let snap = shared.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.send_client_bytes, 10);
        assert_eq!(snap.recv_client_bytes, 20);
        assert_eq!(snap.send_backend_bytes, 5);
        assert_eq!(snap.recv_backend_bytes, 7);
    }
}
