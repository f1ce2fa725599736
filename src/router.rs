//! Pure routing functions: given a key and a pool's live backend set,
//! decide which backend index should serve the request.
//!
//! None of these types own sockets; they only track which backend *index*
//! (into the pool's `Vec<Backend>`) currently owns a slot in the
//! distribution. [`crate::pool::Pool`] keeps the live set and the ring/slot
//! map in sync as backends move between states.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RouterError;

pub const CLUSTER_SLOT_COUNT: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Modulo,
    Ketama,
    Cluster,
}

/// `crc16` (XMODEM variant), the hash Redis Cluster and this proxy's modulo
/// and cluster-slot routing both use.
pub fn crc16(bytes: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(bytes)
}

/// `hash(key) % live_count`, the Modulo distribution policy.
pub fn modulo_pick(key: &[u8], live_count: usize) -> Result<usize, RouterError> {
    if live_count == 0 {
        return Err(RouterError::NoBackend);
    }
    Ok(crc16(key) as usize % live_count)
}

/// `crc16(key) & 0x3FFF`, the Redis Cluster slot for a key.
pub fn cluster_slot(key: &[u8]) -> usize {
    crc16(key) as usize & (CLUSTER_SLOT_COUNT - 1)
}

/// A consistent-hash ring following the standard libketama construction:
/// `160 * weight` points per backend, each placed at `md5(address-index)`.
///
/// Points key on the backend's *pool-local index* (its position in the
/// pool's `backends` vec), not a socket or token, since the ring only needs
/// to answer "which backend" — the pool looks up the connection itself.
#[derive(Debug, Default, Clone)]
pub struct KetamaRing {
    points: BTreeMap<u32, usize>,
}

const POINTS_PER_WEIGHT: usize = 160;

fn ring_point(address: &str, index: usize) -> u32 {
    let digest = md5::compute(format!("{address}-{index}"));
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn key_point(key: &[u8]) -> u32 {
    let digest = md5::compute(key);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

impl KetamaRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Inserts all ring points for one backend. On a point collision, the
    /// backend with the lexicographically smaller address keeps the point.
    pub fn insert_backend(
        &mut self,
        backend_index: usize,
        address: &str,
        weight: usize,
        addresses: &[String],
    ) {
        for i in 0..POINTS_PER_WEIGHT * weight.max(1) {
            let point = ring_point(address, i);
            match self.points.get(&point) {
                Some(&existing) if addresses[existing].as_str() <= address => {
                    // Existing occupant wins the tie-break; leave it.
                }
                _ => {
                    self.points.insert(point, backend_index);
                }
            }
        }
    }

    /// Removes every ring point previously inserted for this backend.
    pub fn remove_backend(&mut self, backend_index: usize, address: &str, weight: usize) {
        for i in 0..POINTS_PER_WEIGHT * weight.max(1) {
            let point = ring_point(address, i);
            if self.points.get(&point) == Some(&backend_index) {
                self.points.remove(&point);
            }
        }
    }

    /// Selects the first point at or after `md5(key)`, wrapping to the
    /// smallest point if `key`'s hash is past every point on the ring.
    pub fn pick(&self, key: &[u8]) -> Result<usize, RouterError> {
        if self.points.is_empty() {
            return Err(RouterError::NoBackend);
        }
        let target = key_point(key);
        if let Some((_, &idx)) = self.points.range(target..).next() {
            return Ok(idx);
        }
        let (_, &idx) = self.points.iter().next().expect("checked non-empty above");
        Ok(idx)
    }
}

/// The 16384-entry Redis Cluster slot map. Not ready until every slot has
/// been assigned by a successful `CLUSTER SLOTS` discovery.
#[derive(Debug, Clone)]
pub struct ClusterSlotMap {
    slots: Vec<Option<usize>>,
}

impl Default for ClusterSlotMap {
    fn default() -> Self {
        Self {
            slots: vec![None; CLUSTER_SLOT_COUNT],
        }
    }
}

impl ClusterSlotMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    pub fn assign_range(&mut self, start: usize, end_inclusive: usize, backend_index: usize) {
        for slot in &mut self.slots[start..=end_inclusive.min(CLUSTER_SLOT_COUNT - 1)] {
            *slot = Some(backend_index);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    pub fn backend_for_key(&self, key: &[u8]) -> Result<usize, RouterError> {
        let slot = cluster_slot(key);
        self.slots[slot].ok_or(RouterError::NoBackend)
    }

    pub fn backend_for_slot(&self, slot: usize) -> Option<usize> {
        self.slots.get(slot).copied().flatten()
    }
}
