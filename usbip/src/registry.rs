//! The URB registry (§4.6): a concurrent map from `seqnum` to in-flight URB
//! state, scoped to a single connection.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::proto::UrbDirection;
use crate::transport::TransferKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

/// In-memory tracking record for one admitted SUBMIT, per §3.
#[derive(Debug, Clone)]
pub struct UrbRecord {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: UrbDirection,
    pub endpoint: u8,
    pub transfer_kind_label: &'static str,
    pub buffer_length: u32,
    pub status: UrbStatus,
}

impl UrbRecord {
    pub fn new(
        seqnum: u32,
        devid: u32,
        direction: UrbDirection,
        endpoint: u8,
        kind: &TransferKind,
        buffer_length: u32,
    ) -> Self {
        let transfer_kind_label = match kind {
            TransferKind::Control { .. } => "control",
            TransferKind::Bulk => "bulk",
            TransferKind::Interrupt => "interrupt",
            TransferKind::Iso { .. } => "iso",
        };

        Self {
            seqnum,
            devid,
            direction,
            endpoint,
            transfer_kind_label,
            buffer_length,
            status: UrbStatus::Pending,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("a URB with seqnum {0} is already registered")]
pub struct DuplicateSeqnum(pub u32);

/// Concurrent `seqnum -> URB record` map, owned by a single connection.
///
/// Per §4.6: single writer per operation, multiple readers; reader scans
/// (`count`, `contains`) must not block writers for long. A `Mutex` around a
/// `HashMap` satisfies this trivially at the scale of one connection's
/// in-flight URBs (bounded by `MAX_CONCURRENT`, default 64).
#[derive(Default)]
pub struct UrbRegistry {
    inner: Mutex<HashMap<u32, UrbRecord>>,
}

impl UrbRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, record: UrbRecord) -> Result<(), DuplicateSeqnum> {
        let mut guard = self.inner.lock().unwrap();
        if guard.contains_key(&record.seqnum) {
            return Err(DuplicateSeqnum(record.seqnum));
        }
        guard.insert(record.seqnum, record);
        Ok(())
    }

    pub fn update_status(&self, seqnum: u32, new: UrbStatus) -> bool {
        let mut guard = self.inner.lock().unwrap();
        match guard.get_mut(&seqnum) {
            Some(record) => {
                record.status = new;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, seqnum: u32) -> Option<UrbRecord> {
        self.inner.lock().unwrap().remove(&seqnum)
    }

    pub fn get(&self, seqnum: u32) -> Option<UrbRecord> {
        self.inner.lock().unwrap().get(&seqnum).cloned()
    }

    pub fn contains(&self, seqnum: u32) -> bool {
        self.inner.lock().unwrap().contains_key(&seqnum)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Drains the registry, returning every still-tracked record. Used on
    /// connection teardown: the caller must attempt cancellation on each and
    /// must not emit replies on the now-closed socket.
    pub fn drain_all(&self) -> Vec<UrbRecord> {
        self.inner.lock().unwrap().drain().map(|(_, v)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransferKind;

    fn record(seqnum: u32) -> UrbRecord {
        UrbRecord::new(seqnum, 1, UrbDirection::In, 0, &TransferKind::Bulk, 512)
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let registry = UrbRegistry::new();
        registry.insert(record(1)).unwrap();

        let err = registry.insert(record(1)).unwrap_err();
        assert_eq!(err.0, 1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn remove_returns_the_record_once() {
        let registry = UrbRegistry::new();
        registry.insert(record(7)).unwrap();

        assert!(registry.remove(7).is_some());
        assert!(registry.remove(7).is_none());
        assert!(!registry.contains(7));
    }

    #[test]
    fn drain_all_empties_the_registry() {
        let registry = UrbRegistry::new();
        registry.insert(record(1)).unwrap();
        registry.insert(record(2)).unwrap();

        let drained = registry.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn update_status_on_missing_seqnum_is_a_noop() {
        let registry = UrbRegistry::new();
        assert!(!registry.update_status(42, UrbStatus::Cancelled));
    }
}
