use std::collections::BTreeMap;

use crate::core::device::{DiskId, PhysicalDevice};

/// Fixed-size mapping from slot index to at most one physical device.
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<Option<PhysicalDevice>>,
}

impl SlotTable {
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![None; count],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn device(&self, slot: usize) -> Option<&PhysicalDevice> {
        self.slots.get(slot).and_then(|d| d.as_ref())
    }

    pub fn slot_of(&self, id: DiskId) -> Option<usize> {
        self.slots
            .iter()
            .position(|d| d.as_ref().is_some_and(|d| d.id == id))
    }

    /// Replace every binding from `snapshot`, which must be ordered by identity.
    ///
    /// Devices keep the slot they already occupy. A slot listed in `pinned`
    /// belongs to a job that is still running: it only ever takes back that
    /// job's own device and is never handed to another one. Remaining devices
    /// fill the lowest free slots. Returns the identities that found no slot.
    pub fn rebind(
        &mut self,
        snapshot: Vec<PhysicalDevice>,
        pinned: &BTreeMap<usize, DiskId>,
    ) -> Vec<DiskId> {
        let mut next: Vec<Option<PhysicalDevice>> = vec![None; self.slots.len()];
        let mut pending = Vec::new();

        for device in snapshot {
            let keep = pinned
                .iter()
                .find(|&(_, id)| *id == device.id)
                .map(|(&slot, _)| slot)
                .or_else(|| {
                    self.slot_of(device.id)
                        .filter(|slot| pinned.get(slot).is_none_or(|id| *id == device.id))
                });

            match keep {
                Some(slot) if next[slot].is_none() => next[slot] = Some(device),
                _ => pending.push(device),
            }
        }

        let mut overflow = Vec::new();
        for device in pending {
            let free = (0..next.len()).find(|s| next[*s].is_none() && !pinned.contains_key(s));
            match free {
                Some(slot) => next[slot] = Some(device),
                None => overflow.push(device.id),
            }
        }

        self.slots = next;
        overflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedVolumeSource;
    use crate::core::device::enumerate;

    fn snapshot(disks: &[u64]) -> Vec<PhysicalDevice> {
        let (source, sim) = SimulatedVolumeSource::new();
        for &d in disks {
            sim.add_device(d, 8);
        }
        enumerate(&source).unwrap()
    }

    fn bound(table: &SlotTable) -> Vec<Option<u64>> {
        (0..table.len())
            .map(|s| table.device(s).map(|d| d.id.0))
            .collect()
    }

    #[test]
    fn test_fresh_table_binds_in_identity_order() {
        let mut table = SlotTable::new(4);
        let overflow = table.rebind(snapshot(&[9, 3, 5]), &BTreeMap::new());
        assert!(overflow.is_empty());
        assert_eq!(bound(&table), vec![Some(3), Some(5), Some(9), None]);
        assert_eq!(table.slot_of(DiskId(5)), Some(1));
    }

    #[test]
    fn test_remaining_devices_keep_their_slot() {
        let mut table = SlotTable::new(3);
        table.rebind(snapshot(&[3, 5, 9]), &BTreeMap::new());
        table.rebind(snapshot(&[5, 9]), &BTreeMap::new());
        assert_eq!(bound(&table), vec![None, Some(5), Some(9)]);

        table.rebind(snapshot(&[1, 5, 9]), &BTreeMap::new());
        assert_eq!(bound(&table), vec![Some(1), Some(5), Some(9)]);
    }

    #[test]
    fn test_pinned_slot_is_reserved_for_its_device() {
        let mut table = SlotTable::new(2);
        table.rebind(snapshot(&[3]), &BTreeMap::new());

        let pinned = BTreeMap::from([(0, DiskId(3))]);
        table.rebind(snapshot(&[7]), &pinned);
        assert_eq!(bound(&table), vec![None, Some(7)]);

        table.rebind(snapshot(&[3, 7]), &pinned);
        assert_eq!(bound(&table), vec![Some(3), Some(7)]);
    }

    #[test]
    fn test_overflow_when_table_is_full() {
        let mut table = SlotTable::new(1);
        let overflow = table.rebind(snapshot(&[1, 2]), &BTreeMap::new());
        assert_eq!(bound(&table), vec![Some(1)]);
        assert_eq!(overflow, vec![DiskId(2)]);
    }

    #[test]
    fn test_device_maps_to_one_slot() {
        let mut table = SlotTable::new(4);
        table.rebind(snapshot(&[1, 2]), &BTreeMap::new());
        table.rebind(snapshot(&[1, 2]), &BTreeMap::new());
        assert_eq!(bound(&table), vec![Some(1), Some(2), None, None]);
    }
}
