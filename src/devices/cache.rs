use std::collections::HashSet;
use std::sync::RwLock;

use crate::model::{DeviceId, DevicePrefix};

/// Pairing state consumed by device managers.
///
/// Persistence lives outside the core; implementations only need to be
/// thread-safe.
pub trait DeviceCache: Send + Sync {
    fn mark_paired(&self, id: DeviceId);
    fn mark_unpaired(&self, id: DeviceId);
    fn paired(&self, id: DeviceId) -> bool;
    fn paired_ids(&self, prefix: DevicePrefix) -> Vec<DeviceId>;
}

/// Volatile cache used by tests and the virtual manager.
#[derive(Debug, Default)]
pub struct InMemoryDeviceCache {
    paired: RwLock<HashSet<DeviceId>>,
}

impl DeviceCache for InMemoryDeviceCache {
    fn mark_paired(&self, id: DeviceId) {
        self.paired
            .write()
            .expect("device cache lock poisoned")
            .insert(id);
    }

    fn mark_unpaired(&self, id: DeviceId) {
        self.paired
            .write()
            .expect("device cache lock poisoned")
            .remove(&id);
    }

    fn paired(&self, id: DeviceId) -> bool {
        self.paired
            .read()
            .expect("device cache lock poisoned")
            .contains(&id)
    }

    fn paired_ids(&self, prefix: DevicePrefix) -> Vec<DeviceId> {
        self.paired
            .read()
            .expect("device cache lock poisoned")
            .iter()
            .copied()
            .filter(|id| id.has_prefix(prefix))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn pairing_round_trips() {
        let cache = InMemoryDeviceCache::default();
        let id = DeviceId::new(DevicePrefix::VirtualDevice, 1);

        assert!(!cache.paired(id));
        cache.mark_paired(id);
        assert!(cache.paired(id));
        cache.mark_unpaired(id);
        assert!(!cache.paired(id));
    }

    #[test]
    fn paired_ids_filters_by_prefix() {
        let cache = InMemoryDeviceCache::default();
        cache.mark_paired(DeviceId::new(DevicePrefix::VirtualDevice, 1));
        cache.mark_paired(DeviceId::new(DevicePrefix::BluetoothLe, 2));

        assert_eq!(
            vec![DeviceId::new(DevicePrefix::VirtualDevice, 1)],
            cache.paired_ids(DevicePrefix::VirtualDevice)
        );
    }
}
