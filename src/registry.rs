use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use host_protocol::PluginDescriptor;
use tracing::{debug, warn};

/// Static plugin metadata, in registration order.
///
/// Registering an id twice replaces the descriptor in place; it never
/// appends a second entry.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    descriptors: RwLock<Vec<Arc<PluginDescriptor>>>,
}

impl DescriptorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<PluginDescriptor>>> {
        self.descriptors.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<PluginDescriptor>>> {
        self.descriptors.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `true` when an existing descriptor with the same id was replaced.
    pub fn insert(&self, descriptor: PluginDescriptor) -> bool {
        let mut all = self.write();
        let descriptor = Arc::new(descriptor);
        if let Some(slot) = all.iter_mut().find(|d| d.id == descriptor.id) {
            warn!("Plugin `{}` registered twice, replacing descriptor", descriptor.id);
            *slot = descriptor;
            true
        } else {
            debug!("Registered descriptor `{}`", descriptor.id);
            all.push(descriptor);
            false
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<PluginDescriptor>> {
        self.read().iter().find(|d| d.id == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().iter().any(|d| d.id == id)
    }

    pub fn list(&self) -> Vec<PluginDescriptor> {
        self.read().iter().map(|d| d.as_ref().clone()).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().iter().map(|d| d.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_id_overwrites_in_place() {
        let reg = DescriptorRegistry::new();
        assert!(!reg.insert(PluginDescriptor::new("a", "A")));
        assert!(!reg.insert(PluginDescriptor::new("b", "B")));
        assert!(reg.insert(PluginDescriptor::new("a", "A v2")));

        assert_eq!(reg.ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(reg.get("a").unwrap().name, "A v2");
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn unknown_id_is_absent() {
        let reg = DescriptorRegistry::new();
        assert!(reg.is_empty());
        assert!(reg.get("nope").is_none());
        assert!(!reg.contains("nope"));
    }
}
