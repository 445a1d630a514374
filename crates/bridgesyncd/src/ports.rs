//! Registered-port table: the mapping between hardware port ids and
//! kernel interfaces.
//!
//! The name side is set when the switch announces a port, before the
//! kernel interface exists. The index side is bound once the kernel
//! reports the link. Invariant: an index-side entry exists only while a
//! name-side entry for the same port id exists.

use std::collections::HashMap;

use parking_lot::Mutex;

use swbridge_types::PortId;

#[derive(Default)]
struct Inner {
    port_by_name: HashMap<String, PortId>,
    name_by_port: HashMap<PortId, String>,
    port_by_ifindex: HashMap<u32, PortId>,
    ifindex_by_port: HashMap<PortId, u32>,
}

#[derive(Default)]
pub struct PortRegistry {
    inner: Mutex<Inner>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a port announced by the switch under its interface name.
    pub fn register(&self, port: PortId, name: &str) {
        let mut inner = self.inner.lock();
        inner.port_by_name.insert(name.to_string(), port);
        inner.name_by_port.insert(port, name.to_string());
    }

    /// Removes a port and any index binding it holds.
    pub fn unregister(&self, port: PortId) {
        let mut inner = self.inner.lock();
        if let Some(name) = inner.name_by_port.remove(&port) {
            inner.port_by_name.remove(&name);
        }
        if let Some(ifindex) = inner.ifindex_by_port.remove(&port) {
            inner.port_by_ifindex.remove(&ifindex);
        }
    }

    /// Binds the kernel interface index once the kernel reports the
    /// link. Refused (returns `None`) unless the name was registered
    /// first.
    pub fn bind_ifindex(&self, name: &str, ifindex: u32) -> Option<PortId> {
        let mut inner = self.inner.lock();
        let port = *inner.port_by_name.get(name)?;
        inner.port_by_ifindex.insert(ifindex, port);
        inner.ifindex_by_port.insert(port, ifindex);
        Some(port)
    }

    pub fn unbind_ifindex(&self, ifindex: u32) {
        let mut inner = self.inner.lock();
        if let Some(port) = inner.port_by_ifindex.remove(&ifindex) {
            inner.ifindex_by_port.remove(&port);
        }
    }

    pub fn port_for_ifindex(&self, ifindex: u32) -> Option<PortId> {
        self.inner.lock().port_by_ifindex.get(&ifindex).copied()
    }

    pub fn ifindex_for_port(&self, port: PortId) -> Option<u32> {
        self.inner.lock().ifindex_by_port.get(&port).copied()
    }

    pub fn port_for_name(&self, name: &str) -> Option<PortId> {
        self.inner.lock().port_by_name.get(name).copied()
    }

    pub fn name_for_port(&self, port: PortId) -> Option<String> {
        self.inner.lock().name_by_port.get(&port).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_requires_registration() {
        let registry = PortRegistry::new();
        assert!(registry.bind_ifindex("eth0", 5).is_none());

        registry.register(3, "eth0");
        assert_eq!(registry.bind_ifindex("eth0", 5), Some(3));
    }

    #[test]
    fn test_lookups_agree_after_bind() {
        let registry = PortRegistry::new();
        registry.register(3, "eth0");
        registry.bind_ifindex("eth0", 5);

        assert_eq!(registry.port_for_ifindex(5), Some(3));
        assert_eq!(registry.ifindex_for_port(3), Some(5));
        assert_eq!(registry.port_for_name("eth0"), Some(3));
        assert_eq!(registry.name_for_port(3).as_deref(), Some("eth0"));
    }

    #[test]
    fn test_unregister_clears_both_sides() {
        let registry = PortRegistry::new();
        registry.register(3, "eth0");
        registry.bind_ifindex("eth0", 5);
        registry.unregister(3);

        assert!(registry.port_for_ifindex(5).is_none());
        assert!(registry.ifindex_for_port(3).is_none());
        assert!(registry.port_for_name("eth0").is_none());
    }

    #[test]
    fn test_unbind_keeps_name_entry() {
        let registry = PortRegistry::new();
        registry.register(3, "eth0");
        registry.bind_ifindex("eth0", 5);
        registry.unbind_ifindex(5);

        assert!(registry.port_for_ifindex(5).is_none());
        assert_eq!(registry.port_for_name("eth0"), Some(3));
    }
}
