//! In-memory mirror of kernel link and bridge-neighbor state.
//!
//! The cache is never the source of truth; the kernel is. Writes happen
//! only from the event pump, reads are copy-out so no caller ever holds
//! a reference into the cache. On any mismatch the periodic resync wins.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::types::{BridgeNeighbor, LinkSnapshot};

#[derive(Default)]
struct Inner {
    links: HashMap<u32, LinkSnapshot>,
    names: HashMap<String, u32>,
    neighbors: HashMap<u32, HashSet<BridgeNeighbor>>,
}

#[derive(Default)]
pub struct ObjectCache {
    inner: RwLock<Inner>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_link(&self, ifindex: u32) -> Option<LinkSnapshot> {
        self.inner.read().links.get(&ifindex).cloned()
    }

    pub fn get_link_by_name(&self, name: &str) -> Option<LinkSnapshot> {
        let inner = self.inner.read();
        let ifindex = inner.names.get(name)?;
        inner.links.get(ifindex).cloned()
    }

    /// Upsert by interface index; returns the replaced snapshot, which
    /// callers use as the "old" side of a change.
    pub fn upsert_link(&self, link: LinkSnapshot) -> Option<LinkSnapshot> {
        let mut inner = self.inner.write();
        let prior = inner.links.insert(link.ifindex, link.clone());
        if let Some(ref old) = prior {
            if old.name != link.name {
                inner.names.remove(&old.name);
            }
        }
        inner.names.insert(link.name, link.ifindex);
        prior
    }

    /// Drops a link and its neighbor set, returning both.
    pub fn drop_link(&self, ifindex: u32) -> (Option<LinkSnapshot>, Vec<BridgeNeighbor>) {
        let mut inner = self.inner.write();
        let link = inner.links.remove(&ifindex);
        if let Some(ref link) = link {
            inner.names.remove(&link.name);
        }
        let neighbors = inner
            .neighbors
            .remove(&ifindex)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        (link, neighbors)
    }

    /// Returns true if the entry was not already present.
    pub fn upsert_neighbor(&self, neighbor: BridgeNeighbor) -> bool {
        self.inner
            .write()
            .neighbors
            .entry(neighbor.ifindex)
            .or_default()
            .insert(neighbor)
    }

    /// Returns true if the entry existed.
    pub fn drop_neighbor(&self, neighbor: &BridgeNeighbor) -> bool {
        let mut inner = self.inner.write();
        let Some(set) = inner.neighbors.get_mut(&neighbor.ifindex) else {
            return false;
        };
        let existed = set.remove(neighbor);
        if set.is_empty() {
            inner.neighbors.remove(&neighbor.ifindex);
        }
        existed
    }

    pub fn neighbors_of(&self, ifindex: u32) -> Vec<BridgeNeighbor> {
        self.inner
            .read()
            .neighbors
            .get(&ifindex)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn links(&self) -> Vec<LinkSnapshot> {
        self.inner.read().links.values().cloned().collect()
    }

    pub fn neighbors(&self) -> Vec<BridgeNeighbor> {
        self.inner
            .read()
            .neighbors
            .values()
            .flat_map(|set| set.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swbridge_types::MacAddress;

    fn link(ifindex: u32, name: &str) -> LinkSnapshot {
        LinkSnapshot {
            ifindex,
            name: name.to_string(),
            mac: MacAddress::ZERO,
            flags: 0,
            mtu: 1500,
            master: 0,
            bridge_vlans: None,
        }
    }

    #[test]
    fn test_upsert_returns_prior_snapshot() {
        let cache = ObjectCache::new();
        assert!(cache.upsert_link(link(5, "eth0")).is_none());

        let mut updated = link(5, "eth0");
        updated.mtu = 9000;
        let prior = cache.upsert_link(updated).unwrap();
        assert_eq!(prior.mtu, 1500);
        assert_eq!(cache.get_link(5).unwrap().mtu, 9000);
    }

    #[test]
    fn test_rename_updates_name_index() {
        let cache = ObjectCache::new();
        cache.upsert_link(link(5, "eth0"));
        cache.upsert_link(link(5, "lan0"));
        assert!(cache.get_link_by_name("eth0").is_none());
        assert_eq!(cache.get_link_by_name("lan0").unwrap().ifindex, 5);
    }

    #[test]
    fn test_drop_link_returns_neighbors() {
        let cache = ObjectCache::new();
        cache.upsert_link(link(5, "eth0"));
        let neigh = BridgeNeighbor {
            ifindex: 5,
            vlan: 20,
            mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
        };
        assert!(cache.upsert_neighbor(neigh.clone()));
        assert!(!cache.upsert_neighbor(neigh.clone()));

        let (dropped, neighbors) = cache.drop_link(5);
        assert_eq!(dropped.unwrap().name, "eth0");
        assert_eq!(neighbors, vec![neigh]);
        assert!(cache.get_link(5).is_none());
        assert!(cache.neighbors_of(5).is_empty());
    }

    #[test]
    fn test_drop_neighbor() {
        let cache = ObjectCache::new();
        let neigh = BridgeNeighbor {
            ifindex: 3,
            vlan: 10,
            mac: MacAddress::BROADCAST,
        };
        cache.upsert_neighbor(neigh.clone());
        assert!(cache.drop_neighbor(&neigh));
        assert!(!cache.drop_neighbor(&neigh));
    }
}
