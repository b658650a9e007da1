//! Cluster meta: the replicated raft-address to API-address map.
//!
//! Mutated only by applied `SetPeer` commands (merge semantics). Reads
//! project the stored map against the live peer set, pruning entries whose
//! raft address has left the cluster.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;

use parking_lot::RwLock;

/// Raft-address -> API-address map guarded by a reader-writer lock.
#[derive(Default)]
pub struct ClusterMeta {
    api_peers: RwLock<HashMap<String, String>>,
}

impl ClusterMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `peers` into the map, overwriting existing raft addresses.
    pub fn merge(&self, peers: &BTreeMap<String, String>) {
        let mut map = self.api_peers.write();
        for (raft_addr, api_addr) in peers {
            map.insert(raft_addr.clone(), api_addr.clone());
        }
    }

    /// API address for `raft_addr`, if known.
    pub fn addr_for_peer(&self, raft_addr: &str) -> Option<String> {
        self.api_peers.read().get(raft_addr).cloned()
    }

    /// The map restricted to `live` raft addresses. Entries for departed
    /// peers are deleted in place before the projection is returned.
    pub fn project(&self, live: &HashSet<String>) -> HashMap<String, String> {
        let mut map = self.api_peers.write();
        map.retain(|raft_addr, _| live.contains(raft_addr));
        map.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overwrites_existing_entries() {
        let meta = ClusterMeta::new();
        let mut first = BTreeMap::new();
        first.insert("r1".to_string(), "api1".to_string());
        meta.merge(&first);

        let mut second = BTreeMap::new();
        second.insert("r1".to_string(), "api1-new".to_string());
        second.insert("r2".to_string(), "api2".to_string());
        meta.merge(&second);

        assert_eq!(meta.addr_for_peer("r1").as_deref(), Some("api1-new"));
        assert_eq!(meta.addr_for_peer("r2").as_deref(), Some("api2"));
    }

    #[test]
    fn project_prunes_departed_peers() {
        let meta = ClusterMeta::new();
        let mut peers = BTreeMap::new();
        peers.insert("r1".to_string(), "api1".to_string());
        peers.insert("gone".to_string(), "api-gone".to_string());
        meta.merge(&peers);

        let live: HashSet<String> = ["r1".to_string()].into_iter().collect();
        let projected = meta.project(&live);

        assert_eq!(projected.len(), 1);
        assert_eq!(projected.get("r1").map(String::as_str), Some("api1"));
        // The stale entry was removed in place, not only filtered.
        assert_eq!(meta.addr_for_peer("gone"), None);
    }
}
