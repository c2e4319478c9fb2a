//! Brine store: in-RAM graph repository with frozen snapshots swapped in at
//! the end of every reconcile cycle.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use brine_core::{GraphRepository, Relation, RelationKind, Resource, ResourceKind};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Immutable view of the whole graph as of one published cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub epoch: u64,
    /// Unix seconds at publish time.
    pub taken_at: i64,
    /// Sorted by namespace, kind, uid.
    pub resources: Vec<Resource>,
    pub relations: Vec<Relation>,
}

impl GraphSnapshot {
    pub fn by_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(move |r| r.kind == kind)
    }
}

type ResKey = (String, ResourceKind, String);

#[derive(Default)]
struct Tables {
    resources: FxHashMap<ResKey, Resource>,
    relations: BTreeSet<Relation>,
    resource_writes: u64,
}

/// Read-your-writes repository kept entirely in memory.
pub struct MemoryGraph {
    tables: RwLock<Tables>,
    snap: Arc<ArcSwap<GraphSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    epoch_rx: watch::Receiver<u64>,
}

/// Handle for readers to access the last published snapshot and subscribe to swaps.
#[derive(Clone)]
pub struct GraphHandle {
    snap: Arc<ArcSwap<GraphSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl GraphHandle {
    pub fn current(&self) -> Arc<GraphSnapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    pub fn new() -> Self {
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        Self {
            tables: RwLock::new(Tables::default()),
            snap: Arc::new(ArcSwap::from_pointee(GraphSnapshot::default())),
            epoch_tx,
            epoch_rx,
        }
    }

    pub fn handle(&self) -> GraphHandle {
        GraphHandle { snap: Arc::clone(&self.snap), epoch_rx: self.epoch_rx.clone() }
    }

    /// Number of resource upserts accepted so far.
    pub fn resource_writes(&self) -> u64 {
        self.read().map(|t| t.resource_writes).unwrap_or(0)
    }

    pub fn relation_count(&self) -> usize {
        self.read().map(|t| t.relations.len()).unwrap_or(0)
    }

    /// Freeze the current tables into a snapshot without publishing it.
    pub fn freeze(&self) -> Result<GraphSnapshot> {
        let tables = self.read()?;
        let mut resources: Vec<Resource> = tables.resources.values().cloned().collect();
        resources.sort_by(|a, b| a.namespace.cmp(&b.namespace).then(a.kind.cmp(&b.kind)).then(a.uid.cmp(&b.uid)));
        Ok(GraphSnapshot {
            epoch: *self.epoch_rx.borrow(),
            taken_at: chrono::Utc::now().timestamp(),
            resources,
            relations: tables.relations.iter().cloned().collect(),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| anyhow!("graph store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| anyhow!("graph store lock poisoned"))
    }
}

impl GraphRepository for MemoryGraph {
    fn get(&self, namespace: &str, kind: ResourceKind, uid: &str) -> Result<Option<Resource>> {
        let key = (namespace.to_string(), kind, uid.to_string());
        Ok(self.read()?.resources.get(&key).cloned())
    }

    fn list_kind(&self, namespace: &str, kind: ResourceKind) -> Result<BTreeMap<String, Resource>> {
        let tables = self.read()?;
        Ok(tables
            .resources
            .values()
            .filter(|r| r.kind == kind && r.namespace == namespace)
            .map(|r| (r.uid.clone(), r.clone()))
            .collect())
    }

    fn upsert(&self, resource: Resource) -> Result<()> {
        let key = (resource.namespace.clone(), resource.kind, resource.uid.clone());
        let mut tables = self.write()?;
        tables.resources.insert(key, resource);
        tables.resource_writes += 1;
        counter!("store_resource_upserts", 1u64);
        Ok(())
    }

    fn relations_from(&self, namespace: &str, source_uid: &str, kind: RelationKind) -> Result<Vec<Relation>> {
        let tables = self.read()?;
        Ok(tables
            .relations
            .iter()
            .filter(|r| r.kind == kind && r.namespace == namespace && r.source_uid == source_uid)
            .cloned()
            .collect())
    }

    fn relations_to(&self, namespace: &str, target_uid: &str, kind: RelationKind) -> Result<Vec<Relation>> {
        let tables = self.read()?;
        Ok(tables
            .relations
            .iter()
            .filter(|r| r.kind == kind && r.namespace == namespace && r.target_uid == target_uid)
            .cloned()
            .collect())
    }

    fn upsert_relation(&self, relation: Relation) -> Result<()> {
        let inserted = self.write()?.relations.insert(relation);
        if inserted {
            counter!("store_relation_inserts", 1u64);
        }
        Ok(())
    }

    fn publish(&self) -> Result<u64> {
        let mut next = self.freeze()?;
        next.epoch = next.epoch.saturating_add(1);
        let epoch = next.epoch;
        gauge!("store_resources", next.resources.len() as f64);
        gauge!("store_relations", next.relations.len() as f64);
        debug!(epoch, resources = next.resources.len(), relations = next.relations.len(), "graph snapshot published");
        self.snap.store(Arc::new(next));
        let _ = self.epoch_tx.send(epoch);
        Ok(epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_by_namespace_kind_uid() {
        let g = MemoryGraph::new();
        g.upsert(Resource::new("a", ResourceKind::Host, "h1", "h1")).unwrap();
        g.upsert(Resource::new("a", ResourceKind::Host, "h1", "renamed")).unwrap();
        g.upsert(Resource::new("b", ResourceKind::Host, "h1", "other ns")).unwrap();
        g.upsert(Resource::new("a", ResourceKind::User, "h1", "same uid, other kind")).unwrap();

        let hosts = g.list_kind("a", ResourceKind::Host).unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts["h1"].label, "renamed");
        assert_eq!(g.get("b", ResourceKind::Host, "h1").unwrap().unwrap().label, "other ns");
        assert!(g.get("a", ResourceKind::Service, "h1").unwrap().is_none());
        assert_eq!(g.resource_writes(), 4);
    }

    #[test]
    fn relations_are_deduplicated_and_traversable_both_ways() {
        let g = MemoryGraph::new();
        let rel = Relation::new("a", RelationKind::RunsOnHost, "h1|nginx", "h1");
        g.upsert_relation(rel.clone()).unwrap();
        g.upsert_relation(rel.clone()).unwrap();
        g.upsert_relation(Relation::new("a", RelationKind::RunsOnHost, "h1|redis", "h1")).unwrap();
        assert_eq!(g.relation_count(), 2);

        assert_eq!(g.relations_from("a", "h1|nginx", RelationKind::RunsOnHost).unwrap(), vec![rel]);
        assert_eq!(g.relations_to("a", "h1", RelationKind::RunsOnHost).unwrap().len(), 2);
        assert!(g.relations_to("a", "h1", RelationKind::AppliedToHost).unwrap().is_empty());
        assert!(g.relations_to("b", "h1", RelationKind::RunsOnHost).unwrap().is_empty());
    }
}
