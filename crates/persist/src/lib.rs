//! Brine persistence: SQLite-backed graph repository.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use brine_core::{GraphRepository, Metadata, Relation, RelationKind, Resource, ResourceKind, Status};
use metrics::{counter, histogram};
use tracing::debug;

/// SQLite-backed repository. Simple, synchronous; one connection behind a mutex.
pub struct SqliteGraph {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteGraph {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("BRINE_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    /// Open (and migrate) the database at `path`; `:memory:` is accepted.
    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS resources (
                namespace  TEXT NOT NULL,
                kind       TEXT NOT NULL,
                uid        TEXT NOT NULL,
                label      TEXT NOT NULL,
                status     TEXT NOT NULL,
                metadata   TEXT NOT NULL,
                updated_ts INTEGER NOT NULL,
                PRIMARY KEY (namespace, kind, uid)
            );
            CREATE TABLE IF NOT EXISTS relations (
                namespace  TEXT NOT NULL,
                kind       TEXT NOT NULL,
                source_uid TEXT NOT NULL,
                target_uid TEXT NOT NULL,
                PRIMARY KEY (namespace, kind, source_uid, target_uid)
            );
            CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(namespace, kind, target_uid);
            CREATE TABLE IF NOT EXISTS cycles (
                epoch INTEGER PRIMARY KEY AUTOINCREMENT,
                ts    INTEGER NOT NULL
            );",
        )
        .context("creating graph tables")?;
        let me = Self { db: Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    fn query_resources(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Resource>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let namespace: String = row.get(0)?;
            let kind: String = row.get(1)?;
            let uid: String = row.get(2)?;
            let label: String = row.get(3)?;
            let status: String = row.get(4)?;
            let metadata: String = row.get(5)?;
            let metadata: Metadata = serde_json::from_str(&metadata)
                .with_context(|| format!("decoding metadata of {} {}", kind, uid))?;
            out.push(Resource {
                namespace,
                kind: kind.parse::<ResourceKind>()?,
                uid,
                label,
                status: status.parse::<Status>()?,
                metadata,
            });
        }
        Ok(out)
    }

    fn query_relations(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Relation>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let namespace: String = row.get(0)?;
            let kind: String = row.get(1)?;
            let source_uid: String = row.get(2)?;
            let target_uid: String = row.get(3)?;
            out.push(Relation { namespace, kind: kind.parse::<RelationKind>()?, source_uid, target_uid });
        }
        Ok(out)
    }
}

impl GraphRepository for SqliteGraph {
    fn get(&self, namespace: &str, kind: ResourceKind, uid: &str) -> Result<Option<Resource>> {
        let started = std::time::Instant::now();
        let mut found = self.query_resources(
            "SELECT namespace, kind, uid, label, status, metadata FROM resources
             WHERE namespace = ?1 AND kind = ?2 AND uid = ?3",
            &[&namespace, &kind.as_str(), &uid],
        )?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(found.pop())
    }

    fn list_kind(&self, namespace: &str, kind: ResourceKind) -> Result<BTreeMap<String, Resource>> {
        let rows = self.query_resources(
            "SELECT namespace, kind, uid, label, status, metadata FROM resources
             WHERE namespace = ?1 AND kind = ?2 ORDER BY uid",
            &[&namespace, &kind.as_str()],
        )?;
        Ok(rows.into_iter().map(|r| (r.uid.clone(), r)).collect())
    }

    fn upsert(&self, resource: Resource) -> Result<()> {
        let started = std::time::Instant::now();
        let metadata = serde_json::to_string(&resource.metadata).context("encoding resource metadata")?;
        self.conn()?
            .execute(
                "INSERT INTO resources(namespace, kind, uid, label, status, metadata, updated_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(namespace, kind, uid) DO UPDATE SET
                     label = excluded.label,
                     status = excluded.status,
                     metadata = excluded.metadata,
                     updated_ts = excluded.updated_ts",
                (
                    &resource.namespace,
                    resource.kind.as_str(),
                    &resource.uid,
                    &resource.label,
                    resource.status.as_str(),
                    &metadata,
                    now_ts(),
                ),
            )
            .with_context(|| format!("upserting {} {}", resource.kind, resource.uid))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn relations_from(&self, namespace: &str, source_uid: &str, kind: RelationKind) -> Result<Vec<Relation>> {
        self.query_relations(
            "SELECT namespace, kind, source_uid, target_uid FROM relations
             WHERE namespace = ?1 AND kind = ?2 AND source_uid = ?3 ORDER BY target_uid",
            &[&namespace, &kind.as_str(), &source_uid],
        )
    }

    fn relations_to(&self, namespace: &str, target_uid: &str, kind: RelationKind) -> Result<Vec<Relation>> {
        self.query_relations(
            "SELECT namespace, kind, source_uid, target_uid FROM relations
             WHERE namespace = ?1 AND kind = ?2 AND target_uid = ?3 ORDER BY source_uid",
            &[&namespace, &kind.as_str(), &target_uid],
        )
    }

    fn upsert_relation(&self, relation: Relation) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR IGNORE INTO relations(namespace, kind, source_uid, target_uid) VALUES (?1, ?2, ?3, ?4)",
                (&relation.namespace, relation.kind.as_str(), &relation.source_uid, &relation.target_uid),
            )
            .with_context(|| format!("upserting relation {} {} -> {}", relation.kind, relation.source_uid, relation.target_uid))?;
        Ok(())
    }

    fn publish(&self) -> Result<u64> {
        let db = self.conn()?;
        db.execute("INSERT INTO cycles(ts) VALUES (?1)", [now_ts()]).context("recording cycle")?;
        let epoch = db.last_insert_rowid() as u64;
        debug!(epoch, "sqlite cycle recorded");
        Ok(epoch)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".brine");
        let _ = std::fs::create_dir_all(&p);
        p.push("brine.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "brine.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}
