//! Brine sync: the reconcile cycle.
//!
//! A cycle authenticates once, then for each requested kind fetches the raw
//! records, synthesizes resources and merges them into the repository. Once
//! every kind is in, relations are derived and the cycle is published.

#![forbid(unsafe_code)]

pub mod classify;
pub mod config;
pub mod records;
pub mod relate;
pub mod rollup;
pub mod synth;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use brine_core::{BrineError, BrineResult, GraphRepository, Metadata, RelationKind, ResourceKind, Status};
use brine_saltapi::Transport;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{error, info, warn};

pub use config::SyncConfig;
pub use relate::RelationReport;
pub use rollup::ApplyReport;
pub use synth::CycleResources;

/// Kinds a cycle covers unless told otherwise.
pub const DEFAULT_KINDS: [ResourceKind; 3] = [ResourceKind::Host, ResourceKind::Service, ResourceKind::StateApplication];

/// Per-cycle ingestion counts.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CycleReport {
    /// Resources of each requested kind seen this cycle.
    pub counts: BTreeMap<ResourceKind, usize>,
    /// Records skipped as malformed.
    pub skipped: usize,
    pub relations: RelationReport,
    /// Services whose rolled-up status changed this cycle, with the new status.
    pub rolled_up: Vec<(String, Status)>,
    pub epoch: u64,
}

pub struct Reconciler {
    transport: Arc<dyn Transport>,
    repo: Arc<dyn GraphRepository>,
    config: SyncConfig,
}

impl Reconciler {
    pub fn new(transport: Arc<dyn Transport>, repo: Arc<dyn GraphRepository>, config: SyncConfig) -> Self {
        Self { transport, repo, config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn GraphRepository> {
        &self.repo
    }

    /// Run one full cycle over `kinds`.
    ///
    /// Authentication failure aborts before any query or write.
    pub async fn sync(&self, kinds: &[ResourceKind]) -> BrineResult<CycleReport> {
        let t0 = Instant::now();
        if let Err(e) = self.transport.authenticate(&self.config.credentials).await {
            error!(url = %self.config.credentials.url, error = %e, "authentication failed; cycle aborted");
            counter!("sync_auth_failures", 1u64);
            return Err(BrineError::Authentication(format!("{:#}", e)));
        }

        let mut cycle = CycleResources::default();
        let mut report = CycleReport::default();
        for &kind in kinds {
            let mut metadata = classify::fetch(self.transport.as_ref(), kind, self.config.query_timeout_secs).await;
            if kind == ResourceKind::Job {
                self.attach_job_results(&mut metadata).await;
            }
            let synthesis = synth::synthesize(kind, &metadata, &self.config);
            for draft in synthesis.drafts {
                let stored = synth::upsert_resource(self.repo.as_ref(), draft)?;
                cycle.record(stored);
            }
            let count = cycle.count(kind);
            info!(kind = %kind, count, skipped = synthesis.skipped.len(), "Processed {} {} resources", count, kind);
            counter!("sync_resources_total", count as u64, "kind" => kind.as_str());
            report.counts.insert(kind, count);
            report.skipped += synthesis.skipped.len();
        }

        let planned = relate::plan_relations(&self.config.namespace, &cycle, &self.config.controller_uid);
        let owners: BTreeSet<String> = planned
            .iter()
            .filter(|r| r.kind == RelationKind::InstanceOfStateOfService)
            .map(|r| r.target_uid.clone())
            .collect();
        report.relations = relate::apply_relations(self.repo.as_ref(), planned)?;
        info!(upserted = report.relations.upserted, dangling = report.relations.dangling, "Processed relations");

        // Edges to a service can first appear in a later cycle than the step outcomes.
        for service in owners {
            if self.repo.get(&self.config.namespace, ResourceKind::Service, &service)?.is_none() {
                continue;
            }
            if let Some(status) = self.recompute_status(&service)? {
                report.rolled_up.push((service, status));
            }
        }
        report.epoch = self.repo.publish()?;
        histogram!("sync_cycle_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(report)
    }

    /// Record an apply event's step outcomes and roll up the affected services.
    /// Must run after the state applications it refers to were synthesized.
    pub fn record_apply_event(&self, event: &Json) -> BrineResult<ApplyReport> {
        rollup::record_apply_event(self.repo.as_ref(), &self.config.namespace, event)
    }

    pub fn recompute_status(&self, service_uid: &str) -> BrineResult<Option<Status>> {
        rollup::recompute_status(self.repo.as_ref(), &self.config.namespace, service_uid)
    }

    async fn attach_job_results(&self, jobs: &mut Metadata) {
        for (jid, job) in jobs.iter_mut() {
            let Some(body) = job.as_object_mut() else { continue };
            let is_apply = body.get("Function").and_then(Json::as_str).map(records::is_apply_function).unwrap_or(false);
            if !is_apply {
                continue;
            }
            let result = match self.transport.lookup_jid(jid).await {
                Ok(resp) => classify::normalize(resp.into_first()),
                Err(e) => {
                    warn!(jid = %jid, error = %e, "job result lookup failed");
                    Metadata::new()
                }
            };
            body.insert("Result".into(), Json::Object(result));
        }
    }
}
