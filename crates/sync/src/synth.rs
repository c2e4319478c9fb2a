//! Resource synthesizer: turns one kind's normalized records into resource
//! drafts, and merges drafts into the repository.

use std::collections::BTreeMap;

use anyhow::Result;
use brine_core::{composite_uid, BrineError, GraphRepository, Metadata, Resource, ResourceKind};
use metrics::counter;
use serde_json::{json, Value as Json};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::records::{shape, JobRecord, Lowstate};

/// Drafts produced from one kind's records plus the entities that were skipped.
#[derive(Debug, Default)]
pub struct Synthesis {
    pub drafts: Vec<Resource>,
    pub skipped: Vec<BrineError>,
}

impl Synthesis {
    fn skip(&mut self, kind: ResourceKind, err: BrineError) {
        warn!(kind = %kind, error = %err, "skipping record");
        counter!("sync_skipped_total", 1u64, "reason" => err.tag());
        self.skipped.push(err);
    }
}

/// Resources seen during the current cycle, by kind then uid.
#[derive(Debug, Default, Clone)]
pub struct CycleResources {
    by_kind: BTreeMap<ResourceKind, BTreeMap<String, Resource>>,
}

impl CycleResources {
    pub fn record(&mut self, resource: Resource) {
        self.by_kind.entry(resource.kind).or_default().insert(resource.uid.clone(), resource);
    }

    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &Resource> {
        self.by_kind.get(&kind).into_iter().flat_map(|m| m.values())
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.by_kind.get(&kind).map(|m| m.len()).unwrap_or(0)
    }
}

/// Build drafts for `kind` from its records. Per-entity problems are logged
/// and skipped; they never abort the batch.
pub fn synthesize(kind: ResourceKind, metadata: &Metadata, config: &SyncConfig) -> Synthesis {
    match kind {
        ResourceKind::Host => hosts(metadata, config),
        ResourceKind::Service => services(metadata, config),
        ResourceKind::StateApplication => state_applications(metadata, config),
        ResourceKind::Job => jobs(metadata, config),
        // Only ever emitted alongside hosts and jobs.
        ResourceKind::Controller | ResourceKind::User => Synthesis::default(),
    }
}

fn hosts(metadata: &Metadata, config: &SyncConfig) -> Synthesis {
    let ns = config.namespace.as_str();
    let mut out = Synthesis::default();
    out.drafts.push(Resource::new(ns, ResourceKind::Controller, &config.controller_uid, &config.controller_uid));
    for (host, grains) in metadata {
        // Non-responding minions answer with a scalar.
        if !grains.is_object() {
            warn!(host = %host, got = shape(grains), "grains are not a mapping; host kept without inventory");
        }
        let mut meta = Metadata::new();
        meta.insert("grains".into(), grains.clone());
        out.drafts.push(Resource::new(ns, ResourceKind::Host, host, host).with_metadata(meta));
    }
    out
}

fn services(metadata: &Metadata, config: &SyncConfig) -> Synthesis {
    let ns = config.namespace.as_str();
    let mut out = Synthesis::default();
    for (host, pillar) in metadata {
        let Some(pillar) = pillar.as_object() else {
            out.skip(
                ResourceKind::Service,
                BrineError::malformed(format!("pillar of {}", host), format!("expected a mapping, got {}", shape(pillar))),
            );
            continue;
        };
        for (name, service) in pillar {
            if config.service_exclude.contains(name) {
                continue;
            }
            if !service.is_object() {
                out.skip(
                    ResourceKind::Service,
                    BrineError::malformed(format!("service {} on {}", name, host), format!("expected a mapping, got {}", shape(service))),
                );
                continue;
            }
            let mut meta = Metadata::new();
            meta.insert("pillar".into(), service.clone());
            out.drafts.push(Resource::new(ns, ResourceKind::Service, composite_uid(host, name), name).with_metadata(meta));
        }
    }
    out
}

fn state_applications(metadata: &Metadata, config: &SyncConfig) -> Synthesis {
    let ns = config.namespace.as_str();
    let mut out = Synthesis::default();
    for (host, steps) in metadata {
        let Some(steps) = steps.as_array() else {
            out.skip(
                ResourceKind::StateApplication,
                BrineError::malformed(format!("lowstate of {}", host), format!("expected a sequence, got {}", shape(steps))),
            );
            continue;
        };
        for raw in steps {
            let step = match Lowstate::parse(host, raw) {
                Ok(step) => step,
                Err(e) => {
                    out.skip(ResourceKind::StateApplication, e);
                    continue;
                }
            };
            let mut meta = step.body.clone();
            meta.insert("minion".into(), Json::String(host.clone()));
            out.drafts.push(
                Resource::new(ns, ResourceKind::StateApplication, composite_uid(host, step.id), step.label()).with_metadata(meta),
            );
        }
    }
    out
}

fn jobs(metadata: &Metadata, config: &SyncConfig) -> Synthesis {
    let ns = config.namespace.as_str();
    let mut out = Synthesis::default();
    for (jid, raw) in metadata {
        let job = match JobRecord::parse(jid, raw) {
            Ok(job) => job,
            Err(e) => {
                out.skip(ResourceKind::Job, e);
                continue;
            }
        };
        if !job.is_apply() {
            debug!(jid = %jid, function = %job.function, "ignoring non-apply job");
            continue;
        }
        let mut meta = job.body.clone();
        meta.entry("Result").or_insert_with(|| json!({}));
        out.drafts.push(Resource::new(ns, ResourceKind::Job, jid, job.function).with_metadata(meta));
        out.drafts.push(Resource::new(ns, ResourceKind::User, job.user, job.user_label()));
    }
    out
}

/// Merge `draft` into the repository and return the stored result.
///
/// New UIDs are inserted as is. Known UIDs absorb the draft and are written
/// only when that changed something.
pub fn upsert_resource(repo: &dyn GraphRepository, draft: Resource) -> Result<Resource> {
    match repo.get(&draft.namespace, draft.kind, &draft.uid)? {
        Some(mut stored) => {
            if stored.absorb(draft) {
                repo.upsert(stored.clone())?;
            }
            Ok(stored)
        }
        None => {
            repo.upsert(draft.clone())?;
            Ok(draft)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brine_saltapi::Credentials;

    fn config() -> SyncConfig {
        SyncConfig::new(Credentials::new("http://salt", "u", "p")).with_namespace("salt")
    }

    fn meta(v: Json) -> Metadata {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn hosts_emit_controller_and_grains() {
        let out = synthesize(ResourceKind::Host, &meta(json!({"h1": {"os": "linux"}})), &config());
        assert!(out.skipped.is_empty());
        assert_eq!(out.drafts.len(), 2);
        assert_eq!(out.drafts[0].kind, ResourceKind::Controller);
        assert_eq!(out.drafts[0].uid, "salt-master");
        assert_eq!(out.drafts[1].uid, "h1");
        assert_eq!(out.drafts[1].metadata["grains"], json!({"os": "linux"}));
    }

    #[test]
    fn unresponsive_hosts_are_kept() {
        let out = synthesize(ResourceKind::Host, &meta(json!({"h1": false, "h2": {"os": "linux"}})), &config());
        assert!(out.skipped.is_empty());
        let uids: Vec<&str> = out.drafts.iter().map(|r| r.uid.as_str()).collect();
        assert_eq!(uids, vec!["salt-master", "h1", "h2"]);
        assert_eq!(out.drafts[1].metadata["grains"], json!(false));
    }

    #[test]
    fn services_skip_excluded_and_malformed_individually() {
        let raw = meta(json!({
            "h1": {"nginx": {"enabled": true}, "_param": {"x": 1}, "broken": "yes", "redis": {}},
            "h2": ["not", "a", "mapping"],
        }));
        let out = synthesize(ResourceKind::Service, &raw, &config());
        let uids: Vec<&str> = out.drafts.iter().map(|r| r.uid.as_str()).collect();
        assert_eq!(uids, vec!["h1|nginx", "h1|redis"]);
        assert_eq!(out.drafts[0].label, "nginx");
        assert_eq!(out.drafts[0].metadata["pillar"], json!({"enabled": true}));
        assert_eq!(out.skipped.len(), 2);
    }

    #[test]
    fn state_applications_inject_minion() {
        let raw = meta(json!({"h1": [
            {"__id__": "nginx_pkg", "state": "pkg", "fun": "installed", "__sls__": "nginx.server"},
            {"state": "file"},
            "garbage",
        ]}));
        let out = synthesize(ResourceKind::StateApplication, &raw, &config());
        assert_eq!(out.drafts.len(), 1);
        assert_eq!(out.skipped.len(), 2);
        let step = &out.drafts[0];
        assert_eq!(step.uid, "h1|nginx_pkg");
        assert_eq!(step.label, "pkg nginx_pkg");
        assert_eq!(step.metadata["minion"], json!("h1"));
        assert_eq!(step.metadata["fun"], json!("installed"));
    }

    #[test]
    fn jobs_keep_only_apply_functions_and_emit_users() {
        let raw = meta(json!({
            "100": {"Function": "state.apply", "User": "sudo_alice", "Result": {"h1": {}}},
            "101": {"Function": "test.ping", "User": "root"},
            "102": {"User": "root"},
        }));
        let out = synthesize(ResourceKind::Job, &raw, &config());
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.drafts.len(), 2);
        assert_eq!(out.drafts[0].kind, ResourceKind::Job);
        assert_eq!(out.drafts[0].label, "state.apply");
        assert_eq!(out.drafts[1].kind, ResourceKind::User);
        assert_eq!(out.drafts[1].uid, "sudo_alice");
        assert_eq!(out.drafts[1].label, "alice");
    }
}
