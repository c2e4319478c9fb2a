//! Relation synthesizer: derives the fixed set of cross-kind edges from the
//! resources ingested in a cycle.

use std::collections::BTreeSet;

use anyhow::Result;
use brine_core::{composite_uid, split_composite_uid, BrineError, GraphRepository, Relation, RelationKind, Resource, ResourceKind};
use metrics::counter;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{error, warn};

use crate::records::{owning_service_uid, required_str};
use crate::synth::CycleResources;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RelationReport {
    pub upserted: usize,
    /// Planned relations dropped because an endpoint does not exist.
    pub dangling: usize,
}

/// Plan every relation implied by `cycle`. Pure; order is deterministic and
/// duplicates are collapsed.
pub fn plan_relations(namespace: &str, cycle: &CycleResources, controller_uid: &str) -> Vec<Relation> {
    let mut out = BTreeSet::new();
    let rel = |kind, source: &str, target: &str| Relation::new(namespace, kind, source, target);

    for host in cycle.of_kind(ResourceKind::Host) {
        out.insert(rel(RelationKind::BelongsToController, &host.uid, controller_uid));
    }

    for service in cycle.of_kind(ResourceKind::Service) {
        match split_composite_uid(&service.uid) {
            Some((host, _)) => {
                out.insert(rel(RelationKind::RunsOnHost, &service.uid, host));
            }
            None => warn!(service = %service.uid, "service uid has no host part; relation skipped"),
        }
    }

    for step in cycle.of_kind(ResourceKind::StateApplication) {
        match step_service(step) {
            Ok(service) => {
                out.insert(rel(RelationKind::InstanceOfStateOfService, &step.uid, &service));
            }
            Err(e) => warn!(step = %step.uid, error = %e, "relation to owning service skipped"),
        }
    }

    for job in cycle.of_kind(ResourceKind::Job) {
        match required_str(&job.metadata, "User", &format!("job {}", job.uid)) {
            Ok(user) => {
                out.insert(rel(RelationKind::PerformedByUser, &job.uid, user));
            }
            Err(e) => warn!(error = %e, "relation to acting user skipped"),
        }
        let Some(results) = job.metadata.get("Result").and_then(Json::as_object) else {
            continue;
        };
        for (host, result) in results {
            out.insert(rel(RelationKind::AppliedToHost, &job.uid, host));
            match result {
                Json::Object(steps) => {
                    for step in steps.values() {
                        if let Some(id) = step.get("__id__").and_then(Json::as_str) {
                            out.insert(rel(RelationKind::AppliedStateStep, &job.uid, &composite_uid(host, id)));
                        }
                    }
                }
                Json::Array(errors) => {
                    error!(job = %job.uid, host = %host, error = ?errors.first(), "job returned errors instead of step outcomes");
                }
                _ => {}
            }
        }
    }

    out.into_iter().collect()
}

fn step_service(step: &Resource) -> Result<String, BrineError> {
    let entity = format!("state application {}", step.uid);
    let host = required_str(&step.metadata, "minion", &entity)?;
    let sls = required_str(&step.metadata, "__sls__", &entity)?;
    owning_service_uid(host, sls)
}

/// Upsert planned relations whose endpoints both exist; log and drop the rest.
pub fn apply_relations(repo: &dyn GraphRepository, relations: Vec<Relation>) -> Result<RelationReport> {
    let mut report = RelationReport::default();
    for relation in relations {
        let missing = if repo.get(&relation.namespace, relation.kind.source_kind(), &relation.source_uid)?.is_none() {
            Some(BrineError::dangling(relation.kind.source_kind(), &relation.source_uid))
        } else if repo.get(&relation.namespace, relation.kind.target_kind(), &relation.target_uid)?.is_none() {
            Some(BrineError::dangling(relation.kind.target_kind(), &relation.target_uid))
        } else {
            None
        };
        if let Some(err) = missing {
            warn!(kind = %relation.kind, source = %relation.source_uid, target = %relation.target_uid, error = %err, "relation skipped");
            counter!("sync_skipped_total", 1u64, "reason" => err.tag());
            report.dangling += 1;
            continue;
        }
        repo.upsert_relation(relation)?;
        report.upserted += 1;
    }
    counter!("sync_relations_total", report.upserted as u64);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(kind: ResourceKind, uid: &str, meta: Json) -> Resource {
        Resource::new("salt", kind, uid, uid).with_metadata(meta.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn plans_all_four_rule_families() {
        let mut cycle = CycleResources::default();
        cycle.record(resource(ResourceKind::Host, "h1", json!({})));
        cycle.record(resource(ResourceKind::Service, "h1|nginx", json!({})));
        cycle.record(resource(
            ResourceKind::StateApplication,
            "h1|nginx_pkg",
            json!({"minion": "h1", "__sls__": "nginx.server"}),
        ));
        cycle.record(resource(
            ResourceKind::StateApplication,
            "h1|lonely",
            json!({"minion": "h1", "__sls__": "top"}),
        ));
        cycle.record(resource(
            ResourceKind::Job,
            "100",
            json!({"User": "sudo_alice", "Result": {
                "h1": {"pkg_|-nginx_pkg_|-nginx_|-installed": {"__id__": "nginx_pkg", "result": true}},
                "h2": ["Rendering SLS 'base:nginx' failed"],
            }}),
        ));

        let planned = plan_relations("salt", &cycle, "salt-master");
        let got: Vec<(RelationKind, &str, &str)> =
            planned.iter().map(|r| (r.kind, r.source_uid.as_str(), r.target_uid.as_str())).collect();
        assert_eq!(
            got,
            vec![
                (RelationKind::BelongsToController, "h1", "salt-master"),
                (RelationKind::RunsOnHost, "h1|nginx", "h1"),
                (RelationKind::InstanceOfStateOfService, "h1|nginx_pkg", "h1|nginx"),
                (RelationKind::PerformedByUser, "100", "sudo_alice"),
                (RelationKind::AppliedToHost, "100", "h1"),
                (RelationKind::AppliedToHost, "100", "h2"),
                (RelationKind::AppliedStateStep, "100", "h1|nginx_pkg"),
            ]
        );
    }
}
