//! Apply-outcome recording and the service status rollup.

use std::collections::BTreeSet;

use brine_core::{composite_uid, BrineError, BrineResult, GraphRepository, RelationKind, ResourceKind, Status};
use metrics::counter;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::records::{as_mapping, owning_service_uid, required_str, truthy, ApplyEvent};

/// What one apply event changed.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ApplyReport {
    /// Outcomes newly recorded on a state application.
    pub recorded: usize,
    /// Outcomes whose job id was already recorded on that step.
    pub duplicates: usize,
    pub skipped: usize,
    /// Services whose rolled-up status changed, with the new status.
    pub services: Vec<(String, Status)>,
}

/// Roll dependent step statuses up into a service status.
///
/// Any `Error` wins, then any `Unknown` makes the service `Build`, otherwise
/// it is `Active`. No dependents means no opinion.
pub fn rollup<I>(statuses: I) -> Option<Status>
where
    I: IntoIterator<Item = Status>,
{
    let mut seen = false;
    let mut errors = 0usize;
    let mut unknown = 0usize;
    for status in statuses {
        seen = true;
        match status {
            Status::Error => errors += 1,
            Status::Unknown => unknown += 1,
            Status::Active | Status::Build => {}
        }
    }
    if !seen {
        None
    } else if errors > 0 {
        Some(Status::Error)
    } else if unknown > 0 {
        Some(Status::Build)
    } else {
        Some(Status::Active)
    }
}

/// Recompute the status of service `service_uid` from the state applications
/// pointing at it. Writes, and returns the new status, only on change.
pub fn recompute_status(repo: &dyn GraphRepository, namespace: &str, service_uid: &str) -> BrineResult<Option<Status>> {
    let Some(mut service) = repo.get(namespace, ResourceKind::Service, service_uid)? else {
        let err = BrineError::dangling(ResourceKind::Service, service_uid);
        warn!(error = %err, "rollup skipped");
        counter!("sync_skipped_total", 1u64, "reason" => err.tag());
        return Ok(None);
    };
    let mut statuses = Vec::new();
    for rel in repo.relations_to(namespace, service_uid, RelationKind::InstanceOfStateOfService)? {
        match repo.get(namespace, ResourceKind::StateApplication, &rel.source_uid)? {
            Some(step) => statuses.push(step.status),
            None => warn!(error = %BrineError::dangling(ResourceKind::StateApplication, &rel.source_uid), "rollup ignores dependent"),
        }
    }
    let Some(next) = rollup(statuses.iter().copied()) else {
        debug!(service = %service_uid, "no dependents; status left as is");
        return Ok(None);
    };
    if next == service.status {
        return Ok(None);
    }
    info!(service = %service_uid, from = %service.status, to = %next, dependents = statuses.len(), "service status rolled up");
    service.status = next;
    repo.upsert(service)?;
    counter!("sync_rollup_writes", 1u64);
    Ok(Some(next))
}

/// Record the per-step outcomes of an apply event onto previously synthesized
/// state applications, then roll up every service a written step belongs to.
///
/// An outcome is recorded once per (step, job id); later sightings of the
/// same job id are no-ops.
pub fn record_apply_event(repo: &dyn GraphRepository, namespace: &str, raw: &Json) -> BrineResult<ApplyReport> {
    let mut report = ApplyReport::default();
    let event = match ApplyEvent::parse(raw) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "skipping apply event");
            counter!("sync_skipped_total", 1u64, "reason" => e.tag());
            report.skipped += 1;
            return Ok(report);
        }
    };
    let Some(outcomes) = event.outcomes else {
        debug!(host = %event.host, jid = %event.jid, "apply event carries no step outcomes");
        return Ok(report);
    };

    let mut services = BTreeSet::new();
    for (key, datum) in outcomes {
        let entity = format!("outcome {} of job {}", key, event.jid);
        let step_id = match as_mapping(datum, &entity).and_then(|body| required_str(body, "__id__", &entity)) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "skipping outcome");
                report.skipped += 1;
                continue;
            }
        };
        let uid = composite_uid(event.host, step_id);
        let Some(mut step) = repo.get(namespace, ResourceKind::StateApplication, &uid)? else {
            warn!(error = %BrineError::dangling(ResourceKind::StateApplication, &uid), "skipping outcome");
            report.skipped += 1;
            continue;
        };

        let history = step.metadata.entry("apply").or_insert_with(|| Json::Object(Default::default()));
        let Some(history) = history.as_object_mut() else {
            warn!(step = %uid, "apply history is not a mapping; outcome not recorded");
            report.skipped += 1;
            continue;
        };
        if history.contains_key(event.jid) {
            report.duplicates += 1;
            continue;
        }
        history.insert(event.jid.to_string(), datum.clone());
        step.status = if truthy(datum.get("result")) { Status::Active } else { Status::Error };
        debug!(step = %uid, jid = %event.jid, status = %step.status, "outcome recorded");

        match step.metadata.get("__sls__").and_then(Json::as_str) {
            Some(sls) => match owning_service_uid(event.host, sls) {
                Ok(service) => {
                    services.insert(service);
                }
                Err(e) => warn!(step = %uid, error = %e, "no owning service for step"),
            },
            None => warn!(step = %uid, "step has no __sls__; no owning service"),
        }
        repo.upsert(step)?;
        report.recorded += 1;
    }

    for service in services {
        if let Some(status) = recompute_status(repo, namespace, &service)? {
            report.services.push((service, status));
        }
    }
    counter!("sync_outcomes_recorded", report.recorded as u64);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use Status::*;

    #[test]
    fn error_dominates_then_unknown_then_active() {
        assert_eq!(rollup([Error, Active]), Some(Error));
        assert_eq!(rollup([Unknown, Active]), Some(Build));
        assert_eq!(rollup([Active, Active]), Some(Active));
        assert_eq!(rollup([Unknown, Error, Active]), Some(Error));
        assert_eq!(rollup(Vec::new()), None);
    }

    #[test]
    fn building_dependents_count_as_neither_error_nor_unknown() {
        assert_eq!(rollup([Build, Active]), Some(Active));
        assert_eq!(rollup([Build, Unknown]), Some(Build));
        assert_eq!(rollup([Build, Error]), Some(Error));
    }
}
