//! Metadata classifier: which salt query feeds which resource kind, and how
//! its answer is normalized into a mapping of records.

use brine_core::{Metadata, ResourceKind};
use brine_saltapi::{LowRequest, Transport};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::records::{shape, APPLY_FUNCTIONS};

/// The one query issued for `kind`, or `None` when the kind is not fetched directly.
pub fn query_for(kind: ResourceKind, timeout_secs: u64) -> Option<LowRequest> {
    let req = match kind {
        ResourceKind::Host => LowRequest::local("*", "grains.items"),
        ResourceKind::Service => LowRequest::local("*", "pillar.data"),
        ResourceKind::StateApplication => LowRequest::local("*", "state.show_lowstate"),
        ResourceKind::Job => {
            LowRequest::runner("jobs.list_jobs").with_kwarg("search_function", Json::from(APPLY_FUNCTIONS.to_vec()))
        }
        ResourceKind::Controller | ResourceKind::User => return None,
    };
    Some(req.with_timeout(timeout_secs))
}

/// Anything but a mapping becomes an empty mapping.
pub fn normalize(raw: Json) -> Metadata {
    match raw {
        Json::Object(map) => map,
        _ => Metadata::new(),
    }
}

/// Fetch the raw records for `kind`. Never fails: an unsupported kind, a
/// failed query or a non-mapping answer all mean "no data this cycle".
pub async fn fetch(transport: &dyn Transport, kind: ResourceKind, timeout_secs: u64) -> Metadata {
    let Some(req) = query_for(kind, timeout_secs) else {
        debug!(kind = %kind, "no query for kind; nothing to fetch");
        return Metadata::new();
    };
    info!(kind = %kind, fun = %req.fun, "Getting {} resources", kind);
    let raw = match transport.low(std::slice::from_ref(&req)).await {
        Ok(resp) => resp.into_first(),
        Err(e) => {
            warn!(kind = %kind, fun = %req.fun, error = %e, "query failed; treating as empty");
            return Metadata::new();
        }
    };
    if !raw.is_object() {
        warn!(kind = %kind, fun = %req.fun, got = shape(&raw), "payload is not a mapping; treating as empty");
    }
    normalize(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use brine_saltapi::{ClientKind, MockTransport};
    use serde_json::json;

    #[test]
    fn queries_target_all_minions_with_timeout() {
        let host = query_for(ResourceKind::Host, 30).unwrap();
        assert_eq!(host.client, ClientKind::Local);
        assert_eq!(host.tgt.as_deref(), Some("*"));
        assert_eq!(host.fun, "grains.items");
        assert_eq!(host.timeout, Some(30));

        let jobs = query_for(ResourceKind::Job, 60).unwrap();
        assert_eq!(jobs.client, ClientKind::Runner);
        assert_eq!(jobs.kwargs["search_function"], json!(["state.apply", "state.sls"]));

        assert!(query_for(ResourceKind::User, 60).is_none());
        assert!(query_for(ResourceKind::Controller, 60).is_none());
    }

    #[tokio::test]
    async fn malformed_answers_become_empty() {
        let mock = MockTransport::new()
            .reply("grains.items", json!(["not", "a", "mapping"]))
            .reply("pillar.data", json!("Minion did not return"))
            .reply("state.show_lowstate", json!({"h1": []}));
        assert!(fetch(&mock, ResourceKind::Host, 60).await.is_empty());
        assert!(fetch(&mock, ResourceKind::Service, 60).await.is_empty());
        assert_eq!(fetch(&mock, ResourceKind::StateApplication, 60).await.len(), 1);
        // No reply scripted: the mock answers null.
        assert!(fetch(&mock, ResourceKind::Job, 60).await.is_empty());
    }

    #[tokio::test]
    async fn unsupported_kind_issues_no_query() {
        let mock = MockTransport::new();
        assert!(fetch(&mock, ResourceKind::User, 60).await.is_empty());
        assert!(mock.calls().is_empty());
    }
}
