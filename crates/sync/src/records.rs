//! Typed views over raw salt payloads.
//!
//! Raw documents are checked here, at the synthesizer boundary; a view only
//! exists if the fields it exposes are present with the right shape.

use brine_core::{composite_uid, BrineError, BrineResult, Metadata};
use serde_json::Value as Json;

/// Job functions whose results are tracked.
pub const APPLY_FUNCTIONS: [&str; 2] = ["state.apply", "state.sls"];

pub fn is_apply_function(fun: &str) -> bool {
    APPLY_FUNCTIONS.contains(&fun)
}

pub fn as_mapping<'a>(raw: &'a Json, entity: &str) -> BrineResult<&'a Metadata> {
    raw.as_object().ok_or_else(|| BrineError::malformed(entity, format!("expected a mapping, got {}", shape(raw))))
}

pub fn required_str<'a>(body: &'a Metadata, key: &str, entity: &str) -> BrineResult<&'a str> {
    match body.get(key) {
        Some(Json::String(s)) => Ok(s.as_str()),
        Some(other) => Err(BrineError::malformed(entity, format!("key {} is {}, expected a string", key, shape(other)))),
        None => Err(BrineError::malformed(entity, format!("missing key {}", key))),
    }
}

pub fn shape(raw: &Json) -> &'static str {
    match raw {
        Json::Null => "null",
        Json::Bool(_) => "a bool",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "a sequence",
        Json::Object(_) => "a mapping",
    }
}

/// Python-style truthiness of a salt `result` flag.
pub fn truthy(raw: Option<&Json>) -> bool {
    match raw {
        None | Some(Json::Null) => false,
        Some(Json::Bool(b)) => *b,
        Some(Json::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Json::String(s)) => !s.is_empty(),
        Some(Json::Array(a)) => !a.is_empty(),
        Some(Json::Object(o)) => !o.is_empty(),
    }
}

/// Root of a dotted sls path: `nginx.server.conf` → `nginx`.
///
/// Paths with fewer than two segments cannot be attributed to a service.
pub fn sls_root(sls: &str) -> BrineResult<&str> {
    match sls.split_once('.') {
        Some((root, rest)) if !root.is_empty() && !rest.is_empty() => Ok(root),
        _ => Err(BrineError::malformed(format!("sls {:?}", sls), "state path needs at least two segments")),
    }
}

/// UID of the service owning a step declared in `sls` on `host`.
pub fn owning_service_uid(host: &str, sls: &str) -> BrineResult<String> {
    Ok(composite_uid(host, sls_root(sls)?))
}

/// One step of `state.show_lowstate` for one host.
#[derive(Debug, Clone, Copy)]
pub struct Lowstate<'a> {
    pub body: &'a Metadata,
    pub id: &'a str,
    pub state: &'a str,
}

impl<'a> Lowstate<'a> {
    pub fn parse(host: &str, raw: &'a Json) -> BrineResult<Self> {
        let entity = format!("lowstate on {}", host);
        let body = as_mapping(raw, &entity)?;
        let id = required_str(body, "__id__", &entity)?;
        let state = required_str(body, "state", &entity)?;
        Ok(Self { body, id, state })
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.state, self.id)
    }
}

/// One entry of `jobs.list_jobs`.
#[derive(Debug, Clone, Copy)]
pub struct JobRecord<'a> {
    pub body: &'a Metadata,
    pub function: &'a str,
    pub user: &'a str,
}

impl<'a> JobRecord<'a> {
    pub fn parse(jid: &str, raw: &'a Json) -> BrineResult<Self> {
        let entity = format!("job {}", jid);
        let body = as_mapping(raw, &entity)?;
        let function = required_str(body, "Function", &entity)?;
        let user = required_str(body, "User", &entity)?;
        Ok(Self { body, function, user })
    }

    pub fn is_apply(&self) -> bool {
        is_apply_function(self.function)
    }

    /// Display name of the acting user; salt records sudo callers as `sudo_<name>`.
    pub fn user_label(&self) -> &'a str {
        self.user.strip_prefix("sudo_").unwrap_or(self.user)
    }
}

/// A state-apply return event: per-step outcomes of one job on one host.
#[derive(Debug, Clone, Copy)]
pub struct ApplyEvent<'a> {
    pub host: &'a str,
    pub jid: &'a str,
    /// `None` when the minion returned a sequence (render errors), which carries no step outcomes.
    pub outcomes: Option<&'a Metadata>,
}

impl<'a> ApplyEvent<'a> {
    pub fn parse(raw: &'a Json) -> BrineResult<Self> {
        let body = as_mapping(raw, "apply event")?;
        let host = required_str(body, "id", "apply event")?;
        let jid = required_str(body, "jid", "apply event")?;
        let outcomes = match body.get("return") {
            None | Some(Json::Array(_)) => None,
            Some(Json::Object(steps)) => Some(steps),
            Some(other) => {
                return Err(BrineError::malformed(
                    format!("apply event {} on {}", jid, host),
                    format!("return is {}", shape(other)),
                ))
            }
        };
        Ok(Self { host, jid, outcomes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sls_root_needs_two_segments() {
        assert_eq!(sls_root("nginx.server").unwrap(), "nginx");
        assert_eq!(sls_root("linux.system.repo").unwrap(), "linux");
        for bad in ["nginx", "", ".server", "nginx."] {
            let err = sls_root(bad).unwrap_err();
            assert!(matches!(err, BrineError::Malformed { .. }), "{}: {}", bad, err);
        }
        assert_eq!(owning_service_uid("h1", "nginx.server").unwrap(), "h1|nginx");
    }

    #[test]
    fn truthiness_follows_salt_results() {
        assert!(truthy(Some(&json!(true))));
        assert!(!truthy(Some(&json!(false))));
        assert!(!truthy(None));
        assert!(!truthy(Some(&json!(null))));
        assert!(truthy(Some(&json!(1))));
        assert!(!truthy(Some(&json!(0))));
        assert!(!truthy(Some(&json!(""))));
    }

    #[test]
    fn lowstate_reports_the_missing_key() {
        let ok = json!({"__id__": "nginx_pkg", "state": "pkg", "__sls__": "nginx.server"});
        let step = Lowstate::parse("h1", &ok).unwrap();
        assert_eq!(step.label(), "pkg nginx_pkg");

        let missing = json!({"state": "pkg"});
        let err = Lowstate::parse("h1", &missing).unwrap_err().to_string();
        assert!(err.contains("__id__") && err.contains("h1"), "{}", err);

        assert!(Lowstate::parse("h1", &json!("oops")).is_err());
    }

    #[test]
    fn job_user_label_strips_sudo_prefix() {
        let raw = json!({"Function": "state.apply", "User": "sudo_alice"});
        let job = JobRecord::parse("2024", &raw).unwrap();
        assert!(job.is_apply());
        assert_eq!(job.user_label(), "alice");

        let raw = json!({"Function": "test.ping", "User": "root"});
        let job = JobRecord::parse("2025", &raw).unwrap();
        assert!(!job.is_apply());
        assert_eq!(job.user_label(), "root");
    }

    #[test]
    fn apply_event_shapes() {
        let ev = json!({"id": "h1", "jid": "1", "return": {"pkg_|-a_|-a_|-installed": {"__id__": "a", "result": true}}});
        let parsed = ApplyEvent::parse(&ev).unwrap();
        assert_eq!(parsed.host, "h1");
        assert_eq!(parsed.outcomes.map(|o| o.len()), Some(1));

        let listed = json!({"id": "h1", "jid": "1", "return": ["Rendering SLS failed"]});
        assert!(ApplyEvent::parse(&listed).unwrap().outcomes.is_none());

        let scalar = json!({"id": "h1", "jid": "1", "return": 3});
        assert!(ApplyEvent::parse(&scalar).is_err());
        assert!(ApplyEvent::parse(&json!({"jid": "1"})).is_err());
    }
}
