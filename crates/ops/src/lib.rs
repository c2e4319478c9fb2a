//! Brine Ops: imperative actions against salt-managed resources.
//!
//! Each (resource kind, action) pair declares the input fields it takes.
//! Executing an action validates the inputs, logs in again and issues a
//! single salt-api call.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use brine_core::{BrineError, BrineResult, Metadata, Resource, ResourceKind};
use brine_saltapi::{Credentials, LowRequest, Transport};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::{smallvec, SmallVec};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Run an execution module on one host.
    RunModule,
    /// Generate and accept a key pair for a new minion on the controller.
    GenerateKey,
}

impl Action {
    pub const ALL: [Action; 2] = [Action::RunModule, Action::GenerateKey];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::RunModule => "run_module",
            Action::GenerateKey => "generate_key",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = BrineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace('-', "_");
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == norm)
            .ok_or_else(|| BrineError::Validation(format!("unknown action {:?}", s)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    /// Multi-line text.
    Textarea,
    Bool,
}

/// One named input an action takes.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Used when the caller leaves the field out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial: Option<&'static str>,
}

impl FieldSpec {
    fn text(name: &'static str, label: &'static str) -> Self {
        Self { name, label, kind: FieldKind::Text, required: true, initial: None }
    }

    fn optional(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        self.required = false;
        self
    }

    fn initial(mut self, value: &'static str) -> Self {
        self.initial = Some(value);
        self
    }
}

/// Input fields of one action; empty when the action does not apply.
pub type FieldSchema = SmallVec<[FieldSpec; 2]>;

/// Actions offered for resources of `kind`.
pub fn actions_for(kind: ResourceKind) -> &'static [Action] {
    match kind {
        ResourceKind::Host => &[Action::RunModule],
        ResourceKind::Controller => &[Action::GenerateKey],
        _ => &[],
    }
}

/// Input fields `action` takes on `resource`.
pub fn describe(resource: &Resource, action: Action) -> FieldSchema {
    match (resource.kind, action) {
        (ResourceKind::Host, Action::RunModule) => smallvec![
            FieldSpec::text("function", "Module function").initial("cmd.run"),
            FieldSpec::text("arguments", "Function arguments").optional(FieldKind::Textarea),
        ],
        (ResourceKind::Controller, Action::GenerateKey) => smallvec![
            FieldSpec::text("minion_id", "Minion ID"),
            FieldSpec::text("force", "Force create").optional(FieldKind::Bool),
        ],
        _ => FieldSchema::new(),
    }
}

/// Check `inputs` against `schema`, fill in initial values and coerce each
/// field to its kind. Keys outside the schema are ignored.
pub fn resolve_inputs(schema: &[FieldSpec], inputs: &Metadata) -> BrineResult<Metadata> {
    let mut out = Metadata::new();
    for field in schema {
        let given = inputs.get(field.name).filter(|v| !v.is_null());
        let value = match field.kind {
            FieldKind::Text | FieldKind::Textarea => {
                let text = match given {
                    Some(Json::String(s)) => Some(s.clone()),
                    Some(Json::Number(n)) => Some(n.to_string()),
                    Some(Json::Bool(b)) => Some(b.to_string()),
                    Some(_) => return Err(BrineError::Validation(format!("{} must be text", field.label))),
                    None => field.initial.map(str::to_string),
                };
                match text {
                    Some(t) if !t.trim().is_empty() => Json::String(t),
                    _ if field.required => return Err(BrineError::Validation(format!("{} is required", field.label))),
                    _ => Json::String(String::new()),
                }
            }
            FieldKind::Bool => match given {
                Some(Json::Bool(b)) => Json::Bool(*b),
                Some(Json::String(s)) => Json::Bool(parse_flag(s).ok_or_else(|| {
                    BrineError::Validation(format!("{} must be true or false, got {:?}", field.label, s))
                })?),
                Some(_) => return Err(BrineError::Validation(format!("{} must be true or false", field.label))),
                None if field.required => return Err(BrineError::Validation(format!("{} is required", field.label))),
                None => Json::Bool(field.initial.and_then(parse_flag).unwrap_or(false)),
            },
        };
        out.insert(field.name.to_string(), value);
    }
    for key in inputs.keys().filter(|k| !schema.iter().any(|f| f.name == k.as_str())) {
        debug!(input = %key, "ignoring input outside the action schema");
    }
    Ok(out)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Trimmed, non-blank lines of a multi-line argument field.
pub fn argument_lines(raw: &str) -> Vec<String> {
    raw.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect()
}

/// Imperative ops over resources of the graph.
#[async_trait::async_trait]
pub trait BrineOps: Send + Sync {
    fn describe(&self, resource: &Resource, action: Action) -> FieldSchema {
        describe(resource, action)
    }

    /// Run `action` on `resource`. `Ok(None)` when the pair is unsupported or
    /// the login is refused; invalid inputs are a `Validation` error.
    async fn execute(&self, resource: &Resource, action: Action, inputs: &Metadata) -> BrineResult<Option<Json>>;
}

/// Default implementation over a salt-api transport.
pub struct SaltOps {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    timeout_secs: u64,
}

impl SaltOps {
    pub fn new(transport: Arc<dyn Transport>, credentials: Credentials) -> Self {
        Self { transport, credentials, timeout_secs: 60 }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    async fn run_module(&self, host: &Resource, values: &Metadata) -> BrineResult<Json> {
        let fun = values.get("function").and_then(Json::as_str).unwrap_or_default();
        let mut req = LowRequest::local(&host.uid, fun).with_timeout(self.timeout_secs);
        let args = values.get("arguments").and_then(Json::as_str).map(argument_lines).unwrap_or_default();
        if !args.is_empty() {
            req = req.with_arg(args);
        }
        info!(host = %host.uid, fun = %fun, "running module");
        Ok(self.transport.low(&[req]).await?.into_first())
    }

    async fn generate_key(&self, values: &Metadata) -> BrineResult<Json> {
        let minion = values.get("minion_id").and_then(Json::as_str).unwrap_or_default();
        let force = values.get("force").and_then(Json::as_bool).unwrap_or(false);
        let req = LowRequest::wheel("key.gen_accept").with_kwarg("id_", minion).with_kwarg("force", force);
        info!(minion = %minion, force, "generating minion key");
        let reply = self.transport.low(&[req]).await?.into_first();
        match reply.pointer("/data/return") {
            Some(keys) => Ok(keys.clone()),
            None => Err(BrineError::malformed("key.gen_accept reply", "missing data.return")),
        }
    }
}

#[async_trait::async_trait]
impl BrineOps for SaltOps {
    async fn execute(&self, resource: &Resource, action: Action, inputs: &Metadata) -> BrineResult<Option<Json>> {
        let schema = describe(resource, action);
        if schema.is_empty() {
            debug!(kind = %resource.kind, uid = %resource.uid, action = %action, "action not supported for resource");
            return Ok(None);
        }
        let values = resolve_inputs(&schema, inputs)?;
        if let Err(e) = self.transport.authenticate(&self.credentials).await {
            warn!(action = %action, uid = %resource.uid, error = %e, "authentication failed; action not run");
            counter!("ops_actions_total", 1u64, "action" => action.as_str(), "outcome" => "auth_failed");
            return Ok(None);
        }
        let out = match action {
            Action::RunModule => self.run_module(resource, &values).await,
            Action::GenerateKey => self.generate_key(&values).await,
        };
        let outcome = if out.is_ok() { "ok" } else { "err" };
        counter!("ops_actions_total", 1u64, "action" => action.as_str(), "outcome" => outcome);
        out.map(Some)
    }
}
