//! Brine core types: the reconciled resource graph and the repository seam.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Open, kind-specific attribute bag carried by every resource.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Separator used by composite UIDs such as `host|nginx`.
pub const UID_SEPARATOR: char = '|';

pub fn composite_uid(host: &str, sub: &str) -> String {
    format!("{}{}{}", host, UID_SEPARATOR, sub)
}

/// Split `host|sub` into its two parts. Plain UIDs yield `None`.
pub fn split_composite_uid(uid: &str) -> Option<(&str, &str)> {
    uid.split_once(UID_SEPARATOR)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// The salt master every host is controlled by.
    Controller,
    Host,
    /// A pillar-declared service on one host (`host|service`).
    Service,
    /// One lowstate step on one host (`host|step-id`).
    StateApplication,
    Job,
    User,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Controller,
        ResourceKind::Host,
        ResourceKind::Service,
        ResourceKind::StateApplication,
        ResourceKind::Job,
        ResourceKind::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Controller => "controller",
            ResourceKind::Host => "host",
            ResourceKind::Service => "service",
            ResourceKind::StateApplication => "state_application",
            ResourceKind::Job => "job",
            ResourceKind::User => "user",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = BrineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_lowercase().replace('-', "_");
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == tag)
            .ok_or_else(|| BrineError::Validation(format!("unknown resource kind: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Unknown,
    Active,
    Error,
    Build,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Active => "active",
            Status::Error => "error",
            Status::Build => "build",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = BrineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Status::Unknown),
            "active" => Ok(Status::Active),
            "error" => Ok(Status::Error),
            "build" => Ok(Status::Build),
            _ => Err(BrineError::Validation(format!("unknown status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    BelongsToController,
    RunsOnHost,
    InstanceOfStateOfService,
    PerformedByUser,
    AppliedToHost,
    AppliedStateStep,
}

impl RelationKind {
    pub const ALL: [RelationKind; 6] = [
        RelationKind::BelongsToController,
        RelationKind::RunsOnHost,
        RelationKind::InstanceOfStateOfService,
        RelationKind::PerformedByUser,
        RelationKind::AppliedToHost,
        RelationKind::AppliedStateStep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::BelongsToController => "belongs_to_controller",
            RelationKind::RunsOnHost => "runs_on_host",
            RelationKind::InstanceOfStateOfService => "instance_of_state_of_service",
            RelationKind::PerformedByUser => "performed_by_user",
            RelationKind::AppliedToHost => "applied_to_host",
            RelationKind::AppliedStateStep => "applied_state_step",
        }
    }

    /// Kind of resource every relation of this kind starts from.
    pub fn source_kind(&self) -> ResourceKind {
        match self {
            RelationKind::BelongsToController => ResourceKind::Host,
            RelationKind::RunsOnHost => ResourceKind::Service,
            RelationKind::InstanceOfStateOfService => ResourceKind::StateApplication,
            RelationKind::PerformedByUser
            | RelationKind::AppliedToHost
            | RelationKind::AppliedStateStep => ResourceKind::Job,
        }
    }

    /// Kind of resource every relation of this kind points at.
    pub fn target_kind(&self) -> ResourceKind {
        match self {
            RelationKind::BelongsToController => ResourceKind::Controller,
            RelationKind::RunsOnHost | RelationKind::AppliedToHost => ResourceKind::Host,
            RelationKind::InstanceOfStateOfService => ResourceKind::Service,
            RelationKind::PerformedByUser => ResourceKind::User,
            RelationKind::AppliedStateStep => ResourceKind::StateApplication,
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationKind {
    type Err = BrineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_lowercase().replace('-', "_");
        RelationKind::ALL
            .into_iter()
            .find(|k| k.as_str() == tag)
            .ok_or_else(|| BrineError::Validation(format!("unknown relation kind: {}", s)))
    }
}

/// A node in the reconciled graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    /// Control-plane scope the UID is unique within (together with `kind`).
    pub namespace: String,
    pub uid: String,
    pub kind: ResourceKind,
    pub label: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Resource {
    pub fn new(namespace: impl Into<String>, kind: ResourceKind, uid: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            uid: uid.into(),
            kind,
            label: label.into(),
            status: Status::Unknown,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Merge a fresh sighting of the same resource into this stored one.
    ///
    /// The label is replaced and metadata is merged key by key, so keys the
    /// sighting does not carry (accumulated `apply` history) survive. Status is
    /// left alone: it is owned by event recording and rollup. Returns whether
    /// anything changed.
    pub fn absorb(&mut self, incoming: Resource) -> bool {
        let mut changed = false;
        if self.label != incoming.label {
            self.label = incoming.label;
            changed = true;
        }
        for (key, value) in incoming.metadata {
            if self.metadata.get(&key) != Some(&value) {
                self.metadata.insert(key, value);
                changed = true;
            }
        }
        changed
    }
}

/// A typed, directed edge between two resources identified by UID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Relation {
    pub namespace: String,
    pub kind: RelationKind,
    pub source_uid: String,
    pub target_uid: String,
}

impl Relation {
    pub fn new(namespace: impl Into<String>, kind: RelationKind, source_uid: impl Into<String>, target_uid: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            source_uid: source_uid.into(),
            target_uid: target_uid.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrineError {
    /// The control plane rejected the credentials or could not be reached.
    #[error("authentication: {0}")]
    Authentication(String),
    #[error("malformed {entity}: {reason}")]
    Malformed { entity: String, reason: String },
    #[error("dangling reference: no {kind} resource with uid {uid}")]
    Dangling { kind: ResourceKind, uid: String },
    #[error("validation: {0}")]
    Validation(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BrineError {
    pub fn malformed(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        BrineError::Malformed { entity: entity.into(), reason: reason.into() }
    }

    pub fn dangling(kind: ResourceKind, uid: impl Into<String>) -> Self {
        BrineError::Dangling { kind, uid: uid.into() }
    }

    /// Short tag used as a metrics label.
    pub fn tag(&self) -> &'static str {
        match self {
            BrineError::Authentication(_) => "authentication",
            BrineError::Malformed { .. } => "malformed",
            BrineError::Dangling { .. } => "dangling",
            BrineError::Validation(_) => "validation",
            BrineError::Internal(_) => "internal",
        }
    }
}

pub type BrineResult<T> = Result<T, BrineError>;

/// Storage for resources and relations, scoped by namespace.
///
/// Implementations must be read-your-writes: an `upsert` is visible to the
/// next `get` in the same cycle, because rollup reads owning resources right
/// after writing their dependents.
pub trait GraphRepository: Send + Sync {
    fn get(&self, namespace: &str, kind: ResourceKind, uid: &str) -> anyhow::Result<Option<Resource>>;
    fn list_kind(&self, namespace: &str, kind: ResourceKind) -> anyhow::Result<BTreeMap<String, Resource>>;
    fn upsert(&self, resource: Resource) -> anyhow::Result<()>;
    /// Outgoing relations of `kind` starting at `source_uid`.
    fn relations_from(&self, namespace: &str, source_uid: &str, kind: RelationKind) -> anyhow::Result<Vec<Relation>>;
    /// Incoming relations of `kind` ending at `target_uid`.
    fn relations_to(&self, namespace: &str, target_uid: &str, kind: RelationKind) -> anyhow::Result<Vec<Relation>>;
    /// Idempotent: storing the same relation twice keeps one edge.
    fn upsert_relation(&self, relation: Relation) -> anyhow::Result<()>;
    /// Mark the end of a cycle. Returns the new epoch, or 0 when the backend
    /// does not track epochs.
    fn publish(&self) -> anyhow::Result<u64> {
        Ok(0)
    }
}

pub mod prelude {
    pub use super::{
        composite_uid, split_composite_uid, BrineError, BrineResult, GraphRepository, Metadata, Relation, RelationKind,
        Resource, ResourceKind, Status,
    };
}
