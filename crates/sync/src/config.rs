use std::collections::BTreeSet;

use anyhow::Result;
use brine_saltapi::Credentials;

/// Pillar top-level keys that never describe a service.
pub const DEFAULT_SERVICE_EXCLUDE: [&str; 3] = ["__reclass__", "_param", "_support"];

pub const DEFAULT_CONTROLLER_UID: &str = "salt-master";

/// Knobs for one reconciler; everything a cycle needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Scope every resource and relation is written under.
    pub namespace: String,
    pub credentials: Credentials,
    /// Passed to salt with every query.
    pub query_timeout_secs: u64,
    /// Pillar keys skipped by service synthesis.
    pub service_exclude: BTreeSet<String>,
    pub controller_uid: String,
}

impl SyncConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            namespace: "default".to_string(),
            credentials,
            query_timeout_secs: 60,
            service_exclude: DEFAULT_SERVICE_EXCLUDE.iter().map(|s| s.to_string()).collect(),
            controller_uid: DEFAULT_CONTROLLER_UID.to_string(),
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_service_exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service_exclude = names.into_iter().map(Into::into).collect();
        self
    }

    /// Credentials from `BRINE_SALT_*`, the rest from `BRINE_NAMESPACE`,
    /// `BRINE_QUERY_TIMEOUT_SECS`, `BRINE_SERVICE_EXCLUDE` and `BRINE_CONTROLLER_UID`.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::new(Credentials::from_env()?);
        if let Ok(ns) = std::env::var("BRINE_NAMESPACE") {
            if !ns.trim().is_empty() {
                cfg.namespace = ns.trim().to_string();
            }
        }
        if let Some(secs) = std::env::var("BRINE_QUERY_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()) {
            cfg.query_timeout_secs = secs;
        }
        if let Ok(list) = std::env::var("BRINE_SERVICE_EXCLUDE") {
            cfg.service_exclude = parse_list(&list);
        }
        if let Ok(uid) = std::env::var("BRINE_CONTROLLER_UID") {
            if !uid.trim().is_empty() {
                cfg.controller_uid = uid.trim().to_string();
            }
        }
        Ok(cfg)
    }
}

/// Comma separated list, blanks dropped.
pub fn parse_list(raw: &str) -> BTreeSet<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_list_parsing() {
        let cfg = SyncConfig::new(Credentials::new("http://salt", "u", "p"));
        assert_eq!(cfg.namespace, "default");
        assert_eq!(cfg.query_timeout_secs, 60);
        assert!(cfg.service_exclude.contains("_param"));
        assert_eq!(cfg.controller_uid, "salt-master");

        let set = parse_list(" linux, ,_param,linux ");
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["_param".to_string(), "linux".to_string()]);
    }
}
