// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! Resource resolution: mapping a resource id to the submitting host,
//! login, and low-level scheduler kind needed to drive
//! [`crate::connection`]'s connection setup.
//!
//! This is deliberately minimal compared to a full credential-prompting
//! configuration file: just enough to place the engine — which host to
//! SSH into, which login to use, and which [`crate::scheduler::Scheduler`]
//! kind to run jobs under. A resource id is always supplied by the
//! client, so there is no auto-detection to fall back to — resolution is
//! lookup-by-name only.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::Error;

/// The low-level scheduler kind configured for a resource. A third,
/// DRM-backed kind is a plausible future addition but has no shipped
/// adapter here.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Local,
    Distributed,
}

/// Everything needed to place the engine host process for one resource.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    /// Hostname or address of the submitting host: the machine the
    /// engine's SSH session logs into to launch the engine host process.
    pub submitting_host: String,

    pub login: String,

    #[serde(default = "default_scheduler_kind")]
    pub scheduler: SchedulerKind,

    /// Worker slots for [`crate::scheduler::local::Local`], or slave count
    /// for [`crate::scheduler::distributed::Distributed`].
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_scheduler_kind() -> SchedulerKind {
    SchedulerKind::Local
}

fn default_workers() -> usize {
    1
}

/// Maps a resource id to its [`ResourceConfig`].
pub trait ResourceResolver: Send + Sync {
    /// # Errors
    /// Returns [`Error::UnknownResource`] when `resource_id` is not
    /// configured.
    fn resolve(&self, resource_id: &str) -> Result<ResourceConfig, Error>;
}

/// A `toml`-backed [`ResourceResolver`]: a table of resource ids to their
/// connection parameters.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TomlResourceResolver {
    #[serde(rename = "resource")]
    resources: HashMap<String, ResourceConfig>,
}

impl TomlResourceResolver {
    /// Parse a resource table from `path`.
    ///
    /// # Errors
    /// Returns [`Error::FileRead`] if the file cannot be read or
    /// [`Error::TOMLParse`] if it is malformed.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|e| Error::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| Error::TOMLParse(path.to_path_buf(), e))
    }

    /// An empty resolver, useful when every resource is configured
    /// programmatically rather than via a file.
    pub fn new() -> Self {
        TomlResourceResolver {
            resources: HashMap::new(),
        }
    }

    pub fn insert(&mut self, resource_id: impl Into<String>, config: ResourceConfig) {
        self.resources.insert(resource_id.into(), config);
    }

    /// Open `$WEFT_HOME/.config/weft/resources.toml` (or `$HOME/...` when
    /// `WEFT_HOME` is unset), the resolver the engine binary uses to place
    /// itself. A missing file is not an error, it just means no resources
    /// are configured yet.
    ///
    /// # Errors
    /// Returns [`Error::NoHome`] if neither `WEFT_HOME` nor the platform home
    /// directory can be determined, or [`Error::TOMLParse`] if the file
    /// exists but is malformed.
    pub fn open() -> Result<Self, Error> {
        let home = match env::var("WEFT_HOME") {
            Ok(weft_home) => PathBuf::from(weft_home),
            Err(_) => home::home_dir().ok_or(Error::NoHome)?,
        };
        let path = home.join(".config").join("weft").join("resources.toml");

        match fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).map_err(|e| Error::TOMLParse(path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TomlResourceResolver::new()),
            Err(e) => Err(Error::FileRead(path, e)),
        }
    }
}

impl ResourceResolver for TomlResourceResolver {
    fn resolve(&self, resource_id: &str) -> Result<ResourceConfig, Error> {
        self.resources
            .get(resource_id)
            .cloned()
            .ok_or_else(|| Error::UnknownResource(resource_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_table() {
        let toml = r#"
            [resource.cluster_a]
            submitting_host = "submit.cluster-a.example"
            login = "alice"
            scheduler = "distributed"
            workers = 8
        "#;
        let resolver: TomlResourceResolver = toml::from_str(toml).unwrap();
        let config = resolver.resolve("cluster_a").unwrap();
        assert_eq!(config.submitting_host, "submit.cluster-a.example");
        assert_eq!(config.scheduler, SchedulerKind::Distributed);
        assert_eq!(config.workers, 8);
    }

    #[test]
    fn defaults_scheduler_kind_and_workers() {
        let toml = r#"
            [resource.cluster_b]
            submitting_host = "submit.cluster-b.example"
            login = "bob"
        "#;
        let resolver: TomlResourceResolver = toml::from_str(toml).unwrap();
        let config = resolver.resolve("cluster_b").unwrap();
        assert_eq!(config.scheduler, SchedulerKind::Local);
        assert_eq!(config.workers, 1);
    }

    #[test]
    fn unknown_resource_errors() {
        let resolver = TomlResourceResolver::new();
        assert!(matches!(
            resolver.resolve("ghost"),
            Err(Error::UnknownResource(_))
        ));
    }
}
