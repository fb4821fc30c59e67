//! The module descriptor, input-flow, and host data model.
//!
//! Descriptors are produced by XML parsing in the original design; that
//! front-end is an external collaborator out of scope here. This crate
//! consumes an already-structured descriptor, loaded here from a TOML file
//! whose table layout mirrors the XML schema field-for-field — the same
//! seam a deployment-config loader uses for its own `config.toml`.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::PROCESSING_MODULE_AUTOMATIC_NUMBER_INSTANCES;
use crate::error::{Result, WatershedError};

/// One declared input stream of a processing module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputFlow {
    pub name: String,
    /// Optional XPath-shaped filter over the payload; opaque to this crate.
    #[serde(default)]
    pub query: Option<String>,
    pub policy: Policy,
    #[serde(default)]
    pub policy_function_file: Option<String>,
}

impl InputFlow {
    /// Invariant: `policy == Labeled` implies `policy_function_file` is set.
    pub fn validate(&self) -> Result<()> {
        if matches!(self.policy, Policy::Labeled) && self.policy_function_file.is_none() {
            return Err(WatershedError::DescriptorParse(format!(
                "input {:?} declares policy=labeled without a policy_function_file",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    Broadcast,
    RoundRobin,
    Labeled,
}

/// The declared output of a module, or its absence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Output {
    pub flow_name: String,
    pub structure: String,
}

/// A parsed, immutable module descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub library_file: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Positive instance count, or `PROCESSING_MODULE_AUTOMATIC_NUMBER_INSTANCES`.
    pub instances: i64,
    #[serde(default)]
    pub inputs: Vec<InputFlow>,
    #[serde(default)]
    pub output: Option<Output>,
    #[serde(default)]
    pub demands: HashSet<String>,
    pub running_directory: String,

    /// Catalog instance assigned to this module by the scheduler (§4.6).
    /// Not part of the on-disk schema; filled in during scheduling.
    #[serde(skip)]
    pub assigned_catalog_rank: Option<i32>,
}

impl ModuleDescriptor {
    pub fn is_automatic_instances(&self) -> bool {
        self.instances == PROCESSING_MODULE_AUTOMATIC_NUMBER_INSTANCES
    }

    pub fn validate(&self) -> Result<()> {
        if self.instances <= 0 && !self.is_automatic_instances() {
            return Err(WatershedError::DescriptorParse(
                "number of required instances must be greater than 0".into(),
            ));
        }
        for input in &self.inputs {
            input.validate()?;
        }
        Ok(())
    }
}

/// Loads a module descriptor from its structured on-disk form.
///
/// The actual XML grammar of §6 is consumed upstream of this crate; this
/// loader is the seam a real XML front-end would populate. It is kept real
/// (not stubbed) so the admission path in `runtime::admission` is exercised
/// end-to-end by tests.
pub fn load(path: &Path) -> Result<ModuleDescriptor> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| WatershedError::FileOperation(format!("cannot read {path:?}: {e}")))?;
    let descriptor: ModuleDescriptor = toml::from_str(&text)
        .map_err(|e| WatershedError::DescriptorParse(format!("{path:?}: {e}")))?;
    descriptor.validate()?;
    Ok(descriptor)
}

/// A cluster host, per §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub is_database_server: bool,
    #[serde(default)]
    pub resources: HashSet<String>,
    pub runtime_daemon_rank: i32,
    #[serde(default)]
    pub catalog_daemon_rank: Option<i32>,
    /// Optional SSH credentials for remote spawn (§4.1 expansion).
    #[serde(default)]
    pub ssh: Option<SshTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshTarget {
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub key_file: Option<String>,
}

/// The runtime-level cluster configuration (§6 `<ompi>`/`<server>`/`<host>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub hosts: Vec<Host>,
    pub running_dir: String,
}

pub fn load_cluster_config(path: &Path) -> Result<ClusterConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| WatershedError::FileOperation(format!("cannot read {path:?}: {e}")))?;
    toml::from_str(&text).map_err(|e| WatershedError::DescriptorParse(format!("{path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_policy_requires_a_policy_function_file() {
        let flow = InputFlow {
            name: "s".into(),
            query: None,
            policy: Policy::Labeled,
            policy_function_file: None,
        };
        assert!(flow.validate().is_err());
    }

    #[test]
    fn round_robin_policy_has_no_such_requirement() {
        let flow = InputFlow {
            name: "s".into(),
            query: None,
            policy: Policy::RoundRobin,
            policy_function_file: None,
        };
        assert!(flow.validate().is_ok());
    }

    #[test]
    fn zero_instances_is_rejected_unless_automatic() {
        let mut d = ModuleDescriptor {
            name: "m".into(),
            library_file: "lib".into(),
            arguments: vec![],
            instances: 0,
            inputs: vec![],
            output: None,
            demands: HashSet::new(),
            running_directory: "/tmp".into(),
            assigned_catalog_rank: None,
        };
        assert!(d.validate().is_err());
        d.instances = PROCESSING_MODULE_AUTOMATIC_NUMBER_INSTANCES;
        assert!(d.validate().is_ok());
    }

    #[test]
    fn loads_a_descriptor_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.toml");
        std::fs::write(
            &path,
            r#"
            name = "src"
            library_file = "libsrc.so"
            instances = 2
            running_directory = "/tmp/src"

            [output]
            flow_name = "s"
            structure = "none"
            "#,
        )
        .unwrap();
        let descriptor = load(&path).unwrap();
        assert_eq!(descriptor.name, "src");
        assert_eq!(descriptor.instances, 2);
        assert_eq!(descriptor.output.unwrap().flow_name, "s");
    }
}
