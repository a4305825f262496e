//! Pipeline spec documents: parse, default, canonicalize, validate.
//!
//! Specs are YAML or JSON. The raw document bytes are hashed (SHA-256) so
//! reloads can detect content changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::cron::{compile, CronSchedule};
use crate::storage::clean_uri;

const STORAGE_SCHEME: &str = "gs://";

/// A parsed and validated pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Hex SHA-256 of the raw spec document.
    pub hash: String,
    pub spec: Spec,
}

/// Declarative description of a pipeline: an ordered list of task stages
/// sharing a storage directory and an optional cron schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Spec {
    pub name: String,
    pub namespace: String,
    /// Blob-store directory used to exchange data between stages.
    pub storage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<CronSchedule>,
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub etcd_lock: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceSpec>,
    /// Parallel job groups; mutually exclusive with the inline template.
    #[serde(rename = "jobs", skip_serializing_if = "Vec::is_empty")]
    pub template_list: Vec<JobTemplate>,
    #[serde(flatten)]
    pub template: JobTemplate,
}

impl TaskSpec {
    /// The effective job groups of this stage: the named list, or the
    /// single inline template.
    pub fn job_specs(&self) -> Vec<&JobTemplate> {
        if self.template_list.is_empty() {
            vec![&self.template]
        } else {
            self.template_list.iter().collect()
        }
    }
}

/// One parallel job group within a stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTemplate {
    /// Job group name; required when part of a list.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub job: String,
    /// Manifest template URI; defaulted from the data directory.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub template: String,
    pub image: String,
    pub instances: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    pub parallelism: u32,
    #[serde(skip_serializing_if = "ResourceRequirements::is_empty")]
    pub resources: ResourceRequirements,
}

impl JobTemplate {
    fn is_unset(&self) -> bool {
        self.image.is_empty() && self.template.is_empty() && self.instances == 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

impl ResourceRequirements {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub template: String,
    /// Optional binding to one job group of the same task.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub job: String,
    pub ports: Vec<PortSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortSpec {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("pipeline name must be specified")]
    MissingName,
    #[error("unsupported storage method")]
    UnsupportedStorage,
    #[error("image must be specified for task")]
    MissingImage,
    #[error("parallelism must be less or equal than number of instances")]
    ParallelismExceedsInstances,
    #[error("task template and template-list are mutually exclusive")]
    AmbiguousTemplates,
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("unknown job {job} in service {service}")]
    UnknownServiceJob { job: String, service: String },
    #[error("Service name not defined")]
    MissingServiceName,
    #[error("Port name must be defined")]
    MissingPortName,
    #[error("Invalid port")]
    InvalidPort,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pipeline spec: {0}")]
    Decode(#[from] serde_yaml::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

fn default_job_template(tmpl: &mut JobTemplate, data_dir: &str) {
    if tmpl.template.is_empty() {
        tmpl.template = format!("file://{data_dir}/default-job-template.yaml");
    }
    if tmpl.instances == 0 {
        tmpl.instances = 1;
    }
    if tmpl.parallelism == 0 {
        tmpl.parallelism = tmpl.instances;
    }
}

fn default_spec_values(spec: &mut Spec, data_dir: &str) {
    for task in &mut spec.tasks {
        if task.template_list.is_empty() {
            default_job_template(&mut task.template, data_dir);
        } else {
            for tmpl in &mut task.template_list {
                default_job_template(tmpl, data_dir);
            }
        }
        for svc in &mut task.services {
            if svc.template.is_empty() {
                svc.template = format!("file://{data_dir}/default-service-template.yaml");
            }
        }
    }
}

fn canonicalize_spec(spec: &mut Spec) {
    if !spec.storage.is_empty() {
        spec.storage = clean_uri(&spec.storage);
    }
}

fn validate_job_template(tmpl: &JobTemplate) -> Result<(), ValidationError> {
    if tmpl.image.is_empty() {
        return Err(ValidationError::MissingImage);
    }
    if tmpl.parallelism > tmpl.instances {
        return Err(ValidationError::ParallelismExceedsInstances);
    }
    Ok(())
}

fn validate_service(task: &TaskSpec, svc: &ServiceSpec) -> Result<(), ValidationError> {
    if svc.name.is_empty() {
        return Err(ValidationError::MissingServiceName);
    }
    if !svc.job.is_empty() && !task.template_list.iter().any(|t| t.job == svc.job) {
        return Err(ValidationError::UnknownServiceJob {
            job: svc.job.clone(),
            service: svc.name.clone(),
        });
    }
    for port in &svc.ports {
        if port.name.is_empty() {
            return Err(ValidationError::MissingPortName);
        }
        if port.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
    }
    Ok(())
}

fn validate_spec(spec: &Spec) -> Result<(), ValidationError> {
    if spec.name.is_empty() {
        return Err(ValidationError::MissingName);
    }
    if !spec.storage.is_empty() && !spec.storage.starts_with(STORAGE_SCHEME) {
        return Err(ValidationError::UnsupportedStorage);
    }
    if let Some(schedule) = &spec.schedule {
        compile(schedule).map_err(|e| ValidationError::InvalidSchedule(e.to_string()))?;
    }
    for task in &spec.tasks {
        if task.template_list.is_empty() {
            validate_job_template(&task.template)?;
        } else {
            if !task.template.is_unset() {
                return Err(ValidationError::AmbiguousTemplates);
            }
            for tmpl in &task.template_list {
                validate_job_template(tmpl)?;
            }
        }
        for svc in &task.services {
            validate_service(task, svc)?;
        }
    }
    Ok(())
}

/// Parse a spec document: hash the raw bytes, decode, apply defaults,
/// canonicalize and validate.
pub fn parse_spec(data: &[u8], data_dir: &str) -> Result<Config, ConfigError> {
    let mut spec: Spec = serde_yaml::from_slice(data)?;
    default_spec_values(&mut spec, data_dir);
    canonicalize_spec(&mut spec);
    validate_spec(&spec)?;
    Ok(Config {
        hash: format!("{:x}", Sha256::digest(data)),
        spec,
    })
}
