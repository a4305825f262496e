//! Wire shapes for the workload manager resources this crate creates and
//! watches. These mirror the manager's documented Job/Service/Pod schema;
//! the pod template inside a job spec is carried opaquely.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,
    /// Pod template, passed through to the manager untouched.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub template: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobStatus {
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub conditions: Vec<JobCondition>,
}

impl JobStatus {
    pub fn is_complete(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.condition_type == crate::CONDITION_COMPLETE)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl JobCondition {
    pub fn complete() -> JobCondition {
        JobCondition {
            condition_type: crate::CONDITION_COMPLETE.to_string(),
            last_transition_time: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpecManifest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceSpecManifest {
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodManifest {
    pub metadata: ObjectMeta,
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodStatus {
    pub phase: String,
}

/// Label key/value filter; the sole reconciliation authority over cluster
/// resources (`{pipeline, id[, task]}`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new() -> LabelSelector {
        LabelSelector(BTreeMap::new())
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> LabelSelector {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Selector identifying all resources of one pipeline instance.
    pub fn for_instance(pipeline: &str, id: u64) -> LabelSelector {
        LabelSelector::new()
            .with(crate::LABEL_PIPELINE, pipeline)
            .with(crate::LABEL_INSTANCE_ID, id.to_string())
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
    }

    /// `key=value,key=value` form used in list/delete/watch queries.
    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_query())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_superset_labels() {
        let selector = LabelSelector::for_instance("mine", 3);
        let mut labels = BTreeMap::new();
        labels.insert("pipeline".to_string(), "mine".to_string());
        labels.insert("id".to_string(), "3".to_string());
        labels.insert("task".to_string(), "step1".to_string());
        assert!(selector.matches(&labels));

        labels.insert("id".to_string(), "4".to_string());
        assert!(!selector.matches(&labels));
    }

    #[test]
    fn selector_query_is_sorted_key_value_pairs() {
        let selector = LabelSelector::for_instance("p", 1).with("task", "t");
        assert_eq!(selector.to_query(), "id=1,pipeline=p,task=t");
    }

    #[test]
    fn job_manifest_decodes_from_yaml() {
        let doc = r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: p-step1-1
  namespace: prod
  labels:
    pipeline: p
    id: "1"
    task: step1
spec:
  completions: 4
  parallelism: 2
  template:
    spec:
      containers:
        - name: step1
          image: worker:latest
"#;
        let job: JobManifest = serde_yaml::from_str(doc).unwrap();
        assert_eq!(job.metadata.name, "p-step1-1");
        assert_eq!(job.spec.completions, Some(4));
        assert_eq!(job.metadata.labels["task"], "step1");
        assert!(!job.status.is_complete());
    }
}
