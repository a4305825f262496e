pub mod client;
pub mod fake;
pub mod manifest;

pub use client::{ClusterClient, HttpClusterClient, WatchEvent, WatchEventType, WatchStream};
pub use manifest::{
    JobCondition, JobManifest, JobSpec, JobStatus, LabelSelector, ObjectMeta, PodManifest,
    ServiceManifest, ServicePort,
};
