//! Manifest template rendering and task materialization.
//!
//! Templates are plain text with `{{ ... }}` substitutions resolved
//! against a JSON context built from the pipeline spec:
//!
//! - `{{ Pipeline.Name }}`: dotted-path property access; a missing path
//!   renders as the empty string
//! - `{{ if isResourceSpecSet Resources }} ... {{ end }}`: conditional
//!   blocks (nesting allowed)
//! - `{{ printResourceList Resources.Requests 14 }}`: expand a resource
//!   map as `key: value` lines at the given indent
//!
//! Rendered documents decode YAML-or-JSON into concrete manifests.

use anyhow::{anyhow, bail, Result};
use log::warn;
use serde_json::{json, Value};

use super::config::{JobTemplate, ServiceSpec, Spec, TaskSpec};
use super::pipeline::Task;
use crate::cluster::manifest::{JobManifest, ServiceManifest};
use crate::storage::Storage;

/// Render `template` against `ctx`.
pub fn render(template: &str, ctx: &Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    // stack of enclosing `if` blocks: true = emitting
    let mut blocks: Vec<bool> = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start..].find("}}") else {
            bail!("unclosed template expression");
        };
        if blocks.iter().all(|b| *b) {
            out.push_str(&rest[..start]);
        }
        let expr = rest[start + 2..start + end].trim();
        rest = &rest[start + end + 2..];

        let words: Vec<&str> = expr.split_whitespace().collect();
        match words.as_slice() {
            ["end"] => {
                if blocks.pop().is_none() {
                    bail!("unexpected {{{{ end }}}}");
                }
            }
            ["if", cond @ ..] => {
                let emitting = blocks.iter().all(|b| *b);
                let value = emitting && eval_condition(cond, ctx)?;
                blocks.push(value);
            }
            _ => {
                if blocks.iter().all(|b| *b) {
                    out.push_str(&eval_expression(&words, ctx)?);
                }
            }
        }
    }
    if !blocks.is_empty() {
        bail!("unterminated {{{{ if }}}} block");
    }
    out.push_str(rest);
    Ok(out)
}

fn eval_condition(words: &[&str], ctx: &Value) -> Result<bool> {
    match words {
        ["isResourceSpecSet", path] => {
            let value = lookup(ctx, path);
            Ok(list_set(value.get("Requests")) || list_set(value.get("Limits")))
        }
        ["isResourceListSet", path] => Ok(list_set(Some(&lookup(ctx, path)))),
        [path] => Ok(truthy(&lookup(ctx, path))),
        other => Err(anyhow!("invalid template condition: {}", other.join(" "))),
    }
}

fn eval_expression(words: &[&str], ctx: &Value) -> Result<String> {
    match words {
        ["printResourceList", path, indent] => {
            let indent: usize = indent
                .parse()
                .map_err(|_| anyhow!("invalid indent in printResourceList: {indent}"))?;
            Ok(print_resource_list(&lookup(ctx, path), indent))
        }
        [path] => Ok(value_to_string(&lookup(ctx, path))),
        other => Err(anyhow!("invalid template expression: {}", other.join(" "))),
    }
}

fn lookup(ctx: &Value, path: &str) -> Value {
    let mut current = ctx;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn list_set(value: Option<&Value>) -> bool {
    value
        .and_then(|v| v.as_object())
        .is_some_and(|map| !map.is_empty())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn print_resource_list(value: &Value, indent: usize) -> String {
    let Some(map) = value.as_object() else {
        return String::new();
    };
    let mut out = String::new();
    for (i, (key, val)) in map.iter().enumerate() {
        if i > 0 {
            out.push('\n');
            out.push_str(&" ".repeat(indent));
        }
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&value_to_string(val));
    }
    out
}

// `Path.Join`-style concatenation would collapse the scheme's `//`.
fn path_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    if dir.ends_with('/') {
        return format!("{dir}{name}");
    }
    format!("{dir}/{name}")
}

fn resources_value(tmpl: &JobTemplate) -> Value {
    json!({
        "Requests": tmpl.resources.requests,
        "Limits": tmpl.resources.limits,
    })
}

/// Variables available to job manifest templates. Container args are
/// themselves expanded against the same variables.
pub fn job_vars(spec: &Spec, id: u64, task: &TaskSpec, tmpl: &JobTemplate) -> Result<Value> {
    let task_name = if tmpl.job.is_empty() {
        &task.name
    } else {
        &tmpl.job
    };

    let mut pipeline = json!({
        "Name": spec.name,
        "TaskPrefix": spec.name.replace('_', "-"),
        "Namespace": spec.namespace,
        "ID": id.to_string(),
    });
    if !spec.storage.is_empty() {
        pipeline["WorkDir"] = Value::String(path_join(&spec.storage, &id.to_string()));
    }

    let mut task_vars = json!({
        "Name": task_name,
        "Image": tmpl.image,
    });
    if !task.etcd_lock.is_empty() {
        task_vars["EtcdLock"] = Value::String(task.etcd_lock.clone());
    }

    let mut vars = json!({
        "Pipeline": pipeline,
        "Task": task_vars,
        "Instances": tmpl.instances,
        "Parallelism": tmpl.parallelism,
        "Args": [],
        "Resources": resources_value(tmpl),
    });

    let args: Vec<Value> = tmpl
        .args
        .iter()
        .map(|arg| render(arg, &vars).map(Value::String))
        .collect::<Result<_>>()?;
    vars["Args"] = Value::Array(args);
    Ok(vars)
}

/// Variables available to service manifest templates.
pub fn service_vars(spec: &Spec, id: u64, task: &TaskSpec, svc: &ServiceSpec) -> Value {
    let bound_task = if svc.job.is_empty() {
        &task.name
    } else {
        &svc.job
    };

    let mut pipeline = json!({
        "Name": spec.name,
        "SvcPrefix": spec.name.replace('_', "-"),
        "Namespace": spec.namespace,
        "ID": id.to_string(),
    });
    if !spec.storage.is_empty() {
        pipeline["WorkDir"] = Value::String(path_join(&spec.storage, &id.to_string()));
    }

    json!({
        "Pipeline": pipeline,
        "Service": {
            "Name": svc.name,
            "Task": bound_task,
        },
        "Ports": svc.ports,
    })
}

async fn render_manifest(storage: &Storage, template_uri: &str, vars: &Value) -> Result<String> {
    let text = storage.read(template_uri).await?;
    let text = String::from_utf8(text)?;
    render(&text, vars)
}

/// Render one job group into its concrete manifest.
pub async fn render_job(
    storage: &Storage,
    spec: &Spec,
    id: u64,
    task: &TaskSpec,
    tmpl: &JobTemplate,
) -> Result<JobManifest> {
    let vars = job_vars(spec, id, task, tmpl)?;
    let doc = render_manifest(storage, &tmpl.template, &vars).await?;
    let manifest: JobManifest = serde_yaml::from_str(&doc)?;
    Ok(manifest)
}

/// Render one co-launched service into its concrete manifest.
pub async fn render_service(
    storage: &Storage,
    spec: &Spec,
    id: u64,
    task: &TaskSpec,
    svc: &ServiceSpec,
) -> Result<ServiceManifest> {
    let vars = service_vars(spec, id, task, svc);
    let doc = render_manifest(storage, &svc.template, &vars).await?;
    let manifest: ServiceManifest = serde_yaml::from_str(&doc)?;
    Ok(manifest)
}

/// Materialize one stage: render every effective job group of the task
/// spec into its manifest.
pub async fn materialize_task(
    storage: &Storage,
    spec: &Spec,
    id: u64,
    task_spec: &TaskSpec,
) -> Result<Task> {
    let mut jobs = Vec::new();
    for tmpl in task_spec.job_specs() {
        let job = render_job(storage, spec, id, task_spec, tmpl).await?;
        if job.metadata.name.is_empty() {
            warn!(
                "template {} produced a job without a name for task {}",
                tmpl.template, task_spec.name
            );
        }
        jobs.push(job);
    }
    Ok(Task::new(jobs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::config::parse_spec;
    use crate::storage::{MemStore, ObjectStore, Uri};
    use std::sync::Arc;

    fn spec_with_task(name: &str) -> Spec {
        Spec {
            name: "pipe".to_string(),
            tasks: vec![TaskSpec {
                name: name.to_string(),
                ..TaskSpec::default()
            }],
            ..Spec::default()
        }
    }

    #[test]
    fn renders_task_name_and_id() {
        let spec = spec_with_task("pipeline-job");
        let task = &spec.tasks[0];
        let vars = job_vars(&spec, 1, task, &task.template).unwrap();
        let out = render("name: {{ Task.Name }}-{{ Pipeline.ID }}", &vars).unwrap();
        assert_eq!(out, "name: pipeline-job-1");
    }

    #[test]
    fn renders_namespace() {
        let mut spec = spec_with_task("t");
        spec.namespace = "prod".to_string();
        let task = &spec.tasks[0];
        let vars = job_vars(&spec, 1, task, &task.template).unwrap();
        let out = render("namespace: {{ Pipeline.Namespace }}", &vars).unwrap();
        assert_eq!(out, "namespace: prod");
    }

    #[test]
    fn task_prefix_replaces_underscores() {
        let mut spec = spec_with_task("t");
        spec.name = "site_ingest".to_string();
        let task = &spec.tasks[0];
        let vars = job_vars(&spec, 2, task, &task.template).unwrap();
        let out = render("{{ Pipeline.TaskPrefix }}-{{ Task.Name }}-{{ Pipeline.ID }}", &vars)
            .unwrap();
        assert_eq!(out, "site-ingest-t-2");
    }

    #[test]
    fn workdir_present_only_with_storage() {
        let mut spec = spec_with_task("t");
        let task = spec.tasks[0].clone();
        let vars = job_vars(&spec, 3, &task, &task.template).unwrap();
        assert_eq!(render("{{ Pipeline.WorkDir }}", &vars).unwrap(), "");

        spec.storage = "gs://bucket/pipe".to_string();
        let vars = job_vars(&spec, 3, &task, &task.template).unwrap();
        assert_eq!(
            render("{{ Pipeline.WorkDir }}", &vars).unwrap(),
            "gs://bucket/pipe/3"
        );
    }

    #[test]
    fn template_job_name_overrides_task_name() {
        let spec = spec_with_task("stage");
        let task = &spec.tasks[0];
        let tmpl = JobTemplate {
            job: "2a".to_string(),
            image: "img".to_string(),
            ..JobTemplate::default()
        };
        let vars = job_vars(&spec, 1, task, &tmpl).unwrap();
        assert_eq!(render("{{ Task.Name }}", &vars).unwrap(), "2a");
    }

    #[test]
    fn args_are_expanded_against_the_same_vars() {
        let mut spec = spec_with_task("t");
        spec.storage = "gs://bucket/pipe".to_string();
        let task = &spec.tasks[0];
        let tmpl = JobTemplate {
            image: "img".to_string(),
            args: vec![
                "--workdir={{ Pipeline.WorkDir }}".to_string(),
                "--shards={{ Instances }}".to_string(),
            ],
            instances: 4,
            ..JobTemplate::default()
        };
        let vars = job_vars(&spec, 5, task, &tmpl).unwrap();
        assert_eq!(
            render("{{ Args }}", &vars).unwrap(),
            r#"["--workdir=gs://bucket/pipe/5","--shards=4"]"#
        );
    }

    #[test]
    fn resource_helpers_and_blocks() {
        let spec = spec_with_task("t");
        let task = &spec.tasks[0];
        let mut tmpl = JobTemplate {
            image: "img".to_string(),
            ..JobTemplate::default()
        };
        let template = concat!(
            "{{ if isResourceSpecSet Resources }}resources:\n",
            "{{ if isResourceListSet Resources.Requests }}  requests:\n",
            "    {{ printResourceList Resources.Requests 4 }}\n",
            "{{ end }}{{ end }}done",
        );

        let vars = job_vars(&spec, 1, task, &tmpl).unwrap();
        assert_eq!(render(template, &vars).unwrap(), "done");

        tmpl.resources.requests.insert("cpu".to_string(), "2".to_string());
        tmpl.resources.requests.insert("memory".to_string(), "4Gi".to_string());
        let vars = job_vars(&spec, 1, task, &tmpl).unwrap();
        assert_eq!(
            render(template, &vars).unwrap(),
            "resources:\n  requests:\n    cpu: 2\n    memory: 4Gi\ndone"
        );
    }

    #[test]
    fn unterminated_block_is_an_error() {
        let vars = json!({});
        assert!(render("{{ if X }}body", &vars).is_err());
        assert!(render("body {{ end }}", &vars).is_err());
        assert!(render("open {{ Pipeline.Name", &vars).is_err());
    }

    #[test]
    fn service_vars_bind_job_or_task_name() {
        let spec = spec_with_task("stage");
        let task = &spec.tasks[0];
        let svc = ServiceSpec {
            name: "master".to_string(),
            ..ServiceSpec::default()
        };
        let vars = service_vars(&spec, 1, task, &svc);
        assert_eq!(vars["Service"]["Task"], "stage");

        let bound = ServiceSpec {
            name: "master".to_string(),
            job: "2a".to_string(),
            ..ServiceSpec::default()
        };
        let vars = service_vars(&spec, 1, task, &bound);
        assert_eq!(vars["Service"]["Task"], "2a");
    }

    const SPEC_DOC: &str = r#"
name: pipe
namespace: prod
storage: gs://bucket/pipe
tasks:
  - name: step2
    jobs:
      - job: 2a
        image: shard:latest
        instances: 4
        template: mem://templates/job.yaml
      - job: 2b
        image: merge:latest
        instances: 4
        parallelism: 2
        template: mem://templates/job.yaml
"#;

    const JOB_TEMPLATE: &str = r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: {{ Pipeline.TaskPrefix }}-{{ Task.Name }}-{{ Pipeline.ID }}
  namespace: {{ Pipeline.Namespace }}
  labels:
    pipeline: {{ Pipeline.Name }}
    id: "{{ Pipeline.ID }}"
    task: {{ Task.Name }}
spec:
  completions: {{ Instances }}
  parallelism: {{ Parallelism }}
"#;

    #[tokio::test]
    async fn materialize_renders_every_job_group() {
        let mem = Arc::new(MemStore::new());
        mem.write(
            &Uri::parse("mem://templates/job.yaml").unwrap(),
            JOB_TEMPLATE.as_bytes(),
        )
        .await
        .unwrap();
        let storage = Storage::single("mem", mem);

        let config = parse_spec(SPEC_DOC.as_bytes(), "/etc").unwrap();
        let task = materialize_task(&storage, &config.spec, 1, &config.spec.tasks[0])
            .await
            .unwrap();

        assert_eq!(task.jobs.len(), 2);
        assert_eq!(task.jobs[0].metadata.name, "pipe-2a-1");
        assert_eq!(task.jobs[0].spec.completions, Some(4));
        assert_eq!(task.jobs[0].spec.parallelism, Some(4));
        assert_eq!(task.jobs[1].metadata.name, "pipe-2b-1");
        assert_eq!(task.jobs[1].spec.parallelism, Some(2));
        assert_eq!(task.jobs[1].metadata.labels["task"], "2b");
        assert_eq!(task.jobs[1].metadata.labels["id"], "1");
    }

    #[tokio::test]
    async fn default_job_template_renders_a_valid_manifest() {
        let storage = Storage::new();
        let doc = "name: pipe\nnamespace: ns\ntasks:\n  - name: step1\n    image: img\n";
        let config = parse_spec(doc.as_bytes(), "data").unwrap();
        let task = materialize_task(&storage, &config.spec, 7, &config.spec.tasks[0])
            .await
            .unwrap();
        let job = &task.jobs[0];
        assert_eq!(job.metadata.name, "pipe-step1-7");
        assert_eq!(job.metadata.labels["pipeline"], "pipe");
        assert_eq!(job.metadata.labels["id"], "7");
        assert_eq!(job.metadata.labels["task"], "step1");
        assert_eq!(job.spec.completions, Some(1));
    }

    #[tokio::test]
    async fn default_service_template_renders_a_valid_manifest() {
        let storage = Storage::new();
        let doc = concat!(
            "name: pipe\nnamespace: ns\ntasks:\n",
            "  - name: step1\n    image: img\n",
            "    services:\n      - name: master\n",
            "        ports: [{name: grpc, port: 50051}]\n",
        );
        let config = parse_spec(doc.as_bytes(), "data").unwrap();
        let spec = &config.spec;
        let svc = render_service(&storage, spec, 2, &spec.tasks[0], &spec.tasks[0].services[0])
            .await
            .unwrap();
        assert_eq!(svc.metadata.name, "pipe-master-2");
        assert_eq!(svc.spec.selector["task"], "step1");
        assert_eq!(svc.spec.ports.len(), 1);
        assert_eq!(svc.spec.ports[0].name, "grpc");
        assert_eq!(svc.spec.ports[0].port, 50051);
    }
}
