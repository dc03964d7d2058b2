//! YAML ingestion of periodic task sets and workflow files for experiments.
use std::fs;
use yaml_rust::{Yaml, YamlLoader};

use crate::dag::{Subtask, Workflow};
use crate::error::SchedulerError;
use crate::task::Criticality;

/// Parameters of one periodic task template. The period defaults to the
/// relative deadline when omitted.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicTemplate {
    pub id: i64,
    pub criticality: Criticality,
    pub cost: i64,
    pub memory: i64,
    pub deadline: i64,
    pub period: Option<i64>,
}

fn load_yaml(file_path: &str) -> Result<Vec<Yaml>, SchedulerError> {
    let content = fs::read_to_string(file_path)?;
    YamlLoader::load_from_str(&content)
        .map_err(|err| SchedulerError::Parse(format!("{}: {}", file_path, err)))
}

fn require_i64(yaml: &Yaml, key: &str, context: &str) -> Result<i64, SchedulerError> {
    yaml[key]
        .as_i64()
        .ok_or_else(|| SchedulerError::Parse(format!("{}: missing integer field `{}`", context, key)))
}

fn require_criticality(yaml: &Yaml, context: &str) -> Result<Criticality, SchedulerError> {
    let name = yaml["criticality"]
        .as_str()
        .ok_or_else(|| SchedulerError::Parse(format!("{}: missing field `criticality`", context)))?;
    Criticality::from_name(name)
        .ok_or_else(|| SchedulerError::Parse(format!("{}: unknown criticality `{}`", context, name)))
}

/// Loads a `tasks:` document of periodic templates.
pub fn load_periodic_set(file_path: &str) -> Result<Vec<PeriodicTemplate>, SchedulerError> {
    let docs = load_yaml(file_path)?;
    let doc = docs
        .first()
        .ok_or_else(|| SchedulerError::Parse(format!("{}: empty document", file_path)))?;
    let tasks = doc["tasks"]
        .as_vec()
        .ok_or_else(|| SchedulerError::Parse(format!("{}: missing `tasks` list", file_path)))?;

    let mut templates = Vec::with_capacity(tasks.len());
    for task in tasks {
        let context = format!("{}: task", file_path);
        templates.push(PeriodicTemplate {
            id: require_i64(task, "id", &context)?,
            criticality: require_criticality(task, &context)?,
            cost: require_i64(task, "cost", &context)?,
            memory: require_i64(task, "memory", &context)?,
            deadline: require_i64(task, "deadline", &context)?,
            period: task["period"].as_i64(),
        });
    }
    Ok(templates)
}

/// Loads one workflow document: `nodes` in submission order plus `links`
/// holding positional `source`/`target` indices and a `payload` size.
pub fn load_workflow(file_path: &str) -> Result<Workflow, SchedulerError> {
    let docs = load_yaml(file_path)?;
    let doc = docs
        .first()
        .ok_or_else(|| SchedulerError::Parse(format!("{}: empty document", file_path)))?;

    let context = file_path;
    let mut workflow = Workflow::new(
        require_i64(doc, "id", context)?,
        require_i64(doc, "deadline", context)?,
        doc["arrival"].as_i64().unwrap_or(0),
    );

    let nodes = doc["nodes"]
        .as_vec()
        .ok_or_else(|| SchedulerError::Parse(format!("{}: missing `nodes` list", context)))?;
    for node in nodes {
        let node_context = format!("{}: node", context);
        workflow.add_subtask(Subtask::new(
            require_i64(node, "id", &node_context)?,
            require_criticality(node, &node_context)?,
            require_i64(node, "cost", &node_context)?,
            require_i64(node, "memory", &node_context)?,
        ));
    }

    if let Some(links) = doc["links"].as_vec() {
        for link in links {
            let link_context = format!("{}: link", context);
            let source = require_i64(link, "source", &link_context)?;
            let target = require_i64(link, "target", &link_context)?;
            let payload = link["payload"].as_i64().unwrap_or(0);
            workflow.add_dependency(source as usize, target as usize, payload)?;
        }
    }

    workflow.validate()?;
    Ok(workflow)
}

/// Loads every `.yaml` workflow in a directory, in path order.
pub fn load_workflow_dir(dir_path: &str) -> Result<Vec<Workflow>, SchedulerError> {
    let mut paths: Vec<_> = fs::read_dir(dir_path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().map_or(false, |ext| ext == "yaml"))
        .collect();
    paths.sort();

    let mut workflows = Vec::with_capacity(paths.len());
    for path in paths {
        workflows.push(load_workflow(path.to_str().ok_or_else(|| {
            SchedulerError::Parse(format!("non-UTF8 path in {}", dir_path))
        })?)?);
    }
    Ok(workflows)
}
