//! Pipeline assembly.
//!
//! Serializes a resolved subgraph into jobs: one per unit, producers first,
//! each job naming the jobs of its direct producers as must-pass
//! constraints. Assembly is a pure function of its inputs, so replanning an
//! unchanged repository yields an identical [`Pipeline::digest`].

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::PlanResult;
use crate::graph::UnitId;
use crate::impact::SubBuildGraph;
use crate::unit::{BuildUnit, RunMode, UnitKey};
use crate::upload::{artifact_path, UploadTask, ARTIFACTS_INPUT};

/// CI input holding the recipe repository checkout.
pub const SOURCE_INPUT: &str = "recipe-repo-source";

pub const DEFAULT_BUILD_PROGRAM: &str = "conda-build";

/// Settings for the primary step of every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembleOptions {
    pub build_program: String,
    /// Commit the artifacts are built from.
    pub commit_id: String,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            build_program: DEFAULT_BUILD_PROGRAM.to_string(),
            commit_id: String::new(),
        }
    }
}

/// The build or test invocation at the head of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryTask {
    pub name: String,
    pub path: String,
    pub args: Vec<String>,
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

/// One step of a job, executed in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Primary(PrimaryTask),
    Upload(UploadTask),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Primary(task) => &task.name,
            Step::Upload(task) => &task.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// `build-<key>` or `test-<key>`.
    pub name: String,
    pub unit: UnitKey,
    pub recipe: String,
    /// Label of the matrix row the unit was rendered with.
    pub matrix_row: String,
    pub mode: RunMode,
    /// Jobs of direct producers, in key order.
    pub passed: Vec<String>,
    /// Primary step first, then upload tasks.
    pub steps: Vec<Step>,
}

impl Job {
    pub fn primary(&self) -> Option<&PrimaryTask> {
        self.steps.iter().find_map(|s| match s {
            Step::Primary(task) => Some(task),
            Step::Upload(_) => None,
        })
    }

    pub fn uploads(&self) -> impl Iterator<Item = &UploadTask> {
        self.steps.iter().filter_map(|s| match s {
            Step::Upload(task) => Some(task),
            Step::Primary(_) => None,
        })
    }
}

/// Ordered jobs ready for a CI adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub jobs: Vec<Job>,
}

impl Pipeline {
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// SHA-256 hex of the canonical JSON form.
    pub fn digest(&self) -> PlanResult<String> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

pub fn job_name(mode: RunMode, key: &UnitKey) -> String {
    format!("{}-{}", mode.verb(), key)
}

/// Assemble the pipeline for `subgraph`.
///
/// `uploads` holds the generated tasks per unit; entries for units that only
/// run tests are ignored.
pub fn assemble(
    subgraph: &SubBuildGraph<'_>,
    uploads: &BTreeMap<UnitId, Vec<UploadTask>>,
    options: &AssembleOptions,
) -> Pipeline {
    let graph = subgraph.graph();
    let names: BTreeMap<UnitId, String> = subgraph
        .unit_ids()
        .filter_map(|id| {
            let mode = subgraph.run_mode(id)?;
            Some((id, job_name(mode, &graph.unit(id).key)))
        })
        .collect();

    let mut jobs = Vec::with_capacity(names.len());
    for id in subgraph_order(subgraph) {
        let Some(mode) = subgraph.run_mode(id) else {
            continue;
        };
        let unit = graph.unit(id);
        let passed: Vec<String> = subgraph
            .producers_of(id)
            .filter_map(|p| names.get(&p).cloned())
            .collect();

        let mut steps = vec![Step::Primary(primary_task(unit, mode, options))];
        if mode.publishes() {
            if let Some(tasks) = uploads.get(&id) {
                steps.extend(tasks.iter().cloned().map(Step::Upload));
            }
        }

        debug!(
            job = %job_name(mode, &unit.key),
            passed = passed.len(),
            steps = steps.len(),
            "Assembled job"
        );
        jobs.push(Job {
            name: job_name(mode, &unit.key),
            unit: unit.key.clone(),
            recipe: unit.recipe.clone(),
            matrix_row: unit.matrix_row.label.clone(),
            mode,
            passed,
            steps,
        });
    }

    info!(jobs = jobs.len(), "Assembled pipeline");
    Pipeline { jobs }
}

/// Kahn's algorithm over the subgraph; ready units leave in key order.
fn subgraph_order(subgraph: &SubBuildGraph<'_>) -> Vec<UnitId> {
    let graph = subgraph.graph();
    let mut in_degree: BTreeMap<UnitId, usize> = subgraph
        .unit_ids()
        .map(|id| (id, subgraph.producers_of(id).count()))
        .collect();

    let mut ready: BinaryHeap<Reverse<UnitId>> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(&id, _)| Reverse(id))
        .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for consumer in graph.consumers_of(id) {
            if let Some(deg) = in_degree.get_mut(&consumer) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse(consumer));
                }
            }
        }
    }
    order
}

fn primary_task(unit: &BuildUnit, mode: RunMode, options: &AssembleOptions) -> PrimaryTask {
    match mode {
        RunMode::BuildAndTest => PrimaryTask {
            name: mode.verb().to_string(),
            path: options.build_program.clone(),
            args: vec![
                "--no-anaconda-upload".to_string(),
                "--output-folder".to_string(),
                format!("{ARTIFACTS_INPUT}/{}", options.commit_id),
                "--variants".to_string(),
                variants_arg(unit),
                format!("{SOURCE_INPUT}/{}", unit.recipe),
            ],
            inputs: vec![SOURCE_INPUT.to_string()],
            outputs: vec![ARTIFACTS_INPUT.to_string()],
        },
        RunMode::TestOnly => {
            let mut args = vec!["--test".to_string()];
            args.extend(
                unit.artifacts
                    .iter()
                    .map(|a| artifact_path(&options.commit_id, unit.subdir(), a)),
            );
            PrimaryTask {
                name: mode.verb().to_string(),
                path: options.build_program.clone(),
                args,
                inputs: vec![SOURCE_INPUT.to_string(), ARTIFACTS_INPUT.to_string()],
                outputs: Vec::new(),
            }
        }
    }
}

/// Matrix row variables as a single-value variant map in JSON, which the
/// build program reads as YAML with every value kept a string.
fn variants_arg(unit: &BuildUnit) -> String {
    let variants: serde_json::Map<String, serde_json::Value> = unit
        .matrix_row
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::json!([v])))
        .collect();
    serde_json::Value::Object(variants).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::ChangeSet;
    use crate::graph::BuildGraph;
    use crate::impact::{resolve, ImpactBounds};
    use crate::unit::{MatrixRow, ResolvedDescription};

    fn unit(name: &str, build: &[&str]) -> BuildUnit {
        let mut desc = ResolvedDescription::new(name, "1.0", "h0_0", "linux-64");
        desc.requirements.build = build.iter().map(|s| s.to_string()).collect();
        desc.artifacts = vec![format!("{name}-1.0-h0_0.tar.bz2")];
        let row = MatrixRow::new("linux", "linux-64").with_variable("python", "3.11");
        BuildUnit::from_description(name, &row, desc)
    }

    fn diamond() -> BuildGraph {
        BuildGraph::from_units(vec![
            unit("base", &[]),
            unit("left", &["base"]),
            unit("right", &["base"]),
            unit("top", &["left", "right"]),
        ])
        .unwrap()
    }

    fn options() -> AssembleOptions {
        AssembleOptions {
            commit_id: "c0ffee".to_string(),
            ..AssembleOptions::default()
        }
    }

    fn full() -> ImpactBounds {
        ImpactBounds {
            steps: -1,
            max_downstream: -1,
            test_only: false,
        }
    }

    #[test]
    fn test_jobs_follow_dependency_order_with_key_ties() {
        let graph = diamond();
        let res = resolve(&graph, &ChangeSet::from_folders(["base"]), full());
        let pipeline = assemble(&res.subgraph, &BTreeMap::new(), &options());

        let names: Vec<&str> = pipeline.jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "build-base-1.0-h0_0-linux-64",
                "build-left-1.0-h0_0-linux-64",
                "build-right-1.0-h0_0-linux-64",
                "build-top-1.0-h0_0-linux-64",
            ]
        );
        let top = pipeline.job("build-top-1.0-h0_0-linux-64").unwrap();
        assert_eq!(
            top.passed,
            vec!["build-left-1.0-h0_0-linux-64", "build-right-1.0-h0_0-linux-64"]
        );
        assert!(pipeline.jobs[0].passed.is_empty());
    }

    #[test]
    fn test_build_step_arguments() {
        let graph = diamond();
        let res = resolve(&graph, &ChangeSet::from_folders(["base"]), ImpactBounds::default());
        let pipeline = assemble(&res.subgraph, &BTreeMap::new(), &options());
        let primary = pipeline.jobs[0].primary().unwrap();
        assert_eq!(primary.path, DEFAULT_BUILD_PROGRAM);
        assert_eq!(
            primary.args,
            vec![
                "--no-anaconda-upload",
                "--output-folder",
                "output-artifacts/c0ffee",
                "--variants",
                r#"{"python":["3.11"]}"#,
                "recipe-repo-source/base",
            ]
        );
        assert_eq!(primary.outputs, vec![ARTIFACTS_INPUT]);
    }

    #[test]
    fn test_variant_values_stay_strings() {
        let mut desc = ResolvedDescription::new("numpy", "2.0", "h0_0", "linux-64");
        desc.artifacts = vec!["numpy-2.0-h0_0.tar.bz2".to_string()];
        let row = MatrixRow::new("linux-py310", "linux-64")
            .with_variable("python", "3.10")
            .with_variable("numpy", "2.0");
        let unit = BuildUnit::from_description("numpy", &row, desc);

        let arg = variants_arg(&unit);
        assert_eq!(arg, r#"{"numpy":["2.0"],"python":["3.10"]}"#);
        let parsed: BTreeMap<String, Vec<String>> = serde_json::from_str(&arg).unwrap();
        assert_eq!(parsed["python"], vec!["3.10"]);
    }

    #[test]
    fn test_test_only_jobs_carry_no_uploads() {
        let graph = diamond();
        let bounds = ImpactBounds {
            test_only: true,
            ..ImpactBounds::default()
        };
        let res = resolve(&graph, &ChangeSet::from_folders(["left"]), bounds);

        let upload = UploadTask {
            name: "anaconda-1234".to_string(),
            path: "anaconda".to_string(),
            args: vec![],
            inputs: vec![ARTIFACTS_INPUT.to_string()],
            outputs: vec![],
            credential: None,
        };
        let uploads: BTreeMap<UnitId, Vec<UploadTask>> =
            res.subgraph.unit_ids().map(|id| (id, vec![upload.clone()])).collect();
        let pipeline = assemble(&res.subgraph, &uploads, &options());

        let left = pipeline.job("test-left-1.0-h0_0-linux-64").unwrap();
        assert_eq!(left.mode, RunMode::TestOnly);
        assert_eq!(left.uploads().count(), 0);
        assert_eq!(
            left.primary().unwrap().args,
            vec!["--test", "output-artifacts/c0ffee/linux-64/left-1.0-h0_0.tar.bz2"]
        );
        assert_eq!(left.passed, vec!["build-base-1.0-h0_0-linux-64"]);

        let base = pipeline.job("build-base-1.0-h0_0-linux-64").unwrap();
        assert_eq!(base.uploads().count(), 1);
        assert_eq!(base.steps.last().unwrap().name(), "anaconda-1234");
    }

    #[test]
    fn test_assembly_is_idempotent() {
        let graph = diamond();
        let res = resolve(&graph, &ChangeSet::from_folders(["left", "right"]), full());
        let a = assemble(&res.subgraph, &BTreeMap::new(), &options());
        let b = assemble(&res.subgraph, &BTreeMap::new(), &options());
        assert_eq!(a, b);
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap().len(), 64);
    }

    #[test]
    fn test_digest_changes_with_commit() {
        let graph = diamond();
        let res = resolve(&graph, &ChangeSet::from_folders(["base"]), ImpactBounds::default());
        let a = assemble(&res.subgraph, &BTreeMap::new(), &options());
        let other = AssembleOptions {
            commit_id: "deadbeef".to_string(),
            ..AssembleOptions::default()
        };
        let b = assemble(&res.subgraph, &BTreeMap::new(), &other);
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }
}
