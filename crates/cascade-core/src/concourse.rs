//! Concourse rendering of an assembled [`Pipeline`].
//!
//! Every job plan is: `get` the recipe source (constrained by `passed`),
//! `get` the config resource, the primary task, then upload tasks in the
//! order they were generated.
//!
//! When an artifact store is configured, publishing jobs end with a `put` of
//! their artifacts to it and test-only jobs `get` their artifacts from it.
//! Rendering fails if any task would read a directory that no earlier step
//! of its job provides.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::{PlannerSettings, SharedConfig, CONFIG_FILE};
use crate::error::{PlanError, PlanResult};
use crate::pipeline::{Job, Pipeline, Step, SOURCE_INPUT};
use crate::upload::{ARTIFACTS_INPUT, CONFIG_INPUT};

pub const DEFAULT_IMAGE_REPOSITORY: &str = "public.ecr.aws/y0o4y9o3/anaconda-pkg-build";
pub const DEFAULT_IMAGE_TAG: &str = "master";
const DEFAULT_BRANCH: &str = "master";

const RSYNC_RESOURCE_TYPE: &str = "rsync-resource";
const RSYNC_RESOURCE_IMAGE: &str = "conda/concourse-rsync-resource";

/// Rsync server holding built artifacts between pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStore {
    pub server: String,
    pub base_dir: String,
    pub user: String,
    /// Private key value or a credential-manager reference to one.
    pub private_key: String,
}

/// Resource and image settings for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcourseOptions {
    pub source_uri: String,
    pub source_branch: String,
    pub config_uri: String,
    pub config_branch: String,
    pub image_repository: String,
    pub image_tag: String,
    pub docker_user: Option<String>,
    pub docker_pass: Option<String>,
    pub artifact_store: Option<ArtifactStore>,
}

impl ConcourseOptions {
    /// Options for the given repositories with default branches and image.
    pub fn new(source_uri: impl Into<String>, config_uri: impl Into<String>) -> Self {
        Self {
            source_uri: source_uri.into(),
            source_branch: DEFAULT_BRANCH.to_string(),
            config_uri: config_uri.into(),
            config_branch: DEFAULT_BRANCH.to_string(),
            image_repository: DEFAULT_IMAGE_REPOSITORY.to_string(),
            image_tag: DEFAULT_IMAGE_TAG.to_string(),
            docker_user: None,
            docker_pass: None,
            artifact_store: None,
        }
    }

    /// Read repository, registry and artifact store settings from shared
    /// config; image settings come from the planner table.
    ///
    /// `recipe-repo` and `config-repo` are required. The artifact store is
    /// enabled by `artifact-server`, which then also needs
    /// `artifact-base-dir`, `artifact-user` and `artifact-private-key`.
    pub fn from_config(shared: &SharedConfig, planner: &PlannerSettings) -> PlanResult<Self> {
        let get = |key: &str| shared.get(key).filter(|v| !v.is_empty()).map(str::to_string);
        let require = |key: &str, why: &str| {
            get(key).ok_or_else(|| {
                PlanError::invalid_config(CONFIG_FILE, format!("missing `{key}` ({why})"))
            })
        };

        let mut options = Self::new(
            require("recipe-repo", "git uri of the recipe repository")?,
            require("config-repo", "git uri of the config repository")?,
        );
        if let Some(branch) = get("recipe-repo-branch") {
            options.source_branch = branch;
        }
        if let Some(branch) = get("config-repo-branch") {
            options.config_branch = branch;
        }
        if let Some(repository) = &planner.image_repository {
            options.image_repository = repository.clone();
        }
        if let Some(tag) = &planner.image_tag {
            options.image_tag = tag.clone();
        }
        options.docker_user = get("docker-user");
        options.docker_pass = get("docker-pass");

        if let Some(server) = get("artifact-server") {
            let why = "required with `artifact-server`";
            options.artifact_store = Some(ArtifactStore {
                server,
                base_dir: require("artifact-base-dir", why)?,
                user: require("artifact-user", why)?,
                private_key: require("artifact-private-key", why)?,
            });
        }
        Ok(options)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcoursePipeline {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<ResourceType>,
    pub resources: Vec<Resource>,
    pub jobs: Vec<ConcourseJob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceType {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: ResourceSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceSource {
    Git(GitSource),
    Rsync(RsyncSource),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    pub uri: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsyncSource {
    pub server: String,
    pub base_dir: String,
    pub user: String,
    pub private_key: String,
    /// Sync straight into `base_dir` instead of a per-version folder.
    pub disable_version_path: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcourseJob {
    pub name: String,
    pub plan: Vec<PlanStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanStep {
    Get(GetStep),
    Put(PutStep),
    Task(TaskStep),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStep {
    pub get: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passed: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub trigger: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutStep {
    pub put: String,
    pub params: PutParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutParams {
    pub sync_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStep {
    pub task: String,
    pub config: TaskConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub platform: String,
    pub image_resource: ImageResource,
    pub inputs: Vec<NamedDir>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<NamedDir>,
    pub run: RunConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResource {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    pub repository: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedDir {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub path: String,
    pub args: Vec<String>,
}

/// Render `pipeline` as a Concourse pipeline definition.
///
/// Fails with [`PlanError::MissingInput`] when a task reads a directory
/// nothing in its job provides, e.g. a test-only job without an artifact
/// store.
pub fn render(pipeline: &Pipeline, options: &ConcourseOptions) -> PlanResult<ConcoursePipeline> {
    let jobs = pipeline
        .jobs
        .iter()
        .map(|job| render_job(job, options))
        .collect::<PlanResult<Vec<_>>>()?;

    let mut resources = vec![
        git_resource(SOURCE_INPUT, &options.source_uri, &options.source_branch),
        git_resource(CONFIG_INPUT, &options.config_uri, &options.config_branch),
    ];
    let mut resource_types = Vec::new();
    if let Some(store) = &options.artifact_store {
        if jobs.iter().any(uses_artifact_store) {
            resources.push(Resource {
                name: ARTIFACTS_INPUT.to_string(),
                kind: RSYNC_RESOURCE_TYPE.to_string(),
                source: ResourceSource::Rsync(RsyncSource {
                    server: store.server.clone(),
                    base_dir: store.base_dir.clone(),
                    user: store.user.clone(),
                    private_key: store.private_key.clone(),
                    disable_version_path: true,
                }),
            });
            resource_types.push(ResourceType {
                name: RSYNC_RESOURCE_TYPE.to_string(),
                kind: "docker-image".to_string(),
                source: ImageSource {
                    repository: RSYNC_RESOURCE_IMAGE.to_string(),
                    tag: "latest".to_string(),
                    username: None,
                    password: None,
                },
            });
        }
    }

    Ok(ConcoursePipeline {
        resource_types,
        resources,
        jobs,
    })
}

fn git_resource(name: &str, uri: &str, branch: &str) -> Resource {
    Resource {
        name: name.to_string(),
        kind: "git".to_string(),
        source: ResourceSource::Git(GitSource {
            uri: uri.to_string(),
            branch: branch.to_string(),
        }),
    }
}

fn uses_artifact_store(job: &ConcourseJob) -> bool {
    job.plan.iter().any(|step| match step {
        PlanStep::Get(get) => get.get == ARTIFACTS_INPUT,
        PlanStep::Put(put) => put.put == ARTIFACTS_INPUT,
        PlanStep::Task(_) => false,
    })
}

fn get_step(resource: &str, passed: Vec<String>) -> PlanStep {
    PlanStep::Get(GetStep {
        get: resource.to_string(),
        trigger: !passed.is_empty(),
        passed,
    })
}

fn render_job(job: &Job, options: &ConcourseOptions) -> PlanResult<ConcourseJob> {
    let mut plan = vec![
        get_step(SOURCE_INPUT, job.passed.clone()),
        get_step(CONFIG_INPUT, Vec::new()),
    ];
    let mut provided: BTreeSet<&str> = BTreeSet::from([SOURCE_INPUT, CONFIG_INPUT]);

    for step in &job.steps {
        let (name, path, args, inputs, outputs) = match step {
            Step::Primary(t) => (&t.name, &t.path, &t.args, &t.inputs, &t.outputs),
            Step::Upload(t) => (&t.name, &t.path, &t.args, &t.inputs, &t.outputs),
        };
        for input in inputs {
            if provided.contains(input.as_str()) {
                continue;
            }
            if input != ARTIFACTS_INPUT || options.artifact_store.is_none() {
                return Err(PlanError::MissingInput {
                    job: job.name.clone(),
                    task: name.clone(),
                    input: input.clone(),
                });
            }
            plan.push(get_step(ARTIFACTS_INPUT, Vec::new()));
            provided.insert(ARTIFACTS_INPUT);
        }

        plan.push(PlanStep::Task(TaskStep {
            task: name.clone(),
            config: TaskConfig {
                platform: "linux".to_string(),
                image_resource: image_resource(options),
                inputs: named_dirs(inputs),
                outputs: named_dirs(outputs),
                run: RunConfig {
                    path: path.clone(),
                    args: args.clone(),
                },
            },
        }));
        provided.extend(outputs.iter().map(String::as_str));
    }

    if job.mode.publishes() && options.artifact_store.is_some() && provided.contains(ARTIFACTS_INPUT)
    {
        plan.push(PlanStep::Put(PutStep {
            put: ARTIFACTS_INPUT.to_string(),
            params: PutParams {
                sync_dir: ARTIFACTS_INPUT.to_string(),
            },
        }));
    }

    Ok(ConcourseJob {
        name: job.name.clone(),
        plan,
    })
}

fn image_resource(options: &ConcourseOptions) -> ImageResource {
    // credentials only when both halves are present
    let (username, password) = match (&options.docker_user, &options.docker_pass) {
        (Some(user), Some(pass)) => (Some(user.clone()), Some(pass.clone())),
        _ => (None, None),
    };
    ImageResource {
        kind: "docker-image".to_string(),
        source: ImageSource {
            repository: options.image_repository.clone(),
            tag: options.image_tag.clone(),
            username,
            password,
        },
    }
}

fn named_dirs(names: &[String]) -> Vec<NamedDir> {
    names.iter().map(|name| NamedDir { name: name.clone() }).collect()
}
