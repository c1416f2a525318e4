//! Upload task generation.
//!
//! Each upload target is one of three shapes, classified once when the
//! configuration is loaded:
//!
//! - **token**: one `anaconda upload` task per artifact.
//! - **server**: `scp` the artifact, `chmod 664` it remotely, then rebuild the
//!   remote channel index. The three tasks always come in that order.
//! - **commands**: free-form command templates. Placeholders are filled from
//!   `package` and the shared configuration with no filtering, so any shared
//!   value, secrets included, can end up in a rendered command.
//!
//! Tasks reference uploaded key files through the `config` input; key
//! material itself never appears in a task.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SharedConfig;
use crate::error::{PlanError, PlanResult};
use crate::unit::BuildUnit;

/// CI input holding the built packages.
pub const ARTIFACTS_INPUT: &str = "output-artifacts";
/// CI input holding the project configuration folder.
pub const CONFIG_INPUT: &str = "config";
/// Location of upload target files and key files inside [`CONFIG_INPUT`].
pub const UPLOADS_DIR: &str = "uploads.d";

const DEFAULT_SSH_PORT: u16 = 22;

/// Publish to a channel with an API token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenTarget {
    pub token: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl TokenTarget {
    /// `user` when set, else the last four characters of the token.
    pub fn identifier(&self) -> &str {
        if let Some(user) = &self.user {
            return user;
        }
        let start = self
            .token
            .char_indices()
            .rev()
            .nth(3)
            .map(|(i, _)| i)
            .unwrap_or(0);
        &self.token[start..]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerAuth {
    pub user: String,
    /// Key file name inside the uploads folder.
    pub key_file: String,
}

/// Copy to a server over ssh and re-index the remote channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerTarget {
    pub server: String,
    /// Remote folder; `{subdir}` is replaced by the unit's subdir.
    pub destination_path: String,
    pub auth: ServerAuth,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl ServerTarget {
    /// Credential reference as seen from inside a CI task.
    pub fn key_reference(&self) -> String {
        format!("{CONFIG_INPUT}/{UPLOADS_DIR}/{}", self.auth.key_file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCommandTarget {
    commands: OneOrMany,
}

/// Arbitrary shell command templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTarget {
    pub commands: Vec<String>,
}

/// A declarative publish destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadTarget {
    Token(TokenTarget),
    Server(ServerTarget),
    Commands(CommandTarget),
}

impl UploadTarget {
    /// Decide the shape of a parsed target file.
    ///
    /// Exactly one of `token`, `server` or `commands` must be present.
    pub fn classify(table: toml::Table) -> Result<Self, String> {
        let present: Vec<&str> = ["token", "server", "commands"]
            .into_iter()
            .filter(|k| table.contains_key(*k))
            .collect();

        let target = match present.as_slice() {
            ["token"] => {
                let target: TokenTarget = toml::Value::Table(table)
                    .try_into()
                    .map_err(|e| e.to_string())?;
                if target.token.is_empty() {
                    return Err("token must not be empty".to_string());
                }
                UploadTarget::Token(target)
            }
            ["server"] => {
                let target: ServerTarget = toml::Value::Table(table)
                    .try_into()
                    .map_err(|e| e.to_string())?;
                UploadTarget::Server(target)
            }
            ["commands"] => {
                let raw: RawCommandTarget = toml::Value::Table(table)
                    .try_into()
                    .map_err(|e| e.to_string())?;
                let commands = match raw.commands {
                    OneOrMany::One(c) => vec![c],
                    OneOrMany::Many(c) => c,
                };
                UploadTarget::Commands(CommandTarget { commands })
            }
            [] => {
                return Err(
                    "unrecognized upload configuration: expected one of 'token', 'server' or 'commands'"
                        .to_string(),
                )
            }
            several => {
                return Err(format!(
                    "ambiguous upload configuration: found {}",
                    several.join(", ")
                ))
            }
        };
        Ok(target)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UploadTarget::Token(_) => "token",
            UploadTarget::Server(_) => "server",
            UploadTarget::Commands(_) => "commands",
        }
    }
}

/// An upload target with the name it was loaded under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUploadTarget {
    pub name: String,
    pub target: UploadTarget,
}

impl NamedUploadTarget {
    pub fn new(name: impl Into<String>, target: UploadTarget) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }
}

/// A target left out of planning, with the reason.
#[derive(Debug)]
pub struct RejectedTarget {
    pub target: String,
    pub error: PlanError,
}

/// One atomic CI task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadTask {
    pub name: String,
    /// Executable.
    pub path: String,
    pub args: Vec<String>,
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    /// Credential file the task reads from its inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl UploadTask {
    fn new(name: impl Into<String>, path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            args,
            inputs: vec![ARTIFACTS_INPUT.to_string()],
            outputs: Vec::new(),
            credential: None,
        }
    }

    fn with_config_input(mut self) -> Self {
        self.inputs.push(CONFIG_INPUT.to_string());
        self
    }

    fn same_definition(&self, other: &UploadTask) -> bool {
        self.name == other.name && self.path == other.path && self.args == other.args
    }
}

/// Tasks for one unit, plus targets that could not produce any.
#[derive(Debug, Default)]
pub struct GeneratedUploads {
    pub tasks: Vec<UploadTask>,
    pub rejected: Vec<RejectedTarget>,
}

impl GeneratedUploads {
    /// Fail on the first rejected target.
    pub fn into_strict(self) -> PlanResult<Vec<UploadTask>> {
        match self.rejected.into_iter().next() {
            Some(rejected) => Err(rejected.error),
            None => Ok(self.tasks),
        }
    }
}

/// Path of an artifact as seen by upload tasks.
pub fn artifact_path(commit_id: &str, subdir: &str, artifact: &str) -> String {
    let file_name = Path::new(artifact)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| artifact.to_string());
    format!("{ARTIFACTS_INPUT}/{commit_id}/{subdir}/{file_name}")
}

/// Build the ordered, deduplicated upload tasks for `unit`.
///
/// A target that fails for any artifact contributes no tasks at all and is
/// reported in [`GeneratedUploads::rejected`]; other targets are unaffected.
pub fn generate_tasks(
    unit: &BuildUnit,
    targets: &[NamedUploadTarget],
    shared: &SharedConfig,
    commit_id: &str,
) -> GeneratedUploads {
    let packages: Vec<String> = unit
        .artifacts
        .iter()
        .map(|a| artifact_path(commit_id, unit.subdir(), a))
        .collect();

    // per target, per artifact
    let mut cells: Vec<Vec<Vec<UploadTask>>> = Vec::with_capacity(targets.len());
    let mut rejected = Vec::new();
    for named in targets {
        let per_artifact: PlanResult<Vec<Vec<UploadTask>>> = packages
            .iter()
            .map(|package| tasks_for_target(unit, named, package, shared))
            .collect();
        match per_artifact {
            Ok(tasks) => cells.push(tasks),
            Err(error) => {
                warn!(unit = %unit.key, upload = %named.name, %error, "Rejecting upload target");
                rejected.push(RejectedTarget {
                    target: named.name.clone(),
                    error,
                });
                cells.push(Vec::new());
            }
        }
    }

    let mut tasks: Vec<UploadTask> = Vec::new();
    for artifact in 0..packages.len() {
        for target_tasks in &cells {
            let Some(batch) = target_tasks.get(artifact) else {
                continue;
            };
            for task in batch {
                if tasks.iter().any(|t| t.same_definition(task)) {
                    debug!(unit = %unit.key, task = %task.name, "Dropping duplicate upload task");
                    continue;
                }
                tasks.push(task.clone());
            }
        }
    }

    GeneratedUploads { tasks, rejected }
}

fn tasks_for_target(
    unit: &BuildUnit,
    named: &NamedUploadTarget,
    package: &str,
    shared: &SharedConfig,
) -> PlanResult<Vec<UploadTask>> {
    match &named.target {
        UploadTarget::Token(target) => Ok(vec![token_task(target, package)]),
        UploadTarget::Server(target) => server_tasks(target, unit.subdir(), package)
            .map_err(|reason| PlanError::upload_config(&named.name, reason)),
        UploadTarget::Commands(target) => command_tasks(target, package, shared)
            .map_err(|reason| PlanError::upload_config(&named.name, reason)),
    }
}

fn token_task(target: &TokenTarget, package: &str) -> UploadTask {
    let mut args = vec![
        "-t".to_string(),
        target.token.clone(),
        "upload".to_string(),
        "--force".to_string(),
    ];
    if let Some(user) = &target.user {
        args.extend(["--user".to_string(), user.clone()]);
    }
    if let Some(label) = &target.label {
        args.extend(["--label".to_string(), label.clone()]);
    }
    args.push(package.to_string());
    UploadTask::new(format!("anaconda-{}", target.identifier()), "anaconda", args)
}

fn server_tasks(target: &ServerTarget, subdir: &str, package: &str) -> Result<Vec<UploadTask>, String> {
    let destination = substitute(&target.destination_path, |name| {
        (name == "subdir").then(|| subdir.to_string())
    })?;
    let key = target.key_reference();
    let port = target.port.to_string();
    let host = format!("{}@{}", target.auth.user, target.server);
    let file_name = package.rsplit('/').next().unwrap_or(package);

    let scp = UploadTask::new(
        format!("scp-{}", target.server),
        "scp",
        vec![
            "-i".to_string(),
            key.clone(),
            "-P".to_string(),
            port.clone(),
            package.to_string(),
            format!("{host}:{destination}"),
        ],
    );
    let chmod = UploadTask::new(
        format!("chmod-{}", target.server),
        "ssh",
        vec![
            "-i".to_string(),
            key.clone(),
            "-p".to_string(),
            port.clone(),
            host.clone(),
            format!("chmod 664 {destination}/{file_name}"),
        ],
    );
    let index = UploadTask::new(
        format!("index-{}", target.server),
        "ssh",
        vec![
            "-i".to_string(),
            key.clone(),
            "-p".to_string(),
            port,
            host,
            format!("conda index {destination}"),
        ],
    );

    Ok([scp, chmod, index]
        .into_iter()
        .map(|task| {
            let mut task = task.with_config_input();
            task.credential = Some(key.clone());
            task
        })
        .collect())
}

fn command_tasks(
    target: &CommandTarget,
    package: &str,
    shared: &SharedConfig,
) -> Result<Vec<UploadTask>, String> {
    let mut tasks = Vec::with_capacity(target.commands.len());
    for template in &target.commands {
        let command = substitute(template, |name| {
            if name == "package" {
                Some(package.to_string())
            } else {
                shared.get(name).map(str::to_string)
            }
        })?;
        let mut words = command.split_whitespace().map(str::to_string);
        let Some(program) = words.next() else {
            return Err(format!("command template '{template}' renders to nothing"));
        };
        tasks.push(UploadTask::new("custom", program, words.collect()).with_config_input());
    }
    Ok(tasks)
}

fn placeholder_pattern() -> Result<&'static Regex, String> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{\{|\}\}|\{([^{}]+)\}"))
        .as_ref()
        .map_err(|e| format!("invalid placeholder pattern: {e}"))
}

/// Fill `{name}` placeholders; `{{` and `}}` stand for literal braces.
pub fn substitute<F>(template: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder_pattern()?.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        match caps.get(1) {
            Some(name) => {
                let name = name.as_str().trim();
                let value = lookup(name)
                    .ok_or_else(|| format!("no value for placeholder '{{{name}}}' in '{template}'"))?;
                out.push_str(&value);
            }
            None => out.push_str(&whole.as_str()[..1]),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}
