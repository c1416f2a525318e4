//! Project configuration on disk.
//!
//! A config root holds:
//!
//! ```text
//! <root>/config.toml        shared variables + optional [planner] table
//! <root>/uploads.d/*.toml   one upload target per file
//! <root>/matrix/*.toml      one matrix row per file
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PlanError, PlanResult};
use crate::unit::MatrixRow;
use crate::upload::{NamedUploadTarget, RejectedTarget, UploadTarget, UPLOADS_DIR};

/// Shared configuration file inside the config root.
pub const CONFIG_FILE: &str = "config.toml";
/// Default matrix folder inside the config root.
pub const MATRIX_DIR: &str = "matrix";

const PLANNER_TABLE: &str = "planner";

/// Free-form shared variables, stringified.
///
/// Used for command-template substitution and CI credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConfig {
    vars: BTreeMap<String, String>,
}

impl SharedConfig {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Defaults for a planning run, from the `[planner]` table.
///
/// Every field is optional; command-line flags take precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannerSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_downstream: Option<i64>,

    /// Executable of the primary job step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_program: Option<String>,

    /// Docker image repository for CI tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_repository: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    /// Treat any rejected upload target as fatal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict_uploads: Option<bool>,
}

/// Upload targets of a project, in file-name order.
#[derive(Debug, Default)]
pub struct UploadConfig {
    pub targets: Vec<NamedUploadTarget>,
    /// Files that matched no upload shape.
    pub rejected: Vec<RejectedTarget>,
}

impl UploadConfig {
    /// Read every `*.toml` file in `dir`. A missing folder means no targets.
    pub fn load_dir(dir: &Path) -> PlanResult<Self> {
        let mut config = UploadConfig::default();
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "No upload folder");
            return Ok(config);
        }

        for path in toml_files(dir)? {
            let name = file_stem(&path);
            let text = std::fs::read_to_string(&path).map_err(|e| PlanError::io(&path, e))?;
            let table: toml::Table = toml::from_str(&text).map_err(|e| PlanError::toml(&path, e))?;
            match UploadTarget::classify(table) {
                Ok(target) => {
                    debug!(upload = %name, kind = target.kind(), "Loaded upload target");
                    config.targets.push(NamedUploadTarget::new(name, target));
                }
                Err(reason) => {
                    let error = PlanError::upload_config(&name, reason);
                    warn!(upload = %name, %error, "Rejecting upload target");
                    config.rejected.push(RejectedTarget { target: name, error });
                }
            }
        }

        info!(
            targets = config.targets.len(),
            rejected = config.rejected.len(),
            "Loaded upload configuration"
        );
        Ok(config)
    }
}

/// Everything read from a config root, apart from the matrix.
#[derive(Debug, Default)]
pub struct ProjectConfig {
    pub root: PathBuf,
    pub shared: SharedConfig,
    pub planner: PlannerSettings,
    pub uploads: UploadConfig,
}

impl ProjectConfig {
    /// Load `config.toml` and `uploads.d/` below `root`. Both are optional.
    pub fn load(root: &Path) -> PlanResult<Self> {
        let config_file = root.join(CONFIG_FILE);
        let (shared, planner) = if config_file.is_file() {
            let text =
                std::fs::read_to_string(&config_file).map_err(|e| PlanError::io(&config_file, e))?;
            parse_config_file(&config_file, &text)?
        } else {
            debug!(path = %config_file.display(), "No shared configuration file");
            (SharedConfig::default(), PlannerSettings::default())
        };
        let uploads = UploadConfig::load_dir(&root.join(UPLOADS_DIR))?;

        Ok(Self {
            root: root.to_path_buf(),
            shared,
            planner,
            uploads,
        })
    }

    /// Default matrix folder for this root.
    pub fn matrix_dir(&self) -> PathBuf {
        self.root.join(MATRIX_DIR)
    }
}

/// Split `config.toml` into shared variables and planner settings.
pub fn parse_config_file(path: &Path, text: &str) -> PlanResult<(SharedConfig, PlannerSettings)> {
    let mut table: toml::Table = toml::from_str(text).map_err(|e| PlanError::toml(path, e))?;

    let planner = match table.remove(PLANNER_TABLE) {
        Some(value) => value
            .try_into()
            .map_err(|e: toml::de::Error| PlanError::invalid_config(path, e))?,
        None => PlannerSettings::default(),
    };

    let mut shared = SharedConfig::default();
    for (key, value) in table {
        match scalar_to_string(&value) {
            Some(s) => shared.insert(key, s),
            None => warn!(path = %path.display(), key = %key, "Ignoring non-scalar shared value"),
        }
    }
    Ok((shared, planner))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatrixFile {
    subdir: String,
    #[serde(default)]
    noarch_host: bool,
    #[serde(default)]
    variables: toml::Table,
}

/// One matrix row per `*.toml` file in `dir`, labelled by file stem.
pub fn load_matrix_dir(dir: &Path) -> PlanResult<Vec<MatrixRow>> {
    let mut rows = Vec::new();
    for path in toml_files(dir)? {
        let text = std::fs::read_to_string(&path).map_err(|e| PlanError::io(&path, e))?;
        let file: MatrixFile = toml::from_str(&text).map_err(|e| PlanError::toml(&path, e))?;

        let mut row = MatrixRow::new(file_stem(&path), file.subdir);
        row.noarch_host = file.noarch_host;
        for (key, value) in file.variables {
            let value = scalar_to_string(&value).ok_or_else(|| {
                PlanError::invalid_config(&path, format!("variable '{key}' must be a scalar"))
            })?;
            row.variables.insert(key, value);
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(PlanError::invalid_config(dir, "no matrix rows found"));
    }
    info!(rows = rows.len(), dir = %dir.display(), "Loaded build matrix");
    Ok(rows)
}

fn toml_files(dir: &Path) -> PlanResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| PlanError::io(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| PlanError::io(dir, e))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn scalar_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}
