//! Build units, their keys and the rendered descriptions they come from.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Subdir used by packages that install on every platform.
pub const NOARCH_SUBDIR: &str = "noarch";

/// Globally unique identity of a build unit within one graph.
///
/// Field order defines the ordering used for every deterministic tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub name: String,
    pub version: String,
    pub build_string: String,
    pub subdir: String,
}

impl UnitKey {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        build_string: impl Into<String>,
        subdir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            build_string: build_string.into(),
            subdir: subdir.into(),
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.name, self.version, self.build_string, self.subdir
        )
    }
}

/// What a pipeline job does with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Build the package, test it and publish its artifacts.
    BuildAndTest,
    /// Only test already-built artifacts. Nothing is published.
    TestOnly,
}

impl RunMode {
    /// Verb used as job-name prefix.
    pub fn verb(&self) -> &'static str {
        match self {
            RunMode::BuildAndTest => "build",
            RunMode::TestOnly => "test",
        }
    }

    pub fn publishes(&self) -> bool {
        matches!(self, RunMode::BuildAndTest)
    }
}

/// Declared requirement lists of a rendered package.
///
/// Entries are raw constraints such as `"python >=3.10"`; only the package
/// name takes part in graph construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub host: Vec<String>,
    #[serde(default)]
    pub run: Vec<String>,
    #[serde(default)]
    pub test: Vec<String>,
}

impl Requirements {
    /// Distinct package names across all four lists, sorted.
    pub fn names(&self) -> BTreeSet<String> {
        self.build
            .iter()
            .chain(&self.host)
            .chain(&self.run)
            .chain(&self.test)
            .filter_map(|spec| requirement_name(spec))
            .map(str::to_string)
            .collect()
    }
}

/// Extract the package name from a match spec like `numpy >=1.26` or `zlib>=1.2`.
pub fn requirement_name(spec: &str) -> Option<&str> {
    let spec = spec.trim();
    let end = spec
        .find(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '=' | '!' | '~' | '[' | ','))
        .unwrap_or(spec.len());
    let name = &spec[..end];
    (!name.is_empty()).then_some(name)
}

/// One concrete combination of pinned variant values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixRow {
    /// Stable label, usually the matrix file stem.
    pub label: String,
    /// Platform-architecture identifier, e.g. `linux-64`.
    pub subdir: String,
    /// Whether noarch recipes render on this row.
    #[serde(default)]
    pub noarch_host: bool,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl MatrixRow {
    pub fn new(label: impl Into<String>, subdir: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            subdir: subdir.into(),
            noarch_host: false,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn hosting_noarch(mut self) -> Self {
        self.noarch_host = true;
        self
    }
}

/// A package description returned by the recipe renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDescription {
    pub name: String,
    pub version: String,
    pub build_string: String,
    pub subdir: String,
    /// Additional package names produced by the same build.
    #[serde(default)]
    pub extra_outputs: Vec<String>,
    #[serde(default)]
    pub requirements: Requirements,
    /// Artifact file names or paths produced by the build.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl ResolvedDescription {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        build_string: impl Into<String>,
        subdir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            build_string: build_string.into(),
            subdir: subdir.into(),
            extra_outputs: Vec::new(),
            requirements: Requirements::default(),
            artifacts: Vec::new(),
        }
    }

    pub fn key(&self) -> UnitKey {
        UnitKey::new(&self.name, &self.version, &self.build_string, &self.subdir)
    }
}

/// A graph node: one renderable, buildable (recipe, matrix row) result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildUnit {
    pub key: UnitKey,
    /// Recipe folder the unit was rendered from.
    pub recipe: String,
    pub matrix_row: MatrixRow,
    /// Package names this unit makes available, primary name first.
    pub provides: Vec<String>,
    pub requirements: Requirements,
    pub artifacts: Vec<String>,
}

impl BuildUnit {
    pub fn from_description(recipe: &str, row: &MatrixRow, desc: ResolvedDescription) -> Self {
        let key = desc.key();
        let mut provides = vec![desc.name];
        for extra in desc.extra_outputs {
            if !provides.contains(&extra) {
                provides.push(extra);
            }
        }
        Self {
            key,
            recipe: recipe.to_string(),
            matrix_row: row.clone(),
            provides,
            requirements: desc.requirements,
            artifacts: desc.artifacts,
        }
    }

    pub fn subdir(&self) -> &str {
        &self.key.subdir
    }

    pub fn is_noarch(&self) -> bool {
        self.key.subdir == NOARCH_SUBDIR
    }

    /// Whether `self` may satisfy a requirement of `consumer`.
    ///
    /// Same subdir, or a noarch producer for any consumer.
    pub fn can_serve(&self, consumer: &BuildUnit) -> bool {
        self.is_noarch() || self.key.subdir == consumer.key.subdir
    }
}
