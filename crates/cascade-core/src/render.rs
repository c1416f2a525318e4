//! Recipe rendering adapters.
//!
//! Rendering expands one recipe against one matrix row into zero or more
//! [`ResolvedDescription`]s. The planner treats it as a pure function; inject
//! a real metadata renderer, [`TomlRecipeRenderer`] for `recipe.toml`
//! folders, or [`StaticRenderer`] for pre-rendered descriptions.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{PlanError, PlanResult};
use crate::unit::{MatrixRow, Requirements, ResolvedDescription, NOARCH_SUBDIR};

/// File name of the recipe definition read by [`TomlRecipeRenderer`].
pub const RECIPE_FILE: &str = "recipe.toml";

/// Renders a recipe against a matrix row.
///
/// Must be deterministic for a fixed recipe tree and row.
pub trait RecipeRenderer {
    fn render(&self, recipe: &str, row: &MatrixRow) -> PlanResult<Vec<ResolvedDescription>>;
}

impl<R: RecipeRenderer + ?Sized> RecipeRenderer for Box<R> {
    fn render(&self, recipe: &str, row: &MatrixRow) -> PlanResult<Vec<ResolvedDescription>> {
        (**self).render(recipe, row)
    }
}

/// Pre-rendered descriptions keyed by recipe.
///
/// A description applies to every row with the same subdir; noarch
/// descriptions apply to rows that host noarch builds.
#[derive(Debug, Clone, Default)]
pub struct StaticRenderer {
    recipes: BTreeMap<String, Vec<ResolvedDescription>>,
}

impl StaticRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, recipe: impl Into<String>, desc: ResolvedDescription) -> Self {
        self.insert(recipe, desc);
        self
    }

    pub fn insert(&mut self, recipe: impl Into<String>, desc: ResolvedDescription) {
        self.recipes.entry(recipe.into()).or_default().push(desc);
    }

    /// Recipes known to this renderer, sorted.
    pub fn recipes(&self) -> Vec<String> {
        self.recipes.keys().cloned().collect()
    }
}

impl RecipeRenderer for StaticRenderer {
    fn render(&self, recipe: &str, row: &MatrixRow) -> PlanResult<Vec<ResolvedDescription>> {
        let Some(descs) = self.recipes.get(recipe) else {
            return Err(PlanError::render(recipe, &row.label, "unknown recipe"));
        };
        Ok(descs
            .iter()
            .filter(|d| {
                if d.subdir == NOARCH_SUBDIR {
                    row.noarch_host
                } else {
                    d.subdir == row.subdir
                }
            })
            .cloned()
            .collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeFile {
    package: PackageSection,
    #[serde(default)]
    requirements: RequirementsSection,
    #[serde(default)]
    test: TestSection,
    #[serde(default)]
    outputs: Vec<OutputSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageSection {
    name: String,
    version: String,
    #[serde(default)]
    build_number: u32,
    #[serde(default)]
    noarch: bool,
    /// Subdirs this recipe does not build on.
    #[serde(default)]
    skip: Vec<String>,
    /// Matrix variables that feed the build string. Defaults to all of them.
    uses: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequirementsSection {
    #[serde(default)]
    build: Vec<String>,
    #[serde(default)]
    host: Vec<String>,
    #[serde(default)]
    run: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TestSection {
    #[serde(default)]
    requires: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OutputSection {
    name: String,
}

/// Renders `<root>/<recipe>/recipe.toml` folders.
#[derive(Debug, Clone)]
pub struct TomlRecipeRenderer {
    root: PathBuf,
}

impl TomlRecipeRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load(&self, recipe: &str) -> PlanResult<RecipeFile> {
        let path = self.root.join(recipe).join(RECIPE_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| PlanError::io(&path, e))?;
        toml::from_str(&text).map_err(|e| PlanError::toml(&path, e))
    }
}

impl RecipeRenderer for TomlRecipeRenderer {
    fn render(&self, recipe: &str, row: &MatrixRow) -> PlanResult<Vec<ResolvedDescription>> {
        let file = self.load(recipe)?;
        let package = &file.package;

        if package.noarch && !row.noarch_host {
            return Ok(Vec::new());
        }
        if package.skip.iter().any(|s| s == &row.subdir) {
            return Ok(Vec::new());
        }

        let used: Vec<(&str, &str)> = match &package.uses {
            Some(names) => {
                let mut pairs = Vec::with_capacity(names.len());
                for name in names {
                    let value = row.variables.get(name).ok_or_else(|| {
                        PlanError::render(
                            recipe,
                            &row.label,
                            format!("matrix row does not pin variable '{name}'"),
                        )
                    })?;
                    pairs.push((name.as_str(), value.as_str()));
                }
                pairs.sort();
                pairs.dedup();
                pairs
            }
            None => row
                .variables
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
        };

        let build_string = format!("h{}_{}", variant_hash(&used), package.build_number);
        let subdir = if package.noarch {
            NOARCH_SUBDIR.to_string()
        } else {
            row.subdir.clone()
        };

        let mut desc = ResolvedDescription::new(&package.name, &package.version, build_string, subdir);
        desc.extra_outputs = file.outputs.iter().map(|o| o.name.clone()).collect();
        desc.requirements = Requirements {
            build: file.requirements.build.clone(),
            host: file.requirements.host.clone(),
            run: file.requirements.run.clone(),
            test: file.test.requires.clone(),
        };
        // first occurrence wins; outputs may repeat the package name
        let mut seen = BTreeSet::new();
        desc.artifacts = std::iter::once(&package.name)
            .chain(desc.extra_outputs.iter())
            .filter(|name| seen.insert(*name))
            .map(|name| {
                format!(
                    "{}-{}-{}.tar.bz2",
                    name, package.version, desc.build_string
                )
            })
            .collect();

        Ok(vec![desc])
    }
}

/// First seven hex characters of the SHA-256 over sorted `key=value` lines.
fn variant_hash(pairs: &[(&str, &str)]) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in pairs {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hex::encode(hasher.finalize());
    digest[..7].to_string()
}
