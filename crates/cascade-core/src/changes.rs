//! Change sets: which recipes a planning run starts from.
//!
//! A [`ChangeSet`] comes either from an explicit folder list or from the
//! paths touched by a git revision range.

use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::{PlanError, PlanResult};
use crate::render::RECIPE_FILE;

/// Immutable set of changed recipe folders, `/`-separated and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    recipes: BTreeSet<String>,
}

impl ChangeSet {
    /// Build from explicit recipe folders.
    pub fn from_folders<I, S>(folders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let recipes = folders
            .into_iter()
            .map(|f| normalize(f.as_ref()))
            .filter(|f| !f.is_empty())
            .collect();
        Self { recipes }
    }

    /// Map changed file paths onto the deepest known recipe folder holding them.
    pub fn from_paths<I, S>(paths: I, known_recipes: &[String]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut recipes = BTreeSet::new();
        for path in paths {
            let path = normalize(path.as_ref());
            let owner = known_recipes
                .iter()
                .filter(|recipe| {
                    path == **recipe
                        || path
                            .strip_prefix(recipe.as_str())
                            .is_some_and(|rest| rest.starts_with('/'))
                })
                .max_by_key(|recipe| recipe.len());
            match owner {
                Some(recipe) => {
                    recipes.insert(recipe.clone());
                }
                None => debug!(path = %path, "Changed path belongs to no recipe"),
            }
        }
        Self { recipes }
    }

    pub fn contains(&self, recipe: &str) -> bool {
        self.recipes.contains(recipe)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.recipes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }
}

fn normalize(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let mut path = path.as_str();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.trim_end_matches('/').to_string()
}

/// Every folder below `root` holding a recipe file, relative and sorted.
///
/// Hidden folders are skipped. Recipe folders are not searched further.
pub fn discover_recipes(root: &Path) -> PlanResult<Vec<String>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        if dir != root && dir.join(RECIPE_FILE).is_file() {
            let relative = dir
                .strip_prefix(root)
                .map_err(|e| PlanError::invalid_config(&dir, e))?;
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            found.push(parts.join("/"));
            continue;
        }

        let entries = std::fs::read_dir(&dir).map_err(|e| PlanError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| PlanError::io(&dir, e))?;
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            let is_dir = entry
                .file_type()
                .map_err(|e| PlanError::io(entry.path(), e))?
                .is_dir();
            if is_dir && !hidden {
                pending.push(entry.path());
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Files changed in a revision range.
///
/// Without `stop_rev` the range is `git_rev~1..git_rev`, otherwise
/// `git_rev..stop_rev`.
pub fn changed_paths_from_git(
    repo_dir: &Path,
    git_rev: &str,
    stop_rev: Option<&str>,
) -> PlanResult<Vec<String>> {
    let range = match stop_rev {
        Some(stop) => format!("{git_rev}..{stop}"),
        None => format!("{git_rev}~1..{git_rev}"),
    };
    let stdout = run_git(repo_dir, &["diff", "--name-only", &range])?;
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Resolve `rev` (usually `HEAD`) to a full commit SHA.
pub fn capture_head_sha(repo_dir: &Path, rev: &str) -> PlanResult<String> {
    let sha = run_git(repo_dir, &["rev-parse", rev])?.trim().to_string();
    if sha.is_empty() {
        return Err(PlanError::Git(format!("git rev-parse {rev} returned empty output")));
    }
    Ok(sha)
}

fn run_git(repo_dir: &Path, args: &[&str]) -> PlanResult<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| PlanError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlanError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
