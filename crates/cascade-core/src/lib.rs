//! Cascade Core Library
//!
//! Plans CI pipelines for a repository of interdependent package recipes:
//! render every recipe against the build matrix, resolve what a change
//! touches, generate upload tasks and assemble ordered jobs.

pub mod changes;
pub mod concourse;
pub mod config;
pub mod error;
pub mod graph;
pub mod impact;
pub mod pipeline;
pub mod planner;
pub mod render;
pub mod unit;
pub mod upload;

pub use changes::{capture_head_sha, changed_paths_from_git, discover_recipes, ChangeSet};
pub use concourse::{ArtifactStore, ConcourseOptions, ConcoursePipeline};
pub use config::{load_matrix_dir, PlannerSettings, ProjectConfig, SharedConfig, UploadConfig};
pub use error::{PlanError, PlanResult};
pub use graph::{BuildGraph, UnitId};
pub use impact::{resolve, ImpactBounds, Inclusion, Resolution, SubBuildGraph, TruncationWarning};
pub use pipeline::{assemble, AssembleOptions, Job, Pipeline, PrimaryTask, Step};
pub use planner::{PlanContext, PlanOptions, PlanOutcome, PlanSummary, PlanWarning, Planner};
pub use render::{RecipeRenderer, StaticRenderer, TomlRecipeRenderer};
pub use unit::{BuildUnit, MatrixRow, Requirements, ResolvedDescription, RunMode, UnitKey};
pub use upload::{
    generate_tasks, GeneratedUploads, NamedUploadTarget, RejectedTarget, UploadTarget, UploadTask,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
