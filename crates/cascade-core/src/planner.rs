//! One planning run, end to end.
//!
//! A [`PlanContext`] carries everything a run reads: renderer, matrix,
//! upload targets, shared values and options. [`Planner::plan`] consumes it
//! and runs construct, resolve, generate and assemble in that order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::changes::ChangeSet;
use crate::config::{PlannerSettings, SharedConfig, UploadConfig};
use crate::error::PlanResult;
use crate::graph::{BuildGraph, UnitId};
use crate::impact::{resolve, ImpactBounds, TruncationWarning};
use crate::pipeline::{assemble, AssembleOptions, Pipeline};
use crate::render::RecipeRenderer;
use crate::unit::MatrixRow;
use crate::upload::{generate_tasks, RejectedTarget, UploadTask};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOptions {
    pub bounds: ImpactBounds,
    /// Any rejected upload target fails the run.
    pub strict_uploads: bool,
    pub assemble: AssembleOptions,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            bounds: ImpactBounds::default(),
            strict_uploads: true,
            assemble: AssembleOptions::default(),
        }
    }
}

impl PlanOptions {
    /// Defaults overridden by the `[planner]` table. Bounds below `-1` are
    /// rejected.
    pub fn from_settings(settings: &PlannerSettings) -> PlanResult<Self> {
        let mut options = Self::default();
        if let Some(steps) = settings.steps {
            options.bounds.steps = steps;
        }
        if let Some(max) = settings.max_downstream {
            options.bounds.max_downstream = max;
        }
        if let Some(program) = &settings.build_program {
            options.assemble.build_program = program.clone();
        }
        if let Some(strict) = settings.strict_uploads {
            options.strict_uploads = strict;
        }
        options.bounds.validate()?;
        Ok(options)
    }
}

/// Inputs of one planning invocation.
pub struct PlanContext<R> {
    pub renderer: R,
    pub matrix: Vec<MatrixRow>,
    pub uploads: UploadConfig,
    pub shared: SharedConfig,
    pub options: PlanOptions,
}

impl<R: RecipeRenderer> PlanContext<R> {
    pub fn new(renderer: R, matrix: Vec<MatrixRow>) -> Self {
        Self {
            renderer,
            matrix,
            uploads: UploadConfig::default(),
            shared: SharedConfig::default(),
            options: PlanOptions::default(),
        }
    }

    pub fn with_uploads(mut self, uploads: UploadConfig) -> Self {
        self.uploads = uploads;
        self
    }

    pub fn with_shared(mut self, shared: SharedConfig) -> Self {
        self.shared = shared;
        self
    }

    pub fn with_options(mut self, options: PlanOptions) -> Self {
        self.options = options;
        self
    }
}

/// Non-fatal findings of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanWarning {
    Truncated(TruncationWarning),
    /// A changed folder is not one of the planned recipes.
    UnknownRecipe(String),
}

impl fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanWarning::Truncated(w) => write!(f, "{w}"),
            PlanWarning::UnknownRecipe(recipe) => {
                write!(f, "changed folder '{recipe}' is not a known recipe")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub graph_units: usize,
    pub graph_edges: usize,
    pub planned_units: usize,
    pub downstream_units: usize,
    pub upload_tasks: usize,
}

#[derive(Debug)]
pub struct PlanOutcome {
    pub pipeline: Pipeline,
    pub warnings: Vec<PlanWarning>,
    /// Upload targets left out of the plan. Always empty in strict mode.
    pub rejected: Vec<RejectedTarget>,
    pub summary: PlanSummary,
}

pub struct Planner<R> {
    context: PlanContext<R>,
}

impl<R: RecipeRenderer> Planner<R> {
    pub fn new(context: PlanContext<R>) -> Self {
        Self { context }
    }

    /// Plan the pipeline for `change_set` over `recipes`.
    ///
    /// Cycles, duplicate keys and render failures abort the run. So does a
    /// rejected upload target when uploads are strict.
    pub fn plan(self, recipes: &[String], change_set: &ChangeSet) -> PlanResult<PlanOutcome> {
        let PlanContext {
            renderer,
            matrix,
            uploads,
            shared,
            options,
        } = self.context;
        options.bounds.validate()?;

        let mut rejected = uploads.rejected;
        if options.strict_uploads {
            if let Some(first) = rejected.into_iter().next() {
                return Err(first.error);
            }
            rejected = Vec::new();
        }

        let graph = BuildGraph::construct(recipes, &matrix, &renderer)?;

        let known: BTreeSet<&str> = recipes.iter().map(String::as_str).collect();
        let mut warnings: Vec<PlanWarning> = change_set
            .iter()
            .filter(|r| !known.contains(r))
            .map(|r| {
                warn!(recipe = %r, "Changed folder is not a known recipe");
                PlanWarning::UnknownRecipe(r.to_string())
            })
            .collect();

        let resolution = resolve(&graph, change_set, options.bounds);
        if let Some(truncation) = resolution.truncation {
            warnings.push(PlanWarning::Truncated(truncation));
        }
        let subgraph = resolution.subgraph;

        let mut tasks_by_unit: BTreeMap<UnitId, Vec<UploadTask>> = BTreeMap::new();
        for id in subgraph.unit_ids() {
            if !subgraph.run_mode(id).is_some_and(|m| m.publishes()) {
                continue;
            }
            let generated = generate_tasks(
                graph.unit(id),
                &uploads.targets,
                &shared,
                &options.assemble.commit_id,
            );
            let tasks = if options.strict_uploads {
                generated.into_strict()?
            } else {
                for reject in generated.rejected {
                    if !rejected.iter().any(|r| r.target == reject.target) {
                        rejected.push(reject);
                    }
                }
                generated.tasks
            };
            tasks_by_unit.insert(id, tasks);
        }

        let pipeline = assemble(&subgraph, &tasks_by_unit, &options.assemble);
        let summary = PlanSummary {
            graph_units: graph.len(),
            graph_edges: graph.edge_count(),
            planned_units: subgraph.len(),
            downstream_units: subgraph.downstream_ids().count(),
            upload_tasks: tasks_by_unit.values().map(Vec::len).sum(),
        };
        info!(
            graph_units = summary.graph_units,
            planned = summary.planned_units,
            jobs = pipeline.len(),
            warnings = warnings.len(),
            rejected = rejected.len(),
            "Planned pipeline"
        );

        Ok(PlanOutcome {
            pipeline,
            warnings,
            rejected,
            summary,
        })
    }
}
