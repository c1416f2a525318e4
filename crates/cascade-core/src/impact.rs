//! Change-impact resolution.
//!
//! Given a change set, marks the units that must be rebuilt or retested:
//! the seeds, a bounded breadth-first expansion downstream, and the full
//! upstream closure of everything marked so far.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::changes::ChangeSet;
use crate::error::{PlanError, PlanResult};
use crate::graph::{BuildGraph, UnitId};
use crate::unit::RunMode;

/// Traversal bounds for one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactBounds {
    /// Downstream hops to follow. `0` = seeds only, `-1` = full closure.
    pub steps: i64,
    /// Cap on units added by downstream expansion. `-1` = unbounded.
    pub max_downstream: i64,
    /// Seeds are tested rather than rebuilt.
    pub test_only: bool,
}

impl Default for ImpactBounds {
    fn default() -> Self {
        Self {
            steps: 0,
            max_downstream: 5,
            test_only: false,
        }
    }
}

impl ImpactBounds {
    /// Reject bounds below `-1`.
    pub fn validate(&self) -> PlanResult<()> {
        for (field, value) in [("steps", self.steps), ("max_downstream", self.max_downstream)] {
            if value < -1 {
                return Err(PlanError::InvalidBound { field, value });
            }
        }
        Ok(())
    }

    fn hop_allowed(&self, hops_done: i64) -> bool {
        self.steps < 0 || hops_done < self.steps
    }

    fn cap_reached(&self, added: usize) -> bool {
        self.max_downstream >= 0 && added as i64 >= self.max_downstream
    }
}

/// Why a unit is part of the resolved subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inclusion {
    /// Rendered from a changed recipe.
    Seed,
    /// Reached by forward expansion from a seed.
    Downstream { hop: u32 },
    /// Required by an included unit.
    Upstream,
}

/// Non-fatal: downstream expansion stopped at `max_downstream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationWarning {
    pub max_downstream: i64,
    /// Hop during which the cap was hit.
    pub hop: u32,
    /// Eligible consumers left out in that hop, in key order.
    pub omitted: Vec<String>,
}

impl std::fmt::Display for TruncationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "downstream expansion truncated at {} unit(s) during hop {}; omitted {}",
            self.max_downstream,
            self.hop,
            self.omitted.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mark {
    mode: RunMode,
    inclusion: Inclusion,
}

/// Induced subgraph of a [`BuildGraph`] with a run mode per unit.
#[derive(Debug, Clone)]
pub struct SubBuildGraph<'g> {
    graph: &'g BuildGraph,
    marks: BTreeMap<UnitId, Mark>,
}

impl<'g> SubBuildGraph<'g> {
    pub fn graph(&self) -> &'g BuildGraph {
        self.graph
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn contains(&self, id: UnitId) -> bool {
        self.marks.contains_key(&id)
    }

    /// Included units in key order.
    pub fn unit_ids(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.marks.keys().copied()
    }

    pub fn run_mode(&self, id: UnitId) -> Option<RunMode> {
        self.marks.get(&id).map(|m| m.mode)
    }

    pub fn inclusion(&self, id: UnitId) -> Option<Inclusion> {
        self.marks.get(&id).map(|m| m.inclusion)
    }

    /// Units added purely by downstream expansion.
    pub fn downstream_ids(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.marks
            .iter()
            .filter(|(_, m)| matches!(m.inclusion, Inclusion::Downstream { .. }))
            .map(|(&id, _)| id)
    }

    /// Direct producers of `id` that are also in the subgraph.
    pub fn producers_of(&self, id: UnitId) -> impl Iterator<Item = UnitId> + '_ {
        self.graph.producers_of(id).filter(move |p| self.contains(*p))
    }

    /// Edges between included units, producer-major in key order.
    pub fn edges(&self) -> impl Iterator<Item = (UnitId, UnitId)> + '_ {
        self.marks.keys().flat_map(move |&producer| {
            self.graph
                .consumers_of(producer)
                .filter(move |c| self.contains(*c))
                .map(move |c| (producer, c))
        })
    }
}

/// Result of [`resolve`]: the subgraph plus any truncation notice.
#[derive(Debug, Clone)]
pub struct Resolution<'g> {
    pub subgraph: SubBuildGraph<'g>,
    pub truncation: Option<TruncationWarning>,
}

/// Compute the bounded induced subgraph for `changes`.
pub fn resolve<'g>(graph: &'g BuildGraph, changes: &ChangeSet, bounds: ImpactBounds) -> Resolution<'g> {
    let mut marks: BTreeMap<UnitId, Mark> = BTreeMap::new();

    let seed_mode = if bounds.test_only {
        RunMode::TestOnly
    } else {
        RunMode::BuildAndTest
    };
    for recipe in changes.iter() {
        let mut found = false;
        for id in graph.units_for_recipe(recipe) {
            found = true;
            marks.insert(
                id,
                Mark {
                    mode: seed_mode,
                    inclusion: Inclusion::Seed,
                },
            );
        }
        if !found {
            warn!(recipe = %recipe, "Changed recipe rendered no build units");
        }
    }
    let seeds: BTreeSet<UnitId> = marks.keys().copied().collect();

    let truncation = expand_downstream(graph, &seeds, bounds, &mut marks);
    let ancestors = close_upstream(graph, &mut marks);

    let downstream = marks
        .values()
        .filter(|m| matches!(m.inclusion, Inclusion::Downstream { .. }))
        .count();
    info!(
        seeds = seeds.len(),
        downstream,
        upstream = ancestors,
        total = marks.len(),
        "Resolved change impact"
    );

    Resolution {
        subgraph: SubBuildGraph { graph, marks },
        truncation,
    }
}

/// Breadth-first forward expansion; candidates of one hop are taken in key
/// order so a cap always keeps the smallest keys.
fn expand_downstream(
    graph: &BuildGraph,
    seeds: &BTreeSet<UnitId>,
    bounds: ImpactBounds,
    marks: &mut BTreeMap<UnitId, Mark>,
) -> Option<TruncationWarning> {
    let mut frontier = seeds.clone();
    let mut hops: i64 = 0;
    let mut added = 0usize;

    while !frontier.is_empty() && bounds.hop_allowed(hops) {
        let hop = (hops + 1) as u32;
        let candidates: BTreeSet<UnitId> = frontier
            .iter()
            .flat_map(|&id| graph.consumers_of(id))
            .filter(|id| !marks.contains_key(id))
            .collect();

        let mut next = BTreeSet::new();
        for (pos, &id) in candidates.iter().enumerate() {
            if bounds.cap_reached(added) {
                let omitted: Vec<String> = candidates
                    .iter()
                    .skip(pos)
                    .map(|&c| graph.unit(c).key.to_string())
                    .collect();
                let warning = TruncationWarning {
                    max_downstream: bounds.max_downstream,
                    hop,
                    omitted,
                };
                warn!(%warning, "Downstream expansion truncated");
                return Some(warning);
            }
            debug!(unit = %graph.unit(id).key, hop, "Adding downstream unit");
            marks.insert(
                id,
                Mark {
                    mode: RunMode::BuildAndTest,
                    inclusion: Inclusion::Downstream { hop },
                },
            );
            added += 1;
            next.insert(id);
        }

        frontier = next;
        hops += 1;
    }
    None
}

/// Add every unmarked ancestor of a marked unit as build-and-test.
///
/// Iterative worklist; returns the number of units added.
fn close_upstream(graph: &BuildGraph, marks: &mut BTreeMap<UnitId, Mark>) -> usize {
    let mut worklist: Vec<UnitId> = marks.keys().rev().copied().collect();
    let mut added = 0;

    while let Some(id) = worklist.pop() {
        for producer in graph.producers_of(id) {
            if marks.contains_key(&producer) {
                continue;
            }
            debug!(unit = %graph.unit(producer).key, "Adding upstream unit");
            marks.insert(
                producer,
                Mark {
                    mode: RunMode::BuildAndTest,
                    inclusion: Inclusion::Upstream,
                },
            );
            added += 1;
            worklist.push(producer);
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::StaticRenderer;
    use crate::unit::{MatrixRow, ResolvedDescription};

    fn pkg(name: &str, build: &[&str]) -> ResolvedDescription {
        let mut desc = ResolvedDescription::new(name, "1.0", "h0_0", "linux-64");
        desc.requirements.build = build.iter().map(|s| s.to_string()).collect();
        desc
    }

    fn graph_of(pkgs: Vec<ResolvedDescription>) -> BuildGraph {
        let mut renderer = StaticRenderer::new();
        for desc in pkgs {
            renderer.insert(desc.name.clone(), desc);
        }
        BuildGraph::construct(
            &renderer.recipes(),
            &[MatrixRow::new("linux", "linux-64")],
            &renderer,
        )
        .unwrap()
    }

    fn bounds(steps: i64, max_downstream: i64) -> ImpactBounds {
        ImpactBounds {
            steps,
            max_downstream,
            test_only: false,
        }
    }

    fn names(sub: &SubBuildGraph<'_>) -> Vec<String> {
        sub.unit_ids()
            .map(|id| sub.graph().unit(id).key.name.clone())
            .collect()
    }

    /// base → mid → top, plus side which needs base.
    fn chain() -> BuildGraph {
        graph_of(vec![
            pkg("base", &[]),
            pkg("mid", &["base"]),
            pkg("top", &["mid"]),
            pkg("side", &["base"]),
        ])
    }

    #[test]
    fn test_zero_steps_yields_seeds_and_ancestors() {
        let graph = chain();
        let res = resolve(&graph, &ChangeSet::from_folders(["mid"]), bounds(0, -1));
        assert_eq!(names(&res.subgraph), vec!["base", "mid"]);
        assert!(res.truncation.is_none());

        let base = graph.units_for_recipe("base").next().unwrap();
        assert_eq!(res.subgraph.inclusion(base), Some(Inclusion::Upstream));
        assert_eq!(res.subgraph.run_mode(base), Some(RunMode::BuildAndTest));
    }

    #[test]
    fn test_one_step_adds_direct_consumers_only() {
        let graph = chain();
        let res = resolve(&graph, &ChangeSet::from_folders(["base"]), bounds(1, -1));
        assert_eq!(names(&res.subgraph), vec!["base", "mid", "side"]);
    }

    #[test]
    fn test_unbounded_steps_reach_full_closure() {
        let graph = chain();
        let res = resolve(&graph, &ChangeSet::from_folders(["base"]), bounds(-1, -1));
        assert_eq!(names(&res.subgraph), vec!["base", "mid", "side", "top"]);
        let top = graph.units_for_recipe("top").next().unwrap();
        assert_eq!(res.subgraph.inclusion(top), Some(Inclusion::Downstream { hop: 2 }));
    }

    #[test]
    fn test_two_steps_stop_after_second_hop() {
        // a → b → c → d → e
        let graph = graph_of(vec![
            pkg("a", &[]),
            pkg("b", &["a"]),
            pkg("c", &["b"]),
            pkg("d", &["c"]),
            pkg("e", &["d"]),
        ]);
        let res = resolve(&graph, &ChangeSet::from_folders(["a"]), bounds(2, -1));
        assert_eq!(names(&res.subgraph), vec!["a", "b", "c"]);
        assert!(res.truncation.is_none());

        let hop_of = |name: &str| {
            let id = graph.units_for_recipe(name).next().unwrap();
            res.subgraph.inclusion(id)
        };
        assert_eq!(hop_of("a"), Some(Inclusion::Seed));
        assert_eq!(hop_of("b"), Some(Inclusion::Downstream { hop: 1 }));
        assert_eq!(hop_of("c"), Some(Inclusion::Downstream { hop: 2 }));
        assert_eq!(hop_of("d"), None);
        assert_eq!(hop_of("e"), None);

        let res = resolve(&graph, &ChangeSet::from_folders(["b"]), bounds(3, -1));
        assert_eq!(names(&res.subgraph), vec!["a", "b", "c", "d", "e"]);
        let a = graph.units_for_recipe("a").next().unwrap();
        assert_eq!(res.subgraph.inclusion(a), Some(Inclusion::Upstream));
    }

    #[test]
    fn test_bounds_below_minus_one_are_rejected() {
        assert!(bounds(-1, -1).validate().is_ok());
        assert!(bounds(0, 0).validate().is_ok());

        let err = bounds(-2, 5).validate().unwrap_err();
        assert!(matches!(err, PlanError::InvalidBound { field: "steps", value: -2 }));
        let err = bounds(1, -7).validate().unwrap_err();
        assert!(matches!(
            err,
            PlanError::InvalidBound {
                field: "max_downstream",
                value: -7
            }
        ));
    }

    #[test]
    fn test_cap_keeps_smallest_keys_and_warns() {
        let graph = graph_of(vec![
            pkg("s", &[]),
            pkg("d3", &["s"]),
            pkg("d1", &["s"]),
            pkg("d2", &["s"]),
        ]);
        let res = resolve(&graph, &ChangeSet::from_folders(["s"]), bounds(1, 1));
        assert_eq!(names(&res.subgraph), vec!["d1", "s"]);

        let warning = res.truncation.expect("truncation expected");
        assert_eq!(warning.max_downstream, 1);
        assert_eq!(warning.hop, 1);
        assert_eq!(
            warning.omitted,
            vec!["d2-1.0-h0_0-linux-64", "d3-1.0-h0_0-linux-64"]
        );
    }

    #[test]
    fn test_cap_of_zero_adds_no_downstream() {
        let graph = chain();
        let res = resolve(&graph, &ChangeSet::from_folders(["base"]), bounds(-1, 0));
        assert_eq!(names(&res.subgraph), vec!["base"]);
        assert!(res.truncation.is_some());
    }

    #[test]
    fn test_cap_not_hit_means_no_warning() {
        let graph = chain();
        let res = resolve(&graph, &ChangeSet::from_folders(["base"]), bounds(-1, 3));
        assert_eq!(res.subgraph.downstream_ids().count(), 3);
        assert!(res.truncation.is_none());
    }

    #[test]
    fn test_downstream_ancestors_are_pulled_in() {
        // other → top, so expanding into top must bring other along.
        let graph = graph_of(vec![
            pkg("base", &[]),
            pkg("other", &[]),
            pkg("top", &["base", "other"]),
        ]);
        let res = resolve(&graph, &ChangeSet::from_folders(["base"]), bounds(1, -1));
        assert_eq!(names(&res.subgraph), vec!["base", "other", "top"]);
        let other = graph.units_for_recipe("other").next().unwrap();
        assert_eq!(res.subgraph.inclusion(other), Some(Inclusion::Upstream));
    }

    #[test]
    fn test_test_only_applies_to_seeds_alone() {
        let graph = chain();
        let changes = ChangeSet::from_folders(["mid"]);
        let res = resolve(
            &graph,
            &changes,
            ImpactBounds {
                steps: 1,
                max_downstream: -1,
                test_only: true,
            },
        );
        let sub = &res.subgraph;
        for id in sub.unit_ids() {
            let expected = match sub.graph().unit(id).key.name.as_str() {
                "mid" => RunMode::TestOnly,
                _ => RunMode::BuildAndTest,
            };
            assert_eq!(sub.run_mode(id), Some(expected));
        }
        assert_eq!(names(sub), vec!["base", "mid", "top"]);
    }

    #[test]
    fn test_edges_are_restricted_to_included_units() {
        let graph = chain();
        let res = resolve(&graph, &ChangeSet::from_folders(["mid"]), bounds(0, -1));
        let edges: Vec<(String, String)> = res
            .subgraph
            .edges()
            .map(|(p, c)| {
                (
                    graph.unit(p).key.name.clone(),
                    graph.unit(c).key.name.clone(),
                )
            })
            .collect();
        assert_eq!(edges, vec![("base".to_string(), "mid".to_string())]);
    }

    #[test]
    fn test_unknown_recipe_in_change_set_is_ignored() {
        let graph = chain();
        let res = resolve(&graph, &ChangeSet::from_folders(["nope"]), bounds(-1, -1));
        assert!(res.subgraph.is_empty());
    }
}
