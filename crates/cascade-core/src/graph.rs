//! Build graph construction and topological ordering.
//!
//! Units live in an arena sorted by [`UnitKey`], so a [`UnitId`] is both an
//! index and a rank: comparing ids compares keys. An edge `P → C` means "C
//! requires a package that P provides"; P must complete before C may run.
//!
//! Edges are stored as index sets on both sides, which keeps subgraph
//! extraction down to copying id sets.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use tracing::{debug, info};

use crate::error::{PlanError, PlanResult};
use crate::render::RecipeRenderer;
use crate::unit::{BuildUnit, MatrixRow, UnitKey};

/// Position of a unit in the graph arena.
pub type UnitId = usize;

/// Directed acyclic graph of build units for one repository snapshot.
#[derive(Debug, Clone, Default)]
pub struct BuildGraph {
    units: Vec<BuildUnit>,
    by_key: HashMap<UnitKey, UnitId>,
    /// `producer → {consumer, ...}`
    downstream: Vec<BTreeSet<UnitId>>,
    /// `consumer → {producer, ...}`
    upstream: Vec<BTreeSet<UnitId>>,
    /// Producers before consumers, ties by key.
    order: Vec<UnitId>,
}

impl BuildGraph {
    /// Render every recipe against every matrix row and wire the results.
    ///
    /// Recipes and rows are visited in sorted order. Fails with
    /// [`PlanError::DuplicateKey`] when two renders yield the same key and
    /// with [`PlanError::DependencyCycle`] when the wired graph has a cycle.
    pub fn construct<R>(recipes: &[String], matrix: &[MatrixRow], renderer: &R) -> PlanResult<Self>
    where
        R: RecipeRenderer + ?Sized,
    {
        let mut recipes: Vec<&String> = recipes.iter().collect();
        recipes.sort();
        recipes.dedup();
        let mut rows: Vec<&MatrixRow> = matrix.iter().collect();
        rows.sort_by(|a, b| a.label.cmp(&b.label));

        let mut rendered: BTreeMap<UnitKey, BuildUnit> = BTreeMap::new();
        for recipe in recipes {
            for row in &rows {
                for desc in renderer.render(recipe, row)? {
                    let unit = BuildUnit::from_description(recipe, row, desc);
                    if let Some(existing) = rendered.get(&unit.key) {
                        return Err(PlanError::DuplicateKey {
                            key: unit.key.to_string(),
                            first: origin(existing),
                            second: origin(&unit),
                        });
                    }
                    debug!(unit = %unit.key, recipe = %recipe, row = %row.label, "Rendered build unit");
                    rendered.insert(unit.key.clone(), unit);
                }
            }
        }

        Self::from_units(rendered.into_values().collect())
    }

    /// Wire already-rendered units into a graph.
    pub fn from_units(mut units: Vec<BuildUnit>) -> PlanResult<Self> {
        units.sort_by(|a, b| a.key.cmp(&b.key));
        for pair in units.windows(2) {
            if pair[0].key == pair[1].key {
                return Err(PlanError::DuplicateKey {
                    key: pair[0].key.to_string(),
                    first: origin(&pair[0]),
                    second: origin(&pair[1]),
                });
            }
        }

        let by_key: HashMap<UnitKey, UnitId> = units
            .iter()
            .enumerate()
            .map(|(id, unit)| (unit.key.clone(), id))
            .collect();

        // package name → producing units
        let mut producers: BTreeMap<&str, Vec<UnitId>> = BTreeMap::new();
        for (id, unit) in units.iter().enumerate() {
            for name in &unit.provides {
                producers.entry(name.as_str()).or_default().push(id);
            }
        }

        let mut downstream = vec![BTreeSet::new(); units.len()];
        let mut upstream = vec![BTreeSet::new(); units.len()];
        for (consumer, unit) in units.iter().enumerate() {
            for name in unit.requirements.names() {
                // No in-graph producer: satisfied by an already published package.
                let Some(candidates) = producers.get(name.as_str()) else {
                    continue;
                };
                for &producer in candidates {
                    if producer == consumer || !units[producer].can_serve(unit) {
                        continue;
                    }
                    downstream[producer].insert(consumer);
                    upstream[consumer].insert(producer);
                }
            }
        }

        let mut graph = Self {
            units,
            by_key,
            downstream,
            upstream,
            order: Vec::new(),
        };
        graph.order = graph.compute_order()?;

        info!(
            units = graph.len(),
            edges = graph.edge_count(),
            "Constructed build graph"
        );
        Ok(graph)
    }

    /// Kahn's algorithm with a min-heap so ready units leave in key order.
    fn compute_order(&self) -> PlanResult<Vec<UnitId>> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(BTreeSet::len).collect();
        let mut ready: BinaryHeap<Reverse<UnitId>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| Reverse(id))
            .collect();

        let mut sorted = Vec::with_capacity(self.units.len());
        while let Some(Reverse(id)) = ready.pop() {
            sorted.push(id);
            for &consumer in &self.downstream[id] {
                in_degree[consumer] -= 1;
                if in_degree[consumer] == 0 {
                    ready.push(Reverse(consumer));
                }
            }
        }

        if sorted.len() != self.units.len() {
            return Err(PlanError::DependencyCycle {
                units: self.find_cycle(&in_degree),
            });
        }
        Ok(sorted)
    }

    /// Extract one concrete cycle among the units Kahn could not release.
    ///
    /// Every unreleased unit still has an unreleased producer, so walking
    /// producers from any of them must revisit a unit.
    fn find_cycle(&self, in_degree: &[usize]) -> Vec<String> {
        let stuck = |id: &UnitId| in_degree[*id] > 0;
        let Some(start) = (0..self.units.len()).find(stuck) else {
            return Vec::new();
        };

        let mut seen: HashMap<UnitId, usize> = HashMap::new();
        let mut path: Vec<UnitId> = Vec::new();
        let mut current = start;
        let mut cycle: Vec<UnitId> = loop {
            if let Some(&pos) = seen.get(&current) {
                break path[pos..].to_vec();
            }
            seen.insert(current, path.len());
            path.push(current);
            match self.upstream[current].iter().copied().find(|id| stuck(id)) {
                Some(next) => current = next,
                None => break path.clone(),
            }
        };

        // Walked consumer → producer; report producer → consumer from the
        // smallest key, closing the loop.
        cycle.reverse();
        if let Some(min_pos) = cycle.iter().enumerate().min_by_key(|(_, id)| **id).map(|(p, _)| p) {
            cycle.rotate_left(min_pos);
        }
        if let Some(&first) = cycle.first() {
            cycle.push(first);
        }
        cycle
            .into_iter()
            .map(|id| self.units[id].key.to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit(&self, id: UnitId) -> &BuildUnit {
        &self.units[id]
    }

    /// All units in key order.
    pub fn units(&self) -> &[BuildUnit] {
        &self.units
    }

    pub fn find(&self, key: &UnitKey) -> Option<UnitId> {
        self.by_key.get(key).copied()
    }

    /// Direct producers of `id`, in key order.
    pub fn producers_of(&self, id: UnitId) -> impl Iterator<Item = UnitId> + '_ {
        self.upstream[id].iter().copied()
    }

    /// Direct consumers of `id`, in key order.
    pub fn consumers_of(&self, id: UnitId) -> impl Iterator<Item = UnitId> + '_ {
        self.downstream[id].iter().copied()
    }

    /// All edges as `(producer, consumer)`, producer-major in key order.
    pub fn edges(&self) -> impl Iterator<Item = (UnitId, UnitId)> + '_ {
        self.downstream
            .iter()
            .enumerate()
            .flat_map(|(producer, consumers)| consumers.iter().map(move |&c| (producer, c)))
    }

    pub fn edge_count(&self) -> usize {
        self.downstream.iter().map(BTreeSet::len).sum()
    }

    /// Units in dependency order (producers first, ties by key).
    pub fn topological_order(&self) -> &[UnitId] {
        &self.order
    }

    /// Units rendered from `recipe`, in key order.
    pub fn units_for_recipe<'a>(&'a self, recipe: &'a str) -> impl Iterator<Item = UnitId> + 'a {
        self.units
            .iter()
            .enumerate()
            .filter(move |(_, unit)| unit.recipe == recipe)
            .map(|(id, _)| id)
    }
}

fn origin(unit: &BuildUnit) -> String {
    format!("{}@{}", unit.recipe, unit.matrix_row.label)
}
