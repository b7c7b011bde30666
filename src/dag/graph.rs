// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::cmd::RunnableTable;
use crate::deps::Resolver;
use crate::errors::{Error, Result};

/// Flags carried on a DAG edge, inherited from the declaring dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeInfo {
    /// Selection of the upstream pulls the downstream back in.
    pub strict: bool,
    /// `Some(false)`: always follow, even under `--isolated`.
    /// `Some(true)`: upstream failure does not fail the downstream.
    /// `None`: default behavior on both axes.
    pub isolated: Option<bool>,
}

impl EdgeInfo {
    /// Whether `--isolated` keeps this edge in the selection.
    pub fn survives_isolated(&self) -> bool {
        self.isolated == Some(false)
    }

    /// Whether a failed upstream fails the downstream over this edge.
    pub fn propagates_failure(&self) -> bool {
        self.isolated != Some(true)
    }

    /// Merge parallel edges between the same pair of nodes: strictness is
    /// sticky, and the strongest coupling wins (`false` > unset > `true`).
    fn merge(&mut self, other: EdgeInfo) {
        self.strict |= other.strict;
        self.isolated = match (self.isolated, other.isolated) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (None, _) | (_, None) => None,
            _ => Some(true),
        };
    }
}

/// The runnable dependency graph.
///
/// Nodes are runnable slugs; edges point from upstream (producer) to
/// downstream (consumer). Construction fails with [`Error::CycleDetected`]
/// enumerating one representative cycle.
#[derive(Debug, Clone, Default)]
pub struct DagGraph {
    /// Direct upstreams per node.
    ups: BTreeMap<String, BTreeMap<String, EdgeInfo>>,
    /// Direct downstreams per node.
    downs: BTreeMap<String, BTreeMap<String, EdgeInfo>>,
    /// Stable topological order, ties broken by slug.
    topo: Vec<String>,
    /// Transitive upstream closure per node.
    trans_ups: BTreeMap<String, BTreeSet<String>>,
}

impl DagGraph {
    /// Build the graph for every runnable in the table, with edges
    /// provided by the dependency resolver.
    pub fn build(table: &RunnableTable, resolver: &Resolver<'_>) -> Result<Self> {
        let mut ups: BTreeMap<String, BTreeMap<String, EdgeInfo>> = BTreeMap::new();
        let mut downs: BTreeMap<String, BTreeMap<String, EdgeInfo>> = BTreeMap::new();

        for runnable in table.iter() {
            ups.entry(runnable.slug.clone()).or_default();
            downs.entry(runnable.slug.clone()).or_default();
        }

        for runnable in table.iter() {
            for edge in resolver.edges(runnable) {
                let info = EdgeInfo {
                    strict: edge.strict,
                    isolated: edge.isolated,
                };

                ups.entry(runnable.slug.clone())
                    .or_default()
                    .entry(edge.upstream.clone())
                    .and_modify(|e| e.merge(info))
                    .or_insert(info);

                downs
                    .entry(edge.upstream.clone())
                    .or_default()
                    .entry(runnable.slug.clone())
                    .and_modify(|e| e.merge(info))
                    .or_insert(info);
            }
        }

        // Acyclicity check the cheap way first; only on failure do we walk
        // the graph again to produce a readable cycle path.
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for slug in ups.keys() {
            graph.add_node(slug.as_str());
        }
        for (slug, upstreams) in ups.iter() {
            for upstream in upstreams.keys() {
                graph.add_edge(upstream.as_str(), slug.as_str(), ());
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let path = extract_cycle(cycle.node_id(), &downs);
            return Err(Error::CycleDetected(path));
        }

        let topo = stable_topo(&ups, &downs);
        let trans_ups = transitive_upstreams(&topo, &ups);

        debug!(
            nodes = topo.len(),
            edges = downs.values().map(|d| d.len()).sum::<usize>(),
            "built runnable graph"
        );

        Ok(Self {
            ups,
            downs,
            topo,
            trans_ups,
        })
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.ups.contains_key(slug)
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.topo.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.topo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topo.is_empty()
    }

    /// Direct upstreams with edge flags.
    pub fn upstreams_of(&self, slug: &str) -> impl Iterator<Item = (&str, EdgeInfo)> {
        self.ups
            .get(slug)
            .into_iter()
            .flat_map(|edges| edges.iter().map(|(s, info)| (s.as_str(), *info)))
    }

    /// Direct downstreams with edge flags.
    pub fn downstreams_of(&self, slug: &str) -> impl Iterator<Item = (&str, EdgeInfo)> {
        self.downs
            .get(slug)
            .into_iter()
            .flat_map(|edges| edges.iter().map(|(s, info)| (s.as_str(), *info)))
    }

    /// Stable topological order (upstreams first), ties broken by slug.
    pub fn topo_order(&self) -> &[String] {
        &self.topo
    }

    /// Transitive upstream closure of a node.
    pub fn transitive_upstreams(&self, slug: &str) -> BTreeSet<String> {
        self.trans_ups.get(slug).cloned().unwrap_or_default()
    }
}

/// Kahn's algorithm with a lexicographic ready set.
fn stable_topo(
    ups: &BTreeMap<String, BTreeMap<String, EdgeInfo>>,
    downs: &BTreeMap<String, BTreeMap<String, EdgeInfo>>,
) -> Vec<String> {
    let mut in_degree: BTreeMap<&str, usize> = ups
        .iter()
        .map(|(slug, upstreams)| (slug.as_str(), upstreams.len()))
        .collect();

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(s, _)| *s)
        .collect();

    let mut topo = Vec::with_capacity(ups.len());

    while let Some(slug) = ready.iter().next().copied() {
        ready.remove(slug);
        topo.push(slug.to_string());

        if let Some(dependents) = downs.get(slug) {
            for dependent in dependents.keys() {
                let degree = in_degree.get_mut(dependent.as_str()).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent.as_str());
                }
            }
        }
    }

    topo
}

/// Propagate upstream closures along the topological order.
fn transitive_upstreams(
    topo: &[String],
    ups: &BTreeMap<String, BTreeMap<String, EdgeInfo>>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut closures: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for slug in topo {
        let mut closure = BTreeSet::new();
        if let Some(upstreams) = ups.get(slug) {
            for upstream in upstreams.keys() {
                closure.insert(upstream.clone());
                if let Some(upstream_closure) = closures.get(upstream) {
                    closure.extend(upstream_closure.iter().cloned());
                }
            }
        }
        closures.insert(slug.clone(), closure);
    }

    closures
}

/// Walk downstream edges from a node known to sit on a cycle using an
/// iterative three-color DFS, returning the cycle as a path ending where
/// it started.
fn extract_cycle(
    start: &str,
    downs: &BTreeMap<String, BTreeMap<String, EdgeInfo>>,
) -> Vec<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors: BTreeMap<&str, Color> =
        downs.keys().map(|s| (s.as_str(), Color::White)).collect();
    let mut path: Vec<&str> = Vec::new();
    // (node, next-child index) frames so the DFS is iterative.
    let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
    colors.insert(start, Color::Gray);
    path.push(start);

    while let Some((node, child_idx)) = stack.pop() {
        let children: Vec<&str> = downs
            .get(node)
            .map(|d| d.keys().map(|s| s.as_str()).collect())
            .unwrap_or_default();

        if child_idx < children.len() {
            stack.push((node, child_idx + 1));
            let child = children[child_idx];

            match colors.get(child).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    // Found the back edge; the cycle is the path suffix
                    // starting at `child`.
                    let from = path.iter().position(|n| *n == child).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[from..].iter().map(|s| s.to_string()).collect();
                    cycle.push(child.to_string());
                    return cycle;
                }
                Color::White => {
                    colors.insert(child, Color::Gray);
                    path.push(child);
                    stack.push((child, 0));
                }
                Color::Black => {}
            }
        } else {
            colors.insert(node, Color::Black);
            path.pop();
        }
    }

    // toposort said there is a cycle reachable from `start`; if the walk
    // above failed to reproduce it, report the node alone.
    vec![start.to_string(), start.to_string()]
}
