//! Dependency graph construction and stage assignment.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::trace;

use super::{Edge, Node, Stage, Transition};
use crate::element::ElementModel;
use crate::error::PlanError;
use crate::opgen::{OpRegistry, Phase, StatementContext};
use crate::rules::{EdgeKind, RuleSet, StatusSel};

/// Reason recorded on edges between consecutive transitions of one element.
pub(super) const PATH_EDGE: &str = "status path";

/// Output of scheduling a model.
pub(super) struct Schedule {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub stages: Vec<Stage>,
    pub node_stage: Vec<usize>,
    pub point_of_no_return: Option<usize>,
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Keep the smaller id as root so roots are deterministic.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Kahn's algorithm over `0..n`, always releasing the smallest ready index.
///
/// On failure returns one cycle, in edge order, first element not repeated.
fn topo_order(n: usize, edges: &[(usize, usize)]) -> Result<Vec<usize>, Vec<usize>> {
    let mut succ: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for &(from, to) in edges {
        succ[from].insert(to);
        preds[to].insert(from);
    }
    let mut indegree: Vec<usize> = preds.iter().map(BTreeSet::len).collect();
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &s in &succ[next] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                ready.insert(s);
            }
        }
    }
    if order.len() == n {
        return Ok(order);
    }

    // Every unreleased vertex has an unreleased predecessor, so walking
    // predecessors from any of them must revisit a vertex.
    let remaining: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] > 0).collect();
    let mut path = Vec::new();
    let mut seen: HashMap<usize, usize> = HashMap::new();
    let mut current = remaining.first().copied().unwrap_or(0);
    loop {
        if let Some(&at) = seen.get(&current) {
            let mut cycle = path[at..].to_vec();
            cycle.reverse();
            return Err(cycle);
        }
        seen.insert(current, path.len());
        path.push(current);
        match preds[current].iter().find(|p| remaining.contains(p)) {
            Some(&p) => current = p,
            None => return Err(path),
        }
    }
}

fn describe_node(model: &ElementModel, node: &Node) -> String {
    format!("{} {}", model.element(node.element).key(), node.to)
}

fn cycle_error(model: &ElementModel, nodes: &[Node], cycle: &[usize]) -> PlanError {
    let mut chain: Vec<String> = cycle
        .iter()
        .map(|&n| describe_node(model, &nodes[n]))
        .collect();
    if let Some(first) = chain.first().cloned() {
        chain.push(first);
    }
    PlanError::CyclicDependency { chain }
}

pub(super) fn build(
    model: &ElementModel,
    rules: &RuleSet,
    registry: &OpRegistry,
    ctx: &StatementContext,
) -> Result<Schedule, PlanError> {
    // One node per transition, in model order then path order.
    let mut nodes: Vec<Node> = Vec::new();
    let mut element_nodes: Vec<Vec<usize>> = Vec::with_capacity(model.len());
    let mut edges: Vec<Edge> = Vec::new();
    for (element, entry) in model.entries().iter().enumerate() {
        let mut ids = Vec::new();
        for arc in registry.path(entry, ctx)? {
            let id = nodes.len();
            if let Some(&prev) = ids.last() {
                edges.push(Edge {
                    from: prev,
                    to: id,
                    kind: EdgeKind::Precedes,
                    reason: PATH_EDGE,
                });
            }
            nodes.push(Node {
                element,
                from: arc.from,
                to: arc.to,
                min_phase: arc.min_phase,
                revertible: arc.revertible,
                ops: arc.ops,
            });
            ids.push(id);
        }
        element_nodes.push(ids);
    }

    let resolve = |(element, sel): (usize, StatusSel)| -> Option<usize> {
        let ids = &element_nodes[element];
        match sel {
            StatusSel::First => ids.first().copied(),
            StatusSel::Final => ids.last().copied(),
            StatusSel::Is(status) => ids.iter().copied().find(|&n| nodes[n].to == status),
        }
    };
    for dep in rules.apply(model)? {
        let (Some(from), Some(to)) = (resolve(dep.from), resolve(dep.to)) else {
            continue;
        };
        if from == to {
            continue;
        }
        edges.push(Edge {
            from,
            to,
            kind: dep.kind,
            reason: dep.rule,
        });
    }

    // Co-scheduled nodes form groups; groups are numbered by smallest member.
    let mut uf = UnionFind::new(nodes.len());
    for edge in edges.iter().filter(|e| e.kind == EdgeKind::SameStage) {
        uf.union(edge.from, edge.to);
    }
    let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for n in 0..nodes.len() {
        let root = uf.find(n);
        by_root.entry(root).or_default().push(n);
    }
    let groups: Vec<Vec<usize>> = by_root.into_values().collect();
    let mut group_of = vec![0; nodes.len()];
    for (g, members) in groups.iter().enumerate() {
        for &n in members {
            group_of[n] = g;
        }
    }

    let mut group_edges = Vec::new();
    let mut inner_edges: Vec<Vec<(usize, usize)>> = vec![Vec::new(); groups.len()];
    for edge in edges.iter().filter(|e| e.kind == EdgeKind::Precedes) {
        let (gf, gt) = (group_of[edge.from], group_of[edge.to]);
        if gf == gt {
            inner_edges[gf].push((edge.from, edge.to));
        } else {
            group_edges.push((gf, gt));
        }
    }

    let order = topo_order(groups.len(), &group_edges).map_err(|cycle| {
        let representatives: Vec<usize> = cycle.iter().map(|&g| groups[g][0]).collect();
        cycle_error(model, &nodes, &representatives)
    })?;

    // Order members within each group by the edges between them.
    let mut ordered_groups: Vec<Vec<usize>> = Vec::with_capacity(groups.len());
    for (g, members) in groups.iter().enumerate() {
        let local: HashMap<usize, usize> =
            members.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        let local_edges: Vec<(usize, usize)> = inner_edges[g]
            .iter()
            .map(|(f, t)| (local[f], local[t]))
            .collect();
        let local_order = topo_order(members.len(), &local_edges).map_err(|cycle| {
            let cycle: Vec<usize> = cycle.iter().map(|&i| members[i]).collect();
            cycle_error(model, &nodes, &cycle)
        })?;
        ordered_groups.push(local_order.into_iter().map(|i| members[i]).collect());
    }

    // Phase and layer per group, in topological order.
    let mut group_preds: Vec<Vec<usize>> = vec![Vec::new(); groups.len()];
    for &(gf, gt) in &group_edges {
        group_preds[gt].push(gf);
    }
    let mut phase = vec![Phase::Statement; groups.len()];
    let mut layer = vec![0usize; groups.len()];
    for &g in &order {
        let own = groups[g]
            .iter()
            .map(|&n| nodes[n].min_phase)
            .max()
            .unwrap_or(Phase::Statement);
        let p = group_preds[g]
            .iter()
            .map(|&pred| phase[pred])
            .fold(own, Phase::max);
        phase[g] = p;
        if p.is_async() {
            layer[g] = group_preds[g]
                .iter()
                .filter(|&&pred| phase[pred] == p)
                .map(|&pred| layer[pred] + 1)
                .max()
                .unwrap_or(0);
        }
    }

    let mut buckets: BTreeMap<(Phase, usize), Vec<usize>> = BTreeMap::new();
    for &g in &order {
        buckets.entry((phase[g], layer[g])).or_default().push(g);
    }

    let mut stages = Vec::with_capacity(buckets.len());
    let mut node_stage = vec![0; nodes.len()];
    for (index, ((stage_phase, _), stage_groups)) in buckets.into_iter().enumerate() {
        let mut transitions = Vec::new();
        let mut ops = Vec::new();
        let mut revertible = true;
        for g in stage_groups {
            for &n in &ordered_groups[g] {
                let node = &nodes[n];
                node_stage[n] = index;
                revertible &= node.revertible;
                transitions.push(Transition {
                    element: node.element,
                    from: node.from,
                    to: node.to,
                });
                ops.extend(node.ops.iter().cloned());
            }
        }
        stages.push(Stage {
            index,
            phase: stage_phase,
            transitions,
            ops,
            revertible,
        });
    }

    let point_of_no_return = stages.iter().position(|s| !s.revertible);
    trace!(
        nodes = nodes.len(),
        edges = edges.len(),
        groups = groups.len(),
        stages = stages.len(),
        "scheduled dependency graph"
    );

    Ok(Schedule {
        nodes,
        edges,
        stages,
        node_stage,
        point_of_no_return,
    })
}
