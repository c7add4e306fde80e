use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;

use rand_chacha::ChaCha8Rng;

use crate::distributions::Distribution;
use crate::error::{McmcError, Result};
use crate::ops::Op;
use crate::tensor::{self, Tensor};

/// Unique identifier for a vertex. Ids are handed out in creation order and
/// break ties when ordering vertices topologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(pub usize);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a vertex computes from its parents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VertexKind {
    Constant,
    Deterministic(Op),
    /// A random variable whose parents are its distribution parameters.
    Probabilistic(Distribution),
    /// Contributes nothing to the joint log-probability while every element
    /// of its single parent is non-zero, and negative infinity otherwise.
    Assertion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexState {
    Latent,
    Observed,
    /// Deterministic value that must be recomputed before it is read.
    Stale,
    /// Deterministic or constant value consistent with its parents.
    Fresh,
}

#[derive(Debug, Clone)]
pub struct Vertex {
    id: VertexId,
    kind: VertexKind,
    parents: Vec<VertexId>,
    children: Vec<VertexId>,
    shape: Vec<usize>,
    value: Tensor,
    observed: bool,
    stale: bool,
    label: Option<String>,
}

impl Vertex {
    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn kind(&self) -> VertexKind {
        self.kind
    }

    pub fn parents(&self) -> &[VertexId] {
        &self.parents
    }

    pub fn children(&self) -> &[VertexId] {
        &self.children
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Stored value. May lag behind the parents while the vertex is stale;
    /// use [`Graph::value`] for a consistent read.
    pub fn cached_value(&self) -> &Tensor {
        &self.value
    }

    pub fn is_probabilistic(&self) -> bool {
        matches!(self.kind, VertexKind::Probabilistic(_))
    }

    pub fn is_observed(&self) -> bool {
        self.observed
    }

    pub fn is_latent(&self) -> bool {
        self.is_probabilistic() && !self.observed
    }

    /// Vertices that contribute a term to the joint log-probability.
    pub fn has_log_prob(&self) -> bool {
        matches!(
            self.kind,
            VertexKind::Probabilistic(_) | VertexKind::Assertion
        )
    }

    pub fn state(&self) -> VertexState {
        match self.kind {
            VertexKind::Probabilistic(_) if self.observed => VertexState::Observed,
            VertexKind::Probabilistic(_) => VertexState::Latent,
            _ if self.stale => VertexState::Stale,
            _ => VertexState::Fresh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxySlot {
    NotProxy,
    Unresolved,
    Resolved,
}

#[derive(Debug, Clone)]
struct PendingVertex {
    kind: VertexKind,
    parents: Vec<VertexId>,
    shape: Vec<usize>,
    value: Option<Tensor>,
    observed: bool,
    proxy: ProxySlot,
    label: Option<String>,
}

/// First phase of graph construction.
///
/// Parents must exist before their children are created, with one
/// exception: a proxy vertex stands in for a parent that is created later
/// and is wired up with [`GraphBuilder::resolve_proxy`]. [`GraphBuilder::build`]
/// checks that every proxy is resolved and that no cycle was introduced,
/// then freezes the topology.
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    vertices: Vec<PendingVertex>,
    name_to_vertex: HashMap<String, VertexId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, vertex: PendingVertex) -> VertexId {
        let id = VertexId(self.vertices.len());
        self.vertices.push(vertex);
        id
    }

    fn pending(&self, id: VertexId) -> Result<&PendingVertex> {
        self.vertices.get(id.0).ok_or(McmcError::UnknownVertex(id))
    }

    fn pending_mut(&mut self, id: VertexId) -> Result<&mut PendingVertex> {
        self.vertices.get_mut(id.0).ok_or(McmcError::UnknownVertex(id))
    }

    fn shapes_of(&self, parents: &[VertexId]) -> Result<Vec<Vec<usize>>> {
        parents
            .iter()
            .map(|&p| self.pending(p).map(|v| v.shape.clone()))
            .collect()
    }

    pub fn constant(&mut self, value: Tensor) -> VertexId {
        self.push(PendingVertex {
            kind: VertexKind::Constant,
            parents: Vec::new(),
            shape: value.shape().to_vec(),
            value: Some(value),
            observed: false,
            proxy: ProxySlot::NotProxy,
            label: None,
        })
    }

    pub fn scalar_constant(&mut self, value: f64) -> VertexId {
        self.constant(tensor::scalar(value))
    }

    pub fn deterministic(&mut self, op: Op, parents: &[VertexId]) -> Result<VertexId> {
        let shapes = self.shapes_of(parents)?;
        let shape_refs: Vec<&[usize]> = shapes.iter().map(|s| s.as_slice()).collect();
        let shape = op.output_shape(&shape_refs)?;

        Ok(self.push(PendingVertex {
            kind: VertexKind::Deterministic(op),
            parents: parents.to_vec(),
            shape,
            value: None,
            observed: false,
            proxy: ProxySlot::NotProxy,
            label: None,
        }))
    }

    /// A random variable of `shape` whose parameters are the vertices `params`.
    pub fn probabilistic(
        &mut self,
        dist: Distribution,
        params: &[VertexId],
        shape: &[usize],
    ) -> Result<VertexId> {
        if params.len() != dist.param_count() {
            return Err(McmcError::InvalidVertex(format!(
                "{:?} takes parameters {:?}, got {} parent(s)",
                dist,
                dist.param_names(),
                params.len()
            )));
        }
        for (param_shape, name) in self.shapes_of(params)?.iter().zip(dist.param_names()) {
            if !tensor::broadcasts_to(param_shape, shape) {
                return Err(McmcError::ShapeMismatch(format!(
                    "parameter {} of shape {:?} cannot broadcast to {:?}",
                    name, param_shape, shape
                )));
            }
        }

        Ok(self.push(PendingVertex {
            kind: VertexKind::Probabilistic(dist),
            parents: params.to_vec(),
            shape: shape.to_vec(),
            value: None,
            observed: false,
            proxy: ProxySlot::NotProxy,
            label: None,
        }))
    }

    pub fn assertion(&mut self, condition: VertexId) -> Result<VertexId> {
        let shape = self.pending(condition)?.shape.clone();
        Ok(self.push(PendingVertex {
            kind: VertexKind::Assertion,
            parents: vec![condition],
            shape,
            value: None,
            observed: false,
            proxy: ProxySlot::NotProxy,
            label: None,
        }))
    }

    /// Placeholder for a parent that does not exist yet.
    pub fn proxy(&mut self, shape: &[usize]) -> VertexId {
        self.push(PendingVertex {
            kind: VertexKind::Deterministic(Op::Identity),
            parents: Vec::new(),
            shape: shape.to_vec(),
            value: None,
            observed: false,
            proxy: ProxySlot::Unresolved,
            label: None,
        })
    }

    pub fn resolve_proxy(&mut self, proxy: VertexId, target: VertexId) -> Result<()> {
        let target_shape = self.pending(target)?.shape.clone();
        let slot = self.pending_mut(proxy)?;

        match slot.proxy {
            ProxySlot::NotProxy => {
                return Err(McmcError::InvalidVertex(format!("vertex {} is not a proxy", proxy)))
            }
            ProxySlot::Resolved => {
                return Err(McmcError::InvalidVertex(format!(
                    "proxy {} is already resolved",
                    proxy
                )))
            }
            ProxySlot::Unresolved => {}
        }
        if slot.shape != target_shape {
            return Err(McmcError::ShapeMismatch(format!(
                "proxy {} has shape {:?} but target {} has shape {:?}",
                proxy, slot.shape, target, target_shape
            )));
        }

        slot.parents = vec![target];
        slot.proxy = ProxySlot::Resolved;
        Ok(())
    }

    pub fn observe(&mut self, id: VertexId, value: Tensor) -> Result<()> {
        let vertex = self.pending_mut(id)?;
        if !matches!(vertex.kind, VertexKind::Probabilistic(_)) {
            return Err(McmcError::InvalidVertex(format!(
                "only probabilistic vertices can be observed, {} is {:?}",
                id, vertex.kind
            )));
        }
        check_shape(id, &vertex.shape, &value)?;
        vertex.value = Some(value);
        vertex.observed = true;
        Ok(())
    }

    /// Starting value for a latent vertex; unset latents are drawn from their prior at build.
    pub fn set_initial_value(&mut self, id: VertexId, value: Tensor) -> Result<()> {
        let vertex = self.pending_mut(id)?;
        if !matches!(vertex.kind, VertexKind::Probabilistic(_)) {
            return Err(McmcError::InvalidVertex(format!(
                "initial values apply to probabilistic vertices, {} is {:?}",
                id, vertex.kind
            )));
        }
        check_shape(id, &vertex.shape, &value)?;
        vertex.value = Some(value);
        Ok(())
    }

    pub fn set_label(&mut self, id: VertexId, name: &str) -> Result<()> {
        self.pending_mut(id)?.label = Some(name.to_string());
        self.name_to_vertex.insert(name.to_string(), id);
        Ok(())
    }

    pub fn add(&mut self, a: VertexId, b: VertexId) -> Result<VertexId> {
        self.deterministic(Op::Add, &[a, b])
    }

    pub fn sub(&mut self, a: VertexId, b: VertexId) -> Result<VertexId> {
        self.deterministic(Op::Sub, &[a, b])
    }

    pub fn mul(&mut self, a: VertexId, b: VertexId) -> Result<VertexId> {
        self.deterministic(Op::Mul, &[a, b])
    }

    pub fn div(&mut self, a: VertexId, b: VertexId) -> Result<VertexId> {
        self.deterministic(Op::Div, &[a, b])
    }

    pub fn exp(&mut self, a: VertexId) -> Result<VertexId> {
        self.deterministic(Op::Exp, &[a])
    }

    pub fn log(&mut self, a: VertexId) -> Result<VertexId> {
        self.deterministic(Op::Log, &[a])
    }

    pub fn sum(&mut self, a: VertexId) -> Result<VertexId> {
        self.deterministic(Op::Sum, &[a])
    }

    pub fn greater_than(&mut self, a: VertexId, b: VertexId) -> Result<VertexId> {
        self.deterministic(Op::GreaterThan, &[a, b])
    }

    /// Freeze the topology, order it and compute every initial value.
    pub fn build(self, rng: &mut ChaCha8Rng) -> Result<Graph> {
        if let Some(index) = self
            .vertices
            .iter()
            .position(|v| v.proxy == ProxySlot::Unresolved)
        {
            return Err(McmcError::UnresolvedProxy(VertexId(index)));
        }

        let n = self.vertices.len();
        let mut children: Vec<Vec<VertexId>> = vec![Vec::new(); n];
        for (index, pending) in self.vertices.iter().enumerate() {
            for parent in &pending.parents {
                children[parent.0].push(VertexId(index));
            }
        }

        let topo_order = topological_order(&self.vertices, &children)?;
        let mut topo_rank = vec![0usize; n];
        for (rank, id) in topo_order.iter().enumerate() {
            topo_rank[id.0] = rank;
        }

        let vertices = self
            .vertices
            .into_iter()
            .zip(children)
            .enumerate()
            .map(|(index, (pending, children))| Vertex {
                id: VertexId(index),
                kind: pending.kind,
                stale: pending.value.is_none(),
                value: pending
                    .value
                    .unwrap_or_else(|| tensor::filled(&pending.shape, 0.0)),
                parents: pending.parents,
                children,
                shape: pending.shape,
                observed: pending.observed,
                label: pending.label,
            })
            .collect();

        let mut graph = Graph {
            vertices,
            topo_order,
            topo_rank,
            name_to_vertex: self.name_to_vertex,
        };
        graph.initialize(rng)?;
        Ok(graph)
    }
}

fn check_shape(id: VertexId, expected: &[usize], value: &Tensor) -> Result<()> {
    if value.shape() != expected {
        return Err(McmcError::ShapeMismatch(format!(
            "vertex {} has shape {:?}, value has shape {:?}",
            id,
            expected,
            value.shape()
        )));
    }
    Ok(())
}

/// Kahn's algorithm with the smallest ready id popped first.
fn topological_order(
    vertices: &[PendingVertex],
    children: &[Vec<VertexId>],
) -> Result<Vec<VertexId>> {
    let mut in_degree: Vec<usize> = vertices.iter().map(|v| v.parents.len()).collect();
    let mut ready: BinaryHeap<Reverse<VertexId>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(VertexId(i)))
        .collect();

    let mut order = Vec::with_capacity(vertices.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for child in &children[id.0] {
            in_degree[child.0] -= 1;
            if in_degree[child.0] == 0 {
                ready.push(Reverse(*child));
            }
        }
    }

    if order.len() < vertices.len() {
        let stuck = in_degree
            .iter()
            .position(|&d| d > 0)
            .map(VertexId)
            .unwrap_or(VertexId(0));
        return Err(McmcError::Cycle(stuck));
    }
    Ok(order)
}

/// A frozen probabilistic graph.
///
/// The graph owns every vertex; parents and children are stored as ids.
/// Topology never changes after [`GraphBuilder::build`]. Values do:
/// setting a probabilistic or constant value marks its deterministic
/// descendants stale, and reads recompute them lazily in topological order.
/// A graph is cloned, never shared, to run independent chains.
#[derive(Debug, Clone)]
pub struct Graph {
    vertices: Vec<Vertex>,
    topo_order: Vec<VertexId>,
    topo_rank: Vec<usize>,
    name_to_vertex: HashMap<String, VertexId>,
}

impl Graph {
    fn initialize(&mut self, rng: &mut ChaCha8Rng) -> Result<()> {
        for i in 0..self.topo_order.len() {
            let id = self.topo_order[i];
            let vertex = &self.vertices[id.0];
            match vertex.kind {
                VertexKind::Probabilistic(_) if vertex.stale => {
                    let drawn = self.sample(id, rng)?;
                    let vertex = &mut self.vertices[id.0];
                    vertex.value = drawn;
                    vertex.stale = false;
                }
                VertexKind::Deterministic(_) | VertexKind::Assertion => self.recompute(id),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertex(&self, id: VertexId) -> Result<&Vertex> {
        self.vertices.get(id.0).ok_or(McmcError::UnknownVertex(id))
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.iter()
    }

    pub fn vertex_by_label(&self, name: &str) -> Option<VertexId> {
        self.name_to_vertex.get(name).copied()
    }

    pub fn topological_order(&self) -> &[VertexId] {
        &self.topo_order
    }

    pub(crate) fn topo_rank(&self, id: VertexId) -> usize {
        self.topo_rank[id.0]
    }

    /// Deduplicate `ids` and order them parents-first, ties broken by id.
    pub fn topological_sort(&self, ids: &[VertexId]) -> Result<Vec<VertexId>> {
        let mut sorted = Vec::with_capacity(ids.len());
        let mut seen = HashSet::new();
        for &id in ids {
            self.vertex(id)?;
            if seen.insert(id) {
                sorted.push(id);
            }
        }
        sorted.sort_by_key(|id| self.topo_rank[id.0]);
        Ok(sorted)
    }

    /// Unobserved probabilistic vertices in topological order.
    pub fn latent_vertices(&self) -> Vec<VertexId> {
        self.topo_order
            .iter()
            .copied()
            .filter(|id| self.vertices[id.0].is_latent())
            .collect()
    }

    pub fn observed_vertices(&self) -> Vec<VertexId> {
        self.topo_order
            .iter()
            .copied()
            .filter(|id| self.vertices[id.0].is_observed())
            .collect()
    }

    /// True when nothing is left to infer.
    pub fn is_deterministic(&self) -> bool {
        !self.vertices.iter().any(Vertex::is_latent)
    }

    /// Consistent value of a vertex, recomputing stale ancestors first.
    pub fn value(&mut self, id: VertexId) -> Result<&Tensor> {
        self.vertex(id)?;
        self.refresh(id);
        Ok(&self.vertices[id.0].value)
    }

    /// Overwrite the value of a probabilistic or constant vertex.
    pub fn set_value(&mut self, id: VertexId, value: Tensor) -> Result<()> {
        let vertex = self.vertex(id)?;
        match vertex.kind {
            VertexKind::Probabilistic(_) | VertexKind::Constant => {}
            kind => {
                return Err(McmcError::InvalidVertex(format!(
                    "cannot set the value of {:?} vertex {}",
                    kind, id
                )))
            }
        }
        check_shape(id, &vertex.shape, &value)?;

        self.vertices[id.0].value = value;
        self.mark_descendants_stale(id);
        Ok(())
    }

    /// Turn a latent vertex into an observed one.
    pub fn observe(&mut self, id: VertexId, value: Tensor) -> Result<()> {
        if !self.vertex(id)?.is_probabilistic() {
            return Err(McmcError::InvalidVertex(format!(
                "only probabilistic vertices can be observed, {} is not",
                id
            )));
        }
        self.set_value(id, value)?;
        self.vertices[id.0].observed = true;
        Ok(())
    }

    /// Draw from the vertex's conditional distribution given the current
    /// parent values, without changing the graph's state.
    pub fn sample(&mut self, id: VertexId, rng: &mut ChaCha8Rng) -> Result<Tensor> {
        let dist = self.distribution_of(id)?;
        self.refresh_parents(id);

        let vertex = &self.vertices[id.0];
        let params = self.parent_values(id);
        dist.sample(&vertex.shape, &params, rng)
    }

    /// Log-density of `value` at vertex `id` given its current parent values.
    pub fn log_prob_at(&mut self, id: VertexId, value: &Tensor) -> Result<f64> {
        let dist = self.distribution_of(id)?;
        check_shape(id, &self.vertices[id.0].shape, value)?;
        self.refresh_parents(id);
        dist.log_prob(value, &self.parent_values(id))
    }

    /// Joint log-probability of every probabilistic and assertion vertex.
    pub fn log_prob(&mut self) -> Result<f64> {
        let ids: Vec<VertexId> = self
            .vertices
            .iter()
            .filter(|v| v.has_log_prob())
            .map(Vertex::id)
            .collect();
        self.log_prob_of(&ids)
    }

    /// Sum of the log-probability terms of `ids`. Vertices without a term contribute 0.
    pub fn log_prob_of(&mut self, ids: &[VertexId]) -> Result<f64> {
        let mut total = 0.0;
        for &id in ids {
            total += self.vertex_log_prob(id)?;
        }
        Ok(total)
    }

    fn vertex_log_prob(&mut self, id: VertexId) -> Result<f64> {
        let kind = self.vertex(id)?.kind;
        match kind {
            VertexKind::Probabilistic(dist) => {
                self.refresh_parents(id);
                dist.log_prob(&self.vertices[id.0].value, &self.parent_values(id))
            }
            VertexKind::Assertion => {
                self.refresh(id);
                let holds = self.vertices[id.0].value.iter().all(|&x| x != 0.0);
                Ok(if holds { 0.0 } else { f64::NEG_INFINITY })
            }
            _ => Ok(0.0),
        }
    }

    /// The vertex itself (when it has a log-probability term) plus every
    /// probabilistic or assertion vertex reached through deterministic-only
    /// paths: exactly the terms that change when its value changes.
    pub fn downstream_section(&self, id: VertexId) -> Result<Vec<VertexId>> {
        let root = self.vertex(id)?;
        let mut section = Vec::new();
        if root.has_log_prob() {
            section.push(id);
        }

        let mut visited = HashSet::new();
        let mut stack: Vec<VertexId> = root.children.clone();
        while let Some(next) = stack.pop() {
            if !visited.insert(next) {
                continue;
            }
            let vertex = &self.vertices[next.0];
            match vertex.kind {
                VertexKind::Probabilistic(_) => section.push(next),
                VertexKind::Assertion => {
                    section.push(next);
                    stack.extend(vertex.children.iter().copied());
                }
                _ => stack.extend(vertex.children.iter().copied()),
            }
        }

        self.topological_sort(&section)
    }

    pub(crate) fn distribution_of(&self, id: VertexId) -> Result<Distribution> {
        match self.vertex(id)?.kind {
            VertexKind::Probabilistic(dist) => Ok(dist),
            kind => Err(McmcError::InvalidVertex(format!(
                "vertex {} is {:?}, not probabilistic",
                id, kind
            ))),
        }
    }

    pub(crate) fn parent_values(&self, id: VertexId) -> Vec<&Tensor> {
        self.vertices[id.0]
            .parents
            .iter()
            .map(|p| &self.vertices[p.0].value)
            .collect()
    }

    fn mark_descendants_stale(&mut self, id: VertexId) {
        let mut stack: Vec<VertexId> = self.vertices[id.0].children.clone();
        while let Some(next) = stack.pop() {
            let vertex = &mut self.vertices[next.0];
            if vertex.is_probabilistic() || vertex.stale {
                continue;
            }
            vertex.stale = true;
            stack.extend(vertex.children.iter().copied());
        }
    }

    pub(crate) fn refresh_parents(&mut self, id: VertexId) {
        let parents = self.vertices[id.0].parents.clone();
        for parent in parents {
            self.refresh(parent);
        }
    }

    /// Recompute `id` and its stale ancestors, parents first.
    pub(crate) fn refresh(&mut self, id: VertexId) {
        if !self.vertices[id.0].stale {
            return;
        }

        let mut pending = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !visited.insert(next) {
                continue;
            }
            let vertex = &self.vertices[next.0];
            if vertex.stale {
                pending.push(next);
                stack.extend(vertex.parents.iter().copied());
            }
        }

        pending.sort_by_key(|v| self.topo_rank[v.0]);
        for next in pending {
            self.recompute(next);
        }
    }

    /// Make every stale vertex fresh.
    pub fn refresh_all(&mut self) {
        for i in 0..self.topo_order.len() {
            let id = self.topo_order[i];
            if self.vertices[id.0].stale {
                self.recompute(id);
            }
        }
    }

    /// Evaluate one vertex from parent values that are already fresh.
    fn recompute(&mut self, id: VertexId) {
        let value = {
            let inputs = self.parent_values(id);
            match self.vertices[id.0].kind {
                VertexKind::Deterministic(op) => op.evaluate(&inputs),
                VertexKind::Assertion => inputs[0].clone(),
                _ => return,
            }
        };
        let vertex = &mut self.vertices[id.0];
        vertex.value = value;
        vertex.stale = false;
    }
}
