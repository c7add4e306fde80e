//! Forward- and reverse-mode differentiation over the vertex graph.
//!
//! Derivatives flow through deterministic vertices only. Probabilistic and
//! constant vertices are leaves: a random variable's value does not depend
//! differentiably on its parameters.

use std::collections::HashMap;

use crate::error::{McmcError, Result};
use crate::graph::{Graph, VertexId, VertexKind};
use crate::tensor::{self, Tensor};

/// A value paired with its tangent along the seeded direction.
#[derive(Debug, Clone)]
pub struct DualNumber {
    pub value: Tensor,
    pub tangent: Tensor,
}

/// Derivatives keyed by the vertex they are taken with respect to.
#[derive(Debug, Clone, Default)]
pub struct Derivatives {
    by_vertex: HashMap<VertexId, Tensor>,
}

impl Derivatives {
    pub fn wrt(&self, id: VertexId) -> Option<&Tensor> {
        self.by_vertex.get(&id)
    }

    pub fn len(&self) -> usize {
        self.by_vertex.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_vertex.is_empty()
    }

    pub fn into_map(self) -> HashMap<VertexId, Tensor> {
        self.by_vertex
    }

    fn accumulate(&mut self, id: VertexId, grad: Tensor) {
        self.by_vertex
            .entry(id)
            .and_modify(|existing| *existing += &grad)
            .or_insert(grad);
    }
}

/// Push tangents from `seeds` through every downstream deterministic vertex.
///
/// Returns the tangent of each vertex the seeds reach.
pub fn forward_tangents(graph: &mut Graph, seeds: &[(VertexId, Tensor)]) -> Result<Derivatives> {
    graph.refresh_all();

    let mut tangents = Derivatives::default();
    for (id, seed) in seeds {
        let shape = graph.vertex(*id)?.shape();
        if seed.shape() != shape {
            return Err(McmcError::ShapeMismatch(format!(
                "seed for vertex {} has shape {:?}, vertex has shape {:?}",
                id,
                seed.shape(),
                shape
            )));
        }
        tangents.accumulate(*id, seed.clone());
    }

    let start = seeds
        .iter()
        .map(|(id, _)| graph.topo_rank(*id))
        .min()
        .unwrap_or(graph.len());

    for &id in &graph.topological_order()[start..] {
        if tangents.wrt(id).is_some() {
            continue;
        }
        let vertex = graph.vertex(id)?;
        let VertexKind::Deterministic(op) = vertex.kind() else {
            continue;
        };

        let parent_tangents: Vec<Option<&Tensor>> =
            vertex.parents().iter().map(|p| tangents.wrt(*p)).collect();
        if parent_tangents.iter().all(Option::is_none) {
            continue;
        }

        let inputs = graph.parent_values(id);
        if let Some(tangent) = op.forward_diff(&inputs, vertex.cached_value(), &parent_tangents) {
            let tangent = tensor::broadcast_to(&tangent, vertex.shape())?;
            tangents.accumulate(id, tangent);
        }
    }

    Ok(tangents)
}

/// Directional derivative of `of` along the seeded input tangents.
pub fn forward_mode(graph: &mut Graph, seeds: &[(VertexId, Tensor)], of: VertexId) -> Result<DualNumber> {
    let tangents = forward_tangents(graph, seeds)?;
    let vertex = graph.vertex(of)?;
    let tangent = tangents
        .wrt(of)
        .cloned()
        .unwrap_or_else(|| tensor::filled(vertex.shape(), 0.0));

    Ok(DualNumber {
        value: vertex.cached_value().clone(),
        tangent,
    })
}

/// Adjoint of every vertex upstream of `of`, seeded with ones in `of`'s shape.
///
/// For a scalar output this is the gradient; otherwise it is the gradient
/// of the sum of the output's elements.
pub fn reverse_mode(graph: &mut Graph, of: VertexId) -> Result<Derivatives> {
    graph.refresh_all();

    let mut adjoints = Derivatives::default();
    let shape = graph.vertex(of)?.shape().to_vec();
    adjoints.accumulate(of, tensor::filled(&shape, 1.0));

    backpropagate(graph, &mut adjoints, graph.topo_rank(of))?;
    Ok(adjoints)
}

/// Gradient of the joint log-probability with respect to each vertex in `wrt`.
pub fn log_prob_gradient(graph: &mut Graph, wrt: &[VertexId]) -> Result<Derivatives> {
    graph.refresh_all();

    let mut adjoints = Derivatives::default();
    for index in 0..graph.len() {
        let id = VertexId(index);
        let vertex = graph.vertex(id)?;
        let VertexKind::Probabilistic(dist) = vertex.kind() else {
            continue;
        };

        let grad = dist.dlog_prob(vertex.cached_value(), &graph.parent_values(id))?;
        let parents = vertex.parents().to_vec();
        adjoints.accumulate(id, grad.wrt_value);
        for (parent, partial) in parents.into_iter().zip(grad.wrt_params) {
            adjoints.accumulate(parent, partial);
        }
    }

    let last = graph.len().saturating_sub(1);
    backpropagate(graph, &mut adjoints, last)?;

    let mut gradient = Derivatives::default();
    for &id in wrt {
        let shape = graph.vertex(id)?.shape();
        let grad = adjoints
            .wrt(id)
            .cloned()
            .unwrap_or_else(|| tensor::filled(shape, 0.0));
        gradient.accumulate(id, grad);
    }
    Ok(gradient)
}

/// Reverse sweep from topological rank `from_rank` down to the roots.
/// A vertex consumed by several children receives the sum of their adjoints.
fn backpropagate(graph: &Graph, adjoints: &mut Derivatives, from_rank: usize) -> Result<()> {
    let order = graph.topological_order();
    if order.is_empty() {
        return Ok(());
    }

    for &id in order[..=from_rank].iter().rev() {
        let Some(adjoint) = adjoints.wrt(id).cloned() else {
            continue;
        };
        let vertex = graph.vertex(id)?;
        let VertexKind::Deterministic(op) = vertex.kind() else {
            continue;
        };

        let inputs = graph.parent_values(id);
        let partials = op.reverse_diff(&inputs, vertex.cached_value(), &adjoint);
        for (parent, partial) in vertex.parents().iter().zip(partials) {
            if let Some(partial) = partial {
                adjoints.accumulate(*parent, partial);
            }
        }
    }
    Ok(())
}

/// Central finite-difference estimate of d(sum of `of`)/d`wrt`, element by element.
///
/// `wrt` must be a vertex whose value can be set. Its value is restored exactly afterwards.
pub fn finite_difference(graph: &mut Graph, wrt: VertexId, of: VertexId, eps: f64) -> Result<Tensor> {
    let original = graph.value(wrt)?.clone();
    let mut estimate = tensor::filled(original.shape(), 0.0);

    for (index, slot) in estimate.iter_mut().enumerate() {
        graph.set_value(wrt, nudged(&original, index, eps)?)?;
        let f_plus = graph.value(of)?.sum();

        graph.set_value(wrt, nudged(&original, index, -eps)?)?;
        let f_minus = graph.value(of)?.sum();

        *slot = (f_plus - f_minus) / (2.0 * eps);
    }

    graph.set_value(wrt, original)?;
    Ok(estimate)
}

fn nudged(original: &Tensor, index: usize, delta: f64) -> Result<Tensor> {
    let mut moved = original.as_standard_layout().into_owned();
    let slot = moved
        .as_slice_mut()
        .and_then(|values| values.get_mut(index))
        .ok_or_else(|| McmcError::ShapeMismatch(format!("element {} out of range", index)))?;
    *slot += delta;
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Distribution;
    use crate::graph::GraphBuilder;
    use crate::ops::Op;
    use crate::tensor::{from_vec, scalar};
    use ndarray::IxDyn;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn at(t: &Tensor) -> f64 {
        t[IxDyn(&[])]
    }

    #[test]
    fn test_fan_in_adjoints_are_summed() {
        // y = x * x + x, dy/dx = 2x + 1
        let mut b = GraphBuilder::new();
        let x = b.scalar_constant(1.5);
        let sq = b.mul(x, x).unwrap();
        let y = b.add(sq, x).unwrap();
        let mut g = b.build(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();

        let grads = reverse_mode(&mut g, y).unwrap();
        assert!((at(grads.wrt(x).unwrap()) - 4.0).abs() < 1e-12);

        let dual = forward_mode(&mut g, &[(x, scalar(1.0))], y).unwrap();
        assert!((at(&dual.value) - 3.75).abs() < 1e-12);
        assert!((at(&dual.tangent) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_scalar_broadcast_adjoint_is_summed() {
        let mut b = GraphBuilder::new();
        let w = b.scalar_constant(0.5);
        let m = b.constant(from_vec(&[2, 2], vec![1.0, -2.0, 3.0, 4.0]).unwrap());
        let scaled = b.mul(w, m).unwrap();
        let mut g = b.build(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();

        let grads = reverse_mode(&mut g, scaled).unwrap();
        let dw = grads.wrt(w).unwrap();
        assert_eq!(dw.ndim(), 0);
        assert!((at(dw) - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_forward_tangent_broadcasts_into_child_shape() {
        let mut b = GraphBuilder::new();
        let w = b.scalar_constant(2.0);
        let m = b.constant(tensor::filled(&[3], 1.0));
        let sum = b.add(w, m).unwrap();
        let mut g = b.build(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();

        let dual = forward_mode(&mut g, &[(w, scalar(1.0))], sum).unwrap();
        assert_eq!(dual.tangent.shape(), &[3]);
        assert!(dual.tangent.iter().all(|&t| t == 1.0));
    }

    #[test]
    fn test_seed_shape_must_match() {
        let mut b = GraphBuilder::new();
        let w = b.scalar_constant(2.0);
        let e = b.deterministic(Op::Exp, &[w]).unwrap();
        let mut g = b.build(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        let err = forward_mode(&mut g, &[(w, tensor::filled(&[2], 1.0))], e);
        assert!(matches!(err, Err(McmcError::ShapeMismatch(_))));
    }

    #[test]
    fn test_log_prob_gradient_through_deterministic_mean() {
        // a ~ N(0, 1), c ~ N(2a, 1): d/da = -a + 2(c - 2a)
        let mut b = GraphBuilder::new();
        let zero = b.scalar_constant(0.0);
        let one = b.scalar_constant(1.0);
        let two = b.scalar_constant(2.0);
        let a = b.probabilistic(Distribution::Gaussian, &[zero, one], &[]).unwrap();
        let mean = b.mul(two, a).unwrap();
        let c = b.probabilistic(Distribution::Gaussian, &[mean, one], &[]).unwrap();
        b.set_initial_value(a, scalar(0.3)).unwrap();
        b.set_initial_value(c, scalar(1.0)).unwrap();
        let mut g = b.build(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();

        let grads = log_prob_gradient(&mut g, &[a, c]).unwrap();
        let expected_a = -0.3 + 2.0 * (1.0 - 0.6);
        let expected_c = -(1.0 - 0.6);
        assert!((at(grads.wrt(a).unwrap()) - expected_a).abs() < 1e-12);
        assert!((at(grads.wrt(c).unwrap()) - expected_c).abs() < 1e-12);
    }

    #[test]
    fn test_finite_difference_restores_value() {
        let mut b = GraphBuilder::new();
        let x = b.constant(from_vec(&[2], vec![0.1, 0.2]).unwrap());
        let y = b.deterministic(Op::Sin, &[x]).unwrap();
        let mut g = b.build(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();

        let before = g.value(x).unwrap().clone();
        let fd = finite_difference(&mut g, x, y, 1e-6).unwrap();
        assert_eq!(g.value(x).unwrap(), &before);
        let fd: Vec<f64> = fd.iter().copied().collect();
        assert!((fd[0] - 0.1_f64.cos()).abs() < 1e-8);
        assert!((fd[1] - 0.2_f64.cos()).abs() < 1e-8);
    }
}
