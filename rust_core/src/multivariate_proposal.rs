use std::collections::HashMap;

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::{Array1, Array2};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution as _, StandardNormal};

use crate::error::{McmcError, Result};
use crate::graph::{Graph, VertexId};
use crate::proposal::{Proposal, ProposalDistribution};
use crate::tensor::{self, Tensor};

const SYMMETRY_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, Copy)]
struct Block {
    offset: usize,
    len: usize,
}

/// Correlated random walk over the concatenated, flattened values of a fixed
/// set of latents.
///
/// The covariance is indexed in the order the vertices were registered. When a
/// step only moves some of them, the sub-matrix for those vertices is used, with
/// the vertices taken in topological order.
#[derive(Debug, Clone)]
pub struct MultivariateGaussianProposalDistribution {
    blocks: HashMap<VertexId, Block>,
    covariance: Array2<f64>,
}

impl MultivariateGaussianProposalDistribution {
    /// `layout` lists each vertex with its element count.
    pub fn new(layout: &[(VertexId, usize)], covariance: Array2<f64>) -> Result<Self> {
        let mut blocks = HashMap::with_capacity(layout.len());
        let mut offset = 0;
        for &(id, len) in layout {
            if len == 0 {
                return Err(McmcError::InvalidConfig(format!("vertex {} has no elements", id)));
            }
            if blocks.insert(id, Block { offset, len }).is_some() {
                return Err(McmcError::InvalidConfig(format!("vertex {} listed twice", id)));
            }
            offset += len;
        }

        let (rows, cols) = covariance.dim();
        if rows != cols || rows != offset {
            return Err(McmcError::InvalidConfig(format!(
                "covariance is {}x{}, vertices have {} elements in total",
                rows, cols, offset
            )));
        }
        for i in 0..rows {
            for j in 0..i {
                let (a, b) = (covariance[[i, j]], covariance[[j, i]]);
                if (a - b).abs() > SYMMETRY_TOLERANCE * a.abs().max(b.abs()).max(1.0) {
                    return Err(McmcError::InvalidConfig(format!(
                        "covariance is not symmetric at ({}, {})",
                        i, j
                    )));
                }
            }
        }
        let dense = DMatrix::from_fn(rows, cols, |i, j| covariance[[i, j]]);
        if Cholesky::new(dense).is_none() {
            return Err(McmcError::InvalidConfig(
                "covariance is not positive definite".into(),
            ));
        }

        Ok(Self { blocks, covariance })
    }

    /// Independent elements: a diagonal covariance of squared sigmas. Each sigma
    /// tensor must have the shape of its vertex.
    pub fn from_sigmas(sigmas: &[(VertexId, Tensor)]) -> Result<Self> {
        let layout: Vec<(VertexId, usize)> = sigmas.iter().map(|(id, s)| (*id, s.len())).collect();
        let variances: Vec<f64> = sigmas
            .iter()
            .flat_map(|(_, s)| s.iter().map(|&x| x * x))
            .collect();
        Self::new(&layout, Array2::from_diag(&Array1::from(variances)))
    }

    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    /// Cholesky factor of the covariance restricted to `ordered`.
    fn sub_cholesky(&self, ordered: &[VertexId]) -> Result<Cholesky<f64, Dyn>> {
        let mut indices = Vec::new();
        for id in ordered {
            let block = self.block(*id)?;
            indices.extend(block.offset..block.offset + block.len);
        }
        let n = indices.len();
        let sub = DMatrix::from_fn(n, n, |i, j| self.covariance[[indices[i], indices[j]]]);
        Cholesky::new(sub).ok_or_else(|| {
            McmcError::InvalidConfig("covariance block is not positive definite".into())
        })
    }

    fn block(&self, id: VertexId) -> Result<Block> {
        self.blocks.get(&id).copied().ok_or_else(|| {
            McmcError::UnsupportedProposal(format!(
                "vertex {} has no entry in the proposal covariance",
                id
            ))
        })
    }

    fn log_density_of_step(&self, graph: &Graph, proposal: &Proposal, forward: bool) -> Result<f64> {
        let ordered = graph.topological_sort(&proposal.vertices())?;
        let mut delta = Vec::new();
        for id in &ordered {
            if let Some(change) = proposal.change(*id) {
                let (x, mu) = if forward {
                    (&change.to, &change.from)
                } else {
                    (&change.from, &change.to)
                };
                delta.extend(x.iter().zip(mu.iter()).map(|(x, mu)| x - mu));
            }
        }
        let chol = self.sub_cholesky(&ordered)?;
        log_density(&DVector::from_vec(delta), &chol)
    }
}

impl ProposalDistribution for MultivariateGaussianProposalDistribution {
    fn get_proposal(
        &self,
        graph: &mut Graph,
        vertices: &[VertexId],
        rng: &mut ChaCha8Rng,
    ) -> Result<Proposal> {
        let ordered = graph.topological_sort(vertices)?;
        let chol = self.sub_cholesky(&ordered)?;

        let n = chol.l_dirty().nrows();
        let z: DVector<f64> = DVector::from_fn(n, |_, _| StandardNormal.sample(rng));
        let step = chol.l() * z;

        let mut proposal = Proposal::new();
        let mut offset = 0;
        for id in ordered {
            let current = graph.value(id)?;
            let shape = current.shape().to_vec();
            let len = current.len();
            let moved: Vec<f64> = current
                .iter()
                .zip(step.iter().skip(offset))
                .map(|(x, dx)| x + dx)
                .collect();
            offset += len;
            proposal.set_proposal(graph, id, tensor::from_vec(&shape, moved)?)?;
        }
        Ok(proposal)
    }

    fn log_prob_at_to_given_from(&self, graph: &mut Graph, proposal: &Proposal) -> Result<f64> {
        self.log_density_of_step(graph, proposal, true)
    }

    fn log_prob_at_from_given_to(&self, graph: &mut Graph, proposal: &Proposal) -> Result<f64> {
        self.log_density_of_step(graph, proposal, false)
    }

    fn check_supported(&self, graph: &Graph, vertices: &[VertexId]) -> Result<()> {
        for &id in vertices {
            let vertex = graph.vertex(id)?;
            let block = self.block(id)?;
            if block.len != tensor::element_count(vertex.shape()) {
                return Err(McmcError::UnsupportedProposal(format!(
                    "vertex {} has {} elements, the covariance expects {}",
                    id,
                    tensor::element_count(vertex.shape()),
                    block.len
                )));
            }
            let continuous = graph
                .distribution_of(id)
                .map(|d| d.is_continuous())
                .unwrap_or(false);
            if !continuous {
                return Err(McmcError::UnsupportedProposal(format!(
                    "multivariate Gaussian proposal needs a continuous probabilistic vertex, {} is not",
                    id
                )));
            }
        }
        Ok(())
    }
}

/// Log-density of `delta` under N(0, L Lᵀ).
fn log_density(delta: &DVector<f64>, chol: &Cholesky<f64, Dyn>) -> Result<f64> {
    let l = chol.l();
    let solved = l.solve_lower_triangular(delta).ok_or_else(|| {
        McmcError::InvalidConfig("covariance factor is singular".into())
    })?;
    let log_det: f64 = l.diagonal().iter().map(|d| 2.0 * d.ln()).sum();
    let n = delta.len() as f64;
    Ok(-0.5 * (n * std::f64::consts::TAU.ln() + log_det + solved.norm_squared()))
}
