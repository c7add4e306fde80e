use std::collections::{BTreeMap, HashMap};
use std::fmt;

use ndarray::Zip;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution as _, StandardNormal};

use crate::distributions::normal_logp;
use crate::error::{McmcError, Result};
use crate::graph::{Graph, VertexId};
use crate::tensor::{self, Tensor};

/// Old and new value of one perturbed vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub from: Tensor,
    pub to: Tensor,
}

/// Candidate assignment for a subset of latent vertices, created fresh each step.
///
/// After [`Proposal::apply`] the graph holds `to` for exactly the proposed
/// vertices; [`Proposal::reject`] puts every `from` value back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proposal {
    changes: BTreeMap<VertexId, Change>,
}

impl Proposal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Propose `to` for a latent vertex, recording its current value as `from`.
    pub fn set_proposal(&mut self, graph: &mut Graph, id: VertexId, to: Tensor) -> Result<()> {
        let vertex = graph.vertex(id)?;
        if !vertex.is_latent() {
            return Err(McmcError::InvalidVertex(format!(
                "only latent vertices can be proposed, {} is not latent",
                id
            )));
        }
        if to.shape() != vertex.shape() {
            return Err(McmcError::ShapeMismatch(format!(
                "proposed value has shape {:?}, vertex {} has shape {:?}",
                to.shape(),
                id,
                vertex.shape()
            )));
        }
        let from = graph.value(id)?.clone();
        self.record(id, from, to);
        Ok(())
    }

    pub(crate) fn record(&mut self, id: VertexId, from: Tensor, to: Tensor) {
        self.changes.insert(id, Change { from, to });
    }

    /// The perturbed vertices in id order. This is the subset signature.
    pub fn vertices(&self) -> Vec<VertexId> {
        self.changes.keys().copied().collect()
    }

    pub fn change(&self, id: VertexId) -> Option<&Change> {
        self.changes.get(&id)
    }

    pub fn from(&self, id: VertexId) -> Option<&Tensor> {
        self.changes.get(&id).map(|c| &c.from)
    }

    pub fn to(&self, id: VertexId) -> Option<&Tensor> {
        self.changes.get(&id).map(|c| &c.to)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn apply(&self, graph: &mut Graph) -> Result<()> {
        for id in graph.topological_sort(&self.vertices())? {
            graph.set_value(id, self.changes[&id].to.clone())?;
        }
        Ok(())
    }

    pub fn reject(&self, graph: &mut Graph) -> Result<()> {
        for id in graph.topological_sort(&self.vertices())? {
            graph.set_value(id, self.changes[&id].from.clone())?;
        }
        Ok(())
    }
}

/// Generates proposals and scores them in both directions.
///
/// `log_prob_at_to_given_from` is evaluated while the graph still holds the
/// `from` state, `log_prob_at_from_given_to` after the proposal has been
/// applied, so implementations that condition on parent values see the
/// state their density is conditioned on.
pub trait ProposalDistribution: fmt::Debug + Send + Sync {
    fn get_proposal(
        &self,
        graph: &mut Graph,
        vertices: &[VertexId],
        rng: &mut ChaCha8Rng,
    ) -> Result<Proposal>;

    fn log_prob_at_to_given_from(&self, graph: &mut Graph, proposal: &Proposal) -> Result<f64>;

    fn log_prob_at_from_given_to(&self, graph: &mut Graph, proposal: &Proposal) -> Result<f64>;

    /// Fail with [`McmcError::UnsupportedProposal`] if any vertex cannot be proposed for.
    fn check_supported(&self, graph: &Graph, vertices: &[VertexId]) -> Result<()>;
}

/// Redraws each selected vertex from its own prior given the current parent values.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorProposalDistribution;

impl ProposalDistribution for PriorProposalDistribution {
    fn get_proposal(
        &self,
        graph: &mut Graph,
        vertices: &[VertexId],
        rng: &mut ChaCha8Rng,
    ) -> Result<Proposal> {
        let mut proposal = Proposal::new();
        for id in graph.topological_sort(vertices)? {
            let to = graph.sample(id, rng)?;
            proposal.set_proposal(graph, id, to)?;
        }
        Ok(proposal)
    }

    fn log_prob_at_to_given_from(&self, graph: &mut Graph, proposal: &Proposal) -> Result<f64> {
        let mut total = 0.0;
        for (id, change) in &proposal.changes {
            total += graph.log_prob_at(*id, &change.to)?;
        }
        Ok(total)
    }

    fn log_prob_at_from_given_to(&self, graph: &mut Graph, proposal: &Proposal) -> Result<f64> {
        let mut total = 0.0;
        for (id, change) in &proposal.changes {
            total += graph.log_prob_at(*id, &change.from)?;
        }
        Ok(total)
    }

    fn check_supported(&self, graph: &Graph, vertices: &[VertexId]) -> Result<()> {
        for &id in vertices {
            if !graph.vertex(id)?.is_probabilistic() {
                return Err(McmcError::UnsupportedProposal(format!(
                    "prior proposal needs a probabilistic vertex, {} is not",
                    id
                )));
            }
        }
        Ok(())
    }
}

/// How far a random walk steps.
#[derive(Debug, Clone)]
enum StepSize {
    Shared(f64),
    PerVertex(HashMap<VertexId, Tensor>),
}

/// Random walk: each element moves by an independent N(0, sigma) step.
///
/// Sigma is either one number for every vertex or a tensor per vertex that
/// broadcasts to that vertex's shape.
#[derive(Debug, Clone)]
pub struct GaussianProposalDistribution {
    step: StepSize,
}

impl GaussianProposalDistribution {
    pub fn new(sigma: f64) -> Result<Self> {
        check_sigma(sigma)?;
        Ok(Self {
            step: StepSize::Shared(sigma),
        })
    }

    /// Vertices missing from `sigmas` cannot be proposed.
    pub fn with_sigmas(sigmas: &[(VertexId, Tensor)]) -> Result<Self> {
        let mut by_vertex = HashMap::with_capacity(sigmas.len());
        for (id, sigma) in sigmas {
            for &s in sigma.iter() {
                check_sigma(s)?;
            }
            if by_vertex.insert(*id, sigma.clone()).is_some() {
                return Err(McmcError::InvalidConfig(format!(
                    "vertex {} has more than one sigma",
                    id
                )));
            }
        }
        Ok(Self {
            step: StepSize::PerVertex(by_vertex),
        })
    }

    /// Elementwise sigma for `id`, broadcast to `shape`.
    fn sigma_for(&self, id: VertexId, shape: &[usize]) -> Result<Tensor> {
        match &self.step {
            StepSize::Shared(sigma) => Ok(tensor::filled(shape, *sigma)),
            StepSize::PerVertex(by_vertex) => {
                let sigma = by_vertex.get(&id).ok_or_else(|| {
                    McmcError::UnsupportedProposal(format!(
                        "random-walk proposal has no sigma for vertex {}",
                        id
                    ))
                })?;
                tensor::broadcast_to(sigma, shape)
            }
        }
    }

    fn log_density(&self, id: VertexId, x: &Tensor, mu: &Tensor) -> Result<f64> {
        let sigma = self.sigma_for(id, x.shape())?;
        Ok(x.iter()
            .zip(mu.iter())
            .zip(sigma.iter())
            .map(|((&x, &mu), &s)| normal_logp(x, mu, s))
            .sum())
    }
}

fn check_sigma(sigma: f64) -> Result<()> {
    if sigma.is_finite() && sigma > 0.0 {
        Ok(())
    } else {
        Err(McmcError::InvalidConfig(format!(
            "random-walk sigma must be positive and finite, got {}",
            sigma
        )))
    }
}

impl ProposalDistribution for GaussianProposalDistribution {
    fn get_proposal(
        &self,
        graph: &mut Graph,
        vertices: &[VertexId],
        rng: &mut ChaCha8Rng,
    ) -> Result<Proposal> {
        let mut proposal = Proposal::new();
        for id in graph.topological_sort(vertices)? {
            let mut to = graph.value(id)?.clone();
            let sigma = self.sigma_for(id, to.shape())?;
            Zip::from(&mut to).and(&sigma).for_each(|x, &s| {
                let z: f64 = StandardNormal.sample(rng);
                *x += s * z;
            });
            proposal.set_proposal(graph, id, to)?;
        }
        Ok(proposal)
    }

    fn log_prob_at_to_given_from(&self, _graph: &mut Graph, proposal: &Proposal) -> Result<f64> {
        proposal
            .changes
            .iter()
            .map(|(id, c)| self.log_density(*id, &c.to, &c.from))
            .sum()
    }

    fn log_prob_at_from_given_to(&self, _graph: &mut Graph, proposal: &Proposal) -> Result<f64> {
        proposal
            .changes
            .iter()
            .map(|(id, c)| self.log_density(*id, &c.from, &c.to))
            .sum()
    }

    fn check_supported(&self, graph: &Graph, vertices: &[VertexId]) -> Result<()> {
        for &id in vertices {
            let shape = graph.vertex(id)?.shape();
            let dist = graph.distribution_of(id).map_err(|_| {
                McmcError::UnsupportedProposal(format!(
                    "random-walk proposal needs a probabilistic vertex, {} is not",
                    id
                ))
            })?;
            if !dist.is_continuous() {
                return Err(McmcError::UnsupportedProposal(format!(
                    "random-walk proposal cannot move discrete {:?} vertex {}",
                    dist, id
                )));
            }
            if let StepSize::PerVertex(by_vertex) = &self.step {
                let sigma = by_vertex.get(&id).ok_or_else(|| {
                    McmcError::UnsupportedProposal(format!(
                        "random-walk proposal has no sigma for vertex {}",
                        id
                    ))
                })?;
                if !tensor::broadcasts_to(sigma.shape(), shape) {
                    return Err(McmcError::UnsupportedProposal(format!(
                        "sigma of shape {:?} does not fit vertex {} of shape {:?}",
                        sigma.shape(),
                        id,
                        shape
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Distribution;
    use crate::graph::GraphBuilder;
    use crate::tensor::{filled, from_vec, scalar};
    use rand::SeedableRng;

    fn two_latents() -> (Graph, VertexId, VertexId) {
        let mut b = GraphBuilder::new();
        let zero = b.scalar_constant(0.0);
        let one = b.scalar_constant(1.0);
        let a = b.probabilistic(Distribution::Gaussian, &[zero, one], &[]).unwrap();
        let c = b.probabilistic(Distribution::Gaussian, &[a, one], &[2]).unwrap();
        b.set_initial_value(a, scalar(0.4)).unwrap();
        b.set_initial_value(c, from_vec(&[2], vec![0.1, -0.2]).unwrap()).unwrap();
        let g = b.build(&mut ChaCha8Rng::seed_from_u64(1)).unwrap();
        (g, a, c)
    }

    #[test]
    fn test_apply_then_reject_restores_exact_values() {
        let (mut g, a, c) = two_latents();
        let before_a = g.value(a).unwrap().clone();
        let before_c = g.value(c).unwrap().clone();

        let dist = GaussianProposalDistribution::new(0.5).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let proposal = dist.get_proposal(&mut g, &[c, a], &mut rng).unwrap();
        assert_eq!(proposal.vertices(), vec![a, c]);

        proposal.apply(&mut g).unwrap();
        assert_eq!(g.value(a).unwrap(), proposal.to(a).unwrap());
        assert_eq!(g.value(c).unwrap(), proposal.to(c).unwrap());

        proposal.reject(&mut g).unwrap();
        assert_eq!(g.value(a).unwrap(), &before_a);
        assert_eq!(g.value(c).unwrap(), &before_c);
    }

    #[test]
    fn test_gaussian_proposal_is_symmetric() {
        let (mut g, a, c) = two_latents();
        let dist = GaussianProposalDistribution::new(1.3).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let proposal = dist.get_proposal(&mut g, &[a, c], &mut rng).unwrap();

        let forward = dist.log_prob_at_to_given_from(&mut g, &proposal).unwrap();
        let reverse = dist.log_prob_at_from_given_to(&mut g, &proposal).unwrap();
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_prior_proposal_densities_use_vertex_log_prob() {
        let (mut g, a, _) = two_latents();
        let dist = PriorProposalDistribution;
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let proposal = dist.get_proposal(&mut g, &[a], &mut rng).unwrap();

        let forward = dist.log_prob_at_to_given_from(&mut g, &proposal).unwrap();
        let to = proposal.to(a).unwrap().sum();
        assert!((forward - normal_logp(to, 0.0, 1.0)).abs() < 1e-12);

        let reverse = dist.log_prob_at_from_given_to(&mut g, &proposal).unwrap();
        assert!((reverse - normal_logp(0.4, 0.0, 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_random_walk_refuses_discrete_vertices() {
        let mut b = GraphBuilder::new();
        let p = b.scalar_constant(0.5);
        let coin = b.probabilistic(Distribution::Bernoulli, &[p], &[]).unwrap();
        let g = b.build(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();

        let dist = GaussianProposalDistribution::new(1.0).unwrap();
        assert!(matches!(
            dist.check_supported(&g, &[coin]),
            Err(McmcError::UnsupportedProposal(_))
        ));
        assert!(matches!(
            dist.check_supported(&g, &[p]),
            Err(McmcError::UnsupportedProposal(_))
        ));
        assert!(PriorProposalDistribution.check_supported(&g, &[coin]).is_ok());
        assert!(GaussianProposalDistribution::new(0.0).is_err());
    }

    #[test]
    fn test_per_vertex_sigmas_scale_each_density() {
        let (mut g, a, c) = two_latents();
        let dist = GaussianProposalDistribution::with_sigmas(&[
            (a, scalar(0.2)),
            (c, from_vec(&[2], vec![1.0, 3.0]).unwrap()),
        ])
        .unwrap();
        assert!(dist.check_supported(&g, &[a, c]).is_ok());

        let mut rng = ChaCha8Rng::seed_from_u64(12);
        let proposal = dist.get_proposal(&mut g, &[a, c], &mut rng).unwrap();
        let forward = dist.log_prob_at_to_given_from(&mut g, &proposal).unwrap();

        let step_a = proposal.to(a).unwrap().sum() - 0.4;
        let to_c = proposal.to(c).unwrap();
        let expected = normal_logp(step_a, 0.0, 0.2)
            + normal_logp(to_c[[0]] - 0.1, 0.0, 1.0)
            + normal_logp(to_c[[1]] + 0.2, 0.0, 3.0);
        assert!((forward - expected).abs() < 1e-9);
    }

    #[test]
    fn test_vertex_without_sigma_is_unsupported() {
        let (g, a, c) = two_latents();
        let dist = GaussianProposalDistribution::with_sigmas(&[(a, scalar(0.5))]).unwrap();
        assert!(matches!(
            dist.check_supported(&g, &[a, c]),
            Err(McmcError::UnsupportedProposal(_))
        ));

        let wrong_shape =
            GaussianProposalDistribution::with_sigmas(&[(c, scalar(1.0)), (a, filled(&[3], 1.0))])
                .unwrap();
        assert!(matches!(
            wrong_shape.check_supported(&g, &[a]),
            Err(McmcError::UnsupportedProposal(_))
        ));
        assert!(wrong_shape.check_supported(&g, &[c]).is_ok());

        assert!(GaussianProposalDistribution::with_sigmas(&[(a, filled(&[2], -1.0))]).is_err());
        assert!(
            GaussianProposalDistribution::with_sigmas(&[(a, scalar(1.0)), (a, scalar(2.0))])
                .is_err()
        );
    }

    #[test]
    fn test_only_latent_vertices_can_be_proposed() {
        let mut b = GraphBuilder::new();
        let zero = b.scalar_constant(0.0);
        let one = b.scalar_constant(1.0);
        let x = b.probabilistic(Distribution::Gaussian, &[zero, one], &[]).unwrap();
        b.observe(x, scalar(0.2)).unwrap();
        let mut g = b.build(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();

        let mut proposal = Proposal::new();
        assert!(proposal.set_proposal(&mut g, x, scalar(1.0)).is_err());
        assert!(proposal.set_proposal(&mut g, zero, scalar(1.0)).is_err());
        assert!(proposal.is_empty());
    }
}
