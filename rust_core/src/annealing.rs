//! Maximum a posteriori search by simulated annealing.

use std::collections::HashMap;
use std::sync::Arc;

use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::error::{McmcError, Result};
use crate::graph::{Graph, VertexId};
use crate::listener::ProposalNotifier;
use crate::metropolis_hastings::MetropolisHastingsStep;
use crate::proposal::{PriorProposalDistribution, ProposalDistribution};
use crate::samples::NetworkState;
use crate::selector::VariableSelector;

/// Temperature as a function of the step index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnnealingSchedule {
    /// `T(n) = start * exp(n * rate)`.
    Exponential { start: f64, rate: f64 },
}

impl AnnealingSchedule {
    /// Decays from `start_t` at step 0 to `end_t` at step `iterations`.
    pub fn exponential(iterations: usize, start_t: f64, end_t: f64) -> Result<Self> {
        if iterations == 0 {
            return Err(McmcError::InvalidConfig(
                "annealing needs at least one iteration".into(),
            ));
        }
        if !(start_t.is_finite() && start_t > 0.0 && end_t.is_finite() && end_t > 0.0) {
            return Err(McmcError::InvalidConfig(format!(
                "temperatures must be positive and finite, got {} and {}",
                start_t, end_t
            )));
        }
        Ok(AnnealingSchedule::Exponential {
            start: start_t,
            rate: (end_t / start_t).ln() / iterations as f64,
        })
    }

    pub fn temperature(&self, step: usize) -> f64 {
        match *self {
            AnnealingSchedule::Exponential { start, rate } => start * (step as f64 * rate).exp(),
        }
    }
}

/// Tempered Metropolis-Hastings that keeps the most probable state it visits.
#[derive(Debug, Clone)]
pub struct SimulatedAnnealing {
    pub proposal_distribution: Arc<dyn ProposalDistribution>,
}

impl Default for SimulatedAnnealing {
    fn default() -> Self {
        Self {
            proposal_distribution: Arc::new(PriorProposalDistribution),
        }
    }
}

impl SimulatedAnnealing {
    pub fn new(proposal_distribution: impl ProposalDistribution + 'static) -> Self {
        Self {
            proposal_distribution: Arc::new(proposal_distribution),
        }
    }

    /// Anneal from temperature 2.0 down to 0.01 over `sample_count` steps.
    pub fn max_a_posteriori(
        &self,
        graph: &mut Graph,
        sample_count: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<NetworkState> {
        let schedule = AnnealingSchedule::exponential(sample_count, 2.0, 0.01)?;
        self.max_a_posteriori_with_schedule(graph, sample_count, schedule, rng)
    }

    /// The highest joint log-probability state of the latents seen over
    /// `sample_count` single-vertex steps. The graph is left in the chain's
    /// final state, not the returned one.
    pub fn max_a_posteriori_with_schedule(
        &self,
        graph: &mut Graph,
        sample_count: usize,
        schedule: AnnealingSchedule,
        rng: &mut ChaCha8Rng,
    ) -> Result<NetworkState> {
        let latents = graph.latent_vertices();
        if latents.is_empty() {
            return Err(McmcError::DegenerateNetwork(
                "graph has no latent vertices to optimize".into(),
            ));
        }
        let mut log_prob = graph.log_prob()?;
        if log_prob.is_nan() {
            return Err(McmcError::NaNLogProb { step: 0 });
        }
        if log_prob == f64::NEG_INFINITY {
            return Err(McmcError::DegenerateNetwork(
                "cannot start annealing from a zero-probability state".into(),
            ));
        }

        let step = MetropolisHastingsStep::new(graph, &latents, Arc::clone(&self.proposal_distribution))?;
        let mut notifier = ProposalNotifier::new();
        let mut best = snapshot(graph, &latents, log_prob)?;

        for n in 0..sample_count {
            let chosen = VariableSelector::Single.select(&latents, n);
            let result = step.step(
                graph,
                &chosen,
                log_prob,
                schedule.temperature(n),
                n,
                rng,
                &mut notifier,
            )?;
            log_prob = result.log_prob;
            if log_prob > best.log_prob() {
                best = snapshot(graph, &latents, log_prob)?;
            }
        }

        debug!(steps = sample_count, log_prob = best.log_prob(), "annealing finished");
        Ok(best)
    }
}

fn snapshot(graph: &mut Graph, latents: &[VertexId], log_prob: f64) -> Result<NetworkState> {
    let mut values = HashMap::with_capacity(latents.len());
    for &id in latents {
        values.insert(id, graph.value(id)?.clone());
    }
    Ok(NetworkState::new(values, log_prob))
}
