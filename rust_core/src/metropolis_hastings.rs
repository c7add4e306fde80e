use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace, warn};

use crate::error::{McmcError, Result};
use crate::graph::{Graph, VertexId};
use crate::listener::{ProposalEvent, ProposalListener, ProposalNotifier};
use crate::proposal::{PriorProposalDistribution, ProposalDistribution};
use crate::samples::NetworkState;
use crate::selector::VariableSelector;

/// Metropolis-Hastings configuration: how to propose and what to perturb.
#[derive(Clone)]
pub struct MetropolisHastings {
    pub proposal_distribution: Arc<dyn ProposalDistribution>,
    pub variable_selector: VariableSelector,
}

impl Default for MetropolisHastings {
    fn default() -> Self {
        Self {
            proposal_distribution: Arc::new(PriorProposalDistribution),
            variable_selector: VariableSelector::Single,
        }
    }
}

impl fmt::Debug for MetropolisHastings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetropolisHastings")
            .field("proposal_distribution", &self.proposal_distribution)
            .field("variable_selector", &self.variable_selector)
            .finish()
    }
}

impl MetropolisHastings {
    pub fn new(
        proposal_distribution: impl ProposalDistribution + 'static,
        variable_selector: VariableSelector,
    ) -> Self {
        Self {
            proposal_distribution: Arc::new(proposal_distribution),
            variable_selector,
        }
    }

    /// Set up a chain on `graph`, recording `sample_from` at every sample.
    /// An empty `sample_from` records every latent vertex.
    pub fn sampler<'g>(
        &self,
        graph: &'g mut Graph,
        sample_from: &[VertexId],
        rng: ChaCha8Rng,
    ) -> Result<MetropolisHastingsSampler<'g>> {
        MetropolisHastingsSampler::new(self, graph, sample_from, rng)
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepResult {
    pub accepted: bool,
    /// Joint log-probability of the graph after the step settled.
    pub log_prob: f64,
}

/// A single propose / evaluate / accept-or-reject transition.
///
/// The log-probability change of a move is computed over the union of the
/// chosen vertices' downstream sections, cached per latent at construction.
#[derive(Debug)]
pub struct MetropolisHastingsStep {
    proposal_distribution: Arc<dyn ProposalDistribution>,
    sections: HashMap<VertexId, Vec<VertexId>>,
}

impl MetropolisHastingsStep {
    pub fn new(
        graph: &Graph,
        latents: &[VertexId],
        proposal_distribution: Arc<dyn ProposalDistribution>,
    ) -> Result<Self> {
        proposal_distribution.check_supported(graph, latents)?;
        let mut sections = HashMap::with_capacity(latents.len());
        for &id in latents {
            sections.insert(id, graph.downstream_section(id)?);
        }
        Ok(Self {
            proposal_distribution,
            sections,
        })
    }

    fn affected(&self, graph: &Graph, chosen: &[VertexId]) -> Result<Vec<VertexId>> {
        let mut union = Vec::new();
        for &id in chosen {
            match self.sections.get(&id) {
                Some(section) => union.extend_from_slice(section),
                None => union.extend(graph.downstream_section(id)?),
            }
        }
        graph.topological_sort(&union)
    }

    /// Propose a move of `chosen` and keep or undo it.
    ///
    /// `log_prob_before` is the joint log-probability of the current state and
    /// `temperature` scales the target (1.0 for plain sampling). From a
    /// zero-probability state the first move to a finite one is kept. On a NaN
    /// the proposal is undone before the error is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &self,
        graph: &mut Graph,
        chosen: &[VertexId],
        log_prob_before: f64,
        temperature: f64,
        step_index: usize,
        rng: &mut ChaCha8Rng,
        notifier: &mut ProposalNotifier,
    ) -> Result<StepResult> {
        let section = self.affected(graph, chosen)?;
        let section_before = graph.log_prob_of(&section)?;

        let proposal = self.proposal_distribution.get_proposal(graph, chosen, rng)?;
        notifier.notify(&ProposalEvent::Created(&proposal));
        let log_q_forward = self
            .proposal_distribution
            .log_prob_at_to_given_from(graph, &proposal)?;

        proposal.apply(graph)?;

        let section_after = graph.log_prob_of(&section)?;
        let log_prob_after = if section_before.is_finite() {
            log_prob_before + (section_after - section_before)
        } else {
            graph.log_prob()?
        };

        if log_prob_after.is_nan() || section_after.is_nan() {
            proposal.reject(graph)?;
            warn!(step = step_index, ?chosen, "log probability is NaN, halting");
            return Err(McmcError::NaNLogProb { step: step_index });
        }

        if log_prob_after == f64::NEG_INFINITY {
            proposal.reject(graph)?;
            notifier.notify(&ProposalEvent::Rejected(&proposal));
            trace!(step = step_index, ?chosen, "rejected impossible state");
            return Ok(StepResult {
                accepted: false,
                log_prob: log_prob_before,
            });
        }

        if log_prob_before == f64::NEG_INFINITY {
            notifier.notify(&ProposalEvent::Accepted(&proposal));
            debug!(step = step_index, ?chosen, log_prob = log_prob_after, "left impossible state");
            return Ok(StepResult {
                accepted: true,
                log_prob: log_prob_after,
            });
        }

        let log_q_reverse = self
            .proposal_distribution
            .log_prob_at_from_given_to(graph, &proposal)?;
        if log_q_forward.is_nan() || log_q_reverse.is_nan() {
            proposal.reject(graph)?;
            warn!(step = step_index, ?chosen, "proposal density is NaN, halting");
            return Err(McmcError::NaNLogProb { step: step_index });
        }

        // Opposite infinities in the proposal terms leave the ratio undefined; such a move is rejected.
        let log_r = (log_prob_after - log_prob_before) / temperature + (log_q_reverse - log_q_forward);
        let accepted = !log_r.is_nan() && (log_r >= 0.0 || rng.gen::<f64>().ln() < log_r);
        trace!(step = step_index, ?chosen, log_r, accepted, "metropolis-hastings step");

        if accepted {
            notifier.notify(&ProposalEvent::Accepted(&proposal));
            Ok(StepResult {
                accepted,
                log_prob: log_prob_after,
            })
        } else {
            proposal.reject(graph)?;
            notifier.notify(&ProposalEvent::Rejected(&proposal));
            Ok(StepResult {
                accepted,
                log_prob: log_prob_before,
            })
        }
    }
}

/// One Metropolis-Hastings chain over a borrowed graph.
///
/// The chain owns its random source, so a fixed seed and step count always
/// reproduce the same decisions.
pub struct MetropolisHastingsSampler<'g> {
    graph: &'g mut Graph,
    latents: Vec<VertexId>,
    sample_from: Vec<VertexId>,
    step: MetropolisHastingsStep,
    selector: VariableSelector,
    rng: ChaCha8Rng,
    notifier: ProposalNotifier,
    log_prob: f64,
    steps_taken: usize,
    accepted: usize,
}

impl<'g> MetropolisHastingsSampler<'g> {
    fn new(
        algorithm: &MetropolisHastings,
        graph: &'g mut Graph,
        sample_from: &[VertexId],
        rng: ChaCha8Rng,
    ) -> Result<Self> {
        let latents = graph.latent_vertices();
        if latents.is_empty() {
            return Err(McmcError::DegenerateNetwork(
                "graph has no latent vertices to sample".into(),
            ));
        }

        let sample_from = if sample_from.is_empty() {
            latents.clone()
        } else {
            graph.topological_sort(sample_from)?
        };

        let step = MetropolisHastingsStep::new(
            graph,
            &latents,
            Arc::clone(&algorithm.proposal_distribution),
        )?;

        let log_prob = graph.log_prob()?;
        if log_prob.is_nan() {
            warn!("initial log probability is NaN");
            return Err(McmcError::NaNLogProb { step: 0 });
        }
        if log_prob == f64::NEG_INFINITY {
            warn!("starting from an impossible state, moves are accepted once one reaches a finite log probability");
        }

        debug!(
            latents = latents.len(),
            selector = ?algorithm.variable_selector,
            proposal = ?algorithm.proposal_distribution,
            log_prob,
            "metropolis-hastings sampler ready"
        );

        Ok(Self {
            graph,
            latents,
            sample_from,
            step,
            selector: algorithm.variable_selector,
            rng,
            notifier: ProposalNotifier::new(),
            log_prob,
            steps_taken: 0,
            accepted: 0,
        })
    }

    pub fn add_listener(&mut self, listener: ProposalListener) {
        self.notifier.add_listener(listener);
    }

    /// Advance the chain by one step without recording it.
    pub fn step(&mut self) -> Result<StepResult> {
        let chosen = self.selector.select(&self.latents, self.steps_taken);
        let result = self.step.step(
            self.graph,
            &chosen,
            self.log_prob,
            1.0,
            self.steps_taken,
            &mut self.rng,
            &mut self.notifier,
        )?;
        self.log_prob = result.log_prob;
        self.steps_taken += 1;
        if result.accepted {
            self.accepted += 1;
        }
        Ok(result)
    }

    /// Advance by one step and record the resulting state.
    pub fn sample(&mut self) -> Result<NetworkState> {
        self.step()?;
        self.current_state()
    }

    /// Current values of the recorded vertices.
    pub fn current_state(&mut self) -> Result<NetworkState> {
        let mut values = HashMap::with_capacity(self.sample_from.len());
        for &id in &self.sample_from {
            values.insert(id, self.graph.value(id)?.clone());
        }
        Ok(NetworkState::new(values, self.log_prob))
    }

    pub fn latent_vertices(&self) -> &[VertexId] {
        &self.latents
    }

    pub fn log_prob(&self) -> f64 {
        self.log_prob
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    /// Fraction of steps accepted so far, 0.0 before the first step.
    pub fn acceptance_rate(&self) -> f64 {
        if self.steps_taken == 0 {
            0.0
        } else {
            self.accepted as f64 / self.steps_taken as f64
        }
    }

    pub fn graph(&self) -> &Graph {
        &*self.graph
    }
}

impl fmt::Debug for MetropolisHastingsSampler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetropolisHastingsSampler")
            .field("latents", &self.latents)
            .field("selector", &self.selector)
            .field("log_prob", &self.log_prob)
            .field("steps_taken", &self.steps_taken)
            .field("accepted", &self.accepted)
            .finish()
    }
}
