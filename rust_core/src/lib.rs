pub mod annealing;
pub mod autodiff;
pub mod distributions;
pub mod error;
pub mod graph;
pub mod listener;
pub mod metropolis_hastings;
pub mod multivariate_proposal;
pub mod ops;
pub mod proposal;
pub mod sampler;
pub mod samples;
pub mod selector;
pub mod tensor;

pub use error::{McmcError, Result};
pub use graph::{Graph, GraphBuilder, VertexId};
pub use metropolis_hastings::{MetropolisHastings, MetropolisHastingsSampler};
pub use sampler::{sample_chains, SamplerConfig};
pub use samples::{NetworkSamples, NetworkState};

// Future: gradient-aware proposals (MALA, HMC) can be built on
// `autodiff::log_prob_gradient` as further `ProposalDistribution` impls.
