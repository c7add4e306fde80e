//! Error types for graph construction, differentiation and sampling.

use crate::graph::VertexId;
use thiserror::Error;

/// Errors raised while building a graph, configuring a sampler or running a chain.
///
/// A joint log-probability of negative infinity is not an error: the sampler
/// treats it as an ordinary rejection. A NaN log-probability is always fatal.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum McmcError {
    /// The parent relation contains a cycle.
    #[error("structural error: cycle detected through vertex {0}")]
    Cycle(VertexId),

    /// A proxy vertex was never given its real parent before the graph was frozen.
    #[error("structural error: proxy vertex {0} was never resolved")]
    UnresolvedProxy(VertexId),

    /// A vertex id that does not belong to this graph.
    #[error("structural error: vertex {0} is not part of the graph")]
    UnknownVertex(VertexId),

    /// Operand or value shapes that cannot be broadcast together.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// An operation applied to a vertex kind that does not support it.
    #[error("invalid vertex operation: {0}")]
    InvalidVertex(String),

    /// The joint log-probability evaluated to NaN.
    #[error("numerical error: log probability is NaN at step {step}")]
    NaNLogProb { step: usize },

    /// A proposal distribution cannot parametrize one of the vertices it was given.
    #[error("unsupported proposal: {0}")]
    UnsupportedProposal(String),

    /// Sampler, sample-store or proposal parameters out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Acceptance rate requested for a vertex subset that was never proposed.
    #[error("no proposals have been registered for {0:?}")]
    NoProposalsRegistered(Vec<VertexId>),

    /// The network cannot be sampled from its current state.
    #[error("degenerate network: {0}")]
    DegenerateNetwork(String),
}

pub type Result<T> = std::result::Result<T, McmcError>;
