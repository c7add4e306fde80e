use crate::graph::VertexId;

/// Chooses which latent vertices a Metropolis-Hastings step perturbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VariableSelector {
    /// One latent per step, round-robin over `step % latents.len()`.
    #[default]
    Single,
    /// Every latent on every step.
    Full,
}

impl VariableSelector {
    pub fn select(&self, latents: &[VertexId], step: usize) -> Vec<VertexId> {
        match self {
            VariableSelector::Full => latents.to_vec(),
            VariableSelector::Single => {
                if latents.is_empty() {
                    Vec::new()
                } else {
                    vec![latents[step % latents.len()]]
                }
            }
        }
    }
}
