use std::collections::HashMap;

use crate::error::{McmcError, Result};
use crate::graph::VertexId;
use crate::tensor::Tensor;

/// Values of a set of vertices at one point of a chain, plus the joint
/// log-probability of the whole graph at that point.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkState {
    values: HashMap<VertexId, Tensor>,
    log_prob: f64,
}

impl NetworkState {
    pub fn new(values: HashMap<VertexId, Tensor>, log_prob: f64) -> Self {
        Self { values, log_prob }
    }

    pub fn get(&self, id: VertexId) -> Option<&Tensor> {
        self.values.get(&id)
    }

    /// The vertex value as a scalar; `None` if absent or not single-element.
    pub fn scalar(&self, id: VertexId) -> Option<f64> {
        self.values
            .get(&id)
            .filter(|t| t.len() == 1)
            .and_then(|t| t.iter().next().copied())
    }

    pub fn vertices(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.values.keys().copied()
    }

    pub fn log_prob(&self) -> f64 {
        self.log_prob
    }
}

/// Ordered per-step samples, one entry per recorded step.
#[derive(Debug, Clone, Default)]
pub struct NetworkSamples {
    by_vertex: HashMap<VertexId, Vec<Tensor>>,
    log_probs: Vec<f64>,
}

impl NetworkSamples {
    /// Every state must carry the same vertices.
    pub fn from_states(states: Vec<NetworkState>) -> Result<Self> {
        let mut samples = Self::default();
        let Some(first) = states.first() else {
            return Ok(samples);
        };
        for id in first.vertices() {
            samples.by_vertex.insert(id, Vec::with_capacity(states.len()));
        }

        for state in states {
            if state.values.len() != samples.by_vertex.len() {
                return Err(McmcError::InvalidConfig(
                    "samples must all record the same vertices".into(),
                ));
            }
            for (id, value) in state.values {
                samples
                    .by_vertex
                    .get_mut(&id)
                    .ok_or(McmcError::UnknownVertex(id))?
                    .push(value);
            }
            samples.log_probs.push(state.log_prob);
        }
        Ok(samples)
    }

    pub fn len(&self) -> usize {
        self.log_probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_probs.is_empty()
    }

    /// Samples of one vertex in step order.
    pub fn get(&self, id: VertexId) -> Result<VertexSamples<'_>> {
        self.by_vertex
            .get(&id)
            .map(|values| VertexSamples { values })
            .ok_or(McmcError::UnknownVertex(id))
    }

    pub fn vertices(&self) -> Vec<VertexId> {
        let mut ids: Vec<VertexId> = self.by_vertex.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn log_prob(&self, index: usize) -> Option<f64> {
        self.log_probs.get(index).copied()
    }

    pub fn log_probs(&self) -> &[f64] {
        &self.log_probs
    }

    /// Everything after the first `n` samples.
    pub fn drop(&self, n: usize) -> Result<Self> {
        if n > self.len() {
            return Err(McmcError::InvalidConfig(format!(
                "cannot drop {} of {} samples",
                n,
                self.len()
            )));
        }
        Ok(self.select(|i| i >= n))
    }

    /// Samples `0, k, 2k, ...`.
    pub fn downsample(&self, k: usize) -> Result<Self> {
        if k == 0 {
            return Err(McmcError::InvalidConfig(
                "down-sample interval must be at least 1".into(),
            ));
        }
        Ok(self.select(|i| i % k == 0))
    }

    fn select(&self, keep: impl Fn(usize) -> bool) -> Self {
        let pick = |values: &[Tensor]| -> Vec<Tensor> {
            values
                .iter()
                .enumerate()
                .filter(|(i, _)| keep(*i))
                .map(|(_, v)| v.clone())
                .collect()
        };
        Self {
            by_vertex: self
                .by_vertex
                .iter()
                .map(|(id, values)| (*id, pick(values)))
                .collect(),
            log_probs: self
                .log_probs
                .iter()
                .enumerate()
                .filter(|(i, _)| keep(*i))
                .map(|(_, lp)| *lp)
                .collect(),
        }
    }

    pub fn network_state(&self, index: usize) -> Option<NetworkState> {
        let log_prob = self.log_prob(index)?;
        let values = self
            .by_vertex
            .iter()
            .map(|(id, values)| (*id, values[index].clone()))
            .collect();
        Some(NetworkState::new(values, log_prob))
    }

    /// The sample with the highest joint log-probability; the earliest wins ties.
    pub fn most_probable_state(&self) -> Option<NetworkState> {
        let mut best: Option<(usize, f64)> = None;
        for (i, &lp) in self.log_probs.iter().enumerate() {
            if best.map_or(true, |(_, b)| lp > b) {
                best = Some((i, lp));
            }
        }
        best.and_then(|(i, _)| self.network_state(i))
    }

    /// Fraction of samples whose state satisfies `predicate`. Zero when empty.
    pub fn probability(&self, predicate: impl Fn(&NetworkState) -> bool) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let hits = (0..self.len())
            .filter_map(|i| self.network_state(i))
            .filter(|state| predicate(state))
            .count();
        hits as f64 / self.len() as f64
    }
}

/// Read-only view over one vertex's samples.
#[derive(Debug, Clone, Copy)]
pub struct VertexSamples<'a> {
    values: &'a [Tensor],
}

impl<'a> VertexSamples<'a> {
    pub fn as_slice(&self) -> &'a [Tensor] {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'a, Tensor> {
        self.values.iter()
    }

    /// Samples of a single-element vertex as plain numbers.
    pub fn scalars(&self) -> Result<Vec<f64>> {
        self.values
            .iter()
            .map(|t| match t.iter().next() {
                Some(&x) if t.len() == 1 => Ok(x),
                _ => Err(McmcError::ShapeMismatch(format!(
                    "expected single-element samples, got shape {:?}",
                    t.shape()
                ))),
            })
            .collect()
    }
}
