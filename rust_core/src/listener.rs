use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{McmcError, Result};
use crate::graph::VertexId;
use crate::proposal::Proposal;

/// What happened to a proposal during a step.
#[derive(Debug, Clone, Copy)]
pub enum ProposalEvent<'a> {
    Created(&'a Proposal),
    Accepted(&'a Proposal),
    Rejected(&'a Proposal),
}

impl<'a> ProposalEvent<'a> {
    pub fn proposal(&self) -> &'a Proposal {
        match *self {
            ProposalEvent::Created(p) | ProposalEvent::Accepted(p) | ProposalEvent::Rejected(p) => p,
        }
    }
}

pub type ProposalListener = Box<dyn FnMut(&ProposalEvent<'_>)>;

/// Fans proposal events out to registered listeners, in registration order.
#[derive(Default)]
pub struct ProposalNotifier {
    listeners: Vec<ProposalListener>,
}

impl ProposalNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: ProposalListener) {
        self.listeners.push(listener);
    }

    pub fn notify(&mut self, event: &ProposalEvent<'_>) {
        for listener in &mut self.listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl fmt::Debug for ProposalNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProposalNotifier")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    accepted: u64,
    rejected: u64,
}

/// Accepted/rejected counts keyed by the exact set of vertices a proposal moved.
#[derive(Debug, Clone, Default)]
pub struct AcceptanceRateTracker {
    counts: HashMap<Vec<VertexId>, Counts>,
}

impl AcceptanceRateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &ProposalEvent<'_>) {
        match event {
            ProposalEvent::Created(_) => {}
            ProposalEvent::Accepted(p) => self.counts.entry(p.vertices()).or_default().accepted += 1,
            ProposalEvent::Rejected(p) => self.counts.entry(p.vertices()).or_default().rejected += 1,
        }
    }

    /// Fraction of accepted proposals for exactly `subset`, in any order.
    pub fn acceptance_rate(&self, subset: &[VertexId]) -> Result<f64> {
        let mut key = subset.to_vec();
        key.sort_unstable();
        key.dedup();
        let counts = self
            .counts
            .get(&key)
            .ok_or(McmcError::NoProposalsRegistered(key))?;
        Ok(counts.accepted as f64 / (counts.accepted + counts.rejected) as f64)
    }

    /// Every subset seen so far, sorted.
    pub fn subsets(&self) -> Vec<Vec<VertexId>> {
        let mut keys: Vec<_> = self.counts.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// A listener that feeds events into a shared tracker.
    pub fn listener(tracker: &Rc<RefCell<Self>>) -> ProposalListener {
        let tracker = Rc::clone(tracker);
        Box::new(move |event: &ProposalEvent<'_>| tracker.borrow_mut().record(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::scalar;

    fn proposal(ids: &[usize]) -> Proposal {
        let mut p = Proposal::new();
        for &id in ids {
            p.record(VertexId(id), scalar(0.0), scalar(1.0));
        }
        p
    }

    #[test]
    fn test_rate_is_keyed_by_exact_subset() {
        let mut tracker = AcceptanceRateTracker::new();
        let ab = proposal(&[0, 1]);
        let a = proposal(&[0]);

        for _ in 0..3 {
            tracker.record(&ProposalEvent::Accepted(&ab));
        }
        tracker.record(&ProposalEvent::Rejected(&ab));
        tracker.record(&ProposalEvent::Rejected(&a));
        tracker.record(&ProposalEvent::Created(&a));

        assert_eq!(tracker.acceptance_rate(&[VertexId(1), VertexId(0)]).unwrap(), 0.75);
        assert_eq!(tracker.acceptance_rate(&[VertexId(0)]).unwrap(), 0.0);
        assert_eq!(tracker.subsets().len(), 2);
    }

    #[test]
    fn test_unseen_subset_is_an_error() {
        let tracker = AcceptanceRateTracker::new();
        let err = tracker.acceptance_rate(&[VertexId(3)]).unwrap_err();
        assert!(matches!(err, McmcError::NoProposalsRegistered(ref ids) if ids == &vec![VertexId(3)]));
    }

    #[test]
    fn test_notifier_feeds_shared_tracker() {
        let tracker = Rc::new(RefCell::new(AcceptanceRateTracker::new()));
        let mut notifier = ProposalNotifier::new();
        notifier.add_listener(AcceptanceRateTracker::listener(&tracker));

        let p = proposal(&[2]);
        notifier.notify(&ProposalEvent::Accepted(&p));
        notifier.notify(&ProposalEvent::Rejected(&p));
        assert_eq!(tracker.borrow().acceptance_rate(&[VertexId(2)]).unwrap(), 0.5);
    }
}
