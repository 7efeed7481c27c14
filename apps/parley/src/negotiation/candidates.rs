use std::collections::VecDeque;

use crate::signal::CandidateDescriptor;

/// Remote candidates that arrived before a remote description was installed.
///
/// Arrival order is the only key. Deduplication is opt-in for peer stacks that do not
/// tolerate re-applied candidates.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<CandidateDescriptor>,
    deduplicate: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deduplicating() -> Self {
        Self {
            pending: VecDeque::new(),
            deduplicate: true,
        }
    }

    pub fn push(&mut self, candidate: CandidateDescriptor) {
        self.pending.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Yields every buffered candidate in arrival order and empties the buffer.
    pub fn drain(&mut self) -> Vec<CandidateDescriptor> {
        let drained: Vec<_> = self.pending.drain(..).collect();
        if !self.deduplicate {
            return drained;
        }
        let mut unique: Vec<CandidateDescriptor> = Vec::with_capacity(drained.len());
        for candidate in drained {
            if !unique.contains(&candidate) {
                unique.push(candidate);
            }
        }
        unique
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
