use std::collections::VecDeque;

use crate::connection::IceCandidate;

/// Remote candidates that arrived before the remote description they belong
/// to was usable. Strict FIFO; draining empties the buffer in one step.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    buffered: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.buffered.push_back(candidate);
    }

    /// Hand every buffered candidate to `apply` in arrival order and clear
    /// the buffer. Returns how many were applied; `0` on an empty buffer.
    pub fn drain_into<F>(&mut self, mut apply: F) -> usize
    where
        F: FnMut(IceCandidate),
    {
        let drained = std::mem::take(&mut self.buffered);
        let count = drained.len();
        for candidate in drained {
            apply(candidate);
        }
        count
    }

    pub fn discard(&mut self) -> usize {
        let count = self.buffered.len();
        self.buffered.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_arrival_order_once() {
        let mut queue = CandidateQueue::new();
        for idx in 0..3 {
            queue.enqueue(IceCandidate::new(format!("cand-{idx}")));
        }
        let mut applied = Vec::new();
        assert_eq!(queue.drain_into(|c| applied.push(c.candidate)), 3);
        assert_eq!(applied, vec!["cand-0", "cand-1", "cand-2"]);
        assert!(queue.is_empty());

        assert_eq!(queue.drain_into(|c| applied.push(c.candidate)), 0);
        assert_eq!(applied.len(), 3);
    }

    #[test]
    fn discard_drops_everything() {
        let mut queue = CandidateQueue::new();
        queue.enqueue(IceCandidate::new("a"));
        queue.enqueue(IceCandidate::new("b"));
        assert_eq!(queue.discard(), 2);
        assert_eq!(queue.len(), 0);
    }
}
