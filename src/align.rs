//! Startup alignment for periodic multi-part streams.
//!
//! The first few cycles after the upstream pipeline starts are often ragged
//! (e.g. only 3 of 9 tiles of the first frame arrive). `StartupAligner` drops
//! everything until it has seen one full cycle for a single sequence number,
//! then passes every later message through untouched.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::message::Sequenced;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignState {
    Searching,
    Aligned,
}

/// Gate that opens after the first complete cycle.
///
/// State is per instance; aligning one stream never affects another.
#[derive(Debug)]
pub struct StartupAligner {
    cycle_len: usize,
    counts: HashMap<u64, usize>,
    state: AlignState,
    dropped: u64,
}

impl StartupAligner {
    pub fn new(cycle_len: usize) -> Result<Self> {
        if cycle_len == 0 {
            return Err(anyhow!("aligner cycle length must be greater than zero"));
        }
        Ok(Self {
            cycle_len,
            counts: HashMap::new(),
            state: AlignState::Searching,
            dropped: 0,
        })
    }

    pub fn state(&self) -> AlignState {
        self.state
    }

    pub fn is_aligned(&self) -> bool {
        self.state == AlignState::Aligned
    }

    /// Messages dropped while searching, across all resets.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Observe one message's sequence number. Returns true when the message
    /// should be passed downstream.
    ///
    /// The message that completes the first clean cycle is itself dropped: it
    /// closes that cycle, so the next message is the first of a fresh one.
    pub fn admit(&mut self, sequence_number: u64) -> bool {
        if self.state == AlignState::Aligned {
            return true;
        }

        // A monotonic stream never returns to an older number.
        self.counts.retain(|&seq, _| seq >= sequence_number);

        let count = self.counts.entry(sequence_number).or_insert(0);
        *count += 1;
        if *count >= self.cycle_len {
            log::info!(
                "startup alignment found at sequence {} ({} messages per cycle)",
                sequence_number,
                self.cycle_len
            );
            self.counts.clear();
            self.state = AlignState::Aligned;
        } else {
            log::debug!(
                "aligning: sequence {} seen {}/{}",
                sequence_number,
                count,
                self.cycle_len
            );
        }
        self.dropped += 1;
        false
    }

    /// Pass `message` through once aligned.
    pub fn gate<M: Sequenced>(&mut self, message: M) -> Option<M> {
        self.admit(message.sequence_number()).then_some(message)
    }

    /// Return to searching, e.g. after downstream detects a desync.
    pub fn reset(&mut self) {
        log::warn!("resetting startup alignment");
        self.counts.clear();
        self.state = AlignState::Searching;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TileDetections;

    fn feed(aligner: &mut StartupAligner, seqs: &[u64]) -> Vec<u64> {
        seqs.iter()
            .copied()
            .filter(|&seq| aligner.admit(seq))
            .collect()
    }

    #[test]
    fn zero_cycle_len_is_rejected() {
        assert!(StartupAligner::new(0).is_err());
    }

    #[test]
    fn drops_ragged_start_until_first_full_cycle() {
        let mut aligner = StartupAligner::new(3).unwrap();
        let passed = feed(&mut aligner, &[1, 1, 2, 2, 2, 3, 3, 3]);
        assert_eq!(passed, vec![3, 3, 3]);
        assert!(aligner.is_aligned());
        assert_eq!(aligner.dropped(), 5);
    }

    #[test]
    fn passes_everything_after_alignment() {
        let mut aligner = StartupAligner::new(2).unwrap();
        assert!(!aligner.admit(10));
        assert!(!aligner.admit(10));
        assert!(aligner.admit(11));
        assert!(aligner.admit(13));
        assert!(aligner.admit(13));
    }

    #[test]
    fn stale_counters_are_discarded() {
        let mut aligner = StartupAligner::new(3).unwrap();
        feed(&mut aligner, &[1, 1, 2, 2]);
        assert_eq!(aligner.counts.len(), 1);
        assert_eq!(aligner.state(), AlignState::Searching);
    }

    #[test]
    fn reset_returns_to_searching() {
        let mut aligner = StartupAligner::new(2).unwrap();
        feed(&mut aligner, &[4, 4]);
        assert!(aligner.is_aligned());

        aligner.reset();
        assert_eq!(aligner.state(), AlignState::Searching);
        assert!(!aligner.admit(5));
        assert!(!aligner.admit(5));
        assert!(aligner.admit(6));
    }

    #[test]
    fn gate_wraps_sequenced_messages() {
        let mut aligner = StartupAligner::new(1).unwrap();
        assert!(aligner.gate(TileDetections::new(1, vec![])).is_none());
        let passed = aligner.gate(TileDetections::new(2, vec![]));
        assert_eq!(passed.map(|m| m.sequence_number), Some(2));
    }
}
