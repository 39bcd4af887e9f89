//! Threshold arithmetic
//!
//! A threshold is derived from the number of acting voters and a ratio in
//! `[1, 100]`:
//!
//! ```text
//!   threshold = ceil(total * ratio / 100)
//! ```
//!
//! `find_majority` decides, from per-fact vote counts, whether a point is
//! still open, has a winner, or can no longer produce one.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AgoraError, Result};

/// Percentage of the suffrage that must agree
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct ThresholdRatio(f64);

impl ThresholdRatio {
    pub fn new(ratio: f64) -> Result<Self> {
        let r = Self(ratio);
        r.is_valid()?;
        Ok(r)
    }

    pub fn is_valid(&self) -> Result<()> {
        if !(1.0..=100.0).contains(&self.0) {
            return Err(AgoraError::invalid(format!(
                "threshold ratio should be between 1 and 100; ratio={}",
                self.0
            )));
        }
        Ok(())
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn bytes(&self) -> [u8; 8] {
        self.0.to_bits().to_be_bytes()
    }
}

impl Default for ThresholdRatio {
    fn default() -> Self {
        Self(100.0)
    }
}

impl TryFrom<f64> for ThresholdRatio {
    type Error = AgoraError;

    fn try_from(v: f64) -> Result<Self> {
        ThresholdRatio::new(v)
    }
}

impl From<ThresholdRatio> for f64 {
    fn from(r: ThresholdRatio) -> f64 {
        r.0
    }
}

impl fmt::Display for ThresholdRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of votes needed out of `total`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub total: u64,
    pub threshold: u64,
    pub ratio: ThresholdRatio,
}

impl Threshold {
    pub fn new(total: u64, ratio: ThresholdRatio) -> Result<Self> {
        ratio.is_valid()?;
        if total < 1 {
            return Err(AgoraError::invalid("zero total of threshold"));
        }
        let threshold = ((total as f64) * ratio.value() / 100.0).ceil() as u64;

        Ok(Self {
            total,
            threshold,
            ratio,
        })
    }

    pub fn is_valid(&self) -> Result<()> {
        self.ratio.is_valid()?;
        if self.total < 1 {
            return Err(AgoraError::invalid("zero total of threshold"));
        }
        if self.threshold < 1 {
            return Err(AgoraError::invalid("zero threshold"));
        }
        Ok(())
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(24);
        b.extend_from_slice(&self.total.to_be_bytes());
        b.extend_from_slice(&self.threshold.to_be_bytes());
        b.extend_from_slice(&self.ratio.bytes());
        b
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}({}%)", self.threshold, self.total, self.ratio)
    }
}

/// Outcome recorded in a voteproof
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum VoteResult {
    #[default]
    NotYet,
    Draw,
    Majority,
}

impl VoteResult {
    pub fn bytes(&self) -> [u8; 1] {
        [match self {
            VoteResult::NotYet => 0x00,
            VoteResult::Draw => 0x01,
            VoteResult::Majority => 0x02,
        }]
    }
}

impl fmt::Display for VoteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VoteResult::NotYet => "NOT YET",
            VoteResult::Draw => "DRAW",
            VoteResult::Majority => "MAJORITY",
        };
        f.write_str(s)
    }
}

/// Outcome of `find_majority`; a majority names the winning index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MajorityResult {
    NotYet,
    Draw,
    Majority(usize),
}

impl MajorityResult {
    pub fn result(&self) -> VoteResult {
        match self {
            MajorityResult::NotYet => VoteResult::NotYet,
            MajorityResult::Draw => VoteResult::Draw,
            MajorityResult::Majority(_) => VoteResult::Majority,
        }
    }
}

/// Decide the outcome of a point from per-fact vote counts.
///
/// `set` must be enumerated in a canonical order; the first index reaching
/// the threshold wins.
pub fn find_majority(total: u64, threshold: u64, set: &[u64]) -> MajorityResult {
    let sum: u64 = set.iter().sum();

    // A majority is impossible; only a complete vote settles it.
    if threshold > total {
        return if sum >= total {
            MajorityResult::Draw
        } else {
            MajorityResult::NotYet
        };
    }

    let max = set.iter().copied().max().unwrap_or(0);
    let remaining = total.saturating_sub(sum);
    if remaining + max < threshold {
        return MajorityResult::Draw;
    }

    if let Some(index) = set.iter().position(|n| *n >= threshold) {
        return MajorityResult::Majority(index);
    }

    if sum >= total {
        return MajorityResult::Draw;
    }

    MajorityResult::NotYet
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ratio(r: f64) -> ThresholdRatio {
        ThresholdRatio::new(r).unwrap()
    }

    #[test]
    fn test_threshold_ceil() {
        assert_eq!(Threshold::new(3, ratio(66.0)).unwrap().threshold, 2);
        assert_eq!(Threshold::new(3, ratio(67.0)).unwrap().threshold, 3);
        assert_eq!(Threshold::new(3, ratio(100.0)).unwrap().threshold, 3);
        assert_eq!(Threshold::new(10, ratio(67.0)).unwrap().threshold, 7);
        assert_eq!(Threshold::new(1, ratio(1.0)).unwrap().threshold, 1);
    }

    #[test]
    fn test_ratio_bounds() {
        assert!(ThresholdRatio::new(0.5).is_err());
        assert!(ThresholdRatio::new(100.1).is_err());
        assert!(ThresholdRatio::new(1.0).is_ok());
        assert!(Threshold::new(0, ratio(50.0)).is_err());
    }

    #[test]
    fn test_single_vote_majority() {
        assert_eq!(find_majority(1, 1, &[1]), MajorityResult::Majority(0));
    }

    #[test]
    fn test_not_yet() {
        assert_eq!(find_majority(3, 2, &[1]), MajorityResult::NotYet);
        assert_eq!(find_majority(3, 2, &[]), MajorityResult::NotYet);
    }

    #[test]
    fn test_draw_when_leader_unreachable() {
        // 4 voters, threshold 3: 2 and 2 can never produce 3
        assert_eq!(find_majority(4, 3, &[2, 2]), MajorityResult::Draw);
        // 3 voters, threshold 2: all different
        assert_eq!(find_majority(3, 2, &[1, 1, 1]), MajorityResult::Draw);
    }

    #[test]
    fn test_first_winner_index() {
        assert_eq!(find_majority(5, 2, &[1, 2, 2]), MajorityResult::Majority(1));
    }

    #[test]
    fn test_threshold_above_total() {
        assert_eq!(find_majority(2, 3, &[1]), MajorityResult::NotYet);
        assert_eq!(find_majority(2, 3, &[2]), MajorityResult::Draw);
        assert_eq!(find_majority(2, 3, &[1, 1]), MajorityResult::Draw);
    }

    proptest! {
        #[test]
        fn prop_majority_index_reaches_threshold(
            total in 1u64..30,
            ratio_pct in 1u64..=100,
            counts in proptest::collection::vec(0u64..10, 0..6),
        ) {
            let threshold = Threshold::new(total, ThresholdRatio::new(ratio_pct as f64).unwrap()).unwrap();
            let sum: u64 = counts.iter().sum();
            prop_assume!(sum <= total);

            match find_majority(total, threshold.threshold, &counts) {
                MajorityResult::Majority(i) => {
                    prop_assert!(counts[i] >= threshold.threshold);
                    prop_assert!(counts[..i].iter().all(|c| *c < threshold.threshold));
                }
                MajorityResult::NotYet => {
                    prop_assert!(sum < total);
                    prop_assert!(counts.iter().all(|c| *c < threshold.threshold));
                }
                MajorityResult::Draw => {
                    prop_assert!(counts.iter().all(|c| *c < threshold.threshold));
                }
            }
        }
    }
}
