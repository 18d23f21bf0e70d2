//! Choice of the rounds after which the trained models are tested.

use std::collections::BTreeSet;

use crate::common::RoundIdx;

/// The rounds after which the strategy predicts on the test nodes.
///
/// Whatever the strategy, the last round of an experiment is always evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EvaluationStrategy {
    rounds: BTreeSet<RoundIdx>,
    frequency: Option<RoundIdx>,
}

impl EvaluationStrategy {
    /// Only evaluate after the last round.
    pub fn final_round() -> Self {
        Self::default()
    }

    /// Evaluate after each of the given rounds, and after the last one.
    pub fn at_rounds(rounds: impl IntoIterator<Item = RoundIdx>) -> Self {
        Self {
            rounds: rounds.into_iter().collect(),
            frequency: None,
        }
    }

    /// Evaluate every `frequency` rounds, starting with round `0`, and after the last one.
    /// A frequency of `0` only evaluates the last round.
    pub fn every(frequency: RoundIdx) -> Self {
        Self {
            rounds: BTreeSet::new(),
            frequency: Some(frequency).filter(|frequency| *frequency > 0),
        }
    }

    /// The explicitly requested rounds, without the last one.
    pub fn rounds(&self) -> impl Iterator<Item = RoundIdx> + '_ {
        self.rounds.iter().copied()
    }

    /// The first requested round that does not exist in an experiment of `num_rounds`.
    pub fn out_of_range(&self, num_rounds: RoundIdx) -> Option<RoundIdx> {
        self.rounds
            .iter()
            .copied()
            .find(|round| *round >= num_rounds)
    }

    /// Whether the models of `round` are tested, in an experiment of `num_rounds`.
    pub fn should_evaluate(&self, round: RoundIdx, num_rounds: RoundIdx) -> bool {
        round + 1 == num_rounds
            || self.rounds.contains(&round)
            || self
                .frequency
                .map_or(false, |frequency| round % frequency == 0)
    }
}
