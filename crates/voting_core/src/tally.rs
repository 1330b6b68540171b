use serde::{Deserialize, Serialize};
use shared::{domain::Ballot, protocol::Vote};

/// Aggregate ballot counts for one session. Always recomputed, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub favor: usize,
    pub against: usize,
    pub abstain: usize,
    pub total: usize,
}

impl Tally {
    pub fn count(&self, ballot: Ballot) -> usize {
        match ballot {
            Ballot::Favor => self.favor,
            Ballot::Against => self.against,
            Ballot::Abstain => self.abstain,
        }
    }

    /// Rounded percentage of `ballot` over all votes; 0 for an empty tally.
    pub fn share(&self, ballot: Ballot) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let count = self.count(ballot);
        let rounded = (count * 100 + self.total / 2) / self.total;
        u8::try_from(rounded).unwrap_or(100)
    }

    /// Ballots that received at least one vote, in ballot order.
    pub fn nonzero(&self) -> impl Iterator<Item = (Ballot, usize)> + '_ {
        Ballot::ALL
            .into_iter()
            .map(|ballot| (ballot, self.count(ballot)))
            .filter(|(_, count)| *count > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Counts every record it is given. Uniqueness by vote id is the caller's
/// concern; [`crate::SessionView`] never holds two records with the same id.
pub fn compute_tally<'a, I>(votes: I) -> Tally
where
    I: IntoIterator<Item = &'a Vote>,
{
    let mut tally = Tally::default();
    for vote in votes {
        match vote.ballot {
            Ballot::Favor => tally.favor += 1,
            Ballot::Against => tally.against += 1,
            Ballot::Abstain => tally.abstain += 1,
        }
        tally.total += 1;
    }
    tally
}

#[cfg(test)]
#[path = "tests/tally_tests.rs"]
mod tests;
