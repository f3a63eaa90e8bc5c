use std::sync::mpsc::{self, Receiver, Sender};

use chrono::{DateTime, Local};

/// Votes a candidate needs before it wins the round
pub const VOTES_TO_WIN: u32 = 3;

/// One of the two competing mutations in a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Candidate {
    #[strum(to_string = "1")]
    A,
    #[strum(to_string = "2")]
    B,
}

impl Candidate {
    pub const ALL: [Candidate; 2] = [Candidate::A, Candidate::B];

    pub fn index(self) -> usize {
        match self {
            Candidate::A => 0,
            Candidate::B => 1,
        }
    }

    /// 1-based number used on hardware buttons and in store keys
    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }

    pub fn other(self) -> Candidate {
        match self {
            Candidate::A => Candidate::B,
            Candidate::B => Candidate::A,
        }
    }

    pub fn from_number(n: i64) -> Option<Candidate> {
        match n {
            1 => Some(Candidate::A),
            2 => Some(Candidate::B),
            _ => None,
        }
    }
}

/// What a single call to [`VoteTally::push`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Counted; nobody has reached the threshold yet
    Counted { candidate: Candidate, votes: u32 },
    /// Counted, and this vote made `candidate` the winner
    Won { candidate: Candidate, votes: u32 },
    /// Dropped: not voting, or a winner already exists
    Ignored,
}

/// Per-candidate vote counts for the active round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteTally {
    counts: [u32; 2],
    winner: Option<Candidate>,
}

impl VoteTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore counts read back from the store. A count already at the
    /// threshold marks that candidate as the winner.
    pub fn restore(a: u32, b: u32) -> Self {
        let winner = if a >= VOTES_TO_WIN {
            Some(Candidate::A)
        } else if b >= VOTES_TO_WIN {
            Some(Candidate::B)
        } else {
            None
        };
        Self {
            counts: [a, b],
            winner,
        }
    }

    pub fn get(&self, candidate: Candidate) -> u32 {
        self.counts[candidate.index()]
    }

    pub fn winner(&self) -> Option<Candidate> {
        self.winner
    }

    /// Increment and check the threshold as one step. Once a winner exists
    /// the tally is frozen.
    pub fn push(&mut self, candidate: Candidate) -> VoteOutcome {
        if self.winner.is_some() {
            return VoteOutcome::Ignored;
        }
        let slot = &mut self.counts[candidate.index()];
        *slot += 1;
        let votes = *slot;
        if votes >= VOTES_TO_WIN {
            self.winner = Some(candidate);
            VoteOutcome::Won { candidate, votes }
        } else {
            VoteOutcome::Counted { candidate, votes }
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fraction of the threshold reached, clamped to 1.0
    pub fn progress(&self, candidate: Candidate) -> f64 {
        (self.get(candidate) as f64 / VOTES_TO_WIN as f64).min(1.0)
    }
}

/// Whether a hardware voting device answered the last status check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhysicalButtonState {
    #[default]
    Unknown,
    Enabled,
    Unavailable,
}

impl PhysicalButtonState {
    pub fn is_enabled(self) -> bool {
        self == PhysicalButtonState::Enabled
    }

    pub fn status_line(self) -> Option<&'static str> {
        match self {
            PhysicalButtonState::Unknown => None,
            PhysicalButtonState::Enabled => {
                Some("Physical buttons active - Use hardware buttons to choose")
            }
            PhysicalButtonState::Unavailable => {
                Some("Physical buttons not available - Use digital buttons")
            }
        }
    }
}

/// Broadcast for every accepted vote, consumed by whatever displays votes
#[derive(Debug, Clone, PartialEq)]
pub struct VoteSignal {
    pub candidate: Candidate,
    pub timestamp: DateTime<Local>,
}

/// In-process publish/subscribe for [`VoteSignal`]s. Subscribers that hang
/// up are dropped on the next publish.
#[derive(Debug, Default)]
pub struct VoteBus {
    subscribers: Vec<Sender<VoteSignal>>,
}

impl VoteBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<VoteSignal> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, signal: VoteSignal) {
        self.subscribers
            .retain(|tx| tx.send(signal.clone()).is_ok());
    }
}
