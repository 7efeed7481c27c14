use async_trait::async_trait;
use thiserror::Error;

use crate::signal::{MatchId, Participant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchAssignment {
    pub match_id: MatchId,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Queued; no opponent yet.
    Waiting,
    Matched(MatchAssignment),
}

#[derive(Debug, Error)]
pub enum MatchmakingError {
    #[error("matchmaking rejected {participant}: {reason}")]
    Rejected {
        participant: Participant,
        reason: String,
    },
}

#[async_trait]
pub trait Matchmaker: Send + Sync {
    async fn request(&self, participant: &Participant) -> Result<MatchOutcome, MatchmakingError>;
}

/// Hands every participant the same pre-arranged match.
#[derive(Debug, Clone, Default)]
pub struct StaticMatchmaker {
    assignment: Option<MatchAssignment>,
}

impl StaticMatchmaker {
    pub fn new(match_id: MatchId, topic: impl Into<String>) -> Self {
        Self {
            assignment: Some(MatchAssignment {
                match_id,
                topic: topic.into(),
            }),
        }
    }

    /// Never matches anyone.
    pub fn waiting() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Matchmaker for StaticMatchmaker {
    async fn request(&self, participant: &Participant) -> Result<MatchOutcome, MatchmakingError> {
        if participant.as_str().trim().is_empty() {
            return Err(MatchmakingError::Rejected {
                participant: participant.clone(),
                reason: "empty participant id".into(),
            });
        }
        Ok(match &self.assignment {
            Some(assignment) => MatchOutcome::Matched(assignment.clone()),
            None => MatchOutcome::Waiting,
        })
    }
}
