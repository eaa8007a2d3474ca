//! Rock-paper-scissors moves and how a round between two of them resolves

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gesture {
    Rock,
    Paper,
    Scissors,
}

impl Gesture {
    /// All gestures in model output order
    pub const ALL: [Gesture; 3] = [Gesture::Rock, Gesture::Paper, Gesture::Scissors];

    pub fn as_str(&self) -> &'static str {
        match self {
            Gesture::Rock => "rock",
            Gesture::Paper => "paper",
            Gesture::Scissors => "scissors",
        }
    }

    /// The gesture this one defeats
    pub fn beats(&self) -> Gesture {
        match self {
            Gesture::Rock => Gesture::Scissors,
            Gesture::Paper => Gesture::Rock,
            Gesture::Scissors => Gesture::Paper,
        }
    }
}

impl fmt::Display for Gesture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown gesture '{0}'")]
pub struct ParseGestureError(pub String);

impl FromStr for Gesture {
    type Err = ParseGestureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Gesture::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseGestureError(s.to_string()))
    }
}

/// Result of a round, from the player's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Win,
    Lose,
    Draw,
}

impl Outcome {
    pub fn decide(player: Gesture, opponent: Gesture) -> Outcome {
        if player == opponent {
            Outcome::Draw
        } else if player.beats() == opponent {
            Outcome::Win
        } else {
            Outcome::Lose
        }
    }
}
