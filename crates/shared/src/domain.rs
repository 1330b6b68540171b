use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }
    };
}

id_newtype!(SessionId);
id_newtype!(VoteId);
id_newtype!(ParticipantId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn accepts_ballots(self) -> bool {
        self == Self::Open
    }
}

impl FromStr for SessionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(UnknownVariant {
                kind: "session status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ballot {
    Favor,
    Against,
    Abstain,
}

impl Ballot {
    pub const ALL: [Ballot; 3] = [Ballot::Favor, Ballot::Against, Ballot::Abstain];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Favor => "favor",
            Self::Against => "against",
            Self::Abstain => "abstain",
        }
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ballot {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "favor" => Ok(Self::Favor),
            "against" => Ok(Self::Against),
            "abstain" => Ok(Self::Abstain),
            other => Err(UnknownVariant {
                kind: "ballot",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ballots_case_insensitively() {
        assert_eq!("FAVOR".parse::<Ballot>(), Ok(Ballot::Favor));
        assert_eq!(" abstain ".parse::<Ballot>(), Ok(Ballot::Abstain));
        assert!("maybe".parse::<Ballot>().is_err());
    }

    #[test]
    fn ids_round_trip_through_display() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().expect("parse"), id);
    }

    #[test]
    fn only_open_sessions_accept_ballots() {
        assert!(SessionStatus::Open.accepts_ballots());
        assert!(!SessionStatus::Closed.accepts_ballots());
    }
}
