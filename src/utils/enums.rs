use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{data::Muon, DimuonError};

/// The identification flag a muon must carry to be considered by a
/// [`QualityGate`](crate::selection::QualityGate).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MuonId {
    /// No identification requirement.
    #[default]
    Any,
    /// A muon reconstructed from inner-tracker hits and muon-system hits together.
    Global,
    /// A muon reconstructed from the inner tracker and matched to muon-system segments.
    Tracker,
    /// The medium identification working point.
    Medium,
}

impl MuonId {
    /// Check whether the given [`Muon`] carries this identification flag.
    pub fn is_satisfied_by(&self, muon: &Muon) -> bool {
        match self {
            MuonId::Any => true,
            MuonId::Global => muon.is_global,
            MuonId::Tracker => muon.is_tracker,
            MuonId::Medium => muon.medium_id,
        }
    }
}

impl Display for MuonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MuonId::Any => write!(f, "Any"),
            MuonId::Global => write!(f, "Global"),
            MuonId::Tracker => write!(f, "Tracker"),
            MuonId::Medium => write!(f, "Medium"),
        }
    }
}

impl FromStr for MuonId {
    type Err = DimuonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_ref() {
            "any" | "none" => Ok(Self::Any),
            "global" | "isglobal" | "gm" => Ok(Self::Global),
            "tracker" | "istracker" | "tm" => Ok(Self::Tracker),
            "medium" | "mediumid" | "medium-id" | "medium_id" => Ok(Self::Medium),
            _ => Err(DimuonError::ParseError {
                name: s.to_string(),
                object: "MuonId".to_string(),
            }),
        }
    }
}

/// The electric charge of a muon, in units of the elementary charge.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Charge {
    /// A positively charged muon ($`\mu^+`$).
    Positive,
    /// A negatively charged muon ($`\mu^-`$).
    Negative,
}

impl Charge {
    /// The charge as a signed integer.
    pub fn value(&self) -> i32 {
        match self {
            Charge::Positive => 1,
            Charge::Negative => -1,
        }
    }
}

impl TryFrom<i32> for Charge {
    type Error = DimuonError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Charge::Positive),
            -1 => Ok(Charge::Negative),
            charge => Err(DimuonError::InvalidCharge { charge }),
        }
    }
}

impl Display for Charge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Charge::Positive => write!(f, "+"),
            Charge::Negative => write!(f, "-"),
        }
    }
}

impl FromStr for Charge {
    type Err = DimuonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_ref() {
            "+" | "+1" | "1" | "plus" | "pos" | "positive" => Ok(Self::Positive),
            "-" | "-1" | "minus" | "neg" | "negative" => Ok(Self::Negative),
            _ => Err(DimuonError::ParseError {
                name: s.to_string(),
                object: "Charge".to_string(),
            }),
        }
    }
}
