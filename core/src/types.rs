//! Shared primitive types used across the engine.

use serde::{Deserialize, Serialize};

/// Participant identity, owned by the external account system.
pub type UserId = i64;

/// Unix timestamp in seconds (UTC).
pub type Timestamp = i64;

/// A stable, unique identifier for a calculation or maintenance run.
pub type RunId = String;

/// The three commission pools. Each has its own budget and clamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CommissionType {
    Direct,
    Binary,
    Override,
}

impl CommissionType {
    pub const ALL: [CommissionType; 3] = [Self::Direct, Self::Binary, Self::Override];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct   => "direct",
            Self::Binary   => "binary",
            Self::Override => "override",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct"   => Some(Self::Direct),
            "binary"   => Some(Self::Binary),
            "override" => Some(Self::Override),
            _ => None,
        }
    }
}

/// A side of the binary placement tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Left,
    Right,
}

impl Leg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left  => "left",
            Self::Right => "right",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "left"  => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    ReadyToClaim,
    Paid,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending      => "pending",
            Self::ReadyToClaim => "ready_to_claim",
            Self::Paid         => "paid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending"        => Some(Self::Pending),
            "ready_to_claim" => Some(Self::ReadyToClaim),
            "paid"           => Some(Self::Paid),
            _ => None,
        }
    }
}

/// Round a money amount down to whole cents.
/// The small bias absorbs representation error (0.1 * 3 etc.) without
/// ever lifting an amount past the next cent.
pub fn floor_cents(amount: f64) -> f64 {
    if amount <= 0.0 {
        return 0.0;
    }
    ((amount * 100.0) + 1e-7).floor() / 100.0
}
