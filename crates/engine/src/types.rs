//! Types shared across the discovery engine

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::settlement::SettlementError;

/// Index of a match inside the loaded dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchIdx(pub u32);

impl MatchIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a factor inside the loaded library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactorId(pub u32);

impl FactorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Team a bet backs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Home,
    Away,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Away => "away",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "home" => Ok(Self::Home),
            "away" => Ok(Self::Away),
            other => Err(SettlementError::InvalidSide(other.to_string())),
        }
    }
}

/// Asian handicap line, always expressed from the backed side's perspective.
///
/// A quarter line such as `-0.75` is stored as the two adjacent simple lines
/// it is settled against (`-0.5/-1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandicapLine {
    Single(Decimal),
    Split(Decimal, Decimal),
}

impl HandicapLine {
    /// Parse `"-0.5"`, `"+1"`, `"0/-0.5"` or `"-0.5,-1"`.
    pub fn parse(raw: &str) -> Result<Self, SettlementError> {
        let raw = raw.trim();
        let parts: Vec<&str> = raw.split(['/', ',']).map(str::trim).collect();
        match parts.as_slice() {
            [single] => Self::from_value(parse_line_number(single, raw)?),
            [first, second] => {
                let a = parse_line_number(first, raw)?;
                let b = parse_line_number(second, raw)?;
                Self::split(a, b)
            }
            _ => Err(SettlementError::InvalidHandicap(raw.to_string())),
        }
    }

    /// Build a line from a single numeric value; quarter values become splits.
    pub fn from_value(value: Decimal) -> Result<Self, SettlementError> {
        if is_multiple_of(value, dec!(0.5)) {
            Ok(Self::Single(value.normalize()))
        } else if is_multiple_of(value, dec!(0.25)) {
            // -0.75 settles against -0.5 and -1
            let toward_zero = if value.is_sign_negative() {
                value + dec!(0.25)
            } else {
                value - dec!(0.25)
            };
            let away_from_zero = if value.is_sign_negative() {
                value - dec!(0.25)
            } else {
                value + dec!(0.25)
            };
            Ok(Self::Split(toward_zero.normalize(), away_from_zero.normalize()))
        } else {
            Err(SettlementError::InvalidHandicap(value.to_string()))
        }
    }

    /// Two adjacent simple lines, half a goal apart.
    pub fn split(a: Decimal, b: Decimal) -> Result<Self, SettlementError> {
        let adjacent = (a - b).abs() == dec!(0.5);
        if !adjacent || !is_multiple_of(a, dec!(0.5)) || !is_multiple_of(b, dec!(0.5)) {
            return Err(SettlementError::InvalidHandicap(format!("{a}/{b}")));
        }
        Ok(Self::Split(a.normalize(), b.normalize()))
    }

    /// The same line seen from the opposing side.
    pub fn negate(&self) -> Self {
        match *self {
            Self::Single(h) => Self::Single(-h),
            Self::Split(a, b) => Self::Split(-a, -b),
        }
    }

    /// Average value of the line (`-0.5/-1` → `-0.75`).
    pub fn value(&self) -> Decimal {
        match *self {
            Self::Single(h) => h,
            Self::Split(a, b) => (a + b) / dec!(2),
        }
    }
}

impl fmt::Display for HandicapLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(h) => write!(f, "{}", h.normalize()),
            Self::Split(a, b) => write!(f, "{}/{}", a.normalize(), b.normalize()),
        }
    }
}

fn parse_line_number(part: &str, raw: &str) -> Result<Decimal, SettlementError> {
    let part = part.strip_prefix('+').unwrap_or(part);
    Decimal::from_str_exact(part).map_err(|_| SettlementError::InvalidHandicap(raw.to_string()))
}

fn is_multiple_of(value: Decimal, step: Decimal) -> bool {
    (value % step).is_zero()
}

/// Settlement outcome of a single bet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Win,
    Loss,
    Push,
}

/// A graded bet: transient, folded into a summary and dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetGrade {
    pub outcome: Outcome,
    pub stake: Decimal,
    pub payout: Decimal,
    pub profit: Decimal,
}

/// Aggregate performance of one combination over its matching set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySummary {
    pub name: String,
    pub side_factor: String,
    pub size_factor: String,
    /// Optional factors as `category.key`, in canonical category order
    pub optional_factors: Vec<String>,
    pub total_bets: u32,
    pub wins: u32,
    pub losses: u32,
    pub pushes: u32,
    /// Matches in the intersection that could not be graded
    pub skipped: u32,
    pub total_stake: Decimal,
    pub total_payout: Decimal,
    pub total_profit: Decimal,
    /// Net profit / stake, percent
    pub roi: Decimal,
    /// Wins / bets, percent
    pub win_rate: Decimal,
    pub avg_odds: Decimal,
    pub max_drawdown: Decimal,
    pub max_consecutive_losses: u32,
}
