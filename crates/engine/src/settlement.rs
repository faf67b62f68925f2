//! Asian handicap settlement
//!
//! Grades one bet from the final score, the line from the backed side's
//! perspective, decimal odds and stake.
//!
//! A simple line adjusts the backed side's goals and compares them with the
//! opponent's: ahead wins (`stake × odds`), level pushes (stake back), behind
//! loses. A split line halves the stake and settles each half against its own
//! line; payouts are summed and the net outcome follows the sign of profit, so
//! "half won, half pushed" is a `Win` with a reduced payout. Money is rounded
//! to cents once, after both halves are combined.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::types::{BetGrade, HandicapLine, Outcome, Side};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("invalid score {home}-{away}")]
    InvalidScore { home: i64, away: i64 },

    #[error("invalid side: {0}")]
    InvalidSide(String),

    #[error("odds must be positive, got {0}")]
    InvalidOdds(Decimal),

    #[error("stake must be a positive amount in cents, got {0}")]
    InvalidStake(Decimal),

    #[error("malformed handicap line: {0}")]
    InvalidHandicap(String),
}

/// Round a monetary amount to cents
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Grade a single bet.
///
/// `line` is the handicap applied to the backed `side`.
pub fn settle(
    home_goals: i64,
    away_goals: i64,
    line: &HandicapLine,
    side: Side,
    odds: Decimal,
    stake: Decimal,
) -> Result<BetGrade, SettlementError> {
    if home_goals < 0 || away_goals < 0 {
        return Err(SettlementError::InvalidScore {
            home: home_goals,
            away: away_goals,
        });
    }
    if odds <= Decimal::ZERO {
        return Err(SettlementError::InvalidOdds(odds));
    }
    if stake <= Decimal::ZERO || round_money(stake) != stake {
        return Err(SettlementError::InvalidStake(stake));
    }

    let (backed, opposing) = match side {
        Side::Home => (Decimal::from(home_goals), Decimal::from(away_goals)),
        Side::Away => (Decimal::from(away_goals), Decimal::from(home_goals)),
    };

    let raw_payout = match *line {
        HandicapLine::Single(h) => half_payout(backed, opposing, h, odds, stake),
        HandicapLine::Split(a, b) => {
            let half = stake / dec!(2);
            half_payout(backed, opposing, a, odds, half) + half_payout(backed, opposing, b, odds, half)
        }
    };

    let payout = round_money(raw_payout);
    let profit = payout - stake;
    let outcome = if profit > Decimal::ZERO {
        Outcome::Win
    } else if profit < Decimal::ZERO {
        Outcome::Loss
    } else {
        Outcome::Push
    };

    Ok(BetGrade {
        outcome,
        stake,
        payout,
        profit,
    })
}

/// Unrounded payout of `stake` settled against one simple line
fn half_payout(backed: Decimal, opposing: Decimal, line: Decimal, odds: Decimal, stake: Decimal) -> Decimal {
    let adjusted = backed + line;
    if adjusted > opposing {
        stake * odds
    } else if adjusted == opposing {
        stake
    } else {
        Decimal::ZERO
    }
}
