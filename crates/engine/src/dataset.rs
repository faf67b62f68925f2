//! Historical match dataset
//!
//! Loaded once, read-only for the rest of the run. Records come from a JSON
//! array or a JSON-lines file. Mandatory fields are validated up front; a
//! record missing a score, handicap or odds is skipped with a warning. Every
//! other field becomes analytics in the match's evaluation context.

use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};

use crate::error::LoadError;
use crate::expr::{MatchContext, Value};
use crate::types::{HandicapLine, MatchIdx, Side};

/// Top-level record keys that are not analytics
const CORE_KEYS: &[&str] = &[
    "id",
    "date",
    "home_team",
    "away_team",
    "home_goals",
    "away_goals",
    "handicap",
    "away_handicap",
    "home_odds",
    "away_odds",
];

/// One historical match
#[derive(Debug, Clone)]
pub struct Match {
    pub idx: MatchIdx,
    pub id: String,
    pub date: Option<NaiveDate>,
    pub home_team: String,
    pub away_team: String,
    pub home_goals: i64,
    pub away_goals: i64,
    /// Line applied to the home side
    pub home_line: HandicapLine,
    /// Line applied to the away side
    pub away_line: HandicapLine,
    pub home_odds: Decimal,
    pub away_odds: Decimal,
    /// Pre-match fields visible to factor expressions (never the final score)
    pub context: MatchContext,
}

impl Match {
    pub fn line_for(&self, side: Side) -> &HandicapLine {
        match side {
            Side::Home => &self.home_line,
            Side::Away => &self.away_line,
        }
    }

    pub fn odds_for(&self, side: Side) -> Decimal {
        match side {
            Side::Home => self.home_odds,
            Side::Away => self.away_odds,
        }
    }
}

/// Outcome of a dataset load
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
}

/// Read-only collection of matches, ordered by (date, id)
#[derive(Debug, Default)]
pub struct MatchDataset {
    matches: Vec<Match>,
}

impl MatchDataset {
    /// Load a dataset from a JSON array or JSON-lines file
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, LoadReport), LoadError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut unparsable = 0;
        let records: Vec<JsonValue> = if raw.trim_start().starts_with('[') {
            serde_json::from_str(&raw).map_err(|source| LoadError::Json {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            let mut records = Vec::new();
            for (line_no, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(line) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        unparsable += 1;
                        warn!(line = line_no + 1, error = %e, "Skipping unparsable dataset line");
                    }
                }
            }
            records
        };

        let (dataset, mut report) = Self::from_records(records);
        report.skipped += unparsable;
        info!(
            path = %path.display(),
            loaded = report.loaded,
            skipped = report.skipped,
            "Match dataset loaded"
        );
        Ok((dataset, report))
    }

    /// Build a dataset from already-parsed JSON records
    pub fn from_records(records: Vec<JsonValue>) -> (Self, LoadReport) {
        let mut report = LoadReport::default();
        let mut seen = HashSet::new();
        let mut matches = Vec::with_capacity(records.len());

        for (position, record) in records.into_iter().enumerate() {
            let JsonValue::Object(fields) = record else {
                report.skipped += 1;
                warn!(position, "Skipping dataset record that is not an object");
                continue;
            };
            let id = fields
                .get("id")
                .and_then(json_to_id)
                .unwrap_or_else(|| format!("#{position}"));

            match parse_match(&id, &fields) {
                Ok(m) => {
                    if !seen.insert(m.id.clone()) {
                        report.skipped += 1;
                        warn!(match_id = %id, "Skipping duplicate match id");
                        continue;
                    }
                    matches.push(m);
                }
                Err(reason) => {
                    report.skipped += 1;
                    warn!(match_id = %id, reason = %reason, "Skipping match");
                }
            }
        }

        matches.sort_by(|a, b| (a.date, &a.id).cmp(&(b.date, &b.id)));
        for (i, m) in matches.iter_mut().enumerate() {
            m.idx = MatchIdx(i as u32);
        }
        report.loaded = matches.len();

        (Self { matches }, report)
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn get(&self, idx: MatchIdx) -> &Match {
        &self.matches[idx.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Match> {
        self.matches.iter()
    }
}

fn json_to_id(v: &JsonValue) -> Option<String> {
    match v {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_to_decimal(v: &JsonValue) -> Option<Decimal> {
    let text = match v {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str_exact(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

fn required<'a>(fields: &'a Map<String, JsonValue>, key: &str) -> Result<&'a JsonValue, String> {
    match fields.get(key) {
        None | Some(JsonValue::Null) => Err(format!("missing {key}")),
        Some(v) => Ok(v),
    }
}

fn parse_goals(fields: &Map<String, JsonValue>, key: &str) -> Result<i64, String> {
    let raw = required(fields, key)?;
    let value = json_to_decimal(raw).ok_or_else(|| format!("{key} is not numeric"))?;
    if !value.fract().is_zero() {
        return Err(format!("{key} is not a whole number"));
    }
    value.to_i64().ok_or_else(|| format!("{key} out of range"))
}

fn parse_line(raw: &JsonValue, key: &str) -> Result<HandicapLine, String> {
    let parsed = match raw {
        JsonValue::String(s) => HandicapLine::parse(s),
        other => match json_to_decimal(other) {
            Some(v) => HandicapLine::from_value(v),
            None => return Err(format!("{key} is not a line")),
        },
    };
    parsed.map_err(|e| format!("{key}: {e}"))
}

fn parse_match(id: &str, fields: &Map<String, JsonValue>) -> Result<Match, String> {
    let home_goals = parse_goals(fields, "home_goals")?;
    let away_goals = parse_goals(fields, "away_goals")?;
    let home_line = parse_line(required(fields, "handicap")?, "handicap")?;
    let away_line = match fields.get("away_handicap") {
        None | Some(JsonValue::Null) => home_line.negate(),
        Some(raw) => parse_line(raw, "away_handicap")?,
    };
    let home_odds = json_to_decimal(required(fields, "home_odds")?).ok_or("home_odds is not numeric")?;
    let away_odds = json_to_decimal(required(fields, "away_odds")?).ok_or("away_odds is not numeric")?;

    let date = match fields.get("date") {
        Some(JsonValue::String(s)) => {
            let day = s.get(..10).unwrap_or(s);
            Some(NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|_| format!("bad date {s}"))?)
        }
        _ => None,
    };
    let text = |key: &str| {
        fields
            .get(key)
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let home_team = text("home_team");
    let away_team = text("away_team");

    let mut context = MatchContext::new();
    for (key, value) in fields {
        if !CORE_KEYS.contains(&key.as_str()) {
            flatten_into(&mut context, key, value);
        }
    }
    // pre-match market fields are fair game for factors
    context.insert("handicap", Value::Number(home_line.value().to_f64().unwrap_or_default()));
    context.insert("away_handicap", Value::Number(away_line.value().to_f64().unwrap_or_default()));
    context.insert("home_odds", Value::Number(home_odds.to_f64().unwrap_or_default()));
    context.insert("away_odds", Value::Number(away_odds.to_f64().unwrap_or_default()));
    context.insert("home_team", Value::Text(home_team.clone()));
    context.insert("away_team", Value::Text(away_team.clone()));
    if let Some(d) = date {
        context.insert("date", Value::Text(d.to_string()));
    }

    Ok(Match {
        idx: MatchIdx(0),
        id: id.to_string(),
        date,
        home_team,
        away_team,
        home_goals,
        away_goals,
        home_line,
        away_line,
        home_odds,
        away_odds,
        context,
    })
}

/// Nested objects become dot paths: `{"home": {"xg": 1.2}}` → `home.xg`
fn flatten_into(ctx: &mut MatchContext, prefix: &str, value: &JsonValue) {
    match value {
        JsonValue::Object(map) => {
            for (k, v) in map {
                flatten_into(ctx, &format!("{prefix}.{k}"), v);
            }
        }
        JsonValue::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(ctx, &format!("{prefix}.{i}"), v);
            }
        }
        JsonValue::Null => ctx.insert(prefix, Value::Null),
        JsonValue::Bool(b) => ctx.insert(prefix, Value::Bool(*b)),
        JsonValue::Number(n) => match n.as_f64() {
            Some(f) => ctx.insert(prefix, Value::Number(f)),
            None => ctx.insert(prefix, Value::Null),
        },
        JsonValue::String(s) => ctx.insert(prefix, Value::Text(s.clone())),
    }
}
