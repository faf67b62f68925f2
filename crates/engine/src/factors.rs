//! Declarative factor library
//!
//! ```json
//! {
//!   "mandatory": {
//!     "side": [{"key": "xg_edge_home", "side": "home", "condition": "home.xg > away.xg"}],
//!     "size": [{"key": "flat_200", "stake": 200}]
//!   },
//!   "form": [{"key": "home_in_form", "expr": "home.form_points >= 10"}],
//!   "market": [{"key": "short_line", "expr": "abs(handicap) <= 0.5"}]
//! }
//! ```
//!
//! `mandatory.side` and `mandatory.size` are required; every other top-level
//! key is an optional category. Categories are ordered by name so combination
//! names are canonical regardless of document order. A factor whose expression
//! does not parse is excluded with a warning.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::error::LoadError;
use crate::expr::Expr;
use crate::settlement::round_money;
use crate::types::{FactorId, Side};

/// Which part of a combination a factor fills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactorGroup {
    Side,
    Size,
    /// Index into [`FactorLibrary::categories`]
    Optional(usize),
}

#[derive(Debug, Clone)]
pub enum SideRule {
    Fixed(Side),
    /// Must evaluate to `"home"` or `"away"`
    Computed(Expr),
}

#[derive(Debug, Clone)]
pub enum StakeRule {
    Fixed(Decimal),
    /// Must evaluate to a positive number
    Computed(Expr),
}

#[derive(Debug, Clone)]
pub enum FactorRule {
    Side(SideRule),
    Stake(StakeRule),
    Predicate(Expr),
}

#[derive(Debug, Clone)]
pub struct Factor {
    pub id: FactorId,
    pub key: String,
    pub group: FactorGroup,
    pub rule: FactorRule,
    /// Gate: the factor only applies to matches where this holds
    pub condition: Option<Expr>,
    pub description: String,
}

impl Factor {
    /// Whether this factor can remove matches from a combination's set
    pub fn is_gated(&self) -> bool {
        self.condition.is_some() || matches!(self.rule, FactorRule::Predicate(_))
    }
}

#[derive(Debug, Clone)]
pub struct Category {
    pub name: String,
    pub members: Vec<FactorId>,
}

#[derive(Debug, Clone, Default)]
pub struct LibraryReport {
    pub loaded: usize,
    pub excluded: usize,
}

#[derive(Debug, Clone)]
pub struct FactorLibrary {
    factors: Vec<Factor>,
    side: Vec<FactorId>,
    size: Vec<FactorId>,
    categories: Vec<Category>,
}

#[derive(Debug, Deserialize)]
struct RawFactor {
    key: String,
    #[serde(default)]
    description: String,
    expr: Option<String>,
    condition: Option<String>,
    side: Option<String>,
    stake: Option<JsonValue>,
}

impl FactorLibrary {
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, LibraryReport), LoadError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: JsonValue = serde_json::from_str(&raw).map_err(|source| LoadError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let (library, report) = Self::from_json(&doc)?;
        info!(
            path = %path.display(),
            side = library.side.len(),
            size = library.size.len(),
            categories = library.categories.len(),
            excluded = report.excluded,
            "Factor library loaded"
        );
        Ok((library, report))
    }

    pub fn from_json(doc: &JsonValue) -> Result<(Self, LibraryReport), LoadError> {
        let JsonValue::Object(top) = doc else {
            return Err(LoadError::Library("document must be an object".to_string()));
        };
        let Some(JsonValue::Object(mandatory)) = top.get("mandatory") else {
            return Err(LoadError::Library("missing 'mandatory' object".to_string()));
        };

        let mut builder = Builder::default();

        for (group, name) in [(FactorGroup::Side, "side"), (FactorGroup::Size, "size")] {
            let Some(JsonValue::Array(items)) = mandatory.get(name) else {
                return Err(LoadError::Library(format!("missing 'mandatory.{name}' array")));
            };
            let ids = builder.add_group(group, name, items);
            if ids.is_empty() {
                return Err(LoadError::EmptyMandatoryGroup(if name == "side" { "side" } else { "size" }));
            }
            match group {
                FactorGroup::Side => builder.side = ids,
                _ => builder.size = ids,
            }
        }

        let optional: BTreeMap<&String, &JsonValue> =
            top.iter().filter(|(k, _)| k.as_str() != "mandatory").collect();
        for (name, value) in optional {
            let JsonValue::Array(items) = value else {
                warn!(category = %name, "Category is not an array, ignoring");
                continue;
            };
            if !is_valid_name(name) {
                builder.excluded += items.len();
                warn!(category = %name, "Category name may not be empty or contain '+' or '.', ignoring");
                continue;
            }
            let index = builder.categories.len();
            let members = builder.add_group(FactorGroup::Optional(index), name, items);
            if members.is_empty() {
                warn!(category = %name, "Category has no usable factors, ignoring");
                continue;
            }
            builder.categories.push(Category {
                name: name.clone(),
                members,
            });
        }

        let report = LibraryReport {
            loaded: builder.factors.len(),
            excluded: builder.excluded,
        };
        Ok((
            Self {
                factors: builder.factors,
                side: builder.side,
                size: builder.size,
                categories: builder.categories,
            },
            report,
        ))
    }

    pub fn factor(&self, id: FactorId) -> &Factor {
        &self.factors[id.index()]
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn side_factors(&self) -> &[FactorId] {
        &self.side
    }

    pub fn size_factors(&self) -> &[FactorId] {
        &self.size
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// `category.key` for optional factors, the bare key otherwise
    pub fn qualified_key(&self, id: FactorId) -> String {
        let factor = self.factor(id);
        match factor.group {
            FactorGroup::Optional(c) => format!("{}.{}", self.categories[c].name, factor.key),
            _ => factor.key.clone(),
        }
    }
}

#[derive(Default)]
struct Builder {
    factors: Vec<Factor>,
    side: Vec<FactorId>,
    size: Vec<FactorId>,
    categories: Vec<Category>,
    excluded: usize,
}

impl Builder {
    fn add_group(&mut self, group: FactorGroup, name: &str, items: &[JsonValue]) -> Vec<FactorId> {
        let mut ids = Vec::new();
        let mut keys = HashSet::new();

        for item in items {
            let raw: RawFactor = match serde_json::from_value(item.clone()) {
                Ok(raw) => raw,
                Err(e) => {
                    self.excluded += 1;
                    warn!(group = %name, error = %e, "Excluding malformed factor definition");
                    continue;
                }
            };
            if !keys.insert(raw.key.clone()) {
                self.excluded += 1;
                warn!(group = %name, factor = %raw.key, "Excluding duplicate factor key");
                continue;
            }

            let id = FactorId(self.factors.len() as u32);
            match build_factor(id, group, raw) {
                Ok(factor) => {
                    ids.push(id);
                    self.factors.push(factor);
                }
                Err((key, reason)) => {
                    self.excluded += 1;
                    warn!(group = %name, factor = %key, reason = %reason, "Excluding factor");
                }
            }
        }
        ids
    }
}

fn parse_expr(key: &str, field: &str, src: &str) -> Result<Expr, (String, String)> {
    src.parse::<Expr>()
        .map_err(|e| (key.to_string(), format!("{field}: {e}")))
}

/// Keys and category names are joined with `+` and `.` into combination names
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['+', '.'])
}

fn build_factor(id: FactorId, group: FactorGroup, raw: RawFactor) -> Result<Factor, (String, String)> {
    let key = raw.key;
    let fail = |reason: &str| (key.clone(), reason.to_string());

    if !is_valid_name(&key) {
        return Err(fail("key may not be empty or contain '+' or '.'"));
    }

    let condition = raw
        .condition
        .as_deref()
        .map(|src| parse_expr(&key, "condition", src))
        .transpose()?;

    let rule = match group {
        FactorGroup::Side => match (raw.side.as_deref(), raw.expr.as_deref()) {
            (Some(side), _) => FactorRule::Side(SideRule::Fixed(
                side.parse::<Side>().map_err(|e| fail(&e.to_string()))?,
            )),
            (None, Some(src)) => FactorRule::Side(SideRule::Computed(parse_expr(&key, "expr", src)?)),
            (None, None) => return Err(fail("side factor needs 'side' or 'expr'")),
        },
        FactorGroup::Size => match (raw.stake.as_ref(), raw.expr.as_deref()) {
            (Some(stake), _) => {
                let text = match stake {
                    JsonValue::Number(n) => n.to_string(),
                    JsonValue::String(s) => s.clone(),
                    _ => return Err(fail("stake must be a number")),
                };
                let stake = Decimal::from_str_exact(text.trim()).map_err(|_| fail("stake must be a number"))?;
                let stake = round_money(stake);
                if stake <= Decimal::ZERO {
                    return Err(fail("stake must be positive"));
                }
                FactorRule::Stake(StakeRule::Fixed(stake))
            }
            (None, Some(src)) => FactorRule::Stake(StakeRule::Computed(parse_expr(&key, "expr", src)?)),
            (None, None) => return Err(fail("size factor needs 'stake' or 'expr'")),
        },
        FactorGroup::Optional(_) => match raw.expr.as_deref() {
            Some(src) => FactorRule::Predicate(parse_expr(&key, "expr", src)?),
            None => return Err(fail("optional factor needs 'expr'")),
        },
    };

    Ok(Factor {
        id,
        key: key.clone(),
        group,
        rule,
        condition,
        description: raw.description,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    pub(crate) fn sample_library() -> JsonValue {
        json!({
            "mandatory": {
                "side": [
                    {"key": "xg_home", "side": "home", "condition": "home.xg > away.xg",
                     "description": "Back the home side when it out-creates the visitor"},
                    {"key": "xg_favourite", "expr": "home.xg >= away.xg ? 'home' : 'away'"}
                ],
                "size": [
                    {"key": "flat_200", "stake": 200},
                    {"key": "odds_scaled", "expr": "100 * home_odds"}
                ]
            },
            "market": [
                {"key": "short_line", "expr": "abs(handicap) <= 0.5"},
                {"key": "long_line", "expr": "abs(handicap) > 0.5"}
            ],
            "form": [
                {"key": "strong_home_xg", "expr": "home.xg >= 1.5"},
                {"key": "weak_away_xg", "expr": "away.xg < 1.2"}
            ]
        })
    }

    #[test]
    fn test_loads_groups_and_orders_categories() {
        let (lib, report) = FactorLibrary::from_json(&sample_library()).unwrap();
        assert_eq!(report.loaded, 8);
        assert_eq!(report.excluded, 0);
        assert_eq!(lib.side_factors().len(), 2);
        assert_eq!(lib.size_factors().len(), 2);
        let names: Vec<&str> = lib.categories().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["form", "market"]);
        let first_form = lib.categories()[0].members[0];
        assert_eq!(lib.qualified_key(first_form), "form.strong_home_xg");
        assert!(lib.factor(lib.side_factors()[0]).is_gated());
        assert!(!lib.factor(lib.size_factors()[0]).is_gated());
    }

    #[test]
    fn test_excludes_broken_factors() {
        let doc = json!({
            "mandatory": {
                "side": [{"key": "home", "side": "home"}, {"key": "bad", "side": "draw"}],
                "size": [{"key": "flat", "stake": 10}, {"key": "neg", "stake": -1}, {"key": "flat", "stake": 5}]
            },
            "misc": [{"key": "broken", "expr": "home.xg >"}, {"no_key": true}],
            "scalar": 5
        });
        let (lib, report) = FactorLibrary::from_json(&doc).unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(report.excluded, 5);
        assert!(lib.categories().is_empty());
    }

    #[test]
    fn test_fixed_stake_is_rounded_to_cents() {
        let doc = json!({
            "mandatory": {
                "side": [{"key": "home", "side": "home"}],
                "size": [{"key": "odd", "stake": 100.555}, {"key": "dust", "stake": "0.004"}]
            }
        });
        let (lib, report) = FactorLibrary::from_json(&doc).unwrap();
        assert_eq!(report.excluded, 1);
        let odd = lib.factor(lib.size_factors()[0]);
        assert!(matches!(odd.rule, FactorRule::Stake(StakeRule::Fixed(s)) if s == dec!(100.56)));
    }

    #[test]
    fn test_rejects_separator_characters_in_names() {
        let doc = json!({
            "mandatory": {
                "side": [{"key": "home", "side": "home"}, {"key": "home+x", "side": "away"}],
                "size": [{"key": "flat", "stake": 10}, {"key": "flat.2", "stake": 20}]
            },
            "form": [{"key": "a", "expr": "true"}],
            "form.x": [{"key": "b", "expr": "true"}, {"key": "c", "expr": "false"}],
            "odds+": [{"key": "d", "expr": "true"}]
        });
        let (lib, report) = FactorLibrary::from_json(&doc).unwrap();
        assert_eq!(report.loaded, 3);
        assert_eq!(report.excluded, 5);
        let names: Vec<&str> = lib.categories().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["form"]);
    }

    #[test]
    fn test_empty_mandatory_group_is_fatal() {
        let doc = json!({"mandatory": {"side": [{"key": "bad", "expr": "("}], "size": [{"key": "f", "stake": 1}]}});
        assert!(matches!(
            FactorLibrary::from_json(&doc),
            Err(LoadError::EmptyMandatoryGroup("side"))
        ));

        let doc = json!({"mandatory": {"side": [{"key": "h", "side": "home"}]}});
        assert!(matches!(FactorLibrary::from_json(&doc), Err(LoadError::Library(_))));
    }
}
