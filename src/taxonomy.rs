// src/taxonomy.rs
//! # Taxonomy
//! Closed set of category labels an article can resolve to, plus the two
//! sentinel states used by the categorization engine:
//!
//! - `UNCATEGORIZED`: transient failure, picked up again by `recategorize`.
//! - `ERROR`: permanent failure, never retried automatically.
//!
//! The exclusion list (categories hidden from reporting queries) is kept here
//! so every consumer filters against the same list.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Earnings,
    MergersAcquisitions,
    AnalystRating,
    Product,
    RegulatoryLegal,
    Management,
    MarketMovement,
    /// Macro/geopolitical statement attributed to a named leader.
    MacroLeader,
    /// Macro/geopolitical commentary without a specific leader.
    MacroNobody,
    NonFinancial,
    Uncategorized,
    Error,
}

impl Category {
    /// Labels the classifier is allowed to return (sentinels excluded).
    pub const ASSIGNABLE: [Category; 10] = [
        Category::Earnings,
        Category::MergersAcquisitions,
        Category::AnalystRating,
        Category::Product,
        Category::RegulatoryLegal,
        Category::Management,
        Category::MarketMovement,
        Category::MacroLeader,
        Category::MacroNobody,
        Category::NonFinancial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Earnings => "EARNINGS",
            Category::MergersAcquisitions => "MERGERS_ACQUISITIONS",
            Category::AnalystRating => "ANALYST_RATING",
            Category::Product => "PRODUCT",
            Category::RegulatoryLegal => "REGULATORY_LEGAL",
            Category::Management => "MANAGEMENT",
            Category::MarketMovement => "MARKET_MOVEMENT",
            Category::MacroLeader => "MACRO_LEADER",
            Category::MacroNobody => "MACRO_NOBODY",
            Category::NonFinancial => "NON_FINANCIAL",
            Category::Uncategorized => "UNCATEGORIZED",
            Category::Error => "ERROR",
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Category::Uncategorized | Category::Error)
    }

    /// One-line description used when prompting the classifier.
    pub fn describe(&self) -> &'static str {
        match self {
            Category::Earnings => "quarterly results, guidance, revenue or profit figures",
            Category::MergersAcquisitions => "mergers, acquisitions, divestitures, buyouts",
            Category::AnalystRating => "analyst upgrades, downgrades, price targets",
            Category::Product => "product launches, recalls, partnerships, contracts",
            Category::RegulatoryLegal => "regulators, lawsuits, fines, investigations",
            Category::Management => "executive changes, board decisions, insider moves",
            Category::MarketMovement => "price action, trading volume, index moves",
            Category::MacroLeader => "macro or geopolitical statements by a named leader",
            Category::MacroNobody => "macro or geopolitical commentary without a specific leader",
            Category::NonFinancial => "not market relevant",
            Category::Uncategorized => "classification pending retry",
            Category::Error => "classification failed permanently",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category label: {0:?}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    /// Case-insensitive; spaces, dashes and `&` are folded to underscores so
    /// "Mergers & Acquisitions" and "mergers-acquisitions" both resolve.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut key = String::with_capacity(s.len());
        for ch in s.trim().chars() {
            match ch {
                ' ' | '-' | '/' => key.push('_'),
                '&' => {}
                c => key.push(c.to_ascii_uppercase()),
            }
        }
        while key.contains("__") {
            key = key.replace("__", "_");
        }
        let key = key.trim_matches('_');

        let all = Category::ASSIGNABLE
            .iter()
            .chain([Category::Uncategorized, Category::Error].iter());
        for c in all {
            if c.as_str() == key {
                return Ok(*c);
            }
        }
        match key {
            "MA" | "M_A" | "MNA" | "MERGERS_AND_ACQUISITIONS" => Ok(Category::MergersAcquisitions),
            "NON_MARKET" => Ok(Category::NonFinancial),
            _ => Err(UnknownCategory(s.to_string())),
        }
    }
}

/// Categories hidden from daily summaries and per-symbol views by default.
pub const DEFAULT_EXCLUDED: [Category; 4] = [
    Category::MacroNobody,
    Category::Uncategorized,
    Category::Error,
    Category::NonFinancial,
];

/// Central exclusion list handed to every reporting query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionList {
    excluded: Vec<Category>,
}

impl ExclusionList {
    pub fn new(mut excluded: Vec<Category>) -> Self {
        excluded.sort();
        excluded.dedup();
        Self { excluded }
    }

    pub fn is_excluded(&self, c: Category) -> bool {
        self.excluded.binary_search(&c).is_ok()
    }

    pub fn as_slice(&self) -> &[Category] {
        &self.excluded
    }
}

impl Default for ExclusionList {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUDED.to_vec())
    }
}
