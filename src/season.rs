//! Season filters over GAP habitat presence codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which coded cell values count as "present".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SeasonFilter {
    #[serde(alias = "summer")]
    Summer,
    #[serde(alias = "winter")]
    Winter,
    /// Any recorded presence, whatever the season code.
    #[default]
    #[serde(rename = "Year-round", alias = "year-round", alias = "YearRound")]
    YearRound,
}

/// Cell values used by the habitat models to encode seasonal presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonCodes {
    #[serde(default = "default_year_round_code")]
    pub year_round: u16,
    #[serde(default = "default_winter_code")]
    pub winter: u16,
    #[serde(default = "default_summer_code")]
    pub summer: u16,
}

impl Default for SeasonCodes {
    fn default() -> Self {
        Self {
            year_round: default_year_round_code(),
            winter: default_winter_code(),
            summer: default_summer_code(),
        }
    }
}

impl SeasonCodes {
    pub fn validate(&self) -> Result<(), String> {
        let codes = [self.year_round, self.winter, self.summer];
        if codes.contains(&0) {
            return Err("season codes must be non-zero (0 is no-data)".to_string());
        }
        if codes[0] == codes[1] || codes[0] == codes[2] || codes[1] == codes[2] {
            return Err(format!("season codes must be distinct: {:?}", codes));
        }
        Ok(())
    }
}

impl SeasonFilter {
    /// True when a valid (non-no-data) cell value counts as present.
    pub fn admits(self, value: u16, codes: &SeasonCodes) -> bool {
        match self {
            SeasonFilter::Summer => value == codes.summer || value == codes.year_round,
            SeasonFilter::Winter => value == codes.winter || value == codes.year_round,
            SeasonFilter::YearRound => value > 0,
        }
    }
}

impl fmt::Display for SeasonFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SeasonFilter::Summer => "Summer",
            SeasonFilter::Winter => "Winter",
            SeasonFilter::YearRound => "Year-round",
        };
        f.write_str(name)
    }
}

impl FromStr for SeasonFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "summer" => Ok(SeasonFilter::Summer),
            "winter" => Ok(SeasonFilter::Winter),
            "year-round" | "yearround" | "all" => Ok(SeasonFilter::YearRound),
            other => Err(format!(
                "unknown season '{}' (expected Summer, Winter or Year-round)",
                other
            )),
        }
    }
}

fn default_year_round_code() -> u16 { 1 }
fn default_winter_code() -> u16 { 2 }
fn default_summer_code() -> u16 { 3 }
