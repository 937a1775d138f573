//! Safety filter: classifies user input and generated replies as none,
//! concern or crisis, and supplies the fixed response used in place of
//! anything classified as crisis.
pub mod filter;
pub mod rules;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use filter::{sanitize_for_storage, SafetyFilter, SafetyVerdict, SAFETY_RESPONSE};
pub use rules::RuleSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyCategory {
    None,
    Concern,
    Crisis,
}

impl SafetyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyCategory::None => "none",
            SafetyCategory::Concern => "concern",
            SafetyCategory::Crisis => "crisis",
        }
    }
}

impl fmt::Display for SafetyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SafetyCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SafetyCategory::None),
            "concern" => Ok(SafetyCategory::Concern),
            "crisis" => Ok(SafetyCategory::Crisis),
            other => Err(anyhow::anyhow!("unknown safety category '{}'", other)),
        }
    }
}
