//! Restriction input for plan expansion.
//!
//! A selection is either the "everything" sentinel (`all`, `everything` or
//! `*`) or a list of targets. Each target is `<tier>.<simid>` or a bare
//! simulation id, which stands for every tier that id needs.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::is_valid_label;
use crate::error::{Result, SimflowError};
use crate::tier::Tier;

const EVERYTHING: [&str; 3] = ["all", "everything", "*"];

/// One requested target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    /// A single node `<tier>.<simid>`.
    Node { tier: Tier, simid: String },
    /// Every tier the simulation id needs.
    Simulation { simid: String },
}

impl Target {
    pub fn simid(&self) -> &str {
        match self {
            Target::Node { simid, .. } | Target::Simulation { simid } => simid,
        }
    }

    fn parse(token: &str) -> Result<Self> {
        let invalid = |reason: &str| SimflowError::InvalidSelector {
            token: token.to_string(),
            reason: reason.to_string(),
        };
        if token.is_empty() {
            return Err(invalid("empty target"));
        }
        match token.split_once('.') {
            Some((tier, simid)) => {
                let tier: Tier = tier.parse().map_err(|e: String| invalid(&e))?;
                if !is_valid_label(simid) {
                    return Err(invalid("simulation id contains invalid characters"));
                }
                Ok(Target::Node {
                    tier,
                    simid: simid.to_string(),
                })
            }
            None if is_valid_label(token) => Ok(Target::Simulation {
                simid: token.to_string(),
            }),
            None => Err(invalid("expected <tier>.<simid> or <simid>")),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Node { tier, simid } => write!(f, "{tier}.{simid}"),
            Target::Simulation { simid } => f.write_str(simid),
        }
    }
}

/// Parsed restriction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "targets", rename_all = "snake_case")]
pub enum Selection {
    Everything,
    Targets(Vec<Target>),
}

impl Selection {
    /// Parse a comma-separated target list.
    pub fn parse(input: &str) -> Result<Self> {
        Self::from_tokens(input.split(',').map(str::trim))
    }

    /// Parse a file with one target per line. Blank lines and `#` comments
    /// are ignored.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let tokens = text
            .lines()
            .map(|line| line.split('#').next().unwrap_or_default().trim())
            .filter(|line| !line.is_empty());
        Self::from_tokens(tokens)
    }

    /// Build a selection from already split tokens. Duplicates keep their
    /// first position.
    pub fn from_tokens<'a, I>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut targets: Vec<Target> = Vec::new();
        let mut everything = false;
        for token in tokens {
            if EVERYTHING.contains(&token) {
                everything = true;
                continue;
            }
            let target = Target::parse(token)?;
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        if everything {
            return Ok(Selection::Everything);
        }
        if targets.is_empty() {
            return Err(SimflowError::InvalidSelector {
                token: String::new(),
                reason: "no targets given".to_string(),
            });
        }
        Ok(Selection::Targets(targets))
    }

    pub fn is_everything(&self) -> bool {
        matches!(self, Selection::Everything)
    }
}
