//! Dotted numeric code versions

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

const MAX_COMPONENTS: usize = 4;

/// A code version such as `6.0` or `7.1.456.9590`.
///
/// Components missing on one side compare as zero, so `6.0` and `6.0.0.0`
/// are the same version. The original spelling is kept for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CodeVersion {
    parts: Vec<u32>,
}

impl CodeVersion {
    /// Version string reported by a cluster that has never been upgraded
    pub const INITIALIZATION: &'static str = "0.0.0.0";

    /// Build a version from numeric components
    pub fn new(parts: &[u32]) -> Result<Self, Error> {
        if parts.is_empty() || parts.len() > MAX_COMPONENTS {
            return Err(Error::validation(format!(
                "version must have 1 to {} components, got {}",
                MAX_COMPONENTS,
                parts.len()
            )));
        }
        Ok(Self {
            parts: parts.to_vec(),
        })
    }

    /// The cluster initialization sentinel `0.0.0.0`
    pub fn initialization() -> Self {
        Self {
            parts: vec![0; MAX_COMPONENTS],
        }
    }

    /// True for the cluster initialization sentinel
    pub fn is_initialization(&self) -> bool {
        self.parts.iter().all(|p| *p == 0)
    }

    /// Numeric components as written
    pub fn parts(&self) -> &[u32] {
        &self.parts
    }

    fn significant(&self) -> &[u32] {
        let len = self
            .parts
            .iter()
            .rposition(|p| *p != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.parts[..len]
    }
}

impl PartialEq for CodeVersion {
    fn eq(&self, other: &Self) -> bool {
        self.significant() == other.significant()
    }
}

impl Eq for CodeVersion {}

impl Hash for CodeVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl Ord for CodeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.significant().cmp(other.significant())
    }
}

impl PartialOrd for CodeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.parts {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", part)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for CodeVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("version must not be empty"));
        }
        let parts = trimmed
            .split('.')
            .map(|p| {
                p.parse::<u32>()
                    .map_err(|_| Error::validation(format!("invalid version '{}'", s)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(&parts).map_err(|_| Error::validation(format!("invalid version '{}'", s)))
    }
}

impl TryFrom<String> for CodeVersion {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CodeVersion> for String {
    fn from(v: CodeVersion) -> Self {
        v.to_string()
    }
}
