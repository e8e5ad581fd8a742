//! Context levels
//!
//! The four tiers of the context hierarchy, ordered by specificity:
//! `Global < Project < Branch < Task`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Level of a context record in the hierarchy
///
/// The derived ordering follows specificity, so `Task` compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextLevel {
    /// User-wide defaults
    Global,
    /// Project-wide settings
    Project,
    /// Settings scoped to one branch of a project
    Branch,
    /// Settings scoped to one task on a branch
    Task,
}

impl ContextLevel {
    /// All levels, least specific first
    pub const ALL: [ContextLevel; 4] = [
        ContextLevel::Global,
        ContextLevel::Project,
        ContextLevel::Branch,
        ContextLevel::Task,
    ];

    /// Numeric rank (0 = least specific)
    #[inline]
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            ContextLevel::Global => 0,
            ContextLevel::Project => 1,
            ContextLevel::Branch => 2,
            ContextLevel::Task => 3,
        }
    }

    /// The next less specific level, `None` for `Global`
    #[inline]
    #[must_use]
    pub fn parent(self) -> Option<ContextLevel> {
        match self {
            ContextLevel::Global => None,
            ContextLevel::Project => Some(ContextLevel::Global),
            ContextLevel::Branch => Some(ContextLevel::Project),
            ContextLevel::Task => Some(ContextLevel::Branch),
        }
    }

    /// The next more specific level, `None` for `Task`
    #[inline]
    #[must_use]
    pub fn child(self) -> Option<ContextLevel> {
        match self {
            ContextLevel::Global => Some(ContextLevel::Project),
            ContextLevel::Project => Some(ContextLevel::Branch),
            ContextLevel::Branch => Some(ContextLevel::Task),
            ContextLevel::Task => None,
        }
    }

    /// True if `self` is strictly less specific than `other`
    #[inline]
    #[must_use]
    pub fn is_ancestor_of(self, other: ContextLevel) -> bool {
        self.rank() < other.rank()
    }

    /// Lowercase name, as used in serialized form
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ContextLevel::Global => "global",
            ContextLevel::Project => "project",
            ContextLevel::Branch => "branch",
            ContextLevel::Task => "task",
        }
    }
}

impl fmt::Display for ContextLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown level name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown context level: '{0}'")]
pub struct ParseLevelError(pub String);

impl FromStr for ContextLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(ContextLevel::Global),
            "project" => Ok(ContextLevel::Project),
            "branch" => Ok(ContextLevel::Branch),
            "task" => Ok(ContextLevel::Task),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}
