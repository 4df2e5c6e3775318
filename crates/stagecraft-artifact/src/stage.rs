//! Pipeline stages
//!
//! The fixed, ordered set of phases a project moves through, from the user's
//! brief to generated code.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// One phase of the generation pipeline
///
/// Ordering follows pipeline order (`Brief < ... < CodeGen`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// User-supplied project brief
    Brief,
    /// Free-text requirements
    RequirementsText,
    /// Requirements parsed into the structured schema
    RequirementsStructured,
    /// Reviewed and improved structure the code is generated from
    Scaffold,
    /// Per-file code generation
    CodeGen,
}

impl Stage {
    /// All stages in pipeline order
    pub const ALL: [Stage; 5] = [
        Stage::Brief,
        Stage::RequirementsText,
        Stage::RequirementsStructured,
        Stage::Scaffold,
        Stage::CodeGen,
    ];

    /// Stable identifier used in storage paths and fingerprints
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Stage::Brief => "brief",
            Stage::RequirementsText => "requirements_text",
            Stage::RequirementsStructured => "requirements_structured",
            Stage::Scaffold => "scaffold",
            Stage::CodeGen => "code_gen",
        }
    }

    /// Position in pipeline order
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Stage::Brief => 0,
            Stage::RequirementsText => 1,
            Stage::RequirementsStructured => 2,
            Stage::Scaffold => 3,
            Stage::CodeGen => 4,
        }
    }

    /// Whether the stage payload is a `ProjectRequirements` document
    #[inline]
    #[must_use]
    pub const fn is_structured(&self) -> bool {
        matches!(self, Stage::RequirementsStructured | Stage::Scaffold)
    }

    /// Whether the stage payload is free text
    #[inline]
    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self, Stage::Brief | Stage::RequirementsText)
    }

    /// Whether the stage content comes from the external generator
    #[inline]
    #[must_use]
    pub const fn is_generated(&self) -> bool {
        !matches!(self, Stage::Brief)
    }

    /// Stage that follows this one, if any
    #[must_use]
    pub fn next(&self) -> Option<Stage> {
        Self::ALL.get(self.index() + 1).copied()
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// Stage name did not match any known stage
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_matches_index() {
        for pair in Stage::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].index() + 1, pair[1].index());
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
        assert_eq!(Stage::CodeGen.next(), None);
    }

    #[test]
    fn stage_parse_accepts_kebab_and_case() {
        assert_eq!("Code-Gen".parse::<Stage>().unwrap(), Stage::CodeGen);
        assert_eq!(
            "requirements_structured".parse::<Stage>().unwrap(),
            Stage::RequirementsStructured
        );
        assert!("deploy".parse::<Stage>().is_err());
    }

    #[test]
    fn stage_serde_is_snake_case() {
        let json = serde_json::to_string(&Stage::RequirementsText).unwrap();
        assert_eq!(json, "\"requirements_text\"");
    }

    #[test]
    fn only_brief_is_not_generated() {
        let generated: Vec<_> = Stage::ALL.iter().filter(|s| s.is_generated()).collect();
        assert_eq!(generated.len(), 4);
        assert!(!Stage::Brief.is_generated());
    }
}
