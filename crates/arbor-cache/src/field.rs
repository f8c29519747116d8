use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Per-file artifacts stored in the tiered cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheField {
    ParsedBuffer,
    Stats,
    Preview,
    Highlights,
    Folds,
    Brackets,
    Errors,
    ScrollPosition,
    VisibleContent,
}

impl CacheField {
    pub const ALL: [CacheField; 9] = [
        CacheField::ParsedBuffer,
        CacheField::Stats,
        CacheField::Preview,
        CacheField::Highlights,
        CacheField::Folds,
        CacheField::Brackets,
        CacheField::Errors,
        CacheField::ScrollPosition,
        CacheField::VisibleContent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CacheField::ParsedBuffer => "parsedBuffer",
            CacheField::Stats => "stats",
            CacheField::Preview => "preview",
            CacheField::Highlights => "highlights",
            CacheField::Folds => "folds",
            CacheField::Brackets => "brackets",
            CacheField::Errors => "errors",
            CacheField::ScrollPosition => "scrollPosition",
            CacheField::VisibleContent => "visibleContent",
        }
    }
}

impl fmt::Display for CacheField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheField {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheField::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| CacheError::UnknownField(s.to_string()))
    }
}
