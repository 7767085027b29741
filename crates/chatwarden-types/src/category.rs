//! Violation categories understood by the pipeline.
//!
//! The classifier must name one of these for every flagged item. Anything
//! else is rejected at the client boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A violation category from the fixed enumerated set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Harassment,
    HateSpeech,
    ExtremeHate,
    SexualContent,
    ChildSexualization,
    SexualViolence,
    ViolentThreat,
    Doxxing,
    Swatting,
    SelfHarm,
    Spam,
    Scam,
}

impl Category {
    /// Every category, in declaration order.
    pub const ALL: [Category; 12] = [
        Category::Harassment,
        Category::HateSpeech,
        Category::ExtremeHate,
        Category::SexualContent,
        Category::ChildSexualization,
        Category::SexualViolence,
        Category::ViolentThreat,
        Category::Doxxing,
        Category::Swatting,
        Category::SelfHarm,
        Category::Spam,
        Category::Scam,
    ];

    /// Wire name, e.g. `"HATE_SPEECH"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Harassment => "HARASSMENT",
            Category::HateSpeech => "HATE_SPEECH",
            Category::ExtremeHate => "EXTREME_HATE",
            Category::SexualContent => "SEXUAL_CONTENT",
            Category::ChildSexualization => "CHILD_SEXUALIZATION",
            Category::SexualViolence => "SEXUAL_VIOLENCE",
            Category::ViolentThreat => "VIOLENT_THREAT",
            Category::Doxxing => "DOXXING",
            Category::Swatting => "SWATTING",
            Category::SelfHarm => "SELF_HARM",
            Category::Spam => "SPAM",
            Category::Scam => "SCAM",
        }
    }

    /// Whether the category bans on first sight unless overridden.
    pub fn zero_tolerance_by_default(&self) -> bool {
        matches!(
            self,
            Category::ChildSexualization
                | Category::Doxxing
                | Category::Swatting
                | Category::ExtremeHate
                | Category::SexualViolence
        )
    }

    /// Whether the category starts one rung higher on the ladder unless overridden.
    pub fn severe_by_default(&self) -> bool {
        matches!(self, Category::HateSpeech | Category::ViolentThreat)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    /// Case-insensitive; spaces and dashes are treated as underscores.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown violation category: {s:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip_through_serde() {
        for cat in Category::ALL {
            let json = serde_json::to_string(&cat).unwrap();
            assert_eq!(json, format!("\"{}\"", cat.as_str()));
            let back: Category = serde_json::from_str(&json).unwrap();
            assert_eq!(back, cat);
        }
    }

    #[test]
    fn from_str_is_lenient_about_case_and_separators() {
        assert_eq!("harassment".parse::<Category>().unwrap(), Category::Harassment);
        assert_eq!("hate speech".parse::<Category>().unwrap(), Category::HateSpeech);
        assert_eq!(
            "Child-Sexualization".parse::<Category>().unwrap(),
            Category::ChildSexualization
        );
    }

    #[test]
    fn from_str_rejects_unknown() {
        let err = "JAYWALKING".parse::<Category>().unwrap_err();
        assert!(err.contains("JAYWALKING"));
    }

    #[test]
    fn default_zero_tolerance_set() {
        let zt: Vec<_> = Category::ALL
            .iter()
            .filter(|c| c.zero_tolerance_by_default())
            .collect();
        assert_eq!(zt.len(), 5);
        assert!(!Category::Harassment.zero_tolerance_by_default());
        assert!(Category::Doxxing.zero_tolerance_by_default());
        assert!(Category::Swatting.zero_tolerance_by_default());
    }
}
