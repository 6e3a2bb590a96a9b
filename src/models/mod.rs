use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::Iterable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::entities::scans;

/// Language a letter was captured in. The `scans.language` column only
/// accepts these codes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[sea_orm(string_value = "de")]
    De,
    #[sea_orm(string_value = "en")]
    En,
    #[sea_orm(string_value = "fr")]
    Fr,
    #[sea_orm(string_value = "es")]
    Es,
    #[sea_orm(string_value = "it")]
    It,
    #[sea_orm(string_value = "tr")]
    Tr,
    #[sea_orm(string_value = "ar")]
    Ar,
    #[sea_orm(string_value = "uk")]
    Uk,
    #[sea_orm(string_value = "ru")]
    Ru,
    #[sea_orm(string_value = "pl")]
    Pl,
}

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Language::De => "de",
            Language::En => "en",
            Language::Fr => "fr",
            Language::Es => "es",
            Language::It => "it",
            Language::Tr => "tr",
            Language::Ar => "ar",
            Language::Uk => "uk",
            Language::Ru => "ru",
            Language::Pl => "pl",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown language code: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_lowercase();
        Language::iter()
            .find(|lang| lang.code() == code)
            .ok_or(UnknownLanguage(s.to_string()))
    }
}

/// A stored letter scan as seen by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub id: String,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
    pub language: Language,
    pub owner_id: String,
    /// Raw payload written by the analysis worker. `None` until it finishes.
    pub analysis: Option<serde_json::Value>,
}

impl Scan {
    pub fn has_analysis(&self) -> bool {
        self.analysis.as_ref().is_some_and(|v| !v.is_null())
    }
}

impl From<scans::Model> for Scan {
    fn from(model: scans::Model) -> Self {
        Self {
            id: model.id,
            image_url: model.image_url,
            created_at: model.created_at,
            language: model.language,
            owner_id: model.user_id,
            // A JSON null in the column means the same as an empty column
            analysis: model.analysis.filter(|v| !v.is_null()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountTier {
    #[default]
    Free,
    Paid,
}

/// The authenticated owner plus the UI language in effect at capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub owner_id: String,
    pub language: Language,
    pub tier: AccountTier,
}

impl Session {
    pub fn new(owner_id: impl Into<String>, language: Language) -> Self {
        Self {
            owner_id: owner_id.into(),
            language,
            tier: AccountTier::Free,
        }
    }

    pub fn with_tier(mut self, tier: AccountTier) -> Self {
        self.tier = tier;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_codes_round_trip() {
        for lang in Language::iter() {
            assert_eq!(lang.code().parse::<Language>().unwrap(), lang);
        }
        assert_eq!(" DE ".parse::<Language>().unwrap(), Language::De);
        assert!("xx".parse::<Language>().is_err());
    }

    #[test]
    fn test_null_analysis_counts_as_missing() {
        let model = scans::Model {
            id: "s1".to_string(),
            image_url: "http://img".to_string(),
            created_at: Utc::now(),
            language: Language::En,
            user_id: "u1".to_string(),
            analysis: Some(serde_json::Value::Null),
        };
        let scan = Scan::from(model);
        assert!(scan.analysis.is_none());
        assert!(!scan.has_analysis());
    }
}
