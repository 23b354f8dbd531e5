//! Attribute kinds: the vocabulary feature sets and claims are keyed by.
//!
//! The built-in kinds mirror what the upstream extractor tags (people,
//! organizations, places, email addresses, phone numbers). Enrichers extend
//! the vocabulary with their own kinds through [`AttributeKind::Custom`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// The kind of an attribute value.
///
/// Kinds are serialized as upper-case tokens (`PERSON`, `ORG`, `GPE`, `EMAIL`,
/// `PHONE`, or any custom token such as `MAPS_PLACE_ID`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AttributeKind {
    /// A person's name.
    Person,
    /// An organization name.
    Organization,
    /// A geopolitical location (city, region, country).
    Location,
    /// An email address.
    Email,
    /// A phone number.
    Phone,
    /// An enrichment-derived or caller-defined kind.
    Custom(String),
}

impl AttributeKind {
    /// Parses a kind token. Tokens are case-insensitive.
    ///
    /// # Errors
    /// Returns [`ValidationError::EmptyAttributeKind`] for blank tokens.
    pub fn parse(token: &str) -> Result<Self, ValidationError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ValidationError::EmptyAttributeKind);
        }
        let upper = token.to_ascii_uppercase();
        Ok(match upper.as_str() {
            "PERSON" => Self::Person,
            "ORG" | "ORGANIZATION" => Self::Organization,
            "GPE" | "LOCATION" => Self::Location,
            "EMAIL" => Self::Email,
            "PHONE" => Self::Phone,
            _ => Self::Custom(upper),
        })
    }

    /// Shorthand for an enrichment-derived kind. The token is upper-cased;
    /// built-in aliases such as `org` resolve to their built-in kind, so the
    /// result always survives a serde round trip unchanged.
    #[must_use]
    pub fn custom(token: &str) -> Self {
        Self::parse(token).unwrap_or_else(|_| Self::Custom(String::new()))
    }

    /// The canonical token for this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Person => "PERSON",
            Self::Organization => "ORG",
            Self::Location => "GPE",
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::Custom(token) => token,
        }
    }

    /// Returns true for the kinds the extractor produces natively.
    #[must_use]
    pub const fn is_builtin(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }

    /// Normalizes a raw value into the key used for index lookups.
    ///
    /// Returns `None` when nothing matchable remains.
    #[must_use]
    pub fn match_key(&self, value: &str) -> Option<String> {
        let key = match self {
            Self::Email => value.trim().to_lowercase(),
            Self::Phone => {
                let trimmed = value.trim();
                let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
                if digits.is_empty() {
                    String::new()
                } else if trimmed.starts_with('+') {
                    format!("+{digits}")
                } else {
                    digits
                }
            }
            _ => value
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase(),
        };
        (!key.is_empty()).then_some(key)
    }
}

impl TryFrom<String> for AttributeKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).map_err(|e| e.to_string())
    }
}

impl From<AttributeKind> for String {
    fn from(value: AttributeKind) -> Self {
        match value {
            AttributeKind::Custom(token) => token,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_builtin_aliases() {
        assert_eq!(AttributeKind::parse("org").unwrap(), AttributeKind::Organization);
        assert_eq!(AttributeKind::parse(" GPE ").unwrap(), AttributeKind::Location);
        assert_eq!(AttributeKind::parse("location").unwrap(), AttributeKind::Location);
        assert_eq!(AttributeKind::parse("Phone").unwrap(), AttributeKind::Phone);
    }

    #[test]
    fn test_parse_custom_is_uppercased() {
        let kind = AttributeKind::parse("maps_place_id").unwrap();
        assert_eq!(kind, AttributeKind::Custom("MAPS_PLACE_ID".to_string()));
        assert!(!kind.is_builtin());
        assert_eq!(kind.to_string(), "MAPS_PLACE_ID");
    }

    #[test]
    fn test_custom_maps_builtin_aliases() {
        assert_eq!(AttributeKind::custom("org"), AttributeKind::Organization);
        assert_eq!(AttributeKind::custom(" Email "), AttributeKind::Email);
        assert_eq!(AttributeKind::custom("tax_id"), AttributeKind::Custom("TAX_ID".to_string()));

        for kind in [AttributeKind::custom("gpe"), AttributeKind::custom("maps_place_id")] {
            let json = serde_json::to_string(&kind).unwrap();
            let back: AttributeKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn test_parse_rejects_blank() {
        assert!(matches!(
            AttributeKind::parse("   "),
            Err(ValidationError::EmptyAttributeKind)
        ));
    }

    #[test]
    fn test_serde_uses_tokens() {
        let json = serde_json::to_string(&AttributeKind::Organization).unwrap();
        assert_eq!(json, "\"ORG\"");
        let back: AttributeKind = serde_json::from_str("\"maps_place_id\"").unwrap();
        assert_eq!(back, AttributeKind::custom("MAPS_PLACE_ID"));
        assert!(serde_json::from_str::<AttributeKind>("\"\"").is_err());
    }

    #[test]
    fn test_match_key_email_and_phone() {
        assert_eq!(
            AttributeKind::Email.match_key("  Ada@Example.COM ").as_deref(),
            Some("ada@example.com")
        );
        assert_eq!(
            AttributeKind::Phone.match_key("+1 (555) 010-2030").as_deref(),
            Some("+15550102030")
        );
        assert_eq!(
            AttributeKind::Phone.match_key("555.010.2030").as_deref(),
            Some("5550102030")
        );
        assert_eq!(AttributeKind::Phone.match_key("n/a"), None);
    }

    #[test]
    fn test_match_key_collapses_whitespace() {
        assert_eq!(
            AttributeKind::Organization.match_key("  Starbucks   Coffee ").as_deref(),
            Some("starbucks coffee")
        );
        assert_eq!(AttributeKind::Person.match_key(" \t "), None);
    }
}
