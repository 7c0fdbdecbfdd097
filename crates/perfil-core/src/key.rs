use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Company key: the first 8 digits of the national tax number (CNPJ).
///
/// Every stage row and queue entry is keyed by this value. Construction
/// validates length and digit-ness so an invalid key can never reach the
/// database layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CompanyKey(String);

impl CompanyKey {
    pub fn new(raw: &str) -> Result<Self, AppError> {
        let trimmed = raw.trim();
        if trimmed.len() != 8 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AppError::Generic(format!(
                "invalid company key '{raw}': expected 8 digits"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompanyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CompanyKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CompanyKey {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<CompanyKey> for String {
    fn from(key: CompanyKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_eight_digits() {
        let key = CompanyKey::new("12345678").unwrap();
        assert_eq!(key.as_str(), "12345678");
    }

    #[test]
    fn trims_whitespace() {
        let key = CompanyKey::new(" 12345678 ").unwrap();
        assert_eq!(key.as_str(), "12345678");
    }

    #[test]
    fn rejects_wrong_length_and_non_digits() {
        assert!(CompanyKey::new("1234567").is_err());
        assert!(CompanyKey::new("123456789").is_err());
        assert!(CompanyKey::new("1234567a").is_err());
        assert!(CompanyKey::new("").is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let key = CompanyKey::new("62345678").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"62345678\"");
        let back: CompanyKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn serde_rejects_invalid() {
        assert!(serde_json::from_str::<CompanyKey>("\"nope\"").is_err());
    }
}
