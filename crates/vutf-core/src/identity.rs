//! User identity normalisation.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Canonical key for per-user memory isolation.
///
/// Always trimmed and case-folded, so the same logical user maps to the same
/// store for the lifetime of the deployment. The value is the identity
/// provider's subject claim, never a display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserIdentity(String);

impl UserIdentity {
    /// Normalise a raw subject claim
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(Error::InvalidIdentity("identity must not be empty".into()));
        }
        if normalized.chars().any(char::is_control) {
            return Err(Error::InvalidIdentity(
                "identity must not contain control characters".into(),
            ));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserIdentity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<UserIdentity> for String {
    fn from(value: UserIdentity) -> Self {
        value.0
    }
}

impl std::fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
