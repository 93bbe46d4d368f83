use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static LABEL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("hostname label pattern compiles")
});

const MAX_HOSTNAME_LEN: usize = 253;

/// Reasons a hostname can be rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HostnameError {
    #[error("hostname is empty")]
    Empty,

    #[error("hostname '{0}' is longer than 253 characters")]
    TooLong(String),

    #[error("hostname '{hostname}' has an invalid label '{label}'")]
    InvalidLabel { hostname: String, label: String },

    #[error("hostname '{0}' must have at least two labels")]
    NotQualified(String),
}

/// A fully qualified DNS name, stored lowercase without a trailing dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hostname(String);

impl Hostname {
    pub fn parse(raw: &str) -> Result<Self, HostnameError> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(HostnameError::Empty);
        }

        let normalized = trimmed.to_ascii_lowercase();
        if normalized.len() > MAX_HOSTNAME_LEN {
            return Err(HostnameError::TooLong(normalized));
        }

        let mut labels = 0;
        for label in normalized.split('.') {
            if !LABEL_REGEX.is_match(label) {
                return Err(HostnameError::InvalidLabel {
                    hostname: normalized.clone(),
                    label: label.to_string(),
                });
            }
            labels += 1;
        }

        if labels < 2 {
            return Err(HostnameError::NotQualified(normalized));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a name taken from a certificate.
    pub fn matches(&self, other: &str) -> bool {
        let other = other.strip_suffix('.').unwrap_or(other);
        self.0.eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Hostname {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Hostname {
    type Err = HostnameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Hostname {
    type Error = HostnameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Hostname> for String {
    fn from(value: Hostname) -> Self {
        value.0
    }
}
