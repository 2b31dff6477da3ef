use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// Separates the primary and secondary parts of a compound id.
pub const ID_SEPARATOR: char = '#';

/// Identifier returned by create and accepted by every other operation.
///
/// Most backends need a single resource id. Spot-style creation also yields a
/// request id that teardown must cancel, so the id carries it alongside:
/// `i-0abc#sir-1234`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId {
    primary: String,
    secondary: Option<String>,
}

impl ServerId {
    pub fn new(primary: impl Into<String>) -> Result<Self> {
        let primary = primary.into();
        Self::check_part(&primary)?;
        Ok(Self {
            primary,
            secondary: None,
        })
    }

    pub fn compound(primary: impl Into<String>, secondary: impl Into<String>) -> Result<Self> {
        let (primary, secondary) = (primary.into(), secondary.into());
        Self::check_part(&primary)?;
        Self::check_part(&secondary)?;
        Ok(Self {
            primary,
            secondary: Some(secondary),
        })
    }

    fn check_part(part: &str) -> Result<()> {
        if part.is_empty() {
            return Err(Error::InvalidId("id part must not be empty".into()));
        }
        if part.contains(ID_SEPARATOR) {
            return Err(Error::InvalidId(format!(
                "{part:?} must not contain {ID_SEPARATOR:?}"
            )));
        }
        Ok(())
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&str> {
        self.secondary.as_deref()
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidId("id must not be empty".into()));
        }
        match raw.split_once(ID_SEPARATOR) {
            Some((primary, secondary)) => Self::compound(primary, secondary),
            None => Self::new(raw),
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.secondary {
            Some(secondary) => write!(f, "{}{ID_SEPARATOR}{secondary}", self.primary),
            None => f.write_str(&self.primary),
        }
    }
}

impl FromStr for ServerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ServerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
