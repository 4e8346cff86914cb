//! Key namespace and classification.
//!
//! Keys follow `<category>:<identifier>[:<qualifier>...]`, e.g.
//! `market:overview` or `orderbook:BTCUSDT:snapshot`. The category decides
//! whether a key is expected to be read by the process that wrote it or by
//! some other process, which in turn decides how long the local tier may
//! keep a copy.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Maximum accepted key length in bytes.
pub const MAX_KEY_LEN: usize = 250;

/// A validated, namespaced cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    raw: String,
    category_len: usize,
}

impl CacheKey {
    /// Parse and validate a key.
    pub fn parse(raw: &str) -> CacheResult<Self> {
        if raw.is_empty() || raw.len() > MAX_KEY_LEN {
            return Err(CacheError::InvalidKey(format!(
                "key length must be 1..={MAX_KEY_LEN} bytes"
            )));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(CacheError::InvalidKey(format!(
                "{raw:?} contains whitespace or control characters"
            )));
        }
        let Some((category, rest)) = raw.split_once(':') else {
            return Err(CacheError::InvalidKey(format!(
                "{raw:?} is not of the form <category>:<identifier>"
            )));
        };
        if category.is_empty() || rest.split(':').any(str::is_empty) {
            return Err(CacheError::InvalidKey(format!(
                "{raw:?} has an empty segment"
            )));
        }
        Ok(Self {
            raw: raw.to_string(),
            category_len: category.len(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn category(&self) -> &str {
        &self.raw[..self.category_len]
    }

    /// Everything after the category, qualifiers included.
    pub fn identifier(&self) -> &str {
        &self.raw[self.category_len + 1..]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Expected reader of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyClass {
    /// Mostly read by the writing process; long local TTL
    LocalAffinity,
    /// Mostly read by other processes; short local TTL bounds staleness
    CrossProcess,
}

/// Static category -> class mapping.
///
/// Built from configuration and validated once; a category may not be listed
/// as both local and cross-process. Categories not listed fall back to
/// `unclassified`.
#[derive(Debug, Clone)]
pub struct KeyPolicy {
    cross_process: HashSet<String>,
    local: HashSet<String>,
    unclassified: KeyClass,
}

impl KeyPolicy {
    pub fn new<I, J, S, T>(cross_process: I, local: J, unclassified: KeyClass) -> CacheResult<Self>
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let cross_process: HashSet<String> = cross_process.into_iter().map(Into::into).collect();
        let local: HashSet<String> = local.into_iter().map(Into::into).collect();

        for category in cross_process.iter().chain(local.iter()) {
            if category.is_empty() || category.contains(':') {
                return Err(CacheError::configuration(format!(
                    "invalid key category {category:?}"
                )));
            }
        }
        if let Some(both) = cross_process.intersection(&local).next() {
            return Err(CacheError::configuration(format!(
                "key category {both:?} is classified as both local and cross-process"
            )));
        }

        Ok(Self {
            cross_process,
            local,
            unclassified,
        })
    }

    pub fn classify(&self, key: &CacheKey) -> KeyClass {
        self.classify_category(key.category())
    }

    pub fn classify_category(&self, category: &str) -> KeyClass {
        if self.cross_process.contains(category) {
            KeyClass::CrossProcess
        } else if self.local.contains(category) {
            KeyClass::LocalAffinity
        } else {
            self.unclassified
        }
    }
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            cross_process: ["market", "analysis", "system", "orderbook"]
                .into_iter()
                .map(String::from)
                .collect(),
            local: HashSet::new(),
            unclassified: KeyClass::CrossProcess,
        }
    }
}
