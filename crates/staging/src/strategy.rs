//! Hash strategy resolution for staging requests

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// How the content hash of a staged asset is computed.
///
/// Exactly one strategy is active per request. `Custom` requires a
/// caller-supplied fingerprint seed; `Bundle` and `Output` require a
/// configured transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashStrategy {
    /// Hash the raw source content.
    Source,
    /// The caller supplies the fingerprint seed directly.
    Custom,
    /// Hash the transformation's output, computed before placement when
    /// possible.
    Bundle,
    /// Hash the transformation's output after it is produced.
    Output,
}

impl HashStrategy {
    /// Resolve the strategy from user-supplied hints.
    ///
    /// Defaults to [`Self::Custom`] when a seed was given and
    /// [`Self::Source`] otherwise. Resolution runs before cache-key
    /// computation since the resolved strategy is itself part of the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a seed is combined with an
    /// explicit non-custom strategy, or when `custom` is requested without
    /// a seed.
    pub fn resolve(explicit: Option<Self>, has_custom_seed: bool) -> Result<Self> {
        match (explicit, has_custom_seed) {
            (Some(Self::Custom), true) => Ok(Self::Custom),
            (Some(Self::Custom), false) => Err(Error::configuration(
                "hash strategy 'custom' requires a custom fingerprint seed",
            )),
            (Some(strategy), true) => Err(Error::configuration(format!(
                "a custom fingerprint seed was supplied, but the hash strategy is '{strategy}'; \
                 use 'custom' or drop the seed"
            ))),
            (Some(strategy), false) => Ok(strategy),
            (None, true) => Ok(Self::Custom),
            (None, false) => Ok(Self::Source),
        }
    }

    /// Whether the hash can be computed before a transformation runs.
    #[must_use]
    pub fn known_before_transform(self) -> bool {
        matches!(self, Self::Source | Self::Custom)
    }
}

impl std::fmt::Display for HashStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Custom => write!(f, "custom"),
            Self::Bundle => write!(f, "bundle"),
            Self::Output => write!(f, "output"),
        }
    }
}
