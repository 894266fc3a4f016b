use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// CAIP-2 chain identifier, restricted to the `eip155` namespace.
///
/// The canonical textual form is `eip155:<decimal id>`. Only the numeric
/// reference is stored; formatting is derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainIdError {
    #[error("chain identifier {0:?} is not in CAIP-2 form")]
    MissingNamespace(String),

    #[error("chain {0:?} is not an EVM chain")]
    NotEvm(String),

    #[error("failed to parse chain ID from {0:?}")]
    InvalidReference(String),
}

impl ChainId {
    pub const NAMESPACE: &'static str = "eip155";

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The numeric chain id used on the wire (EIP-155).
    #[must_use]
    pub const fn eip155(&self) -> u64 {
        self.0
    }

    /// Environment variable that overrides the first RPC URL for this
    /// chain. Non-alphanumeric characters of the CAIP-2 form are mapped
    /// to underscores, e.g. `RPC_URL_eip155_11155111`.
    #[must_use]
    pub fn rpc_url_env_key(&self) -> String {
        let id = self
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect::<String>();
        format!("RPC_URL_{id}")
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", Self::NAMESPACE, self.0)
    }
}

impl FromStr for ChainId {
    type Err = ChainIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, reference) = s
            .split_once(':')
            .ok_or_else(|| ChainIdError::MissingNamespace(s.to_owned()))?;
        if namespace != Self::NAMESPACE {
            return Err(ChainIdError::NotEvm(s.to_owned()));
        }
        let id = reference
            .parse::<u64>()
            .map_err(|_| ChainIdError::InvalidReference(s.to_owned()))?;
        Ok(Self(id))
    }
}

impl Serialize for ChainId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
