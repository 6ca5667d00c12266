use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network address of a cluster runner (host:port).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunnerAddress {
    pub host: String,
    pub port: u16,
}

impl RunnerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RunnerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error returned when parsing a runner address from its `host:port` form.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid runner address: {input}")]
pub struct ParseRunnerAddressError {
    pub input: String,
}

impl FromStr for RunnerAddress {
    type Err = ParseRunnerAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRunnerAddressError { input: s.into() };
        let (host, port) = s.rsplit_once(':').ok_or_else(err)?;
        if host.is_empty() {
            return Err(err());
        }
        let port = port.parse().map_err(|_| err())?;
        Ok(Self::new(host, port))
    }
}
