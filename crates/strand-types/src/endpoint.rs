//! Column source / sink addresses carried in `--load-column` and
//! `--flush-column` flags.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};

const FILE_SCHEME: &str = "file://";
const SOCKET_SCHEME: &str = "socket://";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    /// Checkpoint file on the shared filesystem.
    File(PathBuf),
    /// Live cell stream between adjacent stages.
    Socket { host: String, port: u16 },
}

impl Endpoint {
    pub fn socket(host: impl Into<String>, port: u16) -> Self {
        Self::Socket { host: host.into(), port }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path)           => write!(f, "{FILE_SCHEME}{}", path.display()),
            Self::Socket { host, port } => write!(f, "{SOCKET_SCHEME}{host}:{port}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = StrandError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix(FILE_SCHEME) {
            if path.is_empty() {
                return Err(StrandError::Endpoint(format!("empty path in '{s}'")));
            }
            return Ok(Self::File(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix(SOCKET_SCHEME) {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| StrandError::Endpoint(format!("missing port in '{s}'")))?;
            let port = port
                .parse()
                .map_err(|_| StrandError::Endpoint(format!("bad port in '{s}'")))?;
            return Ok(Self::socket(host, port));
        }
        Err(StrandError::Endpoint(format!("unknown scheme in '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        assert_eq!(Endpoint::socket("10.0.0.2", 6001).to_string(), "socket://10.0.0.2:6001");
        assert_eq!(
            Endpoint::File(PathBuf::from("/w/share/out4.bin")).to_string(),
            "file:///w/share/out4.bin"
        );
    }

    #[test]
    fn parses_both_schemes() {
        let ep: Endpoint = "socket://node-b:6002".parse().unwrap();
        assert_eq!(ep, Endpoint::socket("node-b", 6002));
        let ep: Endpoint = "file:///tmp/out1.bin".parse().unwrap();
        assert!(ep.is_file());
    }

    #[test]
    fn rejects_garbage() {
        assert!("tcp://x:1".parse::<Endpoint>().is_err());
        assert!("socket://nohost".parse::<Endpoint>().is_err());
        assert!("socket://h:notaport".parse::<Endpoint>().is_err());
    }
}
