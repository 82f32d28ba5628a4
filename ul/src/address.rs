//! Data types for addressing an application entity on the network:
//! a socket address coupled with an application entity title,
//! written `AE-TITLE@host:port`.

use snafu::{ensure, Backtrace, Snafu};
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

/// An error parsing a full application entity address.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseAeAddressError {
    /// The `@` separator between AE title and socket address
    /// is missing.
    #[snafu(display("Missing `@` separator in AE address"))]
    MissingSeparator { backtrace: Backtrace },

    /// The AE title part is empty or too long.
    #[snafu(display("Invalid AE title part ({} characters)", len))]
    InvalidAeTitle { len: usize, backtrace: Backtrace },

    /// The socket address part is empty.
    #[snafu(display("Missing socket address part"))]
    MissingSocketAddress { backtrace: Backtrace },
}

/// A full application entity address:
/// an AE title plus the socket address of the node hosting it,
/// in the form `AE-TITLE@host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AeAddr {
    /// the application entity title
    pub ae_title: String,
    /// the socket address part, e.g. `192.168.1.99:104`
    pub socket_address: String,
}

impl AeAddr {
    /// Create an AE address from its two parts.
    pub fn new<A, B>(ae_title: A, socket_address: B) -> Self
    where
        A: Into<String>,
        B: Into<String>,
    {
        AeAddr {
            ae_title: ae_title.into(),
            socket_address: socket_address.into(),
        }
    }
}

impl fmt::Display for AeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ae_title, self.socket_address)
    }
}

impl TryFrom<&str> for AeAddr {
    type Error = ParseAeAddressError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let (ae_title, socket_address) = value
            .split_once('@')
            .ok_or_else(|| MissingSeparatorSnafu.build())?;
        ensure!(
            !ae_title.is_empty() && ae_title.len() <= 16,
            InvalidAeTitleSnafu {
                len: ae_title.len()
            }
        );
        ensure!(!socket_address.is_empty(), MissingSocketAddressSnafu);
        Ok(AeAddr {
            ae_title: ae_title.to_string(),
            socket_address: socket_address.to_string(),
        })
    }
}

impl FromStr for AeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AeAddr::try_from(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_address() {
        let addr: AeAddr = "MAIN-STORAGE@192.168.1.99:104".parse().unwrap();
        assert_eq!(addr.ae_title, "MAIN-STORAGE");
        assert_eq!(addr.socket_address, "192.168.1.99:104");
        assert_eq!(addr.to_string(), "MAIN-STORAGE@192.168.1.99:104");
    }

    #[test]
    fn parse_with_host_name() {
        let addr: AeAddr = "PACS@pacs.hospital.example:11112".parse().unwrap();
        assert_eq!(addr.ae_title, "PACS");
        assert_eq!(addr.socket_address, "pacs.hospital.example:11112");
    }

    #[test]
    fn reject_malformed_addresses() {
        assert!("192.168.1.99:104".parse::<AeAddr>().is_err());
        assert!("@192.168.1.99:104".parse::<AeAddr>().is_err());
        assert!("THIS-AE-TITLE-IS-TOO-LONG@host:104".parse::<AeAddr>().is_err());
        assert!("PACS@".parse::<AeAddr>().is_err());
    }
}
