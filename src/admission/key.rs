//! Client key generation and handling.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Display label of the key shared by requests with no usable identifier.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// A key that identifies the client a request is attributed to.
///
/// Usually the source IP address, but any caller-supplied discriminator
/// (an API key, a forwarded address) works. The unidentified bucket is a
/// separate variant, so no identifier a client sends can land in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(Repr);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Repr {
    Known(String),
    Unknown,
}

impl ClientKey {
    /// Create a key from any string-like identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(Repr::Known(id.into()))
    }

    /// The sentinel key for requests without a usable identifier.
    ///
    /// All such requests share one admission bucket.
    pub fn unknown() -> Self {
        Self(Repr::Unknown)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self.0, Repr::Unknown)
    }

    pub fn as_str(&self) -> &str {
        match &self.0 {
            Repr::Known(id) => id,
            Repr::Unknown => UNKNOWN_CLIENT,
        }
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        Self::new(ip.to_string())
    }
}

/// Only the host part is kept, so reconnects from a new port share a key.
impl From<SocketAddr> for ClientKey {
    fn from(addr: SocketAddr) -> Self {
        Self::from(addr.ip())
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Known(id) => f.write_str(id),
            Repr::Unknown => write!(f, "<{}>", UNKNOWN_CLIENT),
        }
    }
}
