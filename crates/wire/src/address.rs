//! Host addresses and `scheme://ip:port` endpoint URIs.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::{AddressError, FrameError, Result};
use crate::frame::{Frame, FrameBuilder};

/// Identity of one side of a pairing: `ip:port`.
///
/// Equality and hashing are by value, so it can key session tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostAddress {
    ip: String,
    port: u16,
}

impl HostAddress {
    /// Create a host address.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// The ip (or host name) part.
    #[must_use]
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// The port part.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Same ip, different port. Used once a listener on port 0 has been bound.
    #[must_use]
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.ip.clone(), port)
    }

    /// Append `[i32 len][utf8 ip][i32 port]`.
    pub fn write(&self, builder: &mut FrameBuilder) {
        builder
            .write_string(&self.ip)
            .write_i32(i32::from(self.port));
    }

    /// Read an address written by [`HostAddress::write`].
    ///
    /// # Errors
    ///
    /// Fails on truncated input or a port outside `0..=65535`.
    pub fn read(frame: &mut Frame) -> Result<Self> {
        let ip = frame.take_string()?;
        let port = frame.take_i32()?;
        let port = u16::try_from(port).map_err(|_| FrameError::InvalidPort(port))?;
        Ok(Self { ip, port })
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for HostAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        if ip.is_empty() {
            return Err(AddressError::MissingHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
        Ok(Self::new(ip, port))
    }
}

/// Transport binding selected by the URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// TCP sockets.
    Tcp,
    /// Named pipes (Unix domain sockets on Unix).
    Pipe,
    /// In-process channels.
    Memory,
}

impl Scheme {
    /// The URI scheme string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Pipe => "pipe",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = AddressError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "pipe" => Ok(Self::Pipe),
            "memory" => Ok(Self::Memory),
            other => Err(AddressError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// A parsed `scheme://ip:port` URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Transport binding.
    pub scheme: Scheme,
    /// Host identity.
    pub host: HostAddress,
}

impl Endpoint {
    /// Create an endpoint.
    #[must_use]
    pub const fn new(scheme: Scheme, host: HostAddress) -> Self {
        Self { scheme, host }
    }

    /// Parse `scheme://ip:port`.
    ///
    /// # Errors
    ///
    /// Fails on malformed URIs, unknown schemes, or a missing/invalid port.
    pub fn parse(uri: &str) -> std::result::Result<Self, AddressError> {
        let url = Url::parse(uri).map_err(|e| match e {
            url::ParseError::InvalidPort => AddressError::InvalidPort(uri.to_string()),
            other => AddressError::InvalidUri(other),
        })?;
        let scheme = url.scheme().parse::<Scheme>()?;
        let ip = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| AddressError::MissingHost(uri.to_string()))?;
        let port = url
            .port()
            .ok_or_else(|| AddressError::MissingPort(uri.to_string()))?;
        Ok(Self::new(scheme, HostAddress::new(ip, port)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)
    }
}

impl FromStr for Endpoint {
    type Err = AddressError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}
