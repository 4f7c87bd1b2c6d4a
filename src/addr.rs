use serde::{de, Deserialize, Deserializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// An address the proxy claims on behalf of a sleeping host.
///
/// Carries the prefix length used for `ip addr` and, for link-local
/// IPv6, an optional zone taken from a `%scope` suffix.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Address {
    ip: IpAddr,
    prefix: u8,
    scope: Option<String>,
}

#[derive(Debug, Error)]
pub enum AddressParseError {
    #[error("invalid ip address: {0}")]
    Ip(String),
    #[error("invalid prefix length: {0}")]
    Prefix(String),
    #[error("prefix /{prefix} out of range for {ip}")]
    PrefixRange { ip: IpAddr, prefix: u8 },
    #[error("zone suffix is only valid on an ipv6 address: {0}")]
    ScopeOnIpv4(String),
}

impl Address {
    pub fn new(ip: IpAddr, prefix: u8) -> Result<Self, AddressParseError> {
        if prefix > max_prefix(&ip) {
            return Err(AddressParseError::PrefixRange { ip, prefix });
        }
        Ok(Address {
            ip,
            prefix,
            scope: None,
        })
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }

    /// fe80::/10, the only range where a zone is needed to bind.
    pub fn is_link_local(&self) -> bool {
        match self.ip {
            IpAddr::V4(_) => false,
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        }
    }

    /// Textual address with prefix and zone stripped, as firewall
    /// tools expect it.
    pub fn pure(&self) -> String {
        self.ip.to_string()
    }

    /// `addr/prefix` as `ip addr add` expects it.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.ip, self.prefix)
    }

    /// Address form a socket or ping can bind to. Link-local IPv6
    /// needs a zone; a zone parsed from the input wins over the
    /// episode interface.
    pub fn bindable(&self, iface: &str) -> String {
        if self.is_link_local() {
            let zone = self.scope.as_deref().unwrap_or(iface);
            format!("{}%{}", self.ip, zone)
        } else {
            self.pure()
        }
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // addr[%scope][/prefix]
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let (ip_part, scope) = match addr_part.split_once('%') {
            Some((a, z)) => (a, Some(z.to_owned())),
            None => (addr_part, None),
        };
        let ip: IpAddr = ip_part
            .parse()
            .map_err(|_| AddressParseError::Ip(s.to_owned()))?;
        if scope.is_some() && ip.is_ipv4() {
            return Err(AddressParseError::ScopeOnIpv4(s.to_owned()));
        }
        let prefix = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| AddressParseError::Prefix(s.to_owned()))?,
            None => max_prefix(&ip),
        };
        if prefix > max_prefix(&ip) {
            return Err(AddressParseError::PrefixRange { ip, prefix });
        }
        Ok(Address { ip, prefix, scope })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.scope {
            Some(zone) => write!(f, "{}%{}/{}", self.ip, zone, self.prefix),
            None => write!(f, "{}/{}", self.ip, self.prefix),
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Renders a bare destination the way `bindable` does for a claimed
/// address. Used for the ping target, which arrives as the plain
/// destination of the captured packet.
pub fn bindable_ip(iface: &str, ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(_) => ip.to_string(),
        IpAddr::V6(v6) => {
            if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                format!("{}%{}", v6, iface)
            } else {
                v6.to_string()
            }
        }
    }
}
