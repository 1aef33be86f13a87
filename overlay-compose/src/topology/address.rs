use std::fmt;
use std::fmt::Formatter;
use std::net::Ipv4Addr;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// Prefix length used when an interface address is given without one
pub const DEFAULT_PREFIX_LEN: u8 = 24;

/// Address of a host side interface. The declaration can opt out of assigning an address with
/// the `none` sentinel, in which case the internal port is still created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum InterfaceAddress {
    Unassigned,
    Ip {
        address: Ipv4Addr,
        prefix_len: u8,
    },
}

impl InterfaceAddress {
    pub fn is_unassigned(&self) -> bool {
        matches!(self, InterfaceAddress::Unassigned)
    }
}

impl FromStr for InterfaceAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("none") {
            return Ok(InterfaceAddress::Unassigned);
        }
        let (address, prefix_len) = match s.split_once('/') {
            Some((address, prefix)) => {
                let prefix_len = prefix.parse::<u8>()
                    .map_err(|_| format!("invalid prefix length {prefix}"))?;
                if prefix_len > 32 {
                    return Err(format!("prefix length {prefix_len} is over 32"));
                }
                (address, prefix_len)
            }
            None => (s, DEFAULT_PREFIX_LEN),
        };
        let address = Ipv4Addr::from_str(address)
            .map_err(|e| format!("{address} is not an ipv4 address: {e}"))?;
        Ok(InterfaceAddress::Ip { address, prefix_len })
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceAddress::Unassigned => f.write_str("none"),
            InterfaceAddress::Ip { address, prefix_len } => write!(f, "{address}/{prefix_len}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interface_address() {
        assert_eq!(
            "192.168.200.10".parse::<InterfaceAddress>().unwrap(),
            InterfaceAddress::Ip { address: Ipv4Addr::new(192, 168, 200, 10), prefix_len: 24 }
        );
        assert_eq!(
            "10.1.0.1/16".parse::<InterfaceAddress>().unwrap().to_string(),
            "10.1.0.1/16"
        );
        // both spellings of the sentinel opt out of the address
        assert!("none".parse::<InterfaceAddress>().unwrap().is_unassigned());
        assert!("None".parse::<InterfaceAddress>().unwrap().is_unassigned());
        assert!("10.0.0.300".parse::<InterfaceAddress>().is_err());
        assert!("10.0.0.1/33".parse::<InterfaceAddress>().is_err());
    }
}
