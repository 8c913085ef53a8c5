use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use super::ConfigError;

fn to_bits(addr: &IpAddr) -> (u128, u8) {
    match addr {
        IpAddr::V4(v4) => (u32::from(*v4) as u128, 32),
        IpAddr::V6(v6) => (u128::from(*v6), 128),
    }
}

fn from_bits(bits: u128, v6: bool) -> IpAddr {
    if v6 {
        IpAddr::V6(bits.into())
    } else {
        IpAddr::V4((bits as u32).into())
    }
}

/// Clears the host part of the address bits.
fn mask(bits: u128, len: u8, width: u8) -> u128 {
    let host = u32::from(width.saturating_sub(len));
    bits.checked_shr(host)
        .and_then(|b| b.checked_shl(host))
        .unwrap_or(0)
}

fn same_family(a: &IpAddr, b: &IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

/// An address prefix such as `192.0.2.0/24` or `2001:db8::/48`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Prefix {
    pub addr: IpAddr,
    pub len: u8,
}

impl Prefix {
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, ConfigError> {
        let (_, width) = to_bits(&addr);
        if len > width {
            return Err(ConfigError::InvalidPrefix(format!("{}/{}", addr, len)));
        }
        Ok(Self { addr, len })
    }

    /// The same prefix with host bits cleared.
    pub fn network(&self) -> Self {
        let (bits, width) = to_bits(&self.addr);
        Self {
            addr: from_bits(mask(bits, self.len, width), width == 128),
            len: self.len,
        }
    }

    pub fn contains_addr(&self, addr: &IpAddr) -> bool {
        if !same_family(&self.addr, addr) {
            return false;
        }
        let (net, width) = to_bits(&self.addr);
        let (bits, _) = to_bits(addr);
        mask(net, self.len, width) == mask(bits, self.len, width)
    }

    pub fn contains_prefix(&self, other: &Prefix) -> bool {
        other.len >= self.len && self.contains_addr(&other.addr)
    }

    fn first_last(&self) -> (IpAddr, IpAddr) {
        let (bits, width) = to_bits(&self.addr);
        let first = mask(bits, self.len, width);
        let host = u32::from(width - self.len);
        let span = if host >= 128 {
            u128::MAX
        } else {
            (1u128 << host) - 1
        };
        (from_bits(first, width == 128), from_bits(first | span, width == 128))
    }
}

impl FromStr for Prefix {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPrefix(s.to_string());
        let (addr, len) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let len: u8 = len.trim().parse().map_err(|_| invalid())?;
        Prefix::new(addr, len)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// An inclusive address range, written in the config as `a - b` or as a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl AddressRange {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        if !same_family(&self.start, addr) {
            return false;
        }
        let (start, _) = to_bits(&self.start);
        let (end, _) = to_bits(&self.end);
        let (bits, _) = to_bits(addr);
        start <= bits && bits <= end
    }
}

impl FromStr for AddressRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPool(s.to_string());
        if s.contains('/') {
            let (start, end) = s.parse::<Prefix>().map_err(|_| invalid())?.first_last();
            return Ok(Self { start, end });
        }
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start: IpAddr = start.trim().parse().map_err(|_| invalid())?;
        let end: IpAddr = end.trim().parse().map_err(|_| invalid())?;
        if !same_family(&start, &end) || to_bits(&start).0 > to_bits(&end).0 {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

/// A prefix delegation pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdPool {
    pub prefix: Prefix,
    pub delegated_len: u8,
}

impl PdPool {
    pub fn contains(&self, prefix: &Prefix) -> bool {
        self.prefix.contains_prefix(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_prefix_network_clears_host_bits() {
        let p: Prefix = "2001:db8:3:8000::/48".parse().unwrap();
        assert_eq!(p.network().to_string(), "2001:db8:3::/48");

        let p: Prefix = "192.0.2.77/24".parse().unwrap();
        assert_eq!(p.network().to_string(), "192.0.2.0/24");
    }

    #[test]
    fn test_prefix_rejects_bad_length() {
        assert!("192.0.2.0/33".parse::<Prefix>().is_err());
        assert!("2001:db8::".parse::<Prefix>().is_err());
        assert!("::/0".parse::<Prefix>().is_ok());
    }

    #[test]
    fn test_range_contains() {
        let r: AddressRange = "192.0.3.1 - 192.0.3.10".parse().unwrap();
        assert!(r.contains(&ip("192.0.3.2")));
        assert!(r.contains(&ip("192.0.3.10")));
        assert!(!r.contains(&ip("192.0.3.11")));
        assert!(!r.contains(&ip("::1")));

        let r: AddressRange = "2001:db8:3::100-2001:db8:3::ffff".parse().unwrap();
        assert!(r.contains(&ip("2001:db8:3::101")));
        assert!(!r.contains(&ip("2001:db8:3::21")));
    }

    #[test]
    fn test_range_from_prefix() {
        let r: AddressRange = "192.0.2.0/30".parse().unwrap();
        assert_eq!(r.start, ip("192.0.2.0"));
        assert_eq!(r.end, ip("192.0.2.3"));

        let r: AddressRange = "::/0".parse().unwrap();
        assert!(r.contains(&ip("ffff::1")));
    }

    #[test]
    fn test_range_rejects_inverted() {
        assert!("192.0.2.10 - 192.0.2.1".parse::<AddressRange>().is_err());
        assert!("192.0.2.1 - 2001:db8::1".parse::<AddressRange>().is_err());
    }

    #[test]
    fn test_pd_pool_contains() {
        let pool = PdPool {
            prefix: "2001:db8:3:8000::/48".parse().unwrap(),
            delegated_len: 64,
        };
        assert!(pool.contains(&"2001:db8:3:8000::/64".parse().unwrap()));
        assert!(!pool.contains(&"2001:db8:2:abcd::/80".parse().unwrap()));
        assert!(!pool.contains(&"2001:db8::/32".parse().unwrap()));
    }
}
