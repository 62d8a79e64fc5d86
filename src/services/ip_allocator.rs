use std::net::Ipv4Addr;

use crate::error::{AppError, Result};

/// First host octet handed to clients; `.1` belongs to the server.
const FIRST_HOST: u8 = 2;
/// Last usable value for either walked octet.
const LAST_HOST: u8 = 254;

/// Sequential client address pool rooted at a `/24` network.
///
/// Addresses are issued in order from `<network>.2`. When the last octet runs
/// past 254 the walk continues in the next `/24` (third octet + 1), and the
/// pool is exhausted once the third octet would pass 254.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpPool {
    network: Ipv4Addr,
}

impl IpPool {
    /// Creates a pool from a network address. The host octet is ignored.
    pub fn new(network: Ipv4Addr) -> Self {
        let [a, b, c, _] = network.octets();
        Self { network: Ipv4Addr::new(a, b, c, 0) }
    }

    /// Parses `a.b.c.d/24`.
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr.trim().split_once('/').ok_or_else(|| {
            AppError::InvalidConfiguration(format!("Subnet must be in CIDR notation: {}", cidr))
        })?;

        let addr: Ipv4Addr = addr.parse().map_err(|_| {
            AppError::InvalidConfiguration(format!("Invalid subnet address: {}", addr))
        })?;

        if prefix != "24" {
            return Err(AppError::InvalidConfiguration(format!(
                "Only /24 subnets are supported, got /{}",
                prefix
            )));
        }

        Ok(Self::new(addr))
    }

    /// The first address ever issued from this pool.
    pub fn first(&self) -> Ipv4Addr {
        let [a, b, c, _] = self.network.octets();
        Ipv4Addr::new(a, b, c, FIRST_HOST)
    }

    /// Whether `ip` lies in the range this pool walks.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let [a, b, _, _] = self.network.octets();
        let [x, y, _, _] = ip.octets();
        a == x && b == y
    }

    /// The address following `prev`.
    pub fn next_after(&self, prev: Ipv4Addr) -> Result<Ipv4Addr> {
        let [a, b, c, d] = prev.octets();

        if d < LAST_HOST {
            return Ok(Ipv4Addr::new(a, b, c, d + 1));
        }
        if c >= LAST_HOST {
            return Err(AppError::PoolExhausted);
        }
        Ok(Ipv4Addr::new(a, b, c + 1, FIRST_HOST))
    }

    /// Picks the address for a new session given every address currently in
    /// use. Ordering is numeric, never lexical.
    pub fn allocate<I>(&self, in_use: I) -> Result<Ipv4Addr>
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        let latest = in_use
            .into_iter()
            .filter(|ip| self.contains(*ip))
            .max_by_key(|ip| u32::from(*ip));

        match latest {
            Some(prev) if u32::from(prev) >= u32::from(self.first()) => self.next_after(prev),
            _ => Ok(self.first()),
        }
    }
}

/// Parses a stored dotted-quad client address.
pub fn parse_client_ip(raw: &str) -> Result<Ipv4Addr> {
    raw.parse()
        .map_err(|_| AppError::MissingData(format!("client_ip: {}", raw)))
}
