//! Sock-address and destination model.
//!
//! Grounded on `linkerd-tcp`'s `balancer/mod.rs::DstAddr` (an address/weight
//! pair) and `original_source/src/glb_dst.c` (the FNV-1a-of-address-bytes
//! hash and the weight-sign removal convention).

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use error::Error;

/// 32-bit FNV-1a offset basis / prime, as used by `glb_dst.c`'s client-hint
/// hash.
const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Hashes the raw bytes of an IP address (not its port) with 32-bit FNV-1a.
///
/// Used to turn a client's source address into the `hint` passed to
/// `Router::choose_dst` under the SOURCE policy.
pub fn fnv1a_addr_hash(addr: &IpAddr) -> u32 {
    let bytes: Vec<u8> = match *addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    fnv1a(&bytes)
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A back-end server address plus a weight.
///
/// `weight > 0` is eligible, `weight == 0` is drain (no new connections,
/// existing ones persist), `weight < 0` is the removal sentinel used in
/// change requests — it must never be stored.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Destination {
    pub addr: SocketAddr,
    pub weight: f64,
}

impl Destination {
    pub fn new(addr: SocketAddr, weight: f64) -> Destination {
        Destination { addr, weight }
    }

    pub fn is_removal(&self) -> bool {
        self.weight < 0.0
    }

    pub fn is_drain(&self) -> bool {
        self.weight == 0.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.weight)
    }
}

/// Parses `host[:port[:weight]]`, as used on the CLI, in config files, in
/// control-plane requests and in prober cluster-membership reports.
///
/// An absent port falls back to `default_port`; an absent weight is `1.0`.
/// A bare `-` (or any negative number) in the weight position parses to the
/// canonical removal sentinel, `-1.0`, regardless of the literal value
/// given, matching the control-plane convention in
/// `original_source/src/glb_cnf.h`.
pub fn parse_dst_spec(spec: &str, default_port: u16) -> Result<Destination, Error> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(Error::config("empty destination spec"));
    }

    let mut parts = spec.splitn(3, ':');
    let host = parts
        .next()
        .ok_or_else(|| Error::config(format!("invalid destination: {}", spec)))?;

    let port = match parts.next() {
        Some(p) if !p.is_empty() => p
            .parse::<u16>()
            .map_err(|_| Error::config(format!("invalid port in {}", spec)))?,
        _ => default_port,
    };

    let weight = match parts.next() {
        Some(w) if !w.is_empty() => {
            if w == "-" {
                -1.0
            } else {
                w.parse::<f64>()
                    .map_err(|_| Error::config(format!("invalid weight in {}", spec)))?
            }
        }
        _ => 1.0,
    };
    let weight = if weight < 0.0 { -1.0 } else { weight };

    let ip: IpAddr = host
        .parse()
        .map_err(|_| Error::config(format!("unresolvable host {} (DNS names require a resolver at the call site)", host)))?;

    Ok(Destination::new(SocketAddr::new(ip, port), weight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn hash_ignores_port() {
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(fnv1a_addr_hash(&a), fnv1a_addr_hash(&a));
    }

    #[test]
    fn parse_host_only() {
        let d = parse_dst_spec("10.0.0.1", 3306).unwrap();
        assert_eq!(d.addr.port(), 3306);
        assert_eq!(d.weight, 1.0);
    }

    #[test]
    fn parse_host_port_weight() {
        let d = parse_dst_spec("10.0.0.1:4444:2.5", 3306).unwrap();
        assert_eq!(d.addr.port(), 4444);
        assert_eq!(d.weight, 2.5);
    }

    #[test]
    fn parse_removal() {
        let d = parse_dst_spec("10.0.0.1:4444:-", 3306).unwrap();
        assert_eq!(d.weight, -1.0);
        assert!(d.is_removal());
    }

    #[test]
    fn parse_negative_weight_normalizes() {
        let d = parse_dst_spec("10.0.0.1:4444:-7", 3306).unwrap();
        assert_eq!(d.weight, -1.0);
    }
}
