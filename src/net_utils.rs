//! Local IPv4 interface enumeration for subnet-directed discovery broadcasts.

use std::io;
use std::net::Ipv4Addr;

/// Enumerate the subnet-directed broadcast addresses (ip | !mask) of all
/// local non-loopback IPv4 interfaces.
///
/// Returns an empty vec on failure or on unsupported platforms, letting
/// callers fall back to limited broadcast (255.255.255.255).
pub fn broadcast_addresses() -> io::Result<Vec<Ipv4Addr>> {
    broadcast_addresses_impl()
}

#[cfg(unix)]
fn broadcast_addresses_impl() -> io::Result<Vec<Ipv4Addr>> {
    let mut addresses = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            current = ifa.ifa_next;

            if ifa.ifa_addr.is_null() || ifa.ifa_netmask.is_null() {
                continue;
            }
            if (*ifa.ifa_addr).sa_family as i32 != libc::AF_INET {
                continue;
            }

            let addr = ifa.ifa_addr as *const libc::sockaddr_in;
            let ip = Ipv4Addr::from((*addr).sin_addr.s_addr.to_ne_bytes());
            if ip.is_loopback() {
                continue;
            }

            let mask_addr = ifa.ifa_netmask as *const libc::sockaddr_in;
            let netmask = Ipv4Addr::from((*mask_addr).sin_addr.s_addr.to_ne_bytes());

            let broadcast = Ipv4Addr::from(u32::from(ip) | !u32::from(netmask));
            if !addresses.contains(&broadcast) {
                addresses.push(broadcast);
            }
        }

        libc::freeifaddrs(ifaddrs);
    }

    Ok(addresses)
}

#[cfg(not(unix))]
fn broadcast_addresses_impl() -> io::Result<Vec<Ipv4Addr>> {
    // Fall back to limited broadcast on platforms without getifaddrs.
    Ok(vec![])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directed_broadcast_arithmetic() {
        let cases = [
            ((192, 168, 1, 100), (255, 255, 255, 0), (192, 168, 1, 255)),
            ((10, 0, 5, 42), (255, 255, 0, 0), (10, 0, 255, 255)),
            ((172, 16, 0, 1), (255, 255, 255, 252), (172, 16, 0, 3)),
        ];
        for (ip, mask, expected) in cases {
            let ip = Ipv4Addr::new(ip.0, ip.1, ip.2, ip.3);
            let mask = Ipv4Addr::new(mask.0, mask.1, mask.2, mask.3);
            let broadcast = Ipv4Addr::from(u32::from(ip) | !u32::from(mask));
            assert_eq!(
                broadcast,
                Ipv4Addr::new(expected.0, expected.1, expected.2, expected.3)
            );
        }
    }

    #[test]
    fn test_enumeration_does_not_fail() {
        // The exact interface set is host-specific; the call itself must not
        // error and must exclude loopback broadcasts.
        let addrs = broadcast_addresses().unwrap();
        assert!(!addrs.contains(&Ipv4Addr::new(127, 255, 255, 255)));
    }
}
