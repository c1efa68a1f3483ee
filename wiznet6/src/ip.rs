//! Address helpers shared across the stack.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// 128-bit destination-register encoding of an address.
///
/// IPv6 addresses map byte for byte; an IPv4 address occupies the low 32
/// bits with the upper 96 zeroed, so both families travel through the same
/// field.
pub fn chip_words(addr: &IpAddr) -> [u8; 16] {
    let mut words = [0u8; 16];
    match addr {
        IpAddr::V4(v4) => words[12..].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => words.copy_from_slice(&v6.octets()),
    }
    words
}

/// Reserved targets a client must never connect to: the unspecified
/// address and the all-ones (broadcast) address of either family.
pub fn is_reserved(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_unspecified() || *v4 == Ipv4Addr::BROADCAST,
        IpAddr::V6(v6) => v6.is_unspecified() || *v6 == Ipv6Addr::from(u128::MAX),
    }
}

/// Modified EUI-64 interface identifier for a MAC address: the
/// universal/local bit is inverted and `FF FE` is stuffed in the middle.
pub fn eui64_interface_id(mac: &[u8; 6]) -> [u8; 8] {
    [
        mac[0] ^ 0x02,
        mac[1],
        mac[2],
        0xFF,
        0xFE,
        mac[3],
        mac[4],
        mac[5],
    ]
}

/// Link-local address (`fe80::/64`) derived from a MAC address.
pub fn link_local_from_mac(mac: &[u8; 6]) -> Ipv6Addr {
    merge_prefix(&Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), &eui64_interface_id(mac))
}

/// Combine the upper 64 bits of `prefix` with an interface identifier.
pub fn merge_prefix(prefix: &Ipv6Addr, interface_id: &[u8; 8]) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[8..].copy_from_slice(interface_id);
    Ipv6Addr::from(octets)
}

/// Solicited-node multicast group for a unicast address
/// (`ff02::1:ffXX:XXXX`, low 24 bits of the target).
pub fn solicited_node(addr: &Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | o[13] as u16,
        ((o[14] as u16) << 8) | o[15] as u16,
    )
}

/// Network mask for an on-link IPv6 prefix length.
pub fn prefix_mask(len: u8) -> Ipv6Addr {
    let len = len.min(128) as u32;
    let bits = if len == 0 { 0 } else { u128::MAX << (128 - len) };
    Ipv6Addr::from(bits)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chip_words_v4_low_bits() {
        let words = chip_words(&IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(&words[..12], &[0u8; 12]);
        assert_eq!(&words[12..], &[0xC0, 0x00, 0x02, 0x01]);
    }

    #[test]
    fn test_chip_words_v6_verbatim() {
        let v6: Ipv6Addr = "2001:db8::42".parse().unwrap();
        assert_eq!(chip_words(&IpAddr::V6(v6)), v6.octets());
    }

    #[test]
    fn test_reserved_addresses() {
        assert!(is_reserved(&IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        assert!(is_reserved(&IpAddr::V4(Ipv4Addr::BROADCAST)));
        assert!(is_reserved(&IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
        assert!(is_reserved(&IpAddr::V6(Ipv6Addr::from(u128::MAX))));
        assert!(!is_reserved(&IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))));
        assert!(!is_reserved(&IpAddr::V6("2001:db8::1".parse().unwrap())));
    }

    #[test]
    fn test_eui64() {
        // RFC 4291 appendix A style vector
        let mac = [0x00, 0x17, 0x88, 0x01, 0x02, 0x03];
        assert_eq!(
            eui64_interface_id(&mac),
            [0x02, 0x17, 0x88, 0xFF, 0xFE, 0x01, 0x02, 0x03]
        );
        let lla = link_local_from_mac(&mac);
        assert_eq!(lla, "fe80::217:88ff:fe01:203".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_merge_prefix() {
        let prefix: Ipv6Addr = "2001:db8:1:2::".parse().unwrap();
        let merged = merge_prefix(&prefix, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(merged, "2001:db8:1:2:102:304:506:708".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_solicited_node() {
        let addr: Ipv6Addr = "fe80::217:88ff:fe01:203".parse().unwrap();
        assert_eq!(
            solicited_node(&addr),
            "ff02::1:ff01:203".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn test_prefix_mask() {
        assert_eq!(prefix_mask(64), "ffff:ffff:ffff:ffff::".parse::<Ipv6Addr>().unwrap());
        assert_eq!(prefix_mask(0), Ipv6Addr::UNSPECIFIED);
        assert_eq!(prefix_mask(128), Ipv6Addr::from(u128::MAX));
    }
}
