//! Local address enumeration and candidate-address derivation.
//!
//! Contacts store address strings in four forms: MAC addresses, socket
//! addresses, bare IP literals and host names (the latter two optionally
//! with `:port`). MAC entries are expanded into IPv6 link-local (and other
//! same-prefix) candidates by assuming the contact builds its interface
//! identifier with modified EUI-64 the same way our own interface does.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::str::FromStr;

use tracing::{debug, warn};

use crate::connector::ConnectOptions;
use crate::contacts::Contact;

/// Locally-administered placeholder some drivers and VMs report.
const PLACEHOLDER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Universal/local bit of the first MAC octet.
const UL_BIT: u8 = 0x02;

const NEIGHBOR_TABLE_PATH: &str = "/proc/net/arp";

// ── MAC addresses ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0}")]
pub struct InvalidMac(String);

impl MacAddress {
    /// Whether this looks like a real hardware address: not all zero,
    /// unicast, and not the `02:00:00:00:00:00` placeholder.
    pub fn is_plausible(&self) -> bool {
        self.0 != [0; 6] && self.0[0] & 0x01 == 0 && self.0 != PLACEHOLDER_MAC
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl FromStr for MacAddress {
    type Err = InvalidMac;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sep = if s.contains('-') { '-' } else { ':' };
        let mut bytes = [0u8; 6];
        let mut parts = s.split(sep);
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| InvalidMac(s.into()))?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(InvalidMac(s.into()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| InvalidMac(s.into()))?;
        }
        if parts.next().is_some() {
            return Err(InvalidMac(s.into()));
        }
        Ok(MacAddress(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Modified EUI-64 interface identifier for `mac`: U/L bit flipped,
/// `FF FE` inserted in the middle.
pub fn mac_to_eui64_suffix(mac: &MacAddress) -> [u8; 8] {
    let m = mac.0;
    [m[0] ^ UL_BIT, m[1], m[2], 0xff, 0xfe, m[3], m[4], m[5]]
}

/// MAC embedded in an EUI-64 IPv6 address, if bytes 11-12 are `FF FE`.
pub fn eui64_embedded_mac(addr: &Ipv6Addr) -> Option<MacAddress> {
    let o = addr.octets();
    if o[11] != 0xff || o[12] != 0xfe {
        return None;
    }
    Some(MacAddress([o[8] ^ UL_BIT, o[9], o[10], o[13], o[14], o[15]]))
}

/// Replace the interface identifier of `prefix` with the EUI-64 form of `mac`.
pub fn with_eui64_suffix(prefix: &Ipv6Addr, mac: &MacAddress) -> Ipv6Addr {
    let mut o = prefix.octets();
    o[8..].copy_from_slice(&mac_to_eui64_suffix(mac));
    Ipv6Addr::from(o)
}

fn is_link_local_v6(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

// ── Local interfaces ───────────────────────────────────────────────────

/// One address bound to a local interface (or the interface's MAC itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub address: String,
    pub device: String,
    pub multicast: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    /// OS interface index, used as the scope id of link-local candidates.
    pub index: u32,
    pub mac: Option<MacAddress>,
    pub addrs: Vec<IpAddr>,
}

/// Enumerate non-loopback interfaces with their addresses and hardware MAC.
pub fn local_interfaces() -> std::io::Result<Vec<LocalInterface>> {
    let mut by_name: BTreeMap<String, Vec<IpAddr>> = BTreeMap::new();
    for iface in get_if_addrs::get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        by_name.entry(iface.name.clone()).or_default().push(iface.ip());
    }

    Ok(by_name
        .into_iter()
        .map(|(name, addrs)| LocalInterface {
            index: interface_index(&name).unwrap_or(0),
            mac: hardware_mac(&name).filter(MacAddress::is_plausible),
            name,
            addrs,
        })
        .collect())
}

#[cfg(target_os = "linux")]
fn hardware_mac(name: &str) -> Option<MacAddress> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{name}/address")).ok()?;
    raw.trim().parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn hardware_mac(_name: &str) -> Option<MacAddress> {
    None
}

#[cfg(target_os = "linux")]
fn interface_index(name: &str) -> Option<u32> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{name}/ifindex")).ok()?;
    raw.trim().parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn interface_index(_name: &str) -> Option<u32> {
    None
}

/// Flatten interfaces into address entries: the MAC first, then each IP.
pub fn entries_from_interfaces(interfaces: &[LocalInterface]) -> Vec<AddressEntry> {
    let mut entries = Vec::new();
    for iface in interfaces {
        if let Some(mac) = iface.mac {
            entries.push(AddressEntry {
                address: mac.to_string(),
                device: iface.name.clone(),
                multicast: mac.is_multicast(),
            });
        }
        for ip in iface.addrs.iter().filter(|ip| !ip.is_loopback()) {
            entries.push(AddressEntry {
                address: ip.to_string(),
                device: iface.name.clone(),
                multicast: ip.is_multicast(),
            });
        }
    }
    entries
}

/// All local MAC and IP addresses, for display and sharing with contacts.
pub fn collect_local_addresses() -> Vec<AddressEntry> {
    match local_interfaces() {
        Ok(interfaces) => entries_from_interfaces(&interfaces),
        Err(e) => {
            warn!("failed to list network interfaces: {e}");
            Vec::new()
        }
    }
}

/// Derive candidate addresses for a contact MAC from our own EUI-64 addresses.
///
/// Only local IPv6 addresses whose embedded MAC equals the owning
/// interface's hardware MAC are used; for each one the contact's MAC is
/// substituted into the same prefix. Link-local results carry the
/// interface index as scope id.
pub fn derive_from_interfaces(
    interfaces: &[LocalInterface],
    contact_mac: &MacAddress,
    port: u16,
) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for iface in interfaces {
        let Some(hw) = iface.mac else { continue };
        for ip in &iface.addrs {
            let IpAddr::V6(v6) = ip else { continue };
            if eui64_embedded_mac(v6) != Some(hw) {
                continue;
            }
            let derived = with_eui64_suffix(v6, contact_mac);
            let scope = if is_link_local_v6(&derived) { iface.index } else { 0 };
            let addr = SocketAddr::V6(SocketAddrV6::new(derived, port, 0, scope));
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
    }
    out
}

pub fn derive_candidate_addresses(contact_mac: &MacAddress, port: u16) -> Vec<SocketAddr> {
    match local_interfaces() {
        Ok(interfaces) => derive_from_interfaces(&interfaces, contact_mac, port),
        Err(e) => {
            warn!("failed to list network interfaces: {e}");
            Vec::new()
        }
    }
}

// ── Neighbor table ─────────────────────────────────────────────────────

/// IPv4 addresses the kernel ARP table (`/proc/net/arp` format) maps to `mac`.
/// Incomplete entries (flags `0x0`) are skipped.
pub fn parse_neighbor_table(table: &str, mac: &MacAddress) -> Vec<IpAddr> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 4 || cols[2] == "0x0" {
                return None;
            }
            let entry_mac: MacAddress = cols[3].parse().ok()?;
            if entry_mac != *mac {
                return None;
            }
            cols[0].parse().ok()
        })
        .collect()
}

pub fn neighbor_addresses(mac: &MacAddress) -> Vec<IpAddr> {
    match std::fs::read_to_string(NEIGHBOR_TABLE_PATH) {
        Ok(table) => parse_neighbor_table(&table, mac),
        Err(e) => {
            debug!("neighbor table unavailable: {e}");
            Vec::new()
        }
    }
}

// ── Contact addresses ──────────────────────────────────────────────────

/// A stored contact address, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactAddress {
    Mac(MacAddress),
    Socket(SocketAddr),
    Host { host: String, port: u16 },
}

impl ContactAddress {
    /// Classify a stored string. IP literals and host names without a port
    /// get `default_port`.
    pub fn parse(s: &str, default_port: u16) -> Self {
        let s = s.trim();
        if let Ok(mac) = s.parse::<MacAddress>() {
            return ContactAddress::Mac(mac);
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return ContactAddress::Socket(addr);
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return ContactAddress::Socket(SocketAddr::new(ip, default_port));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
                Ok(port) => ContactAddress::Host {
                    host: host.to_string(),
                    port,
                },
                Err(_) => ContactAddress::Host {
                    host: s.to_string(),
                    port: default_port,
                },
            },
            _ => ContactAddress::Host {
                host: s.to_string(),
                port: default_port,
            },
        }
    }
}

/// Resolved socket addresses for one connection attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidates {
    pub addrs: Vec<SocketAddr>,
    /// Host-name entries that failed DNS resolution.
    pub unresolved_hosts: usize,
}

impl Candidates {
    fn push(&mut self, addr: SocketAddr) {
        if !self.addrs.contains(&addr) {
            self.addrs.push(addr);
        }
    }
}

/// Expand every stored address of `contact` into socket addresses, in
/// stored order. Resolution failures are logged and skipped.
pub async fn resolve_candidates(contact: &Contact, opts: &ConnectOptions) -> Candidates {
    let mut out = Candidates::default();
    for stored in &contact.addresses {
        match ContactAddress::parse(stored, opts.port) {
            ContactAddress::Mac(mac) => {
                for addr in derive_candidate_addresses(&mac, opts.port) {
                    out.push(addr);
                }
                if opts.use_neighbor_table {
                    for ip in neighbor_addresses(&mac) {
                        out.push(SocketAddr::new(ip, opts.port));
                    }
                }
            }
            ContactAddress::Socket(addr) => out.push(addr),
            ContactAddress::Host { host, port } => {
                match tokio::net::lookup_host((host.as_str(), port)).await {
                    Ok(addrs) => {
                        for addr in addrs {
                            out.push(addr);
                        }
                    }
                    Err(e) => {
                        debug!(contact = %contact.name, host = %host, "unresolved host: {e}");
                        out.unresolved_hosts += 1;
                    }
                }
            }
        }
    }
    out
}

/// Socket addresses for all of a contact's stored addresses.
pub async fn resolve_contact_addresses(contact: &Contact, opts: &ConnectOptions) -> Vec<SocketAddr> {
    resolve_candidates(contact, opts).await.addrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use peercall_crypto::IdentityKeyPair;
    use std::time::Duration;

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn eui64_iface() -> LocalInterface {
        LocalInterface {
            name: "wlan0".into(),
            index: 3,
            mac: Some(mac("a8:aa:aa:aa:0a:aa")),
            addrs: vec![
                "192.168.1.20".parse().unwrap(),
                "fe80::aaaa:aaff:feaa:aaa".parse().unwrap(),
            ],
        }
    }

    #[test]
    fn mac_parse_and_display() {
        assert_eq!(mac("AA-BB-CC-00-11-22").to_string(), "aa:bb:cc:00:11:22");
        assert_eq!(mac("aa:bb:cc:00:11:22").0, [0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]);
        assert!("aa:bb:cc:00:11".parse::<MacAddress>().is_err());
        assert!("aa:bb:cc:00:11:22:33".parse::<MacAddress>().is_err());
        assert!("aab:bb:cc:00:11:2".parse::<MacAddress>().is_err());
        assert!("fe80::1".parse::<MacAddress>().is_err());
    }

    #[test]
    fn plausible_hardware_addresses() {
        assert!(mac("a8:aa:aa:aa:0a:aa").is_plausible());
        assert!(!mac("00:00:00:00:00:00").is_plausible());
        assert!(!mac("02:00:00:00:00:00").is_plausible());
        assert!(!mac("01:00:5e:00:00:01").is_plausible());
    }

    #[test]
    fn eui64_roundtrip() {
        let m = mac("bb:bb:bb:bb:bb:bb");
        assert_eq!(
            mac_to_eui64_suffix(&m),
            [0xb9, 0xbb, 0xbb, 0xff, 0xfe, 0xbb, 0xbb, 0xbb]
        );
        let addr = with_eui64_suffix(&"fe80::".parse().unwrap(), &m);
        assert_eq!(eui64_embedded_mac(&addr), Some(m));
        assert_eq!(eui64_embedded_mac(&"fe80::1".parse().unwrap()), None);
    }

    #[test]
    fn derives_link_local_candidate_for_contact_mac() {
        let derived = derive_from_interfaces(&[eui64_iface()], &mac("bb:bb:bb:bb:bb:bb"), 10001);
        let expected: Ipv6Addr = "fe80::b9bb:bbff:febb:bbbb".parse().unwrap();
        assert_eq!(
            derived,
            vec![SocketAddr::V6(SocketAddrV6::new(expected, 10001, 0, 3))]
        );
    }

    #[test]
    fn no_candidate_when_embedded_mac_differs_from_hardware_mac() {
        let mut iface = eui64_iface();
        // Privacy/random interface identifiers do not embed the hardware MAC.
        iface.mac = Some(mac("a8:aa:aa:aa:0a:ab"));
        assert!(derive_from_interfaces(&[iface], &mac("bb:bb:bb:bb:bb:bb"), 10001).is_empty());

        let mut iface = eui64_iface();
        iface.mac = None;
        assert!(derive_from_interfaces(&[iface], &mac("bb:bb:bb:bb:bb:bb"), 10001).is_empty());
    }

    #[test]
    fn global_prefix_gets_no_scope_id() {
        let mut iface = eui64_iface();
        iface.addrs = vec!["2001:db8::aaaa:aaff:feaa:aaa".parse().unwrap()];
        let derived = derive_from_interfaces(&[iface], &mac("bb:bb:bb:bb:bb:bb"), 7);
        match derived.as_slice() {
            [SocketAddr::V6(v6)] => {
                assert_eq!(v6.ip(), &"2001:db8::b9bb:bbff:febb:bbbb".parse::<Ipv6Addr>().unwrap());
                assert_eq!(v6.scope_id(), 0);
                assert_eq!(v6.port(), 7);
            }
            other => panic!("unexpected candidates {other:?}"),
        }
    }

    #[test]
    fn entries_list_mac_then_ips() {
        let entries = entries_from_interfaces(&[eui64_iface()]);
        let addrs: Vec<&str> = entries.iter().map(|e| e.address.as_str()).collect();
        assert_eq!(addrs, vec!["a8:aa:aa:aa:0a:aa", "192.168.1.20", "fe80::aaaa:aaff:feaa:aaa"]);
        assert!(entries.iter().all(|e| e.device == "wlan0" && !e.multicast));
    }

    #[test]
    fn neighbor_table_lookup() {
        let table = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         bb:bb:bb:bb:bb:bb     *        wlan0
192.168.1.7      0x1         0x0         bb:bb:bb:bb:bb:bb     *        wlan0
192.168.1.9      0x1         0x2         cc:cc:cc:cc:cc:cc     *        wlan0
";
        let found = parse_neighbor_table(table, &mac("bb:bb:bb:bb:bb:bb"));
        assert_eq!(found, vec!["192.168.1.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn classify_stored_addresses() {
        assert_eq!(
            ContactAddress::parse("aa:bb:cc:dd:ee:ff", 10001),
            ContactAddress::Mac(mac("aa:bb:cc:dd:ee:ff"))
        );
        assert_eq!(
            ContactAddress::parse("10.0.0.2", 10001),
            ContactAddress::Socket("10.0.0.2:10001".parse().unwrap())
        );
        assert_eq!(
            ContactAddress::parse("10.0.0.2:4000", 10001),
            ContactAddress::Socket("10.0.0.2:4000".parse().unwrap())
        );
        assert_eq!(
            ContactAddress::parse("fe80::1", 10001),
            ContactAddress::Socket("[fe80::1]:10001".parse().unwrap())
        );
        assert_eq!(
            ContactAddress::parse("[fe80::1]:5", 10001),
            ContactAddress::Socket("[fe80::1]:5".parse().unwrap())
        );
        assert_eq!(
            ContactAddress::parse("bob.lan:4000", 10001),
            ContactAddress::Host {
                host: "bob.lan".into(),
                port: 4000
            }
        );
        assert_eq!(
            ContactAddress::parse("bob.lan", 10001),
            ContactAddress::Host {
                host: "bob.lan".into(),
                port: 10001
            }
        );
    }

    #[tokio::test]
    async fn resolution_keeps_order_and_skips_failures() {
        let contact = Contact::new(
            "bob",
            IdentityKeyPair::generate().public_key(),
            vec![
                "10.0.0.2".into(),
                "no-such-host.invalid".into(),
                "127.0.0.1:4000".into(),
                "10.0.0.2:10001".into(),
            ],
        );
        let opts = ConnectOptions {
            port: 10001,
            timeout: Duration::from_millis(100),
            use_neighbor_table: false,
        };
        let candidates = resolve_candidates(&contact, &opts).await;
        assert_eq!(
            candidates.addrs,
            vec![
                "10.0.0.2:10001".parse::<SocketAddr>().unwrap(),
                "127.0.0.1:4000".parse().unwrap(),
            ]
        );
        assert_eq!(candidates.unresolved_hosts, 1);
    }
}
