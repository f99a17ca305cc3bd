//! Driver configuration.
//!
//! The configuration store hands the driver one JSON object per NAT
//! instance. Keys are validated against a fixed allow-list; anything else
//! is a hard configuration error. The `Network` CIDR is required and the
//! virtual topology (gateway, nameserver, DHCP range, IPv6 prefix) is
//! derived from it here.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::Ipv4Net;
use serde_json::Value;

use crate::engine::EngineConfig;
use crate::error::NatError;

/// Top-level keys accepted by the driver.
const ALLOWED_KEYS: &[&str] = &[
    "PassDomain",
    "TFTPPrefix",
    "BootFile",
    "Network",
    "NextServer",
    "DNSProxy",
    "BindIP",
    "UseHostResolver",
    "SlirpMTU",
    "AliasMode",
    "SockRcv",
    "SockSnd",
    "TcpRcv",
    "TcpSnd",
    "ICMPCacheLimit",
    "SoMaxConnection",
    "LocalhostReachable",
    "HostResolverMappings",
    "PortForwarding",
];

/// Keys accepted inside one port-forwarding rule.
const ALLOWED_RULE_KEYS: &[&str] = &[
    "Name",
    "Protocol",
    "UDP",
    "HostPort",
    "GuestPort",
    "GuestIP",
    "BindIP",
];

/// One pinned host-to-guest port mapping configured at construction.
#[derive(Debug, Clone)]
pub struct PortForwardRule {
    pub name: Option<String>,
    pub udp: bool,
    pub host_port: i32,
    pub guest_port: i32,
    /// Host address to listen on. Missing or unparseable strings collapse
    /// to the wildcard address.
    pub bind_ip: Ipv4Addr,
    /// Guest address to forward to; wildcard when absent. (The runtime
    /// command path instead defaults to the configured guest address.)
    pub guest_ip: Ipv4Addr,
}

/// Parsed, validated driver configuration.
#[derive(Debug, Clone)]
pub struct NatConfig {
    pub pass_domain: bool,
    pub tftp_prefix: Option<String>,
    pub boot_file: Option<String>,
    pub next_server: Option<String>,
    pub network: Ipv4Net,
    pub dns_proxy: i32,
    pub bind_ip: Option<Ipv4Addr>,
    pub use_host_resolver: bool,
    pub mtu: i32,
    pub alias_mode: i32,
    pub sock_rcv: Option<i32>,
    pub sock_snd: Option<i32>,
    pub tcp_rcv: Option<i32>,
    pub tcp_snd: Option<i32>,
    pub icmp_cache_limit: i32,
    pub so_max_connections: i32,
    pub localhost_reachable: bool,
    pub port_forwards: Vec<PortForwardRule>,
}

impl NatConfig {
    /// Parse and validate a configuration node.
    pub fn from_value(node: &Value) -> Result<Self, NatError> {
        let obj = node
            .as_object()
            .ok_or_else(|| NatError::Config("configuration node is not an object".into()))?;

        for key in obj.keys() {
            if !ALLOWED_KEYS.contains(&key.as_str()) {
                return Err(NatError::Config(format!("unknown configuration key \"{key}\"")));
            }
        }

        let network_str = get_string(obj, "Network")?
            .ok_or_else(|| NatError::Config("missing \"Network\"".into()))?;
        let network: Ipv4Net = network_str.parse().map_err(|_| {
            NatError::Config(format!("\"{network_str}\" is not a valid IPv4 network"))
        })?;

        let port_forwards = match obj.get("PortForwarding") {
            None => Vec::new(),
            Some(pf) => parse_port_forwards(pf)?,
        };

        Ok(NatConfig {
            pass_domain: get_bool(obj, "PassDomain")?.unwrap_or(true),
            tftp_prefix: get_string(obj, "TFTPPrefix")?,
            boot_file: get_string(obj, "BootFile")?,
            next_server: get_string(obj, "NextServer")?,
            network,
            dns_proxy: get_i32(obj, "DNSProxy")?.unwrap_or(0),
            bind_ip: get_string(obj, "BindIP")?.and_then(|s| s.parse().ok()),
            use_host_resolver: get_bool(obj, "UseHostResolver")?.unwrap_or(false),
            mtu: get_i32(obj, "SlirpMTU")?.unwrap_or(1500),
            alias_mode: get_i32(obj, "AliasMode")?.unwrap_or(0),
            sock_rcv: get_i32(obj, "SockRcv")?,
            sock_snd: get_i32(obj, "SockSnd")?,
            tcp_rcv: get_i32(obj, "TcpRcv")?,
            tcp_snd: get_i32(obj, "TcpSnd")?,
            icmp_cache_limit: get_i32(obj, "ICMPCacheLimit")?.unwrap_or(100),
            so_max_connections: get_i32(obj, "SoMaxConnection")?.unwrap_or(10),
            localhost_reachable: get_bool(obj, "LocalhostReachable")?.unwrap_or(false),
            port_forwards,
        })
    }

    /// Derive the engine configuration from the parsed settings.
    pub fn engine_config(&self) -> EngineConfig {
        let net = u32::from(self.network.network());
        let vhost = Ipv4Addr::from(net | 2);
        let vnameserver = Ipv4Addr::from(net | 3);
        let vdhcp_start = Ipv4Addr::from(net | 15);

        // RFC 4193 ULA prefix with the middle two bytes of the IPv4
        // addresses as the 16-bit subnet id, e.g. fd17:625c:f037:0002::
        // for a 10.0.2.0/24 network.
        let vprefix_addr6 = patch_subnet_id(
            Ipv6Addr::new(0xfd17, 0x625c, 0xf037, 0, 0, 0, 0, 0),
            vhost,
        );
        let vhost6 = patch_subnet_id(
            Ipv6Addr::new(0xfd17, 0x625c, 0xf037, 0, 0, 0, 0, 2),
            vhost,
        );
        let vnameserver6 = patch_subnet_id(
            Ipv6Addr::new(0xfd17, 0x625c, 0xf037, 0, 0, 0, 0, 3),
            vnameserver,
        );

        let m = self.alias_mode;
        let alias_mode = (if m & 0x1 != 0 { 0x1 } else { 0 })
            | (if m & 0x2 != 0 { 0x40 } else { 0 })
            | (if m & 0x4 != 0 { 0x4 } else { 0 });

        EngineConfig {
            restricted: false,
            in_enabled: true,
            vnetwork: self.network.network(),
            vnetmask: self.network.netmask(),
            vhost,
            vdhcp_start,
            vnameserver,
            in6_enabled: true,
            vprefix_addr6,
            vprefix_len: 64,
            vhost6,
            vnameserver6,
            vhostname: String::from("vbox"),
            tftp_server_name: self.next_server.clone(),
            tftp_path: self.tftp_prefix.clone(),
            bootfile: self.boot_file.clone(),
            vdomainname: None,
            vdnssearch: Vec::new(),
            if_mtu: self.mtu.max(0) as u32,
            pass_domain: self.pass_domain,
            dns_proxy: self.dns_proxy != 0,
            use_host_resolver: self.use_host_resolver,
            bind_ip: self.bind_ip,
            alias_mode,
            sock_rcv: self.sock_rcv,
            sock_snd: self.sock_snd,
            tcp_rcv: self.tcp_rcv,
            tcp_snd: self.tcp_snd,
            icmp_cache_limit: self.icmp_cache_limit,
            so_max_connections: self.so_max_connections,
            localhost_reachable: self.localhost_reachable,
        }
    }
}

/// Copy the middle two bytes of an IPv4 address into bytes 6-7 of an IPv6
/// address (the ULA subnet id).
fn patch_subnet_id(addr: Ipv6Addr, v4: Ipv4Addr) -> Ipv6Addr {
    let mut octets = addr.octets();
    let v4 = v4.octets();
    octets[6] = v4[1];
    octets[7] = v4[2];
    Ipv6Addr::from(octets)
}

fn parse_port_forwards(node: &Value) -> Result<Vec<PortForwardRule>, NatError> {
    let rules = node
        .as_array()
        .ok_or_else(|| NatError::Config("\"PortForwarding\" is not a list".into()))?;

    rules.iter().map(parse_rule).collect()
}

fn parse_rule(node: &Value) -> Result<PortForwardRule, NatError> {
    let obj = node
        .as_object()
        .ok_or_else(|| NatError::Config("port forwarding rule is not an object".into()))?;

    for key in obj.keys() {
        if !ALLOWED_RULE_KEYS.contains(&key.as_str()) {
            return Err(NatError::Config(format!(
                "unknown key \"{key}\" in port forwarding rule"
            )));
        }
    }

    // Protocol string wins over the boolean UDP flag when present.
    let udp = match get_string(obj, "Protocol")? {
        Some(proto) => {
            if proto.eq_ignore_ascii_case("TCP") {
                false
            } else if proto.eq_ignore_ascii_case("UDP") {
                true
            } else {
                return Err(NatError::Config(format!(
                    "invalid value for \"Protocol\": \"{proto}\""
                )));
            }
        }
        None => get_bool(obj, "UDP")?.unwrap_or(false),
    };

    let host_port = get_i32(obj, "HostPort")?
        .ok_or_else(|| NatError::Config("port forwarding rule is missing \"HostPort\"".into()))?;
    let guest_port = get_i32(obj, "GuestPort")?
        .ok_or_else(|| NatError::Config("port forwarding rule is missing \"GuestPort\"".into()))?;

    Ok(PortForwardRule {
        name: get_string(obj, "Name")?,
        udp,
        host_port,
        guest_port,
        bind_ip: ip_or_any(get_string(obj, "BindIP")?),
        guest_ip: ip_or_any(get_string(obj, "GuestIP")?),
    })
}

/// Missing or unparseable addresses collapse to the wildcard.
fn ip_or_any(s: Option<String>) -> Ipv4Addr {
    s.and_then(|s| s.parse().ok())
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}

type Obj = serde_json::Map<String, Value>;

fn get_bool(obj: &Obj, key: &str) -> Result<Option<bool>, NatError> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(NatError::Config(format!("\"{key}\" is not a boolean"))),
    }
}

fn get_i32(obj: &Obj, key: &str) -> Result<Option<i32>, NatError> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::Number(n)) => {
            let v = n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| NatError::Config(format!("\"{key}\" is out of range")))?;
            Ok(Some(v))
        }
        Some(_) => Err(NatError::Config(format!("\"{key}\" is not an integer"))),
    }
}

fn get_string(obj: &Obj, key: &str) -> Result<Option<String>, NatError> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(NatError::Config(format!("\"{key}\" is not a string"))),
    }
}
