//! Local host identity: hostname and primary IP address

use std::net::IpAddr;

use nix::ifaddrs::getifaddrs;
use tracing::debug;

use crate::{Error, Result};

const PROC_NET_ROUTE: &str = "/proc/net/route";

/// Hostname and IP this process observes on the local machine
///
/// The IP is the IPv4 address of the default-route interface. An IPv6
/// address is used only when that interface has no usable IPv4 address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostIdentity {
    /// Lower-cased hostname
    pub hostname: String,
    /// Primary address, IPv4 dotted or IPv6 text form
    pub ip: String,
}

impl HostIdentity {
    /// Build an identity from known values, lower-casing the hostname
    pub fn new(hostname: impl AsRef<str>, ip: impl Into<String>) -> Self {
        Self {
            hostname: hostname.as_ref().to_lowercase(),
            ip: ip.into(),
        }
    }

    /// Read the hostname and the address of the default-route interface.
    ///
    /// Falls back to the first usable interface address when the route table
    /// has no default entry.
    pub fn detect() -> Result<Self> {
        let hostname = nix::unistd::gethostname()
            .map_err(|e| Error::host_identity(format!("gethostname: {}", e)))?
            .into_string()
            .map_err(|raw| Error::host_identity(format!("hostname is not UTF-8: {:?}", raw)))?;

        let iface = match std::fs::read_to_string(PROC_NET_ROUTE) {
            Ok(contents) => parse_default_route_interface(&contents),
            Err(e) => {
                debug!(error = %e, "Route table unavailable, using first usable interface");
                None
            }
        };

        let ip = interface_address(iface.as_deref())?;
        debug!(hostname = %hostname, ip = %ip, interface = ?iface, "Detected host identity");
        Ok(Self::new(hostname, ip.to_string()))
    }
}

/// Interface carrying the default IPv4 route in `/proc/net/route` content.
///
/// Among several default routes the one with the lowest metric wins.
pub fn parse_default_route_interface(contents: &str) -> Option<String> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let (iface, destination, metric, mask) = (fields[0], fields[1], fields[6], fields[7]);
            if destination != "00000000" || mask != "00000000" {
                return None;
            }
            let metric = metric.parse::<u32>().unwrap_or(u32::MAX);
            Some((metric, iface.to_string()))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, iface)| iface)
}

fn interface_address(iface: Option<&str>) -> Result<IpAddr> {
    let addrs = getifaddrs().map_err(|e| Error::host_identity(format!("getifaddrs: {}", e)))?;

    let candidates: Vec<(String, IpAddr)> = addrs
        .filter_map(|ifaddr| {
            let addr = ifaddr.address.as_ref()?;
            let ip = match (addr.as_sockaddr_in(), addr.as_sockaddr_in6()) {
                (Some(v4), _) => IpAddr::V4(v4.ip()),
                (None, Some(v6)) => IpAddr::V6(v6.ip()),
                (None, None) => return None,
            };
            Some((ifaddr.interface_name, ip))
        })
        .collect();

    pick_address(&candidates, iface).ok_or_else(|| {
        Error::host_identity(match iface {
            Some(name) => format!("no usable address on default route interface {}", name),
            None => "no usable interface address found".to_string(),
        })
    })
}

fn is_usable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_unspecified() && !v4.is_link_local(),
        // fe80::/10 is link-local
        IpAddr::V6(v6) => {
            !v6.is_loopback() && !v6.is_unspecified() && (v6.segments()[0] & 0xffc0) != 0xfe80
        }
    }
}

/// Address of `iface` (or of any interface when `None`), IPv4 first
fn pick_address(candidates: &[(String, IpAddr)], iface: Option<&str>) -> Option<IpAddr> {
    let usable = || {
        candidates
            .iter()
            .filter(|(name, ip)| iface.map_or(true, |i| i == name) && is_usable(ip))
            .map(|(_, ip)| *ip)
    };
    usable()
        .find(IpAddr::is_ipv4)
        .or_else(|| usable().next())
}
