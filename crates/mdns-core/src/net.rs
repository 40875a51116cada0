use std::io::Error;
use std::net::IpAddr;

use crate::model::InterfaceIp;

pub fn list_interface_ips_result() -> Result<Vec<InterfaceIp>, Error> {
    let ifs = if_addrs::get_if_addrs()?;

    let mut out: Vec<InterfaceIp> = ifs
        .into_iter()
        .map(|ifa| {
            let ip = ifa.ip();
            let family = if ip.is_ipv4() { "ipv4" } else { "ipv6" };
            InterfaceIp {
                is_loopback: ip.is_loopback(),
                name: ifa.name,
                ip,
                family,
            }
        })
        .collect();

    out.sort_by(|a, b| (&a.name, &a.ip).cmp(&(&b.name, &b.ip)));
    out.dedup_by(|a, b| a.name == b.name && a.ip == b.ip);
    Ok(out)
}

/// Address to advertise on: the first IPv4 address of `interface` when one is
/// named, otherwise the first non-loopback IPv4 address, falling back to
/// loopback so a single host can still talk to itself.
pub fn advertise_ip(interface: Option<&str>) -> Result<IpAddr, Error> {
    let ips = list_interface_ips_result()?;
    pick_ip(&ips, interface).ok_or_else(|| {
        Error::new(
            std::io::ErrorKind::NotFound,
            match interface {
                Some(name) => format!("no usable address on interface {}", name),
                None => "no usable network interface".to_string(),
            },
        )
    })
}

fn pick_ip(ips: &[InterfaceIp], interface: Option<&str>) -> Option<IpAddr> {
    let candidates = ips
        .iter()
        .filter(|i| interface.map_or(true, |name| i.name == name));
    let mut best: Option<&InterfaceIp> = None;
    for ip in candidates {
        let rank = |i: &InterfaceIp| (i.is_loopback, i.family != "ipv4");
        if best.map_or(true, |b| rank(ip) < rank(b)) {
            best = Some(ip);
        }
    }
    best.map(|i| i.ip)
}
