use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceIdError {
    #[error("service id must be 1 to 15 characters, got {0}")]
    Length(usize),
    #[error("service id may only hold lowercase letters, digits and '-': {0:?}")]
    Charset(String),
    #[error("service id must not begin or end with '-': {0:?}")]
    Hyphen(String),
}

/// Short protocol name that scopes discovery, e.g. `capshare`.
///
/// Peers only see each other when they use the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(String);

impl ServiceId {
    pub fn parse(s: &str) -> Result<Self, ServiceIdError> {
        if s.is_empty() || s.len() > 15 {
            return Err(ServiceIdError::Length(s.len()));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(ServiceIdError::Charset(s.to_string()));
        }
        if s.starts_with('-') || s.ends_with('-') {
            return Err(ServiceIdError::Hyphen(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// DNS-SD service type, e.g. `_capshare._tcp.local.`
    pub fn service_type(&self) -> String {
        format!("_{}._tcp.local.", self.0)
    }
}

impl FromStr for ServiceId {
    type Err = ServiceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServiceId {
    type Error = ServiceIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ServiceId> for String {
    fn from(id: ServiceId) -> String {
        id.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxtRecord(pub Vec<(String, String)>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    pub service: ServiceId,
    /// e.g. "Studio iPad"
    pub instance_name: String,
    /// e.g. "studio-ipad.local."
    pub host_name: String,
    pub ip_addr: IpAddr,
    pub port: u16,
    pub txt: TxtRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub fullname: String,
    pub instance_name: String,
    pub host_name: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub txt: Vec<(String, String)>,
}

impl DiscoveredService {
    pub fn txt_value(&self, key: &str) -> Option<&str> {
        self.txt
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Socket addresses to try, IPv4 first.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self
            .addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.port))
            .collect();
        addrs.sort_by_key(|a| !a.is_ipv4());
        addrs
    }
}

/// What a running browse reports.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Found(DiscoveredService),
    Lost { fullname: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceIp {
    pub name: String,
    pub ip: IpAddr,
    pub family: &'static str, // ipv4 or ipv6
    pub is_loopback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id_rules() {
        assert!(ServiceId::parse("capshare").is_ok());
        assert!(ServiceId::parse("scan-2").is_ok());
        assert!(ServiceId::parse("a").is_ok());
        assert!(ServiceId::parse("exactly15chars-").is_err());
        assert_eq!(
            ServiceId::parse("").unwrap_err(),
            ServiceIdError::Length(0)
        );
        assert_eq!(
            ServiceId::parse("sixteen-chars-xx").unwrap_err(),
            ServiceIdError::Length(16)
        );
        assert!(matches!(
            ServiceId::parse("CapShare"),
            Err(ServiceIdError::Charset(_))
        ));
        assert!(matches!(
            ServiceId::parse("cap_share"),
            Err(ServiceIdError::Charset(_))
        ));
        assert!(matches!(
            ServiceId::parse("-cap"),
            Err(ServiceIdError::Hyphen(_))
        ));
    }

    #[test]
    fn test_service_type() {
        let id = ServiceId::parse("capshare").unwrap();
        assert_eq!(id.service_type(), "_capshare._tcp.local.");
    }

    #[test]
    fn test_service_id_serde_validates() {
        let id: ServiceId = serde_json::from_str("\"scan\"").unwrap();
        assert_eq!(id.as_str(), "scan");
        assert!(serde_json::from_str::<ServiceId>("\"Not Valid\"").is_err());
    }

    #[test]
    fn test_socket_addrs_prefer_ipv4() {
        let svc = DiscoveredService {
            fullname: "x._capshare._tcp.local.".into(),
            instance_name: "x".into(),
            host_name: "x.local.".into(),
            port: 7000,
            addresses: vec!["fe80::1".parse().unwrap(), "192.168.1.4".parse().unwrap()],
            txt: vec![("fp".into(), "abcd".into())],
        };
        let addrs = svc.socket_addrs();
        assert!(addrs[0].is_ipv4());
        assert_eq!(addrs[0].port(), 7000);
        assert_eq!(svc.txt_value("fp"), Some("abcd"));
        assert_eq!(svc.txt_value("name"), None);
    }
}
