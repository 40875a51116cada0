use std::collections::HashMap;

use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceInfo};

use crate::model::ServiceAnnouncement;

/// Handle so the service stays registered while this is alive. Dropping it
/// withdraws the announcement and stops the daemon.
pub struct Announcer {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Announcer {
    pub fn register(ann: ServiceAnnouncement) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;

        let txt: HashMap<String, String> = ann.txt.0.into_iter().collect();
        let service_type = ann.service.service_type();
        let host_name = ensure_dot(&ann.host_name);
        let ip = ann.ip_addr.to_string();

        let info = ServiceInfo::new(
            &service_type,
            &ann.instance_name,
            &host_name,
            ip.as_str(),
            ann.port,
            txt,
        )?;
        let fullname = info.get_fullname().to_string();

        daemon.register(info)?;
        tracing::info!("Registered {} on {}:{}", fullname, ip, ann.port);
        Ok(Self { daemon, fullname })
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            tracing::debug!("Unregister of {} failed: {}", self.fullname, e);
        }
        let _ = self.daemon.shutdown();
        tracing::debug!("Withdrew {}", self.fullname);
    }
}

/// mdns-sd expects fully qualified names with a trailing dot.
pub(crate) fn ensure_dot(s: &str) -> String {
    if s.ends_with('.') {
        s.to_string()
    } else {
        format!("{}.", s)
    }
}

/// Host label derived from a display name, e.g. "Studio iPad" -> "studio-ipad.local."
pub fn host_label(display_name: &str) -> String {
    let mut label: String = display_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    label = label.trim_matches('-').to_string();
    if label.is_empty() {
        label = "capshare".to_string();
    }
    format!("{}.local.", label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_dot() {
        assert_eq!(ensure_dot("host.local"), "host.local.");
        assert_eq!(ensure_dot("host.local."), "host.local.");
    }

    #[test]
    fn test_host_label() {
        assert_eq!(host_label("Studio iPad"), "studio-ipad.local.");
        assert_eq!(host_label("  "), "capshare.local.");
    }
}
