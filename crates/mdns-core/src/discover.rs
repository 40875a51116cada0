use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;

use crate::model::{DiscoveredService, DiscoveryEvent, ServiceId};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A running browse for one service type.
///
/// Events are forwarded from the mDNS daemon on a dedicated thread. Dropping
/// the browser stops the browse, shuts the daemon down and joins the thread.
pub struct Browser {
    daemon: ServiceDaemon,
    service_type: String,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Browser {
    pub fn start(service: &ServiceId) -> Result<(Self, mpsc::UnboundedReceiver<DiscoveryEvent>)> {
        let daemon = ServiceDaemon::new()?;
        let service_type = service.service_type();
        let receiver = daemon.browse(&service_type)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));

        let stop_flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name("mdns-browse".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    let event = match receiver.recv_timeout(POLL_INTERVAL) {
                        Ok(event) => event,
                        Err(_) if receiver.is_disconnected() => break,
                        Err(_) => continue,
                    };
                    let forwarded = match event {
                        ServiceEvent::ServiceResolved(info) => {
                            tx.send(DiscoveryEvent::Found(to_discovered(&info)))
                        }
                        ServiceEvent::ServiceRemoved(_, fullname) => {
                            tx.send(DiscoveryEvent::Lost { fullname })
                        }
                        other => {
                            tracing::trace!("mDNS event: {:?}", other);
                            Ok(())
                        }
                    };
                    if forwarded.is_err() {
                        break;
                    }
                }
                tracing::debug!("Browse thread stopped");
            })?;

        tracing::info!("Browsing for {}", service_type);
        Ok((
            Self {
                daemon,
                service_type,
                stop,
                thread: Some(thread),
            },
            rx,
        ))
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.daemon.stop_browse(&self.service_type);
        let _ = self.daemon.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        tracing::info!("Stopped browsing for {}", self.service_type);
    }
}

/// Browse for `timeout` and return what is still visible at the end.
pub fn browse_blocking(service: &ServiceId, timeout: Duration) -> Result<Vec<DiscoveredService>> {
    let daemon = ServiceDaemon::new()?;
    let service_type = service.service_type();
    let receiver = daemon.browse(&service_type)?;
    let mut out: Vec<DiscoveredService> = Vec::new();

    let start = Instant::now();
    while start.elapsed() < timeout {
        let Ok(event) = receiver.recv_timeout(POLL_INTERVAL) else {
            continue;
        };
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let svc = to_discovered(&info);
                out.retain(|s| s.fullname != svc.fullname);
                out.push(svc);
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                out.retain(|s| s.fullname != fullname);
            }
            _ => {}
        }
    }

    let _ = daemon.stop_browse(&service_type);
    let _ = daemon.shutdown();
    Ok(out)
}

fn to_discovered(info: &ServiceInfo) -> DiscoveredService {
    let txt = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect::<Vec<_>>();

    let fullname = info.get_fullname().to_string();
    DiscoveredService {
        instance_name: instance_of(&fullname, info.get_type()),
        fullname,
        host_name: info.get_hostname().to_string(),
        port: info.get_port(),
        addresses: info.get_addresses().iter().copied().collect(),
        txt,
    }
}

/// Instance label of a full service name, e.g.
/// `Studio._capshare._tcp.local.` -> `Studio`.
fn instance_of(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_of() {
        assert_eq!(
            instance_of("Studio iPad._capshare._tcp.local.", "_capshare._tcp.local."),
            "Studio iPad"
        );
        assert_eq!(instance_of("odd-name", "_capshare._tcp.local."), "odd-name");
    }
}
