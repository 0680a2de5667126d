//! Network interface monitoring.
//!
//! The state machine needs to know when the host loses its links or
//! addresses. The default monitor polls the OS interface table once per
//! tick and reports the difference; tests drive a manual monitor instead.

use std::collections::HashSet;
use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::warn;

/// A change observed on the host's network interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    IpAdded(IpAddr),
    IpRemoved(IpAddr),
    LinkUp(String),
    LinkDown(String),
}

/// Source of interface state for the state machine.
pub trait LinkMonitor {
    /// Collect the changes since the last poll.
    fn poll(&mut self) -> Vec<LinkEvent>;

    /// The non-loopback addresses currently assigned.
    fn addresses(&self) -> Vec<IpAddr>;

    /// Whether any monitored link is up and running.
    fn has_active_link(&self) -> bool;
}

/// Monitor backed by the OS interface table.
#[derive(Debug, Default)]
pub struct SystemLinkMonitor {
    known_addrs: HashSet<IpAddr>,
    known_links: HashSet<String>,
    primed: bool,
}

impl SystemLinkMonitor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinkMonitor for SystemLinkMonitor {
    fn poll(&mut self) -> Vec<LinkEvent> {
        let (addrs, links) = enumerate_interfaces();
        let mut events = Vec::new();

        // The first poll only primes the baseline.
        if !self.primed {
            self.known_addrs = addrs;
            self.known_links = links;
            self.primed = true;
            return events;
        }

        for addr in addrs.difference(&self.known_addrs) {
            events.push(LinkEvent::IpAdded(*addr));
        }
        for addr in self.known_addrs.difference(&addrs) {
            events.push(LinkEvent::IpRemoved(*addr));
        }
        for link in links.difference(&self.known_links) {
            events.push(LinkEvent::LinkUp(link.clone()));
        }
        for link in self.known_links.difference(&links) {
            events.push(LinkEvent::LinkDown(link.clone()));
        }

        self.known_addrs = addrs;
        self.known_links = links;
        events
    }

    fn addresses(&self) -> Vec<IpAddr> {
        enumerate_interfaces().0.into_iter().collect()
    }

    fn has_active_link(&self) -> bool {
        !enumerate_interfaces().1.is_empty()
    }
}

/// Walk the OS interface table. Returns the non-loopback addresses and the
/// names of links that are up and running.
fn enumerate_interfaces() -> (HashSet<IpAddr>, HashSet<String>) {
    let mut addrs = HashSet::new();
    let mut links = HashSet::new();

    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();

    // Safety: getifaddrs allocates the list for us; we walk it without
    // retaining any pointer past the freeifaddrs call.
    unsafe {
        if libc::getifaddrs(&mut ifap) != 0 {
            warn!(target: "wd", "getifaddrs failed: {}", std::io::Error::last_os_error());
            return (addrs, links);
        }

        let mut cursor = ifap;
        while !cursor.is_null() {
            let entry = &*cursor;
            cursor = entry.ifa_next;

            if entry.ifa_flags & libc::IFF_LOOPBACK as libc::c_uint != 0 {
                continue;
            }

            let up = libc::IFF_UP as libc::c_uint | libc::IFF_RUNNING as libc::c_uint;
            if entry.ifa_flags & up == up {
                let name = CStr::from_ptr(entry.ifa_name).to_string_lossy().into_owned();
                links.insert(name);
            }

            if entry.ifa_addr.is_null() {
                continue;
            }
            match (*entry.ifa_addr).sa_family as libc::c_int {
                libc::AF_INET => {
                    let sa = &*(entry.ifa_addr as *const libc::sockaddr_in);
                    addrs.insert(IpAddr::V4(Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr))));
                }
                libc::AF_INET6 => {
                    let sa = &*(entry.ifa_addr as *const libc::sockaddr_in6);
                    addrs.insert(IpAddr::V6(Ipv6Addr::from(sa.sin6_addr.s6_addr)));
                }
                _ => {}
            }
        }
        libc::freeifaddrs(ifap);
    }

    (addrs, links)
}

/// A monitor driven by hand. Used by the state-machine tests and by
/// deployments that disable interface monitoring.
#[derive(Debug, Default)]
pub struct ManualLinkMonitor {
    pub queued: Vec<LinkEvent>,
    pub addrs: Vec<IpAddr>,
    pub link_up: bool,
}

impl ManualLinkMonitor {
    /// A monitor that always reports one healthy link and address.
    pub fn healthy(addr: IpAddr) -> Self {
        Self {
            queued: Vec::new(),
            addrs: vec![addr],
            link_up: true,
        }
    }
}

impl LinkMonitor for ManualLinkMonitor {
    fn poll(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.queued)
    }

    fn addresses(&self) -> Vec<IpAddr> {
        self.addrs.clone()
    }

    fn has_active_link(&self) -> bool {
        self.link_up
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_monitor_drains_its_queue() {
        let mut monitor = ManualLinkMonitor::healthy("10.0.0.1".parse().unwrap());
        monitor
            .queued
            .push(LinkEvent::IpRemoved("10.0.0.1".parse().unwrap()));

        assert_eq!(monitor.poll().len(), 1);
        assert!(monitor.poll().is_empty());
    }
}
