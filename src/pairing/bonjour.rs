// Jackson Coxson

use std::collections::HashSet;

use log::trace;

/// A service discovered through an mDNS browse
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredService {
    pub name: String,
    pub service_type: String,
    pub domain: String,
    pub interface_index: u32,
}

/// Discovery event parsed from one browse line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Added(DiscoveredService),
    Removed(DiscoveredService),
}

/// Tracks Apple-TV advertisements by parsing the textual output of the
/// host's mDNS browse tool (`dns-sd -B` and compatible)
///
/// Feed it output lines; it emits add/remove events and maintains the set
/// of currently visible services keyed by (name, type, domain, interface).
#[derive(Debug, Default)]
pub struct BonjourBrowser {
    services: HashSet<DiscoveredService>,
}

impl BonjourBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one line of browse output
    ///
    /// Header, banner and malformed lines yield `None`. An Add for an
    /// already-known service and an Rmv for an unknown one are absorbed
    /// without an event.
    pub fn handle_line(&mut self, line: &str) -> Option<ServiceEvent> {
        let (service, added) = parse_browse_line(line)?;
        if added {
            if self.services.insert(service.clone()) {
                Some(ServiceEvent::Added(service))
            } else {
                trace!("Duplicate add for {service:?}");
                None
            }
        } else if self.services.remove(&service) {
            Some(ServiceEvent::Removed(service))
        } else {
            trace!("Remove for unknown service {service:?}");
            None
        }
    }

    /// Services currently visible
    pub fn services(&self) -> impl Iterator<Item = &DiscoveredService> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Parses a browse line of the shape
/// `14:20:05.689  Add  2  6 local. _remotepairing._tcp. InstanceName`
///
/// Returns the service and whether the line was an add.
fn parse_browse_line(line: &str) -> Option<(DiscoveredService, bool)> {
    let mut fields = line.split_whitespace();
    let timestamp = fields.next()?;
    // Timestamps look like 14:20:05.689; anything else is a banner line
    if timestamp.split(':').count() != 3 {
        return None;
    }

    let added = match fields.next()? {
        "Add" => true,
        "Rmv" => false,
        _ => return None,
    };
    let _flags: u32 = fields.next()?.parse().ok()?;
    let interface_index: u32 = fields.next()?.parse().ok()?;
    let domain = fields.next()?.to_string();
    let service_type = fields.next()?.to_string();
    // Instance names may contain spaces
    let name = fields.collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return None;
    }

    Some((
        DiscoveredService {
            name,
            service_type,
            domain,
            interface_index,
        },
        added,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROWSE_OUTPUT: &str = "\
Browsing for _remotepairing._tcp
DATE: ---Fri 18 Apr 2025---
14:20:05.688  ...STARTING...
Timestamp     A/R    Flags  if Domain               Service Type         Instance Name
14:20:05.689  Add        2   6 local.               _remotepairing._tcp. 75EC4A395619
14:20:05.690  Add        2   7 local.               _remotepairing._tcp. 75EC4A395619
14:20:06.120  Add        2   6 local.               _remotepairing._tcp. Living Room
";

    #[test]
    fn parses_browse_output() {
        let mut browser = BonjourBrowser::new();
        let events: Vec<ServiceEvent> = BROWSE_OUTPUT
            .lines()
            .filter_map(|line| browser.handle_line(line))
            .collect();

        assert_eq!(events.len(), 3);
        assert_eq!(browser.len(), 3);
        match &events[0] {
            ServiceEvent::Added(s) => {
                assert_eq!(s.name, "75EC4A395619");
                assert_eq!(s.service_type, "_remotepairing._tcp.");
                assert_eq!(s.domain, "local.");
                assert_eq!(s.interface_index, 6);
            }
            other => panic!("expected add, got {other:?}"),
        }
        match &events[2] {
            ServiceEvent::Added(s) => assert_eq!(s.name, "Living Room"),
            other => panic!("expected add, got {other:?}"),
        }
    }

    #[test]
    fn same_name_on_two_interfaces_is_two_services() {
        let mut browser = BonjourBrowser::new();
        for line in BROWSE_OUTPUT.lines() {
            browser.handle_line(line);
        }
        let on_six = browser
            .services()
            .filter(|s| s.name == "75EC4A395619")
            .count();
        assert_eq!(on_six, 2);
    }

    #[test]
    fn removal_emits_event_once() {
        let mut browser = BonjourBrowser::new();
        browser.handle_line(
            "14:20:05.689  Add        2   6 local.  _remotepairing._tcp. AppleTV",
        );
        let rmv = "14:21:01.020  Rmv        0   6 local.  _remotepairing._tcp. AppleTV";
        match browser.handle_line(rmv) {
            Some(ServiceEvent::Removed(s)) => assert_eq!(s.name, "AppleTV"),
            other => panic!("expected removal, got {other:?}"),
        }
        assert_eq!(browser.handle_line(rmv), None);
        assert!(browser.is_empty());
    }

    #[test]
    fn duplicate_add_is_absorbed() {
        let mut browser = BonjourBrowser::new();
        let add = "14:20:05.689  Add        2   6 local.  _remotepairing._tcp. AppleTV";
        assert!(browser.handle_line(add).is_some());
        assert!(browser.handle_line(add).is_none());
        assert_eq!(browser.len(), 1);
    }

    #[test]
    fn banner_lines_are_ignored() {
        let mut browser = BonjourBrowser::new();
        assert_eq!(browser.handle_line("Browsing for _remotepairing._tcp"), None);
        assert_eq!(browser.handle_line("DATE: ---Fri 18 Apr 2025---"), None);
        assert_eq!(browser.handle_line(""), None);
    }
}
