use std::net::IpAddr;

use crate::config::split_list;

/// Allow / deny lists for peer connections. Patterns are dotted addresses where `*` matches a
///  single component, e.g. `10.1.*.*`.
///
/// An address is allowed if the deny list is empty or the address matches the allow list, and
///  denied if it matches the deny list. Anything else is allowed.
#[derive(Debug, Clone)]
pub struct IpFilter {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl IpFilter {
    pub fn new(allow: &str, deny: &str) -> IpFilter {
        IpFilter {
            allow: split_list(allow),
            deny: split_list(deny),
        }
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if self.deny.is_empty() {
            return true;
        }

        let ip = ip.to_string();
        if self.allow.iter().any(|p| pattern_matches(p, &ip)) {
            return true;
        }
        !self.deny.iter().any(|p| pattern_matches(p, &ip))
    }
}

fn pattern_matches(pattern: &str, ip: &str) -> bool {
    let mut pattern_components = pattern.split('.');
    let mut ip_components = ip.split('.');
    loop {
        match (pattern_components.next(), ip_components.next()) {
            (None, None) => return true,
            (Some(p), Some(i)) if p == "*" || p == i => {}
            _ => return false,
        }
    }
}
