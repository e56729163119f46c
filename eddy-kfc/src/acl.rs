//! ## eddy-kfc::acl
//! **Per-group client access lists**
//!
//! Rules are `(pattern, allow)` pairs. The most recently set rule that
//! matches a peer decides; a peer no rule matches is allowed. Setting a
//! pattern again replaces its earlier rule and makes it the most recent.
//!
//! Patterns: `*`, a dotted IPv4 glob (`10.1.2.*`, `10.*`), a CIDR block
//! (`10.1.0.0/16`) or a single address.

use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::IpNetwork;

use crate::error::MembershipError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Any,
    /// Four octets, `None` where the glob had `*`.
    Glob([Option<u8>; 4]),
    Network(IpNetwork),
}

impl Pattern {
    pub fn parse(text: &str) -> Result<Self, MembershipError> {
        let text = text.trim();
        let invalid = |reason: &str| MembershipError::Pattern {
            pattern: text.to_owned(),
            reason: reason.to_owned(),
        };

        if text == "*" {
            return Ok(Pattern::Any);
        }
        if text.contains('/') {
            return text
                .parse::<IpNetwork>()
                .map(Pattern::Network)
                .map_err(|e| invalid(&e.to_string()));
        }
        if let Ok(ip) = text.parse::<IpAddr>() {
            let prefix = if ip.is_ipv4() { 32 } else { 128 };
            return IpNetwork::new(ip, prefix)
                .map(Pattern::Network)
                .map_err(|e| invalid(&e.to_string()));
        }

        let parts: Vec<&str> = text.split('.').collect();
        if parts.len() > 4 {
            return Err(invalid("more than four octets"));
        }
        let mut octets = [None; 4];
        for (i, part) in parts.iter().enumerate() {
            if *part == "*" {
                if i + 1 == parts.len() {
                    break;
                }
                continue;
            }
            octets[i] = Some(part.parse::<u8>().map_err(|_| invalid("bad octet"))?);
        }
        if parts.len() < 4 && parts.last() != Some(&"*") {
            return Err(invalid("short pattern must end in '*'"));
        }
        Ok(Pattern::Glob(octets))
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Network(net) => net.contains(ip),
            Pattern::Glob(octets) => match ipv4(ip) {
                Some(v4) => octets
                    .iter()
                    .zip(v4.octets())
                    .all(|(want, got)| want.map_or(true, |w| w == got)),
                None => false,
            },
        }
    }
}

/// IPv4 view of `ip`, unwrapping v4-mapped IPv6 addresses.
fn ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

#[derive(Debug, Clone)]
struct Rule {
    text: String,
    pattern: Pattern,
    allow: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AccessList {
    rules: Vec<Rule>,
}

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the rule for `pattern`.
    pub fn set(&mut self, pattern: &str, allow: bool) -> Result<(), MembershipError> {
        let parsed = Pattern::parse(pattern)?;
        let text = pattern.trim().to_owned();
        self.rules.retain(|rule| rule.text != text);
        self.rules.push(Rule {
            text,
            pattern: parsed,
            allow,
        });
        Ok(())
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.pattern.matches(ip))
            .map_or(true, |rule| rule.allow)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
