//! ## eddy-kfc::membership
//! **Declarative group membership**
//!
//! One record per line:
//!
//! ```text
//! 10.0.[1-3].[10,12] role=server group=orders port=2200
//! ```
//!
//! Bracketed lists of numbers and ascending ranges in the host expand into
//! one record per combination, so the line above yields six servers. Blank
//! lines and lines starting with `#` are ignored.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;

use tracing::debug;

use crate::error::MembershipError;

/// Upper bound on hosts one pattern may expand to.
pub const MAX_EXPANSION: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
    Both,
}

impl Role {
    pub fn serves(self) -> bool {
        matches!(self, Role::Server | Role::Both)
    }

    pub fn is_client(self) -> bool {
        matches!(self, Role::Client | Role::Both)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            "both" => Ok(Role::Both),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Server => "server",
            Role::Client => "client",
            Role::Both => "both",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub host: String,
    pub role: Role,
    pub group: String,
    pub port: u16,
}

impl Member {
    /// Socket address of this member. Literal addresses skip the resolver.
    pub fn resolve(&self) -> Result<SocketAddr, MembershipError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| MembershipError::Resolve {
                host: self.host.clone(),
            })
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} role={} group={} port={}",
            self.host, self.role, self.group, self.port
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    members: Vec<Member>,
}

impl Membership {
    pub fn parse(text: &str) -> Result<Self, MembershipError> {
        let mut members = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fail = |reason: String| MembershipError::Parse {
                line: index + 1,
                reason,
            };

            let mut fields = line.split_whitespace();
            let host = fields.next().ok_or_else(|| fail("missing host".into()))?;
            let (mut role, mut group, mut port) = (None, None, None);
            for field in fields {
                let (key, value) = field
                    .split_once('=')
                    .ok_or_else(|| fail(format!("expected key=value, got {field:?}")))?;
                match key {
                    "role" => role = Some(value.parse::<Role>().map_err(fail)?),
                    "group" if !value.is_empty() => group = Some(value.to_owned()),
                    "port" => {
                        port = Some(
                            value
                                .parse::<u16>()
                                .map_err(|e| fail(format!("bad port {value:?}: {e}")))?,
                        )
                    }
                    other => return Err(fail(format!("unknown field {other:?}"))),
                }
            }
            let role = role.ok_or_else(|| fail("missing role".into()))?;
            let group = group.ok_or_else(|| fail("missing group".into()))?;
            let port = port.ok_or_else(|| fail("missing port".into()))?;

            for host in expand_host(host).map_err(fail)? {
                members.push(Member {
                    host,
                    role,
                    group: group.clone(),
                    port,
                });
            }
        }
        debug!(records = members.len(), "Membership parsed");
        Ok(Self { members })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MembershipError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Group names in order of first appearance.
    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = Vec::new();
        for member in &self.members {
            if !groups.contains(&member.group.as_str()) {
                groups.push(&member.group);
            }
        }
        groups
    }

    pub fn contains_group(&self, group: &str) -> bool {
        self.members.iter().any(|m| m.group == group)
    }

    pub fn servers<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a Member> + 'a {
        self.members
            .iter()
            .filter(move |m| m.group == group && m.role.serves())
    }

    pub fn clients<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a Member> + 'a {
        self.members
            .iter()
            .filter(move |m| m.group == group && m.role.is_client())
    }
}

impl FromStr for Membership {
    type Err = MembershipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Expands every `[a,b-c,...]` group in `pattern` into the cartesian product
/// of its values.
pub fn expand_host(pattern: &str) -> Result<Vec<String>, String> {
    let mut hosts = vec![String::new()];
    let mut rest = pattern;
    while !rest.is_empty() {
        let Some(open) = rest.find('[') else {
            if rest.contains(']') {
                return Err(format!("unbalanced ']' in {pattern:?}"));
            }
            hosts.iter_mut().for_each(|h| h.push_str(rest));
            break;
        };
        let literal = &rest[..open];
        if literal.contains(']') {
            return Err(format!("unbalanced ']' in {pattern:?}"));
        }
        hosts.iter_mut().for_each(|h| h.push_str(literal));

        let close = rest[open..]
            .find(']')
            .map(|i| open + i)
            .ok_or_else(|| format!("unclosed '[' in {pattern:?}"))?;
        let values = expand_list(&rest[open + 1..close])?;
        if hosts.len().saturating_mul(values.len()) > MAX_EXPANSION {
            return Err(format!("{pattern:?} expands past {MAX_EXPANSION} hosts"));
        }
        hosts = hosts
            .iter()
            .flat_map(|prefix| values.iter().map(move |v| format!("{prefix}{v}")))
            .collect();
        rest = &rest[close + 1..];
    }
    if hosts.iter().any(String::is_empty) {
        return Err("empty host".into());
    }
    Ok(hosts)
}

fn expand_list(list: &str) -> Result<Vec<u32>, String> {
    let mut values = Vec::new();
    for item in list.split(',') {
        let item = item.trim();
        let (start, end) = match item.split_once('-') {
            Some((start, end)) => (number(start)?, number(end)?),
            None => {
                let n = number(item)?;
                (n, n)
            }
        };
        if start > end {
            return Err(format!("descending range {item:?}"));
        }
        if values.len() + (end - start) as usize >= MAX_EXPANSION {
            return Err(format!("range {item:?} is too large"));
        }
        values.extend(start..=end);
    }
    Ok(values)
}

fn number(text: &str) -> Result<u32, String> {
    text.trim()
        .parse()
        .map_err(|_| format!("expected a number, got {text:?}"))
}
