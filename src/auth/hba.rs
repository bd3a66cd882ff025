//! Host-based access control. The table is read from a pg_hba-style file:
//! whitespace separated `type database user address[/mask] method`, first
//! matching entry wins and decides the authentication method.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use crate::errors::Error;

/// Authentication method named by a matching entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Trust,
    Password,
    Md5,
    ScramSha256,
    Reject,
    /// `all`: let the pooler pick.
    Any,
}

impl AuthMethod {
    fn from_token(tok: &str) -> Option<Self> {
        match tok.to_ascii_lowercase().as_str() {
            "trust" => Some(AuthMethod::Trust),
            "password" => Some(AuthMethod::Password),
            "md5" => Some(AuthMethod::Md5),
            "scram-sha-256" => Some(AuthMethod::ScramSha256),
            "reject" => Some(AuthMethod::Reject),
            "all" => Some(AuthMethod::Any),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthMethod::Trust => "trust",
            AuthMethod::Password => "password",
            AuthMethod::Md5 => "md5",
            AuthMethod::ScramSha256 => "scram-sha-256",
            AuthMethod::Reject => "reject",
            AuthMethod::Any => "all",
        };
        f.write_str(s)
    }
}

/// Connection type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostType {
    Local,
    Host,
    HostSSL,
    HostNoSSL,
}

impl HostType {
    fn from_token(tok: &str) -> Option<Self> {
        match tok.to_ascii_lowercase().as_str() {
            "local" => Some(HostType::Local),
            "host" => Some(HostType::Host),
            "hostssl" => Some(HostType::HostSSL),
            "hostnossl" => Some(HostType::HostNoSSL),
            _ => None,
        }
    }

    fn matches(&self, local: bool, ssl: bool) -> bool {
        match self {
            HostType::Local => local,
            HostType::Host => !local,
            HostType::HostSSL => !local && ssl,
            HostType::HostNoSSL => !local && !ssl,
        }
    }
}

/// Matcher for database/user fields; `all` matches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NameMatcher {
    All,
    Name(String),
}

impl NameMatcher {
    fn from_token(tok: &str) -> Self {
        if tok.eq_ignore_ascii_case("all") {
            NameMatcher::All
        } else {
            NameMatcher::Name(tok.to_string())
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            NameMatcher::All => true,
            NameMatcher::Name(ref n) => n == value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaEntry {
    host_type: HostType,
    database: NameMatcher,
    user: NameMatcher,
    address: Option<IpNet>,
    pub method: AuthMethod,
}

/// Parsed entries, in file order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HbaTable {
    entries: Vec<HbaEntry>,
}

impl HbaTable {
    pub fn parse(contents: &str) -> Result<HbaTable, Error> {
        let mut entries = Vec::new();

        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();

            let host_type = HostType::from_token(fields[0]).ok_or_else(|| {
                Error::BadConfig(format!(
                    "hba line {}: unknown connection type '{}'",
                    lineno + 1,
                    fields[0]
                ))
            })?;

            let want = if host_type == HostType::Local { 4 } else { 5 };
            if fields.len() != want {
                return Err(Error::BadConfig(format!(
                    "hba line {}: expected {} fields, got {}",
                    lineno + 1,
                    want,
                    fields.len()
                )));
            }

            let address = if host_type == HostType::Local {
                None
            } else if fields[3].eq_ignore_ascii_case("all") {
                None
            } else {
                Some(parse_address(fields[3]).map_err(|err| {
                    Error::BadConfig(format!("hba line {}: {err}", lineno + 1))
                })?)
            };

            let method_token = fields[want - 1];
            let method = AuthMethod::from_token(method_token).ok_or_else(|| {
                Error::BadConfig(format!(
                    "hba line {}: unknown method '{}'",
                    lineno + 1,
                    method_token
                ))
            })?;

            entries.push(HbaEntry {
                host_type,
                database: NameMatcher::from_token(fields[1]),
                user: NameMatcher::from_token(fields[2]),
                address,
                method,
            });
        }

        Ok(HbaTable { entries })
    }

    /// First matching entry decides. `None` means no entry matched.
    pub fn lookup(
        &self,
        ip: Option<IpAddr>,
        ssl: bool,
        username: &str,
        database: &str,
    ) -> Option<AuthMethod> {
        let local = ip.is_none();

        for entry in &self.entries {
            if !entry.host_type.matches(local, ssl) {
                continue;
            }
            if !entry.database.matches(database) || !entry.user.matches(username) {
                continue;
            }
            if let Some(ref net) = entry.address {
                match ip {
                    Some(ip) if net.contains(&ip) => (),
                    _ => continue,
                }
            }
            return Some(entry.method);
        }

        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An address is either CIDR notation or a bare address, which matches
/// exactly.
fn parse_address(token: &str) -> Result<IpNet, Error> {
    if let Ok(net) = IpNet::from_str(token) {
        return Ok(net);
    }
    if let Ok(addr) = IpAddr::from_str(token) {
        let prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        return IpNet::new(addr, prefix)
            .map_err(|err| Error::BadConfig(format!("bad address '{token}': {err}")));
    }
    Err(Error::BadConfig(format!("bad address '{token}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn first_match_wins() {
        let table = HbaTable::parse(
            "host mydb alice 10.0.0.0/8 trust\n\
             host all all 0.0.0.0/0 md5\n",
        )
        .unwrap();

        assert_eq!(
            table.lookup(ip("10.1.2.3"), false, "alice", "mydb"),
            Some(AuthMethod::Trust)
        );
        assert_eq!(
            table.lookup(ip("192.168.0.1"), false, "alice", "mydb"),
            Some(AuthMethod::Md5)
        );
        assert_eq!(
            table.lookup(ip("192.168.0.1"), false, "bob", "otherdb"),
            Some(AuthMethod::Md5)
        );
    }

    #[test]
    fn no_match_is_none() {
        let table = HbaTable::parse("host mydb alice 10.0.0.0/8 md5\n").unwrap();
        assert_eq!(table.lookup(ip("192.168.0.1"), false, "alice", "mydb"), None);
        assert_eq!(table.lookup(ip("10.0.0.1"), false, "bob", "mydb"), None);
    }

    #[test]
    fn ssl_specific_entries() {
        let table = HbaTable::parse(
            "hostssl all all 0.0.0.0/0 scram-sha-256\n\
             hostnossl all all 0.0.0.0/0 reject\n",
        )
        .unwrap();

        assert_eq!(
            table.lookup(ip("1.2.3.4"), true, "alice", "db"),
            Some(AuthMethod::ScramSha256)
        );
        assert_eq!(
            table.lookup(ip("1.2.3.4"), false, "alice", "db"),
            Some(AuthMethod::Reject)
        );
    }

    #[test]
    fn local_entries_only_match_unix_sockets() {
        let table = HbaTable::parse("local all all trust\n").unwrap();
        assert_eq!(table.lookup(None, false, "alice", "db"), Some(AuthMethod::Trust));
        assert_eq!(table.lookup(ip("127.0.0.1"), false, "alice", "db"), None);
    }

    #[test]
    fn bare_address_matches_exactly() {
        let table = HbaTable::parse("host all all 127.0.0.1 trust\n").unwrap();
        assert_eq!(
            table.lookup(ip("127.0.0.1"), false, "a", "d"),
            Some(AuthMethod::Trust)
        );
        assert_eq!(table.lookup(ip("127.0.0.2"), false, "a", "d"), None);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(HbaTable::parse("bogus all all 0.0.0.0/0 md5\n").is_err());
        assert!(HbaTable::parse("host all all 0.0.0.0/0 telepathy\n").is_err());
        assert!(HbaTable::parse("host all all not-an-address md5\n").is_err());
    }
}
