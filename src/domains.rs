//! Domain groups taken from the command line
//!
//! The positional arguments are joined with spaces and split on commas. Each
//! comma-separated group is `primary alias_0 alias_1 ...`, separated by
//! whitespace. Every entry is parsed as a URL; the URL of the last entry in a
//! group is the one the group routes to and forwards to.

use crate::error::ConfigError;
use std::fmt;
use url::Url;

/// One comma-separated group: a primary name and its aliases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub name: String,
    pub aliases: Vec<String>,
    resolved_url: Url,
    hosts: Vec<String>,
}

impl DomainRecord {
    /// Parse `name` and then every alias in order.
    ///
    /// Each successful parse replaces the resolved URL, so a record with
    /// aliases resolves to its last alias and a record without aliases
    /// resolves to its name. The first entry that fails to parse aborts.
    pub fn new(name: String, aliases: Vec<String>) -> Result<Self, ConfigError> {
        let mut resolved_url = parse_url(&name)?;
        let mut hosts = vec![host_of(&resolved_url)];

        for alias in &aliases {
            resolved_url = parse_url(alias)?;
            let host = host_of(&resolved_url);
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }

        Ok(Self {
            name,
            aliases,
            resolved_url,
            hosts,
        })
    }

    /// URL used both as the routing key and as the forwarding target
    pub fn resolved_url(&self) -> &Url {
        &self.resolved_url
    }

    /// Host names of the primary name and every alias
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}

/// Parse one name or alias.
///
/// Entries with an explicit scheme are parsed as they are; bare host names
/// are treated as `https://<name>`.
pub fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    let parsed = if raw.contains("://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("https://{}", raw))
    };

    let url = parsed.map_err(|source| ConfigError::InvalidUrl {
        value: raw.to_string(),
        source,
    })?;

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(ConfigError::MissingHost(raw.to_string())),
    }
}

fn host_of(url: &Url) -> String {
    // parse_url guarantees a host
    url.host_str().unwrap_or_default().to_string()
}

/// All configured domain records, in command-line order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Domains {
    records: Vec<DomainRecord>,
}

impl Domains {
    /// Parse the positional arguments into domain records.
    ///
    /// Groups with no fields (a trailing comma, `,,`, whitespace only) are
    /// skipped. Parsing is all-or-nothing: one bad URL fails the whole list.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self, ConfigError> {
        let joined = args
            .iter()
            .map(|arg| arg.as_ref())
            .collect::<Vec<_>>()
            .join(" ");

        let mut records = Vec::new();
        for group in joined.split(',') {
            let mut fields = group.split_whitespace();
            let Some(name) = fields.next() else {
                continue;
            };
            let aliases = fields.map(str::to_string).collect();
            records.push(DomainRecord::new(name.to_string(), aliases)?);
        }

        if records.is_empty() {
            return Err(ConfigError::NoDomains);
        }

        Ok(Self { records })
    }

    pub fn records(&self) -> &[DomainRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Resolved URL of every record
    pub fn urls(&self) -> Vec<&Url> {
        self.records.iter().map(DomainRecord::resolved_url).collect()
    }

    /// Primary name of every record
    pub fn names(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.name.as_str()).collect()
    }

    /// Every host a certificate may be issued for, without duplicates
    pub fn hosts(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for host in self.records.iter().flat_map(|r| r.hosts().iter()) {
            if !out.contains(host) {
                out.push(host.clone());
            }
        }
        out
    }
}

impl fmt::Display for Domains {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.names().join(" "))
    }
}
