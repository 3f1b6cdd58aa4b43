//! Exact-URL routing table
//!
//! Requests are routed by the full URL they were made for: scheme, host,
//! port, path and query must all equal a configured URL. The table is built
//! once at startup and only read afterwards.

use crate::domains::Domains;
use anyhow::{Context, Result};
use hyper::header::HOST;
use hyper::{Request, Uri};
use std::collections::HashMap;
use url::Url;

/// Scheme of the listener a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Forwarding target for one routing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    name: String,
    url: Url,
}

impl Upstream {
    pub fn new(name: impl Into<String>, url: Url) -> Self {
        Self {
            name: name.into(),
            url,
        }
    }

    /// Primary name of the domain record this target came from
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Build the URI a request is forwarded to.
    ///
    /// Scheme and authority come from the upstream. The upstream path is a
    /// prefix joined to the request path with a single slash, and the two
    /// queries are joined with `&` when both are present.
    pub fn target_uri(&self, request_uri: &Uri) -> Result<Uri> {
        let host = self.url.host_str().unwrap_or("localhost");
        let authority = match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let path = join_paths(self.url.path(), request_uri.path());

        let query = match (self.url.query(), request_uri.query()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{}&{}", a, b)),
            (Some(a), _) if !a.is_empty() => Some(a.to_string()),
            (_, Some(b)) if !b.is_empty() => Some(b.to_string()),
            _ => None,
        };

        let mut target = format!("{}://{}{}", self.url.scheme(), authority, path);
        if let Some(q) = query {
            target.push('?');
            target.push_str(&q);
        }

        target
            .parse()
            .with_context(|| format!("Invalid upstream URI: {}", target))
    }
}

/// Join two paths with exactly one slash between them
fn join_paths(prefix: &str, path: &str) -> String {
    match (prefix.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", prefix, &path[1..]),
        (false, false) => format!("{}/{}", prefix, path),
        _ => format!("{}{}", prefix, path),
    }
}

/// Immutable map from request URL to forwarding target
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<Url, Upstream>,
}

impl RoutingTable {
    /// Build the table from every domain record.
    ///
    /// Records sharing a resolved URL collapse into one entry; the record
    /// that comes last on the command line wins.
    pub fn build(domains: &Domains) -> Self {
        let routes = domains
            .names()
            .into_iter()
            .zip(domains.urls())
            .map(|(name, url)| (url.clone(), Upstream::new(name, url.clone())))
            .collect();
        Self { routes }
    }

    pub fn lookup(&self, url: &Url) -> Option<&Upstream> {
        self.routes.get(url)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Reconstruct the full URL a request was made for.
///
/// Absolute-form request targets are taken as they are. Otherwise the URL is
/// assembled from the listener scheme, the Host header and the path and
/// query. Returns `None` when there is no host to build from.
pub fn request_url<B>(req: &Request<B>, scheme: Scheme) -> Option<Url> {
    let uri = req.uri();

    if uri.scheme().is_some() && uri.authority().is_some() {
        return Url::parse(&uri.to_string()).ok();
    }

    let host = req.headers().get(HOST)?.to_str().ok()?;
    if host.is_empty() {
        return None;
    }

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Url::parse(&format!("{}://{}{}", scheme.as_str(), host, path_and_query)).ok()
}
