//! Proxy server implementation
//! Terminates TLS, routes each request by its exact URL and forwards it

use crate::certificate::CertificateManager;
use crate::idle::IdleTimeout;
use crate::router::{request_url, RoutingTable, Scheme, Upstream};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, LOCATION, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Body type used for everything the proxy sends and receives
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

type HttpClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request lifecycle timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TLS handshake and request headers
    pub read: Duration,
    /// Upstream response for a forwarded request
    pub write: Duration,
    /// Keep-alive connection with no traffic
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(5),
            write: Duration::from_secs(10),
            idle: Duration::from_secs(120),
        }
    }
}

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub http_port: u16,
    pub https_port: u16,
    pub timeouts: Timeouts,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            timeouts: Timeouts::default(),
        }
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    routes: Arc<RoutingTable>,
    cert_manager: Arc<CertificateManager>,
    client: HttpClient,
}

impl ProxyServer {
    /// Create a new proxy server around a finished routing table
    pub fn new(
        config: ProxyConfig,
        routes: RoutingTable,
        cert_manager: Arc<CertificateManager>,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.timeouts.idle)
            .build(HttpsConnector::new());

        Self {
            config,
            routes: Arc::new(routes),
            cert_manager,
            client,
        }
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Start the proxy server
    ///
    /// The plaintext listener runs in the background and may fail on its own;
    /// only the TLS listener's failure ends this future.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let http_addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let https_addr = SocketAddr::from(([0, 0, 0, 0], self.config.https_port));

        self.clone().spawn_http_server(http_addr);

        let listener = TcpListener::bind(https_addr)
            .await
            .with_context(|| format!("Failed to bind HTTPS listener on {}", https_addr))?;
        info!("HTTPS server listening on {}", https_addr);

        self.serve_tls(listener).await
    }

    /// Run the plaintext listener as a supervised background task
    fn spawn_http_server(self: Arc<Self>, addr: SocketAddr) {
        let task = tokio::spawn(self.run_http_server(addr));

        tokio::spawn(async move {
            match task.await {
                Ok(Ok(())) => info!("HTTP listener on {} stopped", addr),
                Ok(Err(e)) => warn!("HTTP listener on {} failed: {:#}", addr, e),
                Err(e) => error!("HTTP listener task on {} aborted: {}", addr, e),
            }
        });
    }

    async fn run_http_server(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
        info!("HTTP server listening on {}", addr);

        self.serve_http(listener).await
    }

    /// Accept TLS connections and serve the proxy on each of them
    pub async fn serve_tls(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let acceptor = TlsAcceptor::from(Arc::new(self.cert_manager.server_config()));

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept TLS connection: {}", e);
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let server = self.clone();

            tokio::spawn(async move {
                let handshake = timeout(server.config.timeouts.read, acceptor.accept(stream)).await;
                let tls = match handshake {
                    Ok(Ok(tls)) => tls,
                    Ok(Err(e)) => {
                        debug!("TLS handshake with {} failed: {}", remote_addr, e);
                        return;
                    }
                    Err(_) => {
                        debug!("TLS handshake with {} timed out", remote_addr);
                        return;
                    }
                };

                if let Err(e) = server.serve_connection(tls, remote_addr, Scheme::Https).await {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Serve the proxy over one established connection
    pub async fn serve_connection<I>(
        self: Arc<Self>,
        io: I,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let timeouts = self.config.timeouts;
        let io = TokioIo::new(IdleTimeout::new(io, timeouts.idle));

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(timeouts.read)
            .preserve_header_case(true)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr, scheme).await }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let req = req.map(|body| body.boxed());

        let url = match request_url(&req, scheme) {
            Some(url) => url,
            None => {
                return Ok(Self::error_response(
                    StatusCode::BAD_REQUEST,
                    "Missing Host header",
                ))
            }
        };

        let upstream = match self.routes.lookup(&url) {
            Some(upstream) => upstream.clone(),
            None => {
                debug!("{} {} from {}: no route", req.method(), url, remote_addr);
                return Ok(Self::not_found());
            }
        };

        debug!(
            "{} {} from {} -> {}",
            req.method(),
            url,
            remote_addr,
            upstream.name()
        );

        let forward = self.forward(req, &upstream, remote_addr, scheme);
        match timeout(self.config.timeouts.write, forward).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                error!("Proxy error for {}: {:#}", url, e);
                Ok(Self::error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
            }
            Err(_) => {
                warn!("Upstream {} timed out for {}", upstream.url(), url);
                Ok(Self::error_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Gateway Timeout",
                ))
            }
        }
    }

    /// Proxy the request to its upstream
    async fn forward(
        &self,
        mut req: Request<ProxyBody>,
        upstream: &Upstream,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<Response<ProxyBody>> {
        let upgrade = upgrade_protocol(req.headers());
        let original_host = req
            .headers()
            .get(HOST)
            .cloned()
            .or_else(|| {
                req.uri()
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        let target = upstream.target_uri(req.uri())?;
        debug!("Proxying to: {}", target);

        *req.uri_mut() = target;
        *req.version_mut() = Version::HTTP_11;

        let headers = req.headers_mut();
        remove_hop_headers(headers);
        if let Some(host) = &original_host {
            headers.insert(HOST, host.clone());
        }
        set_forwarded_headers(headers, remote_addr, original_host.as_ref(), scheme);
        if let Some(protocol) = &upgrade {
            headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(UPGRADE, protocol.clone());
        }

        let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let mut response = self
            .client
            .request(req)
            .await
            .with_context(|| format!("Request to {} failed", upstream.url()))?;

        match client_upgrade {
            Some(client_upgrade) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(async move {
                    match tokio::try_join!(client_upgrade, upstream_upgrade) {
                        Ok((client, upstream)) => {
                            let mut client = TokioIo::new(client);
                            let mut upstream = TokioIo::new(upstream);
                            if let Err(e) =
                                tokio::io::copy_bidirectional(&mut client, &mut upstream).await
                            {
                                debug!("Upgraded connection from {} closed: {}", remote_addr, e);
                            }
                        }
                        Err(e) => debug!("Upgrade for {} failed: {}", remote_addr, e),
                    }
                });
            }
            _ => remove_hop_headers(response.headers_mut()),
        }

        Ok(response.map(|body| body.boxed()))
    }

    /// Accept plaintext connections for challenges and HTTPS redirects
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(IdleTimeout::new(stream, server.config.timeouts.idle));
                let result = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .header_read_timeout(server.config.timeouts.read)
                    .serve_connection(
                        io,
                        service_fn(move |req| {
                            let server = server.clone();
                            async move { Ok::<_, Infallible>(server.handle_http_request(req)) }
                        }),
                    )
                    .await;

                if let Err(e) = result {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Plaintext handler: ACME HTTP-01 tokens, health, redirect to HTTPS
    fn handle_http_request<B>(&self, req: Request<B>) -> Response<ProxyBody> {
        let path = req.uri().path();

        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
            return match self.cert_manager.get_acme_challenge(token) {
                Some(key_auth) => Self::text_response(StatusCode::OK, &key_auth),
                None => Self::error_response(StatusCode::NOT_FOUND, "Challenge not found"),
            };
        }

        if path == "/health" {
            return Self::text_response(StatusCode::OK, "OK");
        }

        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Self::error_response(StatusCode::BAD_REQUEST, "Use HTTPS");
        }

        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| strip_port(h).to_string())
            .filter(|h| !h.is_empty());

        let host = match host {
            Some(h) => h,
            None => return Self::error_response(StatusCode::BAD_REQUEST, "Missing Host header"),
        };

        let authority = match self.config.https_port {
            443 => host,
            port => format!("{}:{}", host, port),
        };
        let location = format!(
            "https://{}{}",
            authority,
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        Self::redirect_response(&location)
    }

    /// 404 for requests with no route
    fn not_found() -> Response<ProxyBody> {
        Self::error_response(StatusCode::NOT_FOUND, "404 page not found\n")
    }

    /// Create text response
    fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
        let mut response = Response::new(Self::full_body(Bytes::from(body.to_string())));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    /// Create error response
    fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Self::text_response(status, message);
        response.headers_mut().insert(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        );
        response
    }

    /// Create redirect response
    fn redirect_response(location: &str) -> Response<ProxyBody> {
        let mut response = Response::new(Self::empty_body());
        *response.status_mut() = StatusCode::FOUND;
        match HeaderValue::from_str(location) {
            Ok(value) => {
                response.headers_mut().insert(LOCATION, value);
                response
            }
            Err(_) => Self::error_response(StatusCode::BAD_REQUEST, "Bad Request"),
        }
    }

    /// Create full body
    fn full_body(bytes: Bytes) -> ProxyBody {
        Full::new(bytes).map_err(|never| match never {}).boxed()
    }

    /// Create empty body
    fn empty_body() -> ProxyBody {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
    }
}

/// Protocol requested by a `Connection: upgrade` request, if any
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Drop hop-by-hop headers, including any the Connection header names
fn remove_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Set X-Forwarded-* headers, appending the client to any existing chain
fn set_forwarded_headers(
    headers: &mut HeaderMap,
    remote_addr: SocketAddr,
    original_host: Option<&HeaderValue>,
    scheme: Scheme,
) {
    let client_ip = remote_addr.ip().to_string();
    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client_ip),
        _ => client_ip,
    };

    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    if let Some(host) = original_host {
        headers.insert("x-forwarded-host", host.clone());
    }
    headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(scheme.as_str()),
    );
}

/// Host without a trailing `:port` (bracketed IPv6 stays intact)
fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(i) if !host[i..].contains(']') => &host[..i],
        _ => host,
    }
}
