//! Command-line configuration
//!
//! Timeouts use the short single-dash spelling (`-rt 5s`) as well as the
//! usual `--rt 5s`. Everything after the first positional argument is a
//! domain group token.

use crate::domains::Domains;
use crate::error::ConfigError;
use crate::proxy::{ProxyConfig, Timeouts};
use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Usage line printed with every argument error
pub const USAGE: &str =
    "tlsproxy [options] domain_0 alias_0 ... alias_i, ... domain_i alias_0 ... alias_i";

const TIMEOUT_FLAGS: [&str; 3] = ["rt", "wt", "it"];

/// tlsproxy - A TLS-terminating reverse proxy
#[derive(Parser, Debug, Clone)]
#[command(name = "tlsproxy")]
#[command(author = "tlsproxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A TLS-terminating reverse proxy with exact-URL routing")]
#[command(override_usage = USAGE)]
pub struct Args {
    /// Read timeout: TLS handshake and request headers
    #[arg(long = "rt", value_name = "DURATION", default_value = "5s", value_parser = humantime::parse_duration)]
    pub read_timeout: Duration,

    /// Write timeout: time allowed to produce the response
    #[arg(long = "wt", value_name = "DURATION", default_value = "10s", value_parser = humantime::parse_duration)]
    pub write_timeout: Duration,

    /// Idle timeout for keep-alive connections
    #[arg(long = "it", value_name = "DURATION", default_value = "120s", value_parser = humantime::parse_duration)]
    pub idle_timeout: Duration,

    /// Plaintext port for certificate challenges and HTTPS redirects
    #[arg(long, env = "HTTP_PORT", default_value = "80")]
    pub http_port: u16,

    /// TLS port the proxy serves on
    #[arg(long, env = "HTTPS_PORT", default_value = "443")]
    pub https_port: u16,

    /// Certificate cache directory
    #[arg(long, env = "CACHE_DIR", default_value = "/srv/certs")]
    pub cache_dir: PathBuf,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Domain groups: `domain alias ... , domain alias ...`
    #[arg(value_name = "DOMAIN", required = true, num_args = 1.., trailing_var_arg = true)]
    pub domains: Vec<String>,
}

impl Args {
    /// Parse the process arguments, exiting with usage on error
    pub fn from_env() -> Self {
        Self::parse_from(normalize_flags(std::env::args_os()))
    }

    /// Parse an explicit argument list (first item is the program name)
    pub fn try_parse_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::try_parse_from(normalize_flags(args))
    }

    /// Parse the positional domain groups
    pub fn domains(&self) -> Result<Domains, ConfigError> {
        Domains::parse(&self.domains)
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            http_port: self.http_port,
            https_port: self.https_port,
            timeouts: Timeouts {
                read: self.read_timeout,
                write: self.write_timeout,
                idle: self.idle_timeout,
            },
        }
    }
}

/// Rewrite `-rt`, `-wt`, `-it` (and `-rt=...`) to their long form
pub fn normalize_flags<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| match arg.to_str() {
            Some(s) if is_short_timeout_flag(s) => OsString::from(format!("-{}", s)),
            _ => arg,
        })
        .collect()
}

fn is_short_timeout_flag(arg: &str) -> bool {
    let Some(rest) = arg.strip_prefix('-') else {
        return false;
    };
    if rest.starts_with('-') {
        return false;
    }
    let name = rest.split('=').next().unwrap_or(rest);
    TIMEOUT_FLAGS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_args(std::iter::once("tlsproxy").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["https://a.example"]).unwrap();

        assert_eq!(args.read_timeout, Duration::from_secs(5));
        assert_eq!(args.write_timeout, Duration::from_secs(10));
        assert_eq!(args.idle_timeout, Duration::from_secs(120));
        assert_eq!(args.domains, vec!["https://a.example"]);

        let config = args.proxy_config();
        assert_eq!(config.timeouts.idle, Duration::from_secs(120));
    }

    #[test]
    fn test_single_dash_timeouts() {
        let args = parse(&["-rt", "1m", "-wt=250ms", "--it", "30s", "https://a.example"]).unwrap();

        assert_eq!(args.read_timeout, Duration::from_secs(60));
        assert_eq!(args.write_timeout, Duration::from_millis(250));
        assert_eq!(args.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        assert!(parse(&["-rt", "soon", "https://a.example"]).is_err());
        assert!(parse(&["-it", "10", "https://a.example"]).is_err());
    }

    #[test]
    fn test_domains_required() {
        assert!(parse(&["-rt", "5s"]).is_err());
    }

    #[test]
    fn test_domain_groups_are_positional() {
        let args = parse(&[
            "-wt",
            "3s",
            "https://a.example",
            "www.a.example",
            ",",
            "https://b.example",
        ])
        .unwrap();

        let domains = args.domains().unwrap();
        assert_eq!(domains.len(), 2);
        assert_eq!(domains.records()[0].aliases, vec!["www.a.example"]);
    }

    #[test]
    fn test_invalid_domain_surfaces_after_flag_parsing() {
        let args = parse(&["http://[::1"]).unwrap();
        assert!(matches!(
            args.domains(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_normalize_flags() {
        let out = normalize_flags(["tlsproxy", "-rt", "-wt=1s", "--it", "-x", "a.example"]);
        assert_eq!(
            out,
            vec!["tlsproxy", "--rt", "--wt=1s", "--it", "-x", "a.example"]
                .into_iter()
                .map(OsString::from)
                .collect::<Vec<_>>()
        );
    }
}
