//! Configuration errors
//!
//! Everything that can go wrong before a listener is bound. These are always
//! fatal: the process reports them and exits without serving anything.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A domain name or alias could not be parsed as a URL
    #[error("invalid URL {value:?}: {source}")]
    InvalidUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },

    /// The URL parsed but carries no host to route or certify
    #[error("URL {0:?} has no host")]
    MissingHost(String),

    /// No domain group survived parsing
    #[error("no domains given")]
    NoDomains,
}
