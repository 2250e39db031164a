//! Environment-variable configuration for both processes
//!
//! Both binaries are configured entirely from the environment; there is no
//! config file and no persisted state. Every variable is required and a
//! missing or unparsable value is a startup error naming the variable.

use std::env;
use std::path::PathBuf;

/// Configuration errors raised at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is absent or not unicode.
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    /// A variable is present but does not parse or is out of range.
    #[error("invalid value for {var}: {value}")]
    Invalid {
        /// The offending variable.
        var: &'static str,
        /// The raw value.
        value: String,
    },
}

fn var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn port(name: &'static str) -> Result<u16, ConfigError> {
    let raw = var(name)?;
    raw.parse().map_err(|_| ConfigError::Invalid {
        var: name,
        value: raw,
    })
}

fn participants(name: &'static str) -> Result<usize, ConfigError> {
    let raw = var(name)?;
    match raw.parse::<usize>() {
        Ok(n) if n >= 2 => Ok(n),
        _ => Err(ConfigError::Invalid {
            var: name,
            value: raw,
        }),
    }
}

/// Server process configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Interface to bind.
    pub hostname: String,
    /// Listening port.
    pub port: u16,
    /// PEM file with the self-signed certificate chain.
    pub cert_path: PathBuf,
    /// PEM file with the matching private key.
    pub key_path: PathBuf,
    /// Log file location.
    pub logfile_path: PathBuf,
    /// The question displayed to voters.
    pub question: String,
    /// The number of participants N (at least 2).
    pub participants: usize,
}

impl ServerConfig {
    /// Read the server configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            hostname: var("SERVER_HOSTNAME")?,
            port: port("PORT")?,
            cert_path: var("SERVER_SELF_SIGNED_CERT_PATH")?.into(),
            key_path: var("SERVER_PRIVATE_KEY_PATH")?.into(),
            logfile_path: var("SERVER_LOGFILE_PATH")?.into(),
            question: var("THE_QUESTION")?,
            participants: participants("NUM_PARTICIPANTS")?,
        })
    }
}

/// Client process configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server hostname to dial.
    pub hostname: String,
    /// Server port.
    pub port: u16,
    /// PEM file with the certificate to trust (the server's self-signed one).
    pub cert_path: PathBuf,
    /// Log file location.
    pub logfile_path: PathBuf,
    /// Expected number of participants, checked against the announced keys.
    pub participants: usize,
}

impl ClientConfig {
    /// Read the client configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ClientConfig {
            hostname: var("SERVER_HOSTNAME")?,
            port: port("PORT")?,
            cert_path: var("CLIENT_SELF_SIGNED_CERT_PATH")?.into(),
            logfile_path: var("CLIENT_LOGFILE_PATH")?.into(),
            participants: participants("PARTICIPANTS_NUMBER")?,
        })
    }
}
