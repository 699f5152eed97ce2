use std::{fs, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_rustls::TlsConnector;

use crate::tls;

/// Main (internal) configuration.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// TCP address & port to bind to. Defaults to `127.0.0.1:4444`.
    #[serde(default = "default_bind")]
    pub(crate) bind: SocketAddr,
    /// Identifier sent in the `Proxy-agent` header of the responses we write
    /// ourselves.
    #[serde(default = "default_proxy_agent")]
    pub(crate) proxy_agent: String,
    /// Timeout, in seconds, for connecting to a destination (name resolution,
    /// TCP connection and TLS handshake if any).
    #[serde(default = "default_connect_timeout")]
    connect_timeout: u64,
    /// Timeout, in seconds, for receiving a complete request head from a
    /// client.
    #[serde(default = "default_header_timeout")]
    header_timeout: u64,
    /// Close relayed connections after this many seconds without any data
    /// moving in either direction. 0 disables the idle timeout.
    #[serde(default = "default_idle_timeout")]
    idle_timeout: u64,
    /// Maximum number of client connections handled at the same time. The
    /// listener stops accepting new connections when reached.
    #[serde(default = "default_max_connections")]
    pub(crate) max_connections: usize,
    /// Maximum size of a request head (request line + headers).
    #[serde(default = "default_max_header_size")]
    pub(crate) max_header_size: usize,
    /// PEM file of additional certificates to trust for https destinations,
    /// on top of the web PKI roots.
    #[serde(default)]
    ca_file: Option<PathBuf>,
    /// TLS client configuration for https destinations, built on first use.
    #[serde(skip)]
    tls: OnceCell<TlsConnector>,
}

impl Config {
    /// Parses a file in YAML formatted str and converts it to a `Config`
    /// representation.
    pub(crate) fn from_str(input: &str) -> Result<Config> {
        // An empty document is a valid configuration, using all the defaults.
        let config: Self = match input.trim().is_empty() {
            true => serde_yaml::from_str("{}")?,
            false => serde_yaml::from_str(input)?,
        };
        config.check()?;
        Ok(config)
    }

    /// Parses a file in YAML file and converts it to a `Config` representation.
    pub(crate) fn from_file(path: PathBuf) -> Result<Config> {
        Self::from_str(&fs::read_to_string(&path).map_err(|e| {
            anyhow!(
                "Could not read configuration file '{}': {e}",
                path.display()
            )
        })?)
    }

    /// Sanity check the configuration.
    fn check(&self) -> Result<()> {
        // The agent ends up in a header line, it must fit in one.
        if self.proxy_agent.is_empty() {
            bail!("proxy_agent can't be empty");
        }
        if self.proxy_agent.contains(['\r', '\n']) {
            bail!("proxy_agent can't contain line breaks");
        }

        if self.connect_timeout == 0 {
            bail!("connect_timeout must be > 0");
        }
        if self.header_timeout == 0 {
            bail!("header_timeout must be > 0");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be > 0");
        }
        if self.max_connections > Semaphore::MAX_PERMITS {
            bail!(
                "max_connections is too large ({} > {})",
                self.max_connections,
                Semaphore::MAX_PERMITS
            );
        }
        if self.max_header_size < 512 {
            bail!(
                "max_header_size is too small ({} < 512)",
                self.max_header_size
            );
        }

        // Report unusable CA files now rather than on the first https request.
        if self.ca_file.is_some() {
            self.tls_connector()?;
        }

        Ok(())
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub(crate) fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout)
    }

    /// TLS connector for https destinations.
    pub(crate) fn tls_connector(&self) -> Result<&TlsConnector> {
        self.tls
            .get_or_try_init(|| tls::connector(self.ca_file.as_deref()))
    }

    /// Idle timeout for relayed connections, if enabled.
    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout {
            0 => None,
            x => Some(Duration::from_secs(x)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            proxy_agent: default_proxy_agent(),
            connect_timeout: default_connect_timeout(),
            header_timeout: default_header_timeout(),
            idle_timeout: default_idle_timeout(),
            max_connections: default_max_connections(),
            max_header_size: default_max_header_size(),
            ca_file: None,
            tls: OnceCell::new(),
        }
    }
}

// Default values.
fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4444))
}
fn default_proxy_agent() -> String {
    env!("CARGO_PKG_NAME").to_string()
}
fn default_connect_timeout() -> u64 {
    3
}
fn default_header_timeout() -> u64 {
    3
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_max_connections() -> usize {
    1024
}
fn default_max_header_size() -> usize {
    // 8KB is the limit size on many web servers.
    8192
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_configs() {
        // Not a map.
        assert!(Config::from_str("foo").is_err());

        // Unknown key.
        assert!(Config::from_str("routes: []").is_err());

        // Malformed bind address.
        assert!(Config::from_str("bind: 127.0.0.1").is_err());
        assert!(Config::from_str("bind: foo:4444").is_err());

        // Agents must fit in a single header line.
        assert!(Config::from_str("proxy_agent: \"\"").is_err());
        assert!(Config::from_str("proxy_agent: \"foo\\r\\nX-Injected: 1\"").is_err());

        // Zero values which would make the proxy useless.
        assert!(Config::from_str("connect_timeout: 0").is_err());
        assert!(Config::from_str("header_timeout: 0").is_err());
        assert!(Config::from_str("max_connections: 0").is_err());
        assert!(Config::from_str("max_header_size: 100").is_err());

        // More connections than what can be tracked.
        assert!(Config::from_str(&format!("max_connections: {}", usize::MAX)).is_err());
        assert!(
            Config::from_str(&format!("max_connections: {}", Semaphore::MAX_PERMITS + 1)).is_err()
        );
        assert!(Config::from_str(&format!("max_connections: {}", Semaphore::MAX_PERMITS)).is_ok());

        // CA file which can't be used.
        assert!(Config::from_str("ca_file: /nonexistent/ca.pem").is_err());

        // Negative values.
        assert!(Config::from_str("idle_timeout: -1").is_err());
    }

    #[test]
    fn default_config() {
        let cfg = Config::from_str("").unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:4444".parse().unwrap());
        assert_eq!(cfg.proxy_agent, "httpproxy");
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.header_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.idle_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(cfg.max_connections, 1024);
        assert_eq!(cfg.max_header_size, 8192);
        assert!(cfg.ca_file.is_none());
        assert!(cfg.tls_connector().is_ok());

        let def = Config::default();
        assert_eq!(def.bind, cfg.bind);
        assert_eq!(def.proxy_agent, cfg.proxy_agent);
        assert_eq!(def.idle_timeout(), cfg.idle_timeout());
    }

    #[test]
    fn full_config() {
        let cfg = Config::from_str(
            "
bind: \"[::1]:8080\"
proxy_agent: Example-Proxy/1.0
connect_timeout: 10
header_timeout: 5
idle_timeout: 0
max_connections: 16
max_header_size: 16384
        ",
        )
        .unwrap();
        assert_eq!(cfg.bind, "[::1]:8080".parse().unwrap());
        assert_eq!(cfg.proxy_agent, "Example-Proxy/1.0");
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.header_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.idle_timeout(), None);
        assert_eq!(cfg.max_connections, 16);
        assert_eq!(cfg.max_header_size, 16384);
    }

    #[test]
    fn ca_file() {
        let cert = crate::tls::tests::TestCert::new();
        let cfg = Config::from_str(&format!("ca_file: {}", cert.ca_file.display())).unwrap();
        assert_eq!(cfg.ca_file.as_deref(), Some(cert.ca_file.as_path()));

        // Built once, then shared by all requests.
        let a = cfg.tls_connector().unwrap() as *const _;
        let b = cfg.tls_connector().unwrap() as *const _;
        assert!(a == b);
    }
}
