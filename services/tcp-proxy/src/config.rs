//! Proxy configuration.
//!
//! Flags mirror the historical single-dash CLI (`-l`, `-r`, `-h`) with long
//! forms for the rest. Because `-h` selects hex traces, help is only
//! available as `--help`.
//!
//! Addresses are resolved once at startup. If the remote address does not
//! resolve, the in-cluster API server address from
//! `KUBERNETES_SERVICE_HOST` / `KUBERNETES_SERVICE_PORT_HTTPS` is used.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::warn;

use crate::error::ProxyError;
use crate::proxy::{
    client_config_from_ca_file, ListenerConfig, OutboundDialer, TlsUnwrap, TraceFormat,
};

pub const DEFAULT_LOCAL_ADDR: &str = ":443";
pub const DEFAULT_REMOTE_ADDR: &str = "kubernetes.default.svc:443";
pub const DEFAULT_METRICS_ADDR: &str = "127.0.0.1:3002";

pub const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
pub const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT_HTTPS";

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tcp-proxy",
    version,
    about = "TCP reverse proxy for a single upstream",
    disable_help_flag = true
)]
pub struct Args {
    /// Local address to listen on. An empty host listens on all interfaces.
    #[arg(short = 'l', long = "local", env = "PROXY_LOCAL_ADDR", default_value = DEFAULT_LOCAL_ADDR)]
    pub local: String,

    /// Upstream address to proxy to.
    #[arg(short = 'r', long = "remote", env = "PROXY_REMOTE_ADDR", default_value = DEFAULT_REMOTE_ADDR)]
    pub remote: String,

    /// Address for the metrics HTTP endpoint.
    #[arg(long = "metrics", env = "PROXY_METRICS_ADDR", default_value = DEFAULT_METRICS_ADDR)]
    pub metrics: String,

    /// Render chunk traces as hex dumps instead of raw text.
    #[arg(short = 'h', long = "hex")]
    pub hex: bool,

    /// Terminate TLS towards the upstream; clients speak plaintext.
    #[arg(long = "unwrap-tls")]
    pub unwrap_tls: bool,

    /// Server name for SNI and verification when unwrapping TLS.
    /// Defaults to the host part of the remote address.
    #[arg(long)]
    pub tls_server_name: Option<String>,

    /// PEM bundle of trust anchors for the upstream. Defaults to the web PKI roots.
    #[arg(long)]
    pub tls_ca_file: Option<PathBuf>,

    /// Maximum concurrent connections (0 = unlimited).
    #[arg(long, env = "PROXY_MAX_CONNECTIONS", default_value_t = 0)]
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "PROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Print help.
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    /// Remote as configured (or the fallback), before resolution.
    pub remote_target: String,
    pub metrics_addr: SocketAddr,
    pub output_hex: bool,
    pub unwrap_tls: bool,
    pub tls_server_name: String,
    pub tls_ca_file: Option<PathBuf>,
    pub max_connections: Option<usize>,
}

impl Args {
    /// Resolve all addresses, falling back to the in-cluster service address
    /// for the remote.
    pub async fn resolve(&self) -> Result<Config> {
        self.resolve_with_env(|key| std::env::var(key).ok()).await
    }

    pub async fn resolve_with_env<F>(&self, env: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let local_addr = resolve_addr(&self.local)
            .await
            .context("Failed to resolve local address")?;

        let metrics_addr = resolve_addr(&self.metrics)
            .await
            .context("Failed to resolve metrics address")?;

        let (remote_target, remote_addr) = resolve_remote(&self.remote, env).await?;

        let tls_server_name = match &self.tls_server_name {
            Some(name) => name.clone(),
            None => host_part(&remote_target).to_string(),
        };

        Ok(Config {
            local_addr,
            remote_addr,
            remote_target,
            metrics_addr,
            output_hex: self.hex,
            unwrap_tls: self.unwrap_tls,
            tls_server_name,
            tls_ca_file: self.tls_ca_file.clone(),
            max_connections: (self.max_connections > 0).then_some(self.max_connections),
        })
    }
}

impl Config {
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            bind_addr: self.local_addr,
            max_connections: self.max_connections,
            trace_format: TraceFormat::from_hex_flag(self.output_hex),
        }
    }

    /// Build the upstream dialer, loading TLS settings when unwrapping.
    pub fn outbound_dialer(&self) -> Result<OutboundDialer, ProxyError> {
        if !self.unwrap_tls {
            return Ok(OutboundDialer::plain(self.remote_addr));
        }

        let client_config = self
            .tls_ca_file
            .as_deref()
            .map(client_config_from_ca_file)
            .transpose()?;

        let tls = TlsUnwrap::new(
            self.remote_target.clone(),
            &self.tls_server_name,
            client_config,
        )?;
        Ok(OutboundDialer::with_tls(self.remote_addr, tls))
    }
}

/// Resolve `host:port` to its first socket address.
///
/// An empty host (`:443`) means the IPv6 unspecified address, which also
/// accepts IPv4 clients on dual-stack hosts.
pub async fn resolve_addr(addr: &str) -> Result<SocketAddr, ProxyError> {
    let normalized = match addr.strip_prefix(':') {
        Some(port) => format!("[::]:{}", port),
        None => addr.to_string(),
    };

    let resolve_error = |source| ProxyError::Resolve {
        addr: addr.to_string(),
        source,
    };

    let resolved = tokio::net::lookup_host(normalized.as_str())
        .await
        .map_err(resolve_error)?
        .next()
        .ok_or_else(|| {
            resolve_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses returned",
            ))
        })?;
    Ok(resolved)
}

/// Resolve the remote, falling back to the in-cluster service address.
///
/// Returns the target string that was resolved along with its address.
async fn resolve_remote<F>(remote: &str, env: F) -> Result<(String, SocketAddr)>
where
    F: Fn(&str) -> Option<String>,
{
    let primary_error = match resolve_addr(remote).await {
        Ok(addr) => return Ok((remote.to_string(), addr)),
        Err(e) => e,
    };

    let fallback = fallback_remote(&env).with_context(|| {
        format!(
            "{}; set {} and {} to use the in-cluster fallback",
            primary_error, SERVICE_HOST_ENV, SERVICE_PORT_ENV
        )
    })?;

    warn!(
        remote = %remote,
        fallback = %fallback,
        error = %primary_error,
        "Remote address did not resolve, using service environment fallback"
    );

    let addr = resolve_addr(&fallback)
        .await
        .context("Failed to resolve fallback remote address")?;
    Ok((fallback, addr))
}

fn fallback_remote<F>(env: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let host = env(SERVICE_HOST_ENV).filter(|h| !h.is_empty())?;
    let port = env(SERVICE_PORT_ENV).filter(|p| !p.is_empty())?;

    if host.contains(':') && !host.starts_with('[') {
        Some(format!("[{}]:{}", host, port))
    } else {
        Some(format!("{}:{}", host, port))
    }
}

/// Host portion of `host:port`, without IPv6 brackets.
fn host_part(target: &str) -> &str {
    let host = match target.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => target,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["tcp-proxy"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let args = args(&[]);
        assert_eq!(args.local, DEFAULT_LOCAL_ADDR);
        assert_eq!(args.metrics, DEFAULT_METRICS_ADDR);
        assert!(!args.hex);
        assert!(!args.unwrap_tls);
        assert_eq!(args.max_connections, 0);
    }

    #[test]
    fn test_short_flags() {
        let args = args(&["-l", "127.0.0.1:9000", "-r", "127.0.0.1:9100", "-h", "--unwrap-tls"]);
        assert_eq!(args.local, "127.0.0.1:9000");
        assert_eq!(args.remote, "127.0.0.1:9100");
        assert!(args.hex);
        assert!(args.unwrap_tls);
    }

    #[test]
    fn test_host_part() {
        assert_eq!(host_part("api.example.test:443"), "api.example.test");
        assert_eq!(host_part("[::1]:443"), "::1");
        assert_eq!(host_part("10.0.0.1:6443"), "10.0.0.1");
        assert_eq!(host_part("bare-host"), "bare-host");
    }

    #[test]
    fn test_fallback_remote() {
        let env = env_from(&[(SERVICE_HOST_ENV, "10.96.0.1"), (SERVICE_PORT_ENV, "443")]);
        assert_eq!(fallback_remote(&env).as_deref(), Some("10.96.0.1:443"));

        let env = env_from(&[(SERVICE_HOST_ENV, "fd00::1"), (SERVICE_PORT_ENV, "443")]);
        assert_eq!(fallback_remote(&env).as_deref(), Some("[fd00::1]:443"));

        let env = env_from(&[(SERVICE_HOST_ENV, "10.96.0.1")]);
        assert_eq!(fallback_remote(&env), None);
    }

    #[tokio::test]
    async fn test_resolve_empty_host() {
        let addr = resolve_addr(":8443").await.unwrap();
        assert_eq!(addr, "[::]:8443".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_uses_primary_remote() {
        let config = args(&["-l", "127.0.0.1:0", "-r", "127.0.0.1:9100"])
            .resolve_with_env(env_from(&[]))
            .await
            .unwrap();

        assert_eq!(config.remote_addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.remote_target, "127.0.0.1:9100");
        assert_eq!(config.tls_server_name, "127.0.0.1");
        assert_eq!(config.max_connections, None);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_service_env() {
        let config = args(&["-l", "127.0.0.1:0", "-r", "not a valid address"])
            .resolve_with_env(env_from(&[
                (SERVICE_HOST_ENV, "127.0.0.2"),
                (SERVICE_PORT_ENV, "6443"),
            ]))
            .await
            .unwrap();

        assert_eq!(config.remote_addr, "127.0.0.2:6443".parse().unwrap());
        assert_eq!(config.remote_target, "127.0.0.2:6443");
    }

    #[tokio::test]
    async fn test_resolve_fails_without_fallback() {
        let result = args(&["-l", "127.0.0.1:0", "-r", "not a valid address"])
            .resolve_with_env(env_from(&[]))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_outbound_dialer_plain_and_tls() {
        let config = args(&["-l", "127.0.0.1:0", "-r", "127.0.0.1:9100", "--max-connections", "8"])
            .resolve_with_env(env_from(&[]))
            .await
            .unwrap();
        assert_eq!(config.max_connections, Some(8));
        assert!(!config.outbound_dialer().unwrap().is_tls());

        let tls_config = Config {
            unwrap_tls: true,
            ..config
        };
        assert!(tls_config.outbound_dialer().unwrap().is_tls());
    }
}
