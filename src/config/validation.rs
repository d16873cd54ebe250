//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (backlog, connection limits, nameserver count)
//! - Resolve the bind address before any socket exists
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Resolution is the only step that may touch the system resolver

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use thiserror::Error;

use crate::config::loader::ConfigError;
use crate::config::schema::{Config, ServerConfig, DNS_PORT, MAX_NAMESERVERS};

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("password is required")]
    MissingSecret,

    #[error("invalid bind address: {0}")]
    InvalidBindAddress(String),

    #[error("invalid nameserver: {0}")]
    InvalidNameserver(String),

    #[error("at most 4 nameservers are supported, got {0}")]
    TooManyNameservers(usize),

    #[error("listen backlog must be greater than zero")]
    ZeroBacklog,

    #[error("max_connections must be greater than zero")]
    ZeroMaxConnections,

    #[error("invalid metrics address: {0}")]
    InvalidMetricsAddress(String),
}

/// Check the configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    match config.password.as_deref() {
        None | Some("") => errors.push(ValidationError::MissingSecret),
        Some(_) => {}
    }

    if !is_well_formed_address(&config.listener.bind_address) {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    if config.resolver.nameservers.len() > MAX_NAMESERVERS {
        errors.push(ValidationError::TooManyNameservers(
            config.resolver.nameservers.len(),
        ));
    }
    for ns in &config.resolver.nameservers {
        if parse_nameserver(ns).is_none() {
            errors.push(ValidationError::InvalidNameserver(ns.clone()));
        }
    }

    if config.listener.backlog == 0 {
        errors.push(ValidationError::ZeroBacklog);
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }

    if let Some(addr) = &config.observability.metrics_address {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidMetricsAddress(addr.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and resolve a raw configuration into its immutable form.
pub fn resolve_config(raw: &ServerConfig) -> Result<Config, ConfigError> {
    validate_config(raw).map_err(ConfigError::Validation)?;

    let bind = resolve_bind_address(&raw.listener.bind_address)?;
    let nameservers = raw
        .resolver
        .nameservers
        .iter()
        .filter_map(|ns| parse_nameserver(ns))
        .collect();

    Ok(Config {
        bind,
        workers: raw.listener.workers,
        backlog: raw.listener.backlog,
        max_connections: raw.listener.max_connections,
        nameservers,
        idle_timeout: raw.timeouts.idle(),
        drain_timeout: raw.timeouts.drain_secs.map(std::time::Duration::from_secs),
        daemon: raw.daemon.enabled,
        pidfile: raw.daemon.pidfile.clone(),
        secret: raw.password.clone().unwrap_or_default(),
    })
}

/// Resolve "host:port" to the first address the system returns.
pub fn resolve_bind_address(addr: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = addr.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let invalid = || ConfigError::Validation(vec![ValidationError::InvalidBindAddress(addr.to_string())]);
    addr.to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}

/// Parse "ip" or "ip:port"; a bare address gets port 53.
pub fn parse_nameserver(ns: &str) -> Option<SocketAddr> {
    if let Ok(addr) = ns.parse::<SocketAddr>() {
        return Some(addr);
    }
    ns.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
}

fn is_well_formed_address(addr: &str) -> bool {
    if addr.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty()
                && port.parse::<u16>().is_ok()
                && host
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.password = Some("s3cret".into());
        config
    }

    #[test]
    fn default_with_secret_is_valid() {
        assert!(validate_config(&valid()).is_ok());
    }

    #[test]
    fn reports_every_error() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "not an address".into();
        config.listener.backlog = 0;
        config.resolver.nameservers = vec!["8.8.8.8".into(), "bogus".into()];

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::MissingSecret));
        assert!(errors.contains(&ValidationError::InvalidBindAddress("not an address".into())));
        assert!(errors.contains(&ValidationError::InvalidNameserver("bogus".into())));
        assert!(errors.contains(&ValidationError::ZeroBacklog));
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn empty_secret_is_missing() {
        let mut config = valid();
        config.password = Some(String::new());
        assert_eq!(
            validate_config(&config).unwrap_err(),
            vec![ValidationError::MissingSecret]
        );
    }

    #[test]
    fn too_many_nameservers() {
        let mut config = valid();
        config.resolver.nameservers = (1..=5).map(|i| format!("10.0.0.{i}")).collect();
        assert_eq!(
            validate_config(&config).unwrap_err(),
            vec![ValidationError::TooManyNameservers(5)]
        );
    }

    #[test]
    fn nameserver_port_defaults_to_53() {
        assert_eq!(
            parse_nameserver("1.1.1.1"),
            Some("1.1.1.1:53".parse().unwrap())
        );
        assert_eq!(
            parse_nameserver("1.1.1.1:5353"),
            Some("1.1.1.1:5353".parse().unwrap())
        );
        assert_eq!(parse_nameserver("[::1]:53"), Some("[::1]:53".parse().unwrap()));
        assert_eq!(parse_nameserver("dns.example"), None);
    }

    #[test]
    fn bind_address_shapes() {
        assert!(is_well_formed_address("127.0.0.1:1073"));
        assert!(is_well_formed_address("[::]:1073"));
        assert!(is_well_formed_address("localhost:1073"));
        assert!(!is_well_formed_address("127.0.0.1"));
        assert!(!is_well_formed_address("127.0.0.1:99999"));
        assert!(!is_well_formed_address(":1073"));
    }

    #[test]
    fn resolve_builds_immutable_config() {
        let mut raw = valid();
        raw.listener.bind_address = "127.0.0.1:1073".into();
        raw.listener.workers = 4;
        raw.resolver.nameservers = vec!["8.8.8.8".into()];
        raw.timeouts.drain_secs = Some(5);

        let config = resolve_config(&raw).unwrap();
        assert_eq!(config.bind, "127.0.0.1:1073".parse().unwrap());
        assert_eq!(config.workers, 4);
        assert_eq!(config.nameservers, vec!["8.8.8.8:53".parse().unwrap()]);
        assert_eq!(config.idle_timeout.as_secs(), 60);
        assert_eq!(config.drain_timeout.map(|d| d.as_secs()), Some(5));
        assert_eq!(config.secret, "s3cret");
    }

    #[test]
    fn resolve_rejects_malformed_bind() {
        let mut raw = valid();
        raw.listener.bind_address = "127.0.0.1".into();
        assert!(matches!(
            resolve_config(&raw),
            Err(ConfigError::Validation(errors)) if errors == vec![ValidationError::InvalidBindAddress("127.0.0.1".into())]
        ));
    }
}
