// This file is part of qnet-arbiter.

//! Runtime configuration (ambient, §C): a config-file base merged with CLI overrides, the
//! same two-layer pattern `ke_server/config.rs` uses (`config::Config::new()` +
//! `.merge(config::File::with_name(path))`), plus the repeated `-S key=value[,...]` advanced
//! settings syntax carried over from `corosync-qnetd.c`'s `cli_parse_long_opt`.

use crate::algorithm::TieBreaker;
use crate::error::WrapError;
use crate::listener::AddressFamily;
use config::{Config, File};
use std::convert::TryInto;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Off,
    On,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCertRequirement {
    Never,
    Optional,
    Required,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AdvancedSettings {
    pub listen_backlog: i32,
    pub max_client_send_buffers: usize,
    pub max_client_send_size: usize,
    pub max_client_receive_size: usize,
    pub cert_store_path: String,
    pub cert_nickname: String,
    pub heartbeat_interval_min: u32,
    pub heartbeat_interval_max: u32,
    pub dpd_enabled: bool,
    pub dpd_interval_coefficient: f64,
    pub lock_file: String,
    pub control_socket_path: String,
    pub control_socket_backlog: i32,
    pub tie_breaker: TieBreaker,
}

impl Default for AdvancedSettings {
    fn default() -> AdvancedSettings {
        AdvancedSettings {
            listen_backlog: 10,
            max_client_send_buffers: 32,
            max_client_send_size: 64 * 1024,
            max_client_receive_size: 64 * 1024,
            cert_store_path: "/etc/qnet-arbiter/nssdb".to_string(),
            cert_nickname: "QNetd Cert".to_string(),
            heartbeat_interval_min: 1000,
            heartbeat_interval_max: 30000,
            dpd_enabled: true,
            dpd_interval_coefficient: 3.0,
            lock_file: "/var/run/qnet-arbiterd.pid".to_string(),
            control_socket_path: "/var/run/qnet-arbiterd.sock".to_string(),
            control_socket_backlog: 10,
            tie_breaker: TieBreaker::Lowest,
        }
    }
}

impl AdvancedSettings {
    /// Apply one `key=value` pair from a `-S` option, matching
    /// `qnetd_advanced_settings_set`'s dispatch in the original C source.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "listen_backlog" => self.listen_backlog = value.parse().map_err(|_| bad(key, value))?,
            "max_client_send_buffers" => self.max_client_send_buffers = value.parse().map_err(|_| bad(key, value))?,
            "max_client_send_size" => self.max_client_send_size = value.parse().map_err(|_| bad(key, value))?,
            "max_client_receive_size" => self.max_client_receive_size = value.parse().map_err(|_| bad(key, value))?,
            "cert_store_path" => self.cert_store_path = value.to_string(),
            "cert_nickname" => self.cert_nickname = value.to_string(),
            "heartbeat_interval_min" => self.heartbeat_interval_min = value.parse().map_err(|_| bad(key, value))?,
            "heartbeat_interval_max" => self.heartbeat_interval_max = value.parse().map_err(|_| bad(key, value))?,
            "dpd_enabled" => self.dpd_enabled = value.parse().map_err(|_| bad(key, value))?,
            "dpd_interval_coefficient" => self.dpd_interval_coefficient = value.parse().map_err(|_| bad(key, value))?,
            "lock_file" => self.lock_file = value.to_string(),
            "control_socket_path" => self.control_socket_path = value.to_string(),
            "control_socket_backlog" => self.control_socket_backlog = value.parse().map_err(|_| bad(key, value))?,
            "tie_breaker" => self.tie_breaker = parse_tie_breaker(value).ok_or_else(|| bad(key, value))?,
            other => return Err(format!("unknown advanced setting: {}", other)),
        }
        Ok(())
    }
}

fn bad(key: &str, value: &str) -> String {
    format!("invalid value for {}: {}", key, value)
}

fn parse_tie_breaker(value: &str) -> Option<TieBreaker> {
    match value {
        "lowest" => Some(TieBreaker::Lowest),
        "highest" => Some(TieBreaker::Highest),
        other => other.parse::<u32>().ok().map(TieBreaker::NodeId),
    }
}

/// Parse one `-S opt=value[,opt2=value2,...]` occurrence.
pub fn parse_advanced_arg(arg: &str, into: &mut AdvancedSettings) -> Result<(), String> {
    for pair in arg.split(',') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next().ok_or_else(|| format!("malformed -S entry: {}", pair))?;
        into.apply(key, value)?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: Option<String>,
    pub listen_port: u16,
    pub address_family: AddressFamily,
    pub foreground: bool,
    pub debug_level: u8,
    pub tls_mode: TlsMode,
    pub tls_client_cert_required: ClientCertRequirement,
    pub max_clients: usize,
    pub advanced: AdvancedSettings,
    pub metrics: Option<MetricsConfig>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            listen_addr: None,
            listen_port: 5403,
            address_family: AddressFamily::Any,
            foreground: false,
            debug_level: 0,
            tls_mode: TlsMode::On,
            tls_client_cert_required: ClientCertRequirement::Optional,
            max_clients: 0,
            advanced: AdvancedSettings::default(),
            metrics: None,
        }
    }
}

impl Settings {
    /// Load the optional config file, if given, as the base layer. CLI flags are applied by
    /// the caller afterward (see `cmd.rs`), the same order `ke_server/config.rs` uses: file
    /// first, explicit overrides last.
    pub fn from_file(path: Option<&str>) -> Result<Settings, config::ConfigError> {
        let mut settings = Settings::default();
        let path = match path {
            Some(path) => path,
            None => return Ok(settings),
        };

        let mut layer = Config::new();
        layer.merge(File::with_name(path))?;

        if let Ok(addr) = layer.get_str("listen_addr") {
            settings.listen_addr = Some(addr);
        }
        if let Ok(port) = layer.get_int("listen_port") {
            settings.listen_port = port as u16;
        }
        if let Ok(max_clients) = layer.get_int("max_clients") {
            settings.max_clients = max_clients.try_into().wrap_err()?;
        }
        if let Ok(path) = layer.get_str("lock_file") {
            settings.advanced.lock_file = path;
        }
        if let Ok(path) = layer.get_str("control_socket_path") {
            settings.advanced.control_socket_path = path;
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_parses_known_keys() {
        let mut advanced = AdvancedSettings::default();
        advanced.apply("heartbeat_interval_min", "500").unwrap();
        assert_eq!(advanced.heartbeat_interval_min, 500);
    }

    #[test]
    fn apply_rejects_unknown_key() {
        let mut advanced = AdvancedSettings::default();
        assert!(advanced.apply("bogus", "1").is_err());
    }

    #[test]
    fn parse_advanced_arg_handles_multiple_pairs() {
        let mut advanced = AdvancedSettings::default();
        parse_advanced_arg("heartbeat_interval_min=200,dpd_enabled=false", &mut advanced).unwrap();
        assert_eq!(advanced.heartbeat_interval_min, 200);
        assert_eq!(advanced.dpd_enabled, false);
    }

    #[test]
    fn tie_breaker_accepts_numeric_node_id() {
        assert_eq!(parse_tie_breaker("42"), Some(TieBreaker::NodeId(42)));
    }
}
