// This file is part of qnet-arbiter.

//! Command-line surface (§E), built with the same `clap` `App`/`Arg` builder style as
//! `examples/cloudflare-cfnts/src/cmd.rs`.

use crate::config::{ClientCertRequirement, MetricsConfig, Settings, TlsMode};
use crate::listener::AddressFamily;
use clap::{App, Arg};

pub fn app() -> App<'static, 'static> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(Box::leak(display_version().into_boxed_str()) as &'static str)
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(Arg::with_name("config").long("config").takes_value(true).help("Path to a config file"))
        .arg(Arg::with_name("listen-address").short("l").long("listen-address").takes_value(true))
        .arg(Arg::with_name("port").short("p").long("port").takes_value(true))
        .arg(Arg::with_name("ipv4").short("4").conflicts_with("ipv6"))
        .arg(Arg::with_name("ipv6").short("6").conflicts_with("ipv4"))
        .arg(Arg::with_name("foreground").short("f").long("foreground"))
        .arg(Arg::with_name("debug").short("d").long("debug").multiple(true))
        .arg(
            Arg::with_name("tls")
                .short("s")
                .long("tls")
                .takes_value(true)
                .possible_values(&["off", "on", "required"]),
        )
        .arg(
            Arg::with_name("client-cert")
                .short("c")
                .long("client-cert")
                .takes_value(true)
                .possible_values(&["never", "optional", "required"]),
        )
        .arg(Arg::with_name("max-clients").short("m").long("max-clients").takes_value(true))
        .arg(Arg::with_name("advanced").short("S").takes_value(true).multiple(true).number_of_values(1))
        .arg(Arg::with_name("metrics-addr").long("metrics-addr").takes_value(true))
        .arg(Arg::with_name("metrics-port").long("metrics-port").takes_value(true))
}

/// Apply parsed CLI flags on top of a config-file base, CLI always winning, matching the
/// layering used by `cfnts`'s subcommand config builders.
pub fn apply_overrides(matches: &clap::ArgMatches, settings: &mut Settings) -> Result<(), String> {
    if let Some(addr) = matches.value_of("listen-address") {
        settings.listen_addr = Some(addr.to_string());
    }
    if let Some(port) = matches.value_of("port") {
        settings.listen_port = port.parse().map_err(|_| format!("invalid port: {}", port))?;
    }
    if matches.is_present("ipv4") {
        settings.address_family = AddressFamily::V4;
    }
    if matches.is_present("ipv6") {
        settings.address_family = AddressFamily::V6;
    }
    settings.foreground = settings.foreground || matches.is_present("foreground");
    settings.debug_level = settings.debug_level.saturating_add(matches.occurrences_of("debug") as u8);

    if let Some(mode) = matches.value_of("tls") {
        settings.tls_mode = match mode {
            "off" => TlsMode::Off,
            "on" => TlsMode::On,
            "required" => TlsMode::Required,
            _ => unreachable!("restricted by possible_values"),
        };
    }
    if let Some(req) = matches.value_of("client-cert") {
        settings.tls_client_cert_required = match req {
            "never" => ClientCertRequirement::Never,
            "optional" => ClientCertRequirement::Optional,
            "required" => ClientCertRequirement::Required,
            _ => unreachable!("restricted by possible_values"),
        };
    }
    if let Some(max) = matches.value_of("max-clients") {
        settings.max_clients = max.parse().map_err(|_| format!("invalid max-clients: {}", max))?;
    }
    if let Some(values) = matches.values_of("advanced") {
        for value in values {
            crate::config::parse_advanced_arg(value, &mut settings.advanced)?;
        }
    }
    if let (Some(addr), Some(port)) = (matches.value_of("metrics-addr"), matches.value_of("metrics-port")) {
        settings.metrics = Some(MetricsConfig {
            addr: addr.to_string(),
            port: port.parse().map_err(|_| format!("invalid metrics-port: {}", port))?,
        });
    }
    Ok(())
}

/// `--version`-style banner, extended with the supported algorithm/message lists the way
/// `display_version` does in the original `corosync-qnetd.c`.
pub fn display_version() -> String {
    let algorithms: Vec<&str> = vec!["TEST", "FFSPLIT", "2NODELMS", "LMS"];
    format!(
        "{} {}\nsupported decision algorithms: {}\n",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        algorithms.join(", ")
    )
}
