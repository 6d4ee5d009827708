// This file is part of qnet-arbiter.

use qnet_arbiter::cmd;
use qnet_arbiter::config::Settings;
use qnet_arbiter::instance::Instance;
use slog::{error, o};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::process;

fn build_logger(debug_level: u8, foreground: bool) -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(match debug_level {
        0 => Severity::Info,
        1 => Severity::Debug,
        _ => Severity::Trace,
    });
    if foreground {
        builder.destination(Destination::Stderr);
    }
    builder
        .build()
        .expect("BUG: TerminalLoggerBuilder::build shouldn't return an error")
}

fn main() {
    let matches = cmd::app().get_matches();

    let mut settings = match Settings::from_file(matches.value_of("config")) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("failed to load config: {}", err);
            process::exit(127);
        }
    };
    if let Err(err) = cmd::apply_overrides(&matches, &mut settings) {
        eprintln!("{}", err);
        process::exit(127);
    }

    let logger = build_logger(settings.debug_level, settings.foreground);
    let _guard = slog_scope::set_global_logger(logger.clone());
    slog_stdlog::init().expect("BUG: slog_stdlog::init should only fail if called twice");

    let instance = match Instance::start(settings, logger.new(o!("component" => "instance"))) {
        Ok(instance) => instance,
        Err(err) => {
            error!(logger, "failed to start"; "error" => %err);
            process::exit(127);
        }
    };

    let mut instance = instance;
    let code = instance.run();
    process::exit(if code == 0 { 0 } else { 127 });
}
