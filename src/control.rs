// This file is part of qnet-arbiter.

//! Control-socket worker (component C9): a line-oriented text protocol for local
//! administration, kept entirely separate from client protocol state — a malformed control
//! line never touches a client session or the main loop beyond the shutdown flag.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};

pub enum Command {
    Status { verbose: bool },
    Shutdown,
}

#[derive(Debug)]
pub enum ParseError {
    UnknownVerb(String),
    TooLong,
}

const MAX_LINE_LEN: usize = 256;

pub fn parse_line(line: &str) -> Result<Command, ParseError> {
    if line.len() > MAX_LINE_LEN {
        return Err(ParseError::TooLong);
    }
    let mut parts = line.trim().split_whitespace();
    match parts.next() {
        Some("status") => Ok(Command::Status {
            verbose: parts.next() == Some("verbose"),
        }),
        Some("shutdown") => Ok(Command::Shutdown),
        Some(other) => Err(ParseError::UnknownVerb(other.to_string())),
        None => Err(ParseError::UnknownVerb(String::new())),
    }
}

/// Read-only snapshot handed back for `status`, built by the instance from its own tables.
pub struct StatusSnapshot {
    pub active_clients: usize,
    pub active_clusters: usize,
    pub uptime_secs: u64,
}

impl StatusSnapshot {
    pub fn render(&self, verbose: bool) -> String {
        if verbose {
            format!(
                "clients={}\nclusters={}\nuptime_secs={}\n",
                self.active_clients, self.active_clusters, self.uptime_secs
            )
        } else {
            format!("clients={} clusters={}\n", self.active_clients, self.active_clusters)
        }
    }
}

pub fn bind(path: &str, backlog: i32) -> std::io::Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    let _ = backlog; // UnixListener has no separate backlog knob on this platform binding.
    Ok(listener)
}

/// Handle exactly one line from an already-accepted control connection and write the
/// response. The instance is responsible for deciding what `Shutdown` actually does; this
/// function only classifies the request and formats `OK`/`Error` framing.
pub fn handle_connection<F>(stream: UnixStream, mut on_shutdown: F, status: impl FnOnce() -> StatusSnapshot) -> std::io::Result<()>
where
    F: FnMut(),
{
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let mut writer = stream;
    match parse_line(&line) {
        Ok(Command::Status { verbose }) => {
            let snapshot = status();
            write!(writer, "OK\n{}", snapshot.render(verbose))?;
        }
        Ok(Command::Shutdown) => {
            writer.write_all(b"OK\n")?;
            on_shutdown();
        }
        Err(ParseError::UnknownVerb(verb)) => {
            write!(writer, "Error\nunknown command: {}\n", verb)?;
        }
        Err(ParseError::TooLong) => {
            writer.write_all(b"Error\nline too long\n")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_and_shutdown() {
        assert!(matches!(parse_line("status\n"), Ok(Command::Status { verbose: false })));
        assert!(matches!(parse_line("status verbose\n"), Ok(Command::Status { verbose: true })));
        assert!(matches!(parse_line("shutdown\n"), Ok(Command::Shutdown)));
    }

    #[test]
    fn unknown_verb_is_rejected() {
        assert!(matches!(parse_line("frobnicate\n"), Err(ParseError::UnknownVerb(_))));
    }

    #[test]
    fn oversized_line_is_rejected() {
        let line = "status ".to_string() + &"x".repeat(MAX_LINE_LEN + 1);
        assert!(matches!(parse_line(&line), Err(ParseError::TooLong)));
    }

    #[test]
    fn status_snapshot_renders_verbose_and_terse() {
        let snapshot = StatusSnapshot {
            active_clients: 2,
            active_clusters: 1,
            uptime_secs: 42,
        };
        assert_eq!(snapshot.render(false), "clients=2 clusters=1\n");
        assert!(snapshot.render(true).contains("uptime_secs=42"));
    }
}
