// This file is part of qnet-arbiter.

//! Signal handling (ambient startup concern for C10): SIGINT/SIGTERM set a flag via the
//! classic self-pipe trick instead of doing any real work inside the handler itself, the same
//! direct, single-purpose `nix` syscall usage `lockfile.rs` uses for `flock`.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Async-signal-safe: a single non-blocking write of one byte, nothing else. The write end's
/// fd lives in a static because a bare `extern "C" fn` cannot capture anything.
extern "C" fn handle_signal(_signum: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let _ = unistd::write(fd, &[0u8]);
    }
}

/// Owns the pipe's read end. The write end is handed to the signal handler via the static
/// slot above and is never touched again on this side.
pub struct SelfPipe {
    read_fd: RawFd,
}

impl SelfPipe {
    /// Creates the pipe and installs SIGINT/SIGTERM handlers. Must be called once, before the
    /// readiness loop starts polling.
    pub fn install() -> nix::Result<SelfPipe> {
        let (read_fd, write_fd) = unistd::pipe()?;
        set_nonblocking(read_fd)?;
        set_nonblocking(write_fd)?;
        SIGNAL_WRITE_FD.store(write_fd, Ordering::Relaxed);

        unsafe {
            signal::signal(Signal::SIGINT, SigHandler::Handler(handle_signal))?;
            signal::signal(Signal::SIGTERM, SigHandler::Handler(handle_signal))?;
        }

        Ok(SelfPipe { read_fd })
    }

    /// Drains every byte currently queued and reports whether a signal arrived since the last
    /// call. Never blocks; called from the pre-poll phase so it runs once per loop iteration
    /// regardless of the read end's own readiness.
    pub fn drain(&self) -> bool {
        let mut received = false;
        let mut buf = [0u8; 64];
        loop {
            match unistd::read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(_) => received = true,
                Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => break,
                Err(_) => break,
            }
        }
        received
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}
