// This file is part of qnet-arbiter.

//! PID lock file (ambient persisted state, §G): acquired at startup, released at shutdown,
//! matching `corosync-qnetd.c`'s `utils_flock`/`another_instance_running` flow — an exclusive,
//! non-blocking `flock` on a file that then holds our PID as text.

use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

pub struct LockFile {
    file: File,
    path: std::path::PathBuf,
}

#[derive(Debug)]
pub enum LockError {
    AlreadyRunning,
    Io(io::Error),
}

impl From<io::Error> for LockError {
    fn from(err: io::Error) -> LockError {
        LockError::Io(err)
    }
}

impl LockFile {
    pub fn acquire(path: &str) -> Result<LockFile, LockError> {
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(nix::Error::Sys(nix::errno::EWOULDBLOCK)) => return Err(LockError::AlreadyRunning),
            Err(err) => return Err(LockError::Io(io::Error::new(io::ErrorKind::Other, err))),
        }

        let mut file = file;
        file.set_len(0)?;
        write!(file, "{}\n", std::process::id())?;
        file.flush()?;

        Ok(LockFile {
            file,
            path: Path::new(path).to_path_buf(),
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_on_same_path_fails() {
        let path = std::env::temp_dir().join(format!("qnet-arbiter-test-{}.lock", std::process::id()));
        let path_str = path.to_str().unwrap();

        let first = LockFile::acquire(path_str).expect("first acquire should succeed");
        let second = LockFile::acquire(path_str);
        assert!(matches!(second, Err(LockError::AlreadyRunning)));

        drop(first);
        let third = LockFile::acquire(path_str).expect("lock should be released");
        drop(third);
    }
}
