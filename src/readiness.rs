// This file is part of qnet-arbiter.

//! Single-threaded readiness loop (component C2): one `mio::Poll` driving every client
//! socket, the listener, the control socket, and the timer heap (C1), grounded on the
//! `mio::Poll`/`Token`/`Ready`/`PollOpt` usage in `examples/cloudflare-cfnts/src/nts_ke/server.rs`
//! but generalized from that file's hardcoded two-token layout into an open slab of
//! registered descriptors with per-entry callbacks, per this protocol's many long-lived
//! client connections.

use crate::timer::TimerHeap;
use mio::unix::EventedFd;
use mio::{Evented, Poll, PollOpt, Ready, Token};
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Wraps a raw fd (e.g. a `UnixListener`'s) so it can be registered through `Readiness`
/// alongside `mio::tcp` handles, which already implement `Evented` natively. Does not own or
/// close the fd — the caller keeps the original handle alive for as long as this is
/// registered.
pub struct RawFdSource(pub RawFd);

impl Evented for RawFdSource {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(&self.0).register(poll, token, interest, opts)
    }
    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(&self.0).reregister(poll, token, interest, opts)
    }
    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        EventedFd(&self.0).deregister(poll)
    }
}

/// Outcome of a pre-poll hook.
pub enum PrePollOutcome {
    Continue,
    Stop,
}

/// Outcome of an fd entry's `set_events` callback.
pub enum SetEventsOutcome {
    /// Register/keep registered with this final event mask.
    Accept(Ready),
    /// Omit this entry from the poll set this iteration.
    Skip,
    /// Abort the whole iteration.
    Abort,
    InternalErr,
}

pub enum CallbackResult {
    Ok,
    Err,
}

type SetEventsFn = Box<dyn FnMut(Ready) -> SetEventsOutcome>;
type IoCallback = Box<dyn FnMut() -> CallbackResult>;
type PrePollHook = Box<dyn FnMut(&mut Readiness) -> PrePollOutcome>;

struct FdEntry {
    handle: Box<dyn Evented>,
    interest: Ready,
    set_events: Option<SetEventsFn>,
    on_read: Option<IoCallback>,
    on_write: Option<IoCallback>,
    on_error: Option<IoCallback>,
}

/// A registered descriptor's identity in the loop. Stable across iterations until
/// `Readiness::remove` is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdHandle(usize);

/// Builder for one fd's callback set, handed to `Readiness::register`.
#[derive(Default)]
pub struct FdEntryBuilder {
    set_events: Option<SetEventsFn>,
    on_read: Option<IoCallback>,
    on_write: Option<IoCallback>,
    on_error: Option<IoCallback>,
}

impl FdEntryBuilder {
    pub fn new() -> FdEntryBuilder {
        FdEntryBuilder::default()
    }

    pub fn set_events<F>(mut self, f: F) -> Self
    where
        F: FnMut(Ready) -> SetEventsOutcome + 'static,
    {
        self.set_events = Some(Box::new(f));
        self
    }

    pub fn on_read<F>(mut self, f: F) -> Self
    where
        F: FnMut() -> CallbackResult + 'static,
    {
        self.on_read = Some(Box::new(f));
        self
    }

    pub fn on_write<F>(mut self, f: F) -> Self
    where
        F: FnMut() -> CallbackResult + 'static,
    {
        self.on_write = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnMut() -> CallbackResult + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// Return codes from `Readiness::exec`, matching the original poll-loop's convention.
pub const EXEC_OK: i32 = 0;
pub const EXEC_STOPPED: i32 = -1;
pub const EXEC_INTERNAL_ERR: i32 = -2;
pub const EXEC_POLL_ERR: i32 = -3;

pub struct Readiness {
    poll: Poll,
    entries: Vec<Option<FdEntry>>,
    free: Vec<usize>,
    pre_poll_hooks: Vec<PrePollHook>,
    events_buf: mio::Events,
    timers: Rc<RefCell<TimerHeap>>,
}

impl Readiness {
    pub fn new(events_capacity: usize) -> io::Result<Readiness> {
        Ok(Readiness {
            poll: Poll::new()?,
            entries: Vec::new(),
            free: Vec::new(),
            pre_poll_hooks: Vec::new(),
            events_buf: mio::Events::with_capacity(events_capacity),
            timers: Rc::new(RefCell::new(TimerHeap::new())),
        })
    }

    /// A shared handle to the timer heap, for callbacks registered via `FdEntryBuilder` that
    /// need to arm or reset a timer (e.g. a client resetting its dead-peer-detection deadline
    /// on inbound traffic) without holding a second `&mut Readiness`.
    pub fn timers(&self) -> Rc<RefCell<TimerHeap>> {
        self.timers.clone()
    }

    /// Insertions take effect starting with the next `exec` iteration: a hook may append to
    /// this list from within its own invocation without affecting the walk in progress. The
    /// hook receives `&mut Readiness` so it can freely `register`/`remove` entries itself
    /// (admitting newly accepted clients, tearing down disconnected ones) instead of queuing
    /// that work for some outer caller to perform between `exec()` calls.
    pub fn add_pre_poll_hook<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Readiness) -> PrePollOutcome + 'static,
    {
        self.pre_poll_hooks.push(Box::new(hook));
    }

    pub fn register(
        &mut self,
        handle: Box<dyn Evented>,
        interest: Ready,
        builder: FdEntryBuilder,
    ) -> io::Result<FdHandle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.entries.push(None);
                self.entries.len() - 1
            }
        };
        self.poll
            .register(handle.as_ref(), Token(index), interest, PollOpt::level())?;
        self.entries[index] = Some(FdEntry {
            handle,
            interest,
            set_events: builder.set_events,
            on_read: builder.on_read,
            on_write: builder.on_write,
            on_error: builder.on_error,
        });
        Ok(FdHandle(index))
    }

    pub fn remove(&mut self, handle: FdHandle) -> io::Result<()> {
        if let Some(entry) = self.entries[handle.0].take() {
            self.poll.deregister(entry.handle.as_ref())?;
            self.free.push(handle.0);
        }
        Ok(())
    }

    /// Update the static declared interest for an entry (before `set_events` runs on it).
    pub fn set_interest(&mut self, handle: FdHandle, interest: Ready) {
        if let Some(entry) = self.entries[handle.0].as_mut() {
            entry.interest = interest;
        }
    }

    /// One iteration: pre-poll hooks, build, wait, dispatch, timer expiry.
    pub fn exec(&mut self) -> i32 {
        // Hooks are moved out of `self` for the duration of the walk so each one can take
        // `&mut self` itself (to register/remove entries) without a double mutable borrow.
        // A hook appending to the list via `add_pre_poll_hook` during its own call only
        // affects the list once it's restored below, same as the fairness guarantee already
        // documented on `add_pre_poll_hook`.
        let mut hooks = std::mem::take(&mut self.pre_poll_hooks);
        let mut stop = false;
        for hook in hooks.iter_mut() {
            match hook(self) {
                PrePollOutcome::Continue => {}
                PrePollOutcome::Stop => {
                    stop = true;
                    break;
                }
            }
        }
        self.pre_poll_hooks.extend(hooks);
        if stop {
            return EXEC_STOPPED;
        }

        let mut active = Vec::new();
        for index in 0..self.entries.len() {
            let declared = match &self.entries[index] {
                Some(entry) => entry.interest,
                None => continue,
            };
            let outcome = {
                let entry = self.entries[index].as_mut().expect("checked Some above");
                match entry.set_events.as_mut() {
                    Some(cb) => cb(declared),
                    None => SetEventsOutcome::Accept(declared),
                }
            };
            match outcome {
                SetEventsOutcome::Accept(ready) => {
                    if ready.is_empty() {
                        continue;
                    }
                    let entry = self.entries[index].as_ref().expect("checked Some above");
                    if let Err(_) = self.poll.reregister(entry.handle.as_ref(), Token(index), ready, PollOpt::level()) {
                        return EXEC_INTERNAL_ERR;
                    }
                    active.push(index);
                }
                SetEventsOutcome::Skip => continue,
                SetEventsOutcome::Abort => return EXEC_STOPPED,
                SetEventsOutcome::InternalErr => return EXEC_INTERNAL_ERR,
            }
        }
        let _ = active;

        let timeout = self.timers.borrow().time_to_expire().map(|ms| Duration::from_millis(u64::from(ms)));
        if self.poll.poll(&mut self.events_buf, timeout).is_err() {
            return EXEC_POLL_ERR;
        }

        let mut ready_tokens = Vec::with_capacity(self.events_buf.len());
        for event in self.events_buf.iter() {
            ready_tokens.push((event.token().0, event.readiness()));
        }

        for (index, readiness) in ready_tokens {
            let mut entry = match self.entries.get_mut(index).and_then(Option::take) {
                Some(entry) => entry,
                None => continue,
            };
            let mut fired = false;
            let mut failed = false;

            if readiness.is_readable() || readiness.is_hup() {
                if let Some(cb) = entry.on_read.as_mut() {
                    fired = true;
                    if let CallbackResult::Err = cb() {
                        failed = true;
                    }
                }
            }
            if !failed && readiness.is_writable() {
                if let Some(cb) = entry.on_write.as_mut() {
                    fired = true;
                    if let CallbackResult::Err = cb() {
                        failed = true;
                    }
                }
            }
            if !failed && !fired {
                if let Some(cb) = entry.on_error.as_mut() {
                    if let CallbackResult::Err = cb() {
                        failed = true;
                    }
                }
            }

            // Removal is only ever done explicitly via `Readiness::remove`, driven by the
            // pre-poll deferred-disconnect hook — never from inside a dispatch callback — so
            // the entry always goes back regardless of what the callback returned.
            self.entries[index] = Some(entry);

            if failed {
                return EXEC_STOPPED;
            }
        }

        self.timers.borrow_mut().expire();
        EXEC_OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    #[test]
    fn fairness_every_ready_fd_dispatched_once_per_exec() {
        let (read_a, write_a) = pipe().unwrap();
        let (read_b, write_b) = pipe().unwrap();
        nix::unistd::write(write_a, b"x").unwrap();
        nix::unistd::write(write_b, b"y").unwrap();

        let mut loop_ = Readiness::new(16).unwrap();
        let hits = std::rc::Rc::new(std::cell::RefCell::new(0));
        let hits_a = hits.clone();
        let hits_b = hits.clone();

        loop_
            .register(
                Box::new(RawFdSource(read_a)),
                Ready::readable(),
                FdEntryBuilder::new().on_read(move || {
                    *hits_a.borrow_mut() += 1;
                    CallbackResult::Ok
                }),
            )
            .unwrap();
        loop_
            .register(
                Box::new(RawFdSource(read_b)),
                Ready::readable(),
                FdEntryBuilder::new().on_read(move || {
                    *hits_b.borrow_mut() += 1;
                    CallbackResult::Ok
                }),
            )
            .unwrap();

        let code = loop_.exec();
        assert_eq!(code, EXEC_OK);
        assert_eq!(*hits.borrow(), 2);

        nix::unistd::close(write_a).unwrap();
        nix::unistd::close(write_b).unwrap();
    }

    #[test]
    fn error_return_stops_iteration() {
        let (read_a, write_a) = pipe().unwrap();
        nix::unistd::write(write_a, b"x").unwrap();

        let mut loop_ = Readiness::new(16).unwrap();
        loop_
            .register(
                Box::new(RawFdSource(read_a)),
                Ready::readable(),
                FdEntryBuilder::new().on_read(|| CallbackResult::Err),
            )
            .unwrap();

        assert_eq!(loop_.exec(), EXEC_STOPPED);
        nix::unistd::close(write_a).unwrap();
    }
}
