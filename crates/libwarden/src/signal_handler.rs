//! Signal funnel: converts POSIX signals into events the loop can poll.
//!
//! Handlers are write-only on a self-pipe and perform no other work: each
//! delivery writes a single byte carrying the signal number. The loop reads
//! the pipe as part of its normal multiplexing, so signals are observed in
//! kernel delivery order and never race the registry or job queue.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd};

use log::trace;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, pipe2};
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM};

/// The signals the daemon funnels through the pipe.
pub const FUNNELED_SIGNALS: [i32; 4] = [SIGHUP, SIGINT, SIGTERM, SIGCHLD];

pub struct SignalPipe {
    read_end: OwnedFd,
}

/// Install handlers for all funneled signals.
///
/// The write end of the pipe is intentionally leaked into the handlers,
/// which stay registered for the life of the process.
pub fn install() -> Result<SignalPipe, SignalError> {
    // Handlers stay registered for the life of the process; a write after
    // the pipe's reader is gone must come back as EPIPE, not SIGPIPE.
    // Children get the default disposition back before exec.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
    let (read_end, write_end) =
        pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).map_err(SignalError::Pipe)?;
    let write_fd = write_end.into_raw_fd();
    for sig in FUNNELED_SIGNALS {
        // The closure runs in signal context: one async-signal-safe write,
        // nothing else. A full pipe drops the byte, which is fine for the
        // signals funneled here (SIGCHLD is reaped exhaustively anyway).
        let res = unsafe {
            signal_hook::low_level::register(sig, move || {
                let byte = [sig as u8];
                let _ = libc::write(write_fd, byte.as_ptr().cast(), 1);
            })
        };
        res.map_err(SignalError::Register)?;
    }
    Ok(SignalPipe { read_end })
}

impl SignalPipe {
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.read_end.as_fd()
    }

    /// Read one funneled signal number, if any is pending.
    pub fn drain_one(&self) -> Result<Option<i32>, Errno> {
        let mut byte = [0u8; 1];
        loop {
            let n = unsafe {
                libc::read(self.read_end.as_raw_fd(), byte.as_mut_ptr().cast(), 1)
            };
            match n {
                1 => return Ok(Some(i32::from(byte[0]))),
                0 => return Ok(None),
                _ => match Errno::last() {
                    Errno::EINTR => continue,
                    Errno::EAGAIN => return Ok(None),
                    errno => return Err(errno),
                },
            }
        }
    }
}

#[derive(Debug)]
pub enum SignalError {
    Pipe(Errno),
    Register(std::io::Error),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe(e) => write!(f, "could not create signal pipe: {e}"),
            Self::Register(e) => write!(f, "could not register signal handler: {e}"),
        }
    }
}

impl std::error::Error for SignalError {}

/// How a reaped child ended.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(nix::sys::signal::Signal),
}

impl ChildStatus {
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Return code reported to clients: the exit code, or the negative
    /// signal number for a signal death, kept inside (−256, 256).
    pub fn reply_code(self) -> i32 {
        let code = match self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => -(sig as i32),
        };
        code.clamp(-255, 255)
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "status {code}"),
            Self::Signaled(sig) => write!(f, "signal {sig}"),
        }
    }
}

/// One step of the SIGCHLD reap loop. Multiple SIGCHLDs coalesce, so the
/// caller keeps calling until this returns `None`.
pub fn next_exited_child() -> Option<(Pid, ChildStatus)> {
    match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(pid, code)) => Some((pid, ChildStatus::Exited(code))),
        Ok(WaitStatus::Signaled(pid, signal, _dumped_core)) => {
            Some((pid, ChildStatus::Signaled(signal)))
        }
        Ok(WaitStatus::StillAlive) => None,
        Ok(other) => {
            // Stop/continue events are not exits; look for the next child.
            trace!("ignoring child state change: {other:?}");
            next_exited_child()
        }
        Err(Errno::ECHILD) => None,
        Err(e) => {
            trace!("error while waiting: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn reply_code_reports_signals_negatively() {
        assert_eq!(ChildStatus::Exited(7).reply_code(), 7);
        assert_eq!(ChildStatus::Signaled(Signal::SIGTERM).reply_code(), -15);
    }

    #[test]
    fn reply_code_stays_inside_the_open_interval() {
        assert_eq!(ChildStatus::Exited(300).reply_code(), 255);
        assert_eq!(ChildStatus::Exited(-400).reply_code(), -255);
    }

    #[test]
    fn only_a_zero_exit_is_success() {
        assert!(ChildStatus::Exited(0).success());
        assert!(!ChildStatus::Exited(1).success());
        assert!(!ChildStatus::Signaled(Signal::SIGKILL).success());
    }
}
