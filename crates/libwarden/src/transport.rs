//! Local datagram transport for the control plane.
//!
//! One unix datagram socket per daemon. The server binds it world-writable
//! (authorization happens per message against peer credentials, not via
//! file permissions) and replies to each datagram's source address. Clients
//! connect; enabling credential passing makes the kernel autobind the
//! client socket, which is what gives the server an address to reply to.
//!
//! Credentials ride as `SCM_CREDENTIALS` on every message in both
//! directions. A triple of standard-I/O file descriptors may ride along as
//! `SCM_RIGHTS`; anything that is not exactly a triple is closed on the
//! spot so nothing leaks.

use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::socket::{
    self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
    UnixAddr, UnixCredentials, getsockname, sockopt,
};

use crate::codec::{CodecError, ErrorCode, MSG_MAXLEN, Message};

/// Size of the ancillary data buffer: enough for credentials plus a couple
/// of fd triples.
const ANCBUF_SIZE: usize = 256;

/// Kernel-attached credentials of a message's sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerCreds {
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl PeerCreds {
    /// Both ids must be real; the kernel uses all-ones for "unset".
    pub fn is_valid(&self) -> bool {
        self.uid != libc::uid_t::MAX && self.gid != libc::gid_t::MAX
    }

    pub fn uid_matches(&self, allow: i32) -> bool {
        allow >= 0 && i64::from(self.uid) == i64::from(allow)
    }

    pub fn gid_matches(&self, allow: i32) -> bool {
        allow >= 0 && i64::from(self.gid) == i64::from(allow)
    }
}

impl From<UnixCredentials> for PeerCreds {
    fn from(c: UnixCredentials) -> Self {
        Self {
            pid: c.pid(),
            uid: c.uid(),
            gid: c.gid(),
        }
    }
}

/// One received datagram with its out-of-band payload.
#[derive(Debug)]
pub struct Datagram {
    pub message: Message,
    pub creds: Option<PeerCreds>,
    /// Forwarded stdin/stdout/stderr, present only if exactly three fds
    /// arrived.
    pub fds: Option<[OwnedFd; 3]>,
    /// Source address, already filtered for repliability; `None` means any
    /// reply must be silently dropped.
    pub peer: Option<UnixAddr>,
}

#[derive(Debug)]
pub enum SendOutcome {
    Sent(usize),
    WouldBlock,
}

#[derive(Debug)]
pub enum RecvOutcome {
    Datagram(Datagram),
    WouldBlock,
    /// A malformed datagram arrived and was answered with `BADMSG`; the
    /// caller should retry on the next readiness event.
    Invalid,
}

pub struct ControlSocket {
    fd: OwnedFd,
    unlink_on_drop: Option<PathBuf>,
}

impl ControlSocket {
    /// Server side: replace whatever sits at `path` and listen for
    /// datagrams. The path is unlinked again when the socket is dropped.
    pub fn bind(path: &Path) -> Result<Self, TransportError> {
        let _ = std::fs::remove_file(path);
        let addr = UnixAddr::new(path).map_err(TransportError::Io)?;
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(TransportError::Io)?;
        if unsafe { libc::fchmod(fd.as_raw_fd(), 0o777) } == -1 {
            return Err(TransportError::Io(Errno::last()));
        }
        socket::bind(fd.as_raw_fd(), &addr).map_err(TransportError::Io)?;
        socket::setsockopt(&fd, sockopt::PassCred, &true).map_err(TransportError::Io)?;
        Ok(Self {
            fd,
            unlink_on_drop: Some(path.to_owned()),
        })
    }

    /// Client side: connect to a running daemon.
    pub fn connect(path: &Path) -> Result<Self, TransportError> {
        let addr = UnixAddr::new(path).map_err(TransportError::Io)?;
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(TransportError::Io)?;
        socket::connect(fd.as_raw_fd(), &addr).map_err(TransportError::Io)?;
        socket::setsockopt(&fd, sockopt::PassCred, &true).map_err(TransportError::Io)?;
        Ok(Self {
            fd,
            unlink_on_drop: None,
        })
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn local_addr(&self) -> Result<UnixAddr, TransportError> {
        getsockname::<UnixAddr>(self.fd.as_raw_fd()).map_err(TransportError::Io)
    }

    /// Send one message, with our credentials attached and an optional fd
    /// triple. `peer == None` sends to the connected address.
    pub fn send(
        &self,
        msg: &Message,
        fds: Option<&[RawFd; 3]>,
        peer: Option<&UnixAddr>,
        dontwait: bool,
    ) -> Result<SendOutcome, TransportError> {
        let buf = msg.encode()?;
        let creds = self_credentials();
        let mut cmsgs: Vec<ControlMessage<'_>> = vec![ControlMessage::ScmCredentials(&creds)];
        if let Some(fds) = fds {
            cmsgs.push(ControlMessage::ScmRights(&fds[..]));
        }
        let iov = [IoSlice::new(&buf)];
        let flags = if dontwait {
            MsgFlags::MSG_DONTWAIT
        } else {
            MsgFlags::empty()
        };
        match socket::sendmsg::<UnixAddr>(self.fd.as_raw_fd(), &iov, &cmsgs, flags, peer) {
            Ok(n) => Ok(SendOutcome::Sent(n)),
            Err(Errno::EAGAIN) if dontwait => Ok(SendOutcome::WouldBlock),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    pub fn send_err(
        &self,
        code: ErrorCode,
        peer: Option<&UnixAddr>,
        dontwait: bool,
    ) -> Result<SendOutcome, TransportError> {
        self.send(&Message::error(code), None, peer, dontwait)
    }

    /// Receive one datagram.
    ///
    /// Malformed datagrams (truncated, or not NUL-terminated) are answered
    /// with `BADMSG` here and reported as [`RecvOutcome::Invalid`]; only a
    /// failure to send that error reply is an error.
    pub fn recv(&self, dontwait: bool) -> Result<RecvOutcome, TransportError> {
        let mut buf = vec![0u8; MSG_MAXLEN];
        let mut cmsg_buf: Vec<u8> = Vec::with_capacity(ANCBUF_SIZE);
        let flags = if dontwait {
            MsgFlags::MSG_DONTWAIT
        } else {
            MsgFlags::empty()
        };
        let (bytes, truncated, peer, creds, fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = match socket::recvmsg::<UnixAddr>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                flags,
            ) {
                Ok(msg) => msg,
                Err(Errno::EAGAIN) if dontwait => return Ok(RecvOutcome::WouldBlock),
                Err(e) => return Err(TransportError::Io(e)),
            };
            let mut creds: Option<PeerCreds> = None;
            let mut fds: Option<[OwnedFd; 3]> = None;
            if let Ok(cmsgs) = msg.cmsgs() {
                for cmsg in cmsgs {
                    match cmsg {
                        ControlMessageOwned::ScmRights(raw) => {
                            let owned: Vec<OwnedFd> = raw
                                .iter()
                                .map(|fd| unsafe { OwnedFd::from_raw_fd(*fd) })
                                .collect();
                            // Exactly one triple is accepted; any other
                            // count, and any further fd item, is closed
                            // when `owned` drops.
                            if owned.len() == 3 && fds.is_none() {
                                let mut it = owned.into_iter();
                                fds = Some([
                                    it.next().unwrap(),
                                    it.next().unwrap(),
                                    it.next().unwrap(),
                                ]);
                            }
                        }
                        ControlMessageOwned::ScmCredentials(c) => {
                            if creds.is_none() {
                                creds = Some(PeerCreds::from(c));
                            }
                        }
                        _ => {}
                    }
                }
            }
            (
                msg.bytes,
                msg.flags.contains(MsgFlags::MSG_TRUNC),
                msg.address,
                creds,
                fds,
            )
        };
        let peer = repliable(peer);
        if truncated {
            drop(fds);
            self.send_err(ErrorCode::Badmsg, peer.as_ref(), dontwait)?;
            return Ok(RecvOutcome::Invalid);
        }
        match Message::decode(&buf[..bytes]) {
            Ok(message) => Ok(RecvOutcome::Datagram(Datagram {
                message,
                creds,
                fds,
                peer,
            })),
            Err(_) => {
                drop(fds);
                self.send_err(ErrorCode::Badmsg, peer.as_ref(), dontwait)?;
                Ok(RecvOutcome::Invalid)
            }
        }
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        if let Some(path) = &self.unlink_on_drop {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// A reply address is usable only if the peer was actually bound to
/// something; unnamed sources cannot be replied to.
fn repliable(addr: Option<UnixAddr>) -> Option<UnixAddr> {
    addr.filter(|a| a.path().is_some() || a.as_abstract().is_some())
}

/// Credentials stamped onto outgoing messages, matching what the kernel
/// will verify for an unprivileged sender.
fn self_credentials() -> UnixCredentials {
    UnixCredentials::from(libc::ucred {
        pid: unsafe { libc::getpid() },
        uid: unsafe { libc::geteuid() },
        gid: unsafe { libc::getegid() },
    })
}

#[derive(Debug)]
pub enum TransportError {
    Codec(CodecError),
    Io(Errno),
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "socket error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unnamed_peer_is_not_repliable() {
        assert!(repliable(None).is_none());
        assert!(repliable(Some(UnixAddr::new_unnamed())).is_none());
        let named = UnixAddr::new("/tmp/x").unwrap();
        assert!(repliable(Some(named)).is_some());
    }

    #[test]
    fn own_credentials_are_valid() {
        let creds = PeerCreds::from(self_credentials());
        assert!(creds.is_valid());
        assert_eq!(creds.pid, unsafe { libc::getpid() });
    }

    #[test]
    fn credential_matching_ignores_the_none_sentinel() {
        let creds = PeerCreds {
            pid: 1,
            uid: libc::uid_t::MAX,
            gid: 0,
        };
        assert!(!creds.is_valid());
        // A uid of −1 in the action must never match the unset sentinel.
        assert!(!creds.uid_matches(-1));
    }
}
