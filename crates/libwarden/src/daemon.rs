//! The daemon event loop.
//!
//! Single-threaded: one `poll` over the control socket and the signal
//! pipe, with a one-second tick that bounds the latency of time-gated
//! jobs. All socket I/O inside the loop is non-blocking; the only other
//! suspension point is the `WNOHANG` reap loop.

use std::fmt;
use std::path::PathBuf;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, raise};
use nix::sys::socket::UnixAddr;
use nix::unistd::Pid;
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM};

use crate::clock;
use crate::codec::{ErrorCode, Message};
use crate::conffile::ConfFile;
use crate::config::Settings;
use crate::jobs::{Job, JobPayload, JobQueue};
use crate::registry::{ActionKind, Registry};
use crate::request::{self, ExecCtx, Request, RequestFlags, RunError};
use crate::signal_handler::{self, ChildStatus, SignalError, SignalPipe};
use crate::transport::{
    ControlSocket, Datagram, PeerCreds, RecvOutcome, SendOutcome, TransportError,
};

pub struct Daemon {
    settings: Settings,
    conf_path: PathBuf,
    registry: Registry,
    jobs: JobQueue,
    socket: ControlSocket,
    signals: SignalPipe,
    shutdown: bool,
}

impl Daemon {
    /// Bind the control socket and install the signal funnel.
    pub fn new(
        conf_path: PathBuf,
        settings: Settings,
        registry: Registry,
    ) -> Result<Self, DaemonError> {
        let socket = ControlSocket::bind(&settings.socket_path)?;
        let signals = signal_handler::install()?;
        Ok(Self {
            settings,
            conf_path,
            registry,
            jobs: JobQueue::new(),
            socket,
            signals,
            shutdown: false,
        })
    }

    pub fn run(&mut self) -> Result<(), DaemonError> {
        info!(
            "listening on {} ({} programs)",
            self.settings.socket_path.display(),
            self.registry.len()
        );
        self.autostart()?;
        // A termination signal finishes the current iteration (the socket
        // is drained and due jobs run) before the loop condition exits.
        while !self.shutdown {
            let (sig_ready, sock_ready) = self.wait()?;
            if sig_ready {
                self.handle_signal()?;
            }
            if sock_ready {
                self.handle_datagram()?;
            }
            self.run_unbound_jobs()?;
        }
        info!("shutting down");
        Ok(())
    }

    /// Launch every program in the selected autostart group.
    fn autostart(&mut self) -> Result<(), DaemonError> {
        let group = self.settings.autostart;
        if group == 0 {
            return Ok(());
        }
        let names: Vec<String> = self
            .registry
            .iter()
            .filter(|p| p.autostart == group)
            .map(|p| p.name.clone())
            .collect();
        for name in names {
            info!("autostarting '{name}'");
            let req = Request::internal(
                name,
                ActionKind::Start,
                RequestFlags {
                    no_reply: true,
                    drop_if_running: true,
                    ..RequestFlags::default()
                },
            );
            self.run_one(req)?;
        }
        Ok(())
    }

    /// Block for up to one tick on the signal pipe and the control socket.
    fn wait(&self) -> Result<(bool, bool), DaemonError> {
        let mut fds = [
            PollFd::new(self.signals.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.socket.as_fd(), PollFlags::POLLIN),
        ];
        let timeout_ms = clock::TICK.as_millis() as u16;
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok((false, false)),
            Err(e) => return Err(DaemonError::Poll(e)),
        }
        let readable = |pf: &PollFd<'_>| {
            pf.revents().is_some_and(|r| {
                r.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
            })
        };
        Ok((readable(&fds[0]), readable(&fds[1])))
    }

    fn handle_signal(&mut self) -> Result<(), DaemonError> {
        let Some(sig) = self.signals.drain_one().map_err(DaemonError::SignalPipe)? else {
            return Ok(());
        };
        match sig {
            SIGHUP => {
                info!("reloading configuration");
                self.reload();
            }
            SIGINT | SIGTERM => {
                self.shutdown = true;
            }
            SIGCHLD => self.reap_children()?,
            other => debug!("ignoring funneled signal {other}"),
        }
        Ok(())
    }

    /// Re-read the configuration file and merge it over the live registry.
    /// Failures leave the old configuration in force.
    fn reload(&mut self) {
        let text = match std::fs::read_to_string(&self.conf_path) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    "could not read {}: {e}; keeping old configuration",
                    self.conf_path.display()
                );
                return;
            }
        };
        let file = match ConfFile::parse(&text) {
            Ok(file) => file,
            Err(e) => {
                warn!("could not parse configuration: {e}; keeping old configuration");
                return;
            }
        };
        let new_settings = match Settings::from_conffile(&file) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("bad global settings: {e}; keeping old configuration");
                return;
            }
        };
        if new_settings.socket_path != self.settings.socket_path {
            warn!(
                "socket path changes require a restart; staying on {}",
                self.settings.socket_path.display()
            );
        }
        match self.registry.reload(&new_settings, &file) {
            Ok(count) => {
                self.settings = Settings {
                    socket_path: self.settings.socket_path.clone(),
                    ..new_settings
                };
                info!("configuration reloaded ({count} programs)");
            }
            Err(e) => warn!("could not rebuild program registry: {e}"),
        }
    }

    /// SIGCHLDs coalesce; reap until the kernel has nothing left.
    fn reap_children(&mut self) -> Result<(), DaemonError> {
        while let Some((pid, status)) = signal_handler::next_exited_child() {
            self.handle_exit(pid, status)?;
        }
        Ok(())
    }

    fn handle_exit(&mut self, pid: Pid, status: ChildStatus) -> Result<(), DaemonError> {
        // Clear the owner's pid before its jobs run, so a queued start
        // does not trip over the stale value.
        let owner = match self.registry.get_by_pid_mut(pid) {
            Some(prog) => {
                prog.pid = None;
                Some(prog.name.clone())
            }
            None => None,
        };
        match &owner {
            Some(name) => info!("program '{name}' ({pid}) exited with {status}"),
            None => debug!("reaped pid {pid} ({status})"),
        }

        let ready = self.jobs.take_ready(pid.as_raw(), clock::now());
        self.run_jobs(ready, status)?;

        let Some(name) = owner else {
            return Ok(());
        };
        if self.registry.remove_if_lingering(&name) {
            info!("removed lingering program '{name}'");
            return Ok(());
        }
        // A job above may already have restarted the program; only a
        // still-running, still-childless one is supervised back to life.
        if let Some(prog) = self.registry.get(&name) {
            if prog.running && prog.pid.is_none() {
                if let Some(deadline) = clock::restart_deadline(clock::now(), prog.delay) {
                    info!("program '{name}' will restart in {}s", prog.delay);
                    let req = Request::internal(
                        name,
                        ActionKind::Start,
                        RequestFlags {
                            no_reply: true,
                            drop_if_not_running: true,
                            ..RequestFlags::default()
                        },
                    );
                    self.jobs.append(Job {
                        payload: JobPayload::Run(req),
                        waitfor: -1,
                        not_before: Some(deadline),
                        successor: None,
                    });
                }
            }
        }
        Ok(())
    }

    /// Run unbound jobs until none are ready; jobs gated on a future
    /// deadline stay queued for a later tick.
    fn run_unbound_jobs(&mut self) -> Result<(), DaemonError> {
        loop {
            let ready = self.jobs.take_ready(-1, clock::now());
            if ready.is_empty() {
                return Ok(());
            }
            self.run_jobs(ready, ChildStatus::Exited(0))?;
        }
    }

    fn run_jobs(&mut self, jobs: Vec<Job>, status: ChildStatus) -> Result<(), DaemonError> {
        for job in jobs {
            let mut ctx = ExecCtx {
                registry: &mut self.registry,
                jobs: &mut self.jobs,
                socket: &self.socket,
            };
            request::execute_job(&mut ctx, job, status)?;
        }
        Ok(())
    }

    fn run_one(&mut self, req: Request) -> Result<i32, DaemonError> {
        let mut ctx = ExecCtx {
            registry: &mut self.registry,
            jobs: &mut self.jobs,
            socket: &self.socket,
        };
        request::run_request(&mut ctx, req).map_err(DaemonError::Run)
    }

    fn handle_datagram(&mut self) -> Result<(), DaemonError> {
        match self.socket.recv(true)? {
            RecvOutcome::Datagram(dgram) => self.dispatch(dgram),
            RecvOutcome::WouldBlock | RecvOutcome::Invalid => Ok(()),
        }
    }

    fn dispatch(&mut self, dgram: Datagram) -> Result<(), DaemonError> {
        let Datagram {
            message,
            creds,
            fds,
            peer,
        } = dgram;
        if message.fields.is_empty() {
            return self.reply_err(peer.as_ref(), ErrorCode::Nomsg);
        }
        match message.field_str(0).unwrap_or("") {
            "PING" => {
                if message.fields.len() > 2 {
                    return self.reply_err(peer.as_ref(), ErrorCode::Badmsg);
                }
                let mut fields = vec![b"PONG".to_vec()];
                if let Some(token) = message.fields.get(1) {
                    fields.push(token.clone());
                }
                self.reply(peer.as_ref(), &Message::new(fields))
            }
            "SIGNAL" => self.dispatch_signal(&message, creds, peer),
            "RUN" => self.dispatch_run(message, creds, fds, peer),
            "LIST" => {
                let mut fields = vec![b"LISTING".to_vec()];
                for prog in self.registry.iter() {
                    fields.push(prog.name.clone().into_bytes());
                    fields.push(prog.state_label().into_bytes());
                }
                self.reply(peer.as_ref(), &Message::new(fields))
            }
            _ => self.reply_err(peer.as_ref(), ErrorCode::Badcmd),
        }
    }

    /// `SIGNAL reload|shutdown`: restricted to root and the daemon's own
    /// effective uid; acts by raising the signal on ourselves so the
    /// funnel stays the only entry into state changes.
    fn dispatch_signal(
        &mut self,
        message: &Message,
        creds: Option<PeerCreds>,
        peer: Option<UnixAddr>,
    ) -> Result<(), DaemonError> {
        if message.fields.len() != 2 {
            return self.reply_err(peer.as_ref(), ErrorCode::Badmsg);
        }
        let signal = match message.field_str(1) {
            Some("reload") => Signal::SIGHUP,
            Some("shutdown") => Signal::SIGTERM,
            _ => return self.reply_err(peer.as_ref(), ErrorCode::Badmsg),
        };
        let allowed = creds.is_some_and(|c| {
            c.is_valid() && (c.uid == 0 || c.uid == nix::unistd::geteuid().as_raw())
        });
        if !allowed {
            return self.reply_err(peer.as_ref(), ErrorCode::Eperm);
        }
        info!("control request: {}", message.field_str(1).unwrap_or(""));
        if let Err(e) = raise(signal) {
            warn!("could not raise {signal}: {e}");
        }
        self.reply(peer.as_ref(), &Message::ok(0))
    }

    fn dispatch_run(
        &mut self,
        message: Message,
        creds: Option<PeerCreds>,
        fds: Option<[std::os::fd::OwnedFd; 3]>,
        peer: Option<UnixAddr>,
    ) -> Result<(), DaemonError> {
        if message.fields.len() < 3 {
            return self.reply_err(peer.as_ref(), ErrorCode::Noparams);
        }
        let Some(prog_name) = message.field_str(1) else {
            return self.reply_err(peer.as_ref(), ErrorCode::Noprog);
        };
        let Some(prog) = self.registry.get(prog_name) else {
            return self.reply_err(peer.as_ref(), ErrorCode::Noprog);
        };
        let Some(kind) = message.field_str(2).and_then(ActionKind::from_name) else {
            return self.reply_err(peer.as_ref(), ErrorCode::Noaction);
        };
        let action = prog.action(kind);
        let Some(creds) = creds else {
            return self.reply_err(peer.as_ref(), ErrorCode::Eperm);
        };
        if !request::authorized(action, &creds) {
            info!(
                "denied {} '{}' for uid {} gid {}",
                kind.name(),
                prog_name,
                creds.uid,
                creds.gid
            );
            return self.reply_err(peer.as_ref(), ErrorCode::Eperm);
        }
        info!(
            "request from pid {} (uid {} gid {}): {} '{}'",
            creds.pid,
            creds.uid,
            creds.gid,
            kind.name(),
            prog_name
        );
        let req = Request {
            program: prog_name.to_owned(),
            kind,
            args: message.fields[3..]
                .iter()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect(),
            creds: Some(creds),
            fds,
            reply_to: peer,
            flags: RequestFlags::default(),
        };
        self.run_one(req)?;
        Ok(())
    }

    fn reply(
        &self,
        peer: Option<&UnixAddr>,
        msg: &Message,
    ) -> Result<(), DaemonError> {
        // Unrepliable peers get their side effects and nothing else.
        let Some(peer) = peer else {
            return Ok(());
        };
        match self.socket.send(msg, None, Some(peer), true) {
            Ok(SendOutcome::Sent(_)) => Ok(()),
            Ok(SendOutcome::WouldBlock) => {
                warn!("reply dropped: send would block");
                Ok(())
            }
            Err(e) => Err(DaemonError::Transport(e)),
        }
    }

    fn reply_err(
        &self,
        peer: Option<&UnixAddr>,
        code: ErrorCode,
    ) -> Result<(), DaemonError> {
        self.reply(peer, &Message::error(code))
    }
}

#[derive(Debug)]
pub enum DaemonError {
    Transport(TransportError),
    Signals(SignalError),
    SignalPipe(Errno),
    Poll(Errno),
    Run(RunError),
}

impl From<TransportError> for DaemonError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<SignalError> for DaemonError {
    fn from(e: SignalError) -> Self {
        Self::Signals(e)
    }
}

impl From<RunError> for DaemonError {
    fn from(e: RunError) -> Self {
        Self::Run(e)
    }
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{e}"),
            Self::Signals(e) => write!(f, "{e}"),
            Self::SignalPipe(e) => write!(f, "signal pipe read failed: {e}"),
            Self::Poll(e) => write!(f, "poll failed: {e}"),
            Self::Run(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DaemonError {}
