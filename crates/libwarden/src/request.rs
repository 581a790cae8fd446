//! Request execution pipeline.
//!
//! A request is a validated intent to perform one action on one program.
//! Wire-originated requests are authorized by the loop before they get
//! here; synthesized ones (autostart, supervised restarts, the halves of a
//! default restart) carry no credentials and are trusted.
//!
//! Requests re-resolve their program by name on every run: a program can
//! vanish between scheduling and execution (reload with remove-pending),
//! and a stale handle must degrade to `NOPROG`, not dangle.

use std::ffi::CString;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::socket::UnixAddr;
use nix::unistd::{ForkResult, Pid, fork};

use crate::codec::{ErrorCode, Message};
use crate::config::{ACTION_PATH, ACTION_SHELL};
use crate::jobs::{Job, JobPayload, JobQueue};
use crate::registry::{Action, ActionKind, Registry};
use crate::signal_handler::ChildStatus;
use crate::transport::{ControlSocket, PeerCreds, SendOutcome, TransportError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// Never send a reply, even if a reply address is present.
    pub no_reply: bool,
    /// Drop the request silently if the program is marked running.
    pub drop_if_running: bool,
    /// Drop the request silently if the program is not marked running.
    pub drop_if_not_running: bool,
    /// Leave the program's desired-state flag untouched.
    pub no_flags_update: bool,
}

#[derive(Debug)]
pub struct Request {
    /// Name of the target program, re-resolved at run time.
    pub program: String,
    pub kind: ActionKind,
    /// Extra positional arguments handed to the action shell.
    pub args: Vec<String>,
    /// Peer credentials; `None` marks an internally synthesized request.
    pub creds: Option<PeerCreds>,
    /// Forwarded stdin/stdout/stderr, owned by this request.
    pub fds: Option<[OwnedFd; 3]>,
    pub reply_to: Option<UnixAddr>,
    pub flags: RequestFlags,
}

impl Request {
    pub fn internal(program: String, kind: ActionKind, flags: RequestFlags) -> Self {
        Self {
            program,
            kind,
            args: Vec::new(),
            creds: None,
            fds: None,
            reply_to: None,
            flags,
        }
    }

    pub fn wants_reply(&self) -> bool {
        !self.flags.no_reply && self.reply_to.is_some()
    }

    /// Duplicate the request, giving the copy its own fd triple.
    pub fn try_clone(&self) -> std::io::Result<Self> {
        let fds = match &self.fds {
            Some([a, b, c]) => Some([a.try_clone()?, b.try_clone()?, c.try_clone()?]),
            None => None,
        };
        Ok(Self {
            program: self.program.clone(),
            kind: self.kind,
            args: self.args.clone(),
            creds: self.creds,
            fds,
            reply_to: self.reply_to,
            flags: self.flags,
        })
    }
}

/// A pending reply: sends `OK <code>` once the awaited child exits.
#[derive(Debug)]
pub struct Waiter {
    pub reply_to: UnixAddr,
}

/// Whether the peer may invoke this action: root always may, anyone else
/// needs a uid or gid match against the action's allow entries.
pub fn authorized(action: &Action, creds: &PeerCreds) -> bool {
    if !creds.is_valid() {
        return false;
    }
    if creds.uid == 0 {
        return true;
    }
    creds.uid_matches(action.allow_uid) || creds.gid_matches(action.allow_gid)
}

/// Mutable slice of daemon state a request may touch while running.
pub struct ExecCtx<'a> {
    pub registry: &'a mut Registry,
    pub jobs: &'a mut JobQueue,
    pub socket: &'a ControlSocket,
}

#[derive(Debug)]
pub enum RunError {
    /// A reply could not be delivered at all.
    Reply(TransportError),
    Fork(Errno),
    BadString(String),
    CloneFds(std::io::Error),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reply(e) => write!(f, "could not deliver reply: {e}"),
            Self::Fork(e) => write!(f, "fork failed: {e}"),
            Self::BadString(s) => write!(f, "string not usable across exec: {s:?}"),
            Self::CloneFds(e) => write!(f, "could not duplicate forwarded fds: {e}"),
        }
    }
}

impl std::error::Error for RunError {}

/// Execute one request.
///
/// Returns the completion pid: the child whose exit marks this action as
/// finished (a spawned process, or the program's own pid for the built-in
/// stop), or 0 when the action completed synchronously. Successor jobs are
/// chained onto that pid.
pub fn run_request(ctx: &mut ExecCtx<'_>, req: Request) -> Result<i32, RunError> {
    let (action, prog_pid, prog_running, prog_cwd) = match ctx.registry.get(&req.program) {
        Some(prog) => (
            prog.action(req.kind).clone(),
            prog.pid,
            prog.running,
            prog.cwd.clone(),
        ),
        None => {
            reply_err(ctx.socket, &req, ErrorCode::Noprog)?;
            return Ok(0);
        }
    };

    // Synthesized requests drop out when the desired state changed between
    // scheduling and execution.
    if req.flags.drop_if_running && prog_running {
        debug!("dropping {} '{}': already running", req.kind.name(), req.program);
        return Ok(0);
    }
    if req.flags.drop_if_not_running && !prog_running {
        debug!("dropping {} '{}': no longer running", req.kind.name(), req.program);
        return Ok(0);
    }

    // Desired state updates before the pre-checks: a stop for a program
    // whose child just exited still clears the running flag, so a queued
    // supervised restart finds it cleared and drops itself.
    if !req.flags.no_flags_update {
        let desired = match req.kind {
            ActionKind::Start | ActionKind::Restart => Some(true),
            ActionKind::Stop => Some(false),
            _ => None,
        };
        if let (Some(state), Some(prog)) = (desired, ctx.registry.get_mut(&req.program)) {
            prog.running = state;
        }
    }

    match req.kind {
        ActionKind::Start if prog_pid.is_some() => {
            reply_err(ctx.socket, &req, ErrorCode::Busy)?;
            return Ok(0);
        }
        ActionKind::Restart | ActionKind::Reload | ActionKind::Stop if prog_pid.is_none() => {
            reply_err(ctx.socket, &req, ErrorCode::Notrunning)?;
            return Ok(0);
        }
        _ => {}
    }

    match &action.command {
        Some(command) => spawn_action(ctx, req, &action, command, prog_pid, prog_cwd.as_deref()),
        None => run_default(ctx, req, prog_pid),
    }
}

/// Execute one released job and chain its successor.
///
/// The successor is re-keyed to the pid the job's run produced (unbound
/// if it produced none) and prepended, so it sits ahead of any older
/// entry that might also be waiting on that pid.
pub fn execute_job(ctx: &mut ExecCtx<'_>, job: Job, status: ChildStatus) -> Result<(), RunError> {
    let Job {
        payload, successor, ..
    } = job;
    let spawned = match payload {
        JobPayload::Run(req) => run_request(ctx, req)?,
        JobPayload::Reply(waiter) => {
            run_waiter(ctx.socket, &waiter, status)?;
            0
        }
    };
    if let Some(mut succ) = successor {
        succ.waitfor = if spawned > 0 { spawned } else { -1 };
        ctx.jobs.prepend(*succ);
    }
    Ok(())
}

/// Send the reply for a released waiter.
pub fn run_waiter(
    socket: &ControlSocket,
    waiter: &Waiter,
    status: ChildStatus,
) -> Result<(), RunError> {
    let msg = Message::ok(status.reply_code());
    match socket.send(&msg, None, Some(&waiter.reply_to), true) {
        Ok(SendOutcome::Sent(_)) => Ok(()),
        Ok(SendOutcome::WouldBlock) => {
            warn!("reply dropped: send would block");
            Ok(())
        }
        Err(e) => Err(RunError::Reply(e)),
    }
}

/// Fork and exec a configured action command.
fn spawn_action(
    ctx: &mut ExecCtx<'_>,
    mut req: Request,
    action: &Action,
    command: &str,
    prog_pid: Option<Pid>,
    prog_cwd: Option<&Path>,
) -> Result<i32, RunError> {
    let plan = ExecPlan::prepare(&req, action, command, prog_pid, prog_cwd)?;
    let raw_fds = req.fds.as_ref().map(|f| f.each_ref().map(|fd| fd.as_raw_fd()));
    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => plan.exec_child(raw_fds),
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => return Err(RunError::Fork(e)),
    };
    debug!(
        "spawned pid {} for '{}' {}",
        child,
        req.program,
        req.kind.name()
    );
    match req.kind {
        ActionKind::Start | ActionKind::Restart => {
            // The spawned process becomes the program's main child; tell
            // the client right away instead of waiting for it to exit.
            if let Some(prog) = ctx.registry.get_mut(&req.program) {
                prog.pid = Some(child);
            }
            reply_ok(ctx.socket, &req, 0)?;
        }
        _ => install_waiter(ctx.jobs, &mut req, child),
    }
    Ok(child.as_raw())
}

/// Built-in behavior for actions without a configured command.
fn run_default(
    ctx: &mut ExecCtx<'_>,
    mut req: Request,
    prog_pid: Option<Pid>,
) -> Result<i32, RunError> {
    match req.kind {
        ActionKind::Start => {
            reply_err(ctx.socket, &req, ErrorCode::Nocmd)?;
            Ok(0)
        }
        ActionKind::Restart => run_default_restart(ctx, req),
        ActionKind::Reload => {
            req.kind = ActionKind::Restart;
            run_request(ctx, req)
        }
        ActionKind::Signal => {
            reply_ok(ctx.socket, &req, 0)?;
            Ok(0)
        }
        ActionKind::Stop => {
            let Some(pid) = prog_pid else {
                // Pre-checks guarantee a pid; a vanished one means the
                // child exited in this very iteration.
                reply_err(ctx.socket, &req, ErrorCode::Notrunning)?;
                return Ok(0);
            };
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                debug!("kill {pid} failed: {e}");
            }
            install_waiter(ctx.jobs, &mut req, pid);
            Ok(pid.as_raw())
        }
        ActionKind::Status => {
            let child = spawn_status_probe(&req, prog_pid.is_some())?;
            install_waiter(ctx.jobs, &mut req, child);
            Ok(child.as_raw())
        }
    }
}

/// Default restart: run the stop action now, with the start action as its
/// successor, keyed to whatever pid the stop's completion hangs on.
fn run_default_restart(ctx: &mut ExecCtx<'_>, req: Request) -> Result<i32, RunError> {
    // Both halves need their own fd duplicates: the stop half may exec a
    // configured command, the start half replies to the client.
    let mut stop_req = req.try_clone().map_err(RunError::CloneFds)?;
    stop_req.kind = ActionKind::Stop;
    stop_req.reply_to = None;
    stop_req.flags.no_reply = true;
    // The desired state stays "running" across the whole chain.
    stop_req.flags.no_flags_update = true;

    let mut start_req = req;
    start_req.kind = ActionKind::Start;

    let chain = Job {
        payload: JobPayload::Run(stop_req),
        waitfor: -1,
        not_before: None,
        successor: Some(Box::new(Job {
            payload: JobPayload::Run(start_req),
            waitfor: -1,
            not_before: None,
            successor: None,
        })),
    };
    execute_job(ctx, chain, ChildStatus::Exited(0))?;
    Ok(0)
}

/// Default status: a short-lived child reports over the forwarded stdout.
fn spawn_status_probe(req: &Request, running: bool) -> Result<Pid, RunError> {
    let raw_fds = req.fds.as_ref().map(|f| f.each_ref().map(|fd| fd.as_raw_fd()));
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            install_stdio(raw_fds);
            let (text, code): (&[u8], i32) = if running {
                (b"running\n", 0)
            } else {
                (b"not running\n", 1)
            };
            unsafe {
                libc::write(libc::STDOUT_FILENO, text.as_ptr().cast(), text.len());
                libc::_exit(code);
            }
        }
        Ok(ForkResult::Parent { child }) => Ok(child),
        Err(e) => Err(RunError::Fork(e)),
    }
}

fn install_waiter(jobs: &mut JobQueue, req: &mut Request, pid: Pid) {
    if req.flags.no_reply {
        return;
    }
    let Some(reply_to) = req.reply_to.take() else {
        return;
    };
    jobs.append(Job::waiter(Waiter { reply_to }, pid.as_raw()));
}

fn reply_ok(socket: &ControlSocket, req: &Request, code: i32) -> Result<(), RunError> {
    reply(socket, req, &Message::ok(code))
}

fn reply_err(socket: &ControlSocket, req: &Request, code: ErrorCode) -> Result<(), RunError> {
    if req.creds.is_none() && !req.wants_reply() {
        // Synthesized request with nobody to tell; log instead.
        info!(
            "{} '{}' not run: {}",
            req.kind.name(),
            req.program,
            code.description()
        );
        return Ok(());
    }
    reply(socket, req, &Message::error(code))
}

fn reply(socket: &ControlSocket, req: &Request, msg: &Message) -> Result<(), RunError> {
    if !req.wants_reply() {
        return Ok(());
    }
    match socket.send(msg, None, req.reply_to.as_ref(), true) {
        Ok(SendOutcome::Sent(_)) => Ok(()),
        Ok(SendOutcome::WouldBlock) => {
            warn!("reply dropped: send would block");
            Ok(())
        }
        Err(e) => Err(RunError::Reply(e)),
    }
}

/// Everything the child needs after fork, prepared while allocation is
/// still safe to reason about.
struct ExecPlan {
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: Option<CString>,
    suid: i32,
    sgid: i32,
}

impl ExecPlan {
    fn prepare(
        req: &Request,
        action: &Action,
        command: &str,
        prog_pid: Option<Pid>,
        prog_cwd: Option<&Path>,
    ) -> Result<Self, RunError> {
        let mut argv = vec![
            cstring(ACTION_SHELL)?,
            cstring("-c")?,
            cstring(command)?,
        ];
        for arg in &req.args {
            argv.push(cstring(arg)?);
        }
        let envp = action_env(&req.program, req.kind, prog_pid)?;
        let cwd = match prog_cwd {
            Some(path) => Some(
                CString::new(path.as_os_str().as_encoded_bytes())
                    .map_err(|_| RunError::BadString(path.display().to_string()))?,
            ),
            None => None,
        };
        Ok(Self {
            argv,
            envp,
            cwd,
            suid: action.suid,
            sgid: action.sgid,
        })
    }

    /// Runs between fork and exec; only exits, never returns.
    fn exec_child(&self, fds: Option<[RawFd; 3]>) -> ! {
        let argv_ptrs = with_null(&self.argv);
        let envp_ptrs = with_null(&self.envp);
        unsafe {
            if libc::setpgid(0, 0) == -1 {
                libc::_exit(126);
            }
        }
        install_stdio(fds);
        close_extra_fds();
        unsafe {
            if self.sgid != -1 && libc::setgid(self.sgid as libc::gid_t) == -1 {
                libc::_exit(126);
            }
            if self.suid != -1 && libc::setuid(self.suid as libc::uid_t) == -1 {
                libc::_exit(126);
            }
            if let Some(cwd) = &self.cwd {
                if libc::chdir(cwd.as_ptr()) == -1 {
                    libc::_exit(126);
                }
            }
            // SIGPIPE is ignored in the daemon; ignored dispositions
            // survive exec, so put the default back for the command.
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            libc::execve(self.argv[0].as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
            libc::_exit(127);
        }
    }
}

/// The whitelisted environment of every action command.
fn action_env(
    program: &str,
    kind: ActionKind,
    prog_pid: Option<Pid>,
) -> Result<Vec<CString>, RunError> {
    let pid = prog_pid.map(|p| p.as_raw().to_string()).unwrap_or_default();
    [
        format!("PATH={ACTION_PATH}"),
        format!("SHELL={ACTION_SHELL}"),
        format!("PROGNAME={program}"),
        format!("ACTION={}", kind.name()),
        format!("PID={pid}"),
    ]
    .into_iter()
    .map(|var| cstring(&var))
    .collect()
}

fn cstring(s: &str) -> Result<CString, RunError> {
    CString::new(s).map_err(|_| RunError::BadString(s.to_owned()))
}

fn with_null(strings: &[CString]) -> Vec<*const libc::c_char> {
    let mut ptrs: Vec<*const libc::c_char> = strings.iter().map(|s| s.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}

/// Wire the forwarded fd triple onto stdin/stdout/stderr, or close the
/// standard descriptors if none were forwarded.
fn install_stdio(fds: Option<[RawFd; 3]>) {
    match fds {
        Some(triple) => {
            for (target, fd) in triple.into_iter().enumerate() {
                unsafe {
                    if libc::dup2(fd, target as RawFd) == -1 {
                        libc::_exit(126);
                    }
                }
            }
        }
        None => {
            for target in 0..3 {
                unsafe {
                    libc::close(target);
                }
            }
        }
    }
}

/// Close every inherited descriptor above stderr before exec.
///
/// The fd numbers are collected before closing anything: the directory
/// stream has a descriptor of its own that must stay valid while reading.
fn close_extra_fds() {
    let listed: Option<Vec<RawFd>> = std::fs::read_dir("/proc/self/fd").ok().map(|entries| {
        entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect()
    });
    match listed {
        Some(fds) => {
            for fd in fds {
                if fd > libc::STDERR_FILENO {
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
        }
        None => {
            // No /proc: sweep a generous fixed range instead.
            for fd in (libc::STDERR_FILENO + 1)..1024 {
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(allow_uid: i32, allow_gid: i32) -> Action {
        Action {
            command: None,
            allow_uid,
            allow_gid,
            suid: -1,
            sgid: -1,
        }
    }

    fn creds(uid: libc::uid_t, gid: libc::gid_t) -> PeerCreds {
        PeerCreds { pid: 1, uid, gid }
    }

    #[test]
    fn root_is_always_authorized() {
        assert!(authorized(&action(-1, -1), &creds(0, 0)));
    }

    #[test]
    fn uid_or_gid_match_suffices() {
        let act = action(1000, 2000);
        assert!(authorized(&act, &creds(1000, 999)));
        assert!(authorized(&act, &creds(999, 2000)));
        assert!(!authorized(&act, &creds(999, 999)));
    }

    #[test]
    fn unset_allow_entries_match_nobody() {
        let act = action(-1, -1);
        assert!(!authorized(&act, &creds(1000, 1000)));
        assert!(!authorized(&act, &creds(libc::uid_t::MAX, 0)));
    }

    #[test]
    fn invalid_credentials_never_authorize() {
        let act = action(1000, 1000);
        assert!(!authorized(&act, &creds(1000, libc::gid_t::MAX)));
    }

    #[test]
    fn action_env_is_exactly_the_whitelist() {
        let env = action_env("svc", ActionKind::Reload, Some(Pid::from_raw(42))).unwrap();
        let vars: Vec<&str> = env.iter().map(|v| v.to_str().unwrap()).collect();
        assert_eq!(
            vars,
            [
                "PATH=/bin:/usr/bin",
                "SHELL=/bin/sh",
                "PROGNAME=svc",
                "ACTION=reload",
                "PID=42",
            ]
        );
    }

    #[test]
    fn action_env_pid_is_empty_without_a_child() {
        let env = action_env("svc", ActionKind::Start, None).unwrap();
        assert_eq!(env[4].to_str().unwrap(), "PID=");
    }

    #[test]
    fn exec_plan_builds_shell_argv() {
        let req = Request {
            args: vec!["extra".into()],
            ..Request::internal("svc".into(), ActionKind::Start, RequestFlags::default())
        };
        let plan = ExecPlan::prepare(&req, &action(-1, -1), "echo hi", None, None).unwrap();
        let argv: Vec<&str> = plan.argv.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(argv, ["/bin/sh", "-c", "echo hi", "extra"]);
        assert!(plan.cwd.is_none());
    }

    #[test]
    fn internal_requests_expect_no_reply() {
        let req = Request::internal(
            "svc".into(),
            ActionKind::Start,
            RequestFlags {
                no_reply: true,
                drop_if_not_running: true,
                ..RequestFlags::default()
            },
        );
        assert!(!req.wants_reply());
        assert!(req.creds.is_none());
    }
}
