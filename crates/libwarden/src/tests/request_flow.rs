//! Request pipeline scenarios that cross module boundaries, driven without
//! forking: default policies, pre-checks, drop flags, and the default
//! restart's successor chain, each observed through real reply datagrams.

use nix::unistd::Pid;

use crate::clock;
use crate::codec::Message;
use crate::conffile::ConfFile;
use crate::config::Settings;
use crate::jobs::{JobPayload, JobQueue};
use crate::registry::{ActionKind, Registry};
use crate::request::{self, ExecCtx, Request, RequestFlags, Waiter};
use crate::signal_handler::ChildStatus;
use crate::transport::{ControlSocket, RecvOutcome};

/// A pid far above any real pid_max, so signals sent to it fail with
/// ESRCH instead of hitting a live process.
const BOGUS_PID: i32 = 999_999_999;

struct Harness {
    _dir: tempfile::TempDir,
    registry: Registry,
    jobs: JobQueue,
    server: ControlSocket,
    client: ControlSocket,
}

impl Harness {
    fn new(conf_text: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let server = ControlSocket::bind(&path).unwrap();
        let client = ControlSocket::connect(&path).unwrap();
        let file = ConfFile::parse(conf_text).unwrap();
        let settings = Settings::from_conffile(&file).unwrap();
        let registry = Registry::from_conffile(&settings, &file).unwrap();
        Self {
            _dir: dir,
            registry,
            jobs: JobQueue::new(),
            server,
            client,
        }
    }

    fn run(&mut self, req: Request) -> i32 {
        let mut ctx = ExecCtx {
            registry: &mut self.registry,
            jobs: &mut self.jobs,
            socket: &self.server,
        };
        request::run_request(&mut ctx, req).unwrap()
    }

    /// A client-addressed request, as the loop would build it after
    /// authorization.
    fn client_request(&self, program: &str, kind: ActionKind) -> Request {
        Request {
            program: program.to_owned(),
            kind,
            args: Vec::new(),
            creds: None,
            fds: None,
            reply_to: Some(self.client.local_addr().unwrap()),
            flags: RequestFlags::default(),
        }
    }

    fn reply(&self) -> Message {
        match self.client.recv(false).unwrap() {
            RecvOutcome::Datagram(d) => d.message,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    fn no_reply(&self) {
        match self.client.recv(true).unwrap() {
            RecvOutcome::WouldBlock => {}
            other => panic!("expected silence, got {other:?}"),
        }
    }
}

#[test]
fn commandless_signal_acknowledges_with_ok() {
    let mut h = Harness::new("[prog-svc]\n");
    let req = h.client_request("svc", ActionKind::Signal);
    h.run(req);
    assert_eq!(h.reply(), Message::ok(0));
}

#[test]
fn commandless_start_answers_nocmd() {
    let mut h = Harness::new("[prog-svc]\n");
    let req = h.client_request("svc", ActionKind::Start);
    h.run(req);
    let reply = h.reply();
    assert!(reply.is_error());
    assert_eq!(reply.field_str(1), Some("NOCMD"));
}

#[test]
fn a_vanished_program_answers_noprog() {
    let mut h = Harness::new("[prog-svc]\n");
    let req = h.client_request("gone", ActionKind::Start);
    h.run(req);
    assert_eq!(h.reply().field_str(1), Some("NOPROG"));
}

#[test]
fn starting_a_live_program_answers_busy() {
    let mut h = Harness::new("[prog-svc]\ncmd-start = /bin/true\n");
    h.registry.get_mut("svc").unwrap().pid = Some(Pid::from_raw(BOGUS_PID));
    let req = h.client_request("svc", ActionKind::Start);
    h.run(req);
    assert_eq!(h.reply().field_str(1), Some("BUSY"));
}

#[test]
fn stopping_a_dead_program_answers_notrunning_but_clears_the_flag() {
    let mut h = Harness::new("[prog-svc]\n");
    h.registry.get_mut("svc").unwrap().running = true;
    let req = h.client_request("svc", ActionKind::Stop);
    h.run(req);
    assert_eq!(h.reply().field_str(1), Some("NOTRUNNING"));
    // The desired state changed even though nothing was running; a queued
    // supervised restart will now drop itself.
    assert!(!h.registry.get("svc").unwrap().running);
}

#[test]
fn default_stop_signals_and_installs_a_waiter() {
    let mut h = Harness::new("[prog-svc]\n");
    {
        let svc = h.registry.get_mut("svc").unwrap();
        svc.pid = Some(Pid::from_raw(BOGUS_PID));
        svc.running = true;
    }
    let req = h.client_request("svc", ActionKind::Stop);
    let completion = h.run(req);
    assert_eq!(completion, BOGUS_PID);
    assert!(!h.registry.get("svc").unwrap().running);

    // The reply is deferred until the program's pid is reaped.
    h.no_reply();
    let mut ready = h.jobs.take_ready(BOGUS_PID, clock::now());
    assert_eq!(ready.len(), 1);
    match ready.remove(0).payload {
        JobPayload::Reply(waiter) => {
            request::run_waiter(&h.server, &waiter, ChildStatus::Exited(0)).unwrap();
        }
        other => panic!("expected a waiter, got {other:?}"),
    }
    assert_eq!(h.reply(), Message::ok(0));
}

#[test]
fn dropped_internal_requests_stay_silent() {
    let mut h = Harness::new("[prog-svc]\ncmd-start = /bin/true\n");
    h.registry.get_mut("svc").unwrap().running = true;
    let mut req = Request::internal(
        "svc".into(),
        ActionKind::Start,
        RequestFlags {
            no_reply: true,
            drop_if_running: true,
            ..RequestFlags::default()
        },
    );
    req.reply_to = Some(h.client.local_addr().unwrap());
    assert_eq!(h.run(req), 0);
    h.no_reply();

    // The matching start goes through once the flag clears.
    h.registry.get_mut("svc").unwrap().running = false;
    let req = h.client_request("svc", ActionKind::Signal);
    h.run(req);
    assert_eq!(h.reply(), Message::ok(0));
}

#[test]
fn default_restart_chains_start_onto_the_stopped_pid() {
    let mut h = Harness::new("[prog-svc]\n");
    {
        let svc = h.registry.get_mut("svc").unwrap();
        svc.pid = Some(Pid::from_raw(BOGUS_PID));
        svc.running = true;
    }
    let req = h.client_request("svc", ActionKind::Restart);
    h.run(req);

    // No reply yet: the start successor owns it, keyed to the old pid.
    h.no_reply();
    assert!(h.registry.get("svc").unwrap().running);
    assert_eq!(h.jobs.len(), 1);

    // Reap the old pid: the successor runs, and with no cmd-start the
    // client finally hears NOCMD.
    h.registry.get_mut("svc").unwrap().pid = None;
    let ready = h.jobs.take_ready(BOGUS_PID, clock::now());
    assert_eq!(ready.len(), 1);
    for job in ready {
        match job.payload {
            JobPayload::Run(req) => {
                h.run(req);
            }
            other => panic!("expected the start half, got {other:?}"),
        }
    }
    assert_eq!(h.reply().field_str(1), Some("NOCMD"));
}

#[test]
fn waiters_report_signal_deaths_negatively() {
    let h = Harness::new("");
    let waiter = Waiter {
        reply_to: h.client.local_addr().unwrap(),
    };
    request::run_waiter(
        &h.server,
        &waiter,
        ChildStatus::Signaled(nix::sys::signal::Signal::SIGKILL),
    )
    .unwrap();
    assert_eq!(h.reply(), Message::ok(-9));
}
