//! Catalog of supervised programs.
//!
//! The registry preserves configuration order so listings are
//! deterministic. Programs are owned exclusively by the registry; requests
//! refer to them by name and re-resolve on every run.

use std::path::PathBuf;

use nix::unistd::Pid;

use crate::conffile::{ConfFile, Section, parse_int};
use crate::config::{ConfigError, Settings};

pub const ACTION_KINDS: [ActionKind; 6] = [
    ActionKind::Start,
    ActionKind::Restart,
    ActionKind::Reload,
    ActionKind::Signal,
    ActionKind::Stop,
    ActionKind::Status,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Start,
    Restart,
    Reload,
    Signal,
    Stop,
    Status,
}

impl ActionKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Reload => "reload",
            Self::Signal => "signal",
            Self::Stop => "stop",
            Self::Status => "status",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ACTION_KINDS.iter().copied().find(|k| k.name() == name)
    }

    fn index(self) -> usize {
        ACTION_KINDS.iter().position(|k| *k == self).unwrap()
    }
}

/// One operation on a program. `command == None` means the built-in policy
/// for the kind applies; it is a directive, not missing data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub command: Option<String>,
    /// Uid allowed to invoke this action; −1 allows nobody short of root.
    pub allow_uid: i32,
    pub allow_gid: i32,
    /// Identity to switch to before exec; −1 inherits the daemon's.
    pub suid: i32,
    pub sgid: i32,
}

#[derive(Debug)]
pub struct Program {
    pub name: String,
    /// Pid of the current main child, cleared when the loop reaps it.
    pub pid: Option<Pid>,
    /// Declared desired state; drives supervision.
    pub running: bool,
    /// Restart delay in seconds; non-positive disables auto-restart.
    pub delay: i32,
    /// Autostart group; 0 means never.
    pub autostart: i32,
    pub cwd: Option<PathBuf>,
    /// Set during reload when the program vanished from the file; the
    /// entry lingers until its child exits.
    pub remove_pending: bool,
    actions: [Action; 6],
}

/// Section name prefix that marks program sections.
const PROG_PREFIX: &str = "prog-";

impl Program {
    pub fn action(&self, kind: ActionKind) -> &Action {
        &self.actions[kind.index()]
    }

    /// Build a program from its `[prog-<name>]` section, cascading uid/gid
    /// defaults from the global settings through section-level overrides to
    /// per-action keys.
    pub fn from_section(settings: &Settings, section: &Section) -> Result<Self, ConfigError> {
        let name = section
            .name
            .as_deref()
            .map(|n| n.strip_prefix(PROG_PREFIX).unwrap_or(n))
            .unwrap_or("")
            .to_owned();

        let get_int = |key: &str, default: i32| -> Result<i32, ConfigError> {
            match section.get_last(key) {
                Some(raw) => parse_int(raw).ok_or_else(|| ConfigError::BadValue {
                    key: key.to_owned(),
                    value: raw.to_owned(),
                }),
                None => Ok(default),
            }
        };

        let def_uid = get_int("allow-uid", settings.def_uid)?;
        let def_gid = get_int("allow-gid", settings.def_gid)?;
        let def_suid = get_int("default-suid", settings.def_suid)?;
        let def_sgid = get_int("default-sgid", settings.def_sgid)?;

        let mut actions: Vec<Action> = Vec::with_capacity(ACTION_KINDS.len());
        for kind in ACTION_KINDS {
            let act = Action {
                command: section
                    .get_last(&format!("cmd-{}", kind.name()))
                    .map(str::to_owned),
                allow_uid: get_int(&format!("uid-{}", kind.name()), def_uid)?,
                allow_gid: get_int(&format!("gid-{}", kind.name()), def_gid)?,
                suid: get_int(&format!("suid-{}", kind.name()), def_suid)?,
                sgid: get_int(&format!("sgid-{}", kind.name()), def_sgid)?,
            };
            actions.push(act);
        }

        Ok(Self {
            name,
            pid: None,
            running: false,
            delay: get_int("restart-delay", -1)?,
            autostart: get_int("autostart", 0)?,
            cwd: section.get_last("cwd").map(PathBuf::from),
            remove_pending: false,
            actions: actions.try_into().unwrap(),
        })
    }

    /// State label for listings. A dead lingering program cannot normally
    /// be observed (reload deletes dead entries immediately), hence the
    /// marker.
    pub fn state_label(&self) -> String {
        match (self.pid.is_some(), self.remove_pending) {
            (true, false) => "running".to_owned(),
            (true, true) => "running lingering".to_owned(),
            (false, false) => "dead".to_owned(),
            (false, true) => "dead lingering ?!".to_owned(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    programs: Vec<Program>,
}

impl Registry {
    pub fn from_conffile(settings: &Settings, file: &ConfFile) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        registry.merge(Self::parse_programs(settings, file)?);
        Ok(registry)
    }

    fn parse_programs(settings: &Settings, file: &ConfFile) -> Result<Vec<Program>, ConfigError> {
        let mut programs: Vec<Program> = Vec::new();
        for section in &file.sections {
            let Some(name) = section.name.as_deref() else {
                continue;
            };
            if !name.starts_with(PROG_PREFIX) {
                continue;
            }
            let prog = Program::from_section(settings, section)?;
            // Out of same-named sections only the last counts.
            if let Some(pos) = programs.iter().position(|p| p.name == prog.name) {
                programs[pos] = prog;
            } else {
                programs.push(prog);
            }
        }
        Ok(programs)
    }

    /// Merge a freshly parsed program set over the live one.
    ///
    /// Existing programs keep their position, pid, and running flag; ones
    /// missing from the new set become remove-pending and survive only
    /// while a child is alive.
    fn merge(&mut self, shadow: Vec<Program>) {
        for prog in &mut self.programs {
            prog.remove_pending = true;
        }
        for mut new in shadow {
            match self.programs.iter().position(|p| p.name == new.name) {
                Some(idx) => {
                    let old = &self.programs[idx];
                    new.pid = old.pid;
                    new.running = old.running;
                    new.remove_pending = false;
                    self.programs[idx] = new;
                }
                None => self.programs.push(new),
            }
        }
        self.programs.retain(|p| !p.remove_pending || p.pid.is_some());
    }

    /// Re-read semantics for SIGHUP: parse the new file into a shadow set,
    /// then merge. Returns the number of programs configured.
    pub fn reload(&mut self, settings: &Settings, file: &ConfFile) -> Result<usize, ConfigError> {
        let shadow = Self::parse_programs(settings, file)?;
        let count = shadow.len();
        self.merge(shadow);
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<&Program> {
        self.programs.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Program> {
        self.programs.iter_mut().find(|p| p.name == name)
    }

    pub fn get_by_pid_mut(&mut self, pid: Pid) -> Option<&mut Program> {
        self.programs.iter_mut().find(|p| p.pid == Some(pid))
    }

    /// Drop a lingering entry once its child is gone.
    pub fn remove_if_lingering(&mut self, name: &str) -> bool {
        match self.programs.iter().position(|p| p.name == name) {
            Some(idx) if self.programs[idx].remove_pending && self.programs[idx].pid.is_none() => {
                self.programs.remove(idx);
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Program> {
        self.programs.iter()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}
