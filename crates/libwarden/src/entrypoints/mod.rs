//! Process entry points for the `warden` binary: the supervising daemon
//! and the one-shot client.

use std::path::{Path, PathBuf};

use log::LevelFilter;
use nix::unistd::{ForkResult, chdir, fork, setsid};

use crate::client::{self, ClientCommand};
use crate::conffile::ConfFile;
use crate::config::Settings;
use crate::daemon::Daemon;
use crate::logging::{self, LogSettings};
use crate::registry::Registry;

#[derive(Debug)]
pub struct DaemonOptions {
    pub conf_path: PathBuf,
    pub foreground: bool,
    pub pid_file: Option<PathBuf>,
    /// Overrides the configuration's `do-autostart` group.
    pub autostart: Option<i32>,
    pub log_file: Option<PathBuf>,
    pub log_level: LevelFilter,
}

#[derive(Debug)]
pub struct ClientOptions {
    pub conf_path: PathBuf,
    pub command: ClientCommand,
}

pub fn run_daemon(opts: DaemonOptions) -> i32 {
    match daemon_main(opts) {
        Ok(()) => 0,
        Err(e) => {
            logging::fatal(&e.to_string());
            1
        }
    }
}

fn daemon_main(opts: DaemonOptions) -> Result<(), Box<dyn std::error::Error>> {
    let (file, mut settings) = load_configuration(&opts.conf_path)?;
    if let Some(group) = opts.autostart {
        settings.autostart = group;
    }
    let registry = Registry::from_conffile(&settings, &file)?;

    logging::setup(&LogSettings {
        level: opts.log_level,
        file: opts.log_file.clone(),
        stderr: opts.foreground,
    })
    .map_err(std::io::Error::other)?;

    if !opts.foreground {
        daemonize()?;
    }
    let _pid_guard = opts.pid_file.clone().map(PidFile::write).transpose()?;

    let mut daemon = Daemon::new(opts.conf_path, settings, registry)?;
    daemon.run()?;
    Ok(())
}

pub fn run_client(opts: ClientOptions) -> i32 {
    let (_, settings) = match load_configuration(&opts.conf_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("warden: {e}");
            return 1;
        }
    };
    match client::run(&settings.socket_path, &opts.command) {
        Ok(code) => code,
        Err(client::ClientError::BadArguments(msg)) => {
            eprintln!("warden: {msg}");
            2
        }
        Err(e) => {
            eprintln!("warden: {e}");
            1
        }
    }
}

pub fn load_configuration(
    path: &Path,
) -> Result<(ConfFile, Settings), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| std::io::Error::other(format!("could not read {}: {e}", path.display())))?;
    let file = ConfFile::parse(&text)
        .map_err(|e| std::io::Error::other(format!("{}: {e}", path.display())))?;
    let settings = Settings::from_conffile(&file)?;
    Ok((file, settings))
}

/// Classic double fork: detach from the invoking shell, shed the
/// controlling terminal, point stdio at /dev/null.
fn daemonize() -> Result<(), nix::Error> {
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid()?;
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    chdir("/")?;
    let null_fd = unsafe {
        libc::open(
            c"/dev/null".as_ptr().cast(),
            libc::O_RDWR | libc::O_CLOEXEC,
        )
    };
    if null_fd >= 0 {
        unsafe {
            libc::dup2(null_fd, libc::STDIN_FILENO);
            libc::dup2(null_fd, libc::STDOUT_FILENO);
            libc::dup2(null_fd, libc::STDERR_FILENO);
            if null_fd > libc::STDERR_FILENO {
                libc::close(null_fd);
            }
        }
    }
    Ok(())
}

/// Pid file that unlinks itself on clean shutdown.
struct PidFile(PathBuf);

impl PidFile {
    fn write(path: PathBuf) -> std::io::Result<Self> {
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self(path))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
