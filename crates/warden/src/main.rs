//! warden — supervising daemon for long-running programs.
//!
//! One binary, two modes: `--daemon` runs the supervisor, everything else
//! is a client talking to it over the control socket. Trailing positional
//! arguments name the program and action for spawn mode:
//!
//! ```text
//! warden -d -f -c ./warden.conf     # supervise, stay in foreground
//! warden game-server restart        # client: restart a program
//! warden -t                         # client: ping the daemon
//! warden -a                         # client: list program states
//! ```

use std::path::PathBuf;

use clap::Parser;

use libwarden::client::ClientCommand;
use libwarden::config::{CONFFILE_ENV, DEFAULT_CONFFILE};
use libwarden::entrypoints::{self, ClientOptions, DaemonOptions};
use libwarden::logging;

#[derive(Parser, Debug)]
#[command(name = "warden", version, about = "Supervising daemon for long-running programs")]
struct Cli {
    /// Run the supervising daemon instead of acting as a client
    #[arg(short, long)]
    daemon: bool,

    /// Stay in the foreground (daemon mode only)
    #[arg(short, long)]
    foreground: bool,

    /// Configuration file (default: $WARDEN_CONFFILE or /etc/warden.conf)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Append daemon logs to this file
    #[arg(short = 'l', long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Log level: debug, info, note, warn, error, critical, fatal
    #[arg(short = 'L', long, value_name = "LEVEL", default_value = "info")]
    loglevel: String,

    /// Write the daemon pid to this file
    #[arg(short = 'P', long, value_name = "FILE")]
    pid: Option<PathBuf>,

    /// Autostart group to launch at daemon start
    #[arg(short = 'A', long, value_name = "GROUP")]
    autostart: Option<i32>,

    /// Check whether the daemon is running
    #[arg(short, long)]
    test: bool,

    /// Ask the daemon to shut down
    #[arg(short, long)]
    stop: bool,

    /// Ask the daemon to reload its configuration
    #[arg(short, long)]
    reload: bool,

    /// List all programs and their states
    #[arg(short, long)]
    all: bool,

    /// NUL-delimited listing output (with --all)
    #[arg(short = '0', long = "null")]
    null: bool,

    /// Program and action for spawn mode, plus extra action arguments
    #[arg(value_name = "PROGRAM [ACTION [ARGS...]]", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let conf_path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os(CONFFILE_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFFILE));

    let code = if cli.daemon {
        run_daemon_mode(&cli, conf_path)
    } else {
        run_client_mode(&cli, conf_path)
    };
    std::process::exit(code);
}

fn run_daemon_mode(cli: &Cli, conf_path: PathBuf) -> i32 {
    if cli.test || cli.stop || cli.reload || cli.all || !cli.args.is_empty() {
        eprintln!("warden: both daemon mode and a client action specified");
        return 2;
    }
    let Some(log_level) = logging::level_from_name(&cli.loglevel) else {
        eprintln!("warden: unknown log level '{}'", cli.loglevel);
        return 2;
    };
    entrypoints::run_daemon(DaemonOptions {
        conf_path,
        foreground: cli.foreground,
        pid_file: cli.pid.clone(),
        autostart: cli.autostart,
        log_file: cli.log.clone(),
        log_level,
    })
}

fn run_client_mode(cli: &Cli, conf_path: PathBuf) -> i32 {
    let modes = [cli.test, cli.stop, cli.reload, cli.all];
    if modes.iter().filter(|m| **m).count() > 1 {
        eprintln!("warden: more than one client action specified");
        return 2;
    }
    let command = if cli.test {
        ClientCommand::Test
    } else if cli.stop {
        ClientCommand::Stop
    } else if cli.reload {
        ClientCommand::Reload
    } else if cli.all {
        ClientCommand::List {
            null_separated: cli.null,
        }
    } else {
        if cli.args.len() < 2 {
            eprintln!("warden: expected a program and an action");
            return 2;
        }
        ClientCommand::Spawn {
            program: cli.args[0].clone(),
            action: cli.args[1].clone(),
            args: cli.args[2..].to_vec(),
        }
    };
    let code = entrypoints::run_client(ClientOptions { conf_path, command });
    // Daemon return codes may be negative (signal deaths); exit codes wrap
    // the way a C main returning them would.
    code.rem_euclid(256)
}
