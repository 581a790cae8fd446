//! Daemon-wide settings.
//!
//! These come from the unnamed global section of the configuration file and
//! feed defaults into every program section. Program sections themselves are
//! handled by the registry.

use std::fmt;
use std::path::PathBuf;

use crate::conffile::{ConfFile, parse_int};

/// Default location of the control socket.
pub const SOCKET_PATH: &str = "/var/run/warden";
/// Default configuration file, overridable by `--config` or the
/// environment.
pub const DEFAULT_CONFFILE: &str = "/etc/warden.conf";
pub const CONFFILE_ENV: &str = "WARDEN_CONFFILE";

/// Shell that runs action commands, as `sh -c <command>`.
pub const ACTION_SHELL: &str = "/bin/sh";
/// The only PATH visible to action commands.
pub const ACTION_PATH: &str = "/bin:/usr/bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub socket_path: PathBuf,
    /// Default `allow_uid` for actions without an explicit one. −1 means
    /// nobody short of root.
    pub def_uid: i32,
    pub def_gid: i32,
    /// Default identity switch for actions; −1 inherits the daemon's.
    pub def_suid: i32,
    pub def_sgid: i32,
    /// Autostart group launched at daemon start. Group 0 never starts.
    pub autostart: i32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(SOCKET_PATH),
            def_uid: -1,
            def_gid: -1,
            def_suid: -1,
            def_sgid: -1,
            autostart: 1,
        }
    }
}

impl Settings {
    pub fn from_conffile(file: &ConfFile) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        let Some(global) = file.global() else {
            return Ok(settings);
        };
        if let Some(path) = global.get_last("socket-path") {
            settings.socket_path = PathBuf::from(path);
        }
        for (key, slot) in [
            ("allow-uid", &mut settings.def_uid),
            ("allow-gid", &mut settings.def_gid),
            ("default-suid", &mut settings.def_suid),
            ("default-sgid", &mut settings.def_sgid),
            ("do-autostart", &mut settings.autostart),
        ] {
            if let Some(raw) = global.get_last(key) {
                *slot = parse_int(raw).ok_or_else(|| ConfigError::BadValue {
                    key: key.to_owned(),
                    value: raw.to_owned(),
                })?;
            }
        }
        Ok(settings)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    BadValue { key: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadValue { key, value } => {
                write!(f, "bad integer value for '{key}': '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_global_section() {
        let file = ConfFile::parse("[prog-x]\ncmd-start = /bin/true\n").unwrap();
        let settings = Settings::from_conffile(&file).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn global_section_overrides_defaults() {
        let file = ConfFile::parse(
            "socket-path = /tmp/w\nallow-uid = 1000\ndo-autostart = 2\ndefault-sgid = none\n",
        )
        .unwrap();
        let settings = Settings::from_conffile(&file).unwrap();
        assert_eq!(settings.socket_path, PathBuf::from("/tmp/w"));
        assert_eq!(settings.def_uid, 1000);
        assert_eq!(settings.def_gid, -1);
        assert_eq!(settings.def_sgid, -1);
        assert_eq!(settings.autostart, 2);
    }

    #[test]
    fn bad_integers_are_reported_with_their_key() {
        let file = ConfFile::parse("allow-uid = alice\n").unwrap();
        let err = Settings::from_conffile(&file).unwrap_err();
        assert_eq!(
            err,
            ConfigError::BadValue {
                key: "allow-uid".into(),
                value: "alice".into()
            }
        );
    }
}
