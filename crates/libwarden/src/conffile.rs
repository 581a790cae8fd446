//! Line-oriented configuration file parser.
//!
//! Files consist of blank lines, comments, section introducers, and value
//! assignments. Comments start with `#` or `;` and must be on their own
//! lines. `[name]` introduces a section; assignments before the first
//! introducer belong to the unnamed global section. Keys must not contain
//! `=`; values may. Leading and trailing whitespace is trimmed from keys
//! and values. Same-named sections and repeated keys are preserved in
//! order; "last assignment wins" is a consumer rule, applied by
//! [`Section::get_last`]. Yes, this is yet another derivative of the INI
//! file format.
//!
//! An example of what consumers of this parser feed it:
//!
//! ```text
//! socket-path = /var/local/warden-local
//! # Members of group 99 may invoke actions without elevating privileges.
//! allow-gid = 99
//!
//! [prog-game-server]
//! allow-uid = 1000
//! # exec so the daemon sees the PID of the server itself, not the shell.
//! cmd-start = exec /home/johndoe/bin/game.server
//! suid-start = 1000
//! sgid-start = 1000
//! cmd-reload = kill -HUP $PID
//! ```

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// `None` for the unnamed global section.
    pub name: Option<String>,
    pub pairs: Vec<Pair>,
}

impl Section {
    /// Last-wins lookup of a key within this section.
    pub fn get_last(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfFile {
    pub sections: Vec<Section>,
}

impl ConfFile {
    /// Last section with the given name; repeated sections shadow earlier
    /// ones the same way repeated keys do.
    pub fn get_last(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .rev()
            .find(|s| s.name.as_deref() == Some(name))
    }

    /// The unnamed global section, if any assignments preceded the first
    /// section introducer.
    pub fn global(&self) -> Option<&Section> {
        self.sections.iter().rev().find(|s| s.name.is_none())
    }

    pub fn parse(text: &str) -> Result<Self, ConfError> {
        let mut sections: Vec<Section> = Vec::new();
        let mut current: Option<Section> = None;
        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let Some(name) = rest.strip_suffix(']') else {
                    return Err(ConfError {
                        line: lineno,
                        reason: "unterminated section introducer".into(),
                    });
                };
                if let Some(sec) = current.take() {
                    sections.push(sec);
                }
                current = Some(Section {
                    name: Some(name.trim().to_owned()),
                    pairs: Vec::new(),
                });
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfError {
                    line: lineno,
                    reason: "expected 'key = value' or a section introducer".into(),
                });
            };
            let pair = Pair {
                key: key.trim().to_owned(),
                value: value.trim().to_owned(),
            };
            current
                .get_or_insert_with(|| Section {
                    name: None,
                    pairs: Vec::new(),
                })
                .pairs
                .push(pair);
        }
        if let Some(sec) = current {
            sections.push(sec);
        }
        Ok(Self { sections })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ConfError {
    /// 1-based line number where parsing stopped.
    pub line: usize,
    pub reason: String,
}

impl fmt::Display for ConfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

impl std::error::Error for ConfError {}

/// Decode an integer configuration value.
///
/// The literals `none`, `yes`, and `no` map to −1, 1, and 0; everything
/// else parses as a C-style integer (leading `0x` hexadecimal, leading `0`
/// octal, decimal otherwise).
pub fn parse_int(value: &str) -> Option<i32> {
    let value = value.trim();
    match value {
        "none" => return Some(-1),
        "yes" => return Some(1),
        "no" => return Some(0),
        _ => {}
    }
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let (radix, digits) = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        (16, hex)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    let magnitude = i64::from_str_radix(digits, radix).ok()?;
    let signed = if negative { -magnitude } else { magnitude };
    i32::try_from(signed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Global settings first.
socket-path = /tmp/test-socket
allow-gid = 99

[prog-echoer]
cmd-start = /bin/echo hi
uid-start = 1000

; repeated key, last wins
[prog-echoer]
cmd-start = /bin/echo bye
cmd-start = /bin/echo again
";

    #[test]
    fn global_section_precedes_named_sections() {
        let file = ConfFile::parse(SAMPLE).unwrap();
        let global = file.global().unwrap();
        assert_eq!(global.get_last("socket-path"), Some("/tmp/test-socket"));
        assert_eq!(global.get_last("allow-gid"), Some("99"));
    }

    #[test]
    fn repeated_sections_and_keys_are_kept_in_order() {
        let file = ConfFile::parse(SAMPLE).unwrap();
        assert_eq!(file.sections.len(), 3);
        let last = file.get_last("prog-echoer").unwrap();
        assert_eq!(last.pairs.len(), 2);
        assert_eq!(last.get_last("cmd-start"), Some("/bin/echo again"));
    }

    #[test]
    fn values_may_contain_equals_signs() {
        let file = ConfFile::parse("[s]\ncmd-reload = kill -HUP $PID # = 1\n").unwrap();
        let sec = file.get_last("s").unwrap();
        assert_eq!(sec.get_last("cmd-reload"), Some("kill -HUP $PID # = 1"));
    }

    #[test]
    fn syntax_errors_carry_the_line_number() {
        let err = ConfFile::parse("ok = 1\nnot an assignment\n").unwrap_err();
        assert_eq!(err.line, 2);
        let err = ConfFile::parse("[unterminated\n").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn parse_int_literals() {
        assert_eq!(parse_int("none"), Some(-1));
        assert_eq!(parse_int("yes"), Some(1));
        assert_eq!(parse_int("no"), Some(0));
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("-3"), Some(-3));
        assert_eq!(parse_int("0x1f"), Some(31));
        assert_eq!(parse_int("010"), Some(8));
        assert_eq!(parse_int("4x"), None);
        assert_eq!(parse_int(""), None);
    }
}
