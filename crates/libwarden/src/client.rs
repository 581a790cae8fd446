//! Client side of the control plane: connect, send one request, await one
//! reply, render the result.

use std::fmt;
use std::io::Write;
use std::os::fd::RawFd;
use std::path::Path;

use crate::codec::Message;
use crate::registry::ActionKind;
use crate::transport::{ControlSocket, RecvOutcome, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `RUN <program> <action> [args...]`, with our stdio forwarded so the
    /// action's output lands on this terminal.
    Spawn {
        program: String,
        action: String,
        args: Vec<String>,
    },
    Reload,
    Stop,
    Test,
    List {
        null_separated: bool,
    },
}

#[derive(Debug)]
pub enum ClientError {
    BadArguments(String),
    Io(TransportError),
    BadReply(String),
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadArguments(msg) => write!(f, "{msg}"),
            Self::Io(e) => write!(f, "{e}"),
            Self::BadReply(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Run one command against the daemon and return the process exit code.
///
/// Error replies are printed to stderr here and yield exit code 1; `OK <n>`
/// replies pass the daemon's return code through.
pub fn run(socket_path: &Path, command: &ClientCommand) -> Result<i32, ClientError> {
    if let ClientCommand::Spawn { action, .. } = command {
        if ActionKind::from_name(action).is_none() {
            return Err(ClientError::BadArguments(format!(
                "unknown action '{action}'"
            )));
        }
    }
    let socket = ControlSocket::connect(socket_path)?;
    let token = std::process::id().to_string();
    let (msg, fds) = build_message(command, &token);
    socket.send(&msg, fds.as_ref(), None, false)?;
    let reply = match socket.recv(false)? {
        RecvOutcome::Datagram(dgram) => dgram.message,
        RecvOutcome::Invalid | RecvOutcome::WouldBlock => {
            return Err(ClientError::BadReply("bad message received".into()));
        }
    };
    interpret(command, &token, &reply, &mut std::io::stdout().lock())
}

fn build_message(command: &ClientCommand, token: &str) -> (Message, Option<[RawFd; 3]>) {
    match command {
        ClientCommand::Spawn {
            program,
            action,
            args,
        } => {
            let mut fields = vec!["RUN", program.as_str(), action.as_str()];
            fields.extend(args.iter().map(String::as_str));
            (
                Message::from_strs(&fields),
                Some([libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO]),
            )
        }
        ClientCommand::Reload => (Message::from_strs(&["SIGNAL", "reload"]), None),
        ClientCommand::Stop => (Message::from_strs(&["SIGNAL", "shutdown"]), None),
        ClientCommand::Test => (Message::from_strs(&["PING", token]), None),
        ClientCommand::List { .. } => (Message::from_strs(&["LIST"]), None),
    }
}

fn interpret(
    command: &ClientCommand,
    token: &str,
    reply: &Message,
    out: &mut impl Write,
) -> Result<i32, ClientError> {
    if reply.is_error() {
        if reply.fields.len() < 3 {
            return Err(ClientError::BadReply("bad error message received".into()));
        }
        eprintln!(
            "ERROR: ({}) {}",
            reply.field_str(1).unwrap_or("?"),
            reply.field_str(2).unwrap_or("?")
        );
        return Ok(1);
    }
    match reply.field_str(0) {
        Some("PONG") => {
            if reply.field_str(1) != Some(token) {
                return Err(ClientError::BadReply("mismatched ping token".into()));
            }
            Ok(0)
        }
        Some("OK") => parse_return_code(reply),
        Some("LISTING") => {
            let null_separated = matches!(
                command,
                ClientCommand::List {
                    null_separated: true
                }
            );
            render_listing(&reply.fields[1..], null_separated, out)
                .map_err(|e| ClientError::BadReply(format!("could not write listing: {e}")))?;
            Ok(0)
        }
        _ => Err(ClientError::BadReply("bad message received".into())),
    }
}

/// `OK <n>` carries an integer strictly between −256 and 256.
fn parse_return_code(reply: &Message) -> Result<i32, ClientError> {
    let raw = reply
        .field_str(1)
        .ok_or_else(|| ClientError::BadReply("bad message received".into()))?;
    let code: i32 = raw
        .parse()
        .map_err(|_| ClientError::BadReply("invalid number in message".into()))?;
    if code <= -256 || code >= 256 {
        return Err(ClientError::BadReply("number out of bounds".into()));
    }
    Ok(code)
}

/// Alternating name/state pairs, either column-aligned for people or
/// NUL-delimited for scripts.
fn render_listing(
    pairs: &[Vec<u8>],
    null_separated: bool,
    out: &mut impl Write,
) -> std::io::Result<()> {
    if pairs.len() % 2 != 0 {
        return Err(std::io::Error::other("odd number of listing fields"));
    }
    if null_separated {
        for field in pairs {
            out.write_all(field)?;
            out.write_all(b"\0")?;
        }
        return Ok(());
    }
    let width = pairs
        .chunks(2)
        .map(|pair| pair[0].len())
        .max()
        .unwrap_or(0);
    for pair in pairs.chunks(2) {
        let name = String::from_utf8_lossy(&pair[0]);
        let state = String::from_utf8_lossy(&pair[1]);
        writeln!(out, "{name:<width$}  {state}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_cmd() -> ClientCommand {
        ClientCommand::List {
            null_separated: false,
        }
    }

    #[test]
    fn ok_replies_pass_the_code_through() {
        let reply = Message::from_strs(&["OK", "7"]);
        let code = interpret(&list_cmd(), "", &reply, &mut Vec::new()).unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn out_of_bounds_codes_are_rejected() {
        for raw in ["256", "-256", "999"] {
            let reply = Message::from_strs(&["OK", raw]);
            assert!(interpret(&list_cmd(), "", &reply, &mut Vec::new()).is_err());
        }
        let reply = Message::from_strs(&["OK", "-255"]);
        assert_eq!(
            interpret(&list_cmd(), "", &reply, &mut Vec::new()).unwrap(),
            -255
        );
    }

    #[test]
    fn error_replies_exit_nonzero() {
        let reply = Message::from_strs(&["", "EPERM", "Permission denied"]);
        let code = interpret(&list_cmd(), "", &reply, &mut Vec::new()).unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn pong_must_echo_the_token() {
        let reply = Message::from_strs(&["PONG", "tok"]);
        assert_eq!(
            interpret(&ClientCommand::Test, "tok", &reply, &mut Vec::new()).unwrap(),
            0
        );
        assert!(interpret(&ClientCommand::Test, "other", &reply, &mut Vec::new()).is_err());
    }

    #[test]
    fn listing_columns_align_on_the_longest_name() {
        let fields = [
            b"a".to_vec(),
            b"running".to_vec(),
            b"longer-name".to_vec(),
            b"dead lingering ?!".to_vec(),
        ];
        let mut out = Vec::new();
        render_listing(&fields, false, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "a            running\nlonger-name  dead lingering ?!\n"
        );
    }

    #[test]
    fn null_listing_is_nul_delimited() {
        let fields = [b"a".to_vec(), b"running".to_vec()];
        let mut out = Vec::new();
        render_listing(&fields, true, &mut out).unwrap();
        assert_eq!(out, b"a\0running\0");
    }

    #[test]
    fn an_odd_listing_field_count_is_an_error() {
        let fields = [b"x".to_vec()];
        assert!(render_listing(&fields, false, &mut Vec::new()).is_err());
    }

    #[test]
    fn spawn_messages_carry_the_stdio_triple() {
        let cmd = ClientCommand::Spawn {
            program: "svc".into(),
            action: "start".into(),
            args: vec!["-v".into()],
        };
        let (msg, fds) = build_message(&cmd, "");
        assert_eq!(
            msg,
            Message::from_strs(&["RUN", "svc", "start", "-v"])
        );
        assert_eq!(fds, Some([0, 1, 2]));
    }
}
