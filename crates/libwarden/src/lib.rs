//! `libwarden` is the core library for warden, a supervising daemon that
//! owns the lifecycle of a configured set of long-running programs on a
//! POSIX host.
//!
//! It contains:
//! - The NUL-field wire codec and the credential-passing datagram
//!   transport (`SCM_CREDENTIALS` + `SCM_RIGHTS`)
//! - The program registry with merge-on-reload semantics
//! - The deferred job queue with pid matching and successor chaining
//! - The request pipeline: authorization, default action policies,
//!   fork/exec with a whitelisted environment, reply waiters
//! - The signal funnel (self-pipe) and the single-threaded event loop
//! - The client runtime used by the same binary in client mode

pub mod client;
pub mod clock;
pub mod codec;
pub mod conffile;
pub mod config;
pub mod daemon;
pub mod entrypoints;
pub mod jobs;
pub mod logging;
pub mod registry;
pub mod request;
pub mod signal_handler;
pub mod transport;

#[cfg(test)]
mod tests;
