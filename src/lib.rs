//! solvewatch — client library for observing batch solve sessions.
//!
//! A solve session is a server-side batch job that processes a set of
//! question images independently and accumulates per-item outcomes. This
//! crate delivers the session's progress to a consumer as one coherent,
//! monotonically advancing stream, regardless of which transport is
//! actually carrying it:
//!
//! - a push channel (persistent WebSocket, server-initiated updates), and
//! - a pull channel (HTTP polling) as fallback/backstop,
//!
//! unified behind the [`progress::ProgressWatcher`] facade. The consumer
//! receives every non-terminal update through a tick callback and exactly
//! one terminal callback (completion or error) per watched session.

pub mod api;
pub mod config;
pub mod progress;
