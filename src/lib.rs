//! agentmux - terminal session manager for AI coding agents
//!
//! Hosts many long-lived PTY-backed shell sessions in one server process,
//! fans their output out to any number of WebSocket viewers, and keeps all
//! viewers consistent about which sessions exist, which tab they belong to,
//! and which are protected from accidental destruction.
//!
//! The server process itself is the detachable session host: each session
//! owns a PTY whose child shell survives viewer disconnects. Viewers speak
//! a typed JSON protocol over a persistent WebSocket connection.

pub mod config;
pub mod guard;
pub mod persist;
pub mod proctree;
pub mod protocol;
pub mod pty;
pub mod reconcile;
pub mod registry;
pub mod scrollback;
pub mod session;
pub mod ws;
