//! `shoal` drives many sockets from one thread behind a uniform
//! event-callback contract: a [`manager::Manager`] owns the connections and
//! the readiness loop, handlers receive typed [`event::Event`]s, and the
//! built-in HTTP/1.1 and WebSocket layers turn raw reads into protocol
//! events. The wake-up channel is the single cross-thread entry point.

#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod connection;
pub mod endpoint;
pub mod event;
pub mod http;
pub mod jsonrpc;
pub mod logging;
pub mod manager;
pub mod support;
pub mod tls;
pub mod wakeup;
pub mod ws;

pub mod prelude;
