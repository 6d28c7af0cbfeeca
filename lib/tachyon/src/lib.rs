#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Connection-oriented packet server runtime. Accepts TCP clients, frames
//! length-prefixed binary messages, applies per-connection security and flow
//! controls, and dispatches each message through a middleware pipeline to an
//! opcode-addressed handler.

pub mod admission;
pub mod catalog;
pub mod compress;
pub mod connection;
pub mod dispatch;
pub mod net;
pub mod packet;
pub mod pool;
pub mod runtime;
pub mod throttle;
