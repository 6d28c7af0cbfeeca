//! Opcode-addressed handler table. Handlers are installed through an
//! explicit registration API at startup; the table is immutable while the
//! server runs.

use crate::connection::{Authority, ConnectionView};
use crate::dispatch::{Completion, DispatchContext, Effects, Verdict};
use crate::packet::control::{ControlPacket, ReasonCode, RESERVED_OPCODE_BASE};
use crate::packet::RawPacket;
use hashbrown::HashMap;
use quark::logging::{self, Logger};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// A handler failure, mapped to a `FAIL` control packet for the client.
#[derive(Debug)]
pub struct HandlerError {
    pub reason: ReasonCode,
    pub message: String,
}

impl HandlerError {
    pub fn new<S: Into<String>>(reason: ReasonCode, message: S) -> HandlerError {
        HandlerError {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.reason, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// What a handler sees: the decoded request, the connection snapshot and
/// the effects it may request. `body` is the typed decode produced by the
/// catalog deserializer; handlers downcast it through `as_any`.
pub struct HandlerContext<'a> {
    pub view: &'a ConnectionView,
    pub packet: &'a RawPacket,
    pub body: Option<&'a dyn crate::catalog::PacketBody>,
    pub effects: &'a mut Effects,
    pub log: &'a Logger,
}

pub type HandlerResult = Result<Option<RawPacket>, HandlerError>;

type HandlerFn = Arc<dyn Fn(&mut HandlerContext) -> HandlerResult + Send + Sync>;

pub struct HandlerEntry {
    pub opcode: u16,
    pub name: &'static str,
    pub required_authority: Authority,
    /// Per-handler pipeline budget; falls back to the runtime default.
    pub timeout: Option<Duration>,
    handler: HandlerFn,
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("opcode", &self.opcode)
            .field("name", &self.name)
            .field("required_authority", &self.required_authority)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum RouterError {
    /// The opcode already has a handler. Startup-fatal.
    DuplicateOpcode(u16),
    /// Opcodes at and above 0xff00 belong to the runtime.
    ReservedOpcode(u16),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RouterError::DuplicateOpcode(opcode) => {
                write!(f, "duplicate handler for opcode {:#06x}", opcode)
            }
            RouterError::ReservedOpcode(opcode) => {
                write!(f, "opcode {:#06x} is inside the reserved range", opcode)
            }
        }
    }
}

impl std::error::Error for RouterError {}

pub struct HandlerTable {
    entries: HashMap<u16, HandlerEntry>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("entries", &self.entries)
            .finish()
    }
}

impl HandlerTable {
    pub fn new() -> HandlerTable {
        HandlerTable {
            entries: HashMap::new(),
        }
    }

    /// Installs a handler. Duplicate opcodes and reserved opcodes are fatal
    /// configuration errors.
    pub fn register<F>(
        &mut self,
        opcode: u16,
        name: &'static str,
        required_authority: Authority,
        timeout: Option<Duration>,
        handler: F,
    ) -> Result<&mut HandlerTable, RouterError>
    where
        F: Fn(&mut HandlerContext) -> HandlerResult + Send + Sync + 'static,
    {
        if opcode >= RESERVED_OPCODE_BASE {
            return Err(RouterError::ReservedOpcode(opcode));
        }

        if self.entries.contains_key(&opcode) {
            return Err(RouterError::DuplicateOpcode(opcode));
        }

        self.entries.insert(
            opcode,
            HandlerEntry {
                opcode,
                name,
                required_authority,
                timeout,
                handler: Arc::new(handler),
            },
        );

        Ok(self)
    }

    #[inline]
    pub fn resolve(&self, opcode: u16) -> Option<&HandlerEntry> {
        self.entries.get(&opcode)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The terminal pipeline stage: looks up the handler and invokes it.
    /// Handler errors and panics become `FAIL` control packets; the
    /// connection stays open.
    pub(crate) fn dispatch(&self, mut ctx: DispatchContext) -> Completion {
        if ctx.is_cancelled() {
            return Completion::of(&ctx, Verdict::None);
        }

        let opcode = ctx.packet.header.opcode;

        let entry = match self.resolve(opcode) {
            Some(entry) => entry,
            None => {
                logging::debug!(ctx.log, "no handler for opcode";
                                "context" => "dispatch",
                                "opcode" => opcode,
                                "connection_id" => ctx.view.id,
                                "remote" => %ctx.view.remote);

                return Completion::of(
                    &ctx,
                    Verdict::Control(ControlPacket::fail(
                        ReasonCode::UnsupportedOpcode,
                        &ctx.packet.header,
                    )),
                );
            }
        };

        let request_sequence = ctx.packet.header.sequence_id;

        let outcome = {
            let mut handler_ctx = HandlerContext {
                view: &ctx.view,
                packet: &ctx.packet,
                body: ctx.body.as_deref(),
                effects: &mut ctx.effects,
                log: &ctx.log,
            };

            panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(&mut handler_ctx)))
        };

        match outcome {
            Ok(Ok(Some(response))) => {
                // Responses echo the request sequence for correlation
                Completion::of(&ctx, Verdict::Respond(response.with_sequence(request_sequence)))
            }
            Ok(Ok(None)) => Completion::of(&ctx, Verdict::None),
            Ok(Err(err)) => {
                logging::warn!(ctx.log, "handler failed";
                               "context" => "dispatch",
                               "handler" => entry.name,
                               "opcode" => opcode,
                               "connection_id" => ctx.view.id,
                               "remote" => %ctx.view.remote,
                               "reason" => ?err.reason,
                               "message" => %err.message);

                Completion::of(
                    &ctx,
                    Verdict::Control(ControlPacket::fail(err.reason, &ctx.packet.header)),
                )
            }
            Err(_) => {
                logging::error!(ctx.log, "handler panicked";
                                "context" => "dispatch",
                                "handler" => entry.name,
                                "opcode" => opcode,
                                "connection_id" => ctx.view.id,
                                "remote" => %ctx.view.remote);

                Completion::of(
                    &ctx,
                    Verdict::Control(ControlPacket::fail(
                        ReasonCode::TransformFailed,
                        &ctx.packet.header,
                    )),
                )
            }
        }
    }
}
