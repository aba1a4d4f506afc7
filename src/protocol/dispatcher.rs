use crate::core::opcodes::{ClientOpcode, NUM_MSG_TYPES};
use crate::core::packet::ClientPacket;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::session::{handle_time_sync_resp, Session};

/// Where a handler may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affinity {
    /// Safe anywhere, including the world pass before the player is in world
    InPlace,
    /// Touches world-global state: world pass only
    WorldThread,
    /// Needs the player in a map: map pass only, once in world
    MapThread,
}

pub type OpcodeHandler = fn(&mut Session, &mut ClientPacket) -> Result<()>;

/// One row of the opcode table.
#[derive(Debug, Clone, Copy)]
pub struct HandlerEntry {
    pub name: &'static str,
    pub affinity: Affinity,
    pub handler: OpcodeHandler,
    /// Packets of this opcode accepted per second; 0 means unlimited
    pub max_per_second: u32,
    /// Lowest account security level allowed to invoke the handler
    pub min_security: u8,
}

impl HandlerEntry {
    pub fn new(name: &'static str, affinity: Affinity, handler: OpcodeHandler) -> Self {
        Self {
            name,
            affinity,
            handler,
            max_per_second: 0,
            min_security: 0,
        }
    }

    pub fn with_rate_limit(mut self, max_per_second: u32) -> Self {
        self.max_per_second = max_per_second;
        self
    }

    pub fn with_min_security(mut self, level: u8) -> Self {
        self.min_security = level;
        self
    }
}

/// Opcode-indexed handler table.
///
/// Built once at startup and shared read-only (behind an `Arc`) by every
/// session, so lookups take no lock.
pub struct Dispatcher {
    table: Vec<Option<HandlerEntry>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Empty table; every opcode is unhandled.
    pub fn new() -> Self {
        Self {
            table: vec![None; usize::from(NUM_MSG_TYPES)],
        }
    }

    /// Table with the handlers the protocol core itself owns.
    pub fn with_defaults() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.table[usize::from(ClientOpcode::TIME_SYNC_RESP.0)] = Some(HandlerEntry::new(
            "CMSG_TIME_SYNC_RESP",
            Affinity::InPlace,
            handle_time_sync_resp,
        ));
        dispatcher
    }

    /// Register an unrestricted handler.
    pub fn register(
        &mut self,
        opcode: ClientOpcode,
        name: &'static str,
        affinity: Affinity,
        handler: OpcodeHandler,
    ) -> Result<()> {
        self.register_entry(opcode, HandlerEntry::new(name, affinity, handler))
    }

    /// Register a handler with its rate limit and security gate.
    pub fn register_entry(&mut self, opcode: ClientOpcode, entry: HandlerEntry) -> Result<()> {
        let slot = self
            .table
            .get_mut(usize::from(opcode.0))
            .ok_or_else(|| {
                ProtocolError::HandlerError(format!(
                    "{}: {:#06x}",
                    constants::ERR_OPCODE_OUT_OF_RANGE,
                    opcode.0
                ))
            })?;

        if let Some(existing) = slot {
            return Err(ProtocolError::HandlerError(format!(
                "{}: {:#06x} ({})",
                constants::ERR_HANDLER_ALREADY_REGISTERED,
                opcode.0,
                existing.name
            )));
        }

        *slot = Some(entry);
        Ok(())
    }

    #[inline]
    pub fn lookup(&self, opcode: ClientOpcode) -> Option<HandlerEntry> {
        self.table.get(usize::from(opcode.0)).copied().flatten()
    }

    pub fn affinity(&self, opcode: ClientOpcode) -> Option<Affinity> {
        self.lookup(opcode).map(|entry| entry.affinity)
    }

    /// Number of registered opcodes.
    pub fn len(&self) -> usize {
        self.table.iter().filter(|entry| entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
