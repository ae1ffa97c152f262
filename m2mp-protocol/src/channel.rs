//! Per-connection channel name tables.
//!
//! Each direction has its own numbering. The sending side assigns ids on
//! first use and announces them with a declaration frame; the receiving side
//! learns them from those declarations.

use std::collections::HashMap;

/// Number of distinct names a send table holds before it starts over.
pub const CHANNEL_TABLE_CAPACITY: usize = 256;

/// Result of resolving a channel name for sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelId {
    /// The name was already declared on this connection.
    Known(u8),
    /// The name was just assigned and must be declared before use.
    New(u8),
}

/// Outgoing channel table (name to id).
#[derive(Debug, Default)]
pub struct SendChannels {
    ids: HashMap<String, u8>,
}

impl SendChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `name`, assigning the next sequential id if needed.
    ///
    /// Once every id has been handed out the table is emptied, so the next
    /// new name starts again at 0 and previously known names get declared
    /// again on their next use.
    pub fn resolve(&mut self, name: &str) -> ChannelId {
        if let Some(id) = self.ids.get(name) {
            return ChannelId::Known(*id);
        }
        if self.ids.len() >= CHANNEL_TABLE_CAPACITY {
            self.ids.clear();
        }
        let id = self.ids.len() as u8;
        self.ids.insert(name.to_string(), id);
        ChannelId::New(id)
    }

    /// Records a declaration made explicitly by the caller.
    pub fn declare(&mut self, id: u8, name: &str) {
        self.ids.retain(|_, v| *v != id);
        self.ids.insert(name.to_string(), id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Incoming channel table (id to name).
#[derive(Debug, Default)]
pub struct RecvChannels {
    names: HashMap<u8, String>,
}

impl RecvChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, id: u8, name: String) {
        self.names.insert(id, name);
    }

    /// Returns the declared name, or an empty name for an undeclared id.
    pub fn name(&self, id: u8) -> &str {
        self.names.get(&id).map(String::as_str).unwrap_or("")
    }
}
