//! Padbot Daemon Library
//!
//! This library provides the core functionality for the padbot daemon:
//! - Virtual gamepad pool management
//! - Macro storage and expansion
//! - Input-sequence parsing and validation
//! - Timed sequence playback on per-port lanes
//! - Chat event handling and the outbound message pump

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod adapter;
pub mod backend;
pub mod commands;
pub mod config;
pub mod controller;
pub mod executor;
pub mod macros;
pub mod parser;
pub mod pump;
pub mod transport_stdio;

// Re-export common types
pub use padbot_common::{AccessLevel, Chord, Input, InputSequence, MacroDef, User};

use crate::config::{BotData, Settings};
use crate::macros::MacroStore;

/// Shared chat-facing state, guarded by a single reader-writer lock
///
/// Writes are rare (user bookkeeping, macro edits, settings changes); the
/// parse path only reads.
pub struct BotState {
    pub users: HashMap<String, User>,
    pub memes: HashMap<String, String>,
    pub macros: MacroStore,
    pub settings: Settings,
}

pub type SharedState = Arc<RwLock<BotState>>;

impl BotState {
    pub fn from_parts(settings: Settings, data: BotData) -> Self {
        let mut macros = MacroStore::new();
        macros.replace_all(data.macros);
        Self {
            users: data.users,
            memes: data.memes,
            macros,
            settings,
        }
    }

    /// Snapshot for persistence
    pub fn to_data(&self) -> BotData {
        BotData {
            users: self.users.clone(),
            memes: self.memes.clone(),
            macros: self.macros.iter().cloned().collect(),
            last_controller_type: "uinput".to_string(),
            joystick_count: self.settings.joystick_count,
        }
    }
}
