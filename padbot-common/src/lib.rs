use serde::{Deserialize, Serialize};
use std::fmt;

// Re-export common dependencies
pub use bincode;
pub use serde;
pub use tokio;
pub use tracing;

// Chat transport protocol module
pub mod transport;

/// Chat access levels, ordered from least to most privileged
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum AccessLevel {
    #[default]
    User,
    Whitelisted,
    Vip,
    Moderator,
    Admin,
    Superadmin,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            AccessLevel::User => "user",
            AccessLevel::Whitelisted => "whitelisted",
            AccessLevel::Vip => "vip",
            AccessLevel::Moderator => "moderator",
            AccessLevel::Admin => "admin",
            AccessLevel::Superadmin => "superadmin",
        };
        write!(f, "{}", name)
    }
}

/// A chat viewer known to the bot
///
/// Created on the first message observed under that name, persisted lazily,
/// never deleted. The name is the primary key and is always lowercase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub level: AccessLevel,
    pub opted_out: bool,
    pub auto_whitelisted: bool,
    pub messages: u64,
    pub valid_inputs: u64,
    /// Assigned team, i.e. the 0-based controller port inputs route to
    pub team: usize,
    pub silenced: bool,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            level: AccessLevel::User,
            opted_out: false,
            auto_whitelisted: false,
            messages: 0,
            valid_inputs: 0,
            team: 0,
            silenced: false,
        }
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.level)
    }
}

/// Unit a parsed duration was written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DurationUnit {
    #[default]
    Millis,
    Frames,
}

impl DurationUnit {
    /// Convert a duration in this unit to milliseconds
    pub fn to_millis(self, duration: u32, frame_ms: u32) -> u64 {
        match self {
            DurationUnit::Millis => duration as u64,
            DurationUnit::Frames => duration as u64 * frame_ms as u64,
        }
    }
}

/// A single controller input inside a chord
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    /// Name from the valid-input vocabulary (buttons, axes, wait tokens)
    pub name: String,
    /// Explicit 0-based port, or None for the issuer's team port
    pub port: Option<usize>,
    /// Press duration, always positive, in `unit`
    pub duration: u32,
    pub unit: DurationUnit,
    /// Latch the input without releasing at chord end
    pub hold: bool,
    /// Release a previously latched input without re-pressing
    pub release: bool,
    /// Axis deflection 0-100, axes only
    pub percent: Option<u8>,
}

impl Input {
    pub fn duration_ms(&self, frame_ms: u32) -> u64 {
        self.unit.to_millis(self.duration, frame_ms)
    }

    /// Whether this input contributes to its chord's play time
    pub fn is_timed(&self) -> bool {
        !self.hold && !self.release
    }
}

/// A set of inputs pressed at the same instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Chord {
    pub inputs: Vec<Input>,
}

impl Chord {
    /// Play time of the chord: the longest timed member, zero if none
    pub fn duration_ms(&self, frame_ms: u32) -> u64 {
        self.inputs
            .iter()
            .filter(|i| i.is_timed())
            .map(|i| i.duration_ms(frame_ms))
            .max()
            .unwrap_or(0)
    }
}

/// A parsed, validated input sequence ready for playback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSequence {
    pub steps: Vec<Chord>,
    /// Total play time in milliseconds, fixed at parse time
    pub duration_ms: u64,
}

impl InputSequence {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A stored chat macro
///
/// The key starts with the macro sigil `#` followed by an alphanumeric
/// character. Dynamic macros carry a `(*,*)`-style parameter marker in the
/// key; `params` is the arity encoded there (0 for static macros).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroDef {
    pub key: String,
    pub body: String,
    pub params: usize,
}

impl MacroDef {
    pub fn is_dynamic(&self) -> bool {
        self.params > 0
    }

    /// The invocable name, i.e. the key without any parameter marker
    pub fn name(&self) -> &str {
        match self.key.find('(') {
            Some(idx) => &self.key[..idx],
            None => &self.key,
        }
    }
}

/// Arity encoded in a macro key, e.g. `#smash(*,*)` -> 2
pub fn macro_key_arity(key: &str) -> usize {
    match key.find("(*") {
        Some(idx) => key[idx..].matches('*').count(),
        None => 0,
    }
}

/// Serialization helpers shared by the bincode cache and tests
pub fn serialize<T: Serialize>(msg: &T) -> Vec<u8> {
    bincode::serialize(msg).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize message: {:?}", e);
        Vec::new()
    })
}

pub fn deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_level_ordering() {
        assert!(AccessLevel::User < AccessLevel::Whitelisted);
        assert!(AccessLevel::Whitelisted < AccessLevel::Vip);
        assert!(AccessLevel::Vip < AccessLevel::Moderator);
        assert!(AccessLevel::Moderator < AccessLevel::Admin);
        assert!(AccessLevel::Admin < AccessLevel::Superadmin);
    }

    #[test]
    fn test_user_name_is_lowercased() {
        let user = User::new("StreamFan42");
        assert_eq!(user.name, "streamfan42");
        assert_eq!(user.level, AccessLevel::User);
    }

    #[test]
    fn test_duration_unit_conversion() {
        assert_eq!(DurationUnit::Millis.to_millis(200, 17), 200);
        assert_eq!(DurationUnit::Frames.to_millis(12, 17), 204);
    }

    #[test]
    fn test_chord_duration_ignores_holds() {
        let chord = Chord {
            inputs: vec![
                Input {
                    name: "a".into(),
                    port: None,
                    duration: 200,
                    unit: DurationUnit::Millis,
                    hold: false,
                    release: false,
                    percent: None,
                },
                Input {
                    name: "b".into(),
                    port: None,
                    duration: 9000,
                    unit: DurationUnit::Millis,
                    hold: true,
                    release: false,
                    percent: None,
                },
            ],
        };
        assert_eq!(chord.duration_ms(17), 200);
    }

    #[test]
    fn test_macro_key_arity() {
        assert_eq!(macro_key_arity("#combo"), 0);
        assert_eq!(macro_key_arity("#smash(*,*)"), 2);
        assert_eq!(macro_key_arity("#mash(*)"), 1);
    }

    #[test]
    fn test_sequence_serialization_roundtrip() {
        let seq = InputSequence {
            steps: vec![Chord {
                inputs: vec![Input {
                    name: "start".into(),
                    port: Some(1),
                    duration: 100,
                    unit: DurationUnit::Millis,
                    hold: false,
                    release: false,
                    percent: None,
                }],
            }],
            duration_ms: 100,
        };
        let bytes = serialize(&seq);
        let back: InputSequence = deserialize(&bytes).unwrap();
        assert_eq!(back, seq);
    }
}
