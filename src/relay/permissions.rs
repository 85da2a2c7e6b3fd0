//! # Permission Model and Resolver
//!
//! Every friend relationship is a directed edge `issuer → target`: the issuer
//! decides what the target may do to the issuer's character. For each
//! capability category (primary, speak, elevated) an edge carries an `allow`
//! and a `deny` mask, and each flag inherits from the issuer's global defaults
//! unless one of the masks names it.
//!
//! Resolution is a pure function, evaluated fresh for every request:
//!
//! ```text
//! resolved = (global | allow) & !deny
//! ```
//!
//! Deny dominates allow and the global default bit by bit, so resolving the
//! same inputs twice always yields the same mask.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Appearance and behaviour capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PrimaryPermissions: u32 {
        const EMOTE          = 1 << 0;
        const CUSTOMIZATION  = 1 << 1;
        const EQUIPMENT      = 1 << 2;
        const MODS           = 1 << 3;
        const BODY_SWAP      = 1 << 4;
        const TWINNING       = 1 << 5;
        const CUSTOMIZE_PLUS = 1 << 6;
        const MOODLES        = 1 << 7;
        const HYPNOSIS       = 1 << 8;
        const HONORIFIC      = 1 << 9;
    }
}

bitflags! {
    /// Chat channels a friend may speak in on the issuer's behalf.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SpeakPermissions: u32 {
        const ROLEPLAY     = 1 << 0;
        const SAY          = 1 << 1;
        const YELL         = 1 << 2;
        const SHOUT        = 1 << 3;
        const TELL         = 1 << 4;
        const PARTY        = 1 << 5;
        const ALLIANCE     = 1 << 6;
        const FREE_COMPANY = 1 << 7;
        const PVP_TEAM     = 1 << 8;
        const ECHO         = 1 << 9;
        const LS1          = 1 << 10;
        const LS2          = 1 << 11;
        const LS3          = 1 << 12;
        const LS4          = 1 << 13;
        const LS5          = 1 << 14;
        const LS6          = 1 << 15;
        const LS7          = 1 << 16;
        const LS8          = 1 << 17;
        const CWL1         = 1 << 18;
        const CWL2         = 1 << 19;
        const CWL3         = 1 << 20;
        const CWL4         = 1 << 21;
        const CWL5         = 1 << 22;
        const CWL6         = 1 << 23;
        const CWL7         = 1 << 24;
        const CWL8         = 1 << 25;
    }
}

bitflags! {
    /// Capabilities that outlive a single command or take control of a character.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ElevatedPermissions: u32 {
        const PERMANENT_TRANSFORMATION = 1 << 0;
        const POSSESSION               = 1 << 1;
    }
}

macro_rules! empty_default {
    ($($flags:ty),+) => {
        $(
            impl Default for $flags {
                fn default() -> Self {
                    Self::empty()
                }
            }
        )+
    };
}

empty_default!(PrimaryPermissions, SpeakPermissions, ElevatedPermissions);

impl SpeakPermissions {
    /// Linkshell flag for a 1-based linkshell index.
    pub fn linkshell(index: u8) -> Option<Self> {
        match index {
            1..=8 => Some(SpeakPermissions::from_bits_truncate(
                1 << (10 + u32::from(index) - 1),
            )),
            _ => None,
        }
    }

    /// Cross-world linkshell flag for a 1-based index.
    pub fn cross_world_linkshell(index: u8) -> Option<Self> {
        match index {
            1..=8 => Some(SpeakPermissions::from_bits_truncate(
                1 << (18 + u32::from(index) - 1),
            )),
            _ => None,
        }
    }
}

/// One mask per capability category. Used for global defaults, for the
/// permissions an action requires, and for the resolved result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionSet {
    #[serde(default)]
    pub primary: PrimaryPermissions,
    #[serde(default)]
    pub speak: SpeakPermissions,
    #[serde(default)]
    pub elevated: ElevatedPermissions,
}

impl PermissionSet {
    pub fn primary(primary: PrimaryPermissions) -> Self {
        Self {
            primary,
            ..Self::default()
        }
    }

    pub fn speak(speak: SpeakPermissions) -> Self {
        Self {
            speak,
            ..Self::default()
        }
    }

    pub fn elevated(elevated: ElevatedPermissions) -> Self {
        Self {
            elevated,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self {
            primary: PrimaryPermissions::all(),
            speak: SpeakPermissions::all(),
            elevated: ElevatedPermissions::all(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.speak.is_empty() && self.elevated.is_empty()
    }

    /// True when every category holds all the bits `required` asks for.
    pub fn satisfies(&self, required: &PermissionSet) -> bool {
        self.primary.contains(required.primary)
            && self.speak.contains(required.speak)
            && self.elevated.contains(required.elevated)
    }

    /// Bits of `required` that this set does not hold.
    pub fn missing(&self, required: &PermissionSet) -> PermissionSet {
        PermissionSet {
            primary: required.primary & !self.primary,
            speak: required.speak & !self.speak,
            elevated: required.elevated & !self.elevated,
        }
    }

    /// Flag names across all categories, prefixed by category, for logs.
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        parts.extend(self.primary.iter_names().map(|(n, _)| format!("primary.{n}")));
        parts.extend(self.speak.iter_names().map(|(n, _)| format!("speak.{n}")));
        parts.extend(self.elevated.iter_names().map(|(n, _)| format!("elevated.{n}")));
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(",")
        }
    }
}

impl std::ops::BitOr for PermissionSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        PermissionSet {
            primary: self.primary | rhs.primary,
            speak: self.speak | rhs.speak,
            elevated: self.elevated | rhs.elevated,
        }
    }
}

/// State of a single flag on an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionValue {
    Allow,
    Deny,
    Inherit,
}

/// Allow and deny masks for one category of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionOverride<T> {
    #[serde(default)]
    pub allow: T,
    #[serde(default)]
    pub deny: T,
}

macro_rules! override_accessors {
    ($flags:ty) => {
        impl PermissionOverride<$flags> {
            /// Deny wins when a malformed row names the flag in both masks.
            pub fn get(&self, flag: $flags) -> PermissionValue {
                if self.deny.contains(flag) {
                    PermissionValue::Deny
                } else if self.allow.contains(flag) {
                    PermissionValue::Allow
                } else {
                    PermissionValue::Inherit
                }
            }

            pub fn set(&mut self, flag: $flags, value: PermissionValue) {
                self.allow.remove(flag);
                self.deny.remove(flag);
                match value {
                    PermissionValue::Allow => self.allow.insert(flag),
                    PermissionValue::Deny => self.deny.insert(flag),
                    PermissionValue::Inherit => {}
                }
            }

            pub fn resolve(&self, global: $flags) -> $flags {
                (global | self.allow) & !self.deny
            }
        }
    };
}

override_accessors!(PrimaryPermissions);
override_accessors!(SpeakPermissions);
override_accessors!(ElevatedPermissions);

/// Directed permission row: what `issuer` lets `target` do to the issuer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionEdge {
    pub issuer: String,
    pub target: String,
    #[serde(default)]
    pub primary: PermissionOverride<PrimaryPermissions>,
    #[serde(default)]
    pub speak: PermissionOverride<SpeakPermissions>,
    #[serde(default)]
    pub elevated: PermissionOverride<ElevatedPermissions>,
}

impl PermissionEdge {
    /// An edge that inherits everything from the issuer's global defaults.
    pub fn inherit(issuer: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    /// An edge that explicitly allows every bit of `set`.
    pub fn allowing(issuer: impl Into<String>, target: impl Into<String>, set: PermissionSet) -> Self {
        let mut edge = Self::inherit(issuer, target);
        edge.primary.allow = set.primary;
        edge.speak.allow = set.speak;
        edge.elevated.allow = set.elevated;
        edge
    }

    /// Add explicit denials for every bit of `set`.
    pub fn denying(mut self, set: PermissionSet) -> Self {
        self.primary.deny |= set.primary;
        self.speak.deny |= set.speak;
        self.elevated.deny |= set.elevated;
        self
    }
}

/// Combine the issuer's global defaults with a per-target edge.
///
/// Each category is resolved independently as `(global | allow) & !deny`.
pub fn resolve(global: &PermissionSet, edge: &PermissionEdge) -> PermissionSet {
    PermissionSet {
        primary: edge.primary.resolve(global.primary),
        speak: edge.speak.resolve(global.speak),
        elevated: edge.elevated.resolve(global.elevated),
    }
}
