//! Access-mode data shape.
//!
//! Modes travel as letter strings (`"JRWPS"`); `N` means no access.
//! The routing filter works on the parsed bit form.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

bitflags! {
    /// Parsed permission letters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessBits: u8 {
        /// J: join / subscribe
        const JOIN = 1 << 0;
        /// R: receive data
        const READ = 1 << 1;
        /// W: publish
        const WRITE = 1 << 2;
        /// P: receive presence
        const PRES = 1 << 3;
        /// A: approve members
        const APPROVE = 1 << 4;
        /// S: invite / share
        const SHARE = 1 << 5;
        /// D: hard-delete messages
        const DELETE = 1 << 6;
        /// O: owner
        const OWNER = 1 << 7;
    }
}

const LETTERS: [(char, AccessBits); 8] = [
    ('J', AccessBits::JOIN),
    ('R', AccessBits::READ),
    ('W', AccessBits::WRITE),
    ('P', AccessBits::PRES),
    ('A', AccessBits::APPROVE),
    ('S', AccessBits::SHARE),
    ('D', AccessBits::DELETE),
    ('O', AccessBits::OWNER),
];

impl FromStr for AccessBits {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bits = AccessBits::empty();
        for ch in s.chars() {
            let upper = ch.to_ascii_uppercase();
            if upper == 'N' {
                continue;
            }
            match LETTERS.iter().find(|(letter, _)| *letter == upper) {
                Some((_, bit)) => bits |= *bit,
                None => {
                    return Err(ProtocolError::Malformed(format!(
                        "invalid access mode '{s}'"
                    )))
                }
            }
        }
        Ok(bits)
    }
}

impl fmt::Display for AccessBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("N");
        }
        for (letter, bit) in LETTERS {
            if self.contains(bit) {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

/// Access mode triple: requested, granted and the cumulative result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMode {
    /// Requested by the user.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub want: String,
    /// Granted by a topic manager.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub given: String,
    /// `want & given`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
}

impl AccessMode {
    /// Full admin view with the cumulative mode derived from `want & given`.
    pub fn new(want: AccessBits, given: AccessBits) -> Self {
        Self {
            want: want.to_string(),
            given: given.to_string(),
            mode: (want & given).to_string(),
        }
    }

    /// Non-admin view: only the cumulative mode is visible.
    pub fn cumulative_only(mode: AccessBits) -> Self {
        Self {
            mode: mode.to_string(),
            ..Self::default()
        }
    }

    /// Cumulative bits. Falls back to `want & given` when `mode` is absent.
    pub fn cumulative(&self) -> Result<AccessBits, ProtocolError> {
        if !self.mode.is_empty() {
            return self.mode.parse();
        }
        let want: AccessBits = self.want.parse()?;
        let given: AccessBits = self.given.parse()?;
        Ok(want & given)
    }

    /// `mode` must not be wider than whichever of `want`/`given` is present.
    pub fn is_consistent(&self) -> bool {
        let Ok(mode) = self.cumulative() else {
            return false;
        };
        let within = |side: &str| match side.parse::<AccessBits>() {
            Ok(bits) => side.is_empty() || bits.contains(mode),
            Err(_) => false,
        };
        within(&self.want) && within(&self.given)
    }
}

/// Default access for new subscribers of a topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultAccess {
    /// Applied to authenticated users.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
    /// Applied to anonymous users.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub anon: String,
}
