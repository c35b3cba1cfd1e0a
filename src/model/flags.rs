//! Apple Mail message flags, decoded from the `flags` integer of the plist epilogue.
//!
//! The bit positions come from reverse-engineering and are not documented by
//! Apple, so they live in a [`FlagLayout`] that can be overridden from the
//! config file instead of being hard-coded into the decoder.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named boolean flag of an Apple Mail message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageFlag {
    Read,
    Deleted,
    Answered,
    Encrypted,
    Flagged,
    Recent,
    Draft,
    Initial,
    Forwarded,
    Redirected,
    Signed,
    Junk,
    NotJunk,
}

impl MessageFlag {
    /// Every flag, in layout order.
    pub const ALL: [MessageFlag; 13] = [
        MessageFlag::Read,
        MessageFlag::Deleted,
        MessageFlag::Answered,
        MessageFlag::Encrypted,
        MessageFlag::Flagged,
        MessageFlag::Recent,
        MessageFlag::Draft,
        MessageFlag::Initial,
        MessageFlag::Forwarded,
        MessageFlag::Redirected,
        MessageFlag::Signed,
        MessageFlag::Junk,
        MessageFlag::NotJunk,
    ];

    /// The name used in the emlx metadata (`notJunk`, `read`, …).
    pub fn name(self) -> &'static str {
        match self {
            MessageFlag::Read => "read",
            MessageFlag::Deleted => "deleted",
            MessageFlag::Answered => "answered",
            MessageFlag::Encrypted => "encrypted",
            MessageFlag::Flagged => "flagged",
            MessageFlag::Recent => "recent",
            MessageFlag::Draft => "draft",
            MessageFlag::Initial => "initial",
            MessageFlag::Forwarded => "forwarded",
            MessageFlag::Redirected => "redirected",
            MessageFlag::Signed => "signed",
            MessageFlag::Junk => "junk",
            MessageFlag::NotJunk => "notJunk",
        }
    }
}

/// Bit position of each flag inside the `flags` integer.
///
/// Bits 10–22 carry other metadata (attachment count, priority, …) and are
/// not mapped to flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagLayout {
    pub read: u8,
    pub deleted: u8,
    pub answered: u8,
    pub encrypted: u8,
    pub flagged: u8,
    pub recent: u8,
    pub draft: u8,
    pub initial: u8,
    pub forwarded: u8,
    pub redirected: u8,
    pub signed: u8,
    pub junk: u8,
    pub not_junk: u8,
}

impl Default for FlagLayout {
    fn default() -> Self {
        Self {
            read: 0,
            deleted: 1,
            answered: 2,
            encrypted: 3,
            flagged: 4,
            recent: 5,
            draft: 6,
            initial: 7,
            forwarded: 8,
            redirected: 9,
            signed: 23,
            junk: 24,
            not_junk: 25,
        }
    }
}

impl FlagLayout {
    /// Bit index assigned to `flag`.
    pub fn bit(&self, flag: MessageFlag) -> u8 {
        match flag {
            MessageFlag::Read => self.read,
            MessageFlag::Deleted => self.deleted,
            MessageFlag::Answered => self.answered,
            MessageFlag::Encrypted => self.encrypted,
            MessageFlag::Flagged => self.flagged,
            MessageFlag::Recent => self.recent,
            MessageFlag::Draft => self.draft,
            MessageFlag::Initial => self.initial,
            MessageFlag::Forwarded => self.forwarded,
            MessageFlag::Redirected => self.redirected,
            MessageFlag::Signed => self.signed,
            MessageFlag::Junk => self.junk,
            MessageFlag::NotJunk => self.not_junk,
        }
    }

    /// Decode a raw `flags` integer into the set of flags it carries.
    ///
    /// Bit positions of 64 or more never match.
    pub fn decode(&self, raw: u64) -> FlagSet {
        let flags = MessageFlag::ALL
            .iter()
            .copied()
            .filter(|&flag| {
                let bit = self.bit(flag);
                bit < 64 && raw & (1u64 << bit) != 0
            })
            .collect();
        FlagSet(flags)
    }
}

/// The set of flags decoded for one container. Never mutated after decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagSet(BTreeSet<MessageFlag>);

impl FlagSet {
    pub fn contains(&self, flag: MessageFlag) -> bool {
        self.0.contains(&flag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = MessageFlag> + '_ {
        self.0.iter().copied()
    }

    /// `true` if the message was deleted in Mail.app.
    pub fn is_deleted(&self) -> bool {
        self.contains(MessageFlag::Deleted)
    }
}

impl FromIterator<MessageFlag> for FlagSet {
    fn from_iter<I: IntoIterator<Item = MessageFlag>>(iter: I) -> Self {
        FlagSet(iter.into_iter().collect())
    }
}
