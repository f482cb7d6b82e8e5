//! Shared lifecycle states
//!
//! The declaration order is part of the wire contract: the out-of-order guard
//! compares ordinals, so variants must never be reordered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state shared by services and node managers
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum States {
    #[default]
    Unknown,
    Configured,
    Launching,
    Running,
    ShuttingDown,
    ShuttingDownNoRestart,
    Inactive,
    InactiveNoStart,
    Delete,
    DeleteInactive,
}

impl States {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// A service in this state may be handed a fresh launch command.
    pub fn is_launchable(self) -> bool {
        matches!(self, States::Unknown | States::Configured | States::Inactive)
    }

    /// The entity is on its way out of the tables.
    pub fn is_deleting(self) -> bool {
        matches!(self, States::Delete | States::DeleteInactive)
    }

    /// Transitions the lifecycle allows. Used for diagnostics only; incoming
    /// updates are filtered by [`is_stale_update`], not by this table.
    pub fn can_transition_to(self, next: States) -> bool {
        use States::*;
        match (self, next) {
            (a, b) if a == b => true,
            (DeleteInactive, _) => false,
            (_, Delete) => true,
            (Delete, DeleteInactive) => true,
            (Unknown | Configured | Inactive, Launching) => true,
            (Unknown, Configured) => true,
            (Launching, Running) => true,
            // restart after a non-fatal exit
            (Running, Launching) => true,
            (Launching | Running, ShuttingDown | ShuttingDownNoRestart) => true,
            (ShuttingDown, Inactive) => true,
            (ShuttingDownNoRestart, InactiveNoStart) => true,
            (Launching | Running, Inactive | InactiveNoStart) => true,
            (Unknown | Configured, Inactive) => true,
            (InactiveNoStart | Inactive, Configured) => true,
            _ => false,
        }
    }
}

impl fmt::Display for States {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Out-of-order guard for replicated status updates.
///
/// An incoming state is dropped only when the stored state is exactly one
/// ordinal ahead of it (e.g. `Launching` arriving after `Running`). Equal
/// ordinals, forward moves and gaps of two or more are all accepted.
pub fn is_stale_update(current: States, incoming: States) -> bool {
    current.ordinal() == incoming.ordinal() + 1
}
