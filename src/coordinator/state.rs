// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pair lifecycle states and the transition table.
//!
//! # Transitions
//!
//! ```text
//!                   start                baseline ok
//! Uninitialized ──────────► Syncing ─────────────────► Replicating ◄──┐
//!                              │ baseline failed        │   ▲   │      │ resync ok
//!                              ▼                suspend │   │   │resync│
//!          ┌──────────────► Stopped          resume ok  ▼   │   ▼      │
//!          │ stop (any)        │ start      Suspended ──┘  Resyncing ──┘
//!          │                   │             │  resync / resume  ▲
//!          │                   ▼ delete      └───(offline)───────┘
//!          │                Deleted
//! ```
//!
//! A failed resync returns to the state it started from. Every legal
//! `(state, trigger)` pair is listed in [`next_state`]; everything else is an
//! `InvalidTransition`.

use crate::error::ReplicationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a replication pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairState {
    Uninitialized,
    /// Baseline transfer in progress.
    Syncing,
    Replicating,
    Suspended,
    Resyncing,
    Stopped,
    /// Terminal.
    Deleted,
}

impl PairState {
    pub const ALL: [PairState; 7] = [
        PairState::Uninitialized,
        PairState::Syncing,
        PairState::Replicating,
        PairState::Suspended,
        PairState::Resyncing,
        PairState::Stopped,
        PairState::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PairState::Uninitialized => "Uninitialized",
            PairState::Syncing => "Syncing",
            PairState::Replicating => "Replicating",
            PairState::Suspended => "Suspended",
            PairState::Resyncing => "Resyncing",
            PairState::Stopped => "Stopped",
            PairState::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PairState {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PairState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ReplicationError::Internal(format!("unknown pair state {:?}", s)))
    }
}

/// Operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Stop,
    Suspend,
    Resume,
    Resync,
    Delete,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::Start,
        Command::Stop,
        Command::Suspend,
        Command::Resume,
        Command::Resync,
        Command::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Suspend => "suspend",
            Command::Resume => "resume",
            Command::Resync => "resync",
            Command::Delete => "delete",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ReplicationError::Config(format!("unknown command {:?}", s)))
    }
}

/// Anything that can move a pair between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Command(Command),
    BaselineComplete,
    BaselineFailed,
    ResyncComplete,
    ResyncFailed,
    /// Health monitor or delivery forced a resync.
    AutoResync,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Command(c) => c.as_str(),
            Trigger::BaselineComplete => "baseline_complete",
            Trigger::BaselineFailed => "baseline_failed",
            Trigger::ResyncComplete => "resync_complete",
            Trigger::ResyncFailed => "resync_failed",
            Trigger::AutoResync => "auto_resync",
        }
    }
}

/// Facts the table needs beyond the current state.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionContext {
    pub has_recovery_points: bool,
    /// The pair has been suspended longer than `max_rp_offline`.
    pub offline_exceeded: bool,
    /// Where a failed resync returns to.
    pub resync_origin: Option<PairState>,
}

/// The transition table. `None` means the trigger is not valid from `state`.
pub fn next_state(state: PairState, trigger: Trigger, ctx: TransitionContext) -> Option<PairState> {
    use Command::*;
    use PairState::*;

    match (state, trigger) {
        (Deleted, _) => None,

        (Uninitialized, Trigger::Command(Start)) => Some(Syncing),
        (Stopped, Trigger::Command(Start)) if ctx.has_recovery_points => Some(Replicating),
        (Stopped, Trigger::Command(Start)) => Some(Syncing),

        (_, Trigger::Command(Stop)) => Some(Stopped),

        (Replicating | Suspended, Trigger::Command(Suspend)) => Some(Suspended),

        (Suspended, Trigger::Command(Resume)) if ctx.offline_exceeded => Some(Resyncing),
        (Suspended, Trigger::Command(Resume)) => Some(Replicating),

        (Replicating | Suspended, Trigger::Command(Resync)) => Some(Resyncing),
        (Replicating, Trigger::AutoResync) => Some(Resyncing),

        (Stopped, Trigger::Command(Delete)) => Some(Deleted),

        (Syncing, Trigger::BaselineComplete) => Some(Replicating),
        (Syncing, Trigger::BaselineFailed) => Some(Stopped),
        (Resyncing, Trigger::ResyncComplete) => Some(Replicating),
        (Resyncing, Trigger::ResyncFailed) => Some(ctx.resync_origin.unwrap_or(Replicating)),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TransitionContext {
        TransitionContext::default()
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in PairState::ALL {
            assert_eq!(state.as_str().parse::<PairState>().unwrap(), state);
        }
        assert!("Paused".parse::<PairState>().is_err());
    }

    #[test]
    fn test_command_parse() {
        assert_eq!("resync".parse::<Command>().unwrap(), Command::Resync);
        assert!("pause".parse::<Command>().is_err());
    }

    #[test]
    fn test_start_depends_on_chain() {
        let with_rps = TransitionContext {
            has_recovery_points: true,
            ..ctx()
        };
        assert_eq!(
            next_state(PairState::Stopped, Trigger::Command(Command::Start), with_rps),
            Some(PairState::Replicating)
        );
        assert_eq!(
            next_state(PairState::Stopped, Trigger::Command(Command::Start), ctx()),
            Some(PairState::Syncing)
        );
    }

    #[test]
    fn test_resume_routes_through_resync_when_offline_too_long() {
        let offline = TransitionContext {
            offline_exceeded: true,
            ..ctx()
        };
        assert_eq!(
            next_state(PairState::Suspended, Trigger::Command(Command::Resume), offline),
            Some(PairState::Resyncing)
        );
        assert_eq!(
            next_state(PairState::Suspended, Trigger::Command(Command::Resume), ctx()),
            Some(PairState::Replicating)
        );
    }

    #[test]
    fn test_failed_resync_returns_to_origin() {
        let from_suspended = TransitionContext {
            resync_origin: Some(PairState::Suspended),
            ..ctx()
        };
        assert_eq!(
            next_state(PairState::Resyncing, Trigger::ResyncFailed, from_suspended),
            Some(PairState::Suspended)
        );
    }

    #[test]
    fn test_deleted_is_terminal() {
        for command in Command::ALL {
            assert_eq!(next_state(PairState::Deleted, Trigger::Command(command), ctx()), None);
        }
    }

    #[test]
    fn test_internal_triggers_only_from_their_state() {
        for state in PairState::ALL {
            let baseline = next_state(state, Trigger::BaselineComplete, ctx());
            assert_eq!(baseline.is_some(), state == PairState::Syncing);
            let resync = next_state(state, Trigger::ResyncComplete, ctx());
            assert_eq!(resync.is_some(), state == PairState::Resyncing);
            let auto = next_state(state, Trigger::AutoResync, ctx());
            assert_eq!(auto.is_some(), state == PairState::Replicating);
        }
    }
}
