// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Review gate suspension handles.
//!
//! A [`Session`](crate::session::Session) carries at most one live
//! `PendingGate` at a time, mirrored by its `DiffReview`/`ShellReview`/
//! `CommandReview` transcript entry. The gate owns a one-shot channel; the
//! run loop `await`s on it and the View resolves it via `resolve_*`.

use tokio::sync::oneshot;

use crate::session::ReviewKind;

/// Decision delivered to a write gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteDecision {
    Accept,
    Always,
    Reject,
}

/// Decision delivered to a shell gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellDecision {
    Accept,
    Always,
    Deny,
}

/// Decision delivered to a command-picker gate: the selected option id, or
/// `None` for cancellation.
pub type CommandDecision = Option<String>;

/// What the run loop is suspended on.
pub enum PendingGate {
    Write { entry_id: String, resolve: oneshot::Sender<WriteDecision> },
    Shell { entry_id: String, resolve: oneshot::Sender<ShellDecision> },
    Command { entry_id: String, resolve: oneshot::Sender<CommandDecision> },
}

impl PendingGate {
    pub fn entry_id(&self) -> &str {
        match self {
            PendingGate::Write { entry_id, .. } => entry_id,
            PendingGate::Shell { entry_id, .. } => entry_id,
            PendingGate::Command { entry_id, .. } => entry_id,
        }
    }

    pub fn kind(&self) -> ReviewKind {
        match self {
            PendingGate::Write { .. } => ReviewKind::Write,
            PendingGate::Shell { .. } => ReviewKind::Shell,
            PendingGate::Command { .. } => ReviewKind::Command,
        }
    }

    /// Resolve this gate to its terminal-reject decision. Used by
    /// cancellation (spec.md §4.9) and by review-gate timeout (spec.md §7).
    pub fn resolve_to_terminal_reject(self) {
        match self {
            PendingGate::Write { resolve, .. } => {
                let _ = resolve.send(WriteDecision::Reject);
            }
            PendingGate::Shell { resolve, .. } => {
                let _ = resolve.send(ShellDecision::Deny);
            }
            PendingGate::Command { resolve, .. } => {
                let _ = resolve.send(None);
            }
        }
    }
}

fn new_write_gate(entry_id: String) -> (PendingGate, oneshot::Receiver<WriteDecision>) {
    let (tx, rx) = oneshot::channel();
    (PendingGate::Write { entry_id, resolve: tx }, rx)
}

fn new_shell_gate(entry_id: String) -> (PendingGate, oneshot::Receiver<ShellDecision>) {
    let (tx, rx) = oneshot::channel();
    (PendingGate::Shell { entry_id, resolve: tx }, rx)
}

fn new_command_gate(entry_id: String) -> (PendingGate, oneshot::Receiver<CommandDecision>) {
    let (tx, rx) = oneshot::channel();
    (PendingGate::Command { entry_id, resolve: tx }, rx)
}

/// Handle returned to the orchestrator when it opens a gate: the entry id to
/// record as `pendingReviewId`, the [`PendingGate`] to stash, and the
/// receiver half to `await` for the resolution.
pub struct GateHandle<D> {
    pub gate: PendingGate,
    pub receiver: oneshot::Receiver<D>,
}

pub fn open_write_gate(entry_id: impl Into<String>) -> GateHandle<WriteDecision> {
    let (gate, receiver) = new_write_gate(entry_id.into());
    GateHandle { gate, receiver }
}

pub fn open_shell_gate(entry_id: impl Into<String>) -> GateHandle<ShellDecision> {
    let (gate, receiver) = new_shell_gate(entry_id.into());
    GateHandle { gate, receiver }
}

pub fn open_command_gate(entry_id: impl Into<String>) -> GateHandle<CommandDecision> {
    let (gate, receiver) = new_command_gate(entry_id.into());
    GateHandle { gate, receiver }
}
