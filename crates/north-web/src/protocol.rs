// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire messages for the JSON-over-WebSocket control protocol (spec.md §6).

use serde::{Deserialize, Serialize};

use north_core::{ReviewKind, SessionState};

/// One message sent by the client over the control socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "hello")]
    Hello { token: String, protocol_version: u32 },
    #[serde(rename = "session.create")]
    SessionCreate {
        repo_root: Option<String>,
        conversation_id: Option<String>,
        initial_state: Option<serde_json::Value>,
    },
    #[serde(rename = "chat.send")]
    ChatSend {
        session_id: String,
        content: String,
        mode: Option<north_config::AgentMode>,
        attached_files: Option<Vec<String>>,
    },
    #[serde(rename = "review.resolve")]
    ReviewResolve {
        session_id: String,
        review_id: String,
        kind: ReviewKind,
        decision: String,
    },
    #[serde(rename = "session.cancel")]
    SessionCancel { session_id: String },
    #[serde(rename = "session.stop")]
    SessionStop { session_id: String },
}

/// One message sent by the server over the control socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "ready")]
    Ready { protocol_version: u32 },
    #[serde(rename = "session.created")]
    SessionCreated { session_id: String, state: SessionState },
    #[serde(rename = "state")]
    State { session_id: String, state: SessionState },
    #[serde(rename = "error")]
    Error { session_id: Option<String>, message: String },
}

/// Parse a `review.resolve` message's `decision` string into the concrete
/// decision type matching `kind`, rejecting a mismatch between `kind` and
/// the decision vocabulary that kind accepts.
pub fn parse_decision(kind: ReviewKind, decision: &str) -> Option<ReviewDecision> {
    match kind {
        ReviewKind::Write => match decision {
            "accept" => Some(ReviewDecision::Write(north_core::WriteDecision::Accept)),
            "always" => Some(ReviewDecision::Write(north_core::WriteDecision::Always)),
            "reject" => Some(ReviewDecision::Write(north_core::WriteDecision::Reject)),
            _ => None,
        },
        ReviewKind::Shell => match decision {
            "accept" => Some(ReviewDecision::Shell(north_core::ShellDecision::Accept)),
            "always" => Some(ReviewDecision::Shell(north_core::ShellDecision::Always)),
            "deny" => Some(ReviewDecision::Shell(north_core::ShellDecision::Deny)),
            _ => None,
        },
        ReviewKind::Command => {
            if decision == "cancel" {
                Some(ReviewDecision::Command(None))
            } else {
                Some(ReviewDecision::Command(Some(decision.to_string())))
            }
        }
    }
}

/// A decision parsed out of a `review.resolve` message, ready to hand to the
/// matching `OrchestratorHandle::resolve_*` call.
pub enum ReviewDecision {
    Write(north_core::WriteDecision),
    Shell(north_core::ShellDecision),
    Command(north_core::CommandDecision),
}
