//! Approval gate.
//!
//! `waiting_for_approval` never blocks the client: it becomes a prompt the
//! user can answer at any time. Prompts are keyed by approval id, so several
//! may be outstanding and they are resolved in whatever order answers or
//! confirmations arrive.

use std::collections::HashMap;

use serde::Serialize;
use taskpilot_protocol::new_id;
use taskpilot_protocol::server::{ApprovalResponseReceived, WaitingForApproval};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApprovalState {
    /// Waiting for the user.
    Pending,
    /// The user answered; the response has been sent.
    Answered { approved: bool },
    /// The engine confirmed a decision.
    Resolved { approved: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPrompt {
    pub approval_id: String,
    pub action_description: String,
    pub proposed_command: Option<String>,
    pub action_type: Option<String>,
    pub requested_at: String,
    pub state: ApprovalState,
}

impl ApprovalPrompt {
    pub fn is_pending(&self) -> bool {
        self.state == ApprovalState::Pending
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApprovalGate {
    prompts: Vec<ApprovalPrompt>,
    index: HashMap<String, usize>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prompts(&self) -> &[ApprovalPrompt] {
        &self.prompts
    }

    pub fn pending(&self) -> impl Iterator<Item = &ApprovalPrompt> {
        self.prompts.iter().filter(|p| p.is_pending())
    }

    pub fn get(&self, approval_id: &str) -> Option<&ApprovalPrompt> {
        self.index.get(approval_id).map(|&pos| &self.prompts[pos])
    }

    pub fn clear(&mut self) {
        self.prompts.clear();
        self.index.clear();
    }

    /// Record a new prompt. A repeated id leaves the existing prompt as is.
    /// A prompt without an id gets a generated one so it can be answered.
    pub fn request(&mut self, request: &WaitingForApproval, now: String) -> Option<&ApprovalPrompt> {
        let approval_id = if request.approval_id.is_empty() {
            let generated = format!("approval-{}", new_id());
            debug!(
                component = "approval",
                event = "approval.request.missing_id",
                approval_id = %generated,
                "Approval request without id"
            );
            generated
        } else {
            request.approval_id.clone()
        };

        if self.index.contains_key(&approval_id) {
            debug!(
                component = "approval",
                event = "approval.request.duplicate",
                approval_id = %request.approval_id,
                "Approval already tracked"
            );
            return None;
        }

        let pos = self.prompts.len();
        self.index.insert(approval_id.clone(), pos);
        self.prompts.push(ApprovalPrompt {
            approval_id,
            action_description: request.action_description.clone(),
            proposed_command: request.proposed_command.clone(),
            action_type: request.action_type.clone(),
            requested_at: now,
            state: ApprovalState::Pending,
        });
        Some(&self.prompts[pos])
    }

    /// Mark a prompt as answered by the user. Returns `false` for an id the
    /// gate has never seen; the answer is still worth sending in that case.
    pub fn answer(&mut self, approval_id: &str, approved: bool) -> bool {
        match self.index.get(approval_id) {
            Some(&pos) => {
                let prompt = &mut self.prompts[pos];
                if prompt.is_pending() {
                    prompt.state = ApprovalState::Answered { approved };
                }
                true
            }
            None => false,
        }
    }

    /// Apply an engine confirmation. Confirmations without an id resolve
    /// nothing: with several prompts outstanding there is no safe guess.
    pub fn resolve(&mut self, response: &ApprovalResponseReceived) -> Option<&ApprovalPrompt> {
        let approval_id = response.approval_id.as_deref()?;
        let pos = *self.index.get(approval_id)?;
        let prompt = &mut self.prompts[pos];
        prompt.state = ApprovalState::Resolved {
            approved: response.approved,
        };
        Some(&self.prompts[pos])
    }
}
