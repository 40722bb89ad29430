//! Terminal rendering of session updates.

use std::collections::HashSet;
use std::io;

use console::{style, Term};
use taskpilot_protocol::{ChatMessage, ChatRole};
use taskpilot_session::{ApprovalPrompt, ApprovalState, ConnectionStatus, SessionUpdate};

/// How a log line is colored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Failure,
    Warning,
    Approval,
    Milestone,
    Echo,
    Plain,
}

const FAILURE_PREFIXES: &[&str] = &[
    "[ERROR]",
    "[LLM ERROR]",
    "[TOOL FAILURE]",
    "[FILE FAILED]",
    "[CHAT ERROR]",
    "[ACTION FAILED]",
    "[AUTH ERROR]",
    "[CONNECTION ERROR]",
    "[STDERR]",
    "[APPROVAL DENIED]",
];

const MILESTONE_PREFIXES: &[&str] = &["[PROCESS]", "[PHASE]", "[END]", "[AUTH]"];

pub fn tone(line: &str) -> Tone {
    if FAILURE_PREFIXES.iter().any(|p| line.starts_with(p)) {
        Tone::Failure
    } else if line.starts_with("[WARNING]") || line.starts_with("[WARN]") {
        Tone::Warning
    } else if line.starts_with("[APPROVAL") {
        Tone::Approval
    } else if MILESTONE_PREFIXES.iter().any(|p| line.starts_with(p)) {
        Tone::Milestone
    } else if line.starts_with("> ") {
        Tone::Echo
    } else {
        Tone::Plain
    }
}

pub struct Renderer {
    term: Term,
    /// Assistant messages already printed in full
    printed: HashSet<String>,
    last_connection: Option<ConnectionStatus>,
}

impl Renderer {
    pub fn new(term: Term) -> Self {
        Self {
            term,
            printed: HashSet::new(),
            last_connection: None,
        }
    }

    pub fn render(&mut self, update: &SessionUpdate) -> io::Result<()> {
        match update {
            SessionUpdate::Output { lines } => {
                for line in lines {
                    self.line(line)?;
                }
            }
            SessionUpdate::Chat(message) => self.chat(message)?,
            SessionUpdate::Approval(prompt) => self.approval(prompt)?,
            SessionUpdate::Status(status) => {
                if self.last_connection != Some(status.connection) {
                    self.last_connection = Some(status.connection);
                    self.notice(&format!("connection: {}", connection_label(status.connection)))?;
                }
            }
            SessionUpdate::Cleared => self.printed.clear(),
            SessionUpdate::OutputCleared | SessionUpdate::EventAppended(_) => {}
        }
        Ok(())
    }

    fn line(&self, line: &str) -> io::Result<()> {
        let styled = match tone(line) {
            Tone::Failure => style(line).red(),
            Tone::Warning => style(line).yellow(),
            Tone::Approval => style(line).magenta().bold(),
            Tone::Milestone => style(line).cyan(),
            Tone::Echo => style(line).dim(),
            Tone::Plain => style(line),
        };
        self.term.write_line(&styled.to_string())
    }

    fn chat(&mut self, message: &ChatMessage) -> io::Result<()> {
        // Local echo: the user just typed it
        if message.role == ChatRole::User || message.is_streaming {
            return Ok(());
        }
        if !self.printed.insert(message.id.clone()) {
            return Ok(());
        }
        self.term.write_line(&format!(
            "{} {}",
            style("assistant:").green().bold(),
            message.content
        ))
    }

    fn approval(&self, prompt: &ApprovalPrompt) -> io::Result<()> {
        match prompt.state {
            ApprovalState::Pending => self.notice(&format!(
                "approval {} pending: /approve {} or /deny {}",
                prompt.approval_id, prompt.approval_id, prompt.approval_id
            )),
            ApprovalState::Answered { .. } | ApprovalState::Resolved { .. } => Ok(()),
        }
    }

    pub fn notice(&self, text: &str) -> io::Result<()> {
        self.term.write_line(&style(text).dim().italic().to_string())
    }

    pub fn failure(&self, text: &str) -> io::Result<()> {
        self.term.write_line(&style(text).red().bold().to_string())
    }
}

fn connection_label(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Disconnected => "disconnected",
        ConnectionStatus::Connecting => "connecting",
        ConnectionStatus::AwaitingAuth => "authenticating",
        ConnectionStatus::Authenticated => "authenticated",
        ConnectionStatus::Closed => "closed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_lines_are_red() {
        assert_eq!(tone("[TOOL FAILURE] execute_command: Command failed"), Tone::Failure);
        assert_eq!(tone("[CONNECTION ERROR] reset"), Tone::Failure);
        assert_eq!(tone("[ERROR] Failed to parse message from server"), Tone::Failure);
    }

    #[test]
    fn other_tones() {
        assert_eq!(tone("[APPROVAL REQUIRED] Run migration"), Tone::Approval);
        assert_eq!(tone("[APPROVAL DENIED] No message"), Tone::Failure);
        assert_eq!(tone("[WARNING] slow"), Tone::Warning);
        assert_eq!(tone("[PROCESS] Started: t"), Tone::Milestone);
        assert_eq!(tone("[AUTH ERROR] nope"), Tone::Failure);
        assert_eq!(tone("> ls"), Tone::Echo);
        assert_eq!(tone("compiling..."), Tone::Plain);
    }
}
