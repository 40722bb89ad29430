//! Interactive input lines → session commands.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    Stop,
    Interrupt(String),
    Chat(String),
    /// `None` targets the oldest pending approval.
    Approve(Option<String>),
    Deny(Option<String>),
    Stdin(String),
    Help,
    Quit,
}

pub const HELP: &str = "\
/stop               request the run to stop
/interrupt <msg>    interrupt the agent with a message
/chat <msg>         send a chat message
/approve [id]       approve a pending action
/deny [id]          deny a pending action
/quit               disconnect and exit
anything else       sent to the process as stdin";

/// Parse one line typed by the user. Blank lines yield `None`.
pub fn parse_input(line: &str) -> Result<Option<InputCommand>, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(InputCommand::Stdin(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let optional = |arg: &str| (!arg.is_empty()).then(|| arg.to_string());

    let command = match name {
        "stop" => InputCommand::Stop,
        "interrupt" if !arg.is_empty() => InputCommand::Interrupt(arg.to_string()),
        "chat" if !arg.is_empty() => InputCommand::Chat(arg.to_string()),
        "interrupt" | "chat" => return Err(format!("/{} needs a message", name)),
        "approve" => InputCommand::Approve(optional(arg)),
        "deny" => InputCommand::Deny(optional(arg)),
        "help" => InputCommand::Help,
        "quit" | "exit" => InputCommand::Quit,
        other => return Err(format!("unknown command /{}; try /help", other)),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_stdin() {
        assert_eq!(
            parse_input("ls -la\n"),
            Ok(Some(InputCommand::Stdin("ls -la".to_string())))
        );
        assert_eq!(parse_input("   "), Ok(None));
    }

    #[test]
    fn slash_commands() {
        assert_eq!(parse_input("/stop"), Ok(Some(InputCommand::Stop)));
        assert_eq!(
            parse_input("/interrupt  use the other branch "),
            Ok(Some(InputCommand::Interrupt("use the other branch".to_string())))
        );
        assert_eq!(
            parse_input("/chat what's next?"),
            Ok(Some(InputCommand::Chat("what's next?".to_string())))
        );
        assert_eq!(
            parse_input("/approve ap-1"),
            Ok(Some(InputCommand::Approve(Some("ap-1".to_string()))))
        );
        assert_eq!(parse_input("/deny"), Ok(Some(InputCommand::Deny(None))));
        assert_eq!(parse_input("/exit"), Ok(Some(InputCommand::Quit)));
    }

    #[test]
    fn bad_commands_are_reported() {
        assert!(parse_input("/chat").is_err());
        assert!(parse_input("/interrupt   ").is_err());
        assert!(parse_input("/frobnicate").is_err());
    }
}
