//! Taskpilot CLI
//!
//! Starts agent runs against a remote execution engine and streams their
//! output, chat and approval prompts to the terminal.

mod config;
mod input;
mod logging;
mod render;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use console::Term;
use taskpilot_protocol::StartParams;
use taskpilot_session::{SessionError, SessionHandle, SessionUpdate, WebSocketTransport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{ConnectionOverrides, FileConfig, RunDefaults};
use crate::input::{parse_input, InputCommand, HELP};
use crate::render::Renderer;

#[derive(Parser, Debug)]
#[command(name = "taskpilot")]
#[command(about = "Run and steer agent sessions from the terminal")]
#[command(version)]
struct Cli {
    /// Data directory (config.toml, logs/)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct ConnectionArgs {
    /// WebSocket endpoint of the execution engine
    #[arg(long, env = "TASKPILOT_SERVER_URL", global = true)]
    server_url: Option<String>,

    /// Endpoint that mints short-lived session tokens
    #[arg(long, env = "TASKPILOT_TOKEN_URL", global = true)]
    token_url: Option<String>,

    /// Bearer key for the token endpoint
    #[arg(long, env = "TASKPILOT_API_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,

    /// Use a fixed token instead of the token endpoint
    #[arg(long, env = "TASKPILOT_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a task and stream it until it ends
    Run(RunArgs),

    /// Connect without a run and chat with the agent
    Chat,

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// What the agent should do
    task: String,

    #[arg(long)]
    mode: Option<String>,

    #[arg(long)]
    model: Option<String>,

    /// Client identifier reported to the engine
    #[arg(long)]
    source: Option<String>,

    #[arg(long)]
    publisher: Option<String>,

    /// Project root (defaults to the current directory)
    #[arg(long)]
    project_path: Option<PathBuf>,

    /// Allow the agent to write files
    #[arg(long)]
    write: bool,

    #[arg(long)]
    project_id: Option<String>,

    #[arg(long)]
    region: Option<String>,

    /// Print the assembled prompt on the engine side
    #[arg(long)]
    debug_prompt: bool,

    /// Skip approval prompts
    #[arg(long)]
    no_approval: bool,

    #[arg(long)]
    frontend: bool,

    /// Keep the session open after the run ends
    #[arg(long)]
    stay: bool,
}

impl RunArgs {
    fn into_params(self, defaults: &RunDefaults, server_url: &str) -> anyhow::Result<StartParams> {
        let project_path = match self.project_path {
            Some(path) => path,
            None => std::env::current_dir().context("resolving current directory")?,
        };
        Ok(StartParams {
            task: self.task,
            mode: self
                .mode
                .or_else(|| defaults.mode.clone())
                .unwrap_or_else(|| "agent".to_string()),
            model: self
                .model
                .or_else(|| defaults.model.clone())
                .unwrap_or_default(),
            source: self
                .source
                .or_else(|| defaults.source.clone())
                .unwrap_or_else(|| "cli".to_string()),
            publisher: self.publisher,
            project_path: project_path.display().to_string(),
            write_mode: self.write,
            project_id: self.project_id,
            region: self.region,
            server_url: Some(server_url.to_string()),
            debug_prompt: self.debug_prompt,
            no_approval: self.no_approval,
            frontend: self.frontend || defaults.frontend.unwrap_or(false),
            session_id: None,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let run = match cli.command {
        Command::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "taskpilot", &mut io::stdout());
            return Ok(());
        }
        Command::Run(args) => Some(args),
        Command::Chat => None,
    };

    let data_dir = config::init_data_dir(cli.data_dir.as_deref())?;
    let _logging = logging::init_logging(&config::log_dir(&data_dir))?;
    let file = FileConfig::load(&config::config_path(&data_dir))?;

    let connection = config::resolve_connection(
        ConnectionOverrides {
            server_url: cli.connection.server_url,
            token_url: cli.connection.token_url,
            api_key: cli.connection.api_key,
            token: cli.connection.token,
        },
        &file,
    )?;

    info!(
        component = "cli",
        event = "cli.started",
        data_dir = %data_dir.display(),
        server_url = %connection.server_url,
        "Taskpilot CLI starting"
    );

    let transport = Arc::new(WebSocketTransport::new(connection.server_url.clone()));
    let handle = SessionHandle::spawn(transport, connection.credentials);
    let updates = handle.subscribe();
    let mut renderer = Renderer::new(Term::stdout());

    let chat_only = run.is_none();
    let exit_when_finished = match run {
        Some(args) => {
            let stay = args.stay;
            let params = args.into_params(&file.defaults, &connection.server_url)?;
            let session_id = handle.start(params).await?;
            renderer.notice(&format!("session {}", session_id))?;
            !stay
        }
        None => {
            if let Err(e) = handle.connect().await {
                renderer.failure(&e.to_string())?;
                return Err(e.into());
            }
            renderer.notice("chatting; type a message, /help for commands")?;
            false
        }
    };

    drive(&handle, updates, &mut renderer, exit_when_finished, chat_only).await?;

    match handle.disconnect().await {
        Ok(()) | Err(SessionError::SessionClosed) => {}
        Err(e) => warn!(
            component = "cli",
            event = "cli.disconnect_failed",
            error = %e,
            "Disconnect failed"
        ),
    }
    Ok(())
}

/// Render updates and forward typed commands until the run ends, input
/// closes, or the user quits.
async fn drive(
    handle: &SessionHandle,
    mut updates: broadcast::Receiver<SessionUpdate>,
    renderer: &mut Renderer,
    exit_when_finished: bool,
    chat_only: bool,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut watch = RunWatch {
        exit_when_finished,
        was_running: handle.snapshot().status.is_running,
    };

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    renderer.render(&update)?;
                    if let SessionUpdate::Status(status) = &update {
                        if watch.observe(status.is_running) {
                            renderer.notice("run finished")?;
                            return Ok(());
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "cli",
                        event = "cli.updates.lagged",
                        skipped,
                        "Terminal fell behind session updates"
                    );
                    // The skipped updates may have carried the end of the run
                    if watch.observe(handle.snapshot().status.is_running) {
                        renderer.notice("run finished")?;
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },

            line = lines.next_line() => match line? {
                Some(line) => {
                    if !dispatch(handle, &line, renderer, chat_only).await? {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },

            _ = tokio::signal::ctrl_c() => {
                renderer.notice("interrupted; disconnecting")?;
                return Ok(());
            }
        }
    }
}

/// Notices the running flag dropping while the CLI waits on a run.
struct RunWatch {
    exit_when_finished: bool,
    was_running: bool,
}

impl RunWatch {
    /// Record the latest flag. True when it marks the end of the run.
    fn observe(&mut self, is_running: bool) -> bool {
        let finished = self.exit_when_finished && self.was_running && !is_running;
        self.was_running = is_running;
        finished
    }
}

/// Handle one typed line. Returns `false` when the user asked to quit.
async fn dispatch(
    handle: &SessionHandle,
    line: &str,
    renderer: &Renderer,
    chat_only: bool,
) -> anyhow::Result<bool> {
    let command = match parse_input(line) {
        Ok(Some(command)) => command,
        Ok(None) => return Ok(true),
        Err(message) => {
            renderer.failure(&message)?;
            return Ok(true);
        }
    };

    let command = match command {
        InputCommand::Stdin(text) if chat_only => InputCommand::Chat(text),
        other => other,
    };

    let result = match command {
        InputCommand::Stop => handle.stop().await,
        InputCommand::Interrupt(message) => handle.send_interrupt(message).await,
        InputCommand::Chat(text) => handle.send_chat_message(text).await,
        InputCommand::Stdin(data) => handle.send_stdin(data).await,
        InputCommand::Approve(id) => answer(handle, renderer, id, true).await?,
        InputCommand::Deny(id) => answer(handle, renderer, id, false).await?,
        InputCommand::Help => {
            renderer.notice(HELP)?;
            return Ok(true);
        }
        InputCommand::Quit => return Ok(false),
    };

    match result {
        Ok(()) => Ok(true),
        Err(SessionError::SessionClosed) => Ok(false),
        Err(e) => {
            renderer.failure(&e.to_string())?;
            Ok(true)
        }
    }
}

/// Answer `id`, or the oldest pending prompt when no id was typed.
async fn answer(
    handle: &SessionHandle,
    renderer: &Renderer,
    id: Option<String>,
    approved: bool,
) -> anyhow::Result<Result<(), SessionError>> {
    match id.or_else(|| oldest_pending(handle)) {
        Some(id) => Ok(handle.send_approval_response(id, approved, None).await),
        None => {
            renderer.failure("no pending approvals")?;
            Ok(Ok(()))
        }
    }
}

fn oldest_pending(handle: &SessionHandle) -> Option<String> {
    handle
        .snapshot()
        .approvals
        .iter()
        .find(|p| p.is_pending())
        .map(|p| p.approval_id.clone())
}
