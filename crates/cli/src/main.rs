//! VaultAgent command-line adapter.
//!
//! A thin shell over the runtime: resolve the vault, run one turn or one
//! mailbox operation, print the result. Exit codes: 0 success, 2 user
//! error (e.g. agent not found), 3 lock conflict, 4 internal failure.

mod offline;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use va_domain::config::Config;
use va_domain::error::{Error, ErrorCode};
use va_mailbox::{create_notify, Mailbox};
use va_runtime::{CancelToken, Runtime, TurnOutcome, TurnRequest};

/// VaultAgent — a vault-resident agent runtime.
#[derive(Debug, Parser)]
#[command(name = "vaultagent", version, about)]
struct Cli {
    /// Vault root. Falls back to $VAULT_PATH, then the current directory.
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one message to an agent in its current session.
    Chat {
        /// Agent id, name, or directory path.
        agent: String,
        /// The message. Read from stdin when omitted.
        message: Option<String>,
    },
    /// Run one message in a fresh session and print the response.
    Run {
        agent: String,
        message: String,
        /// Output the full outcome as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Drop a notify message into another agent's inbox.
    Send {
        /// Sending agent id.
        from: String,
        /// Receiving agent id.
        to: String,
        #[arg(long)]
        subject: String,
        /// JSON payload; defaults to an empty object.
        #[arg(long)]
        payload: Option<String>,
    },
    /// List every agent discovered under the vault.
    ListAgents,
}

/// What went wrong, plus the taxonomy code that decides the exit status.
struct CliFailure {
    message: String,
    code: ErrorCode,
}

impl From<Error> for CliFailure {
    fn from(error: Error) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

impl CliFailure {
    fn exit_code(&self) -> i32 {
        match self.code {
            ErrorCode::AgentNotFound | ErrorCode::SessionNotFound | ErrorCode::InvalidInput => 2,
            ErrorCode::LockHeld => 3,
            _ => 4,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let vault = cli
        .vault
        .clone()
        .or_else(|| std::env::var_os("VAULT_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    let code = match run(cli.command, &vault).await {
        Ok(()) => 0,
        Err(failure) => {
            eprintln!("error: {}", failure.message);
            failure.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(command: Command, vault: &PathBuf) -> Result<(), CliFailure> {
    match command {
        Command::Chat { agent, message } => {
            let message = match message {
                Some(message) => message,
                None => read_stdin_line()?,
            };
            let outcome = run_turn(vault, &agent, &message, false).await?;
            println!("{}", outcome.response);
            Ok(())
        }
        Command::Run {
            agent,
            message,
            json,
        } => {
            let outcome = run_turn(vault, &agent, &message, true).await?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "run_id": outcome.run_id,
                        "session_id": outcome.session_id,
                        "response": outcome.response,
                        "success": outcome.success,
                        "usage": outcome.usage,
                        "duration_ms": outcome.duration_ms,
                    })
                );
            } else {
                println!("{}", outcome.response);
            }
            Ok(())
        }
        Command::Send {
            from,
            to,
            subject,
            payload,
        } => {
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| CliFailure::from(Error::InvalidInput(format!("--payload: {e}"))))?,
                None => serde_json::json!({}),
            };
            let sender = va_agents::resolve_agent(vault, &from).map_err(CliFailure::from)?;
            let recipient = va_agents::resolve_agent(vault, &to).map_err(CliFailure::from)?;

            let message = create_notify(&from, &to, &subject, "cli.send", payload);
            Mailbox::send_message(message, &sender.path, &recipient.path)
                .map_err(CliFailure::from)?;
            println!("sent \"{subject}\" to {to}");
            Ok(())
        }
        Command::ListAgents => {
            let agents = va_agents::discover_agents(vault).map_err(CliFailure::from)?;
            if agents.is_empty() {
                println!("no agents found under {}", vault.display());
                return Ok(());
            }
            for agent in agents {
                let def = &agent.definition;
                println!(
                    "{:<24} {:<10} {}",
                    def.id,
                    format!("{:?}", def.kind).to_lowercase(),
                    agent.path.display()
                );
            }
            Ok(())
        }
    }
}

async fn run_turn(
    vault: &PathBuf,
    agent: &str,
    message: &str,
    new_session: bool,
) -> Result<TurnOutcome, CliFailure> {
    let config = Config::load(vault).map_err(CliFailure::from)?;
    let runtime = Runtime::new(
        config,
        Arc::new(offline::OfflineLlm),
        Arc::new(offline::NoTools),
    );

    let mut request = TurnRequest::new(vault.clone(), agent, message);
    request.new_session = new_session;
    let outcome = runtime.run_turn(request, &CancelToken::new()).await;

    if let Some(error) = &outcome.error {
        return Err(CliFailure {
            message: error.clone(),
            code: outcome.error_code.unwrap_or(ErrorCode::Internal),
        });
    }
    Ok(outcome)
}

fn read_stdin_line() -> Result<String, CliFailure> {
    use std::io::BufRead;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| CliFailure::from(Error::Io(e)))?;
    let line = line.trim().to_owned();
    if line.is_empty() {
        return Err(Error::InvalidInput("no message given".into()).into());
    }
    Ok(line)
}
