//! Command-line surface for the streaming relay.
//!
//! `hydro <command>` sends one command; with no arguments, each line read from
//! stdin starts a new session in the same conversation.

use anyhow::{bail, Result};
use hydrostream::api::ProxyClient;
use hydrostream::config::ClientConfig;
use hydrostream::state::{Conversation, NamedCommand, SessionState, SessionUpdate, Sink};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if matches!(args.first().map(String::as_str), Some("-h" | "--help")) {
        print_usage();
        return Ok(());
    }

    let config = ClientConfig::load()?;
    config.validate()?;
    let client = ProxyClient::new(&config)?;
    let mut conversation = Conversation::new();

    if !args.is_empty() {
        let input = args.join(" ");
        let state = run_command(&client, &mut conversation, &input).await?;
        if state == SessionState::Errored {
            bail!("session failed");
        }
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        run_command(&client, &mut conversation, input).await?;
    }
    Ok(())
}

async fn run_command(
    client: &ProxyClient,
    conversation: &mut Conversation,
    input: &str,
) -> Result<SessionState> {
    let ticket = conversation.begin(input);
    let (update_tx, mut update_rx) = mpsc::unbounded_channel();
    let handle = client.dispatch(ticket, update_tx);

    let mut stdout = std::io::stdout();
    while let Some(update) = update_rx.recv().await {
        if !conversation.apply(update.clone()) {
            continue;
        }
        match update {
            SessionUpdate::Fragment { text, .. } => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            SessionUpdate::Progress { value, .. } => {
                eprintln!("\n[progress {value:>3}%]");
            }
            SessionUpdate::Completed { result, .. } => {
                println!();
                if let Some(result) = result {
                    println!("{}", serde_json::to_string_pretty(&result.into_value())?);
                }
            }
            SessionUpdate::Failed { message, .. } => {
                println!();
                eprintln!("error: {message}");
            }
        }
    }

    let session = handle.await?;
    if let Some(active) = conversation.active() {
        if active.sink() == Sink::Simulation && active.state() == SessionState::Complete {
            eprintln!("[{} finished at {}%]", active.command(), active.progress());
        }
    }
    Ok(session.state())
}

fn print_usage() {
    println!("usage: hydro [command...]");
    println!();
    println!("Sends free text or a named command to the relay at HYDRO_PROXY_URL.");
    println!("Named commands:");
    for command in NamedCommand::ALL {
        println!("  {}", command.as_str());
    }
}
