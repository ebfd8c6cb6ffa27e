//! assistant-chat: terminal client for the resume assistant.
//!
//! Opens the conversation for one analysis and reads turns from stdin.
//!
//! # Commands
//! - `/retry`             resend the last message
//! - `/section [name]`    set or clear the section being edited
//! - `/goto <path>`       switch conversation by app path
//! - `/quit`              exit

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use assistant_api::conversation::identity::IdentitySources;
use assistant_api::conversation::session::{
    ConversationSession, Rejection, TranscriptEntry, TurnOutcome,
};
use assistant_api::conversation::transport::HttpTurnBackend;
use assistant_api::models::conversation::MessageRole;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

#[derive(Debug, Parser)]
#[command(name = "assistant-chat", version, about = "Chat with the resume assistant")]
struct Cli {
    /// Assistant API base URL
    #[arg(long, env = "ASSISTANT_API_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Analysis id naming the conversation
    #[arg(long)]
    analysis_id: Option<String>,

    /// App path to resolve the analysis id from, e.g. /analysis/<id>/editor
    #[arg(long, default_value = "")]
    path: String,

    /// Resume section being edited
    #[arg(long)]
    section: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let backend = HttpTurnBackend::new(&cli.server)?;
    let session = ConversationSession::new(Arc::new(backend));
    session.set_section(cli.section.as_deref());

    let sources = IdentitySources {
        explicit_id: cli.analysis_id.as_deref(),
        path: &cli.path,
        ..Default::default()
    };
    let Some(analysis_id) = session.navigate(&sources).await else {
        bail!("No analysis id found; pass --analysis-id or a --path containing one");
    };

    println!("Conversation for analysis {analysis_id}");
    for entry in session.transcript() {
        print_entry(&entry);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let outcome = match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/retry", _) => session.retry().await,
            ("/section", name) => {
                let name = name.trim();
                session.set_section((!name.is_empty()).then_some(name));
                continue;
            }
            ("/goto", path) => {
                match session.navigate(&IdentitySources::from_path(path.trim())).await {
                    Some(id) => {
                        println!("Conversation for analysis {id}");
                        for entry in session.transcript() {
                            print_entry(&entry);
                        }
                    }
                    None => println!("(no analysis id in that path)"),
                }
                continue;
            }
            _ => session.send(line).await,
        };

        match outcome {
            TurnOutcome::Replied(entry) => print_entry(&entry),
            TurnOutcome::Failed { message, retryable } => {
                println!("assistant: {message}");
                if retryable {
                    println!("(type /retry to try again)");
                }
            }
            TurnOutcome::Rejected(Rejection::BlankMessage) => {}
            TurnOutcome::Rejected(Rejection::NothingToRetry) => println!("(nothing to retry)"),
            TurnOutcome::Rejected(reason) => println!("(not sent: {reason:?})"),
            TurnOutcome::Discarded => {}
        }
    }

    Ok(())
}

fn print_entry(entry: &TranscriptEntry) {
    let who = match entry.role {
        MessageRole::User => "you",
        _ => "assistant",
    };
    println!("{who}: {}", entry.content);
    if let Some(suggestion) = &entry.suggestion {
        println!("--- suggestion ---\n{suggestion}\n------------------");
    }
}
