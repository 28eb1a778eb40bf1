//! tabula-cli — command line frontend for the Tabula chat server
//!
//! Talks to a running tabula-server over its HTTP API with the same client
//! identity semantics as the web frontend.
//!
//! # Subcommands
//! - `sessions`                         — list sessions for this client id
//! - `show <session>`                   — print one session's messages
//! - `chat <message> [--session <id>]`  — send one chat turn
//! - `delete <session>`                 — delete a session
//! - `export <session> [...]`           — save a bot table as CSV
//! - `chart <session> [...]`            — print the chart spec for a table

use clap::{Parser, Subcommand};
use tabula_client::{export, ApiClient, ChatTurn};
use tabula_core::models::{Message, Role, Session, Table};
use tabula_core::render;

const DEFAULT_SERVER: &str = "http://127.0.0.1:5000";

#[derive(Debug, Parser)]
#[command(name = "tabula-cli", version, about = "Tabula chat frontend")]
struct Cli {
    /// Tabula HTTP server URL (overrides TABULA_HTTP_URL env var)
    #[arg(long, env = "TABULA_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Client identity; sessions are scoped to it. A random one is used
    /// when unset, which starts from an empty session list.
    #[arg(long, env = "TABULA_CLIENT_ID")]
    client_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List sessions for this client id
    Sessions,

    /// Print one session's messages
    Show {
        /// Session id
        session: String,
    },

    /// Send one chat turn and print the reply
    Chat {
        /// Message text
        message: String,

        /// Continue an existing session instead of starting a new one
        #[arg(long)]
        session: Option<String>,
    },

    /// Delete a session
    Delete {
        /// Session id
        session: String,
    },

    /// Save a bot table from a session as a CSV file
    Export {
        /// Session id
        session: String,

        /// Message index within the session (defaults to the last bot message)
        #[arg(long)]
        message: Option<usize>,

        /// Table index within the message
        #[arg(long, default_value_t = 0)]
        table: usize,

        /// Output path (defaults to the table's suggested filename)
        #[arg(short, long)]
        out: Option<String>,
    },

    /// Print the chart configuration for a bot table as JSON
    Chart {
        /// Session id
        session: String,

        /// Message index within the session (defaults to the last bot message)
        #[arg(long)]
        message: Option<usize>,

        /// Table index within the message
        #[arg(long, default_value_t = 0)]
        table: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let client = match &cli.client_id {
        Some(id) => ApiClient::with_client_id(&cli.server, id)?,
        None => ApiClient::new(&cli.server)?,
    };

    match cli.command {
        Commands::Sessions => {
            let sessions = client.fetch_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions for client {}", client.client_id());
                return Ok(());
            }
            for session in &sessions {
                println!(
                    "{}  [{} messages]  {}",
                    session.id,
                    session.messages.len(),
                    session.title
                );
            }
        }

        Commands::Show { session } => {
            let session = fetch_required(&client, &session).await?;
            println!("{} — {}", session.id, session.title);
            for message in &session.messages {
                print_message(message);
            }
        }

        Commands::Chat { message, session } => {
            let turn = ChatTurn {
                chat_input: message,
                session_id: session,
                ..ChatTurn::default()
            };
            let response = client.post_chat(&turn).await?;
            println!("session: {}", response.session_id);
            println!("{}", response.reply);
            for table in &response.tables {
                print_table_line(table);
            }
        }

        Commands::Delete { session } => {
            client.delete_session(&session).await?;
            println!("deleted {session}");
        }

        Commands::Export {
            session,
            message,
            table,
            out,
        } => {
            let found = find_table(&client, &session, message, table).await?;
            let artifact = export::export_table(&found);
            let path = out.unwrap_or_else(|| artifact.filename.clone());
            std::fs::write(&path, &artifact.bytes)?;
            println!("wrote {} ({} bytes)", path, artifact.bytes.len());
        }

        Commands::Chart {
            session,
            message,
            table,
        } => {
            let found = find_table(&client, &session, message, table).await?;
            match render::build_chart_spec(&found) {
                Some(spec) => println!("{}", serde_json::to_string_pretty(&spec)?),
                None => anyhow::bail!("table '{}' has no renderable chart", found.label),
            }
        }
    }

    Ok(())
}

async fn fetch_required(client: &ApiClient, session_id: &str) -> anyhow::Result<Session> {
    client
        .fetch_session(session_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("session {session_id} not found"))
}

/// Resolves one table out of a session: an explicit message index, or the
/// most recent bot message that carries tables.
async fn find_table(
    client: &ApiClient,
    session_id: &str,
    message_index: Option<usize>,
    table_index: usize,
) -> anyhow::Result<Table> {
    let session = fetch_required(client, session_id).await?;
    let message = match message_index {
        Some(index) => session
            .messages
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("no message at index {index}"))?,
        None => session
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Bot && !m.table_data.is_empty())
            .ok_or_else(|| anyhow::anyhow!("session has no bot message with tables"))?,
    };
    message
        .table_data
        .get(table_index)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no table at index {table_index}"))
}

fn print_message(message: &Message) {
    let who = match message.role {
        Role::User => "you",
        Role::Bot => "bot",
    };
    println!("[{who}] {}", message.text);
    for table in &message.table_data {
        print_table_line(table);
    }
}

fn print_table_line(table: &Table) {
    let truncated = if table.rows_truncated {
        " (truncated)"
    } else {
        ""
    };
    println!(
        "  table '{}': {} of {} rows{}",
        table.label,
        table.rows.len(),
        table.total_rows,
        truncated
    );
}
