//! Chatsync command-line client
//!
//! Headless front end: signs in, then reads commands and messages from stdin
//! and prints view updates to stdout.

use anyhow::{bail, Context};
use chatsync::{
    client, ApiClient, ChatClient, ClientConfig, ClientUpdate, Command, ConversationKey,
    DeliveryState, LocalStorage,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chatsync", version, about = "Terminal chat client")]
struct Cli {
    /// Directory for config.json and the local database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Overrides the configured server host
    #[arg(long)]
    host: Option<String>,

    /// Overrides the configured server port
    #[arg(long)]
    port: Option<u16>,

    /// Use https/wss
    #[arg(long)]
    tls: bool,

    #[command(subcommand)]
    command: Option<Action>,
}

#[derive(Subcommand)]
enum Action {
    /// Sign in and remember the session
    Login { email: String, password: String },
    /// Create an account
    Register {
        email: String,
        username: String,
        password: String,
    },
    /// Forget the stored session
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Open the interactive chat (default)
    Chat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chatsync=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatsync")
    });
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data directory {:?}", data_dir))?;
    tracing::debug!("Data directory: {:?}", data_dir);

    let mut config = ClientConfig::load(&data_dir).context("failed to load config")?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.tls {
        config.server.use_tls = true;
    }

    let storage = Arc::new(LocalStorage::new(&data_dir)?);
    let api = ApiClient::new(&config)?;

    match cli.command.unwrap_or(Action::Chat) {
        Action::Login { email, password } => {
            let session = client::login(&api, &storage, &email, &password).await?;
            println!("Signed in as {} ({})", session.display_name, session.uid);
        }
        Action::Register { email, username, password } => {
            api.register(&email, &username, &password).await?;
            println!("Account created, you can now log in");
        }
        Action::Logout => {
            client::logout(&api, &storage)?;
            println!("Signed out");
        }
        Action::Whoami => match client::current_user(&storage)? {
            Some(session) => println!("{} <{}> ({})", session.display_name, session.email, session.uid),
            None => println!("Not signed in"),
        },
        Action::Chat => chat(config, storage).await?,
    }

    Ok(())
}

async fn chat(config: ClientConfig, storage: Arc<LocalStorage>) -> anyhow::Result<()> {
    let Some(session) = client::current_user(&storage)? else {
        bail!("not signed in, run `chatsync login <email> <password>` first");
    };
    let self_uid = session.uid.clone();

    let (chat, mut updates) = ChatClient::start(config, storage, session)?;
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let printer = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            if !print_update(&update, &self_uid) {
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Some(command) = parse_line(&line) else {
                        continue;
                    };
                    let quit = matches!(command, Command::Shutdown);
                    if commands_tx.send(command).is_err() || quit {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = commands_tx.send(Command::Shutdown);
                    break;
                }
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    let _ = commands_tx.send(Command::Shutdown);
                    break;
                }
            }
        }
    });

    chat.run(commands_rx).await?;
    reader.abort();
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;
    Ok(())
}

/// Maps one input line to a command. Lines starting with `/` are commands,
/// anything else is sent as a message.
fn parse_line(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::SendText(line.to_string()));
    };

    let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    let arg = arg.trim().to_string();
    let command = match (name, arg.is_empty()) {
        ("open", false) => Command::Open(ConversationKey::Direct(arg)),
        ("group", false) => Command::Open(ConversationKey::Group(arg)),
        ("close", _) => Command::Close,
        ("search", false) => Command::Search(arg),
        ("add", false) => Command::SendContactRequest(arg),
        ("accept", false) => Command::RespondContactRequest { id: arg, accept: true },
        ("reject", false) => Command::RespondContactRequest { id: arg, accept: false },
        ("remove", false) => Command::RemoveContact(arg),
        ("name", false) => Command::UpdateName(arg),
        ("typing", _) => Command::Typing,
        ("refresh", _) => Command::Refresh,
        ("quit", _) | ("exit", _) => Command::Shutdown,
        _ => {
            eprintln!(
                "commands: /open <uid>, /group <id>, /close, /search <text>, /add <uid>, \
                 /accept <id>, /reject <id>, /remove <uid>, /name <name>, /refresh, /quit"
            );
            return None;
        }
    };
    Some(command)
}

/// Prints one update. Returns `false` when the session ended.
fn print_update(update: &ClientUpdate, self_uid: &str) -> bool {
    match update {
        ClientUpdate::Connection(state) => println!("-- connection: {:?}", state),
        ClientUpdate::Directory(entries) => {
            println!("-- conversations");
            for entry in entries {
                let unread = if entry.unread > 0 { format!(" ({})", entry.unread) } else { String::new() };
                let preview = entry.last_message.as_ref().map(|p| p.text.as_str()).unwrap_or("");
                println!("   {}{}  [{}]  {}", entry.display_name, unread, entry.key, preview);
            }
        }
        ClientUpdate::History { conversation, messages } => {
            println!("-- {} ({} messages)", conversation, messages.len());
            for message in messages {
                print_message(message, self_uid);
            }
        }
        ClientUpdate::Message(message) => print_message(message, self_uid),
        ClientUpdate::Delivery { message_id, state, .. } => {
            if *state != DeliveryState::Pending {
                tracing::debug!(%message_id, ?state, "Delivery updated");
            }
        }
        ClientUpdate::Typing { typing, .. } => {
            if !typing.is_empty() {
                println!("   {} typing...", typing.join(", "));
            }
        }
        ClientUpdate::Placeholder => println!("-- no conversation open"),
        ClientUpdate::ContactRequests(requests) => {
            for request in requests {
                let from = request.from_name.as_deref().unwrap_or(&request.from_uid);
                println!("-- contact request {} from {}", request.id, from);
            }
        }
        ClientUpdate::SearchResults(users) => {
            for user in users {
                println!("   {}  [{}]", user.display_name, user.uid);
            }
        }
        ClientUpdate::ProfileUpdated { display_name, profile_image } => {
            if let Some(name) = display_name {
                println!("-- name changed to {}", name);
            }
            if let Some(url) = profile_image {
                println!("-- profile picture: {}", url);
            }
        }
        ClientUpdate::Signal(signal) => tracing::debug!(kind = ?signal.kind, "Ignoring call signal"),
        ClientUpdate::Error(detail) => eprintln!("!! {}", detail),
        ClientUpdate::SessionExpired => {
            eprintln!("!! session expired, please log in again");
            return false;
        }
    }
    true
}

fn print_message(message: &chatsync::Message, self_uid: &str) {
    let who = if message.is_from(self_uid) { "me" } else { message.sender.as_str() };
    let marker = match message.delivery {
        DeliveryState::Pending => " …",
        _ => "",
    };
    let body = if message.text.is_empty() { message.preview() } else { message.text.clone() };
    println!("   [{}] {}: {}{}", message.timestamp.format("%H:%M"), who, body, marker);
}
