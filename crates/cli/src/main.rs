use clap::{Parser, Subcommand};
use conductor::cache::TabCache;
use conductor::chat::{ChatWorkflow, ImageAttachment, SendOutcome};
use conductor::config::{self, Config};
use conductor::gateway::{ConnectOptions, GatewayClient, SessionsListParams, METHOD_SESSIONS_LIST};
use conductor::message::{ContentBlock, Message, Role};
use conductor::session::{normalize_session_list, Session, Store, StoreChange};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// How long one-shot commands wait for the gateway handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Conductor CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: CONDUCTOR_CONFIG_PATH or ~/.conductor/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// List sessions known to the gateway.
    Sessions {
        /// Config file path (default: CONDUCTOR_CONFIG_PATH or ~/.conductor/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Print the message history of a session.
    History {
        /// Session key (or id).
        key: String,

        /// Config file path (default: CONDUCTOR_CONFIG_PATH or ~/.conductor/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Print a file from the gateway host.
    Cat {
        /// Path on the gateway host.
        path: String,

        /// Config file path (default: CONDUCTOR_CONFIG_PATH or ~/.conductor/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Chat through the gateway (interactive). Open tabs are restored from the last run.
    Chat {
        /// Config file path (default: CONDUCTOR_CONFIG_PATH or ~/.conductor/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Session key to open and focus.
        #[arg(long, value_name = "KEY")]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("conductor {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Sessions { config }) => {
            if let Err(e) = run_sessions(config).await {
                log::error!("sessions failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::History { key, config }) => {
            if let Err(e) = run_history(config, &key).await {
                log::error!("history failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Cat { path, config }) => {
            if let Err(e) = run_cat(config, &path).await {
                log::error!("cat failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config, session }) => {
            if let Err(e) = run_chat(config, session).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = conductor::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

/// Wait until the store reports a completed handshake. Returns false on timeout.
async fn wait_for_connection(store: &Store, timeout: Duration) -> bool {
    let mut changes = store.subscribe();
    let wait = async {
        loop {
            if store.connection().await.0 {
                return;
            }
            if changes.recv().await.is_err() {
                // Lagged or closed: re-check on the next loop.
                tokio::task::yield_now().await;
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.is_ok()
}

/// Connect and wait for the handshake; one-shot commands fail if it never completes.
async fn connect_ready(config: &Config) -> anyhow::Result<(GatewayClient, Store)> {
    let store = Store::new();
    let options = ConnectOptions::from_config(config);
    let url = options.url.clone();
    let client = GatewayClient::connect(options, store.clone()).await;
    if !wait_for_connection(&store, CONNECT_TIMEOUT).await {
        let (_, error) = store.connection().await;
        client.close().await;
        anyhow::bail!(
            "could not connect to gateway at {}: {}",
            url,
            error.unwrap_or_else(|| "timed out".to_string())
        );
    }
    Ok((client, store))
}

async fn run_sessions(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let (client, _store) = connect_ready(&config).await?;
    let params = serde_json::to_value(SessionsListParams::default())?;
    let result = client.request(METHOD_SESSIONS_LIST, params).await;
    client.close().await;
    let sessions = normalize_session_list(&result?);
    if sessions.is_empty() {
        println!("no sessions");
    }
    for session in &sessions {
        println!("{}", session_line(session));
    }
    Ok(())
}

async fn run_history(config_path: Option<PathBuf>, key: &str) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let (client, store) = connect_ready(&config).await?;
    let chat = ChatWorkflow::new(client.clone(), store.clone(), config.history.limit);
    let loaded = chat.load_history(key).await;
    client.close().await;
    if loaded.is_none() {
        anyhow::bail!("no history available for {}", key);
    }
    for message in store.messages(key).await {
        println!("{}", render_message(&message));
    }
    Ok(())
}

async fn run_cat(config_path: Option<PathBuf>, path: &str) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let (client, _store) = connect_ready(&config).await?;
    let contents = conductor::exec::read_remote_file(&client, path).await;
    client.close().await;
    print!("{}", contents?);
    Ok(())
}

fn session_line(session: &Session) -> String {
    let last_active = session
        .last_active
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<40} {:<40} {:>5} msgs  {}",
        session.key,
        session.display_label(),
        session.message_count,
        last_active
    )
}

fn render_message(message: &Message) -> String {
    let prefix = match message.role {
        Role::User => "you>",
        Role::Assistant => "<",
    };
    let parts: Vec<String> = message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.trim().is_empty() => Some(text.trim().to_string()),
            ContentBlock::Text { .. } => None,
            ContentBlock::Image { source } => Some(format!("[image {}]", source.media_type)),
            ContentBlock::ToolUse { name, .. } => Some(format!("[tool {}]", name)),
            ContentBlock::ToolResult { .. } => None,
        })
        .collect();
    format!("{} {}", prefix, parts.join("\n"))
}

fn guess_image_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// One line of input inside `conductor chat`.
#[derive(Debug, PartialEq, Eq)]
enum ChatInput<'a> {
    Send(&'a str),
    New,
    Open(&'a str),
    Close,
    Tabs,
    Sessions,
    Files,
    Image(&'a str),
    Cat(&'a str),
    Exit,
    Unknown(&'a str),
}

fn parse_input(line: &str) -> ChatInput<'_> {
    let line = line.trim();
    let Some(command) = line.strip_prefix('/') else {
        return ChatInput::Send(line);
    };
    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match (name.to_ascii_lowercase().as_str(), arg) {
        ("exit" | "quit", _) => ChatInput::Exit,
        ("new", _) => ChatInput::New,
        ("close", _) => ChatInput::Close,
        ("tabs", _) => ChatInput::Tabs,
        ("sessions", _) => ChatInput::Sessions,
        ("files", _) => ChatInput::Files,
        ("open", key) if !key.is_empty() => ChatInput::Open(key),
        ("image", path) if !path.is_empty() => ChatInput::Image(path),
        ("cat", path) if !path.is_empty() => ChatInput::Cat(path),
        _ => ChatInput::Unknown(line),
    }
}

/// Render store changes for the focused tab: streaming tokens as they arrive, and
/// assistant messages that were not streamed.
async fn render(store: Store, started: chrono::DateTime<chrono::Utc>) {
    use std::io::Write;

    let mut changes = store.subscribe();
    let mut streamed: HashMap<String, usize> = HashMap::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                log::debug!("renderer skipped {} store change(s)", n);
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        let current = store.current_session_id().await;
        match change {
            StoreChange::Connection => {
                let (connected, error) = store.connection().await;
                match (connected, error) {
                    (true, _) => eprintln!("[connected]"),
                    (false, Some(e)) => eprintln!("[disconnected: {}]", e),
                    (false, None) => eprintln!("[disconnected]"),
                }
            }
            StoreChange::Streaming(key) if current.as_deref() == Some(key.as_str()) => {
                let printed = streamed.entry(key.clone()).or_insert(0);
                match store.streaming_content(&key).await {
                    Some(content) => {
                        // A shorter buffer means a new stream started.
                        if content.len() < *printed || !content.is_char_boundary(*printed) {
                            *printed = 0;
                        }
                        if content.len() > *printed {
                            if *printed == 0 {
                                print!("< ");
                            }
                            print!("{}", &content[*printed..]);
                            let _ = std::io::stdout().flush();
                            *printed = content.len();
                        }
                    }
                    None => {
                        if *printed > 0 {
                            println!();
                        }
                        *printed = 0;
                        if let Some(error) = store.stream_error(&key).await {
                            eprintln!("[stream ended: {}]", error);
                        }
                    }
                }
            }
            StoreChange::Messages(key) if current.as_deref() == Some(key.as_str()) => {
                let messages = store.messages(&key).await;
                let from = seen.get(&key).copied().unwrap_or(0).min(messages.len());
                let was_streamed = streamed.get(&key).copied().unwrap_or(0) > 0;
                for message in &messages[from..] {
                    if message.role == Role::Assistant && message.timestamp >= started && !was_streamed {
                        println!("{}", render_message(message));
                    }
                }
                seen.insert(key, messages.len());
            }
            _ => {}
        }
    }
}

/// Each time the handshake completes, load history for open tabs that are still
/// empty (tabs restored while the gateway was unreachable).
async fn reload_on_connect(
    chat: ChatWorkflow<GatewayClient>,
    mut changes: tokio::sync::broadcast::Receiver<StoreChange>,
    mut was_connected: bool,
) {
    loop {
        match changes.recv().await {
            // A lagged receiver may have missed the transition; re-check.
            Ok(StoreChange::Connection) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                let connected = chat.store().connection().await.0;
                if connected && !was_connected {
                    let loaded = chat.load_missing_history().await;
                    if loaded > 0 {
                        log::info!("loaded history for {} tab(s) after connecting", loaded);
                    }
                }
                was_connected = connected;
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_transcript(store: &Store, key: &str) {
    let messages = store.messages(key).await;
    let skip = messages.len().saturating_sub(20);
    for message in &messages[skip..] {
        println!("{}", render_message(message));
    }
}

async fn open_tab(chat: &ChatWorkflow<GatewayClient>, key: &str) {
    let store = chat.store();
    store.open_session(key).await;
    if store.messages(key).await.is_empty() {
        chat.load_history(key).await;
    }
    let label = store
        .session(key)
        .await
        .map(|s| s.display_label())
        .unwrap_or_else(|| key.to_string());
    println!("== {} ({})", label, key);
    print_transcript(store, key).await;
}

async fn current_or_new(store: &Store) -> String {
    match store.current_session_id().await {
        Some(key) => key,
        None => store.create_local_session().await,
    }
}

async fn run_chat(config_path: Option<PathBuf>, session: Option<String>) -> anyhow::Result<()> {
    use std::io::Write;

    let (config, _) = config::load_config(config_path)?;
    let cache_path = config::resolve_cache_path(&config);
    let store = Store::new();
    let client = GatewayClient::connect(ConnectOptions::from_config(&config), store.clone()).await;
    let chat = ChatWorkflow::new(client.clone(), store.clone(), config.history.limit);

    if !wait_for_connection(&store, CONNECT_TIMEOUT).await {
        let (_, error) = store.connection().await;
        eprintln!(
            "[not connected: {}; will keep retrying]",
            error.unwrap_or_else(|| "timed out".to_string())
        );
    }
    let changes = store.subscribe();
    let connected_at_restore = store.connection().await.0;
    let restored = chat.restore(&TabCache::load(&cache_path)).await;
    log::debug!("restored {} tab(s) from {}", restored, cache_path.display());
    let reloader = tokio::spawn(reload_on_connect(
        ChatWorkflow::new(client.clone(), store.clone(), config.history.limit),
        changes,
        connected_at_restore,
    ));
    if let Some(key) = session {
        open_tab(&chat, &key).await;
    } else if let Some(key) = store.current_session_id().await {
        open_tab(&chat, &key).await;
    }

    let renderer = tokio::spawn(render(store.clone(), chrono::Utc::now()));
    let mut pending_images: Vec<ImageAttachment> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match parse_input(&line) {
            ChatInput::Send("") => continue,
            ChatInput::Send(text) => {
                let key = current_or_new(&store).await;
                let images = std::mem::take(&mut pending_images);
                match chat.send_message(&key, text, &images).await {
                    SendOutcome::Failed(e) => eprintln!("[send failed: {}]", e),
                    SendOutcome::Sent { .. } | SendOutcome::Empty => {}
                }
            }
            ChatInput::New => {
                let key = store.create_local_session().await;
                println!("== new session {}", key);
            }
            ChatInput::Open(key) => open_tab(&chat, key).await,
            ChatInput::Close => match store.current_session_id().await {
                Some(key) => {
                    store.close_session(&key).await;
                    match store.current_session_id().await {
                        Some(next) => open_tab(&chat, &next).await,
                        None => println!("no open tabs; /new or /open KEY"),
                    }
                }
                None => println!("no open tabs"),
            },
            ChatInput::Tabs => {
                let current = store.current_session_id().await;
                for key in store.active_sessions().await {
                    let marker = if current.as_deref() == Some(key.as_str()) { "*" } else { " " };
                    let label = store
                        .session(&key)
                        .await
                        .map(|s| s.display_label())
                        .unwrap_or_default();
                    println!("{} {}  {}", marker, key, label);
                }
            }
            ChatInput::Sessions => {
                for session in store.sessions().await {
                    println!("{}", session_line(&session));
                }
            }
            ChatInput::Files => match store.current_session_id().await {
                Some(key) => {
                    for touch in store.recent_files(&key).await {
                        println!("{:<6} {}", format!("{:?}", touch.action).to_lowercase(), touch.path);
                    }
                }
                None => println!("no open tabs"),
            },
            ChatInput::Image(path) => {
                let path = Path::new(path);
                match (guess_image_type(path), std::fs::read(path)) {
                    (Some(mime), Ok(bytes)) => {
                        pending_images.push(ImageAttachment::from_bytes(mime, &bytes));
                        println!("[{} image(s) attached to next message]", pending_images.len());
                    }
                    (None, _) => eprintln!("unsupported image type: {}", path.display()),
                    (_, Err(e)) => eprintln!("reading {}: {}", path.display(), e),
                }
            }
            ChatInput::Cat(path) => match conductor::exec::read_remote_file(&client, path).await {
                Ok(contents) => println!("{}", contents),
                Err(e) => eprintln!("[cat failed: {}]", e),
            },
            ChatInput::Exit => break,
            ChatInput::Unknown(line) => eprintln!("unknown command: {}", line),
        }
    }

    let cache = TabCache::from_state(&store.snapshot().await);
    if let Err(e) = cache.save(&cache_path) {
        log::warn!("could not save open tabs: {}", e);
    }
    renderer.abort();
    reloader.abort();
    client.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_commands() {
        assert_eq!(parse_input("  fix the tests "), ChatInput::Send("fix the tests"));
        assert_eq!(parse_input("/QUIT"), ChatInput::Exit);
        assert_eq!(parse_input("/open agent:main:1"), ChatInput::Open("agent:main:1"));
        assert_eq!(parse_input("/image shot.png"), ChatInput::Image("shot.png"));
        assert_eq!(parse_input("/open"), ChatInput::Unknown("/open"));
        assert_eq!(parse_input("/frobnicate"), ChatInput::Unknown("/frobnicate"));
    }

    #[test]
    fn guesses_image_types_by_extension() {
        assert_eq!(guess_image_type(Path::new("a/b.PNG")), Some("image/png"));
        assert_eq!(guess_image_type(Path::new("photo.jpeg")), Some("image/jpeg"));
        assert_eq!(guess_image_type(Path::new("notes.txt")), None);
    }
}
