/// Terminal front end: account commands and the interactive chat session
use crate::api::HttpApi;
use crate::channel::{self, ConnectionState};
use crate::config::Config;
use crate::engine::{Phase, SyncEngine, ViewState};
use crate::error::ChatError;
use crate::messenger_types::{Message, UserId};
use crate::runtime::{ChatRuntime, ClientHandle};
use crate::session::{Authenticator, SessionStore};
use chrono::Utc;
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("parley")
        .to_string();

    let (config, rest) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let Some(command) = rest.first() else {
        print_usage(&bin);
        return Ok(());
    };

    match command.as_str() {
        "login" => {
            if rest.len() < 3 {
                eprintln!("{}", format!("Usage: {} login <username> <password>", bin).yellow());
                return Ok(());
            }
            login(&config, &rest[1], &rest[2]).await?;
        }
        "register" => {
            if rest.len() < 3 {
                eprintln!("{}", format!("Usage: {} register <username> <password>", bin).yellow());
                return Ok(());
            }
            register(&config, &rest[1], &rest[2]).await?;
        }
        "chat" => {
            chat(&config, &bin).await?;
        }
        "logout" => {
            let store = SessionStore::new(&config.data_dir);
            if store.clear()? {
                println!("{} Logged out", "✓".green().bold());
            } else {
                println!("{}", "Not logged in".yellow());
            }
        }
        "whoami" => {
            whoami(&config)?;
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
        }
    }

    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "💬 Parley".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [--server <url>] [--data-dir <path>] <command>", bin);
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <username> <password>   Log in and remember the session", "login".cyan());
    println!("  {} <username> <password>   Create an account", "register".cyan());
    println!("  {}                          Open the interactive chat", "chat".cyan());
    println!("  {}                        Forget the stored session", "logout".cyan());
    println!("  {}                        Show the logged-in user", "whoami".cyan());
    println!();
    println!("{}", "Options:".bright_white().bold());
    println!("  --timeout-ms <n>    Request timeout (default 10000)");
    println!("  --debounce-ms <n>   Search debounce (default 250)");
    println!("  --greeting <text>   First message when starting a chat (default \"Hi\")");
    println!();
    println!("{}", "Environment:".bright_white().bold());
    println!("  PARLEY_SERVER_URL, PARLEY_DATA_DIR, RUST_LOG");
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{} {}", "✗".red().bold(), message.to_string().red());
    std::process::exit(1);
}

async fn login(config: &Config, username: &str, password: &str) -> anyhow::Result<()> {
    let api = HttpApi::from_config(config);
    let session = match api.login(username, password).await {
        Ok(session) => session,
        Err(ChatError::Auth(detail)) => fail(detail),
        Err(e) => fail(format!("Could not reach {}: {}", config.server_url, e)),
    };

    SessionStore::new(&config.data_dir).save(&session)?;
    println!(
        "{} Logged in as {} (id {})",
        "✓".green().bold(),
        session.identity.username.cyan().bold(),
        session.identity.id
    );
    if let Some(expiry) = session.expires_at() {
        println!("  Session valid until {}", expiry.format("%Y-%m-%d %H:%M UTC").to_string().dimmed());
    }
    Ok(())
}

async fn register(config: &Config, username: &str, password: &str) -> anyhow::Result<()> {
    let api = HttpApi::from_config(config);
    match api.register(username, password).await {
        Ok(identity) => {
            println!(
                "{} Registered {} (id {})",
                "✓".green().bold(),
                identity.username.cyan().bold(),
                identity.id
            );
            println!("  Now run: login {} <password>", identity.username);
            Ok(())
        }
        Err(ChatError::Auth(detail)) => fail(detail),
        Err(e) => fail(format!("Could not reach {}: {}", config.server_url, e)),
    }
}

fn whoami(config: &Config) -> anyhow::Result<()> {
    let store = SessionStore::new(&config.data_dir);
    match store.load()? {
        Some(session) => {
            println!(
                "{} (id {})",
                session.identity.username.cyan().bold(),
                session.identity.id
            );
            match session.expires_at() {
                Some(expiry) if session.is_expired(Utc::now()) => {
                    println!("  {} {}", "expired".red(), expiry.format("%Y-%m-%d %H:%M UTC"));
                }
                Some(expiry) => {
                    println!("  valid until {}", expiry.format("%Y-%m-%d %H:%M UTC"));
                }
                None => {}
            }
        }
        None => println!("{}", "Not logged in".yellow()),
    }
    Ok(())
}

enum Exit {
    Quit,
    Logout,
}

async fn chat(config: &Config, bin: &str) -> anyhow::Result<()> {
    let store = SessionStore::new(&config.data_dir);
    let session = match store.load()? {
        Some(session) => session,
        None => fail(format!("Not logged in. Run: {} login <username> <password>", bin)),
    };
    if session.is_expired(Utc::now()) {
        store.clear()?;
        fail(format!("Session expired. Run: {} login <username> <password>", bin));
    }

    let api = Arc::new(HttpApi::from_config(config));
    let (outbox, events) =
        channel::connect(&config.ws_url()?, &session.credential, config.keepalive_interval).await?;

    let mut engine = SyncEngine::new(session.identity.clone());
    engine.attach_outbox(Box::new(outbox));
    let (runtime, client) = ChatRuntime::new(config, engine, api, events);
    let sync_loop = tokio::spawn(runtime.run());

    println!(
        "{} {} {}",
        "💬".bright_cyan(),
        "Chatting as".bright_white().bold(),
        session.identity.username.cyan().bold()
    );
    println!("{}", "Type /help for commands".dimmed());

    let exit = repl(client, session.identity.id).await;
    // Dropping the last handle stops the loop
    if let Err(e) = sync_loop.await? {
        tracing::warn!("Sync loop ended with error: {}", e);
    }

    if let Exit::Logout = exit? {
        store.clear()?;
        println!("{} Logged out", "✓".green().bold());
    }
    Ok(())
}

async fn repl(mut client: ClientHandle, me: UserId) -> anyhow::Result<Exit> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut screen = Screen::default();
    screen.render(&client.view(), me);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(Exit::Quit);
                };
                if let Some(exit) = handle_line(&client, line.trim(), me).await? {
                    return Ok(exit);
                }
            }
            view = client.changed() => {
                match view {
                    Ok(view) => screen.render(&view, me),
                    Err(_) => return Ok(Exit::Quit),
                }
            }
        }
    }
}

async fn handle_line(client: &ClientHandle, line: &str, me: UserId) -> anyhow::Result<Option<Exit>> {
    if line.is_empty() {
        return Ok(None);
    }
    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "/quit" | "/exit" => return Ok(Some(Exit::Quit)),
        "/logout" => {
            client.logout()?;
            return Ok(Some(Exit::Logout));
        }
        "/help" => print_help(),
        "/search" => {
            client.search(arg)?;
            if arg.is_empty() {
                println!("{}", "Search cleared".dimmed());
            }
        }
        "/start" => {
            let view = client.view();
            match pick(&view.search.results, arg) {
                Some(peer) => {
                    let name = peer.username.clone();
                    match client.start_chat(peer.clone()).await {
                        Ok(()) => println!("{} Said hello to {}", "✓".green().bold(), name.cyan()),
                        Err(e) => eprintln!("{} {}", "✗".red().bold(), e.to_string().red()),
                    }
                }
                None => eprintln!("{}", "Usage: /start <n> (number from /search results)".yellow()),
            }
        }
        "/list" => print_conversations(&client.view(), me),
        "/open" => {
            let view = client.view();
            match pick(&view.conversations, arg) {
                Some(conversation) => client.open(conversation.clone())?,
                None => eprintln!("{}", "Usage: /open <n> (number from /list)".yellow()),
            }
        }
        "/refresh" => client.refresh()?,
        _ if command.starts_with('/') => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
        }
        _ => {
            if let Err(e) = client.send(line).await {
                eprintln!("{} {}", "✗".red().bold(), e.to_string().red());
            }
        }
    }
    Ok(None)
}

/// 1-based index into a listing
fn pick<'a, T>(items: &'a [T], arg: &str) -> Option<&'a T> {
    let n = arg.parse::<usize>().ok()?;
    items.get(n.checked_sub(1)?)
}

fn print_help() {
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <text>   Find people (no text clears)", "/search".cyan());
    println!("  {} <n>       Say hello to search result n", "/start".cyan());
    println!("  {}           Show conversations", "/list".cyan());
    println!("  {} <n>        Open conversation n", "/open".cyan());
    println!("  {}        Re-fetch conversations and messages", "/refresh".cyan());
    println!("  {}         End the session and forget it", "/logout".cyan());
    println!("  {}           Leave (session is kept)", "/quit".cyan());
    println!("  Anything else is sent to the open conversation");
}

fn print_conversations(view: &ViewState, me: UserId) {
    if view.conversations.is_empty() {
        println!("{}", "No conversations yet".yellow());
        return;
    }
    println!("{}", "Conversations:".bright_white().bold());
    for (i, conversation) in view.conversations.iter().enumerate() {
        let peer = conversation
            .peer_of(me)
            .map(|id| format!("user {}", id))
            .unwrap_or_else(|| "?".to_string());
        let marker = if view.active() == Some(conversation.id) {
            "●".green()
        } else {
            " ".normal()
        };
        println!("  {} {:>2}. #{} with {}", marker, i + 1, conversation.id, peer.cyan());
    }
}

fn print_message(message: &Message, me: UserId) {
    let who = if message.sender_id == me {
        "me".green().bold()
    } else {
        format!("user {}", message.sender_id).cyan().bold()
    };
    let pending = if message.is_optimistic() {
        " (sending)".dimmed()
    } else {
        "".normal()
    };
    println!(
        "  {} {}: {}{}",
        message.timestamp.format("%H:%M").to_string().dimmed(),
        who,
        message.content,
        pending
    );
}

/// Prints only what changed between published views
#[derive(Default)]
struct Screen {
    last: Option<ViewState>,
}

impl Screen {
    fn render(&mut self, view: &ViewState, me: UserId) {
        let first = self.last.is_none();
        let prev = self.last.take().unwrap_or_default();

        if first || view.connection != prev.connection {
            let label = match view.connection {
                ConnectionState::Connected => "connected".green(),
                ConnectionState::Connecting => "connecting".yellow(),
                ConnectionState::Closing => "closing".yellow(),
                ConnectionState::Disconnected => "disconnected (sending disabled)".red(),
            };
            println!("{} {}", "●".dimmed(), label);
        }

        if view.conversations.len() != prev.conversations.len() && !view.conversations.is_empty() {
            println!(
                "{}",
                format!("{} conversation(s), /list to show", view.conversations.len()).dimmed()
            );
        }

        if view.phase != prev.phase {
            match view.phase {
                Phase::Loading(id) => println!("{}", format!("Loading #{}…", id).dimmed()),
                Phase::Active(id) if prev.phase != Phase::Loading(id) => {
                    println!("{}", format!("── #{} ──", id).bright_white().bold());
                }
                _ => {}
            }
        }

        if view.messages_for != prev.messages_for || view.messages != prev.messages {
            self.render_messages(view, &prev, me);
        }

        if view.search.results != prev.search.results && !view.search.results.is_empty() {
            println!("{}", "Search results:".bright_white().bold());
            for (i, user) in view.search.results.iter().enumerate() {
                println!("  {:>2}. {} (id {})", i + 1, user.username.cyan(), user.id);
            }
            println!("{}", "/start <n> to say hello".dimmed());
        }

        self.last = Some(view.clone());
    }

    fn render_messages(&self, view: &ViewState, prev: &ViewState, me: UserId) {
        // Same conversation and the old list is a prefix: print the tail only
        let common = if view.messages_for == prev.messages_for
            && view.messages.len() >= prev.messages.len()
            && view.messages[..prev.messages.len()] == prev.messages[..]
        {
            prev.messages.len()
        } else {
            if let Some(id) = view.messages_for {
                println!("{}", format!("── #{} ──", id).bright_white().bold());
            }
            0
        };
        for message in &view.messages[common..] {
            print_message(message, me);
        }
    }
}
