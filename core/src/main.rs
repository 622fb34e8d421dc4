/// Portal Chat demo: a scripted admin <-> client exchange against the
/// in-memory backend, including an offline backfill
use colored::*;
use portal_chat_core::types::{ClientSummary, Role};
use portal_chat_core::{
    ChatConfig, ChatMessage, ChatSession, InMemoryBackend, LocalStore, PortalEvent, Viewer,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

type Session = Arc<ChatSession<InMemoryBackend>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let (viewer, config) = ChatConfig::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let data_dir = config.data_dir_for(&viewer);
    let store = LocalStore::open(&data_dir)
        .map_err(|e| anyhow::anyhow!("Storage error: {}", e))?;
    info!("Using data directory {}", data_dir.display());

    let (admin, client) = match viewer.role {
        Role::Admin => (viewer.clone(), Viewer::client("client-demo")),
        Role::Client => (Viewer::admin("admin-demo"), viewer.clone()),
    };

    let backend = Arc::new(InMemoryBackend::new());
    let conversation = backend
        .seed_conversation(
            &client.id,
            ClientSummary {
                name: "Maria Silva".to_string(),
                email: "maria.silva@example.com".to_string(),
                process_type: Some("Trabalhista".to_string()),
                process_number: Some("0001234-56.2024.5.02.0001".to_string()),
            },
        )
        .await;

    println!("{}", "⚖ Portal Chat demo".bright_cyan().bold());
    println!("  Admin:  {}", admin.id.cyan());
    println!("  Client: {}", client.id.cyan());
    println!("  Conversation: {}", conversation.id.cyan());
    println!();

    // Admin signs in once and out again, leaving a logout watermark
    step("Admin signs in and out");
    let admin_session = login(&admin, &backend, &store, &config).await?;
    admin_session
        .logout()
        .await
        .map_err(|e| anyhow::anyhow!("Logout failed: {}", e))?;
    drop(admin_session);

    // Client writes while the admin is away
    step("Client writes while the admin is offline");
    let client_session = login(&client, &backend, &store, &config).await?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let client_loop = spawn_loop(&client_session, stop_rx.clone());
    client_session
        .select_conversation(&conversation.id)
        .await
        .map_err(|e| anyhow::anyhow!("Select failed: {}", e))?;
    for text in [
        "Olá, bom dia!",
        "Recebi a notificação do tribunal.",
        "Podemos conversar hoje?",
    ] {
        match client_session.send(text).await {
            Ok(message) => println!("  {} {} sent as {}", "✓".green(), text, message.id.cyan()),
            Err(e) => println!("  {} {}: {}", "✗".red().bold(), text, e),
        }
    }

    // Admin comes back: the three messages must show up as unread
    step("Admin signs in again");
    let admin_session = login(&admin, &backend, &store, &config).await?;
    let admin_loop = spawn_loop(&admin_session, stop_rx);
    let unread = admin_session.unread_count(&conversation.id).await;
    println!(
        "  {} unread in {} (has notification: {})",
        unread.to_string().yellow().bold(),
        conversation.id,
        admin_session.has_notification(&conversation.id).await
    );

    step("Admin opens the conversation and replies");
    let mut admin_events = admin_session.subscribe_events();
    admin_session
        .select_conversation(&conversation.id)
        .await
        .map_err(|e| anyhow::anyhow!("Select failed: {}", e))?;
    if let Err(e) = admin_session.send("Bom dia, Maria! Podemos sim, às 15h.").await {
        println!("  {} {}", "✗".red().bold(), e);
    }

    // Let the push echo reach the client
    tokio::time::sleep(Duration::from_millis(200)).await;

    print_messages("Client view", &client_session).await;
    print_messages("Admin view", &admin_session).await;

    println!();
    println!("{}", "Admin events:".bright_white().bold());
    while let Ok(event) = admin_events.try_recv() {
        print_event(&event);
    }

    let _ = stop_tx.send(true);
    let _ = client_loop.await;
    let _ = admin_loop.await;

    client_session
        .logout()
        .await
        .map_err(|e| anyhow::anyhow!("Logout failed: {}", e))?;
    admin_session
        .logout()
        .await
        .map_err(|e| anyhow::anyhow!("Logout failed: {}", e))?;
    println!();
    println!("{} Done", "✓".green().bold());
    Ok(())
}

async fn login(
    viewer: &Viewer,
    backend: &Arc<InMemoryBackend>,
    store: &LocalStore,
    config: &ChatConfig,
) -> anyhow::Result<Session> {
    let session = ChatSession::init(viewer.clone(), backend.clone(), store.clone(), config.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Login of {} failed: {}", viewer.id, e))?;
    Ok(Arc::new(session))
}

fn spawn_loop(session: &Session, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    let session = session.clone();
    tokio::spawn(async move { session.run(shutdown).await })
}

fn step(title: &str) {
    println!();
    println!("{} {}", "▶".bright_blue().bold(), title.bright_white().bold());
}

async fn print_messages(title: &str, session: &Session) {
    println!();
    println!("{}", format!("{}:", title).bright_white().bold());
    for entry in session.messages().await {
        let (marker, id) = match &entry {
            ChatMessage::Confirmed(m) => ("✓".green(), m.id.clone()),
            ChatMessage::Pending(p) if entry.is_failed() => ("✗".red(), p.temp_id.to_string()),
            ChatMessage::Pending(p) => ("…".yellow(), p.temp_id.to_string()),
        };
        println!(
            "  {} [{}] {}: {}",
            marker,
            id.dimmed(),
            entry.sender_id().cyan(),
            entry.content()
        );
    }
}

fn print_event(event: &PortalEvent) {
    match serde_json::to_string(event) {
        Ok(json) => println!("  {}", json.dimmed()),
        Err(e) => println!("  {} {}", "✗".red(), e),
    }
}
