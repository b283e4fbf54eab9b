use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use client_core::{ChatSession, RuntimeContext, SyncSettings};
use shared::domain::{ParticipantRole, UserId};
use shared::model::ParticipantProfile;
use storage::{ChatStore, MemoryStore};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "acme")]
    tenant: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scripted coach/client exchange against the in-memory store and
    /// print the live snapshots as they settle.
    Simulate {
        #[arg(long, default_value = "ana")]
        coach: String,
        #[arg(long, default_value = "ben")]
        client: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate { coach, client } => simulate(&cli.tenant, &coach, &client).await,
    }
}

async fn simulate(tenant: &str, coach: &str, client: &str) -> Result<()> {
    let store: Arc<dyn ChatStore> = Arc::new(MemoryStore::new());
    let context = RuntimeContext::default().with_session_tenant(tenant);
    let settings = SyncSettings::default();

    let coach_session = ChatSession::connect(
        Arc::clone(&store),
        &context,
        UserId::from(coach),
        settings.clone(),
    )
    .await?;
    let client_session = ChatSession::connect(
        Arc::clone(&store),
        &context,
        UserId::from(client),
        settings.clone(),
    )
    .await?;

    let coach_presence = coach_session.start_presence().await?;
    let client_presence = client_session.start_presence().await?;

    let conversation_id = coach_session
        .mutations()
        .create_direct_conversation(
            client_session.user_id(),
            ParticipantProfile {
                name: coach.to_string(),
                photo_url: None,
                role: ParticipantRole::Coach,
            },
            ParticipantProfile {
                name: client.to_string(),
                photo_url: None,
                role: ParticipantRole::Client,
            },
        )
        .await?;
    println!("conversation created: {conversation_id}");

    let client_list = client_session.subscribe_chat_list().await?;
    let coach_stream = coach_session.open_conversation(&conversation_id).await?;
    let client_stream = client_session.open_conversation(&conversation_id).await?;

    coach_presence.set_typing(&conversation_id, true);
    coach_session
        .mutations()
        .send_text(&conversation_id, "Welcome aboard! First session tomorrow?", None)
        .await?;
    coach_presence.set_typing(&conversation_id, false);
    client_session
        .mutations()
        .send_text(&conversation_id, "Sounds great, see you at 9.", None)
        .await?;
    settle().await;

    let list = client_list.snapshot();
    println!(
        "client chat list: {} conversation(s), {} unread",
        list.conversations.len(),
        list.unread_total
    );
    for view in client_stream.snapshot().messages {
        println!(
            "  [{}] {} ({:?})",
            view.message.sender_id,
            view.message.preview(),
            view.delivery
        );
    }

    let receipted = client_session
        .mutations()
        .mark_read(&conversation_id, Utc::now())
        .await?;
    settle().await;
    println!(
        "client marked {receipted} message(s) read, unread now {}",
        client_list.snapshot().unread_total
    );

    client_session
        .mutations()
        .toggle_archive(&conversation_id)
        .await?;
    settle().await;
    let list = client_list.snapshot();
    println!(
        "client archived the thread: active={} archived={}",
        list.active().len(),
        list.archived().len()
    );

    let roster = client_presence.roster();
    println!(
        "coach online: {}",
        roster.is_online(coach_session.user_id(), Utc::now(), settings.presence_ttl)
    );

    coach_stream.close();
    client_stream.close();
    client_list.dispose();
    coach_presence.dispose();
    client_presence.dispose();
    settle().await;
    Ok(())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
