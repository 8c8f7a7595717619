//! Greenroom CLI Application

use anyhow::Result;
use clap::{Parser, Subcommand};
use greenroom_core::personal_room_id;
use greenroom_core::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Account key used to derive the personal room id
    #[arg(short, long, env = "GREENROOM_ACCOUNT", default_value = "demo@greenroom.local")]
    account: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a loopback interview room: one host, N guests, a scripted
    /// interviewer, and a recording export at the end
    Demo {
        /// Number of guests to join
        #[arg(long, default_value = "2")]
        guests: usize,

        /// Number of AI interviewer turns to run
        #[arg(long, default_value = "3")]
        turns: usize,

        /// Where the recording and transcript land
        #[arg(long, default_value = ".")]
        output: PathBuf,
    },

    /// Print the personal room id for the account
    RoomId,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "greenroom=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            guests,
            turns,
            output,
        } => {
            run_demo(&cli.account, guests, turns, &output).await?;
        }
        Commands::RoomId => {
            println!("{}", personal_room_id(&cli.account));
        }
    }

    Ok(())
}

async fn run_demo(account: &str, guests: usize, turns: usize, output: &PathBuf) -> Result<()> {
    let hub = Arc::new(MemoryRendezvous::new());
    let devices = SyntheticDevices::new(320, 180);

    let resolver = RoleResolver::new(MemorySessionStore::new());
    let entry = resolver.resolve(None, account);
    let room_id = entry.room_id.clone();
    println!("🎬 Opening room {room_id} as host");

    let brain = Arc::new(ScriptedBrain::new(vec![
        "Tell me about a project you are proud of.".to_string(),
        "What trade-offs did you weigh in its design?".to_string(),
        "How did you verify it behaved under failure?".to_string(),
        "What would you do differently today?".to_string(),
    ]));
    let host = HostSession::open(entry, &devices, hub.clone(), brain, RoomConfig::default()).await?;

    let mut guest_sessions = Vec::new();
    for i in 0..guests {
        let guest_resolver = RoleResolver::new(MemorySessionStore::new());
        let guest_entry = guest_resolver.resolve(Some(&room_id), &format!("guest-{i}@demo"));
        let guest = GuestSession::open(guest_entry, &devices, hub.clone(), RoomConfig::default())
            .await?;
        guest_sessions.push(guest);
    }
    println!("👥 {guests} guest(s) joining");

    // Let links, calls, and the first composite frames settle.
    tokio::time::sleep(Duration::from_millis(500)).await;
    for (i, guest) in guest_sessions.iter().enumerate() {
        let linked = if guest.is_linked() { "linked" } else { "not linked" };
        let view = if guest.remote_view().is_some() {
            "receiving composite"
        } else {
            "no stream yet"
        };
        println!("   guest {i}: {linked}, {view}");
    }

    host.set_step(SessionStep::Interview);
    host.start_recording()?;
    host.append_chat(ChatEntry::interviewer("Welcome, let's get started."));

    let answers = [
        "I built a live video compositor in Rust.",
        "I chose in-place track swaps over renegotiation.",
        "Partial-failure tests over an in-memory rendezvous.",
        "I would bound the queue depths earlier.",
    ];
    for turn in 0..turns {
        let utterance = answers[turn % answers.len()];
        let reply = host.ai_turn(utterance, None).await?;
        println!("🗣  candidate: {utterance}");
        println!("🤖 interviewer: {}", reply.response);
        if let Some(guest) = guest_sessions.first() {
            guest.send_reaction("👍").ok();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    host.set_step(SessionStep::Feedback);
    let paths = host
        .stop_recording_and_export(output)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no recording artifact produced"))?;
    println!("💾 media:      {}", paths.media.display());
    println!("📄 transcript: {}", paths.transcript.display());

    for guest in &guest_sessions {
        guest.leave().await;
    }
    host.leave().await;
    println!("✅ demo complete: {} conversation entries", host.conversation().len());
    Ok(())
}
