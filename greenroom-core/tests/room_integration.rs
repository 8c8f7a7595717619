//! End-to-end room scenarios over the in-memory rendezvous

use greenroom_core::prelude::*;
use greenroom_core::{
    CallConfig, CompositorConfig, InterviewProfile, MonitorConfig, RecorderConfig, ScriptedBrain,
    TransportConfig, VideoFrame,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

fn fast_config(name: &str) -> RoomConfig {
    RoomConfig {
        transport: TransportConfig {
            open_attempts: 3,
            backoff_base: Duration::from_millis(1),
        },
        call: CallConfig {
            composite_poll: Duration::from_millis(10),
            composite_timeout: Duration::from_secs(2),
            heartbeat: Duration::from_millis(40),
        },
        compositor: CompositorConfig {
            width: 160,
            height: 90,
            tick: Duration::from_millis(15),
            sidebar_width: 40,
            label_height: 8,
            reaction_ttl: Duration::from_millis(300),
        },
        recorder: RecorderConfig {
            sample_interval: Duration::from_millis(10),
            ..RecorderConfig::default()
        },
        monitor: MonitorConfig {
            cadence: Duration::from_millis(20),
            ..MonitorConfig::default()
        },
        profile: InterviewProfile::default(),
        display_name: name.to_string(),
    }
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn brain() -> Arc<ScriptedBrain> {
    Arc::new(ScriptedBrain::new(vec![
        "Tell me about a project you are proud of.".to_string(),
        "What was the hardest bug you chased down?".to_string(),
    ]))
}

struct Party {
    hub: Arc<MemoryRendezvous>,
    host_entry: RoomEntry,
}

fn party() -> Party {
    init_tracing();
    let resolver = RoleResolver::new(MemorySessionStore::new());
    let host_entry = resolver.resolve(None, "host@example.com");
    Party {
        hub: Arc::new(MemoryRendezvous::new()),
        host_entry,
    }
}

fn guest_entry(host_entry: &RoomEntry, account: &str) -> RoomEntry {
    let resolver = RoleResolver::new(MemorySessionStore::new());
    let entry = resolver.resolve(Some(&host_entry.room_id), account);
    assert_eq!(entry.role, Role::Guest);
    entry
}

async fn open_host(party: &Party) -> HostSession<MemoryRendezvous> {
    HostSession::open(
        party.host_entry.clone(),
        &SyntheticDevices::new(64, 36),
        party.hub.clone(),
        brain(),
        fast_config("HOST"),
    )
    .await
    .expect("host open")
}

async fn open_guest(party: &Party, account: &str) -> GuestSession<MemoryRendezvous> {
    GuestSession::open(
        guest_entry(&party.host_entry, account),
        &SyntheticDevices::new(64, 36),
        party.hub.clone(),
        fast_config("GUEST"),
    )
    .await
    .expect("guest open")
}

async fn wait_joined(guest: &GuestSession<MemoryRendezvous>) {
    assert!(
        wait_until(Duration::from_secs(3), || {
            guest.is_linked() && guest.remote_view().is_some()
        })
        .await,
        "guest never reached the host"
    );
}

#[tokio::test]
async fn host_chat_reaches_guest_within_round_trip() {
    let party = party();
    let host = open_host(&party).await;
    let guest = open_guest(&party, "guest@example.com").await;
    wait_joined(&guest).await;

    host.append_chat(ChatEntry::interviewer("Hello"));

    assert!(wait_until(Duration::from_secs(2), || guest.conversation().len() == 1).await);
    let conversation = guest.conversation();
    assert_eq!(conversation[0].speaker, SpeakerRole::Interviewer);
    assert_eq!(conversation[0].text, "Hello");

    guest.leave().await;
    host.leave().await;
}

#[tokio::test]
async fn mid_session_joiner_syncs_to_host_state() {
    let party = party();
    let host = open_host(&party).await;
    host.append_chat(ChatEntry::interviewer("Welcome."));
    host.append_chat(ChatEntry::candidate("Thanks, glad to be here."));
    host.set_step(SessionStep::Interview);

    let guest = open_guest(&party, "late@example.com").await;
    wait_joined(&guest).await;

    assert!(wait_until(Duration::from_secs(2), || guest.conversation().len() == 2).await);
    assert_eq!(guest.conversation(), host.conversation());
    assert_eq!(guest.step(), SessionStep::Interview);

    // A duplicate snapshot is a no-op.
    host.set_step(SessionStep::Interview);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(guest.conversation(), host.conversation());
    assert_eq!(guest.conversation().len(), 2);

    guest.leave().await;
    host.leave().await;
}

#[tokio::test]
async fn guest_chat_is_star_relayed_to_other_guests() {
    let party = party();
    let host = open_host(&party).await;
    let guest_a = open_guest(&party, "a@example.com").await;
    let guest_b = open_guest(&party, "b@example.com").await;
    wait_joined(&guest_a).await;
    wait_joined(&guest_b).await;

    guest_a.send_chat("Hello from A").expect("send");

    assert!(wait_until(Duration::from_secs(2), || host.conversation().len() == 1).await);
    assert!(wait_until(Duration::from_secs(2), || guest_b.conversation().len() == 1).await);
    assert_eq!(guest_b.conversation()[0].text, "Hello from A");
    // The sender keeps exactly one local copy; the relay skips it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(guest_a.conversation().len(), 1);

    guest_a.leave().await;
    guest_b.leave().await;
    host.leave().await;
}

#[tokio::test]
async fn guests_refuse_inbound_calls_from_anyone() {
    let party = party();
    let host = open_host(&party).await;
    let guest = open_guest(&party, "g@example.com").await;
    wait_joined(&guest).await;

    // A rogue endpoint dials the guest directly, violating the star.
    let rogue = party.hub.open(None).await.expect("rogue open");
    let stream = SyntheticDevices::new(16, 9).open_camera().await.expect("camera");
    let outbound = rogue
        .call(&guest.identity().local_peer, stream, CallKind::Camera)
        .await
        .expect("call placed");
    let answer = outbound.answered().await;
    assert!(answer.is_err(), "guest must reject inbound calls");

    guest.leave().await;
    host.leave().await;
}

#[tokio::test]
async fn guest_sees_live_composite_frames() {
    let party = party();
    let host = open_host(&party).await;
    let guest = open_guest(&party, "g@example.com").await;
    wait_joined(&guest).await;

    let black = VideoFrame::black(160, 90);
    let saw_render = wait_until(Duration::from_secs(3), || {
        guest
            .remote_view()
            .and_then(|s| s.video().map(|v| v.current_frame()))
            .is_some_and(|f| f != black)
    })
    .await;
    assert!(saw_render, "composite frames never reached the guest");

    // The answered stream carries exactly one merged host audio sender.
    let view = guest.remote_view().expect("remote view");
    assert_eq!(view.audio().len(), 1);

    guest.leave().await;
    host.leave().await;
}

#[tokio::test]
async fn screen_share_race_leaves_exactly_one_sharer() {
    let party = party();
    let host = open_host(&party).await;
    let guest = open_guest(&party, "g@example.com").await;
    wait_joined(&guest).await;

    let devices = SyntheticDevices::new(64, 36);
    guest.start_screen_share(&devices).await.expect("guest share");
    assert!(guest.is_screen_sharing());

    host.start_screen_share(&devices).await.expect("host share");

    // One protocol round trip later the guest's share is gone.
    assert!(
        wait_until(Duration::from_secs(2), || !guest.is_screen_sharing()).await,
        "guest share should be preempted"
    );
    assert!(host.is_screen_sharing());

    guest.leave().await;
    host.leave().await;
}

#[tokio::test]
async fn track_swaps_never_drop_the_audio_sender() {
    let party = party();
    let host = open_host(&party).await;
    let guest = open_guest(&party, "g@example.com").await;
    wait_joined(&guest).await;

    let audio_count =
        || guest.remote_view().map(|v| v.audio().len()).unwrap_or_default();
    assert_eq!(audio_count(), 1);

    // Share start and stop both swap the broadcast source.
    let devices = SyntheticDevices::new(64, 36);
    host.start_screen_share(&devices).await.expect("share");
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(audio_count(), 1);

    host.stop_screen_share();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(audio_count(), 1);

    guest.leave().await;
    host.leave().await;
}

#[tokio::test]
async fn ai_turn_appends_both_sides_and_replicates() {
    let party = party();
    let host = open_host(&party).await;
    let guest = open_guest(&party, "g@example.com").await;
    wait_joined(&guest).await;

    let turn = host
        .ai_turn("I shipped a real-time compositor.", None)
        .await
        .expect("ai turn");
    assert!(!turn.response.is_empty());

    assert!(wait_until(Duration::from_secs(2), || guest.conversation().len() == 2).await);
    let conversation = guest.conversation();
    assert_eq!(conversation[0].speaker, SpeakerRole::Candidate);
    assert_eq!(conversation[1].speaker, SpeakerRole::Interviewer);
    assert_eq!(conversation[1].text, turn.response);

    guest.leave().await;
    host.leave().await;
}

#[tokio::test]
async fn graceful_leave_prunes_host_state_immediately() {
    let party = party();
    let host = open_host(&party).await;
    let guest = open_guest(&party, "g@example.com").await;
    wait_joined(&guest).await;
    assert!(wait_until(Duration::from_secs(2), || !host.peers().is_empty()).await);

    guest.leave().await;

    assert!(
        wait_until(Duration::from_secs(2), || host.peers().is_empty()).await,
        "host should prune the departed guest"
    );

    host.leave().await;
}

#[tokio::test]
async fn guest_heartbeat_joins_once_host_appears() {
    let party = party();
    // The guest arrives first; nobody owns the room address yet.
    let guest = open_guest(&party, "early@example.com").await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(!guest.is_linked());

    let host = open_host(&party).await;
    wait_joined(&guest).await;

    assert!(wait_until(Duration::from_secs(2), || !host.peers().is_empty()).await);

    guest.leave().await;
    host.leave().await;
}

#[tokio::test]
async fn emoji_reactions_are_attributed_to_their_sender() {
    let party = party();
    let host = open_host(&party).await;
    let guest = open_guest(&party, "g@example.com").await;
    wait_joined(&guest).await;

    let mut host_events = host.events();
    guest.send_reaction("🎉").expect("reaction");

    let guest_peer = guest.identity().local_peer.clone();
    let attributed = wait_until(Duration::from_secs(2), || {
        while let Ok(event) = host_events.try_recv() {
            if let RoomEvent::Reaction { sender, emoji } = event {
                return sender == guest_peer.as_str() && emoji == "🎉";
            }
        }
        false
    })
    .await;
    assert!(attributed, "reaction should carry the guest's peer id");

    guest.leave().await;
    host.leave().await;
}
