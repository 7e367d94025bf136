//! End-to-end call flows driven through a fake transport.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};

use dehive_calls::{
    CallConfig, CallDirection, CallFailure, CallManager, CallSession, CallStatus, MediaHooks,
    Transport, TransportError, TransportEvent, TransportFactory, UserId,
};

struct FakeTransport {
    sent_tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.sent_tx
            .send(text.to_string())
            .map_err(|_| TransportError::Closed)
    }

    async fn disconnect(&self) {}
}

/// Endpoint handles for one dialed fake connection.
struct FakeEndpoint {
    inject: mpsc::Sender<TransportEvent>,
    sent: mpsc::UnboundedReceiver<String>,
}

#[derive(Default)]
struct FakeFactory {
    refuse_dials: AtomicBool,
    endpoints: Mutex<HashMap<String, FakeEndpoint>>,
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn dial(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError> {
        if self.refuse_dials.load(Ordering::SeqCst) {
            return Err(TransportError::WebSocket("dial refused".into()));
        }
        let (inject, events_rx) = mpsc::channel(100);
        inject.send(TransportEvent::Connected).await.unwrap();
        let (sent_tx, sent) = mpsc::unbounded_channel();
        self.endpoints
            .lock()
            .await
            .insert(url.to_string(), FakeEndpoint { inject, sent });
        Ok((Arc::new(FakeTransport { sent_tx }), events_rx))
    }
}

#[derive(Default)]
struct CountingMedia {
    releases: AtomicUsize,
}

#[async_trait]
impl MediaHooks for CountingMedia {
    async fn acquire_local_stream(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn bind_remote_stream(&self, _session: &CallSession) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

const SIGNALING_URL: &str = "ws://test/call";
const PRESENCE_URL: &str = "ws://test/presence";

struct Harness {
    manager: Arc<CallManager>,
    factory: Arc<FakeFactory>,
    media: Arc<CountingMedia>,
    session_rx: watch::Receiver<CallSession>,
    signaling: FakeEndpoint,
    presence: FakeEndpoint,
}

fn test_config() -> CallConfig {
    CallConfig {
        signaling_url: SIGNALING_URL.to_string(),
        presence_url: PRESENCE_URL.to_string(),
        ring_timeout: Duration::from_secs(30),
        send_timeout: Duration::from_secs(1),
        disconnect_grace: Duration::from_secs(10),
        reconnect_max_backoff: Duration::from_secs(30),
    }
}

async fn connect_harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let factory = Arc::new(FakeFactory::default());
    let media = Arc::new(CountingMedia::default());
    let manager = CallManager::new(
        test_config(),
        factory.clone(),
        media.clone(),
        UserId::from("user-a"),
    );
    manager.connect().await.unwrap();

    let signaling = take_endpoint(&factory, SIGNALING_URL).await;
    let presence = take_endpoint(&factory, PRESENCE_URL).await;
    let session_rx = manager.subscribe();

    Harness {
        manager,
        factory,
        media,
        session_rx,
        signaling,
        presence,
    }
}

async fn take_endpoint(factory: &Arc<FakeFactory>, url: &str) -> FakeEndpoint {
    for _ in 0..200 {
        if let Some(endpoint) = factory.endpoints.lock().await.remove(url) {
            return endpoint;
        }
        tokio::task::yield_now().await;
    }
    panic!("endpoint {url} was never dialed");
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

async fn inject(endpoint: &FakeEndpoint, json: &str) {
    endpoint
        .inject
        .send(TransportEvent::MessageReceived(json.to_string()))
        .await
        .unwrap();
}

async fn next_sent(endpoint: &mut FakeEndpoint) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(600), endpoint.sent.recv())
        .await
        .expect("no intent emitted")
        .expect("sender closed");
    serde_json::from_str(&text).unwrap()
}

fn assert_nothing_sent(endpoint: &mut FakeEndpoint) {
    if let Ok(text) = endpoint.sent.try_recv() {
        panic!("unexpected intent on the wire: {text}");
    }
}

async fn wait_for(
    rx: &mut watch::Receiver<CallSession>,
    what: &str,
    predicate: impl Fn(&CallSession) -> bool,
) -> CallSession {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            {
                let session = rx.borrow();
                if predicate(&session) {
                    return session.clone();
                }
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session never reached: {what}"))
}

async fn wait_status(rx: &mut watch::Receiver<CallSession>, status: CallStatus) -> CallSession {
    wait_for(rx, &format!("{status:?}"), |s| s.status == status).await
}

#[tokio::test(start_paused = true)]
async fn accept_while_idle_is_a_noop() {
    let mut h = connect_harness().await;

    h.manager.accept_call().await.unwrap();
    settle().await;

    let session = h.manager.current_session();
    assert_eq!(session.status, CallStatus::Idle);
    assert!(session.call_id.is_none());
    assert_nothing_sent(&mut h.signaling);
}

#[tokio::test(start_paused = true)]
async fn outgoing_round_trip_ends_idle() {
    let mut h = connect_harness().await;

    h.manager.start_call(UserId::from("user-b")).await.unwrap();

    let intent = next_sent(&mut h.signaling).await;
    assert_eq!(intent["event"], "startCall");
    assert_eq!(intent["data"]["targetUserId"], "user-b");

    let session = h.manager.current_session();
    assert_eq!(session.status, CallStatus::Ringing);
    assert_eq!(session.direction, Some(CallDirection::Outgoing));
    assert!(session.call_id.is_none(), "pre-confirmation window");

    inject(
        &h.signaling,
        r#"{"event":"callAccepted","data":{"callId":"abc123"}}"#,
    )
    .await;
    let session = wait_status(&mut h.session_rx, CallStatus::Connected).await;
    assert_eq!(session.call_id.as_ref().map(|id| id.as_str()), Some("abc123"));

    h.manager.end_call().await.unwrap();
    let intent = next_sent(&mut h.signaling).await;
    assert_eq!(intent["event"], "endCall");
    assert_eq!(intent["data"]["callId"], "abc123");
    // Ack-gated: still connected until the server confirms.
    assert_eq!(h.manager.current_session().status, CallStatus::Connected);

    inject(
        &h.signaling,
        r#"{"event":"callEnded","data":{"callId":"abc123","reason":"hangup"}}"#,
    )
    .await;
    wait_status(&mut h.session_rx, CallStatus::Ended).await;
    assert_eq!(h.media.releases.load(Ordering::SeqCst), 1);

    h.manager.reset();
    let session = h.manager.current_session();
    assert_eq!(session.status, CallStatus::Idle);
    assert!(session.call_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn incoming_decline_is_ack_gated() {
    let mut h = connect_harness().await;

    inject(
        &h.signaling,
        r#"{"event":"incomingCall","data":{"callId":"abc123","callerId":"user-b"}}"#,
    )
    .await;
    let session = wait_status(&mut h.session_rx, CallStatus::Ringing).await;
    assert_eq!(session.direction, Some(CallDirection::Incoming));
    assert_eq!(session.caller_id, Some(UserId::from("user-b")));

    h.manager.decline_call().await.unwrap();
    let intent = next_sent(&mut h.signaling).await;
    assert_eq!(intent["event"], "declineCall");
    assert_eq!(intent["data"]["callId"], "abc123");
    // Still ringing until the server confirms the decline.
    assert_eq!(h.manager.current_session().status, CallStatus::Ringing);

    inject(
        &h.signaling,
        r#"{"event":"callDeclined","data":{"callId":"abc123"}}"#,
    )
    .await;
    wait_status(&mut h.session_rx, CallStatus::Declined).await;
    assert_eq!(h.media.releases.load(Ordering::SeqCst), 1);

    h.manager.reset();
    assert_eq!(h.manager.current_session().status, CallStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out() {
    let mut h = connect_harness().await;

    h.manager.start_call(UserId::from("user-b")).await.unwrap();
    let intent = next_sent(&mut h.signaling).await;
    assert_eq!(intent["event"], "startCall");

    let session = wait_status(&mut h.session_rx, CallStatus::Timeout).await;
    assert_eq!(session.error, Some(CallFailure::Timeout));
    // No call id was ever assigned, so there is no remote ring to cancel.
    assert_nothing_sent(&mut h.signaling);

    // A timed-out session rejects further answering attempts.
    h.manager.accept_call().await.unwrap();
    settle().await;
    assert_eq!(h.manager.current_session().status, CallStatus::Timeout);
    assert_nothing_sent(&mut h.signaling);
}

#[tokio::test(start_paused = true)]
async fn late_decline_overrides_local_timeout() {
    let mut h = connect_harness().await;

    h.manager.start_call(UserId::from("user-b")).await.unwrap();
    let _ = next_sent(&mut h.signaling).await;
    wait_status(&mut h.session_rx, CallStatus::Timeout).await;

    // The authoritative terminal event still applies after the local
    // timeout already fired: last event wins, deterministically.
    inject(
        &h.signaling,
        r#"{"event":"callDeclined","data":{"callId":"late1"}}"#,
    )
    .await;
    let session = wait_status(&mut h.session_rx, CallStatus::Declined).await;
    assert_eq!(session.call_id.as_ref().map(|id| id.as_str()), Some("late1"));
}

#[tokio::test(start_paused = true)]
async fn a_new_ring_timer_supersedes_the_old_one() {
    let mut h = connect_harness().await;

    // First call, declined a third of the way into its ring window.
    h.manager.start_call(UserId::from("user-b")).await.unwrap();
    let _ = next_sent(&mut h.signaling).await;
    tokio::time::advance(Duration::from_secs(10)).await;
    inject(
        &h.signaling,
        r#"{"event":"callDeclined","data":{"callId":"c1"}}"#,
    )
    .await;
    wait_status(&mut h.session_rx, CallStatus::Declined).await;

    // Second call armed at t=10s; its window runs until t=40s.
    h.manager.start_call(UserId::from("user-c")).await.unwrap();
    let _ = next_sent(&mut h.signaling).await;

    // t=35s: past the first call's deadline. Only the second timer is
    // live, so nothing fires yet.
    tokio::time::advance(Duration::from_secs(25)).await;
    settle().await;
    assert_eq!(h.manager.current_session().status, CallStatus::Ringing);

    // t=45s: past the second call's deadline.
    tokio::time::advance(Duration::from_secs(10)).await;
    wait_status(&mut h.session_rx, CallStatus::Timeout).await;
}

#[tokio::test(start_paused = true)]
async fn peer_going_offline_is_advisory_only() {
    let mut h = connect_harness().await;

    inject(
        &h.signaling,
        r#"{"event":"incomingCall","data":{"callId":"abc123","callerId":"user-b"}}"#,
    )
    .await;
    wait_status(&mut h.session_rx, CallStatus::Ringing).await;

    inject(
        &h.presence,
        r#"{"event":"userStatusChanged","data":{"userId":"user-b","status":"offline"}}"#,
    )
    .await;
    let session = wait_for(&mut h.session_rx, "peer offline annotation", |s| {
        s.peer_online == Some(false)
    })
    .await;
    // Presence never terminates a session.
    assert_eq!(session.status, CallStatus::Ringing);

    let record = h.manager.presence_of(&UserId::from("user-b")).unwrap();
    assert!(!record.online);
}

#[tokio::test(start_paused = true)]
async fn connection_lost_beyond_grace_ends_the_call() {
    let mut h = connect_harness().await;

    h.manager.start_call(UserId::from("user-b")).await.unwrap();
    let _ = next_sent(&mut h.signaling).await;
    inject(
        &h.signaling,
        r#"{"event":"callAccepted","data":{"callId":"abc123"}}"#,
    )
    .await;
    wait_status(&mut h.session_rx, CallStatus::Connected).await;

    // Drop the signaling connection and refuse every reconnect attempt.
    h.factory.refuse_dials.store(true, Ordering::SeqCst);
    h.signaling
        .inject
        .send(TransportEvent::Disconnected)
        .await
        .unwrap();

    let session = wait_status(&mut h.session_rx, CallStatus::Ended).await;
    assert_eq!(session.error, Some(CallFailure::ConnectionLost));
    assert_eq!(h.media.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn incoming_call_while_busy_is_ignored() {
    let mut h = connect_harness().await;

    h.manager.start_call(UserId::from("user-b")).await.unwrap();
    let _ = next_sent(&mut h.signaling).await;

    inject(
        &h.signaling,
        r#"{"event":"incomingCall","data":{"callId":"other9","callerId":"user-c"}}"#,
    )
    .await;
    settle().await;

    let session = h.manager.current_session();
    assert_eq!(session.status, CallStatus::Ringing);
    assert_eq!(session.direction, Some(CallDirection::Outgoing));
    assert_eq!(session.callee_id, Some(UserId::from("user-b")));
}

#[tokio::test(start_paused = true)]
async fn start_call_while_active_is_a_noop() {
    let mut h = connect_harness().await;

    h.manager.start_call(UserId::from("user-b")).await.unwrap();
    let _ = next_sent(&mut h.signaling).await;

    h.manager.start_call(UserId::from("user-c")).await.unwrap();
    settle().await;
    assert_nothing_sent(&mut h.signaling);
    assert_eq!(
        h.manager.current_session().callee_id,
        Some(UserId::from("user-b"))
    );
}

#[tokio::test(start_paused = true)]
async fn server_error_is_recorded_not_terminal() {
    let mut h = connect_harness().await;

    inject(
        &h.signaling,
        r#"{"event":"incomingCall","data":{"callId":"abc123","callerId":"user-b"}}"#,
    )
    .await;
    wait_status(&mut h.session_rx, CallStatus::Ringing).await;

    inject(
        &h.signaling,
        r#"{"event":"error","data":{"message":"user busy","code":"BUSY"}}"#,
    )
    .await;
    let session = wait_for(&mut h.session_rx, "recorded failure", |s| s.error.is_some()).await;
    assert_eq!(session.status, CallStatus::Ringing);
    assert_eq!(
        session.error,
        Some(CallFailure::RemoteRejected {
            message: "user busy".into(),
            code: Some("BUSY".into()),
        })
    );

    h.manager.clear_error();
    assert!(h.manager.current_session().error.is_none());
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_killing_dispatch() {
    let mut h = connect_harness().await;

    inject(&h.signaling, "not json at all").await;
    inject(&h.signaling, r#"{"event":"fileUploaded","data":{}}"#).await;

    // The dispatcher is still alive and processes the next valid event.
    inject(
        &h.signaling,
        r#"{"event":"incomingCall","data":{"callId":"abc123","callerId":"user-b"}}"#,
    )
    .await;
    wait_status(&mut h.session_rx, CallStatus::Ringing).await;
}

#[tokio::test(start_paused = true)]
async fn identity_confirmed_updates_caller_identity() {
    let mut h = connect_harness().await;

    inject(
        &h.presence,
        r#"{"event":"identityConfirmed","data":{"userDehiveId":"user-a1","status":"online"}}"#,
    )
    .await;
    settle().await;

    h.manager.start_call(UserId::from("user-b")).await.unwrap();
    let _ = next_sent(&mut h.signaling).await;
    assert_eq!(
        h.manager.current_session().caller_id,
        Some(UserId::from("user-a1"))
    );
}
