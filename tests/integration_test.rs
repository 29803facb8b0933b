/// Integration tests for the distress monitor
///
/// Drives the full state machine with a scripted speech source, a recording
/// sink and a paused tokio clock, so countdowns and stagger delays elapse
/// deterministically.

use async_trait::async_trait;
use distress_monitor::composer::UNAVAILABLE_LOCATION_LINE;
use distress_monitor::{
    AlertStateMachine, Capabilities, Contact, ContactStore, FixedLocation, InMemoryContactStore,
    JsonContactStore,
    LocationCapability, LocationError, LocationFix, MonitorConfig, MonitorHandle, MonitorNotice,
    MonitorState, NoLocation, NotificationSink, SessionState, SinkError, SourceEvents,
    SpeechError, SpeechErrorKind, SpeechSource,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Default)]
struct ProbeState {
    starts: usize,
    stops: usize,
    running: bool,
    events: Option<SourceEvents>,
    script: VecDeque<Result<(), SpeechError>>,
}

/// Test-side view of the scripted source
#[derive(Clone, Default)]
struct SourceProbe {
    inner: Arc<Mutex<ProbeState>>,
}

impl SourceProbe {
    fn with_script(script: Vec<Result<(), SpeechError>>) -> Self {
        let probe = Self::default();
        probe.inner.lock().script = script.into();
        probe
    }

    fn events(&self) -> SourceEvents {
        self.inner
            .lock()
            .events
            .clone()
            .expect("source was never started")
    }

    fn transcript(&self, text: &str) {
        self.events().transcript(text);
    }

    fn ended(&self) {
        self.events().ended();
    }

    fn error(&self, kind: SpeechErrorKind) {
        self.events().error(kind);
    }

    fn starts(&self) -> usize {
        self.inner.lock().starts
    }

    fn stops(&self) -> usize {
        self.inner.lock().stops
    }
}

/// Speech source whose start results come from a script (Ok once exhausted)
///
/// Like a platform recognizer, starting while already running is accepted
/// but keeps reporting through the original handle.
struct ScriptedSpeechSource {
    probe: SourceProbe,
}

#[async_trait]
impl SpeechSource for ScriptedSpeechSource {
    async fn start(&mut self, events: SourceEvents) -> Result<(), SpeechError> {
        let mut state = self.probe.inner.lock();
        state.starts += 1;

        if let Some(Err(e)) = state.script.pop_front() {
            return Err(e);
        }

        if state.running {
            return Ok(());
        }

        events.started();
        state.events = Some(events);
        state.running = true;
        Ok(())
    }

    async fn stop(&mut self) {
        let mut state = self.probe.inner.lock();
        state.stops += 1;
        state.running = false;
    }
}

struct SentMessage {
    phone: String,
    text: String,
    at: Instant,
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<SentMessage>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, phone: &str, text: &str) -> Result<(), SinkError> {
        self.sent.lock().push(SentMessage {
            phone: phone.to_string(),
            text: text.to_string(),
            at: Instant::now(),
        });
        Ok(())
    }
}

/// Location capability that never answers
struct StalledLocation;

#[async_trait]
impl LocationCapability for StalledLocation {
    async fn request_fix(&self, _timeout: Duration) -> Result<LocationFix, LocationError> {
        std::future::pending().await
    }
}

struct Harness {
    handle: MonitorHandle,
    probe: SourceProbe,
    sink: Arc<RecordingSink>,
    notices: broadcast::Receiver<MonitorNotice>,
    task: JoinHandle<()>,
}

fn contact(id: &str, phone: &str) -> Contact {
    Contact::new(id, format!("Contact {}", id.to_uppercase()), phone).unwrap()
}

fn three_contacts() -> Vec<Contact> {
    vec![
        contact("a", "+91 9572855213"),
        contact("b", "(555) 123-4567"),
        contact("c", "+1 555 987 6543"),
    ]
}

fn googleplex() -> Arc<dyn LocationCapability> {
    Arc::new(FixedLocation::new(LocationFix::new(37.422, -122.084, Some(15.4))))
}

fn start_monitor(
    contacts: Vec<Contact>,
    location: Arc<dyn LocationCapability>,
    script: Vec<Result<(), SpeechError>>,
) -> Harness {
    start_monitor_with_store(Arc::new(InMemoryContactStore::new(contacts)), location, script)
}

fn start_monitor_with_store(
    contacts: Arc<dyn ContactStore>,
    location: Arc<dyn LocationCapability>,
    script: Vec<Result<(), SpeechError>>,
) -> Harness {
    let probe = SourceProbe::with_script(script);
    let sink = Arc::new(RecordingSink::default());

    let config = MonitorConfig {
        user_name: Some("Asha".to_string()),
        notice_capacity: 512,
        ..Default::default()
    };

    let capabilities = Capabilities {
        speech: Box::new(ScriptedSpeechSource {
            probe: probe.clone(),
        }),
        location,
        sink: sink.clone(),
        contacts,
    };

    let (machine, handle) =
        AlertStateMachine::new(config, capabilities).expect("Failed to create monitor");
    let notices = handle.subscribe();
    let task = tokio::spawn(machine.run());

    Harness {
        handle,
        probe,
        sink,
        notices,
        task,
    }
}

impl Harness {
    async fn wait_for_state(&self, state: MonitorState) {
        let mut rx = self.handle.watch_state();
        tokio::time::timeout(Duration::from_secs(300), rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("Timed out waiting for {:?}", state))
            .expect("monitor stopped");
    }

    /// Collect notices up to and including the first one matching `done`
    async fn until<F>(&mut self, done: F) -> Vec<MonitorNotice>
    where
        F: Fn(&MonitorNotice) -> bool,
    {
        let mut seen = Vec::new();
        let collect = async {
            loop {
                let notice = self.notices.recv().await.expect("notice stream failed");
                let finished = done(&notice);
                seen.push(notice);
                if finished {
                    break;
                }
            }
        };

        tokio::time::timeout(Duration::from_secs(300), collect)
            .await
            .expect("Timed out waiting for notice");
        seen
    }

    async fn shutdown(self) {
        self.handle.shutdown();
        self.task.await.expect("monitor task panicked");
    }
}

fn is_detected(notice: &MonitorNotice) -> bool {
    matches!(notice, MonitorNotice::Detected { .. })
}

fn is_closed(notice: &MonitorNotice) -> bool {
    matches!(notice, MonitorNotice::SessionClosed(_))
}

fn closed_session(notices: &[MonitorNotice]) -> distress_monitor::AlertSession {
    notices
        .iter()
        .find_map(|n| match n {
            MonitorNotice::SessionClosed(session) => Some(session.clone()),
            _ => None,
        })
        .expect("no closed session")
}

fn ticks(notices: &[MonitorNotice]) -> Vec<u32> {
    notices
        .iter()
        .filter_map(|n| match n {
            MonitorNotice::Tick { remaining, .. } => Some(*remaining),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_detection_countdown_and_staggered_dispatch() {
    let mut h = start_monitor(three_contacts(), googleplex(), vec![]);
    h.wait_for_state(MonitorState::Listening).await;

    let detected_at = Instant::now();
    h.probe.transcript("Somebody please HELP me");
    let first = h.until(is_detected).await;
    match first.last() {
        Some(MonitorNotice::Detected { event, .. }) => assert_eq!(event.matched_phrase, "help"),
        other => panic!("Expected detection, got {:?}", other),
    }

    // A second match during the countdown must not start another session
    h.probe.transcript("help me, danger");
    let seen = h.until(is_closed).await;

    assert_eq!(seen.iter().filter(|n| is_detected(n)).count(), 0);
    assert_eq!(ticks(&seen), (0..=30).rev().collect::<Vec<u32>>());

    let records: Vec<_> = seen
        .iter()
        .filter_map(|n| match n {
            MonitorNotice::Dispatched { record, .. } => Some(record.clone()),
            _ => None,
        })
        .collect();

    let ids: Vec<&str> = records.iter().map(|r| r.contact_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    let offsets: Vec<u128> = records.iter().map(|r| r.offset.as_millis()).collect();
    assert_eq!(offsets, vec![0, 1000, 2000]);

    let text = &records[0].text;
    assert!(records.iter().all(|r| &r.text == text));
    assert!(text.contains("Asha needs immediate help!"));
    assert!(text.contains("https://maps.google.com/maps?q=37.422000,-122.084000"));
    assert!(text.contains("37.422000, -122.084000"));
    assert!(text.contains("±15m"));

    let session = closed_session(&seen);
    assert_eq!(session.state, SessionState::Resolved);
    assert_eq!(session.recipients_notified, 3);
    assert_eq!(session.matched_phrase, "help");
    assert!(session.message_composed_at.is_some());

    h.wait_for_state(MonitorState::Listening).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    {
        let sent = h.sink.sent.lock();
        assert_eq!(sent.len(), 3);
        let phones: Vec<&str> = sent.iter().map(|m| m.phone.as_str()).collect();
        assert_eq!(phones, vec!["919572855213", "5551234567", "15559876543"]);
        assert_eq!(sent[0].at.duration_since(detected_at), Duration::from_secs(30));
        assert_eq!(sent[2].at.duration_since(sent[0].at), Duration::from_secs(2));
        assert!(sent.iter().all(|m| &m.text == text));
    }

    let stats = h.handle.stats();
    assert_eq!(stats.sessions_started, 1);
    assert_eq!(stats.sessions_resolved, 1);
    assert_eq!(stats.alerts_sent, 3);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_countdown_sends_nothing() {
    let mut h = start_monitor(three_contacts(), googleplex(), vec![]);
    h.wait_for_state(MonitorState::Listening).await;

    h.probe.transcript("this is an emergency");
    h.until(|n| matches!(n, MonitorNotice::Tick { remaining: 10, .. })).await;
    assert_eq!(h.handle.state(), MonitorState::CountdownActive);

    assert!(h.handle.cancel());
    let seen = h.until(is_closed).await;

    let cancelled_at = seen
        .iter()
        .position(|n| matches!(n, MonitorNotice::Cancelled { .. }))
        .expect("no cancellation notice");
    assert!(ticks(&seen[cancelled_at..]).is_empty());

    let session = closed_session(&seen);
    assert_eq!(session.state, SessionState::Cancelled);
    assert!(session.cancelled_at.is_some());
    assert!(session.message_composed_at.is_none());

    h.wait_for_state(MonitorState::Listening).await;

    // Well past the original deadline: still nothing dispatched
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.sink.sent.lock().is_empty());
    assert_eq!(h.handle.stats().sessions_cancelled, 1);
    assert_eq!(h.handle.stats().alerts_sent, 0);

    // The next cycle can trigger again
    h.probe.transcript("danger");
    h.until(is_detected).await;
    assert_eq!(h.handle.stats().sessions_started, 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_completion_is_noop() {
    let mut h = start_monitor(three_contacts(), googleplex(), vec![]);
    h.wait_for_state(MonitorState::Listening).await;

    h.probe.transcript("save me");
    h.until(|n| matches!(n, MonitorNotice::StateChanged(MonitorState::Dispatching)))
        .await;

    h.handle.cancel();
    let seen = h.until(is_closed).await;

    assert!(!seen.iter().any(|n| matches!(n, MonitorNotice::Cancelled { .. })));
    assert_eq!(closed_session(&seen).state, SessionState::Resolved);
    assert_eq!(h.handle.stats().alerts_sent, 3);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_contacts_needs_configuration() {
    let mut h = start_monitor(Vec::new(), googleplex(), vec![]);
    h.wait_for_state(MonitorState::Listening).await;

    h.probe.transcript("help");
    let seen = h.until(is_closed).await;

    assert!(seen
        .iter()
        .any(|n| matches!(n, MonitorNotice::NeedsConfiguration { .. })));
    assert!(!seen.iter().any(|n| matches!(n, MonitorNotice::Dispatched { .. })));
    assert_eq!(closed_session(&seen).state, SessionState::NeedsConfiguration);

    h.wait_for_state(MonitorState::Listening).await;
    assert!(h.sink.sent.lock().is_empty());
    assert_eq!(h.handle.stats().sessions_unconfigured, 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_contacts_are_read_when_countdown_elapses() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonContactStore::new(dir.path().join("contacts.json")));
    let mut h = start_monitor_with_store(store.clone(), googleplex(), vec![]);
    h.wait_for_state(MonitorState::Listening).await;

    h.probe.transcript("help");
    h.until(|n| matches!(n, MonitorNotice::Tick { remaining: 20, .. })).await;

    // Contacts added mid-countdown are the ones notified
    store
        .save(&[contact("x", "+91 9572855213"), contact("y", "(555) 123-4567")])
        .unwrap();

    let seen = h.until(is_closed).await;
    let ids: Vec<String> = seen
        .iter()
        .filter_map(|n| match n {
            MonitorNotice::Dispatched { record, .. } => Some(record.contact_id.clone()),
            _ => None,
        })
        .collect();

    assert_eq!(ids, vec!["x".to_string(), "y".to_string()]);
    assert_eq!(closed_session(&seen).state, SessionState::Resolved);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_location_uses_fallback_text() {
    let mut h = start_monitor(vec![contact("a", "+91 9572855213")], Arc::new(NoLocation), vec![]);
    h.wait_for_state(MonitorState::Listening).await;

    h.probe.transcript("danger");
    let seen = h.until(is_closed).await;

    let record = seen
        .iter()
        .find_map(|n| match n {
            MonitorNotice::Dispatched { record, .. } => Some(record.clone()),
            _ => None,
        })
        .expect("no dispatch");

    assert!(record.text.contains(UNAVAILABLE_LOCATION_LINE));
    assert!(!record.text.contains("Coordinates"));
    assert!(!record.text.contains("Accuracy"));

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stalled_location_is_bounded() {
    let mut h = start_monitor(vec![contact("a", "+91 9572855213")], Arc::new(StalledLocation), vec![]);
    h.wait_for_state(MonitorState::Listening).await;

    let detected_at = Instant::now();
    h.probe.transcript("help");
    let seen = h.until(is_closed).await;

    assert!(seen.iter().any(|n| matches!(
        n,
        MonitorNotice::LocationResolved {
            outcome: distress_monitor::LocationOutcome::Unavailable,
            ..
        }
    )));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let sent = h.sink.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].at.duration_since(detected_at), Duration::from_secs(35));
    drop(sent);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_restarts_once() {
    let mut h = start_monitor(three_contacts(), googleplex(), vec![]);
    h.wait_for_state(MonitorState::Listening).await;
    assert_eq!(h.probe.starts(), 1);

    let failed_at = Instant::now();
    h.probe.error(SpeechErrorKind::Transient);
    h.probe.ended();

    let seen = h.until(|n| matches!(n, MonitorNotice::SourceRestarted { .. })).await;
    assert_eq!(Instant::now().duration_since(failed_at), Duration::from_secs(1));
    assert!(seen.contains(&MonitorNotice::SourceRestarted { attempt: 1 }));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.probe.starts(), 2);
    assert_eq!(h.handle.state(), MonitorState::Listening);

    // The restarted source still detects
    h.probe.transcript("help");
    h.until(is_detected).await;

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_error_without_end_resumes_detection() {
    let mut h = start_monitor(three_contacts(), googleplex(), vec![]);
    h.wait_for_state(MonitorState::Listening).await;

    h.probe.error(SpeechErrorKind::Other);
    h.until(|n| matches!(n, MonitorNotice::SourceRestarted { .. })).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.probe.starts(), 2);
    assert_eq!(h.probe.stops(), 1);
    assert_eq!(h.handle.state(), MonitorState::Listening);

    h.probe.transcript("help");
    h.until(is_detected).await;
    assert_eq!(h.handle.stats().sessions_started, 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_restart_is_retried_until_source_starts() {
    let failure = || Err(SpeechError::Failed("device busy".to_string()));
    let mut h = start_monitor(three_contacts(), googleplex(), vec![Ok(()), failure(), failure()]);
    h.wait_for_state(MonitorState::Listening).await;

    h.probe.error(SpeechErrorKind::Transient);
    h.until(|n| matches!(n, MonitorNotice::SourceRestarted { .. })).await;
    assert_eq!(h.probe.starts(), 4);

    h.probe.transcript("danger");
    h.until(is_detected).await;

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_source_end_restarts_repeatedly() {
    let mut h = start_monitor(three_contacts(), googleplex(), vec![]);
    h.wait_for_state(MonitorState::Listening).await;

    for attempt in 1..=3 {
        h.probe.ended();
        h.until(|n| matches!(n, MonitorNotice::SourceRestarted { .. })).await;
        assert_eq!(h.probe.starts(), attempt + 1);
    }

    assert_eq!(h.handle.stats().source_restarts, 3);
    assert_eq!(h.handle.state(), MonitorState::Listening);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_halts_until_retry() {
    let h = start_monitor(three_contacts(), googleplex(), vec![]);
    h.wait_for_state(MonitorState::Listening).await;

    h.probe.error(SpeechErrorKind::PermissionDenied);
    h.probe.ended();
    h.wait_for_state(MonitorState::PermissionDenied).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.probe.starts(), 1);
    assert!(h.probe.stops() >= 1);
    assert_eq!(h.handle.state(), MonitorState::PermissionDenied);

    // Transcripts are not acted on while halted
    h.probe.transcript("help");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.handle.stats().sessions_started, 0);

    assert!(h.handle.retry());
    h.wait_for_state(MonitorState::Listening).await;
    assert_eq!(h.probe.starts(), 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_initial_permission_denied_then_retry() {
    let h = start_monitor(three_contacts(), googleplex(), vec![Err(SpeechError::PermissionDenied)]);
    h.wait_for_state(MonitorState::PermissionDenied).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.probe.starts(), 1);

    h.handle.retry();
    h.wait_for_state(MonitorState::Listening).await;
    assert_eq!(h.probe.starts(), 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_during_countdown_does_not_retrigger() {
    let mut h = start_monitor(vec![contact("a", "+91 9572855213")], googleplex(), vec![]);
    h.wait_for_state(MonitorState::Listening).await;

    h.probe.transcript("help");
    h.until(is_detected).await;

    h.probe.ended();
    h.until(|n| matches!(n, MonitorNotice::SourceRestarted { .. })).await;
    assert_eq!(h.handle.state(), MonitorState::CountdownActive);

    h.probe.transcript("help me please");
    let seen = h.until(is_closed).await;

    assert_eq!(seen.iter().filter(|n| is_detected(n)).count(), 0);
    assert_eq!(closed_session(&seen).state, SessionState::Resolved);
    assert_eq!(h.handle.stats().sessions_started, 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_permission_lost_during_countdown_finishes_alert() {
    let mut h = start_monitor(vec![contact("a", "+91 9572855213")], googleplex(), vec![]);
    h.wait_for_state(MonitorState::Listening).await;

    h.probe.transcript("help");
    h.until(is_detected).await;

    h.probe.error(SpeechErrorKind::PermissionDenied);
    let seen = h.until(is_closed).await;
    assert_eq!(closed_session(&seen).state, SessionState::Resolved);

    h.wait_for_state(MonitorState::PermissionDenied).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.sink.sent.lock().len(), 1);
    assert_eq!(h.probe.starts(), 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_user_lookup_location() {
    let h = start_monitor(Vec::new(), googleplex(), vec![]);

    let outcome = h.handle.locate().await;
    let fix = outcome.fix().expect("expected a fix");
    assert_eq!(fix.coordinates(), "37.422000, -122.084000");

    h.shutdown().await;
}
