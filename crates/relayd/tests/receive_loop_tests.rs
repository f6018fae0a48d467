//! Integration tests for the per-account receive loop.
//!
//! A scripted in-memory session stands in for the remote protocol: each
//! receive call pops the next step of the script, optionally delivering
//! events to the handler first.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_core::{
    AccountId, Address, ContactInfo, DecodeError, Envelope, EventHandler, InboundEvent,
    ReceiveError, Session, SessionFactory, SetupError, SharedSession, DEFAULT_RECEIVE_TIMEOUT,
};
use relayd::broadcast::{Broadcaster, ClientHandle, Frame, CLIENT_QUEUE_CAPACITY};
use relayd::receiver::{AccountReceiveLoop, LoopContext, LoopExit, RetryPolicy};
use relayd::registry::SessionRegistry;
use relayd::supervisor::Supervisor;
use tokio::sync::mpsc;

// ============================================================================
// Scripted Session
// ============================================================================

/// One scripted receive call.
enum Step {
    /// Deliver these events, then return the result
    Deliver(Vec<InboundEvent>, Result<(), ReceiveError>),
    /// Return the result without delivering anything
    Return(Result<(), ReceiveError>),
    /// Make the account's local state appear, then return `Ok`
    Link,
}

fn ok() -> Step {
    Step::Return(Ok(()))
}

fn io_error() -> Step {
    Step::Return(Err(ReceiveError::Io("connection reset".into())))
}

fn unauthorized() -> Step {
    Step::Return(Err(ReceiveError::Authorization("401".into())))
}

struct ScriptedSession {
    account: AccountId,
    exists: AtomicBool,
    contacts: Vec<ContactInfo>,
    /// Returned by every `initialize` call when set
    init_error: Option<SetupError>,
    init_calls: AtomicUsize,
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    /// Timeout passed to each receive call
    timeouts: Mutex<Vec<Duration>>,
    /// Whether the registry held this account at the start of each call
    registered_during_calls: Mutex<Vec<bool>>,
    registry: Arc<SessionRegistry>,
}

impl ScriptedSession {
    fn new(
        account: &str,
        exists: bool,
        registry: &Arc<SessionRegistry>,
        script: Vec<Step>,
    ) -> Arc<Self> {
        Arc::new(Self {
            account: AccountId::new(account),
            exists: AtomicBool::new(exists),
            contacts: Vec::new(),
            init_error: None,
            init_calls: AtomicUsize::new(0),
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            timeouts: Mutex::new(Vec::new()),
            registered_during_calls: Mutex::new(Vec::new()),
            registry: Arc::clone(registry),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Session for ScriptedSession {
    fn exists(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }

    fn initialize(&self) -> Result<(), SetupError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        match &self.init_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn get_contact(&self, address: &str) -> Option<ContactInfo> {
        self.contacts.iter().find(|c| c.matches(address)).cloned()
    }

    fn receive_blocking(
        &self,
        timeout: Duration,
        return_on_timeout: bool,
        _skip_attachments: bool,
        handler: &mut dyn EventHandler,
    ) -> Result<(), ReceiveError> {
        assert!(return_on_timeout, "the loop must ask to return on timeout");
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.timeouts.lock().unwrap().push(timeout);
        self.registered_during_calls
            .lock()
            .unwrap()
            .push(self.registry.contains(&self.account));

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Deliver(events, result)) => {
                for event in events {
                    handler.handle_event(event);
                }
                result
            }
            Some(Step::Return(result)) => result,
            Some(Step::Link) => {
                self.exists.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ReceiveError::Other("script exhausted".into())),
        }
    }
}

/// Hands out one prepared session.
struct ScriptedFactory {
    session: Arc<ScriptedSession>,
    created_with: Mutex<Option<PathBuf>>,
}

impl ScriptedFactory {
    fn new(session: &Arc<ScriptedSession>) -> Arc<Self> {
        Arc::new(Self {
            session: Arc::clone(session),
            created_with: Mutex::new(None),
        })
    }
}

impl SessionFactory for ScriptedFactory {
    fn create(&self, _account: &AccountId, state_dir: &Path) -> Result<SharedSession, SetupError> {
        *self.created_with.lock().unwrap() = Some(state_dir.to_path_buf());
        let session: SharedSession = self.session.clone();
        Ok(session)
    }
}

// ============================================================================
// Helpers
// ============================================================================

const LINK_CHECK_INTERVAL: Duration = Duration::from_millis(10);

fn context(
    registry: &Arc<SessionRegistry>,
    broadcaster: &Arc<Broadcaster>,
    factory: Arc<dyn SessionFactory>,
) -> LoopContext {
    LoopContext {
        state_dir: PathBuf::from("/var/lib/relay-test"),
        factory,
        registry: Arc::clone(registry),
        broadcaster: Arc::clone(broadcaster),
        retry: RetryPolicy::immediate(),
        link_check_interval: LINK_CHECK_INTERVAL,
    }
}

fn malformed_state(account: &str) -> SetupError {
    SetupError::MalformedState {
        account: AccountId::new(account),
        path: PathBuf::from("/var/lib/relay-test").join(account),
        reason: "expected value at line 1 column 1".into(),
    }
}

fn subscribe(broadcaster: &Broadcaster, id: &str) -> mpsc::Receiver<Frame> {
    let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
    broadcaster.add(id.into(), ClientHandle::new(tx, None)).unwrap();
    rx
}

fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_transient_errors_retry_until_authorization() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let script = vec![ok(), ok(), ok(), ok(), ok(), io_error(), ok(), unauthorized()];
    let session = ScriptedSession::new("A", true, &registry, script);
    let ctx = context(&registry, &broadcaster, ScriptedFactory::new(&session));

    let receive_loop = AccountReceiveLoop::start(AccountId::new("A"), &ctx).unwrap();
    assert!(receive_loop.is_registered());
    let exit = receive_loop.run();

    assert_eq!(exit, LoopExit::Unauthorized("401".into()));
    assert_eq!(session.calls(), 8);
    let seen = session.registered_during_calls.lock().unwrap().clone();
    assert_eq!(seen, vec![true; 8]);
}

#[test]
fn test_authorization_failure_keeps_registry_entry() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let session = ScriptedSession::new("A", true, &registry, vec![unauthorized()]);
    let ctx = context(&registry, &broadcaster, ScriptedFactory::new(&session));

    let exit = AccountReceiveLoop::start(AccountId::new("A"), &ctx)
        .unwrap()
        .run();

    assert!(matches!(exit, LoopExit::Unauthorized(_)));
    assert_eq!(session.calls(), 1);
    let still_there = registry.get(&AccountId::new("A")).unwrap();
    let expected: SharedSession = session.clone();
    assert!(Arc::ptr_eq(&still_there, &expected));
}

#[test]
fn test_unlinked_account_waits_without_registering() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let session = ScriptedSession::new("A", false, &registry, vec![ok(), ok(), unauthorized()]);
    let factory = ScriptedFactory::new(&session);
    let ctx = context(&registry, &broadcaster, factory.clone());

    let receive_loop = AccountReceiveLoop::start(AccountId::new("A"), &ctx).unwrap();
    assert!(!receive_loop.is_registered());
    let exit = receive_loop.run();

    assert!(matches!(exit, LoopExit::Unauthorized(_)));
    assert_eq!(session.calls(), 3);
    assert!(registry.get(&AccountId::new("A")).is_none());
    assert_eq!(
        factory.created_with.lock().unwrap().as_deref(),
        Some(Path::new("/var/lib/relay-test"))
    );
}

#[test]
fn test_waiting_account_registers_once_linked() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let script = vec![ok(), Step::Link, ok(), unauthorized()];
    let session = ScriptedSession::new("A", false, &registry, script);
    let ctx = context(&registry, &broadcaster, ScriptedFactory::new(&session));

    let receive_loop = AccountReceiveLoop::start(AccountId::new("A"), &ctx).unwrap();
    assert!(!receive_loop.is_registered());
    assert_eq!(session.init_calls.load(Ordering::SeqCst), 0);
    let exit = receive_loop.run();

    assert!(matches!(exit, LoopExit::Unauthorized(_)));
    assert_eq!(session.init_calls.load(Ordering::SeqCst), 1);
    let seen = session.registered_during_calls.lock().unwrap().clone();
    assert_eq!(seen, vec![false, false, true, true]);
    let timeouts = session.timeouts.lock().unwrap().clone();
    assert_eq!(
        timeouts,
        vec![
            LINK_CHECK_INTERVAL,
            LINK_CHECK_INTERVAL,
            DEFAULT_RECEIVE_TIMEOUT,
            DEFAULT_RECEIVE_TIMEOUT
        ]
    );
    let registered = registry.get(&AccountId::new("A")).unwrap();
    let expected: SharedSession = session.clone();
    assert!(Arc::ptr_eq(&registered, &expected));
}

#[test]
fn test_linked_account_failing_initialize_stays_unregistered() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let mut session = ScriptedSession::new("A", false, &registry, vec![Step::Link, ok(), unauthorized()]);
    Arc::get_mut(&mut session).unwrap().init_error = Some(malformed_state("A"));
    let ctx = context(&registry, &broadcaster, ScriptedFactory::new(&session));

    let exit = AccountReceiveLoop::start(AccountId::new("A"), &ctx)
        .unwrap()
        .run();

    // Retried after each clean return, never registered.
    assert!(matches!(exit, LoopExit::Unauthorized(_)));
    assert_eq!(session.init_calls.load(Ordering::SeqCst), 2);
    assert!(registry.get(&AccountId::new("A")).is_none());
}

#[test]
fn test_initialize_failure_aborts_start() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let mut session = ScriptedSession::new("A", true, &registry, vec![ok(), unauthorized()]);
    Arc::get_mut(&mut session).unwrap().init_error = Some(malformed_state("A"));
    let ctx = context(&registry, &broadcaster, ScriptedFactory::new(&session));

    let result = AccountReceiveLoop::start(AccountId::new("A"), &ctx);

    assert!(matches!(result, Err(SetupError::MalformedState { .. })));
    assert!(registry.get(&AccountId::new("A")).is_none());
    assert_eq!(session.init_calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.calls(), 0);
}

#[test]
fn test_supervisor_reports_initialize_failure() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let mut session = ScriptedSession::new("A", true, &registry, vec![ok()]);
    Arc::get_mut(&mut session).unwrap().init_error = Some(malformed_state("A"));
    let supervisor = Supervisor::new(context(&registry, &broadcaster, ScriptedFactory::new(&session)));

    assert!(supervisor.spawn(AccountId::new("A")).unwrap());

    let mut reaped = Vec::new();
    for _ in 0..200 {
        reaped = supervisor.reap_finished();
        if !reaped.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(reaped.len(), 1);
    assert!(matches!(reaped[0].1, Err(SetupError::MalformedState { .. })));
    assert!(!supervisor.registry().contains(&AccountId::new("A")));
    assert_eq!(session.calls(), 0);
}

#[test]
fn test_unclassified_error_stops_loop() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let other = Step::Return(Err(ReceiveError::Other("boom".into())));
    let session = ScriptedSession::new("A", true, &registry, vec![io_error(), other, ok()]);
    let ctx = context(&registry, &broadcaster, ScriptedFactory::new(&session));

    let exit = AccountReceiveLoop::start(AccountId::new("A"), &ctx)
        .unwrap()
        .run();

    assert_eq!(exit, LoopExit::Failed("boom".into()));
    assert_eq!(session.calls(), 2);
}

#[test]
fn test_single_event_reaches_every_client_once() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let mut rx1 = subscribe(&broadcaster, "c1");
    let mut rx2 = subscribe(&broadcaster, "c2");

    let script = vec![
        Step::Deliver(vec![InboundEvent::text("B", "hi", 1_700_000_000_000)], Ok(())),
        unauthorized(),
    ];
    let session = ScriptedSession::new("A", true, &registry, script);
    let ctx = context(&registry, &broadcaster, ScriptedFactory::new(&session));

    AccountReceiveLoop::start(AccountId::new("A"), &ctx)
        .unwrap()
        .run();

    for rx in [&mut rx1, &mut rx2] {
        let frames = drain(rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "message");
        assert_eq!(frames[0]["data"]["account"], "A");
        assert_eq!(frames[0]["data"]["sender"], "B");
        assert_eq!(frames[0]["data"]["content"], "hi");
    }
}

#[test]
fn test_events_published_in_delivery_order() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let mut rx = subscribe(&broadcaster, "c1");

    let first: Vec<InboundEvent> = (0..3).map(|i| InboundEvent::text("B", format!("m{i}"), i)).collect();
    let second: Vec<InboundEvent> = (3..5).map(|i| InboundEvent::text("B", format!("m{i}"), i)).collect();
    let script = vec![
        Step::Deliver(first, Ok(())),
        Step::Deliver(second, Err(ReceiveError::ProtocolAssertion("bad mac".into()))),
        unauthorized(),
    ];
    let session = ScriptedSession::new("A", true, &registry, script);
    let ctx = context(&registry, &broadcaster, ScriptedFactory::new(&session));

    AccountReceiveLoop::start(AccountId::new("A"), &ctx)
        .unwrap()
        .run();

    let bodies: Vec<String> = drain(&mut rx)
        .iter()
        .map(|f| f["data"]["content"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(bodies, vec!["m0", "m1", "m2", "m3", "m4"]);
}

#[test]
fn test_decode_failures_do_not_abort_loop() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let mut rx = subscribe(&broadcaster, "c1");

    let sender = Envelope::from_sender(Address::from_number("B"), 5);
    let events = vec![
        InboundEvent::failed(Some(sender), DecodeError::new("invalid padding")),
        InboundEvent::failed(None, DecodeError::new("no envelope at all")),
        InboundEvent::text("B", "after", 6),
    ];
    let script = vec![Step::Deliver(events, Ok(())), ok(), unauthorized()];
    let session = ScriptedSession::new("A", true, &registry, script);
    let ctx = context(&registry, &broadcaster, ScriptedFactory::new(&session));

    let exit = AccountReceiveLoop::start(AccountId::new("A"), &ctx)
        .unwrap()
        .run();

    assert!(matches!(exit, LoopExit::Unauthorized(_)));
    assert_eq!(session.calls(), 3);

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["data"]["kind"], "empty");
    assert_eq!(frames[0]["data"]["error"], "invalid padding");
    assert_eq!(frames[1]["data"]["content"], "after");
}

#[test]
fn test_sender_resolved_against_contacts() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let mut rx = subscribe(&broadcaster, "c1");

    let script = vec![
        Step::Deliver(vec![InboundEvent::text("B", "hi", 1)], Ok(())),
        unauthorized(),
    ];
    let mut session = ScriptedSession::new("A", true, &registry, script);
    Arc::get_mut(&mut session)
        .unwrap()
        .contacts
        .push(ContactInfo::new(Address::from_number("B")).with_name("Bob"));
    let ctx = context(&registry, &broadcaster, ScriptedFactory::new(&session));

    AccountReceiveLoop::start(AccountId::new("A"), &ctx)
        .unwrap()
        .run();

    let frames = drain(&mut rx);
    assert_eq!(frames[0]["data"]["contact_name"], "Bob");
    assert_eq!(frames[0]["data"]["contact"]["name"], "Bob");
}

#[test]
fn test_supervisor_reports_loop_exit() {
    let registry = SessionRegistry::shared();
    let broadcaster = Arc::new(Broadcaster::new());
    let session = ScriptedSession::new("A", true, &registry, vec![ok(), unauthorized()]);
    let supervisor = Supervisor::new(context(&registry, &broadcaster, ScriptedFactory::new(&session)));

    assert!(supervisor.spawn(AccountId::new("A")).unwrap());

    let mut reaped = Vec::new();
    for _ in 0..200 {
        reaped = supervisor.reap_finished();
        if !reaped.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(reaped.len(), 1);
    assert!(matches!(reaped[0].1, Ok(LoopExit::Unauthorized(_))));
    assert!(supervisor.registry().contains(&AccountId::new("A")));
    assert!(supervisor.running_accounts().is_empty());
}
