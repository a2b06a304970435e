use super::*;
use crate::bridge::{Delivery, NotificationRegistry, NotificationReceiver};
use std::sync::Arc;

fn fast() -> SimEngine {
    SimEngine::with_latency(Duration::from_millis(2))
}

fn subscribe(engine: &SimEngine, handle: SystemHandle) -> (Arc<NotificationRegistry>, NotificationReceiver, CallbackToken) {
    let registry = Arc::new(NotificationRegistry::new());
    let key = registry.next_key();
    let (tx, rx) = mpsc::unbounded_channel();
    registry.register(key, tx);
    let token = engine
        .register_callback(handle, CallbackAdapter::new(Arc::clone(&registry)), key)
        .unwrap();
    (registry, rx, token)
}

fn next(rx: &mut NotificationReceiver) -> Delivery {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match rx.try_recv() {
            Ok(delivery) => return delivery,
            Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(1)),
            Err(e) => panic!("no notification arrived: {:?}", e),
        }
    }
}

#[test]
fn test_create_completion_is_held_until_callback_registered() {
    let engine = fast();
    let (handle, status) = engine.create_system("vm1", "{}").unwrap();
    assert_eq!(status, CallStatus::Pending);

    std::thread::sleep(Duration::from_millis(20));
    let (_registry, mut rx, _token) = subscribe(&engine, handle);

    let n = next(&mut rx).unwrap();
    assert_eq!(n.kind, NotificationType::SystemCreateCompleted);
    assert!(n.succeeded());
    assert_eq!(engine.state_of("vm1"), Some("Created"));
}

#[test]
fn test_lifecycle_transitions() {
    let engine = fast();
    let (handle, _) = engine.create_system("vm1", r#"{"VirtualMachine":{}}"#).unwrap();
    let (_registry, mut rx, _token) = subscribe(&engine, handle);
    next(&mut rx).unwrap();

    engine.invoke(Verb::Start, handle, "").unwrap();
    assert_eq!(next(&mut rx).unwrap().kind, NotificationType::SystemStartCompleted);
    assert_eq!(engine.state_of("vm1"), Some("Running"));

    engine.invoke(Verb::Pause, handle, "").unwrap();
    assert_eq!(next(&mut rx).unwrap().kind, NotificationType::SystemPauseCompleted);

    engine.invoke(Verb::Resume, handle, "").unwrap();
    assert_eq!(next(&mut rx).unwrap().kind, NotificationType::SystemResumeCompleted);

    engine.invoke(Verb::Terminate, handle, "").unwrap();
    assert_eq!(next(&mut rx).unwrap().kind, NotificationType::SystemExited);
    assert_eq!(engine.state_of("vm1"), Some("Stopped"));

    let err = engine.invoke(Verb::Shutdown, handle, "").unwrap_err();
    assert_eq!(err.hresult, hresult::ALREADY_STOPPED);
}

#[test]
fn test_invalid_transition_rejects_synchronously() {
    let engine = fast();
    let (handle, _) = engine.create_system("vm1", "{}").unwrap();

    let err = engine.invoke(Verb::Pause, handle, "").unwrap_err();
    assert_eq!(err.hresult, hresult::INVALID_STATE);
    assert_eq!(err.call, "HcsPauseComputeSystem");
}

#[test]
fn test_create_validates_configuration_and_duplicates() {
    let engine = fast();
    let err = engine.create_system("vm1", "{not json").unwrap_err();
    assert_eq!(err.hresult, hresult::INVALID_JSON);

    engine.create_system("vm1", "{}").unwrap();
    let err = engine.create_system("vm1", "{}").unwrap_err();
    assert_eq!(err.hresult, hresult::ALREADY_EXISTS);
}

#[test]
fn test_open_unknown_system() {
    let engine = fast();
    let err = engine.open_system("missing").unwrap_err();
    assert_eq!(err.hresult, hresult::SYSTEM_NOT_FOUND);

    engine.seed("other");
    assert!(engine.open_system("other").is_ok());
}

#[test]
fn test_injected_failure_carries_error_events() {
    let engine = fast();
    engine.seed("vm1");
    let handle = engine.open_system("vm1").unwrap();
    let (_registry, mut rx, _token) = subscribe(&engine, handle);

    engine.inject(
        Verb::Pause,
        SimFault::Fail {
            status: hresult::ACCESS_DENIED,
            message: "access denied".to_string(),
        },
    );
    engine.invoke(Verb::Pause, handle, "").unwrap();

    let n = next(&mut rx).unwrap();
    assert_eq!(n.status, hresult::ACCESS_DENIED);
    let data = n.data.unwrap();
    assert_eq!(data.error_events[0].message, "access denied");
    assert_eq!(engine.state_of("vm1"), Some("Running"));
}

#[test]
fn test_injected_rejection_and_preface() {
    let engine = fast();
    engine.seed("vm1");
    let handle = engine.open_system("vm1").unwrap();
    let (_registry, mut rx, _token) = subscribe(&engine, handle);

    engine.inject(Verb::Pause, SimFault::Reject(hresult::ACCESS_DENIED));
    let err = engine.invoke(Verb::Pause, handle, "").unwrap_err();
    assert_eq!(err.hresult, hresult::ACCESS_DENIED);

    engine.inject(Verb::Pause, SimFault::Preface(NotificationType::SystemRdpEnhancedModeStateChanged));
    engine.invoke(Verb::Pause, handle, "").unwrap();
    assert_eq!(
        next(&mut rx).unwrap().kind,
        NotificationType::SystemRdpEnhancedModeStateChanged
    );
    assert_eq!(next(&mut rx).unwrap().kind, NotificationType::SystemPauseCompleted);
}

#[test]
fn test_garbage_payload_decodes_to_violation() {
    let engine = fast();
    engine.seed("vm1");
    let handle = engine.open_system("vm1").unwrap();
    let (_registry, mut rx, _token) = subscribe(&engine, handle);

    engine.inject(Verb::Pause, SimFault::Garbage);
    engine.invoke(Verb::Pause, handle, "").unwrap();
    assert!(next(&mut rx).is_err());
}

#[test]
fn test_save_requires_path_and_writes_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vm1.vmrs");

    let engine = fast();
    engine.seed("vm1");
    let handle = engine.open_system("vm1").unwrap();
    let (_registry, mut rx, _token) = subscribe(&engine, handle);

    engine.invoke(Verb::Pause, handle, "").unwrap();
    next(&mut rx).unwrap();

    let err = engine.invoke(Verb::Save, handle, "{}").unwrap_err();
    assert_eq!(err.hresult, hresult::INVALID_ARG);

    let options = json!({"SaveType": "ToFile", "SaveStateFilePath": path}).to_string();
    engine.invoke(Verb::Save, handle, &options).unwrap();
    assert!(next(&mut rx).unwrap().succeeded());
    assert!(path.exists());
}

#[test]
fn test_unregister_stops_delivery() {
    let engine = fast();
    engine.seed("vm1");
    let handle = engine.open_system("vm1").unwrap();
    let (registry, mut rx, token) = subscribe(&engine, handle);
    assert_eq!(engine.callback_count(), 1);

    engine.unregister_callback(token).unwrap();
    assert_eq!(engine.callback_count(), 0);

    engine.raise("vm1", NotificationType::SystemExited, 0);
    std::thread::sleep(Duration::from_millis(20));
    assert!(rx.try_recv().is_err());
    assert!(registry.take_violations().is_empty());

    assert!(engine.unregister_callback(token).is_err());
}

#[test]
fn test_properties_document() {
    let engine = fast();
    engine.create_system("vm1", r#"{"Owner":"tests","VirtualMachine":{}}"#).unwrap();
    let handle = engine.open_system("vm1").unwrap();

    let document = engine
        .properties(handle, r#"{"Queries":{"Basic":null,"VmVersion":null}}"#)
        .unwrap();
    let value: Value = serde_json::from_str(&document).unwrap();
    let basic = &value["PropertyResponses"]["Basic"]["Response"];
    assert_eq!(basic["State"], "Created");
    assert_eq!(basic["Owner"], "tests");
    assert_eq!(value["PropertyResponses"]["VmVersion"]["Response"]["Major"], 12);
}

#[test]
fn test_enumerate_and_service_properties() {
    let engine = fast();
    engine.seed("b");
    engine.seed("a");

    let rows: Vec<Value> = serde_json::from_str(&engine.enumerate_systems("{}").unwrap()).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["Id"], "a");

    let service: Value = serde_json::from_str(
        &engine
            .service_properties(r#"{"PropertyQueries":{"Basic":null}}"#)
            .unwrap(),
    )
    .unwrap();
    let versions = service["PropertyResponses"]["Basic"]["Response"]["SupportedSchemaVersions"]
        .as_array()
        .unwrap();
    assert!(!versions.is_empty());
}

#[test]
fn test_grant_requires_absolute_path() {
    let engine = fast();
    assert!(engine.grant_vm_access("vm1", Path::new("relative.vhdx")).is_err());

    let dir = tempfile::tempdir().unwrap();
    engine.grant_vm_access("vm1", dir.path()).unwrap();
    assert_eq!(engine.grants(), vec![("vm1".to_string(), dir.path().to_path_buf())]);
}

#[test]
fn test_migration_phases_in_order() {
    let engine = fast();
    engine.seed("vm1");

    let err = engine
        .begin_migration("vm1", MigrationPhase::Transfer, "", None)
        .err()
        .unwrap();
    assert_eq!(err.hresult, hresult::INVALID_STATE);

    let mut op = engine
        .begin_migration("vm1", MigrationPhase::Initialize, "", None)
        .unwrap();
    assert_eq!(op.wait(None).status, hresult::S_OK);

    let err = engine
        .begin_migration("vm1", MigrationPhase::Start, "", None)
        .err()
        .unwrap();
    assert_eq!(err.hresult, hresult::INVALID_ARG);
}

#[test]
fn test_migration_wait_honors_timeout() {
    let engine = SimEngine::with_latency(Duration::from_millis(200));
    engine.seed("vm1");

    let mut op = engine
        .begin_migration("vm1", MigrationPhase::Initialize, "", None)
        .unwrap();
    assert_eq!(op.wait(Some(Duration::from_millis(5))).status, hresult::TIMEOUT);
    assert_eq!(op.wait(None).status, hresult::S_OK);

    engine.inject_migration(MigrationPhase::Start, SimFault::Silent);
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let transport = MigrationTransport::connect(listener.local_addr().unwrap(), None).unwrap();
    let mut op = engine
        .begin_migration("vm1", MigrationPhase::Start, "", Some(&transport))
        .unwrap();
    assert_eq!(op.wait(Some(Duration::from_millis(5))).status, hresult::TIMEOUT);
}
