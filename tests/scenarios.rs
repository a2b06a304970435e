use hcstool::bridge::{CommandExecutor, NotificationType};
use hcstool::cli::{self, Context, Target};
use hcstool::config::ToolConfig;
use hcstool::engine::{hresult, MigrationPhase, SimEngine, SimFault, Verb};
use hcstool::shell::{self, Flow, Shell};
use hcstool::HcsError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    engine: SimEngine,
    ctx: Context,
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ToolConfig::default())
    }

    fn with_config(config: ToolConfig) -> Self {
        let engine = SimEngine::with_latency(Duration::from_millis(5));
        let ctx = Context::new(Arc::new(engine.clone()), config);
        Self {
            engine,
            ctx,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn document(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    async fn create(&mut self, id: &str) -> anyhow::Result<String> {
        let path = self.document("vm.json", r#"{"VirtualMachine":{}}"#);
        let cancel = CancellationToken::new();
        cli::create::execute(&mut self.ctx, id, &path, true, None, &cancel).await
    }

    async fn verb(&mut self, verb: Verb) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        cli::lifecycle::execute(&mut self.ctx, verb, &Target::default(), &cancel).await
    }
}

fn hcs_error(err: &anyhow::Error) -> &HcsError {
    err.downcast_ref::<HcsError>()
        .unwrap_or_else(|| panic!("not an HcsError: {:#}", err))
}

#[tokio::test]
async fn test_create_records_session_after_completion() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();

    assert!(h.ctx.sessions.contains("vm1"));
    assert_eq!(h.ctx.sessions.default_id(), Some("vm1"));
    assert_eq!(h.engine.state_of("vm1"), Some("Created"));
    assert!(h.ctx.registry.take_violations().is_empty());
}

#[tokio::test]
async fn test_create_with_generated_id() {
    let mut h = Harness::new();
    let id = h.create("-").await.unwrap();

    assert_ne!(id, "-");
    assert!(h.ctx.sessions.contains(&id));
}

#[tokio::test]
async fn test_failed_create_keeps_session_open() {
    let mut h = Harness::new();
    h.engine.inject(
        Verb::Create,
        SimFault::Fail {
            status: hresult::INVALID_ARG,
            message: "bad memory size".to_string(),
        },
    );

    let err = h.create("vm1").await.unwrap_err();
    assert!(matches!(hcs_error(&err), HcsError::Failed { .. }));
    assert!(format!("{:#}", err).contains("bad memory size"));
    assert!(h.ctx.sessions.contains("vm1"));

    cli::close::execute(&mut h.ctx, &Target::default()).unwrap();
    assert!(h.ctx.sessions.is_empty());
}

#[tokio::test]
async fn test_rejected_start_does_not_consume_notifications() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();

    h.engine.inject(Verb::Start, SimFault::Reject(hresult::ACCESS_DENIED));
    h.engine.raise("vm1", NotificationType::SystemCrashReport, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = h.verb(Verb::Start).await.unwrap_err();
    assert!(matches!(hcs_error(&err), HcsError::Rejected { verb, .. } if verb == "start"));

    let session = h.ctx.sessions.resolve(None).unwrap();
    let n = session.notifications().try_recv().unwrap().unwrap();
    assert_eq!(n.kind, NotificationType::SystemCrashReport);
}

#[tokio::test]
async fn test_pause_failure_surfaces_event_message() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();
    h.verb(Verb::Start).await.unwrap();

    h.engine.inject(
        Verb::Pause,
        SimFault::Fail {
            status: hresult::ACCESS_DENIED,
            message: "access denied".to_string(),
        },
    );
    let err = h.verb(Verb::Pause).await.unwrap_err();

    match hcs_error(&err) {
        HcsError::Failed { status, detail, .. } => {
            assert_eq!(*status, hresult::ACCESS_DENIED);
            assert_eq!(detail.as_ref().unwrap().error_events[0].message, "access denied");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(h.ctx.sessions.contains("vm1"));
}

#[tokio::test]
async fn test_save_times_out_without_notification() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();
    h.verb(Verb::Start).await.unwrap();
    h.verb(Verb::Pause).await.unwrap();

    h.engine.inject(Verb::Save, SimFault::Silent);
    let target = Target {
        cs: Some("vm1".to_string()),
        timeout_ms: Some(1),
    };
    let path = h.dir.path().join("vm1.vmrs");
    let cancel = CancellationToken::new();
    let err = cli::save::execute(&mut h.ctx, &path, &target, &cancel).await.unwrap_err();

    assert!(matches!(hcs_error(&err), HcsError::TimedOut { verb, .. } if verb == "save"));
    assert!(h.ctx.sessions.contains("vm1"));
}

#[tokio::test]
async fn test_save_writes_state_file() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();
    h.verb(Verb::Start).await.unwrap();
    h.verb(Verb::Pause).await.unwrap();

    let path = h.dir.path().join("vm1.vmrs");
    let cancel = CancellationToken::new();
    cli::save::execute(&mut h.ctx, &path, &Target::default(), &cancel)
        .await
        .unwrap();
    assert!(path.exists());
}

#[tokio::test]
async fn test_intermediate_notifications_do_not_disturb_wait() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();
    h.verb(Verb::Start).await.unwrap();

    h.engine.inject(
        Verb::Pause,
        SimFault::Preface(NotificationType::SystemRdpEnhancedModeStateChanged),
    );
    h.verb(Verb::Pause).await.unwrap();
    assert_eq!(h.engine.state_of("vm1"), Some("Paused"));
}

#[tokio::test]
async fn test_malformed_payload_is_protocol_violation() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();

    h.engine.inject(Verb::Start, SimFault::Garbage);
    let err = h.verb(Verb::Start).await.unwrap_err();
    assert!(hcs_error(&err).is_protocol_violation());
}

#[tokio::test]
async fn test_cancellation_is_distinct_from_timeout() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();
    h.engine.inject(Verb::Start, SimFault::Silent);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let target = Target {
        cs: None,
        timeout_ms: Some(0),
    };
    let err = cli::lifecycle::execute(&mut h.ctx, Verb::Start, &target, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(hcs_error(&err), HcsError::Cancelled { .. }));
}

#[test]
fn test_exit_after_cancelled_unbounded_migration() {
    let engine = SimEngine::with_latency(Duration::from_millis(5));
    engine.seed("vm1");
    engine.inject_migration(MigrationPhase::Initialize, SimFault::Silent);

    let started = Instant::now();
    let result = shell::run_to_exit(async {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        CommandExecutor::new(&engine, None, &cancel)
            .migrate("vm1", MigrationPhase::Initialize, "", None)
            .await
    })
    .unwrap();

    assert!(matches!(result, Err(HcsError::Cancelled { .. })));
    assert!(
        started.elapsed() < shell::SHUTDOWN_GRACE + Duration::from_secs(2),
        "exit took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_modify_and_terminate() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();
    h.verb(Verb::Start).await.unwrap();

    let settings = h.document("memory.json", "4096");
    let cancel = CancellationToken::new();
    cli::modify::execute(
        &mut h.ctx,
        "VirtualMachine/ComputeTopology/Memory/SizeInMB",
        None,
        Some(&settings),
        &Target::default(),
        &cancel,
    )
    .await
    .unwrap();

    h.verb(Verb::Terminate).await.unwrap();
    assert_eq!(h.engine.state_of("vm1"), Some("Stopped"));
}

#[tokio::test]
async fn test_migration_phases() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();
    h.verb(Verb::Start).await.unwrap();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();
    let target = Target::default();

    let err = cli::migrate::execute(&mut h.ctx, MigrationPhase::Start, None, None, &target, &cancel)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("--socket"));

    for (phase, socket) in [
        (MigrationPhase::Initialize, None),
        (MigrationPhase::Start, Some(addr.as_str())),
        (MigrationPhase::Transfer, None),
        (MigrationPhase::Finalize, None),
    ] {
        let completion = cli::migrate::execute(&mut h.ctx, phase, None, socket, &target, &cancel)
            .await
            .unwrap();
        assert!(completion.succeeded());
    }
    assert_eq!(h.engine.state_of("vm1"), Some("Stopped"));
}

#[tokio::test]
async fn test_migration_connect_honours_cancel_and_refusal() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();
    h.verb(Verb::Start).await.unwrap();
    let target = Target::default();

    let cancel = CancellationToken::new();
    cli::migrate::execute(&mut h.ctx, MigrationPhase::Initialize, None, None, &target, &cancel)
        .await
        .unwrap();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = cli::migrate::execute(&mut h.ctx, MigrationPhase::Start, None, Some(addr.as_str()), &target, &cancelled)
        .await
        .unwrap_err();
    assert!(matches!(hcs_error(&err), HcsError::Cancelled { verb } if verb == "migrate start"));

    drop(listener);
    let target = Target {
        cs: None,
        timeout_ms: Some(2_000),
    };
    let err = cli::migrate::execute(&mut h.ctx, MigrationPhase::Start, None, Some(addr.as_str()), &target, &cancel)
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to connect migration transport"));
    assert!(err.downcast_ref::<std::io::Error>().is_some());
}

#[tokio::test]
async fn test_migration_failure_through_operation_handle() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();
    h.verb(Verb::Start).await.unwrap();

    h.engine.inject_migration(
        MigrationPhase::Initialize,
        SimFault::Fail {
            status: hresult::ACCESS_DENIED,
            message: "migration not allowed".to_string(),
        },
    );
    let cancel = CancellationToken::new();
    let err = cli::migrate::execute(
        &mut h.ctx,
        MigrationPhase::Initialize,
        None,
        None,
        &Target::default(),
        &cancel,
    )
    .await
    .unwrap_err();

    assert!(matches!(hcs_error(&err), HcsError::Failed { verb, .. } if verb == "migrate initialize"));
    assert!(format!("{:#}", err).contains("migration not allowed"));
}

#[tokio::test]
async fn test_open_props_and_grant() {
    let mut h = Harness::new();
    h.engine.seed("external");

    cli::open::execute(&mut h.ctx, "external").unwrap();
    let err = cli::open::execute(&mut h.ctx, "external").unwrap_err();
    assert!(matches!(hcs_error(&err), HcsError::AlreadyOpen(_)));

    let props = cli::props::execute(&mut h.ctx, true, &Target::system("external")).unwrap();
    assert_eq!(props.property_responses.basic.response.state, "Running");
    assert!(props.property_responses.vm_version.is_some());

    let disk = h.document("disk.vhdx", "");
    cli::grant::execute(&h.ctx, "external", &disk).unwrap();
    assert_eq!(h.engine.grants().len(), 1);

    let err = cli::open::execute(&mut h.ctx, "missing").unwrap_err();
    assert!(matches!(
        hcs_error(&err),
        HcsError::Engine(e) if e.hresult == hresult::SYSTEM_NOT_FOUND
    ));
}

#[tokio::test]
async fn test_commands_need_a_target() {
    let mut h = Harness::new();
    let err = h.verb(Verb::Start).await.unwrap_err();
    assert!(matches!(hcs_error(&err), HcsError::NoDefaultSystem));

    let err = cli::default::execute(&mut h.ctx, Some("vm1"), false).unwrap_err();
    assert!(matches!(hcs_error(&err), HcsError::SystemNotOpen(_)));
}

#[tokio::test]
async fn test_concurrent_sessions_do_not_cross() {
    let mut h = Harness::new();
    h.create("vm1").await.unwrap();
    h.create("vm2").await.unwrap();

    let target = Target::system("vm1");
    let cancel = CancellationToken::new();
    cli::lifecycle::execute(&mut h.ctx, Verb::Start, &target, &cancel)
        .await
        .unwrap();

    assert_eq!(h.engine.state_of("vm1"), Some("Running"));
    assert_eq!(h.engine.state_of("vm2"), Some("Created"));
    let vm2 = h.ctx.sessions.resolve(Some("vm2")).unwrap();
    assert!(vm2.notifications().try_recv().is_err());
}

#[tokio::test]
async fn test_shell_script_and_shutdown() {
    let h = Harness::new();
    let config = h.document("vm.json", "{}");
    let script = h.document(
        "script.hcs",
        &format!(
            "# bring one system up\ncreate vm1 {} --def\nstart\npause\nresume\nlist\nlist --all\nsvcprops\ndefault --unset\nexit\nstart\n",
            config.display()
        ),
    );

    let engine = h.engine.clone();
    let mut shell = Shell::new(h.ctx);
    shell.run_script(&script).await.unwrap();
    assert_eq!(engine.state_of("vm1"), Some("Running"));

    shell.shutdown();
    assert!(shell.context().sessions.is_empty());
    assert_eq!(engine.callback_count(), 0);
}

#[tokio::test]
async fn test_shell_reports_failures_and_fail_fast() {
    let config = ToolConfig {
        fail_fast: true,
        ..ToolConfig::default()
    };
    let h = Harness::with_config(config);
    let document = h.document("vm.json", "{}");
    let engine = h.engine.clone();
    let mut shell = Shell::new(h.ctx);

    let result = shell.execute_line("pause --cs nothing").await;
    assert_eq!(shell.report(result), Flow::Continue);

    let result = shell.execute_line("bogus").await;
    assert_eq!(shell.report(result), Flow::Continue);

    let result = shell
        .execute_line(&format!("create vm1 '{}' --def", document.display()))
        .await;
    assert_eq!(shell.report(result), Flow::Continue);

    engine.inject(Verb::Start, SimFault::Garbage);
    let result = shell.execute_line("start").await;
    assert_eq!(shell.report(result), Flow::Exit);

    shell.shutdown();
}
