use async_trait::async_trait;
use bootstrap_core::exit_code;
use bootstrap_core::readiness::{ReadinessProbe, ReadinessTarget};
use bootstrap_core::seed::{
    AdminAccount, CreateResult, Department, SeedAdminAction, SeedDepartmentsAction, SeedRecord, SeedStore,
};
use bootstrap_core::{
    run_bootstrap, BootstrapError, BootstrapPhase, CancelToken, Cancellation, Orchestrator, ProvisioningStep,
    ServerHandoff, StepStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn target(max_wait: Option<Duration>) -> ReadinessTarget {
    ReadinessTarget {
        host: "db".to_string(),
        port: 5432,
        principal: "postgres".to_string(),
        database: "hospital_db".to_string(),
        poll_interval: Duration::from_secs(1),
        attempt_timeout: Duration::from_secs(5),
        max_wait,
    }
}

/// Fails the first `failures` probes, then succeeds.
struct FlakyProbe {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyProbe {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ReadinessProbe for FlakyProbe {
    async fn probe(&self, _target: &ReadinessTarget) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingHandoff {
    calls: AtomicU32,
}

#[async_trait]
impl ServerHandoff for RecordingHandoff {
    async fn hand_off(&self, _cancel: &CancelToken) -> i32 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        exit_code::READY
    }
}

type Journal = Arc<Mutex<Vec<String>>>;

fn recorded(journal: &Journal, name: &'static str, fail: bool) -> ProvisioningStep {
    let journal = journal.clone();
    let policy = if name == "migrate" || name == "seed-admin" {
        bootstrap_core::FailurePolicy::Fatal
    } else {
        bootstrap_core::FailurePolicy::Tolerated
    };
    ProvisioningStep::from_fn(name, policy, move || {
        let journal = journal.clone();
        async move {
            journal.lock().unwrap().push(name.to_string());
            if fail {
                anyhow::bail!("{} exited with status 1", name);
            }
            Ok::<_, anyhow::Error>(None)
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_failed_migration_blocks_seeding_and_server_start() {
    let journal: Journal = Arc::default();
    let steps = vec![
        recorded(&journal, "migrate", true),
        recorded(&journal, "seed-admin", false),
        recorded(&journal, "seed-departments", false),
    ];
    let orchestrator = Orchestrator::new(target(None), FlakyProbe::new(0), steps);
    let handoff = RecordingHandoff::default();

    let code = run_bootstrap(&orchestrator, &handoff, &CancelToken::never()).await;

    assert_eq!(code, exit_code::STEP_FATAL);
    assert_ne!(code, exit_code::READY);
    assert_eq!(*journal.lock().unwrap(), vec!["migrate".to_string()]);
    assert_eq!(handoff.calls.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.phase().current(), BootstrapPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_database_then_reaches_ready_and_hands_off() {
    let journal: Journal = Arc::default();
    let steps = vec![
        recorded(&journal, "migrate", false),
        recorded(&journal, "compress", true),
        recorded(&journal, "seed-admin", false),
    ];
    let probe = FlakyProbe::new(3);
    let orchestrator = Orchestrator::new(target(None), probe.clone(), steps);
    let handoff = RecordingHandoff::default();

    let code = run_bootstrap(&orchestrator, &handoff, &CancelToken::never()).await;

    assert_eq!(code, exit_code::READY);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["migrate".to_string(), "compress".to_string(), "seed-admin".to_string()]
    );
    assert_eq!(handoff.calls.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.phase().current(), BootstrapPhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_tolerated_failure_is_recorded_but_does_not_fail_the_run() {
    let journal: Journal = Arc::default();
    let steps = vec![
        recorded(&journal, "migrate", false),
        recorded(&journal, "compress", true),
    ];
    let orchestrator = Orchestrator::new(target(None), FlakyProbe::new(0), steps);

    let result = orchestrator.provision(&CancelToken::never()).await;

    assert!(result.is_success());
    assert!(matches!(
        result.outcome("compress").map(|o| &o.status),
        Some(StepStatus::ToleratedFailure { .. })
    ));
    assert_eq!(result.summary().tolerated, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_database_runs_no_steps() {
    let journal: Journal = Arc::default();
    let steps = vec![recorded(&journal, "migrate", false)];
    let orchestrator = Orchestrator::new(target(Some(Duration::from_secs(3))), FlakyProbe::new(u32::MAX), steps);
    let handoff = RecordingHandoff::default();

    let code = run_bootstrap(&orchestrator, &handoff, &CancelToken::never()).await;

    assert_eq!(code, exit_code::DEPENDENCY_UNREACHABLE);
    assert!(journal.lock().unwrap().is_empty());
    assert_eq!(handoff.calls.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.phase().current(), BootstrapPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_while_waiting_aborts_without_steps() {
    let journal: Journal = Arc::default();
    let steps = vec![recorded(&journal, "migrate", false)];
    let orchestrator = Orchestrator::new(target(None), FlakyProbe::new(u32::MAX), steps);
    let cancellation = Cancellation::new();
    let token = cancellation.token();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancellation.cancel();
    });
    let result = orchestrator.provision(&token).await;
    canceller.await.unwrap();

    assert!(matches!(result.fatal_failure, Some(BootstrapError::Aborted)));
    assert!(journal.lock().unwrap().is_empty());
    assert_eq!(orchestrator.phase().current(), BootstrapPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_phase_is_provisioning_while_steps_run() {
    let seen: Arc<Mutex<Option<BootstrapPhase>>> = Arc::default();

    // The step reads the phase through a watch installed after construction.
    let slot: Arc<Mutex<Option<bootstrap_core::PhaseWatch>>> = Arc::default();
    let step_slot = slot.clone();
    let step_seen = seen.clone();
    let step = ProvisioningStep::from_fn("migrate", bootstrap_core::FailurePolicy::Fatal, move || {
        let slot = step_slot.clone();
        let seen = step_seen.clone();
        async move {
            let phase = slot.lock().unwrap().as_ref().map(|w| w.current());
            *seen.lock().unwrap() = phase;
            Ok::<_, anyhow::Error>(None)
        }
    });

    let orchestrator = Orchestrator::new(target(None), FlakyProbe::new(0), vec![step]);
    *slot.lock().unwrap() = Some(orchestrator.phase().watch());

    orchestrator.provision(&CancelToken::never()).await;

    assert_eq!(*seen.lock().unwrap(), Some(BootstrapPhase::Provisioning));
    assert_eq!(orchestrator.phase().current(), BootstrapPhase::Ready);
}

/// In-memory seed store standing in for the application tables.
#[derive(Default)]
struct MemoryStore {
    rows: Mutex<HashMap<(&'static str, String), SeedRecord>>,
}

#[async_trait]
impl SeedStore for MemoryStore {
    async fn exists(&self, record: &SeedRecord) -> anyhow::Result<bool> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.contains_key(&(record.domain(), record.key().to_string())))
    }

    async fn create(&self, record: &SeedRecord) -> anyhow::Result<CreateResult> {
        let mut rows = self.rows.lock().unwrap();
        let key = (record.domain(), record.key().to_string());
        if rows.contains_key(&key) {
            return Ok(CreateResult::AlreadyPresent);
        }
        rows.insert(key, record.clone());
        Ok(CreateResult::Created)
    }
}

fn seed_steps(store: &Arc<MemoryStore>) -> Vec<ProvisioningStep> {
    let admin = AdminAccount {
        username: "admin".to_string(),
        email: "admin@hospital.com".to_string(),
        password: "s3cret".to_string(),
        fallback_password: false,
    };
    vec![
        ProvisioningStep::fatal("seed-admin", SeedAdminAction::new(store.clone(), admin)),
        ProvisioningStep::tolerated(
            "seed-departments",
            SeedDepartmentsAction::new(store.clone(), Department::defaults()),
        ),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_second_full_run_converges_to_same_state() {
    let store = Arc::new(MemoryStore::default());

    let first = Orchestrator::new(target(None), FlakyProbe::new(0), seed_steps(&store));
    assert_eq!(
        run_bootstrap(&first, &RecordingHandoff::default(), &CancelToken::never()).await,
        exit_code::READY
    );
    let after_first: Vec<_> = {
        let rows = store.rows.lock().unwrap();
        let mut keys: Vec<_> = rows.keys().cloned().collect();
        keys.sort();
        keys
    };
    assert_eq!(after_first.len(), 1 + Department::defaults().len());

    let second = Orchestrator::new(target(None), FlakyProbe::new(0), seed_steps(&store));
    let result = second.provision(&CancelToken::never()).await;
    assert!(result.is_success());

    let after_second: Vec<_> = {
        let rows = store.rows.lock().unwrap();
        let mut keys: Vec<_> = rows.keys().cloned().collect();
        keys.sort();
        keys
    };
    assert_eq!(after_first, after_second);
    match result.outcome("seed-departments").map(|o| &o.status) {
        Some(StepStatus::Succeeded { detail }) => {
            assert_eq!(detail.as_deref(), Some("0 created, 6 already existed"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}
