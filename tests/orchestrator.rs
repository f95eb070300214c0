use async_trait::async_trait;
use chrono::Utc;
use oida::core::agent::{Delegate, ExecutionOutcome, ExecutionResult};
use oida::core::context::ReasoningContext;
use oida::core::cortex::Reasoner;
use oida::core::decision::{
    Action, ActionKind, DecisionDraft, Disposition, FailureKind, Priority, RawDecision,
};
use oida::core::r#loop::{Orchestrator, INTERRUPTED_REASONING, REASONER_DOWN_REASONING};
use oida::core::state::{LoopState, OidaConfig};
use oida::io::events::{ChangeEvent, ChangeKind, Observation};
use oida::io::watcher::ChangeObserver;
use oida::memory::{CozoStateStore, CycleRecord, Goal, StateStore};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct StubReasoner {
    reply: RawDecision,
    available: AtomicBool,
    calls: AtomicUsize,
    /// Never answers; only a shutdown gets the loop past `think`.
    hang: bool,
    seen_context: Mutex<Option<ReasoningContext>>,
}

impl StubReasoner {
    fn replying(reply: RawDecision) -> Arc<Self> {
        Arc::new(Self {
            reply,
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            hang: false,
            seen_context: Mutex::new(None),
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            reply: RawDecision::Failed {
                kind: FailureKind::Transport,
                detail: "unused".to_string(),
            },
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            hang: true,
            seen_context: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reasoner for StubReasoner {
    async fn think(&self, _summary: &str, context: &ReasoningContext) -> RawDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen_context.lock().unwrap() = Some(context.clone());
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.reply.clone()
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

struct StubDelegate {
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl StubDelegate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Delegate for StubDelegate {
    async fn execute(&self, action: &Action, _abort: &CancellationToken) -> ExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(action.prompt.clone());
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        ExecutionResult {
            outcome: ExecutionOutcome::Completed,
            success: true,
            output: "done".to_string(),
            output_truncated: false,
            error: None,
            duration: started.elapsed(),
            exit_code: Some(0),
        }
    }
}

fn draft(disposition: Disposition, confidence: f64, action: Option<Action>) -> RawDecision {
    RawDecision::Parsed(DecisionDraft {
        reasoning: "stubbed".to_string(),
        disposition,
        confidence,
        action,
    })
}

fn update_index() -> Action {
    Action {
        kind: ActionKind::SingleAgent,
        description: "refresh the index".to_string(),
        prompt: "update index".to_string(),
        priority: Priority::Medium,
    }
}

fn created(path: &str) -> Observation {
    Observation::new(vec![ChangeEvent {
        kind: ChangeKind::Created,
        path: PathBuf::from(path),
        at: Utc::now(),
    }])
}

fn config() -> OidaConfig {
    OidaConfig {
        cycle_interval_secs: 1,
        debounce_ms: 50,
        shutdown_grace_secs: 1,
        ..OidaConfig::default()
    }
}

fn orchestrator(
    config: OidaConfig,
    reasoner: Arc<StubReasoner>,
    delegate: Arc<StubDelegate>,
    store: Arc<CozoStateStore>,
) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(config, reasoner, delegate, store))
}

async fn wait_for_cycle(store: &CozoStateStore, cycle: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if store.last_cycle().await.unwrap().unwrap_or(0) >= cycle {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("cycle {} was never recorded", cycle);
}

#[tokio::test]
async fn test_created_note_with_wait_decision_skips_execution() {
    let store = Arc::new(CozoStateStore::in_memory().unwrap());
    let reasoner = StubReasoner::replying(draft(Disposition::Wait, 0.4, None));
    let delegate = StubDelegate::new();
    let orch = orchestrator(config(), reasoner.clone(), delegate.clone(), store.clone());

    let (tx, rx) = mpsc::channel(8);
    tx.send(created("notes.md")).await.unwrap();

    let shutdown = CancellationToken::new();
    let handle = {
        let orch = orch.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orch.run_with(ChangeObserver::from_channel(rx), shutdown).await })
    };

    wait_for_cycle(&store, 1).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let recent = store.recent(1).await.unwrap();
    let record = &recent[0];
    assert_eq!(record.cycle, 1);
    assert!(record.observation_summary.contains("- created notes.md"));
    assert_eq!(record.decision.disposition, Disposition::Wait);
    assert_eq!(record.decision.confidence, 0.4);
    assert!(record.decision.action.is_none());
    assert!(record.execution.is_none());
    assert_eq!(delegate.calls(), 0);

    // no goals, no history on the first cycle
    let context = reasoner.seen_context.lock().unwrap().clone().unwrap();
    assert!(context.goals.is_empty());
    assert!(context.recent.is_empty());
}

#[tokio::test]
async fn test_confident_act_is_delegated_and_recorded() {
    let store = Arc::new(CozoStateStore::in_memory().unwrap());
    let reasoner = StubReasoner::replying(draft(Disposition::Act, 0.9, Some(update_index())));
    let delegate = StubDelegate::new();
    let orch = orchestrator(config(), reasoner, delegate.clone(), store.clone());

    let (tx, rx) = mpsc::channel(8);
    tx.send(created("index.md")).await.unwrap();
    let mut observer = ChangeObserver::from_channel(rx);
    let token = CancellationToken::new();

    let record = orch.cycle(&mut observer, 1, &token, &token).await.unwrap();
    store.append(&record).await.unwrap();

    assert_eq!(delegate.calls(), 1);
    assert_eq!(delegate.prompts.lock().unwrap()[0], "update index");

    let stored = &store.recent(1).await.unwrap()[0];
    assert_eq!(stored.decision.disposition, Disposition::Act);
    let exec = stored.execution.as_ref().unwrap();
    assert!(exec.success);
    assert_eq!(exec.output, "done");
    assert!(exec.duration > Duration::ZERO);
}

#[tokio::test]
async fn test_low_confidence_act_is_investigated_not_executed() {
    let store = Arc::new(CozoStateStore::in_memory().unwrap());
    let reasoner = StubReasoner::replying(draft(Disposition::Act, 0.5, Some(update_index())));
    let delegate = StubDelegate::new();
    let orch = orchestrator(config(), reasoner, delegate.clone(), store);

    let (tx, rx) = mpsc::channel(8);
    tx.send(created("a.md")).await.unwrap();
    let mut observer = ChangeObserver::from_channel(rx);
    let token = CancellationToken::new();

    let record = orch.cycle(&mut observer, 1, &token, &token).await.unwrap();
    assert_eq!(record.decision.disposition, Disposition::Investigate);
    assert!(record.decision.action.is_none());
    assert!(record.execution.is_none());
    assert_eq!(delegate.calls(), 0);
}

#[tokio::test]
async fn test_idle_tick_is_skipped_unless_configured() {
    let store = Arc::new(CozoStateStore::in_memory().unwrap());
    let reasoner = StubReasoner::replying(draft(Disposition::Wait, 0.1, None));
    let token = CancellationToken::new();
    let (_tx, rx) = mpsc::channel::<Observation>(8);
    let mut observer = ChangeObserver::from_channel(rx);

    let orch = orchestrator(config(), reasoner.clone(), StubDelegate::new(), store.clone());
    assert!(orch.cycle(&mut observer, 1, &token, &token).await.is_none());
    assert_eq!(reasoner.calls(), 0);

    let idle = OidaConfig {
        think_when_idle: true,
        ..config()
    };
    let orch = orchestrator(idle, reasoner.clone(), StubDelegate::new(), store);
    let record = orch.cycle(&mut observer, 1, &token, &token).await.unwrap();
    assert_eq!(record.observation_summary, "No changes observed.");
    assert_eq!(reasoner.calls(), 1);
}

#[tokio::test]
async fn test_unavailable_reasoner_falls_back_to_wait() {
    let store = Arc::new(CozoStateStore::in_memory().unwrap());
    let reasoner = StubReasoner::replying(draft(Disposition::Act, 0.99, Some(update_index())));
    reasoner.available.store(false, Ordering::SeqCst);
    let delegate = StubDelegate::new();
    let orch = orchestrator(config(), reasoner.clone(), delegate.clone(), store);

    let (tx, rx) = mpsc::channel(8);
    tx.send(created("b.md")).await.unwrap();
    let mut observer = ChangeObserver::from_channel(rx);
    let token = CancellationToken::new();

    let record = orch.cycle(&mut observer, 1, &token, &token).await.unwrap();
    assert_eq!(record.decision.disposition, Disposition::Wait);
    assert_eq!(record.decision.reasoning, REASONER_DOWN_REASONING);
    assert_eq!(reasoner.calls(), 0);
    assert_eq!(delegate.calls(), 0);
}

#[tokio::test]
async fn test_shutdown_during_think_still_records_the_cycle() {
    let store = Arc::new(CozoStateStore::in_memory().unwrap());
    let reasoner = StubReasoner::hanging();
    let orch = orchestrator(config(), reasoner.clone(), StubDelegate::new(), store.clone());

    let (tx, rx) = mpsc::channel(8);
    tx.send(created("c.md")).await.unwrap();

    let shutdown = CancellationToken::new();
    let handle = {
        let orch = orch.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orch.run_with(ChangeObserver::from_channel(rx), shutdown).await })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while reasoner.calls() == 0 {
        assert!(Instant::now() < deadline, "reasoner never consulted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stop_requested = Instant::now();
    shutdown.cancel();
    handle.await.unwrap().unwrap();
    assert!(stop_requested.elapsed() < Duration::from_secs(2));

    let recent = store.recent(5).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].decision.disposition, Disposition::Wait);
    assert_eq!(recent[0].decision.reasoning, INTERRUPTED_REASONING);
}

#[tokio::test]
async fn test_cycle_numbers_continue_after_restart_and_state_is_published() {
    let store = Arc::new(CozoStateStore::in_memory().unwrap());
    let reasoner = StubReasoner::replying(draft(Disposition::Wait, 0.2, None));

    for round in 1..=2u64 {
        let orch = orchestrator(config(), reasoner.clone(), StubDelegate::new(), store.clone());
        let mut state = orch.subscribe();
        assert_eq!(*state.borrow(), LoopState::Starting);

        let (tx, rx) = mpsc::channel(8);
        tx.send(created("d.md")).await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = {
            let orch = orch.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { orch.run_with(ChangeObserver::from_channel(rx), shutdown).await })
        };

        wait_for_cycle(&store, round).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        state.changed().await.ok();
        assert_eq!(*state.borrow_and_update(), LoopState::Stopped);
    }

    let recent = store.recent(10).await.unwrap();
    let cycles: Vec<u64> = recent.iter().map(|r| r.cycle).collect();
    assert_eq!(cycles, vec![2, 1]);

    // the second run saw the first run's outcome as context
    let context = reasoner.seen_context.lock().unwrap().clone().unwrap();
    assert_eq!(context.recent.len(), 1);
    assert_eq!(context.recent[0].cycle, 1);
}

#[tokio::test]
async fn test_goals_reach_the_reasoner() {
    let store = Arc::new(CozoStateStore::in_memory().unwrap());
    store.add_goal("keep the index fresh", Priority::High).await.unwrap();
    let done = store.add_goal("old goal", Priority::Low).await.unwrap();
    store.complete_goal(&done.id).await.unwrap();

    let reasoner = StubReasoner::replying(draft(Disposition::Wait, 0.3, None));
    let orch = orchestrator(config(), reasoner.clone(), StubDelegate::new(), store);

    let (tx, rx) = mpsc::channel(8);
    tx.send(created("e.md")).await.unwrap();
    let mut observer = ChangeObserver::from_channel(rx);
    let token = CancellationToken::new();
    orch.cycle(&mut observer, 1, &token, &token).await.unwrap();

    let context = reasoner.seen_context.lock().unwrap().clone().unwrap();
    assert_eq!(context.goals.len(), 1);
    assert_eq!(context.goals[0].description, "keep the index fresh");
}

#[cfg(unix)]
#[tokio::test]
async fn test_shutdown_grace_aborts_a_running_agent() {
    use oida::core::agent::{AgentExecutor, ABORT_MARKER};
    use oida::core::state::ExecutionConfig;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CozoStateStore::in_memory().unwrap());
    let reasoner = StubReasoner::replying(draft(
        Disposition::Act,
        0.95,
        Some(Action {
            kind: ActionKind::SingleAgent,
            description: "long job".to_string(),
            prompt: "sleep 30".to_string(),
            priority: Priority::Low,
        }),
    ));
    let executor = Arc::new(AgentExecutor::new(
        dir.path(),
        ExecutionConfig {
            agent_binary: "sh".to_string(),
            agent_print_flag: "-c".to_string(),
            timeout_secs: 60,
            kill_grace_ms: 200,
            ..ExecutionConfig::default()
        },
    ));
    let orch = Arc::new(Orchestrator::new(
        config(),
        reasoner.clone(),
        executor,
        store.clone(),
    ));

    let (tx, rx) = mpsc::channel(8);
    tx.send(created("f.md")).await.unwrap();
    let shutdown = CancellationToken::new();
    let handle = {
        let orch = orch.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orch.run_with(ChangeObserver::from_channel(rx), shutdown).await })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while reasoner.calls() == 0 {
        assert!(Instant::now() < deadline, "reasoner never consulted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // let the child start
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stop_requested = Instant::now();
    shutdown.cancel();
    handle.await.unwrap().unwrap();
    // grace (1s) + kill grace, well short of the 30s sleep
    assert!(stop_requested.elapsed() < Duration::from_secs(5));

    let record = &store.recent(1).await.unwrap()[0];
    let exec = record.execution.as_ref().unwrap();
    assert_eq!(exec.outcome, ExecutionOutcome::TimedOut);
    assert!(!exec.success);
    assert_eq!(exec.error.as_deref(), Some(ABORT_MARKER));
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_watches_the_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = OidaConfig {
        workspace_root: dir.path().to_path_buf(),
        ..config()
    };
    config.execution.agent_binary = "sh".to_string();

    let store = Arc::new(CozoStateStore::in_memory().unwrap());
    let reasoner = StubReasoner::replying(draft(Disposition::Wait, 0.4, None));
    let orch = orchestrator(config, reasoner, StubDelegate::new(), store.clone());

    let shutdown = CancellationToken::new();
    let mut state = orch.subscribe();
    let handle = {
        let orch = orch.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orch.run(shutdown).await })
    };
    state
        .wait_for(|s| *s == LoopState::Cycling)
        .await
        .unwrap();

    std::fs::write(dir.path().join("notes.md"), "# notes\n").unwrap();
    wait_for_cycle(&store, 1).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let recent = store.recent(10).await.unwrap();
    let first = recent.last().unwrap();
    assert_eq!(first.cycle, 1);
    assert!(first.observation_summary.contains("created notes.md"));
}

#[tokio::test]
async fn test_invalid_config_is_fatal_at_startup() {
    let store = Arc::new(CozoStateStore::in_memory().unwrap());
    let mut config = config();
    config.workspace_root = PathBuf::from("/definitely/not/a/workspace");
    let orch = orchestrator(
        config,
        StubReasoner::replying(draft(Disposition::Wait, 0.1, None)),
        StubDelegate::new(),
        store.clone(),
    );
    assert!(orch.run(CancellationToken::new()).await.is_err());
    assert_eq!(store.last_cycle().await.unwrap(), None);
}

/// Rejects the first append, then behaves like the wrapped store.
struct FlakyStore {
    inner: CozoStateStore,
    fail_next: AtomicBool,
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn append(&self, record: &CycleRecord) -> anyhow::Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.append(record).await
    }

    async fn recent(&self, n: usize) -> anyhow::Result<Vec<CycleRecord>> {
        self.inner.recent(n).await
    }

    async fn last_cycle(&self) -> anyhow::Result<Option<u64>> {
        self.inner.last_cycle().await
    }

    async fn goals(&self) -> anyhow::Result<Vec<Goal>> {
        self.inner.goals().await
    }

    async fn add_goal(&self, description: &str, priority: Priority) -> anyhow::Result<Goal> {
        self.inner.add_goal(description, priority).await
    }

    async fn complete_goal(&self, id: &str) -> anyhow::Result<bool> {
        self.inner.complete_goal(id).await
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.inner.flush().await
    }
}

#[tokio::test]
async fn test_failed_append_does_not_skip_a_cycle_number() {
    let store = Arc::new(FlakyStore {
        inner: CozoStateStore::in_memory().unwrap(),
        fail_next: AtomicBool::new(true),
    });
    let reasoner = StubReasoner::replying(draft(Disposition::Wait, 0.3, None));
    let config = OidaConfig {
        think_when_idle: true,
        ..config()
    };
    let orch = Arc::new(Orchestrator::new(config, reasoner, StubDelegate::new(), store.clone()));

    let (_tx, rx) = mpsc::channel(8);
    let shutdown = CancellationToken::new();
    let handle = {
        let orch = orch.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orch.run_with(ChangeObserver::from_channel(rx), shutdown).await })
    };

    wait_for_cycle(&store.inner, 2).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let mut cycles: Vec<u64> = store.inner.recent(10).await.unwrap().iter().map(|r| r.cycle).collect();
    cycles.reverse();
    assert_eq!(cycles[..2], [1, 2]);
    assert!(cycles.windows(2).all(|w| w[1] == w[0] + 1));
}
