//! End-to-end scenarios against a fully in-process engine: in-memory
//! store and queue, scripted model provider, stubbed search and fetch.
//! The worker pool runs for real; only the network edges are replaced.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crewd::config::Settings;
use crewd::core::engine::Engine;
use crewd::core::model::{ChatMessage, ModelProvider, ProviderReply};
use crewd::core::orchestrator::types::TaskState;
use crewd::core::queue::InMemoryQueue;
use crewd::core::research::ResearchOutcome;
use crewd::core::research::fetch::{FetchedPage, Fetcher};
use crewd::core::research::search::{SearchProvider, SearchResult};
use crewd::core::signal::{CancelSignal, Deadline};
use crewd::core::signing::sign_webhook;
use crewd::core::store::{SqliteStore, Store};
use crewd::core::webhooks::{IngestOutcome, WebhookEndpoint};
use crewd::core::worker::WorkerPool;
use crewd::error::{EngineError, Result};

// ── scripted collaborators ──

struct ScriptedProvider {
    rules: Vec<(String, String)>,
    default_reply: String,
    calls: AtomicUsize,
    failures_before_success: AtomicUsize,
    delay: Duration,
}

impl ScriptedProvider {
    fn new(default_reply: &str) -> Self {
        Self {
            rules: Vec::new(),
            default_reply: default_reply.to_string(),
            calls: AtomicUsize::new(0),
            failures_before_success: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn rule(mut self, needle: &str, reply: &str) -> Self {
        self.rules.push((needle.to_string(), reply.to_string()));
        self
    }

    fn fail_first(self, n: usize) -> Self {
        self.failures_before_success.store(n, Ordering::SeqCst);
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        _model_id: &str,
        messages: &[ChatMessage],
        _temperature: f64,
        _max_tokens: u32,
        _timeout: Duration,
    ) -> Result<ProviderReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let remaining = self.failures_before_success.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_before_success
                .store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Provider("scripted 503".into()));
        }
        let haystack = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let text = self
            .rules
            .iter()
            .find(|(needle, _)| haystack.contains(needle))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.default_reply.clone());
        Ok(ProviderReply { text, usage: None })
    }
}

struct StubSearch {
    results: Vec<SearchResult>,
}

#[async_trait]
impl SearchProvider for StubSearch {
    async fn search(&self, _query: &str, max: usize) -> Result<Vec<SearchResult>> {
        Ok(self.results.iter().take(max).cloned().collect())
    }
}

struct StubFetcher {
    pages: HashMap<String, String>,
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch_clean(
        &self,
        url: &str,
        _cancel: &CancelSignal,
        _deadline: Deadline,
    ) -> Result<FetchedPage> {
        match self.pages.get(url) {
            Some(text) => Ok(FetchedPage {
                url: url.to_string(),
                text: text.clone(),
            }),
            None => Err(EngineError::Provider("fetch refused".into())),
        }
    }
}

fn test_settings() -> Settings {
    let mut settings = Settings::from_env();
    settings.workers = 2;
    settings.agent_deadline = Duration::from_secs(20);
    settings.research_deadline = Duration::from_secs(20);
    settings.queue_poll_timeout = Duration::from_millis(200);
    settings.heartbeat_interval = Duration::from_millis(200);
    settings.lease_ttl = Duration::from_secs(5);
    settings
}

fn engine_with(
    provider: ScriptedProvider,
    search: StubSearch,
    fetcher: StubFetcher,
) -> Arc<Engine> {
    let settings = test_settings();
    let store = Arc::new(SqliteStore::open(":memory:").expect("store opens"));
    Engine::with_collaborators(
        settings,
        store,
        InMemoryQueue::new(),
        Arc::new(provider),
        Arc::new(search),
        Arc::new(fetcher),
    )
}

fn engine(provider: ScriptedProvider) -> Arc<Engine> {
    engine_with(
        provider,
        StubSearch {
            results: Vec::new(),
        },
        StubFetcher {
            pages: HashMap::new(),
        },
    )
}

fn start(engine: &Arc<Engine>) {
    WorkerPool::start(engine.clone(), engine.settings.workers);
}

async fn wait_terminal(engine: &Arc<Engine>, task_id: &str) -> crewd::core::orchestrator::types::Task {
    engine
        .orchestrator
        .wait(task_id, Duration::from_secs(15))
        .await
        .expect("task exists")
}

// ── scenarios ──

#[tokio::test]
async fn simple_agent_call_completes_with_no_delegations() {
    let engine = engine(ScriptedProvider::new(
        "Q1 burn comes to roughly 410k given those inputs.",
    ));
    start(&engine);

    let task = engine
        .orchestrator
        .submit(
            "u1",
            "finance_manager",
            json!({"prompt": "Project Q1 burn given 120000 MRR and 3.5% churn"}),
            None,
            None,
        )
        .await
        .unwrap();

    let done = wait_terminal(&engine, &task.id).await;
    assert_eq!(done.state, TaskState::Completed);
    let output: Value = serde_json::from_str(done.output.as_deref().unwrap()).unwrap();
    assert!(!output["text"].as_str().unwrap().is_empty());
    assert_eq!(output["delegations"], json!([]));
}

#[tokio::test]
async fn delegated_call_produces_engineer_child_and_merged_output() {
    let engine = engine(
        ScriptedProvider::new("generic")
            .rule(
                "consolidating teammate input",
                "Retention push plan, with engineering feasibility: two sprints.",
            )
            .rule("INTER-AGENT REQUEST", "Feasible in two sprints with existing infra.")
            .rule(
                "Design push notifications",
                "Draft plan.\n<consult agent=\"engineer\">Is this feasible?</consult>",
            ),
    );
    start(&engine);

    let task = engine
        .orchestrator
        .submit(
            "u1",
            "product_manager",
            json!({"prompt": "Design push notifications for retention; check feasibility."}),
            None,
            None,
        )
        .await
        .unwrap();

    let done = wait_terminal(&engine, &task.id).await;
    assert_eq!(done.state, TaskState::Completed);
    let output: Value = serde_json::from_str(done.output.as_deref().unwrap()).unwrap();
    assert!(output["text"].as_str().unwrap().contains("feasibility"));

    let delegations = output["delegations"].as_array().unwrap();
    assert_eq!(delegations.len(), 1);
    let child = engine
        .orchestrator
        .get(delegations[0].as_str().unwrap())
        .await
        .unwrap();
    assert_eq!(child.agent_id, "engineer");
    assert_eq!(child.state, TaskState::Completed);
    assert_eq!(child.parent_id.as_deref(), Some(task.id.as_str()));
}

#[tokio::test]
async fn research_path_returns_cited_sources() {
    let provider = ScriptedProvider::new("A concise page summary.")
        .rule(
            "Answer with inline",
            "Reliability budgets tightened industry-wide [1], while tooling consolidated [2].",
        );
    let search = StubSearch {
        results: vec![
            SearchResult {
                title: "SRE Report".into(),
                url: "https://a.example/sre".into(),
                snippet: String::new(),
            },
            SearchResult {
                title: "Trends".into(),
                url: "https://b.example/trends".into(),
                snippet: String::new(),
            },
            SearchResult {
                title: "Blocked".into(),
                url: "https://blocked.example/page".into(),
                snippet: String::new(),
            },
        ],
    };
    let fetcher = StubFetcher {
        pages: HashMap::from([
            ("https://a.example/sre".to_string(), "reliability content".to_string()),
            ("https://b.example/trends".to_string(), "trends content".to_string()),
            // blocked.example is absent: fetch fails, source is skipped.
        ]),
    };
    let engine = engine_with(provider, search, fetcher);
    start(&engine);

    let task = engine
        .orchestrator
        .research("u1", "site-reliability trends 2024", Some(3), None)
        .await
        .unwrap();
    let done = wait_terminal(&engine, &task.id).await;
    assert_eq!(done.state, TaskState::Completed);

    let outcome: ResearchOutcome =
        serde_json::from_str(done.output.as_deref().unwrap()).unwrap();
    assert!(outcome.sources.len() >= 1 && outcome.sources.len() <= 3);
    assert_eq!(outcome.pages_synthesised, 2);
    assert!(outcome.answer.contains("[1]"));
    for (i, source) in outcome.sources.iter().enumerate() {
        assert_eq!(source.index, i + 1);
        assert!(!source.url.is_empty());
        assert!(!source.title.is_empty());
        assert!(!source.url.contains("blocked.example"));
    }
}

#[tokio::test]
async fn webhook_dedup_runs_the_handler_once() {
    let engine = engine(ScriptedProvider::new("Triage: looks like a deploy issue."));
    start(&engine);

    let body =
        br#"{"external_id":"abc123","severity":"critical","service":"api","message":"down","requester_id":"u7"}"#;
    let sig = sign_webhook(body, &engine.settings.webhook_secret);

    let first = engine
        .ingress
        .ingest(WebhookEndpoint::Scrape, Some(&sig), json!({}), body)
        .await
        .unwrap();
    let IngestOutcome::Accepted { task_id } = first else {
        panic!("first delivery must be accepted");
    };
    let second = engine
        .ingress
        .ingest(WebhookEndpoint::Scrape, Some(&sig), json!({}), body)
        .await
        .unwrap();
    assert_eq!(second, IngestOutcome::Duplicate);

    let done = wait_terminal(&engine, &task_id).await;
    assert_eq!(done.state, TaskState::Completed);

    // Only the accepted delivery produced a follow-up task.
    let tasks = engine.store.list_tasks_by_requester("u7", 50).await.unwrap();
    let follow_ups: Vec<_> = tasks
        .iter()
        .filter(|t| t.agent_id == "webhook_scrape")
        .collect();
    assert_eq!(follow_ups.len(), 1);
}

#[tokio::test]
async fn alert_webhook_spawns_engineer_triage() {
    let engine = engine(ScriptedProvider::new("Triage: roll back the last deploy."));
    start(&engine);

    let body = br#"{"external_id":"alert-9","severity":"critical","service":"api","message":"p99 spike","requester_id":"u8"}"#;
    let sig = sign_webhook(body, &engine.settings.webhook_secret);
    let outcome = engine
        .ingress
        .ingest(WebhookEndpoint::Alert, Some(&sig), json!({}), body)
        .await
        .unwrap();
    let IngestOutcome::Accepted { task_id } = outcome else {
        panic!("expected acceptance");
    };
    wait_terminal(&engine, &task_id).await;

    // The follow-up queued an engineer task; give the pool a beat to run it.
    let mut triage = None;
    for _ in 0..50 {
        let tasks = engine.store.list_tasks_by_requester("u8", 50).await.unwrap();
        if let Some(t) = tasks.iter().find(|t| t.agent_id == "engineer") {
            triage = Some(t.clone());
            if t.state.is_terminal() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let triage = triage.expect("engineer triage task created");
    let done = wait_terminal(&engine, &triage.id).await;
    assert_eq!(done.state, TaskState::Completed);
}

#[tokio::test]
async fn conversation_memory_carries_across_submits() {
    let engine = engine(
        ScriptedProvider::new("noted")
            .rule("repeat the last number", "The number you gave me is 8675309.")
            .rule("8675309", "Stored your number."),
    );
    start(&engine);

    let first = engine
        .orchestrator
        .submit(
            "u1",
            "assistant",
            json!({"prompt": "my number is 8675309"}),
            None,
            Some("C1".into()),
        )
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, &first.id).await.state, TaskState::Completed);

    let second = engine
        .orchestrator
        .submit(
            "u1",
            "assistant",
            json!({"prompt": "repeat the last number I gave you verbatim"}),
            None,
            Some("C1".into()),
        )
        .await
        .unwrap();
    let done = wait_terminal(&engine, &second.id).await;
    assert_eq!(done.state, TaskState::Completed);
    let output: Value = serde_json::from_str(done.output.as_deref().unwrap()).unwrap();
    assert!(output["text"].as_str().unwrap().contains("8675309"));

    let log = engine.memory.recent("C1", 10).await.unwrap();
    assert_eq!(log.len(), 4);
    let seqs: Vec<i64> = log.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn transient_worker_failures_requeue_then_complete() {
    // Three provider failures exhaust the model client's ladder on the
    // first job attempt; the worker requeues and the second attempt
    // succeeds.
    let engine = engine(ScriptedProvider::new("recovered").fail_first(3));
    start(&engine);

    let task = engine
        .orchestrator
        .submit("u1", "assistant", json!({"prompt": "flaky"}), None, None)
        .await
        .unwrap();
    let done = engine
        .orchestrator
        .wait(&task.id, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(done.state, TaskState::Completed);
}

#[tokio::test]
async fn permanent_failure_fails_without_requeue() {
    // Empty completion is a shape failure, permanent by contract.
    let engine = engine(ScriptedProvider::new("   "));
    start(&engine);

    let task = engine
        .orchestrator
        .submit("u1", "assistant", json!({"prompt": "anything"}), None, None)
        .await
        .unwrap();
    let done = wait_terminal(&engine, &task.id).await;
    assert_eq!(done.state, TaskState::Failed);
    assert!(done.error.as_deref().unwrap().contains("bad_response"));
}

#[tokio::test]
async fn cancellation_mid_model_call_lands_in_cancelled() {
    let engine = engine(ScriptedProvider::new("too late").slow(Duration::from_secs(2)));
    start(&engine);

    let task = engine
        .orchestrator
        .submit("u1", "assistant", json!({"prompt": "slow one"}), None, None)
        .await
        .unwrap();

    // Give a worker time to claim and enter the model call, then cancel.
    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.orchestrator.cancel(&task.id).await.unwrap();

    let done = wait_terminal(&engine, &task.id).await;
    assert_eq!(done.state, TaskState::Cancelled);
}

#[tokio::test]
async fn cancellation_before_claim_never_runs_the_model() {
    let engine = engine(ScriptedProvider::new("unused"));
    // Workers deliberately not started yet.
    let task = engine
        .orchestrator
        .submit("u1", "assistant", json!({"prompt": "never runs"}), None, None)
        .await
        .unwrap();
    engine.orchestrator.cancel(&task.id).await.unwrap();

    start(&engine);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let done = engine.orchestrator.get(&task.id).await.unwrap();
    assert_eq!(done.state, TaskState::Cancelled);
}

#[tokio::test]
async fn multi_agent_submit_runs_mentioned_agents_in_order() {
    let engine = engine(
        ScriptedProvider::new("section")
            .rule("consolidating teammate input", "Launch plan merging both views.")
            .rule("INTER-AGENT REQUEST", "My take from my own seat."),
    );
    start(&engine);

    let task = engine
        .orchestrator
        .submit_multi("u1", "@alex and @marcus: plan the launch budget", None)
        .await
        .unwrap();
    let done = wait_terminal(&engine, &task.id).await;
    assert_eq!(done.state, TaskState::Completed);

    let output: Value = serde_json::from_str(done.output.as_deref().unwrap()).unwrap();
    let delegations = output["delegations"].as_array().unwrap();
    assert_eq!(delegations.len(), 2);
    let first = engine
        .orchestrator
        .get(delegations[0].as_str().unwrap())
        .await
        .unwrap();
    let second = engine
        .orchestrator
        .get(delegations[1].as_str().unwrap())
        .await
        .unwrap();
    assert_eq!(first.agent_id, "product_manager");
    assert_eq!(second.agent_id, "finance_manager");
}

#[tokio::test]
async fn idempotent_submits_share_one_task_and_one_model_call() {
    let engine = engine(ScriptedProvider::new("single answer").slow(Duration::from_millis(300)));
    start(&engine);

    let inputs = json!({"prompt": "same request"});
    let a = engine
        .orchestrator
        .submit("u1", "assistant", inputs.clone(), Some("idem-1".into()), None)
        .await
        .unwrap();
    let b = engine
        .orchestrator
        .submit("u1", "assistant", inputs, Some("idem-1".into()), None)
        .await
        .unwrap();
    assert_eq!(a.id, b.id);

    let done = wait_terminal(&engine, &a.id).await;
    assert_eq!(done.state, TaskState::Completed);
}
