//! Doubles shared by the engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use crossrun_common::{Error, JobStatus, Result, RetryPolicy, Vendor};
use crossrun_engine::config::{Credentials, EngineConfig, RetryConfig};
use crossrun_engine::vendor::{
    Creation, JobAdapter, JobRequest, RemoteStatus, SessionAdapter, TicketState, VendorAdapters,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the fake vendor creates jobs
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Direct,
    /// Ticket promotes after this many polls; `None` never promotes
    Ticket(Option<u32>),
    /// Ticket rejected with this diagnostic
    Rejected(String),
    /// Creation fails for this browser name
    FailFor(String),
}

/// Scriptable vendor job API that records every call
pub struct MockJobs {
    mode: Mode,
    remote: Mutex<JobStatus>,
    status_error: Mutex<bool>,
    calls: Mutex<Vec<String>>,
    polls: AtomicU32,
    next_id: AtomicU32,
}

impl MockJobs {
    pub fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            remote: Mutex::new(JobStatus::Running),
            status_error: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
            polls: AtomicU32::new(0),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn set_remote(&self, status: JobStatus) {
        *self.remote.lock() = status;
    }

    pub fn fail_status(&self) {
        *self.status_error.lock() = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl JobAdapter for MockJobs {
    fn vendor(&self) -> Vendor {
        Vendor::SauceLabs
    }

    async fn create(&self, request: &JobRequest) -> Result<Creation> {
        self.record(format!("create:{}", request.browser.browser));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            Mode::Direct => Ok(Creation::Session(format!("job-{}", n))),
            Mode::FailFor(name) if *name == request.browser.browser => Err(Error::VendorRejection {
                vendor: "mock".into(),
                message: format!("{} is not available", name),
            }),
            Mode::FailFor(_) => Ok(Creation::Session(format!("job-{}", n))),
            Mode::Ticket(_) | Mode::Rejected(_) => Ok(Creation::Ticket(format!("ticket-{}", n))),
        }
    }

    async fn poll_ticket(&self, ticket: &str) -> Result<TicketState> {
        self.record(format!("poll:{}", ticket));
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.mode {
            Mode::Ticket(Some(after)) if polls >= *after => {
                Ok(TicketState::Promoted(ticket.replace("ticket", "job")))
            }
            Mode::Rejected(message) => Ok(TicketState::Rejected(message.clone())),
            _ => Ok(TicketState::Pending),
        }
    }

    async fn status(&self, job: &str) -> Result<RemoteStatus> {
        self.record(format!("status:{}", job));
        if *self.status_error.lock() {
            return Err(Error::not_found("job", job));
        }
        Ok(RemoteStatus {
            status: *self.remote.lock(),
            passed: None,
        })
    }

    async fn stop(&self, job: &str) -> Result<()> {
        self.record(format!("stop:{}", job));
        Ok(())
    }

    async fn mark(&self, job: &str, passed: bool) -> Result<()> {
        self.record(format!("mark:{}:{}", job, passed));
        Ok(())
    }

    async fn screenshot(&self, job: &str) -> Result<Option<String>> {
        Ok(Some(format!("https://shots.example/{}.png", job)))
    }
}

/// Session adapter pointing at a mock hub
pub struct MockSessions {
    pub hub: String,
    pub marks: Mutex<Vec<(String, bool)>>,
    /// How long the vendor takes to acknowledge a mark
    pub mark_delay: Mutex<Duration>,
}

#[async_trait]
impl SessionAdapter for MockSessions {
    fn hub_url(&self) -> String {
        self.hub.clone()
    }

    fn capabilities(&self, request: &JobRequest) -> Value {
        json!({ "browserName": request.browser.browser, "name": request.session_name() })
    }

    async fn mark_session(&self, session: &str, passed: bool) -> Result<()> {
        self.marks.lock().push((session.to_string(), passed));
        let delay = *self.mark_delay.lock();
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[derive(Default)]
pub struct HubState {
    pub next: AtomicU32,
    pub open: Mutex<Vec<String>>,
    pub navigated: Mutex<Vec<String>>,
}

/// Minimal WebDriver hub on an ephemeral port
pub async fn spawn_hub() -> (String, Arc<HubState>) {
    let state = Arc::new(HubState::default());
    let app = Router::new()
        .route(
            "/wd/hub/session",
            post(|State(hub): State<Arc<HubState>>| async move {
                let id = format!("sess-{}", hub.next.fetch_add(1, Ordering::SeqCst));
                hub.open.lock().push(id.clone());
                Json(json!({ "value": { "sessionId": id, "capabilities": {} } }))
            }),
        )
        .route(
            "/wd/hub/session/:id/url",
            get(|| async { Json(json!({ "value": "http://localhost/app" })) }).post(
                |State(hub): State<Arc<HubState>>, Json(body): Json<Value>| async move {
                    hub.navigated
                        .lock()
                        .push(body["url"].as_str().unwrap_or_default().to_string());
                    Json(json!({ "value": null }))
                },
            ),
        )
        .route(
            "/wd/hub/session/:id/screenshot",
            get(|| async { Json(json!({ "value": "iVBORw0KGgo=" })) }),
        )
        .route(
            "/wd/hub/session/:id",
            axum::routing::delete(
                |State(hub): State<Arc<HubState>>, Path(id): Path<String>| async move {
                    hub.open.lock().retain(|s| *s != id);
                    Json(json!({ "value": null }))
                },
            ),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/wd/hub", addr), state)
}

pub fn adapters(jobs: Arc<MockJobs>, hub: &str) -> (VendorAdapters, Arc<MockSessions>) {
    let sessions = Arc::new(MockSessions {
        hub: hub.to_string(),
        marks: Mutex::new(Vec::new()),
        mark_delay: Mutex::new(Duration::ZERO),
    });
    (
        VendorAdapters {
            jobs,
            sessions: sessions.clone(),
        },
        sessions,
    )
}

/// Short retry budgets so tests finish quickly
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        job_creation: RetryPolicy::fixed(3, 10),
        ticket_promotion: RetryPolicy::fixed(3, 10),
        tunnel_stop: RetryPolicy::fixed(50, 50),
    }
}

pub fn config(store: &FsPath, binary: Option<PathBuf>) -> EngineConfig {
    let mut config = EngineConfig::new(Credentials::new("tester", "secret-key"));
    config.store_path = store.to_path_buf();
    config.retry = fast_retry();
    config.tunnel.binary_path = binary;
    config.tunnel.ready_timeout_secs = 10;
    config.tunnel.monitor_interval_ms = 100;
    config
}

/// Executable that behaves like a Sauce Connect tunnel. The file name is
/// unique so process-table lookups only see this test's tunnels.
pub fn fake_sauce_tunnel(dir: &FsPath) -> PathBuf {
    let path = dir.join(format!("sc-{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         trap 'echo Goodbye.; exit 0' TERM\n\
         echo 'Starting up'\n\
         echo 'Sauce Connect is up, you may start your tests.'\n\
         while true; do sleep 0.1; done\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Poll `check` for up to five seconds
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
