//! Script jobs: a caller-supplied function driving a WebDriver session

use crate::vendor::{JobRequest, SessionAdapter};
use crate::webdriver::WebDriverSession;
use crate::config::Credentials;
use crossrun_common::{JobStatus, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Script run against a live session. An `Err` marks the job failed.
pub type ScriptFn =
    Arc<dyn Fn(WebDriverSession) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Default)]
struct ScriptState {
    status: Option<JobStatus>,
    passed: Option<bool>,
    stopped: bool,
}

struct Shared {
    session: WebDriverSession,
    adapter: Arc<dyn SessionAdapter>,
    state: Mutex<ScriptState>,
}

impl Shared {
    /// Mark (at most once), then quit the session. Caller holds the lock.
    async fn finish(&self, state: &mut ScriptState, passed: bool) {
        if state.passed.is_none() {
            match self.adapter.mark_session(self.session.id(), passed).await {
                Ok(()) => state.passed = Some(passed),
                Err(e) => warn!("Marking session {} failed: {}", self.session.id(), e),
            }
        }
        if let Err(e) = self.session.quit().await {
            warn!("Closing session {} failed: {}", self.session.id(), e);
        }
        state.stopped = true;
        state.status = Some(JobStatus::Stopped);
    }
}

/// A WebDriver session on the vendor hub plus the script driving it
pub struct ScriptJob {
    shared: Arc<Shared>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Cancels the script body only; marking and closing always complete
    cancel: CancellationToken,
}

impl ScriptJob {
    /// Open the session and load the run's URL
    pub async fn create(
        adapter: Arc<dyn SessionAdapter>,
        credentials: &Credentials,
        request: &JobRequest,
    ) -> Result<Self> {
        let session = WebDriverSession::create(
            &adapter.hub_url(),
            adapter.capabilities(request),
            Some(credentials.clone()),
        )
        .await?;
        info!("Script session {} opened for {}", session.id(), request.browser);

        if let Err(e) = session.navigate(&request.url).await {
            let _ = session.quit().await;
            return Err(e);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                session,
                adapter,
                state: Mutex::new(ScriptState {
                    status: Some(JobStatus::Running),
                    ..Default::default()
                }),
            }),
            task: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn session(&self) -> &WebDriverSession {
        &self.shared.session
    }

    /// Start `script` in the background. When it finishes the session is
    /// marked from its outcome and closed.
    pub fn run(&self, script: ScriptFn) {
        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Script on session {} cancelled", shared.session.id());
                    return;
                }
                outcome = script(shared.session.clone()) => outcome,
            };
            let passed = match &outcome {
                Ok(()) => true,
                Err(e) => {
                    warn!("Script on session {} failed: {:#}", shared.session.id(), e);
                    false
                }
            };

            let mut state = shared.state.lock().await;
            if !state.stopped {
                debug!("Script on session {} finished", shared.session.id());
                shared.finish(&mut state, passed).await;
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub async fn status(&self) -> JobStatus {
        let mut state = self.shared.state.lock().await;
        if state.stopped {
            return JobStatus::Stopped;
        }
        // Any answer from the hub means the session is alive.
        let seen = match self.shared.session.current_url().await {
            Ok(_) => JobStatus::Running,
            Err(e) => {
                debug!("Session {} unreachable: {}", self.shared.session.id(), e);
                JobStatus::Stopped
            }
        };
        let status = state.status.map_or(seen, |current| current.max(seen));
        state.status = Some(status);
        status
    }

    /// Stop the session, cutting a still-running script short. A script
    /// that already returned gets its own verdict marked first. Returns a
    /// base64 PNG when a screenshot was requested and could be taken.
    pub async fn stop(&self, take_screenshot: bool) -> Result<Option<String>> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Script task of session {} ended abnormally: {}", self.shared.session.id(), e);
            }
        }

        let mut state = self.shared.state.lock().await;
        if state.stopped {
            return Ok(None);
        }

        let screenshot = if take_screenshot {
            match self.shared.session.screenshot().await {
                Ok(png) => Some(png),
                Err(e) => {
                    warn!("Screenshot of session {} failed: {}", self.shared.session.id(), e);
                    None
                }
            }
        } else {
            None
        };

        self.shared.finish(&mut state, true).await;
        Ok(screenshot)
    }

    pub async fn verdict(&self) -> Option<bool> {
        self.shared.state.lock().await.passed
    }
}
