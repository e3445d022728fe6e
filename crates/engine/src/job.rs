//! Job state machine
//!
//! One driver for every vendor: the vendor-specific calls come from a
//! [`JobAdapter`]. Status only moves forward (`queue → running → stopped`);
//! an unreachable or vanished remote job reads as stopped.

use crate::config::RetryConfig;
use crate::vendor::{Creation, JobAdapter, JobRequest, TicketState};
use crossrun_common::{retry_until, Attempt, Browser, Error, JobStatus, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct JobState {
    ticket: Option<String>,
    session: Option<String>,
    status: Option<JobStatus>,
    passed: Option<bool>,
    stopped: bool,
}

impl JobState {
    /// Fold an observation into the monotonic status
    fn observe(&mut self, seen: JobStatus) -> JobStatus {
        let status = self.status.map_or(seen, |current| current.max(seen));
        self.status = Some(status);
        status
    }
}

/// A remote job on the vendor's REST API
pub struct Job {
    adapter: Arc<dyn JobAdapter>,
    browser: Browser,
    retry: RetryConfig,
    state: Mutex<JobState>,
}

impl Job {
    /// Create the remote job. Two-phase tickets are polled for a while so
    /// an immediate vendor rejection surfaces here; a ticket that stays
    /// pending leaves the job queued.
    pub async fn create(
        adapter: Arc<dyn JobAdapter>,
        request: &JobRequest,
        retry: RetryConfig,
    ) -> Result<Self> {
        let mut state = JobState::default();

        match adapter.create(request).await? {
            Creation::Session(id) => {
                info!("{} job {} created for {}", adapter.vendor(), id, request.browser);
                state.session = Some(id);
            }
            Creation::Ticket(ticket) => {
                let promoted = retry_until(&retry.job_creation, "job creation", |_| {
                    poll_promotion(adapter.as_ref(), &ticket, &request.browser, true)
                })
                .await;

                match promoted {
                    Ok(Some(id)) => {
                        info!("{} job {} created for {}", adapter.vendor(), id, request.browser);
                        state.session = Some(id);
                    }
                    Ok(None) => {}
                    Err(Error::RetryExhausted { .. }) => {
                        debug!("Ticket {} still pending after creation budget", ticket)
                    }
                    Err(e) => return Err(e),
                }
                state.ticket = Some(ticket);
            }
        }

        Ok(Self {
            adapter,
            browser: request.browser.clone(),
            retry,
            state: Mutex::new(state),
        })
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    pub async fn session_id(&self) -> Option<String> {
        self.state.lock().await.session.clone()
    }

    /// Current status. Polling errors never propagate: a job we cannot
    /// see is reported as stopped.
    pub async fn status(&self) -> JobStatus {
        let mut state = self.state.lock().await;
        if state.stopped {
            return state.observe(JobStatus::Stopped);
        }

        if state.session.is_none() {
            let Some(ticket) = state.ticket.clone() else {
                return state.observe(JobStatus::Stopped);
            };
            match self.adapter.poll_ticket(&ticket).await {
                Ok(TicketState::Pending) => return state.observe(JobStatus::Queue),
                Ok(TicketState::Promoted(id)) => {
                    debug!("Ticket {} promoted to job {}", ticket, id);
                    state.session = Some(id);
                }
                Ok(TicketState::Rejected(message)) => {
                    warn!("Ticket {} rejected: {}", ticket, message);
                    return state.observe(JobStatus::Stopped);
                }
                Err(e) => {
                    warn!("Polling ticket {} failed, treating as stopped: {}", ticket, e);
                    return state.observe(JobStatus::Stopped);
                }
            }
        }

        let Some(session) = state.session.clone() else {
            return state.observe(JobStatus::Stopped);
        };
        match self.adapter.status(&session).await {
            Ok(remote) => {
                if state.passed.is_none() {
                    state.passed = remote.passed;
                }
                state.observe(remote.status)
            }
            Err(e) => {
                warn!("Polling job {} failed, treating as stopped: {}", session, e);
                state.observe(JobStatus::Stopped)
            }
        }
    }

    /// Stop the remote job and default-mark it passed when no verdict was
    /// recorded. Returns a screenshot reference when one was requested and
    /// the vendor provides it. Stopping twice is a no-op.
    pub async fn stop(&self, take_screenshot: bool) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Ok(None);
        }

        if state.session.is_none() {
            let promoted = match state.ticket.clone() {
                Some(ticket) => {
                    let outcome =
                        retry_until(&self.retry.ticket_promotion, "ticket promotion", |_| {
                            poll_promotion(self.adapter.as_ref(), &ticket, &self.browser, false)
                        })
                        .await;
                    match outcome {
                        Ok(id) => id,
                        Err(Error::RetryExhausted { .. }) => None,
                        Err(e) => return Err(e),
                    }
                }
                None => None,
            };

            match promoted {
                Some(id) => state.session = Some(id),
                None => {
                    info!("Job for {} never started; nothing to stop", self.browser);
                    state.stopped = true;
                    state.observe(JobStatus::Stopped);
                    return Ok(None);
                }
            }
        }

        let Some(session) = state.session.clone() else {
            return Ok(None);
        };

        let screenshot = if take_screenshot {
            match self.adapter.screenshot(&session).await {
                Ok(shot) => shot,
                Err(e) => {
                    warn!("Screenshot of job {} failed: {}", session, e);
                    None
                }
            }
        } else {
            None
        };

        match self.adapter.stop(&session).await {
            Ok(()) => debug!("Stopped job {}", session),
            Err(e) if e.is_not_found() => debug!("Job {} already gone", session),
            Err(e) => return Err(e),
        }

        if state.passed.is_none() {
            match self.adapter.mark(&session, true).await {
                Ok(()) => state.passed = Some(true),
                Err(e) => warn!("Marking job {} failed: {}", session, e),
            }
        }

        state.stopped = true;
        state.observe(JobStatus::Stopped);
        Ok(screenshot)
    }

    /// Record a verdict. Only the first verdict counts; returns whether
    /// this call recorded it.
    pub async fn mark(&self, passed: bool) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.passed.is_some() {
            return Ok(false);
        }
        let session = state.session.clone().ok_or_else(|| {
            Error::ProcessLifecycle(format!("job for {} has no session yet", self.browser))
        })?;

        self.adapter.mark(&session, passed).await?;
        state.passed = Some(passed);
        Ok(true)
    }

    pub async fn verdict(&self) -> Option<bool> {
        self.state.lock().await.passed
    }
}

/// One ticket poll. `Done(None)` means there is no job to wait for.
async fn poll_promotion(
    adapter: &dyn JobAdapter,
    ticket: &str,
    browser: &Browser,
    reject_is_error: bool,
) -> Result<Attempt<Option<String>>> {
    match adapter.poll_ticket(ticket).await {
        Ok(TicketState::Pending) => Ok(Attempt::Retry(format!("ticket {} pending", ticket))),
        Ok(TicketState::Promoted(id)) => Ok(Attempt::Done(Some(id))),
        Ok(TicketState::Rejected(message)) if reject_is_error => Err(Error::Input(format!(
            "{} rejected {}: {}",
            adapter.vendor(),
            browser,
            message
        ))),
        Ok(TicketState::Rejected(_)) => Ok(Attempt::Done(None)),
        Err(e) if e.is_not_found() && !reject_is_error => Ok(Attempt::Done(None)),
        Err(e) => Ok(Attempt::Retry(e.to_string())),
    }
}
