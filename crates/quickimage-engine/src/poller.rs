//! Fixed-interval polling for provider jobs that finish later than the
//! submitting request (image-to-video).

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::PollPolicy;
use crate::error::GenerationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Polling,
    Complete,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// What one poll of the provider reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    StillRunning,
    Complete(Vec<u8>),
    Unexpected { status: u16, body: String },
}

#[async_trait]
pub trait JobTransport: Send + Sync {
    async fn poll(&self, job_id: &str) -> Result<PollStatus, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct VideoJob {
    pub job_id: String,
    state: JobState,
    history: Vec<JobState>,
    pub attempts: u32,
    pub result: Option<Vec<u8>>,
}

impl VideoJob {
    pub fn submitted(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Submitted,
            history: vec![JobState::Submitted],
            attempts: 0,
            result: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every state the job has been in, in order, without repeats.
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    /// Moves forward only; staying put and leaving a terminal state are no-ops.
    fn advance(&mut self, next: JobState) -> bool {
        if self.state.is_terminal() || next <= self.state {
            return false;
        }
        self.state = next;
        self.history.push(next);
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobPoller {
    policy: PollPolicy,
}

impl JobPoller {
    pub fn new(policy: PollPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Sleeps one interval before each poll until the job completes, fails,
    /// or a cap in the policy is hit. On success the payload is left in
    /// `job.result`.
    pub async fn run(
        &self,
        transport: &dyn JobTransport,
        job: &mut VideoJob,
    ) -> Result<(), GenerationError> {
        let started = Instant::now();
        job.advance(JobState::Polling);
        loop {
            if let Some(err) = self.cap_reached(job, started.elapsed()) {
                job.advance(JobState::Failed);
                warn!(job_id = %job.job_id, attempts = job.attempts, "job polling gave up");
                return Err(err);
            }
            sleep(self.policy.interval).await;
            job.attempts += 1;

            let status = match transport.poll(&job.job_id).await {
                Ok(status) => status,
                Err(err) => {
                    job.advance(JobState::Failed);
                    return Err(err);
                }
            };
            match status {
                PollStatus::StillRunning => {
                    debug!(job_id = %job.job_id, attempt = job.attempts, "job still running");
                }
                PollStatus::Complete(bytes) => {
                    job.result = Some(bytes);
                    job.advance(JobState::Complete);
                    return Ok(());
                }
                PollStatus::Unexpected { status, body } => {
                    job.advance(JobState::Failed);
                    return Err(GenerationError::PollingFailed {
                        job_id: job.job_id.clone(),
                        status,
                        body,
                    });
                }
            }
        }
    }

    fn cap_reached(&self, job: &VideoJob, elapsed: Duration) -> Option<GenerationError> {
        let attempts_spent = self
            .policy
            .max_attempts
            .is_some_and(|max| job.attempts >= max);
        let deadline_passed = self.policy.timeout.is_some_and(|limit| elapsed >= limit);
        (attempts_spent || deadline_passed).then(|| GenerationError::PollingTimedOut {
            job_id: job.job_id.clone(),
            attempts: job.attempts,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{JobPoller, JobState, JobTransport, PollStatus, VideoJob};
    use crate::config::PollPolicy;
    use crate::error::GenerationError;

    struct Scripted {
        replies: Mutex<VecDeque<PollStatus>>,
        polls: Mutex<u32>,
    }

    impl Scripted {
        fn new(replies: Vec<PollStatus>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                polls: Mutex::new(0),
            }
        }

        fn polls(&self) -> u32 {
            *self.polls.lock().unwrap()
        }
    }

    #[async_trait]
    impl JobTransport for Scripted {
        async fn poll(&self, _job_id: &str) -> Result<PollStatus, GenerationError> {
            *self.polls.lock().unwrap() += 1;
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(PollStatus::StillRunning))
        }
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            ..PollPolicy::unbounded()
        }
    }

    #[tokio::test]
    async fn completes_after_running_polls_with_single_terminal_transition() -> anyhow::Result<()> {
        let transport = Scripted::new(vec![
            PollStatus::StillRunning,
            PollStatus::StillRunning,
            PollStatus::StillRunning,
            PollStatus::Complete(b"mp4".to_vec()),
        ]);
        let mut job = VideoJob::submitted("job-1");
        JobPoller::new(fast_policy()).run(&transport, &mut job).await?;

        assert_eq!(job.result.as_deref(), Some(&b"mp4"[..]));
        assert_eq!(job.attempts, 4);
        assert_eq!(transport.polls(), 4);
        assert_eq!(
            job.history(),
            &[JobState::Submitted, JobState::Polling, JobState::Complete]
        );
        Ok(())
    }

    #[tokio::test]
    async fn unexpected_status_fails_without_further_polls() {
        let transport = Scripted::new(vec![PollStatus::Unexpected {
            status: 500,
            body: "boom".to_string(),
        }]);
        let mut job = VideoJob::submitted("job-2");
        let err = JobPoller::new(fast_policy())
            .run(&transport, &mut job)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GenerationError::PollingFailed { status: 500, ref body, .. } if body == "boom"
        ));
        assert_eq!(transport.polls(), 1);
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn attempt_cap_times_out() {
        let transport = Scripted::new(Vec::new());
        let mut job = VideoJob::submitted("job-3");
        let policy = PollPolicy {
            max_attempts: Some(3),
            ..fast_policy()
        };
        let err = JobPoller::new(policy)
            .run(&transport, &mut job)
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::PollingTimedOut { attempts: 3, .. }));
        assert_eq!(transport.polls(), 3);
        assert_eq!(job.history().last(), Some(&JobState::Failed));
    }

    #[test]
    fn states_only_move_forward() {
        let mut job = VideoJob::submitted("job-4");
        assert!(job.advance(JobState::Polling));
        assert!(!job.advance(JobState::Submitted));
        assert!(job.advance(JobState::Complete));
        assert!(!job.advance(JobState::Failed));
        assert_eq!(job.state(), JobState::Complete);
    }
}
