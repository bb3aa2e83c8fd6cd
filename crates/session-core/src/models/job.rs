//! Background-API request futures.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use switchgen_esl_core::Event;

use crate::error::{Error, JobError, Result};
use crate::models::unix_now;

/// Invoked with the job's response body once the matching `BACKGROUND_JOB`
/// event arrives successfully.
pub type JobCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A pending `bgapi` request.
///
/// Created when the server acknowledges the command with a `Job-UUID` and
/// resolved exactly once by the correlated `BACKGROUND_JOB` event (or by an
/// explicit failure). `result` is idempotent after completion.
pub struct Job {
    uuid: String,
    sess_uuid: Option<String>,
    client_id: Option<String>,
    launch_time: f64,
    callback: Mutex<Option<JobCallback>>,
    result: Mutex<Option<std::result::Result<String, JobError>>>,
    done_tx: watch::Sender<bool>,
}

impl Job {
    /// Build a job from the `command/reply` acknowledging a bgapi command.
    pub fn from_reply(
        reply: &Event,
        sess_uuid: Option<String>,
        client_id: Option<String>,
        callback: Option<JobCallback>,
    ) -> Result<Arc<Job>> {
        let uuid = reply
            .job_uuid()
            .ok_or_else(|| Error::Config("bgapi reply carries no Job-UUID header".to_string()))?
            .to_string();
        Ok(Arc::new(Job {
            uuid,
            sess_uuid,
            client_id,
            launch_time: unix_now(),
            callback: Mutex::new(callback),
            result: Mutex::new(None),
            done_tx: watch::channel(false).0,
        }))
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Uuid of the session this job is originating, if any.
    pub fn sess_uuid(&self) -> Option<&str> {
        self.sess_uuid.as_deref()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Wall-clock time the command was issued.
    pub fn launch_time(&self) -> f64 {
        self.launch_time
    }

    pub fn done(&self) -> bool {
        self.result.lock().is_some()
    }

    pub fn successful(&self) -> bool {
        matches!(self.result.lock().as_ref(), Some(Ok(_)))
    }

    /// Resolve the job with the server's response, running the callback.
    /// A second resolution is a no-op.
    pub fn complete(&self, resp: &str) {
        {
            let mut result = self.result.lock();
            if result.is_some() {
                debug!("job {} already resolved", self.uuid);
                return;
            }
            *result = Some(Ok(resp.to_string()));
        }
        if let Some(callback) = self.callback.lock().take() {
            callback(resp);
        }
        let _ = self.done_tx.send(true);
    }

    /// Fail the job with the server's error string.
    pub fn fail(&self, resp: &str) {
        {
            let mut result = self.result.lock();
            if result.is_some() {
                debug!("job {} already resolved", self.uuid);
                return;
            }
            *result = Some(Err(JobError(resp.to_string())));
        }
        let _ = self.done_tx.send(true);
    }

    /// The result, if the job has resolved.
    pub fn try_result(&self) -> Option<std::result::Result<String, JobError>> {
        self.result.lock().clone()
    }

    /// Await the result, optionally bounded by `timeout`.
    pub async fn result(&self, timeout: Option<Duration>) -> Result<String> {
        let mut done_rx = self.done_tx.subscribe();
        let wait = done_rx.wait_for(|done| *done);
        match timeout {
            Some(duration) => {
                tokio::time::timeout(duration, wait)
                    .await
                    .map_err(|_| Error::Timeout {
                        duration,
                        what: format!("background job {}", self.uuid),
                    })?
                    .map_err(|_| Error::Cancelled)?;
            }
            None => {
                wait.await.map_err(|_| Error::Cancelled)?;
            }
        }
        match self.try_result() {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(err)) => Err(Error::Job(err)),
            None => Err(Error::Cancelled),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("uuid", &self.uuid)
            .field("sess_uuid", &self.sess_uuid)
            .field("done", &self.done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(job_uuid: &str) -> Event {
        let mut event = Event::new();
        event.insert("Content-Type", "command/reply");
        event.insert("Reply-Text", format!("+OK Job-UUID: {job_uuid}"));
        event.insert("Job-UUID", job_uuid);
        event
    }

    #[tokio::test]
    async fn completion_is_idempotent() {
        let job = Job::from_reply(&reply("j1"), None, None, None).unwrap();
        job.complete("first");
        job.complete("second");
        job.fail("third");
        assert_eq!(job.result(None).await.unwrap(), "first");
        // result can be taken again
        assert_eq!(job.result(None).await.unwrap(), "first");
    }

    #[tokio::test]
    async fn failure_surfaces_job_error() {
        let job = Job::from_reply(&reply("j2"), None, None, None).unwrap();
        job.fail("NO_ROUTE_DESTINATION");
        match job.result(None).await {
            Err(Error::Job(JobError(msg))) => assert_eq!(msg, "NO_ROUTE_DESTINATION"),
            other => panic!("expected JobError, got {other:?}"),
        }
        assert!(!job.successful());
    }

    #[tokio::test]
    async fn callback_runs_once_on_success() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = hits.clone();
        let callback: JobCallback = Arc::new(move |_resp| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let job = Job::from_reply(&reply("j3"), None, None, Some(callback)).unwrap();
        job.complete("+OK done");
        job.complete("+OK again");
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn result_times_out() {
        let job = Job::from_reply(&reply("j4"), None, None, None).unwrap();
        match job.result(Some(Duration::from_millis(10))).await {
            Err(Error::Timeout { .. }) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
