//! Remote control channel.
//!
//! Two transports carry status out and commands in:
//!
//! | Transport | Module | Status | Commands |
//! |-----------|--------|--------|----------|
//! | poll | [`control_poll`](crate::control_poll) | form POST each tick | pulled each tick |
//! | push | [`control_push`](crate::control_push) | broadcast each tick | forwarded on arrival |
//!
//! [`ControlJob`] is the periodic tick. It takes one [`StatusSnapshot`] and
//! hands each transport its own copy, then pulls at most one command from
//! the poll endpoint. Commands from either transport go through [`submit`]
//! into the orchestrator's command channel.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::counters::{EventCounters, JobHandle};
use crate::control_poll::PollTransport;
use crate::control_push::PushHub;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::models::{JobKind, RemoteCommand, StatusSnapshot, Transport};
use crate::queue::HandoffQueue;
use crate::shutdown::Shutdown;

/// Parse `text` and queue it for the orchestrator.
pub fn submit(
    commands: &mpsc::Sender<RemoteCommand>,
    text: &str,
    source: Transport,
) -> Result<RemoteCommand> {
    let command = RemoteCommand::parse(text, source)?;
    match commands.try_send(command.clone()) {
        Ok(()) => {
            tracing::info!(
                target_job = ?command.target,
                verb = ?command.verb,
                source = ?source,
                "Remote command received"
            );
            Ok(command)
        }
        Err(mpsc::error::TrySendError::Full(_)) => Err(Error::Command(
            "command channel full, try again later".to_string(),
        )),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(Error::Command("service is shutting down".to_string()))
        }
    }
}

pub struct ControlJob {
    counters: Arc<EventCounters>,
    queue: Arc<HandoffQueue>,
    device_id: String,
    poll: Option<PollTransport>,
    hub: Option<Arc<PushHub>>,
    commands: mpsc::Sender<RemoteCommand>,
    handle: JobHandle,
    status_push: Option<JoinHandle<()>>,
}

impl ControlJob {
    pub fn new(
        device_id: impl Into<String>,
        counters: Arc<EventCounters>,
        queue: Arc<HandoffQueue>,
        commands: mpsc::Sender<RemoteCommand>,
        handle: JobHandle,
    ) -> Self {
        Self {
            counters,
            queue,
            device_id: device_id.into(),
            poll: None,
            hub: None,
            commands,
            handle,
            status_push: None,
        }
    }

    pub fn with_poll(mut self, poll: PollTransport) -> Self {
        self.poll = Some(poll);
        self
    }

    pub fn with_hub(mut self, hub: Arc<PushHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.counters
            .snapshot(&self.device_id, Some(self.queue.stats()))
    }

    /// Start a status push unless the previous one is still in flight.
    fn spawn_status_push(&mut self, poll: &PollTransport, snapshot: StatusSnapshot) {
        if let Some(task) = &self.status_push {
            if !task.is_finished() {
                tracing::debug!("Previous status push still running, skipping");
                return;
            }
        }
        let poll = poll.clone();
        self.status_push = Some(tokio::spawn(async move {
            if let Err(e) = poll.push_status(&snapshot).await {
                tracing::warn!(error = %e, "Status push failed");
            }
        }));
    }
}

#[async_trait]
impl Job for ControlJob {
    fn kind(&self) -> JobKind {
        JobKind::Control
    }

    async fn run_cycle(&mut self, shutdown: &Shutdown) -> Result<()> {
        let snapshot = self.snapshot();

        let mut subscribers = 0;
        if let Some(hub) = &self.hub {
            subscribers = hub.broadcast_status(&snapshot).await;
        }

        let Some(poll) = self.poll.clone() else {
            self.handle
                .set_detail(format!("subscribers={}", subscribers));
            return Ok(());
        };
        self.spawn_status_push(&poll, snapshot);

        shutdown.checkpoint()?;
        let pulled = poll.pull_command().await?;
        if let Some(text) = pulled {
            match submit(&self.commands, &text, Transport::Poll) {
                Ok(_) => self.handle.bump("commands", 1),
                Err(e) => {
                    self.handle.bump("rejected_commands", 1);
                    tracing::warn!(command = %text, error = %e, "Ignoring remote command");
                }
            }
        }
        self.handle
            .set_detail(format!("subscribers={} poll=ok", subscribers));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RetryPolicy;
    use crate::models::{CommandTarget, CommandVerb};
    use crate::queue::OverflowPolicy;

    #[test]
    fn test_submit_parses_and_queues() {
        let (tx, mut rx) = mpsc::channel(2);
        let cmd = submit(&tx, "Capture/Pause", Transport::Push).unwrap();
        assert_eq!(cmd.target, CommandTarget::Job(JobKind::Capture));
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.verb, CommandVerb::Pause);
        assert_eq!(queued.source, Transport::Push);
    }

    #[test]
    fn test_submit_rejects_garbage_and_full_channel() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            submit(&tx, "toaster/pause", Transport::Poll),
            Err(Error::Command(_))
        ));
        submit(&tx, "all/resume", Transport::Poll).unwrap();
        let err = submit(&tx, "all/resume", Transport::Poll).unwrap_err();
        assert!(err.to_string().contains("full"));
    }

    #[tokio::test]
    async fn test_tick_without_transports_is_ok() {
        let counters = Arc::new(EventCounters::new());
        let handle = counters
            .register(JobKind::Control, RetryPolicy::default())
            .unwrap();
        let queue = Arc::new(HandoffQueue::new(4, OverflowPolicy::DropOldest));
        let (tx, _rx) = mpsc::channel(4);
        let mut job = ControlJob::new("CAM1", counters.clone(), queue, tx, handle);
        job.run_cycle(&Shutdown::never()).await.unwrap();
        let snap = job.snapshot();
        assert_eq!(snap.device_id, "CAM1");
        assert_eq!(snap.queue.unwrap().capacity, 4);
    }
}
