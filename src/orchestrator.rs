//! Service orchestration.
//!
//! The [`Orchestrator`] owns the shared state and runs one task per job:
//!
//! ```text
//!                  ┌────────────┐   Artifact   ┌───────────────┐
//!  timer/sensor ─▶ │ CaptureJob │ ───────────▶ │ HandoffQueue  │ ─┬─▶ LocalArchiveJob
//!                  └────────────┘              └───────────────┘  └─▶ RemoteUploadJob
//!                        │                                                │
//!                        └──────────────▶ EventCounters ◀─────────────────┘
//!                                              │
//!                                        ControlJob ──▶ poll / push transports
//!                                              ▲
//!                    RemoteCommand ────────────┘──▶ per-job mailbox
//! ```
//!
//! # Scheduling
//!
//! Each job task runs its first cycle immediately, then waits
//! [`RetryPolicy::next_delay`] before the next one. A job never overlaps
//! itself. Sensor-triggered capture waits for a GPIO edge instead of the
//! timer, ignoring edges inside the debounce period.
//!
//! # Commands
//!
//! | Verb | Effect |
//! |------|--------|
//! | `pause` | job is not scheduled until resumed |
//! | `resume` | job is scheduled again from now |
//! | `rearm` | clears Degraded/Failed, runs a cycle at once |
//! | `force_cycle` | runs a cycle at once, even when paused; ignored when Failed |
//!
//! Each job has a mailbox of [`MAILBOX_CAPACITY`]; commands that do not fit
//! are logged and dropped.
//!
//! # Shutdown
//!
//! On SIGINT/SIGTERM/SIGABRT (or the future passed to [`Orchestrator::run`])
//! cancellation is requested, job tasks get `shutdown_grace_secs` to reach a
//! checkpoint, stragglers are aborted, the upload log is flushed, every job
//! is marked Stopped and the supervisor is told `STOPPING=1`.

use anyhow::{bail, Context};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval};

use crate::archive::LocalArchiveJob;
use crate::capture::{backend_from_config, CaptureBackend, CaptureJob};
use crate::config::Config;
use crate::control::ControlJob;
use crate::control_poll::PollTransport;
use crate::control_push::{self, PushHub};
use crate::counters::{EventCounters, JobHandle};
use crate::error::Error;
use crate::gpio::{Gpio, NoGpio, SysfsGpio};
use crate::job::{Job, JobStatus, RetryPolicy};
use crate::models::{CommandVerb, JobKind, RemoteCommand};
use crate::queue::{ConsumerId, HandoffQueue};
use crate::shutdown::{self, Shutdown};
use crate::storage::{store_from_config, RemoteStore};
use crate::supervisor::Notifier;
use crate::upload::RemoteUploadJob;
use crate::upload_log::UploadLog;

/// Commands buffered per job.
pub const MAILBOX_CAPACITY: usize = 10;

/// Commands buffered between the transports and the dispatcher.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// What wakes a job between cycles.
enum Trigger {
    Timer,
    Sensor {
        gpio: Arc<dyn Gpio>,
        debounce: Duration,
    },
}

/// A job task that ran into a fatal error.
struct FatalError {
    job: Option<JobKind>,
    message: String,
}

pub struct Orchestrator {
    config: Config,
    counters: Arc<EventCounters>,
    queue: Arc<HandoffQueue>,
    archive_consumer: Option<ConsumerId>,
    upload_consumer: Option<ConsumerId>,
    backend: Option<Arc<dyn CaptureBackend>>,
    store: Option<Arc<dyn RemoteStore>>,
    gpio: Option<Arc<dyn Gpio>>,
    notifier: Notifier,
    commands_tx: mpsc::Sender<RemoteCommand>,
    commands_rx: mpsc::Receiver<RemoteCommand>,
}

impl Orchestrator {
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let queue = Arc::new(HandoffQueue::from_config(&config.queue));
        let archive_consumer = config
            .archive
            .enabled
            .then(|| queue.register_consumer("archive"));
        let upload_consumer = config
            .upload
            .enabled
            .then(|| queue.register_consumer("upload"));
        let notifier = if config.supervisor.notify {
            Notifier::from_env()
        } else {
            Notifier::disabled()
        };
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            counters: Arc::new(EventCounters::new()),
            queue,
            archive_consumer,
            upload_consumer,
            backend: None,
            store: None,
            gpio: None,
            notifier,
            commands_tx,
            commands_rx,
        })
    }

    pub fn with_capture_backend(mut self, backend: Arc<dyn CaptureBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_gpio(mut self, gpio: Arc<dyn Gpio>) -> Self {
        self.gpio = Some(gpio);
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn counters(&self) -> Arc<EventCounters> {
        self.counters.clone()
    }

    pub fn queue(&self) -> Arc<HandoffQueue> {
        self.queue.clone()
    }

    /// Sender for remote commands, as used by the control transports.
    pub fn commands(&self) -> mpsc::Sender<RemoteCommand> {
        self.commands_tx.clone()
    }

    /// Run until `shutdown_signal` resolves or a job hits a fatal error.
    pub async fn run(self, shutdown_signal: impl Future<Output = ()>) -> anyhow::Result<()> {
        let Self {
            config,
            counters,
            queue,
            archive_consumer,
            upload_consumer,
            backend,
            store,
            gpio,
            notifier,
            commands_tx,
            mut commands_rx,
        } = self;

        let policy = RetryPolicy::from_config(&config.retry);
        let schedule = &config.schedule;
        let (trigger, shutdown) = shutdown::channel();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<FatalError>(4);
        let mut tasks: JoinSet<JobKind> = JoinSet::new();
        let mut mailboxes: BTreeMap<JobKind, mpsc::Sender<CommandVerb>> = BTreeMap::new();

        let mut spawn = |job: Box<dyn Job>, handle: JobHandle, nominal: Duration, wake: Trigger| {
            let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
            mailboxes.insert(handle.kind(), tx);
            let runner = JobRunner {
                job,
                handle,
                nominal,
                trigger: wake,
                mailbox: rx,
                shutdown: shutdown.clone(),
                fatal: fatal_tx.clone(),
            };
            tasks.spawn(runner.drive());
        };

        // ---- Collaborators ----
        let gpio: Arc<dyn Gpio> = match gpio {
            Some(gpio) => gpio,
            None if config.gpio.reflector_pin.is_some() || config.gpio.sensor_pin.is_some() => {
                Arc::new(SysfsGpio::open(&config.gpio).context("Failed to open GPIO pins")?)
            }
            None => Arc::new(NoGpio),
        };
        let backend = match backend {
            Some(b) => b,
            None => backend_from_config(&config.camera)?,
        };
        let upload_log = if config.upload.enabled {
            let log = UploadLog::open(&config.upload.log_path).with_context(|| {
                format!(
                    "Failed to open upload log {}",
                    config.upload.log_path.display()
                )
            })?;
            Some(Arc::new(log))
        } else {
            None
        };

        // ---- Capture ----
        let capture_handle = counters.register(JobKind::Capture, policy)?;
        let capture = CaptureJob::new(
            &config,
            backend,
            gpio.clone(),
            queue.clone(),
            counters.clone(),
            capture_handle.clone(),
        )?;
        let wake = if config.camera.trigger == "sensor" {
            Trigger::Sensor {
                gpio: gpio.clone(),
                debounce: Duration::from_secs(config.camera.debounce_secs),
            }
        } else {
            Trigger::Timer
        };
        spawn(
            Box::new(capture),
            capture_handle,
            Duration::from_secs(schedule.capture_interval_secs),
            wake,
        );

        // ---- Archive ----
        if let Some(consumer) = archive_consumer {
            let handle = counters.register(JobKind::Archive, policy)?;
            let job = LocalArchiveJob::new(
                &config,
                queue.clone(),
                consumer,
                handle.clone(),
                upload_log.clone(),
            );
            spawn(
                Box::new(job),
                handle,
                Duration::from_secs(schedule.archive_interval_secs),
                Trigger::Timer,
            );
        }

        // ---- Upload ----
        if let (Some(consumer), Some(log)) = (upload_consumer, upload_log.clone()) {
            let store = match store {
                Some(s) => s,
                None => store_from_config(&config.upload)?,
            };
            let handle = counters.register(JobKind::Upload, policy)?;
            let job = RemoteUploadJob::new(
                &config,
                store,
                queue.clone(),
                consumer,
                handle.clone(),
                log,
            );
            spawn(
                Box::new(job),
                handle,
                Duration::from_secs(schedule.upload_interval_secs),
                Trigger::Timer,
            );
        }

        // ---- Control ----
        let device_id = config.device_id().to_string();
        let control_handle = counters.register(JobKind::Control, policy.never_fail())?;
        let mut control = ControlJob::new(
            device_id.clone(),
            counters.clone(),
            queue.clone(),
            commands_tx.clone(),
            control_handle.clone(),
        );
        if let Some(poll) = &config.control.poll {
            control = control.with_poll(PollTransport::new(poll)?);
        }
        let mut hub = None;
        let mut server = None;
        if let Some(push) = &config.control.push {
            let push_hub = Arc::new(PushHub::from_config(&device_id, push, commands_tx.clone())?);
            let listener = tokio::net::TcpListener::bind(&push.bind)
                .await
                .with_context(|| format!("Failed to bind push transport on {}", push.bind))?;
            control = control.with_hub(push_hub.clone());
            server = Some(tokio::spawn(control_push::serve(
                listener,
                push_hub.clone(),
                shutdown.clone(),
            )));
            hub = Some(push_hub);
        }
        spawn(
            Box::new(control),
            control_handle,
            Duration::from_secs(schedule.control_interval_secs),
            Trigger::Timer,
        );
        drop(spawn);
        drop(fatal_tx);
        drop(commands_tx);

        tracing::info!(
            device_id = %device_id,
            jobs = ?mailboxes.keys().map(|k| k.name()).collect::<Vec<_>>(),
            "Service started"
        );
        if let Err(e) = notifier.ready() {
            tracing::warn!(error = %e, "Supervisor READY notification failed");
        }

        // ---- Dispatch loop ----
        let mut watchdog = notifier.ping_interval().map(tokio::time::interval);
        tokio::pin!(shutdown_signal);
        let mut fatal: Option<FatalError> = None;

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                Some(err) = fatal_rx.recv() => {
                    tracing::error!(job = ?err.job, error = %err.message, "Fatal job error, shutting down");
                    fatal = Some(err);
                    break;
                }
                Some(command) = commands_rx.recv() => dispatch(&mailboxes, command),
                Some(joined) = tasks.join_next() => match joined {
                    Ok(kind) => tracing::warn!(job = %kind, "Job task ended"),
                    Err(e) if e.is_panic() => {
                        tracing::error!(error = %e, "Job task panicked, shutting down");
                        fatal = Some(FatalError {
                            job: None,
                            message: format!("job task panicked: {}", e),
                        });
                        break;
                    }
                    Err(_) => {}
                },
                _ = tick(&mut watchdog) => {
                    if let Err(e) = notifier.watchdog() {
                        tracing::warn!(error = %e, "Supervisor watchdog ping failed");
                    }
                    let line = counters.snapshot(&device_id, None).summary_line();
                    let _ = notifier.status(&line);
                }
            }
        }

        // ---- Shutdown sequence ----
        trigger.request();
        if let Some(hub) = &hub {
            hub.close_all().await;
        }
        let grace = Duration::from_secs(schedule.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok(kind) = joined {
                    tracing::debug!(job = %kind, "Job stopped");
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                grace_secs = schedule.shutdown_grace_secs,
                "Jobs did not stop in time, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        if let Some(server) = server {
            match tokio::time::timeout(Duration::from_secs(1), server).await {
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "Push transport stopped with error"),
                Err(_) => tracing::warn!("Push transport did not stop in time"),
                _ => {}
            }
        }

        if let Some(log) = &upload_log {
            match log.flush() {
                Ok(n) => tracing::info!(records = n, "Upload log flushed on shutdown"),
                Err(e) => tracing::error!(error = %e, "Upload log flush failed on shutdown"),
            }
        }
        counters.mark_all_stopped();
        if let Err(e) = notifier.stopping() {
            tracing::warn!(error = %e, "Supervisor STOPPING notification failed");
        }
        tracing::info!("Service stopped");

        if let Some(err) = fatal {
            match err.job {
                Some(job) => bail!("{} job failed fatally: {}", job, err.message),
                None => bail!("{}", err.message),
            }
        }
        Ok(())
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn dispatch(mailboxes: &BTreeMap<JobKind, mpsc::Sender<CommandVerb>>, command: RemoteCommand) {
    for kind in command.target.jobs() {
        let Some(mailbox) = mailboxes.get(&kind) else {
            tracing::warn!(job = %kind, verb = ?command.verb, "Command for a job that is not running");
            continue;
        };
        match mailbox.try_send(command.verb) {
            Ok(()) => tracing::debug!(job = %kind, verb = ?command.verb, "Command dispatched"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(job = %kind, verb = ?command.verb, "Job mailbox full, command dropped")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(job = %kind, verb = ?command.verb, "Job task gone, command dropped")
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Per-job task
// ═══════════════════════════════════════════════════════════════════════

struct JobRunner {
    job: Box<dyn Job>,
    handle: JobHandle,
    nominal: Duration,
    trigger: Trigger,
    mailbox: mpsc::Receiver<CommandVerb>,
    shutdown: Shutdown,
    fatal: mpsc::Sender<FatalError>,
}

impl JobRunner {
    async fn drive(mut self) -> JobKind {
        let kind = self.handle.kind();
        let policy = self.handle.policy();
        let mut due = true;
        let mut forced = false;
        let mut next_at = Instant::now();
        let mut last_run: Option<Instant> = None;

        loop {
            if self.shutdown.is_requested() {
                break;
            }
            let state = self.handle.state();
            let runnable = state.status != JobStatus::Failed && (!state.paused || forced);
            if due && runnable {
                last_run = Some(Instant::now());
                if !self.run_once(kind).await {
                    break;
                }
                next_at = Instant::now()
                    + policy.next_delay(self.interval(), self.handle.consecutive_errors());
            }
            due = false;
            forced = false;

            let scheduled = !self.handle.is_parked();
            tokio::select! {
                _ = self.shutdown.requested() => break,
                verb = self.mailbox.recv() => {
                    let Some(verb) = verb else { break };
                    match verb {
                        CommandVerb::Pause => {
                            self.handle.set_paused(true);
                            tracing::info!(job = %kind, "Job paused");
                        }
                        CommandVerb::Resume => {
                            self.handle.set_paused(false);
                            next_at = Instant::now() + self.interval();
                            tracing::info!(job = %kind, "Job resumed");
                        }
                        CommandVerb::Rearm => {
                            self.handle.rearm();
                            tracing::info!(job = %kind, "Job re-armed");
                            due = true;
                        }
                        CommandVerb::ForceCycle => {
                            if self.handle.status() == JobStatus::Failed {
                                tracing::warn!(job = %kind, "Ignoring forced cycle for failed job, re-arm it first");
                            } else {
                                due = true;
                                forced = true;
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_at), if scheduled && matches!(self.trigger, Trigger::Timer) => {
                    due = true;
                }
                event = wait_sensor(&self.trigger), if scheduled && !matches!(self.trigger, Trigger::Timer) => {
                    match event {
                        Ok(at) => {
                            let debounce = match &self.trigger {
                                Trigger::Sensor { debounce, .. } => *debounce,
                                Trigger::Timer => Duration::ZERO,
                            };
                            if last_run.is_some_and(|t| t.elapsed() < debounce) {
                                tracing::debug!(job = %kind, "Trigger inside debounce period, ignored");
                            } else {
                                tracing::debug!(job = %kind, at = %at, "Sensor triggered");
                                due = true;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(job = %kind, error = %e, "Sensor read failed");
                            self.handle.record_failure(&e);
                            let backoff = policy.next_delay(self.nominal, self.handle.consecutive_errors());
                            tokio::select! {
                                _ = self.shutdown.requested() => break,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                        }
                    }
                }
            }
        }
        kind
    }

    fn interval(&self) -> Duration {
        self.job.interval_hint().unwrap_or(self.nominal)
    }

    /// One cycle, folded into the job state. `false` stops the task.
    async fn run_once(&mut self, kind: JobKind) -> bool {
        self.handle.begin_cycle();
        match self.job.run_cycle(&self.shutdown).await {
            Ok(()) => {
                self.handle.record_success();
                true
            }
            Err(Error::Cancelled) => {
                self.handle.record_interrupted();
                tracing::info!(job = %kind, "Cycle interrupted by shutdown");
                false
            }
            Err(e) if e.is_fatal() => {
                self.handle.record_failure(&e);
                let _ = self
                    .fatal
                    .send(FatalError {
                        job: Some(kind),
                        message: e.to_string(),
                    })
                    .await;
                false
            }
            Err(e) => {
                let status = self.handle.record_failure(&e);
                if status == JobStatus::Failed {
                    tracing::error!(
                        job = %kind,
                        error = %e,
                        consecutive = self.handle.consecutive_errors(),
                        "Job failed, parked until re-armed"
                    );
                } else {
                    tracing::warn!(job = %kind, error = %e, kind = e.kind(), "Cycle failed");
                }
                true
            }
        }
    }
}

async fn wait_sensor(trigger: &Trigger) -> crate::error::Result<chrono::DateTime<chrono::Utc>> {
    match trigger {
        Trigger::Sensor { gpio, .. } => gpio.wait_trigger().await.map(|ev| ev.at),
        Trigger::Timer => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommandTarget, Transport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingJob {
        kind: JobKind,
        runs: Arc<AtomicU32>,
        fail: bool,
        hint: Option<Duration>,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn kind(&self) -> JobKind {
            self.kind
        }

        async fn run_cycle(&mut self, _shutdown: &Shutdown) -> crate::error::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Upload("remote down".into()))
            } else {
                Ok(())
            }
        }

        fn interval_hint(&self) -> Option<Duration> {
            self.hint
        }
    }

    struct Harness {
        runs: Arc<AtomicU32>,
        handle: JobHandle,
        mailbox: mpsc::Sender<CommandVerb>,
        trigger: shutdown::ShutdownTrigger,
        task: tokio::task::JoinHandle<JobKind>,
    }

    fn start(fail: bool, policy: RetryPolicy, nominal: Duration) -> Harness {
        start_with_hint(fail, policy, nominal, None)
    }

    fn start_with_hint(
        fail: bool,
        policy: RetryPolicy,
        nominal: Duration,
        hint: Option<Duration>,
    ) -> Harness {
        let counters = EventCounters::new();
        let handle = counters.register(JobKind::Upload, policy).unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (trigger, shutdown) = shutdown::channel();
        let (fatal, _fatal_rx) = mpsc::channel(1);
        let runner = JobRunner {
            job: Box::new(CountingJob {
                kind: JobKind::Upload,
                runs: runs.clone(),
                fail,
                hint,
            }),
            handle: handle.clone(),
            nominal,
            trigger: Trigger::Timer,
            mailbox: rx,
            shutdown,
            fatal,
        };
        Harness {
            runs,
            handle,
            mailbox: tx,
            trigger,
            task: tokio::spawn(runner.drive()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_immediate_then_periodic() {
        let h = start(false, RetryPolicy::default(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.runs.load(Ordering::SeqCst), 2);
        h.trigger.request();
        assert_eq!(h.task.await.unwrap(), JobKind::Upload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_hint_overrides_nominal() {
        let h = start_with_hint(
            false,
            RetryPolicy::default(),
            Duration::from_secs(60),
            Some(Duration::from_secs(5)),
        );
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.runs.load(Ordering::SeqCst), 3);
        h.trigger.request();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_park_job_until_rearm() {
        let policy = RetryPolicy::new(2, 2.0, Duration::from_secs(600));
        let h = start(true, policy, Duration::from_secs(10));
        // Run at t=0, fail; next after 20s; fail again -> Failed.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(h.runs.load(Ordering::SeqCst), 2);
        assert_eq!(h.handle.status(), JobStatus::Failed);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(h.runs.load(Ordering::SeqCst), 2);

        h.mailbox.send(CommandVerb::ForceCycle).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.runs.load(Ordering::SeqCst), 2);

        h.mailbox.send(CommandVerb::Rearm).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.runs.load(Ordering::SeqCst), 3);
        assert_eq!(h.handle.status(), JobStatus::Degraded);
        h.trigger.request();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_and_force() {
        let h = start(false, RetryPolicy::default(), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.mailbox.send(CommandVerb::Pause).await.unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(h.runs.load(Ordering::SeqCst), 1);
        assert!(h.handle.state().paused);

        h.mailbox.send(CommandVerb::ForceCycle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.runs.load(Ordering::SeqCst), 2);

        h.mailbox.send(CommandVerb::Resume).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.runs.load(Ordering::SeqCst), 3);
        h.trigger.request();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_and_drops_when_full() {
        let mut mailboxes = BTreeMap::new();
        let (cap_tx, mut cap_rx) = mpsc::channel(1);
        let (up_tx, mut up_rx) = mpsc::channel(1);
        mailboxes.insert(JobKind::Capture, cap_tx);
        mailboxes.insert(JobKind::Upload, up_tx);

        let all = RemoteCommand::parse("all/pause", Transport::Poll).unwrap();
        assert_eq!(all.target, CommandTarget::All);
        dispatch(&mailboxes, all.clone());
        dispatch(&mailboxes, all);
        assert_eq!(cap_rx.try_recv().unwrap(), CommandVerb::Pause);
        assert_eq!(up_rx.try_recv().unwrap(), CommandVerb::Pause);
        assert!(cap_rx.try_recv().is_err());
    }
}
