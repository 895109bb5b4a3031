use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use ops_core::error::SchedulerError;
use ops_core::job::{JobResult, JobStatus, Trigger};
use ops_core::notify::{send_logged, Notifier};

/// Boxed future returned by a job handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<JobResult>> + Send + 'static>>;

/// Work performed when a job fires. Any `Fn() -> impl Future<Output = anyhow::Result<JobResult>>` qualifies.
pub trait Handler: Send + Sync {
    fn call(&self) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JobResult>> + Send + 'static,
{
    fn call(&self) -> HandlerFuture {
        Box::pin(self())
    }
}

/// Wall clock used to decide when jobs are due.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local time of the host.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Cloneable handle that asks the loop to stop at its next tick boundary.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Set the shutdown flag. Returns `true` only for the call that set it.
    pub fn stop(&self) -> bool {
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

struct Job {
    name: String,
    trigger: Trigger,
    handler: Box<dyn Handler>,
    next_run: NaiveDateTime,
    runs: u64,
    failures: u64,
}

/// Read-only view of a registered job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub name: String,
    pub trigger: Trigger,
    pub next_run: NaiveDateTime,
    pub runs: u64,
    pub failures: u64,
}

/// Cooperative scheduler: one loop, jobs run one after another in registration order.
pub struct Scheduler {
    jobs: Vec<Job>,
    tick: Duration,
    clock: Arc<dyn Clock>,
    notifier: Option<Arc<dyn Notifier>>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            tick,
            clock: Arc::new(SystemClock),
            notifier: None,
            stop_tx: Arc::new(tx),
            stop_rx: rx,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Forward failed and warning results that were not announced by their handler.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Add a job. Names are unique; the trigger is validated here.
    pub fn register<H>(&mut self, name: impl Into<String>, trigger: Trigger, handler: H) -> Result<(), SchedulerError>
    where
        H: Handler + 'static,
    {
        let name = name.into();
        if self.jobs.iter().any(|j| j.name == name) {
            return Err(SchedulerError::DuplicateJob(name));
        }
        trigger.validate()?;
        let next_run = trigger.next_after(self.clock.now());
        info!(job = %name, %trigger, next_run = %next_run, "job registered");
        self.jobs.push(Job { name, trigger, handler: Box::new(handler), next_run, runs: 0, failures: 0 });
        Ok(())
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.jobs
            .iter()
            .map(|j| JobInfo {
                name: j.name.clone(),
                trigger: j.trigger,
                next_run: j.next_run,
                runs: j.runs,
                failures: j.failures,
            })
            .collect()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { tx: Arc::clone(&self.stop_tx) }
    }

    /// Request shutdown. An executing job is not interrupted; the loop exits at
    /// the first tick boundary after it returns.
    pub fn stop(&self) -> bool {
        self.stop_handle().stop()
    }

    /// Run one job immediately, outside the loop. `None` if the name is unknown.
    pub async fn run_now(&mut self, name: &str) -> Option<JobResult> {
        let idx = self.jobs.iter().position(|j| j.name == name)?;
        Some(self.execute(idx).await)
    }

    /// Tick until stopped. Handler failures never end the loop.
    pub async fn run(&mut self) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        ticker.tick().await;
        let mut stop = self.stop_rx.clone();
        let stop_check = self.stop_rx.clone();
        info!(jobs = self.jobs.len(), tick_s = self.tick.as_secs(), "scheduler loop started");

        loop {
            tokio::select! {
                biased;
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => {
                    info!("shutdown requested, exiting at the next tick");
                    ticker.tick().await;
                    break;
                }
                _ = ticker.tick() => self.run_due(&stop_check).await,
            }
        }
        info!("scheduler stopping");
    }

    async fn run_due(&mut self, stop: &watch::Receiver<bool>) {
        let now = self.clock.now();
        for idx in 0..self.jobs.len() {
            if self.jobs[idx].next_run > now {
                continue;
            }
            if *stop.borrow() {
                info!(job = %self.jobs[idx].name, "shutdown requested, not starting due job");
                break;
            }
            self.execute(idx).await;
        }
    }

    async fn execute(&mut self, idx: usize) -> JobResult {
        let started = self.clock.now();
        let name = self.jobs[idx].name.clone();
        info!(job = %name, "job started");

        let fut = self.jobs[idx].handler.call();
        let result = match tokio::spawn(fut).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => JobResult::error(format!("{e:#}")),
            Err(e) if e.is_panic() => JobResult::error(format!("handler panicked: {}", panic_message(e.into_panic()))),
            Err(e) => JobResult::error(e),
        };

        let job = &mut self.jobs[idx];
        job.next_run = job.trigger.next_after(started);
        job.runs += 1;
        if result.status == JobStatus::Error {
            job.failures += 1;
        }
        let next_run = job.next_run;

        match result.status {
            JobStatus::Ok => info!(job = %name, next_run = %next_run, "job ok: {}", result.summary()),
            JobStatus::Warning => warn!(job = %name, next_run = %next_run, "job warning: {}", result.summary()),
            JobStatus::Error => error!(job = %name, next_run = %next_run, "job error: {}", result.summary()),
        }

        if result.status != JobStatus::Ok && !result.was_alerted() {
            if let Some(n) = &self.notifier {
                let msg = format!("[job {}] {}: {}", name, result.status, result.summary());
                send_logged(n.as_ref(), &msg).await;
            }
        }
        result
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
