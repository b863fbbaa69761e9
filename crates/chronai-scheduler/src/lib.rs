//! chronai-scheduler: job registry and trigger loops.
//!
//! Maintains a one-to-one mapping from enabled task to a running trigger
//! loop. Every firing spawns the execution runner as a detached task, so
//! executions of the same job may overlap; each writes its own outcome
//! record and shares no mutable state.

mod runner;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use chronai_openai::ChatClient;
use chronai_security::CredentialCipher;
use chronai_store::TaskStore;
use chronai_types::{ScheduleType, Task};

/// Shared dependencies handed to every execution.
pub(crate) struct ExecutionEnv {
    pub store: TaskStore,
    pub client: ChatClient,
    pub cipher: CredentialCipher,
}

/// Concrete firing rule derived from a task's schedule fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Interval { period: Duration },
    Daily { hour: u32, minute: u32 },
}

impl Trigger {
    /// Tasks reaching the registry are validated upstream, so an
    /// inconsistent schedule here is defensive-only: log and yield nothing.
    fn from_task(task: &Task) -> Option<Trigger> {
        match task.schedule_type {
            ScheduleType::Interval => {
                let secs = task.interval_period_secs().unwrap_or(0);
                if secs == 0 {
                    error!("Task {} has a zero-length interval, not registering", task.id);
                    return None;
                }
                Some(Trigger::Interval {
                    period: Duration::from_secs(secs),
                })
            }
            ScheduleType::FixedTime => match task.fixed_time_parts() {
                Some((hour, minute)) => Some(Trigger::Daily { hour, minute }),
                None => {
                    error!("Task {} has an invalid fixed_time, not registering", task.id);
                    None
                }
            },
        }
    }

    fn describe(&self) -> String {
        match self {
            Trigger::Interval { period } => {
                let secs = period.as_secs();
                let (mins, secs) = (secs / 60, secs % 60);
                if mins > 0 && secs > 0 {
                    format!("every {mins}m {secs}s")
                } else if mins > 0 {
                    format!("every {mins} minutes")
                } else {
                    format!("every {secs} seconds")
                }
            }
            Trigger::Daily { hour, minute } => format!("daily at {hour:02}:{minute:02}"),
        }
    }
}

fn job_id(task_id: i64) -> String {
    format!("task_{task_id}")
}

/// The scheduler component. Owned by the composition root; the gateway
/// calls in on task create/update/delete.
pub struct Scheduler {
    env: Arc<ExecutionEnv>,
    jobs: Mutex<HashMap<String, AbortHandle>>,
    executions: TaskTracker,
}

impl Scheduler {
    pub fn new(store: TaskStore, client: ChatClient, cipher: CredentialCipher) -> Self {
        Self {
            env: Arc::new(ExecutionEnv {
                store,
                client,
                cipher,
            }),
            jobs: Mutex::new(HashMap::new()),
            executions: TaskTracker::new(),
        }
    }

    /// Load every enabled task from the store and register each one.
    /// Individual registration failures do not abort the batch; the task
    /// rows stay authoritative and re-register on the next startup.
    pub async fn start(&self) -> anyhow::Result<usize> {
        let tasks = self.env.store.list_enabled_tasks().await?;
        let mut registered = 0;
        for task in &tasks {
            if self.register_or_replace(task).await {
                registered += 1;
            }
        }
        info!("Registered {registered} enabled tasks");
        Ok(registered)
    }

    /// Remove-then-add registration. Returns whether the task has an
    /// active job afterwards (false for disabled tasks and inconsistent
    /// schedules).
    pub async fn register_or_replace(&self, task: &Task) -> bool {
        let id = job_id(task.id);
        let mut jobs = self.jobs.lock().await;

        // Replace semantics: a prior job for this id is removed first.
        // Its absence is not an error.
        if let Some(handle) = jobs.remove(&id) {
            handle.abort();
        }

        if !task.enabled {
            debug!("Task {} is disabled, skipping registration", task.id);
            return false;
        }

        let Some(trigger) = Trigger::from_task(task) else {
            return false;
        };

        info!(
            "Registered task {} ({}): {}",
            task.id,
            task.name,
            trigger.describe()
        );

        let handle = tokio::spawn(trigger_loop(
            trigger,
            task.id,
            self.env.clone(),
            self.executions.clone(),
        ));
        jobs.insert(id, handle.abort_handle());
        true
    }

    /// Remove the job for a task. Absence is not an error; the result says
    /// whether a job was actually found.
    pub async fn unregister(&self, task_id: i64) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.remove(&job_id(task_id)) {
            Some(handle) => {
                handle.abort();
                info!("Removed task {task_id} from scheduler");
                true
            }
            None => {
                debug!("Task {task_id} not found in scheduler");
                false
            }
        }
    }

    /// Post-create/post-update hook: re-register the trigger and, for
    /// enabled interval tasks only, fire once right away instead of
    /// waiting a full period. Fixed-time tasks only ever fire at their
    /// configured daily time.
    pub async fn notify_saved(&self, task: &Task) {
        self.register_or_replace(task).await;

        if task.enabled && task.schedule_type == ScheduleType::Interval {
            self.spawn_immediate(task);
        }
    }

    /// Fire one out-of-band execution, detached from the caller. The
    /// request that triggered it never waits on the result; the runner
    /// logs failures internally.
    fn spawn_immediate(&self, task: &Task) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(
                "No runtime running, cannot immediately execute task {}",
                task.id
            );
            return;
        }

        info!("[IMMEDIATE] Executing interval task {} ({})", task.id, task.name);
        let env = self.env.clone();
        let task_id = task.id;
        self.executions.spawn(async move {
            runner::execute(&env, task_id).await;
        });
    }

    /// Number of currently registered jobs.
    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Whether a task currently has an active job.
    pub async fn has_job(&self, task_id: i64) -> bool {
        self.jobs.lock().await.contains_key(&job_id(task_id))
    }

    /// Stop all trigger loops. In-flight executions are tracked but not
    /// awaited; this is a best-effort drain.
    pub async fn shutdown(&self) {
        let mut jobs = self.jobs.lock().await;
        for (_, handle) in jobs.drain() {
            handle.abort();
        }
        drop(jobs);

        self.executions.close();
        let in_flight = self.executions.len();
        if in_flight > 0 {
            info!("Scheduler shutdown with {in_flight} execution(s) still in flight");
        }
        info!("Scheduler shutdown complete");
    }
}

/// One job's trigger loop. Interval jobs fire one full period after
/// registration; missed ticks collapse into a single late firing. Each
/// firing runs detached, so a slow execution never delays the next tick.
async fn trigger_loop(
    trigger: Trigger,
    task_id: i64,
    env: Arc<ExecutionEnv>,
    executions: TaskTracker,
) {
    match trigger {
        Trigger::Interval { period } => {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                spawn_execution(&executions, env.clone(), task_id);
            }
        }
        Trigger::Daily { hour, minute } => loop {
            tokio::time::sleep(until_next_daily(hour, minute)).await;
            spawn_execution(&executions, env.clone(), task_id);
        },
    }
}

fn spawn_execution(executions: &TaskTracker, env: Arc<ExecutionEnv>, task_id: i64) {
    executions.spawn(async move {
        runner::execute(&env, task_id).await;
    });
}

/// Time until the next local-time occurrence of `hour:minute`.
fn until_next_daily(hour: u32, minute: u32) -> Duration {
    let now = chrono::Local::now().naive_local();
    let target_time = chrono::NaiveTime::from_hms_opt(hour, minute, 0)
        .unwrap_or(chrono::NaiveTime::MIN);
    let mut target = now.date().and_time(target_time);
    if target <= now {
        target += chrono::Duration::days(1);
    }
    (target - now).to_std().unwrap_or(Duration::ZERO)
}
