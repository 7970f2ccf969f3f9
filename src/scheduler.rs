//! Periodic background tasks driven by cron expressions.
//!
//! Each scheduled task runs at most once at a time: a tick that fires while
//! the previous run is still active is skipped and logged.

use std::fmt::Display;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::error::SchedulingSetupError;

/// Parse a cron expression (seconds field first) and make sure it fires.
pub fn parse_schedule(name: &str, expr: &str) -> Result<Schedule, SchedulingSetupError> {
    let schedule = Schedule::from_str(expr).map_err(|e| SchedulingSetupError::InvalidSchedule {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    if schedule.upcoming(Utc).next().is_none() {
        return Err(SchedulingSetupError::NeverFires {
            name: name.to_string(),
        });
    }
    Ok(schedule)
}

/// Single-slot execution guard.
#[derive(Clone, Default)]
struct SingleSlot {
    lock: Arc<Mutex<()>>,
}

impl SingleSlot {
    fn try_start(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.lock).try_lock_owned().ok()
    }
}

/// Run `task` on every tick of `expr` until the handle is aborted.
///
/// Task errors are logged and never stop the schedule. Setup failures are
/// returned to the caller, who is expected to treat them as fatal.
pub fn spawn_cron<F, Fut, E>(
    name: &str,
    expr: &str,
    task: F,
) -> Result<JoinHandle<()>, SchedulingSetupError>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let schedule = parse_schedule(name, expr)?;
    let name = name.to_string();
    let task = Arc::new(task);
    let slot = SingleSlot::default();

    tracing::info!(task = %name, schedule = %expr, "Scheduled periodic task");

    Ok(tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                tracing::warn!(task = %name, "Schedule has no further fire times");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            let Some(guard) = slot.try_start() else {
                tracing::warn!(task = %name, "Previous run still active, skipping tick");
                continue;
            };

            let task = Arc::clone(&task);
            let name = name.clone();
            tokio::spawn(async move {
                let _guard = guard;
                tracing::debug!(task = %name, "Running scheduled task");
                if let Err(e) = task().await {
                    tracing::error!(task = %name, error = %e, "Scheduled task failed");
                }
            });
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn invalid_expression_is_setup_error() {
        let err = parse_schedule("health", "every five minutes").unwrap_err();
        assert!(matches!(err, SchedulingSetupError::InvalidSchedule { ref name, .. } if name == "health"));
    }

    #[test]
    fn past_only_schedule_never_fires() {
        let err = parse_schedule("once", "0 0 0 1 1 * 2000").unwrap_err();
        assert!(matches!(err, SchedulingSetupError::NeverFires { .. }));
    }

    #[test]
    fn standard_schedules_parse() {
        parse_schedule("health", "0 */5 * * * *").unwrap();
        parse_schedule("weekday", "0 0 9 * * MON-FRI").unwrap();
    }

    #[tokio::test]
    async fn single_slot_rejects_overlap() {
        let slot = SingleSlot::default();
        let first = slot.try_start().unwrap();
        assert!(slot.try_start().is_none());
        drop(first);
        assert!(slot.try_start().is_some());
    }

    #[tokio::test]
    async fn spawn_cron_rejects_bad_expression() {
        let result = spawn_cron("bad", "not cron", || async { Ok::<(), String>(()) });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn every_second_schedule_runs_task() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = spawn_cron("tick", "* * * * * *", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("task errors are only logged")
            }
        })
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while runs.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("scheduled task did not run twice");
        handle.abort();
    }
}
