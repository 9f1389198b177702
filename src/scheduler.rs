//! Daily trigger with a run-in-progress guard.
//!
//! A trigger that fires while a run is still active is dropped, never queued:
//! the browser session and the day's download directory belong to one run at
//! a time.

use async_trait::async_trait;
use chrono::{Days, Local, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    async fn run(&self);
}

/// Tracks whether a run is active.
#[derive(Clone, Default)]
pub struct RunGuard {
    active: Arc<AtomicBool>,
}

/// Held for the lifetime of one run; releases the guard on drop.
pub struct RunPermit {
    active: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn try_acquire(&self) -> Option<RunPermit> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit {
                active: Arc::clone(&self.active),
            })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

pub enum Trigger {
    Started(JoinHandle<()>),
    Skipped,
}

/// First time strictly after `now` whose wall-clock time is `at`.
pub fn next_fire(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        (now.date() + Days::new(1)).and_time(at)
    }
}

pub struct Scheduler<J: ScheduledJob> {
    job: Arc<J>,
    run_at: NaiveTime,
    guard: RunGuard,
}

impl<J: ScheduledJob> Scheduler<J> {
    pub fn new(job: Arc<J>, run_at: NaiveTime) -> Self {
        Self {
            job,
            run_at,
            guard: RunGuard::default(),
        }
    }

    pub fn guard(&self) -> &RunGuard {
        &self.guard
    }

    /// Start a run unless one is already active.
    pub fn trigger(&self) -> Trigger {
        let Some(permit) = self.guard.try_acquire() else {
            warn!("Previous run still in progress; skipping this trigger");
            return Trigger::Skipped;
        };

        let job = Arc::clone(&self.job);
        Trigger::Started(tokio::spawn(async move {
            let _permit = permit;
            job.run().await;
        }))
    }

    /// Fire once per day at `run_at` local time, forever.
    pub async fn run_forever(&self) {
        info!("Waiting for {} to run the daily digest", self.run_at.format("%H:%M"));

        loop {
            let now = Local::now().naive_local();
            let fire_at = next_fire(now, self.run_at);
            let wait = (fire_at - now).to_std().unwrap_or_default();
            info!("Next run at {}", fire_at);

            tokio::time::sleep(wait).await;
            self.trigger();
        }
    }
}
