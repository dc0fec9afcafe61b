//! Job Scheduler - periodic sweeper for reminders and auto-expiry

use std::sync::Arc;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{ExpirySweepJob, ReminderSweepJob};
use crate::config::SweeperConfig;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

/// One scheduler instance per exception service. Both sweeps share a tick
/// but run in separate transactions; a sweep failure is logged and retried
/// on the next tick, never halting the loop.
pub struct JobScheduler {
    scheduler: TokioScheduler,
    reminders: Arc<ReminderSweepJob>,
    expiry: Arc<ExpirySweepJob>,
    config: SweeperConfig,
    shutdown: CancellationToken,
}

impl JobScheduler {
    pub async fn new(
        reminders: Arc<ReminderSweepJob>,
        expiry: Arc<ExpirySweepJob>,
        config: SweeperConfig,
        shutdown: CancellationToken,
    ) -> JobResult<Self> {
        if config.interval_minutes == 0 || config.interval_minutes > 59 {
            return Err(JobError::ConfigError(format!(
                "sweep interval must be within 1..=59 minutes, got {}",
                config.interval_minutes
            )));
        }
        let scheduler = TokioScheduler::new().await?;
        Ok(Self {
            scheduler,
            reminders,
            expiry,
            config,
            shutdown,
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting exception sweeper");

        let cron_expr = format!("0 */{} * * * *", self.config.interval_minutes);
        let reminders = self.reminders.clone();
        let expiry = self.expiry.clone();
        let shutdown = self.shutdown.clone();
        let tick_timeout = std::time::Duration::from_secs(self.config.tick_timeout_secs);

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let reminders = reminders.clone();
            let expiry = expiry.clone();
            let shutdown = shutdown.clone();

            Box::pin(async move {
                if shutdown.is_cancelled() {
                    return;
                }
                run_tick(&reminders, &expiry, tick_timeout).await;
            })
        })?;

        self.scheduler.add(job).await?;
        self.scheduler.start().await?;

        info!(
            "Exception sweeper running every {} minutes",
            self.config.interval_minutes
        );
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down exception sweeper");
        self.shutdown.cancel();
        self.scheduler.shutdown().await?;
        Ok(())
    }
}

/// One sweep tick under its own bounded timeout, independent of the parent.
pub async fn run_tick(
    reminders: &ReminderSweepJob,
    expiry: &ExpirySweepJob,
    timeout: std::time::Duration,
) {
    let tick = async {
        match reminders.run().await {
            Ok(result) if !result.errors.is_empty() => {
                warn!(errors = ?result.errors, "reminder sweep finished with errors");
            }
            Ok(_) => {}
            Err(e) => error!("reminder sweep failed: {}", e),
        }
        match expiry.run().await {
            Ok(_) => {}
            Err(e) => error!("expiry sweep failed: {}", e),
        }
    };

    if tokio::time::timeout(timeout, tick).await.is_err() {
        warn!(
            "sweep tick exceeded {}s, abandoned until next tick",
            timeout.as_secs()
        );
    }
}
