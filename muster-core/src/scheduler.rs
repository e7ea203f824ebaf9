//! Per-server sync job scheduling.
//!
//! Every registered fleet server gets one limited and one expanded job,
//! driven by its stored cron expressions. The whole job set is torn down
//! and rebuilt whenever the registry changes; nothing is persisted across
//! rebuilds or restarts.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sync::{SyncKind, SyncOutcome};
use crate::types::{FleetServer, ServerId};

/// Executes one sync pass for one server. The scheduler stays agnostic of
/// what a pass does, which keeps it testable without stores or networks.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_limited(&self, server: &FleetServer) -> SyncOutcome;
    async fn run_expanded(&self, server: &FleetServer) -> SyncOutcome;
}

/// A server whose jobs could not be scheduled. The rebuild itself still
/// succeeds; the bad expression only costs that server its pair.
#[derive(Debug, Clone)]
pub struct SkippedSchedule {
    pub server_id: ServerId,
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    pub scheduled: Vec<ServerId>,
    pub skipped: Vec<SkippedSchedule>,
}

struct ServerJobs {
    server_id: ServerId,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct SyncScheduler {
    runner: Arc<dyn JobRunner>,
    jobs: Mutex<Vec<ServerJobs>>,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler").finish_non_exhaustive()
    }
}

/// Parse a schedule in classic five-field cron form. The parser underneath
/// wants a seconds field, so five-field expressions gain a leading `0`.
pub(crate) fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        Schedule::from_str(&format!("0 {trimmed}"))
    } else {
        Schedule::from_str(trimmed)
    }
}

impl SyncScheduler {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            runner,
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Cancel every scheduled job and recreate the set from the given
    /// server list. Safe to call any number of times; with an unchanged
    /// list the result is exactly one job pair per server.
    ///
    /// A server with an unparseable expression is skipped whole (both jobs)
    /// and reported; the other servers still get their pairs.
    pub async fn rebuild(&self, servers: &[FleetServer]) -> RebuildReport {
        let mut jobs = self.jobs.lock().await;
        for job in jobs.drain(..) {
            job.cancel.cancel();
        }

        let mut report = RebuildReport::default();
        for server in servers {
            let limited = match parse_cron(&server.cron_limited) {
                Ok(s) => s,
                Err(e) => {
                    warn!(
                        target: "schedule",
                        server_id = server.id,
                        expr = %server.cron_limited,
                        error = %e,
                        "invalid limited sync expression, skipping server"
                    );
                    report.skipped.push(SkippedSchedule {
                        server_id: server.id,
                        url: server.url.clone(),
                        reason: format!("cron_limited: {e}"),
                    });
                    continue;
                }
            };
            let expanded = match parse_cron(&server.cron_expanded) {
                Ok(s) => s,
                Err(e) => {
                    warn!(
                        target: "schedule",
                        server_id = server.id,
                        expr = %server.cron_expanded,
                        error = %e,
                        "invalid expanded sync expression, skipping server"
                    );
                    report.skipped.push(SkippedSchedule {
                        server_id: server.id,
                        url: server.url.clone(),
                        reason: format!("cron_expanded: {e}"),
                    });
                    continue;
                }
            };

            let cancel = CancellationToken::new();
            let handles = vec![
                self.spawn_job(server.clone(), SyncKind::Limited, limited, cancel.clone()),
                self.spawn_job(server.clone(), SyncKind::Expanded, expanded, cancel.clone()),
            ];
            jobs.push(ServerJobs {
                server_id: server.id,
                cancel,
                handles,
            });
            report.scheduled.push(server.id);
        }

        info!(
            target: "schedule",
            scheduled = report.scheduled.len(),
            skipped = report.skipped.len(),
            "schedule rebuilt"
        );
        report
    }

    fn spawn_job(
        &self,
        server: FleetServer,
        kind: SyncKind,
        schedule: Schedule,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let runner = self.runner.clone();
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!(
                        target: "schedule",
                        server_id = server.id,
                        %kind,
                        "schedule yields no further runs"
                    );
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();

                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(target: "schedule", server_id = server.id, %kind, "job cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {
                        let outcome = match kind {
                            SyncKind::Limited => runner.run_limited(&server).await,
                            SyncKind::Expanded => runner.run_expanded(&server).await,
                        };
                        if outcome.failures.is_empty() {
                            debug!(
                                target: "schedule",
                                server_id = server.id,
                                %kind,
                                synced = outcome.synced,
                                "scheduled sync finished"
                            );
                        } else {
                            warn!(
                                target: "schedule",
                                server_id = server.id,
                                %kind,
                                synced = outcome.synced,
                                failures = outcome.failures.len(),
                                "scheduled sync finished with failures"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Run one limited pass immediately, outside the schedule.
    pub async fn run_limited_now(&self, server: &FleetServer) -> SyncOutcome {
        self.runner.run_limited(server).await
    }

    /// Run one expanded pass immediately, outside the schedule.
    pub async fn run_expanded_now(&self, server: &FleetServer) -> SyncOutcome {
        self.runner.run_expanded(server).await
    }

    pub async fn scheduled_servers(&self) -> Vec<ServerId> {
        self.jobs.lock().await.iter().map(|j| j.server_id).collect()
    }

    /// Cancel all jobs and wait for their tasks to finish. An in-flight
    /// pass is allowed to complete.
    pub async fn shutdown(&self) {
        let mut jobs = self.jobs.lock().await;
        for job in jobs.iter() {
            job.cancel.cancel();
        }
        for job in jobs.drain(..) {
            for handle in job.handles {
                let _ = handle.await;
            }
        }
    }
}
