//! Members / history collection over one or more targets.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::checkpoint::FileResumeStore;
use crate::engine::pipeline::{CollectionPipeline, Job, RunReport};
use crate::error::{Error, Result};
use crate::sink::CsvSink;
use crate::target::Target;

use super::open_session;

/// What the user asked to collect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectRequest {
    pub targets: Vec<String>,
    pub members: bool,
    pub chats: bool,
    pub crawl_invites: bool,
    /// Drop saved progress before running.
    pub fresh: bool,
}

impl CollectRequest {
    /// Jobs to run per target, members first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        if self.members {
            jobs.push(Job::Members);
        }
        if self.chats || self.crawl_invites {
            jobs.push(Job::History {
                save_messages: self.chats,
                crawl_invites: self.crawl_invites,
            });
        }
        jobs
    }
}

/// Run every job for every target. References are resolved first and
/// aliases of one chat collapse into a single run, so each (target, job)
/// key has exactly one pipeline. Targets run concurrently; jobs for one
/// target run in order.
pub async fn run_targets(pipeline: &CollectionPipeline, request: &CollectRequest) -> Vec<RunReport> {
    let jobs = request.jobs();
    if jobs.is_empty() {
        return Vec::new();
    }

    let resolved = join_all(request.targets.iter().map(|raw| pipeline.resolve(raw))).await;

    let mut reports = Vec::new();
    let mut unique: Vec<Target> = Vec::new();
    for (raw, result) in request.targets.iter().zip(resolved) {
        match result {
            Ok(target) => {
                if let Some(first) = unique.iter().find(|t| t.key() == target.key()) {
                    info!(
                        reference = raw.as_str(),
                        target_key = %target.key(),
                        first = first.reference(),
                        "reference names an already requested target, collecting once"
                    );
                } else {
                    unique.push(target);
                }
            }
            Err(err) => {
                warn!(reference = raw.as_str(), error = %err, "could not resolve target");
                reports.push(RunReport::failed(raw, jobs[0], err));
            }
        }
    }

    let runs = unique
        .iter()
        .map(|target| run_target(pipeline, target, &jobs, request.fresh));
    reports.extend(join_all(runs).await.into_iter().flatten());
    reports
}

async fn run_target(
    pipeline: &CollectionPipeline,
    target: &Target,
    jobs: &[Job],
    fresh: bool,
) -> Vec<RunReport> {
    let mut reports = Vec::with_capacity(jobs.len());
    for &job in jobs {
        if fresh {
            if let Err(err) = pipeline.reset(target, job) {
                reports.push(RunReport::failed(target.reference(), job, err));
                continue;
            }
            info!(target_key = %target.key(), job = %job.key(), "checkpoint cleared");
        }

        let report = pipeline.run_resolved(target, job).await;
        let cancelled = matches!(report.error(), Some(Error::Cancelled));
        reports.push(report);
        if cancelled {
            break;
        }
    }
    reports
}

/// 130 if anything was cancelled, 1 if anything failed, else 0.
pub fn exit_code(reports: &[RunReport]) -> i32 {
    if reports
        .iter()
        .any(|r| matches!(r.error(), Some(Error::Cancelled)))
    {
        130
    } else if reports.iter().any(|r| !r.is_done()) {
        1
    } else {
        0
    }
}

/// One line per run, plus a hint line under failures.
pub fn summary_lines(reports: &[RunReport]) -> Vec<String> {
    let mut lines = Vec::new();
    for report in reports {
        match report.error() {
            None => {
                let mut line = format!(
                    "OK    {} [{}] {} rows",
                    report.target,
                    report.job.key(),
                    report.rows_written
                );
                if report.invite_links_written > 0 {
                    line.push_str(&format!(", {} invite links", report.invite_links_written));
                }
                if report.duplicates > 0 {
                    line.push_str(&format!(", {} duplicates dropped", report.duplicates));
                }
                if report.malformed > 0 {
                    line.push_str(&format!(", {} malformed skipped", report.malformed));
                }
                if report.resumed {
                    line.push_str(" (resumed)");
                }
                lines.push(line);
            }
            Some(err) => {
                let kind = err.failure_kind();
                lines.push(format!(
                    "FAIL  {} [{}] {}: {}",
                    report.target,
                    report.job.key(),
                    kind.label(),
                    err
                ));
                if report.rows_written + report.invite_links_written > 0 {
                    lines.push(format!(
                        "      kept {} rows written before the failure",
                        report.rows_written + report.invite_links_written
                    ));
                }
                lines.push(format!("      hint: {}", kind.hint()));
            }
        }
    }
    lines
}

pub fn print_summary(reports: &[RunReport]) {
    println!("\nSummary:");
    for line in summary_lines(reports) {
        println!("{}", line);
    }
}

/// Connect, run every target and print the summary. Returns the exit code.
pub async fn run(
    config: &Config,
    request: &CollectRequest,
    proxy: Option<&str>,
    cancel: CancellationToken,
) -> Result<i32> {
    let store = Arc::new(FileResumeStore::open(&config.checkpoint_dir)?);
    let sink = Arc::new(CsvSink::new(&config.output_dir));
    let session = open_session(config, proxy, &cancel).await?;

    let pipeline = CollectionPipeline::new(
        session.client.clone(),
        session.limiter.clone(),
        store,
        sink.clone(),
        config.collector.clone(),
        cancel,
    );

    let reports = run_targets(&pipeline, request).await;
    print_summary(&reports);
    for (path, rows) in sink.written_files() {
        println!("  {} ({} rows)", path.display(), rows);
    }
    Ok(exit_code(&reports))
}
