//! Job store & scheduler (C12): background prompts that outlive a single
//! poll tick.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::atomic_io;
use crate::error::Result;
use crate::queue::PendingOutbound;
use crate::text::truncate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    #[serde(rename = "chatId")]
    pub chat_id: i64,
    #[serde(rename = "userId")]
    pub user_id: Option<i64>,
    #[serde(rename = "messageId")]
    pub message_id: i64,
    #[serde(rename = "messageThreadId", default)]
    pub message_thread_id: Option<i64>,
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    #[serde(rename = "sessionFile")]
    pub session_file: String,
    #[serde(rename = "promptText")]
    pub prompt_text: String,
    #[serde(rename = "createdAtMs")]
    pub created_at_ms: i64,
    #[serde(rename = "startedAtMs", default)]
    pub started_at_ms: Option<i64>,
    #[serde(rename = "finishedAtMs", default)]
    pub finished_at_ms: Option<i64>,
    pub status: JobStatus,
    #[serde(rename = "resultText", default)]
    pub result_text: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "completionNotifiedAtMs", default)]
    pub completion_notified_at_ms: Option<i64>,
    #[serde(rename = "cancelRequestedAtMs", default)]
    pub cancel_requested_at_ms: Option<i64>,
}

impl Job {
    pub fn new(
        chat_id: i64,
        user_id: Option<i64>,
        message_id: i64,
        message_thread_id: Option<i64>,
        session_key: String,
        session_file: String,
        prompt_text: String,
        created_at_ms: i64,
    ) -> Self {
        Self {
            id: format!("J{}", Uuid::now_v7()),
            chat_id,
            user_id,
            message_id,
            message_thread_id,
            session_key,
            session_file,
            prompt_text,
            created_at_ms,
            started_at_ms: None,
            finished_at_ms: None,
            status: JobStatus::Queued,
            result_text: None,
            error: None,
            completion_notified_at_ms: None,
            cancel_requested_at_ms: None,
        }
    }
}

/// Load jobs from `path`. Any job that was `running` at the time of a
/// crash is rewritten to `queued` with its `startedAtMs`/`error` cleared —
/// crash-safe rehydration, applied before any scheduling decision.
pub fn load(path: &Path) -> Vec<Job> {
    let mut jobs: Vec<Job> = atomic_io::load_json_or_default(path, Vec::new());
    for job in &mut jobs {
        if job.status == JobStatus::Running {
            job.status = JobStatus::Queued;
            job.started_at_ms = None;
            job.error = None;
        }
    }
    jobs
}

pub fn save(path: &Path, jobs: &[Job]) -> Result<()> {
    atomic_io::write_text(path, &serde_json::to_string_pretty(jobs)?)
}

/// Outcome of a single [`pump`] iteration: any new outbound messages to
/// enqueue (completion/failure notifications), plus the updated job list.
pub struct PumpOutcome {
    pub started: Vec<String>,
    pub outbound: Vec<PendingOutbound>,
}

/// Result of running a job's prompt, fed back into [`apply_result`].
pub enum JobResult {
    Completed(String),
    Failed(String),
}

/// Select the next queued job eligible to run: the earliest-created queued
/// job whose `sessionFile` has no other active (running) job.
pub fn next_runnable<'a>(jobs: &'a mut [Job]) -> Option<&'a mut Job> {
    let active_files: HashSet<String> = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Running)
        .map(|j| j.session_file.clone())
        .collect();

    jobs.iter_mut()
        .filter(|j| j.status == JobStatus::Queued && !active_files.contains(&j.session_file))
        .min_by_key(|j| j.created_at_ms)
}

pub fn mark_running(job: &mut Job, now_ms: i64) {
    job.status = JobStatus::Running;
    job.started_at_ms = Some(now_ms);
}

/// Apply a finished job's result. Discards the result entirely if the job
/// had already been marked `cancelled` while it was running (the
/// cancellation-gap behavior preserved from the source).
pub fn apply_result(job: &mut Job, result: JobResult, now_ms: i64) -> Option<PendingOutbound> {
    if job.status == JobStatus::Cancelled {
        return None;
    }

    job.finished_at_ms = Some(now_ms);
    match result {
        JobResult::Completed(text) => {
            job.status = JobStatus::Completed;
            job.result_text = Some(text.clone());
            if job.completion_notified_at_ms.is_some() {
                return None;
            }
            job.completion_notified_at_ms = Some(now_ms);
            let mut outbound = PendingOutbound::new(
                job.chat_id,
                format!("✅ Job {} finished.\n\n{}", job.id, text),
            );
            outbound.message_thread_id = job.message_thread_id;
            Some(outbound)
        }
        JobResult::Failed(error) => {
            job.status = JobStatus::Failed;
            job.error = Some(error.clone());
            let mut outbound = PendingOutbound::new(
                job.chat_id,
                format!("⚠️ Job {} failed: {}", job.id, error),
            );
            outbound.message_thread_id = job.message_thread_id;
            Some(outbound)
        }
    }
}

/// `/cancel <id>`: mark a job cancelled. Terminal; a later result for this
/// job must be discarded by the caller via [`apply_result`].
pub fn cancel(jobs: &mut [Job], job_id: &str, now_ms: i64) -> bool {
    match jobs.iter_mut().find(|j| j.id == job_id) {
        Some(job) if !matches!(job.status, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled) => {
            job.status = JobStatus::Cancelled;
            job.cancel_requested_at_ms = Some(now_ms);
            true
        }
        _ => false,
    }
}

/// `/jobs`: render the last 10 jobs for a chat, most recent first.
pub fn render_jobs_list(jobs: &[Job], chat_id: i64) -> String {
    let mut chat_jobs: Vec<&Job> = jobs.iter().filter(|j| j.chat_id == chat_id).collect();
    chat_jobs.sort_by_key(|j| std::cmp::Reverse(j.created_at_ms));
    chat_jobs.truncate(10);

    if chat_jobs.is_empty() {
        return "No jobs for this chat.".to_string();
    }

    chat_jobs
        .iter()
        .map(|j| format!("{} — {:?} — {}", j.id, j.status, truncate(&j.prompt_text, 40)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `/job <id>`: render details for one job, if found in this chat.
pub fn render_job_detail(jobs: &[Job], chat_id: i64, job_id: &str) -> String {
    match jobs.iter().find(|j| j.id == job_id && j.chat_id == chat_id) {
        Some(job) => {
            let mut out = format!("Job {}\nStatus: {:?}", job.id, job.status);
            if let Some(text) = &job.result_text {
                out.push_str(&format!("\nResult: {text}"));
            }
            if let Some(err) = &job.error {
                out.push_str(&format!("\nError: {err}"));
            }
            out
        }
        None => format!("No job '{job_id}' found for this chat."),
    }
}
