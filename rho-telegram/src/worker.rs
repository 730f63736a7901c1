//! Worker runtime (C13): the single cooperative loop tying every bridge
//! module to a concrete Telegram client.
//!
//! Every tick reads its working state from the on-disk files under the
//! data root and writes it back before returning, so a crash between ticks
//! never loses more than the in-flight tick itself. There is no shared
//! mutable state beyond what's already serialized through `rho_bridge_core`
//! — the worker owns exactly one instance of each queue/map/job list at a
//! time and re-persists it after mutating it.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use rho_bridge_core::approvals;
use rho_bridge_core::envelope::{self, AuthDecision, AuthSettings, Envelope};
use rho_bridge_core::jobs::{self, Job, JobResult, JobStatus};
use rho_bridge_core::queue::{self, PendingInbound, PendingOutbound};
use rho_bridge_core::retry::{self, ApiErrorInfo};
use rho_bridge_core::rpc::{ImagePart, RpcError, RpcRuntime};
use rho_bridge_core::runtime_state;
use rho_bridge_core::session_map;
use rho_bridge_core::slash;
use rho_bridge_core::stt::SttProvider;
use rho_bridge_core::tts::TtsProvider;
use rho_bridge_core::{chunker, DataPaths, Settings};
use tracing::{info, warn};

use crate::client::{ChatActionKind, ClientError, ParseModeKind, TelegramClient};
use crate::format;

pub struct WorkerRuntime<C: TelegramClient> {
    client: Arc<C>,
    rpc: Arc<RpcRuntime>,
    stt: Option<Arc<dyn SttProvider>>,
    tts: Option<Arc<dyn TtsProvider>>,
    settings: Settings,
    paths: DataPaths,
    bot_username: String,
}

impl<C: TelegramClient> WorkerRuntime<C> {
    pub fn new(
        client: Arc<C>,
        rpc: Arc<RpcRuntime>,
        stt: Option<Arc<dyn SttProvider>>,
        tts: Option<Arc<dyn TtsProvider>>,
        settings: Settings,
        paths: DataPaths,
        bot_username: String,
    ) -> Self {
        Self {
            client,
            rpc,
            stt,
            tts,
            settings,
            paths,
            bot_username,
        }
    }

    /// Run one full cycle: poll, drain inbound, flush outbound, pump jobs.
    /// Errors from individual steps are logged rather than propagated so one
    /// bad tick doesn't take the supervisor's retry loop down with it.
    pub async fn tick(&self) -> bool {
        let poll_ok = match self.poll_once(false).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "poll_once failed");
                false
            }
        };

        if let Err(e) = self.drain_inbound_queue().await {
            warn!(error = %e, "drain_inbound_queue failed");
        }
        if let Err(e) = self.flush_outbound_queue().await {
            warn!(error = %e, "flush_outbound_queue failed");
        }
        if let Err(e) = self.pump_jobs().await {
            warn!(error = %e, "pump_jobs failed");
        }

        poll_ok
    }

    /// Long-poll for updates, normalize and authorize each one, and append
    /// the admissible ones to the inbound queue. `silent` requests a
    /// zero-second long-poll timeout, used by the check-trigger path where
    /// a caller wants an immediate drain rather than waiting on Telegram.
    pub async fn poll_once(&self, silent: bool) -> Result<()> {
        let mut state = runtime_state::load(&self.paths.state());
        let timeout_secs = if silent { 0 } else { self.settings.poll_timeout_seconds };

        let updates = match self.client.get_updates(state.last_update_id, timeout_secs).await {
            Ok(updates) => updates,
            Err(e) => {
                state.mark_poll_failure();
                runtime_state::save(&self.paths.state(), &state)?;
                return Err(anyhow::anyhow!("getUpdates failed: {e}"));
            }
        };

        let update_ids: Vec<i64> = updates.iter().map(|u| u.update_id).collect();

        let mut session_map = session_map::load(&self.paths.session_map());
        let mut inbound = queue::load_validated::<PendingInbound>(&self.paths.inbound_queue(), queue::is_valid_inbound);
        let mut approvals = approvals::load(&self.paths.pending_approvals());
        let mut outbound = queue::load_validated::<PendingOutbound>(&self.paths.outbound_queue(), queue::is_valid_outbound);

        let cwd = self.settings.resolved_agent_cwd().context("resolving agent cwd")?;
        let cwd = cwd.to_string_lossy().into_owned();
        let sessions_root = self.settings.resolved_sessions_root();

        for update in &updates {
            let Some(envelope) = envelope::normalize(update, self.settings.threaded_mode) else {
                continue;
            };

            match self.authorize_envelope(&envelope) {
                AuthDecision::Ok => {
                    let outcome = session_map::resolve_session_file(&mut session_map, &envelope, &sessions_root, &cwd)?;
                    inbound.push(PendingInbound {
                        envelope,
                        session_key: outcome.session_key,
                        session_file: outcome.session_file.to_string_lossy().into_owned(),
                    });
                }
                AuthDecision::ChatNotAllowed | AuthDecision::UserNotAllowed => {
                    // Reply with a PIN only on first contact; a repeat
                    // message from the same blocked identity gets no
                    // second notification.
                    if !approvals.has_pending(envelope.chat_id, envelope.user_id) {
                        let pin = approvals.upsert(envelope.chat_id, envelope.user_id, rho_bridge_core::lease::now_ms());
                        outbound.push(PendingOutbound::new(
                            envelope.chat_id,
                            format!("This chat isn't authorized yet. Share this PIN with the operator: {pin}"),
                        ));
                    }
                }
                AuthDecision::GroupNotActivated => {
                    // Silent: groups require an explicit mention, so an
                    // unmentioned message isn't a denial worth replying to.
                }
            }
        }

        session_map::save(&self.paths.session_map(), &session_map)?;
        queue::save(&self.paths.inbound_queue(), &inbound)?;
        queue::save(&self.paths.outbound_queue(), &outbound)?;
        approvals::save(&self.paths.pending_approvals(), &approvals)?;

        state.last_update_id = runtime_state::advance_update_offset(state.last_update_id, &update_ids);
        state.mark_poll_success();
        runtime_state::save(&self.paths.state(), &state)?;

        Ok(())
    }

    fn authorize_envelope(&self, envelope: &Envelope) -> AuthDecision {
        let auth_settings = AuthSettings {
            allowed_chat_ids: &self.settings.allowed_chat_ids,
            allowed_user_ids: &self.settings.allowed_user_ids,
            strict_allowlist: self.settings.strict_allowlist,
            require_mention_in_groups: self.settings.require_mention_in_groups,
        };
        envelope::authorize(envelope, &auth_settings, &self.bot_username)
    }

    /// Process every queued inbound message, one at a time, in arrival
    /// order. Each message either resolves locally (a built-in command), is
    /// forwarded to the agent subprocess, or — if the agent doesn't answer
    /// before the configured deadline — is handed off to a background job.
    pub async fn drain_inbound_queue(&self) -> Result<()> {
        let inbound = queue::load_validated::<PendingInbound>(&self.paths.inbound_queue(), queue::is_valid_inbound);
        if inbound.is_empty() {
            return Ok(());
        }

        let mut outbound = queue::load_validated::<PendingOutbound>(&self.paths.outbound_queue(), queue::is_valid_outbound);
        let mut jobs = jobs::load(&self.paths.jobs());
        let mut session_map = session_map::load(&self.paths.session_map());
        let sessions_root = self.settings.resolved_sessions_root();
        let cwd = self.settings.resolved_agent_cwd().context("resolving agent cwd")?;
        let cwd = cwd.to_string_lossy().into_owned();
        let mut remaining = inbound.clone();

        for item in &inbound {
            let replies = self.handle_inbound(item, &mut jobs, &mut session_map, &sessions_root, &cwd).await;
            outbound.extend(replies);

            // Persist after each message so a crash mid-drain only loses
            // the one message in flight, not the whole batch.
            remaining.remove(0);
            queue::save(&self.paths.inbound_queue(), &remaining)?;
            queue::save(&self.paths.outbound_queue(), &outbound)?;
            jobs::save(&self.paths.jobs(), &jobs)?;
            session_map::save(&self.paths.session_map(), &session_map)?;
        }

        Ok(())
    }

    async fn handle_inbound(
        &self,
        item: &PendingInbound,
        jobs: &mut Vec<Job>,
        session_map: &mut session_map::SessionMap,
        sessions_root: &Path,
        cwd: &str,
    ) -> Vec<PendingOutbound> {
        let _ = self
            .client
            .send_chat_action(item.envelope.chat_id, ChatActionKind::Typing, item.envelope.message_thread_id)
            .await;

        if let Some(outcome) = self.try_tts_command(item).await {
            return match outcome {
                Some(po) => vec![po],
                None => Vec::new(),
            };
        }

        if let Some(local) = self.try_local_command(item, jobs, session_map, sessions_root, cwd).await {
            return self.chunk_reply(item, &local);
        }

        let (message_text, images) = match self.prepare_prompt_input(item).await {
            Ok(parts) => parts,
            Err(text) => return self.chunk_reply(item, &text),
        };

        let timeout_ms = self.settings.rpc_prompt_timeout_seconds * 1000;
        let session_path = item.session_file.clone();
        let run_cwd = match self.settings.resolved_agent_cwd() {
            Ok(cwd) => cwd.to_string_lossy().into_owned(),
            Err(e) => return self.chunk_reply(item, &format!("internal error: {e}")),
        };

        match self
            .rpc
            .run_prompt(&item.session_file, &session_path, &run_cwd, &message_text, timeout_ms, images)
            .await
        {
            Ok(text) => self.chunk_reply(item, &text),
            Err(RpcError::Timeout(_)) => {
                // The Rust-side future gave up, but the subprocess may
                // still be working the original prompt. Rotate to a fresh
                // session file before handing off to the job scheduler, and
                // cancel the old session so its subprocess stops racing the
                // job against the same session file.
                let (new_key, previous) = match session_map::reset_session_file(session_map, &item.envelope, sessions_root, cwd) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(error = %e, "failed to rotate session file after timeout, reusing existing session");
                        (item.session_key.clone(), None)
                    }
                };
                let old_session_file = previous.map(|p| p.to_string_lossy().into_owned()).unwrap_or_else(|| item.session_file.clone());
                self.rpc.cancel_session(&old_session_file, "foreground prompt timed out, forking to background").await;

                let new_session_file = session_map.get(&new_key).map(str::to_string).unwrap_or_else(|| item.session_file.clone());

                let job = Job::new(
                    item.envelope.chat_id,
                    item.envelope.user_id,
                    item.envelope.message_id,
                    item.envelope.message_thread_id,
                    new_key,
                    new_session_file,
                    message_text,
                    rho_bridge_core::lease::now_ms(),
                );
                let job_id = job.id.clone();
                jobs.push(job);
                self.chunk_reply(item, &format!("Still working on it — I'll follow up. Track with /job {job_id}."))
            }
            Err(e) => self.chunk_reply(item, &format!("Agent error: {e}")),
        }
    }

    /// `/tts <text>`: synthesize speech and reply with a voice message
    /// directly, bypassing the outbound text queue entirely. Returns `None`
    /// when this inbound item isn't a `/tts` invocation, so the caller can
    /// fall through to [`try_local_command`] / RPC forwarding; returns
    /// `Some(None)` on a successful voice send (nothing left to enqueue) and
    /// `Some(Some(..))` carrying an error reply otherwise.
    async fn try_tts_command(&self, item: &PendingInbound) -> Option<Option<PendingOutbound>> {
        let parsed = slash::parse(&item.envelope.text);
        if parsed.kind != slash::ParseKind::Slash {
            return None;
        }
        let name = parsed.command_name.as_deref()?;
        let name = slash::normalize_mention_suffix(name, &self.bot_username);
        if name != "tts" {
            return None;
        }

        let text = parsed.args.trim();
        if text.is_empty() {
            return Some(Some(PendingOutbound::new(item.envelope.chat_id, "Usage: /tts <text>".to_string())));
        }

        let Some(tts) = &self.tts else {
            return Some(Some(PendingOutbound::new(
                item.envelope.chat_id,
                "Voice replies aren't configured on this bot.".to_string(),
            )));
        };

        let _ = self
            .client
            .send_chat_action(item.envelope.chat_id, ChatActionKind::RecordVoice, item.envelope.message_thread_id)
            .await;
        let bytes = match tts.synthesize(text).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Some(Some(PendingOutbound::new(item.envelope.chat_id, format!("speech synthesis failed: {e}"))));
            }
        };

        let _ = self
            .client
            .send_chat_action(item.envelope.chat_id, ChatActionKind::UploadVoice, item.envelope.message_thread_id)
            .await;
        match self
            .client
            .send_voice(item.envelope.chat_id, item.envelope.message_thread_id, bytes, "reply.mp3")
            .await
        {
            Ok(()) => Some(None),
            Err(e) => Some(Some(PendingOutbound::new(item.envelope.chat_id, format!("couldn't send voice message: {e}")))),
        }
    }

    /// Intercept `/new /jobs /job /cancel /help` before they ever reach the
    /// agent subprocess (`/tts` is handled separately by
    /// [`try_tts_command`]) — `slash::classify` always reports these as
    /// supported regardless of the discovered command inventory, so the
    /// worker, not `rpc::run_prompt`, owns handling them.
    async fn try_local_command(
        &self,
        item: &PendingInbound,
        jobs: &mut [Job],
        session_map: &mut session_map::SessionMap,
        sessions_root: &Path,
        cwd: &str,
    ) -> Option<String> {
        let parsed = slash::parse(&item.envelope.text);
        if parsed.kind != slash::ParseKind::Slash {
            return None;
        }
        let name = parsed.command_name.as_deref()?;
        let name = slash::normalize_mention_suffix(name, &self.bot_username);
        if !slash::LOCAL_COMMANDS.contains(&name.as_str()) {
            return None;
        }

        Some(match name.as_str() {
            "new" => {
                let (_, previous) = match session_map::reset_session_file(session_map, &item.envelope, sessions_root, cwd) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(error = %e, "failed to reset session file for /new");
                        return Some("Couldn't start a new session — please try again.".to_string());
                    }
                };
                let old_session_file = previous.map(|p| p.to_string_lossy().into_owned()).unwrap_or_else(|| item.session_file.clone());
                self.rpc.cancel_session(&old_session_file, "session reset via /new").await;
                "Started a new session. Your next message begins a fresh conversation.".to_string()
            }
            "jobs" => jobs::render_jobs_list(jobs, item.envelope.chat_id),
            "job" => {
                let job_id = parsed.args.trim();
                if job_id.is_empty() {
                    "Usage: /job <id>".to_string()
                } else {
                    jobs::render_job_detail(jobs, item.envelope.chat_id, job_id)
                }
            }
            "cancel" => {
                let job_id = parsed.args.trim();
                if job_id.is_empty() {
                    "Usage: /cancel <id>".to_string()
                } else if jobs::cancel(jobs, job_id, rho_bridge_core::lease::now_ms()) {
                    self.rpc.cancel_session(&item.session_file, "job cancelled").await;
                    format!("Job {job_id} cancelled.")
                } else {
                    format!("No cancellable job '{job_id}' found for this chat.")
                }
            }
            "help" => {
                "Built-in commands: /new, /jobs, /job <id>, /cancel <id>, /help. Anything else is forwarded to the agent.".to_string()
            }
            _ => return None,
        })
    }

    /// Turn an inbound item's media (if any) into prompt text/images. Voice
    /// and audio are transcribed via STT and appended to the prompt text;
    /// images are base64-encoded and passed through as RPC image parts.
    async fn prepare_prompt_input(&self, item: &PendingInbound) -> Result<(String, Option<Vec<ImagePart>>), String> {
        let Some(media) = &item.envelope.media else {
            return Ok((item.envelope.text.clone(), None));
        };

        let file_path = self
            .client
            .get_file_path(&media.file_id)
            .await
            .map_err(|e| format!("couldn't fetch media: {e}"))?;
        let bytes = self
            .client
            .download_file(&file_path)
            .await
            .map_err(|e| format!("couldn't download media: {e}"))?;

        if media.is_audio() {
            let Some(stt) = &self.stt else {
                return Err("voice messages aren't configured on this bot.".to_string());
            };
            let mime = media.mime_type.clone().unwrap_or_else(|| "audio/ogg".to_string());
            let file_name = media.file_name.clone().unwrap_or_else(|| "voice.ogg".to_string());
            let transcript = stt
                .transcribe(&bytes, &mime, &file_name)
                .await
                .map_err(|e| format!("transcription failed: {e}"))?;
            let text = if item.envelope.text.is_empty() {
                transcript
            } else {
                format!("{}\n\n{}", item.envelope.text, transcript)
            };
            return Ok((text, None));
        }

        if media.is_image() {
            let mime = media.mime_type.clone().unwrap_or_else(|| "image/jpeg".to_string());
            let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
            let image = ImagePart {
                kind: "image".to_string(),
                data,
                mime_type: mime,
            };
            return Ok((item.envelope.text.clone(), Some(vec![image])));
        }

        Ok((item.envelope.text.clone(), None))
    }

    /// Chunk `text` (§C10) into one `PendingOutbound` per chunk, replying
    /// to `item`'s message on the first chunk only — each chunk is sent as
    /// its own `sendMessage` call, so a reply longer than Telegram's 4096
    /// character limit is delivered as several messages instead of one
    /// oversized call the Bot API would reject.
    fn chunk_reply(&self, item: &PendingInbound, text: &str) -> Vec<PendingOutbound> {
        chunk_outbound(item.envelope.chat_id, item.envelope.message_thread_id, Some(item.envelope.message_id), text)
    }

    /// Send every outbound message whose backoff window has elapsed.
    /// Failures are retried per [`retry`] up to [`queue::MAX_OUTBOUND_ATTEMPTS`];
    /// exhausted entries are dropped rather than retried forever.
    pub async fn flush_outbound_queue(&self) -> Result<()> {
        let mut outbound = queue::load_validated::<PendingOutbound>(&self.paths.outbound_queue(), queue::is_valid_outbound);
        if outbound.is_empty() {
            return Ok(());
        }

        let now = rho_bridge_core::lease::now_ms();
        let mut remaining = Vec::with_capacity(outbound.len());

        for mut item in outbound.drain(..) {
            if item.not_before_ms > now {
                remaining.push(item);
                continue;
            }

            match self
                .client
                .send_message(
                    item.chat_id,
                    &item.text,
                    Some(ParseModeKind::Html),
                    item.message_thread_id,
                    item.reply_to_message_id,
                )
                .await
            {
                Ok(()) => {}
                Err(e) => {
                    item.attempts += 1;
                    let info = client_error_to_api_info(&e);
                    if item.is_retriable() && retry::should_retry(&info, item.attempts) {
                        let delay = retry::retry_delay_ms(&info, item.attempts);
                        item.not_before_ms = now + delay as i64;
                        remaining.push(item);
                    } else {
                        warn!(chat_id = item.chat_id, error = %e, "dropping outbound message after exhausting retries");
                    }
                }
            }
        }

        queue::save(&self.paths.outbound_queue(), &remaining)?;
        Ok(())
    }

    /// Run at most one queued background job per tick, respecting the
    /// one-job-per-session-file exclusivity rule.
    pub async fn pump_jobs(&self) -> Result<()> {
        let mut jobs = jobs::load(&self.paths.jobs());
        let Some(job) = jobs::next_runnable(&mut jobs) else {
            return Ok(());
        };

        let session_file = job.session_file.clone();
        let prompt_text = job.prompt_text.clone();
        jobs::mark_running(job, rho_bridge_core::lease::now_ms());
        jobs::save(&self.paths.jobs(), &jobs)?;

        let cwd = self.settings.resolved_agent_cwd().context("resolving agent cwd")?;
        let cwd = cwd.to_string_lossy().into_owned();

        let result = match self.rpc.run_prompt(&session_file, &session_file, &cwd, &prompt_text, 0, None).await {
            Ok(text) => JobResult::Completed(text),
            Err(e) => JobResult::Failed(e.to_string()),
        };

        let mut jobs = jobs::load(&self.paths.jobs());
        let mut outbound = queue::load_validated::<PendingOutbound>(&self.paths.outbound_queue(), queue::is_valid_outbound);
        if let Some(job) = jobs.iter_mut().find(|j| j.session_file == session_file && j.status != JobStatus::Cancelled) {
            if let Some(reply) = jobs::apply_result(job, result, rho_bridge_core::lease::now_ms()) {
                outbound.extend(chunk_outbound(reply.chat_id, reply.message_thread_id, None, &reply.text));
            }
        }

        jobs::save(&self.paths.jobs(), &jobs)?;
        queue::save(&self.paths.outbound_queue(), &outbound)?;
        Ok(())
    }

    /// Consume the check-trigger file and, if it fired, run an immediate
    /// silent poll plus a full drain/flush pass.
    pub async fn handle_check_trigger(&self, last_seen_mtime_ms: i64) -> Result<i64> {
        let outcome = rho_bridge_core::trigger::consume(&self.paths.check_trigger(), last_seen_mtime_ms)?;
        if !outcome.triggered {
            return Ok(outcome.next_seen);
        }

        let mut state = runtime_state::load(&self.paths.state());
        if let Some(request) = &outcome.request {
            state.mark_check_triggered(request.requested_at, request.source.clone());
            runtime_state::save(&self.paths.state(), &state)?;
        }

        info!("check-trigger fired, running an immediate poll");
        self.poll_once(true).await?;
        self.drain_inbound_queue().await?;
        self.flush_outbound_queue().await?;
        Ok(outcome.next_seen)
    }
}

/// Split `text` into Bot-API-sized chunks and wrap each in its own
/// `PendingOutbound`, so a long reply becomes several independent
/// `sendMessage` calls rather than one the server would reject outright.
/// `reply_to_message_id` is attached to the first chunk only.
fn chunk_outbound(chat_id: i64, message_thread_id: Option<i64>, reply_to_message_id: Option<i64>, text: &str) -> Vec<PendingOutbound> {
    let chunks = chunker::chunk_text(text, chunker::DEFAULT_MAX_LEN);
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mut outbound = PendingOutbound::new(chat_id, format::md_to_telegram_html(&c.markdown));
            outbound.message_thread_id = message_thread_id;
            if i == 0 {
                outbound.reply_to_message_id = reply_to_message_id;
            }
            outbound
        })
        .collect()
}

fn client_error_to_api_info(error: &ClientError) -> ApiErrorInfo {
    ApiErrorInfo {
        status: error.status().unwrap_or(0),
        retry_after_seconds: error.retry_after_seconds(),
    }
}
