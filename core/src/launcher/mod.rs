//! Session launcher
//!
//! Runs K sessions of one experiment concurrently. Each session creates its
//! platform session, starts a bot per LLM slot, waits for humans, and exports
//! its data into its own directory. A failing or panicking session becomes a
//! [`SessionOutcome::Failed`] without touching the others.
//!
//! Ctrl+C cancels the whole run: every session stops its bots, stops waiting
//! for humans and exports what it has.

pub mod process;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::bot::store::store_file_name;
use crate::bot::{BotRunner, BotTask, ConversationStore, ParticipantRecord};
use crate::config::{ExperimentConfig, LabConfig, SlotAssignment};
use crate::error::{LabError, Result};
use crate::export::{self, RoleLine, SummaryInfo};
use crate::otree::ExperimentPlatform;
use crate::output::OutputFormatter;

pub use process::{ensure_llamacpp_server, start_otree_devserver, ManagedProcess};

/// Run-wide launcher options
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub sessions: usize,
    pub output_dir: PathBuf,
    /// Open the session monitor in a browser when humans take part
    pub open_browser: bool,
}

/// A participant slot bound to a platform participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotHandle {
    pub player_id: u32,
    pub participant_code: String,
    pub url: String,
    pub assignment: SlotAssignment,
    pub role: Option<String>,
}

/// A created session and its slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub local_id: String,
    pub platform_code: String,
    pub slots: Vec<SlotHandle>,
}

impl SessionHandle {
    pub fn humans(&self) -> impl Iterator<Item = &SlotHandle> {
        self.slots.iter().filter(|s| s.assignment.is_human())
    }

    pub fn bots(&self) -> impl Iterator<Item = &SlotHandle> {
        self.slots.iter().filter(|s| !s.assignment.is_human())
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed {
        local_id: String,
        platform_code: String,
        output_dir: PathBuf,
    },
    Failed {
        local_id: String,
        error: String,
    },
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Completed { .. })
    }

    pub fn local_id(&self) -> &str {
        match self {
            SessionOutcome::Completed { local_id, .. } | SessionOutcome::Failed { local_id, .. } => local_id,
        }
    }
}

/// Runs the sessions of one experiment
#[derive(Clone)]
pub struct SessionLauncher {
    experiment: Arc<ExperimentConfig>,
    lab: Arc<LabConfig>,
    platform: Arc<dyn ExperimentPlatform>,
    bots: Arc<dyn BotRunner>,
    options: LaunchOptions,
    output: OutputFormatter,
    /// Shared by every session of the run
    cancel: CancellationToken,
}

impl SessionLauncher {
    pub fn new(
        experiment: Arc<ExperimentConfig>,
        lab: Arc<LabConfig>,
        platform: Arc<dyn ExperimentPlatform>,
        bots: Arc<dyn BotRunner>,
        options: LaunchOptions,
    ) -> Self {
        Self {
            experiment,
            lab,
            platform,
            bots,
            options,
            output: OutputFormatter::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// `_{app}_nhumans{h}_nbots{b}`, appended to every file of a session
    pub fn file_suffix(&self) -> String {
        let roster = &self.experiment.roster;
        format!(
            "_{}_nhumans{}_nbots{}",
            self.experiment.app.name,
            roster.human_count(),
            roster.bot_count()
        )
    }

    /// Run every session and return their outcomes in session order.
    ///
    /// Fails only when a local model is in use and no llama.cpp server can be
    /// made available.
    pub async fn run_all(&self) -> Result<Vec<SessionOutcome>> {
        let llama = if self.experiment.roster.uses_local_model() {
            ensure_llamacpp_server(&self.lab.local, &self.lab.bots).await?
        } else {
            None
        };

        let cancel = self.cancel.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping sessions and exporting collected data");
                cancel.cancel();
            }
        });

        let started = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let total = self.options.sessions.max(1);
        let mut sessions = JoinSet::new();

        for n in 1..=total {
            let local_id = format!("session_{}_{}", n, started);
            let launcher = self.clone();
            sessions.spawn(async move {
                let id = local_id.clone();
                // Inner task so a panic is reported for this session only
                let joined = tokio::spawn(async move { launcher.run_session(n, id).await }).await;
                let outcome = match joined {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => SessionOutcome::Failed {
                        local_id,
                        error: e.to_string(),
                    },
                    Err(e) => SessionOutcome::Failed {
                        local_id,
                        error: format!("session task panicked: {}", e),
                    },
                };
                (n, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok((n, outcome)) => {
                    self.output.print_session_result(n, &outcome);
                    outcomes.push((n, outcome));
                }
                Err(e) => tracing::error!("Session supervisor failed: {}", e),
            }
        }
        outcomes.sort_by_key(|(n, _)| *n);
        interrupt.abort();

        if let Some(server) = llama {
            if let Err(e) = server.stop().await {
                tracing::warn!("{}", e);
            }
        }

        Ok(outcomes.into_iter().map(|(_, o)| o).collect())
    }

    async fn run_session(&self, n: usize, local_id: String) -> Result<SessionOutcome> {
        let suffix = self.file_suffix();
        let output_dir = self
            .options
            .output_dir
            .join(format!("session_{}{}", local_id, suffix));
        tokio::fs::create_dir_all(&output_dir).await?;
        let store = ConversationStore::open(&output_dir.join(store_file_name(&local_id, &suffix)))?;

        if self.cancel.is_cancelled() {
            return Err(LabError::Cancelled);
        }
        let handle = self.create_session(&local_id, &store).await?;
        tracing::info!(
            "Session {} created as {} with {} participants",
            local_id,
            handle.platform_code,
            handle.slots.len()
        );

        let monitor_url = self.platform.monitor_url(&handle.platform_code);
        let humans = handle.humans().count();
        if humans > 0 {
            self.output.print_human_urls(n, &handle);
        }
        self.output.print_monitor_url(&monitor_url);
        if humans > 0 && self.options.open_browser {
            if let Err(e) = webbrowser::open(&monitor_url) {
                tracing::warn!("Could not open browser: {}", e);
            }
        }

        self.run_bots(n, &handle, &store).await;

        if humans > 0 {
            self.output.print_waiting(humans, &monitor_url);
            self.wait_for_humans(&handle).await;
        }

        self.export(&handle, &store, &output_dir, &suffix).await;

        Ok(SessionOutcome::Completed {
            local_id,
            platform_code: handle.platform_code,
            output_dir,
        })
    }

    /// Create the platform session and record its slots in the store
    async fn create_session(&self, local_id: &str, store: &ConversationStore) -> Result<SessionHandle> {
        let roster = &self.experiment.roster;
        let created = self
            .platform
            .create_session(
                &self.experiment.app.name,
                roster.len(),
                self.experiment.session_config_fields(),
            )
            .await?;

        if created.participant_codes.len() != roster.len() {
            return Err(LabError::Platform {
                status: 200,
                message: format!(
                    "session {} has {} participants, expected {}",
                    created.code,
                    created.participant_codes.len(),
                    roster.len()
                ),
            });
        }

        let slots: Vec<SlotHandle> = roster
            .slots()
            .iter()
            .zip(&created.participant_codes)
            .map(|(slot, code)| SlotHandle {
                player_id: slot.player_id,
                participant_code: code.clone(),
                url: self.platform.participant_url(code),
                assignment: slot.assignment.clone(),
                role: slot.role.clone(),
            })
            .collect();

        for slot in &slots {
            store.add_participant(&ParticipantRecord {
                session_id: created.code.clone(),
                participant_id: slot.participant_code.clone(),
                player_id: slot.player_id,
                is_human: slot.assignment.is_human(),
                url: slot.url.clone(),
                model: slot.assignment.model().map(|m| m.name.clone()),
                role: slot.role.clone(),
                time_in: None,
                time_out: None,
            })?;
        }

        Ok(SessionHandle {
            local_id: local_id.to_string(),
            platform_code: created.code,
            slots,
        })
    }

    /// Run one bot per LLM slot and wait for all of them, or abort them when
    /// the run is cancelled
    async fn run_bots(&self, n: usize, handle: &SessionHandle, store: &ConversationStore) {
        let bot_slots: Vec<&SlotHandle> = handle.bots().collect();
        if bot_slots.is_empty() {
            return;
        }
        self.output
            .print_bot_start(n, &self.experiment.app.name, &bot_slots);

        let mut bots = JoinSet::new();
        for slot in bot_slots {
            let SlotAssignment::Llm(model) = &slot.assignment else {
                continue;
            };
            let task = BotTask {
                session_code: handle.platform_code.clone(),
                participant_code: slot.participant_code.clone(),
                player_id: slot.player_id,
                url: slot.url.clone(),
                model: model.clone(),
                role: slot.role.clone(),
                prompts: self.experiment.prompts_for(slot.player_id),
                store: store.clone(),
            };
            let runner = self.bots.clone();
            let player_id = slot.player_id;
            bots.spawn(async move { (player_id, runner.run(task).await) });
        }

        loop {
            let joined = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::warn!("Session {}: stopping {} running bot(s)", handle.local_id, bots.len());
                    bots.shutdown().await;
                    return;
                }
                joined = bots.join_next() => joined,
            };
            match joined {
                None => return,
                Some(Ok((_, Ok(outcome)))) => {
                    tracing::debug!("Bot {} done after {} pages", outcome.participant_code, outcome.pages)
                }
                Some(Ok((player_id, Err(e)))) => {
                    tracing::warn!("Session {}: bot for player {} failed: {}", handle.local_id, player_id, e)
                }
                Some(Err(e)) => tracing::error!("Session {}: bot task panicked: {}", handle.local_id, e),
            }
        }
    }

    /// Poll the platform until every participant finished or the run is
    /// cancelled
    async fn wait_for_humans(&self, handle: &SessionHandle) {
        let is_human: HashMap<&str, bool> = handle
            .slots
            .iter()
            .map(|s| (s.participant_code.as_str(), s.assignment.is_human()))
            .collect();
        let interval = self.lab.otree.poll_interval();

        loop {
            match self.platform.session_status(&handle.platform_code).await {
                Ok(status) => {
                    let mut humans_done = 0;
                    let mut bots_done = 0;
                    for p in &status.participants {
                        let human = is_human.get(p.code.as_str()).copied().unwrap_or(false);
                        let kind = if human { "HUMAN" } else { "BOT" };
                        if p.finished {
                            if human {
                                humans_done += 1;
                            } else {
                                bots_done += 1;
                            }
                            tracing::info!("  {} ({}): COMPLETED", p.code, kind);
                        } else {
                            tracing::info!("  {} ({}): IN PROGRESS ({})", p.code, kind, p.location());
                        }
                    }
                    tracing::info!(
                        "{}/{} participants completed ({} humans, {} bots)",
                        status.finished_count(),
                        status.participants.len(),
                        humans_done,
                        bots_done
                    );
                    if status.all_finished() {
                        tracing::info!("Session {}: all participants finished", handle.local_id);
                        return;
                    }
                }
                Err(e) => tracing::warn!("Session {}: status check failed: {}", handle.local_id, e),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Session {}: stopped waiting, exporting current data", handle.local_id);
                    return;
                }
                _ = sleep(interval) => {}
            }
        }
    }

    /// Every export step only warns on failure
    async fn export(&self, handle: &SessionHandle, store: &ConversationStore, out: &Path, suffix: &str) {
        let code = &handle.platform_code;

        let wide = out.join(format!("otree_{}_wide{}.csv", code, suffix));
        match self.platform.export_wide(code, &wide).await {
            Ok(bytes) => {
                tracing::info!("Exported platform data for {} ({} bytes)", code, bytes);
                let prefix = format!("otree_{}{}", code, suffix);
                if let Err(e) = export::normalize_wide(&wide, out, &prefix) {
                    tracing::warn!("Could not normalize platform data for {}: {}", code, e);
                }
            }
            Err(e) => tracing::warn!("Could not export platform data for {}: {}", code, e),
        }

        let participants = out.join(format!("botex_{}_participants{}.csv", code, suffix));
        if let Err(e) = export::export_participants(store, code, &participants) {
            tracing::warn!("Could not export bot participants for {}: {}", code, e);
        }
        let responses = out.join(format!("botex_{}_responses{}.csv", code, suffix));
        if let Err(e) = export::export_responses(store, code, &responses) {
            tracing::warn!("Could not export bot responses for {}: {}", code, e);
        }

        let roster = &self.experiment.roster;
        let info = SummaryInfo {
            app: self.experiment.app.name.clone(),
            session_code: code.clone(),
            suffix: suffix.to_string(),
            participants: roster.len(),
            humans: roster.human_count(),
            bots: roster.bot_count(),
            roles: handle
                .slots
                .iter()
                .filter_map(|s| {
                    s.role.as_ref().map(|role| RoleLine {
                        player_id: s.player_id,
                        role: role.clone(),
                        is_human: s.assignment.is_human(),
                        model: s.assignment.model().map(|m| m.name.clone()),
                    })
                })
                .collect(),
        };
        match export::write_summary(out, &info) {
            Ok(path) => tracing::info!("Export summary written to {}", path.display()),
            Err(e) => tracing::warn!("Could not write export summary for {}: {}", code, e),
        }
    }
}
