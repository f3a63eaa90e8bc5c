//! The round state machine.
//!
//! `Idle → VariantsPending → VariantsReady → ImagesPending → Voting →
//! WinnerSelected → Idle`. Every mutation happens on the event-loop thread
//! through `&mut self`; backend calls run as jobs on an [`Executor`] and
//! report back as [`Completion`]s carrying the generation token that was
//! current when they were issued. A completion whose token is stale is
//! dropped.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;

use crate::audit::PromptHistoryEntry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gateway::{Backend, ButtonPress, GeneratedImage};
use crate::runtime::{AppEvent, Executor};
use crate::store::{Batch, KvStore, SessionStore};
use crate::voting::{
    Candidate, PhysicalButtonState, VoteBus, VoteOutcome, VoteSignal, VoteTally, VOTES_TO_WIN,
};

/// Countdown before images are generated automatically
pub const IMAGE_COUNTDOWN_UNITS: u32 = 10;
/// Countdown before the next round starts after a win
pub const NEXT_ROUND_COUNTDOWN_UNITS: u32 = 5;
/// How long the winner announcement stays before the round is cleared
pub const WINNER_DELAY_UNITS: u32 = 2;
/// Physical button poll period
pub const POLL_PERIOD_UNITS: u32 = 2;
/// Characters of the candidate text kept when a summary falls back
pub const SUMMARY_FALLBACK_CHARS: usize = 150;

pub const START_LABEL: &str = "Generate Variants";
pub const IMAGES_LABEL: &str = "Generate Images";
pub const ERROR_LABEL: &str = "Error, try again";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    VariantsPending,
    VariantsReady,
    ImagesPending,
    Voting,
    WinnerSelected(Candidate),
}

/// Round-scoped data; cleared on every reset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Round {
    pub texts: [Option<String>; 2],
    pub images: [Option<String>; 2],
    pub instructions: [Option<String>; 2],
    pub reflection: Option<String>,
}

impl Round {
    pub fn text(&self, c: Candidate) -> Option<&str> {
        self.texts[c.index()].as_deref()
    }

    pub fn image(&self, c: Candidate) -> Option<&str> {
        self.images[c.index()].as_deref()
    }

    pub fn instruction(&self, c: Candidate) -> Option<&str> {
        self.instructions[c.index()].as_deref()
    }

    fn has_texts(&self) -> bool {
        self.texts.iter().all(Option::is_some)
    }

    fn has_images(&self) -> bool {
        self.images.iter().all(Option::is_some)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub label: String,
    pub enabled: bool,
    pub visible: bool,
}

impl Control {
    fn new(label: &str, enabled: bool, visible: bool) -> Self {
        Self {
            label: label.to_string(),
            enabled,
            visible,
        }
    }

    fn set(&mut self, label: impl Into<String>, enabled: bool) {
        self.label = label.into();
        self.enabled = enabled;
    }
}

/// What the operator can press right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controls {
    pub start: Control,
    pub images: Control,
    /// Candidate panels with tallies are shown
    pub voting_visible: bool,
    /// Digital vote keys accepted (off while hardware buttons are active)
    pub digital_votes_enabled: bool,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            start: Control::new(START_LABEL, true, true),
            images: Control::new(IMAGES_LABEL, false, false),
            voting_visible: false,
            digital_votes_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    GenerateImages,
    GenerateVariants,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    pub action: Scheduled,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PollTimer {
    next_at: Instant,
    in_flight: bool,
}

/// One candidate's share of a finished image pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateImage {
    pub image_url: String,
    /// Backend summary, or the local fallback
    pub summary: String,
    pub instruction: Option<String>,
    pub audit: Option<PromptHistoryEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImagesReady {
    pub candidates: [CandidateImage; 2],
    pub reflection: String,
}

/// Result of a backend job, delivered to the event loop
#[derive(Debug)]
pub enum Completion {
    Variants {
        token: u64,
        prompt: String,
        result: Result<[String; 2]>,
    },
    Images {
        token: u64,
        result: Result<ImagesReady>,
    },
    ButtonStatus {
        token: u64,
        enabled: bool,
    },
    ButtonPress {
        token: u64,
        result: Result<ButtonPress>,
    },
    /// Remaining instruction pool size; `None` if the backend was unreachable
    InstructionCount(Option<u64>),
}

/// `first 150 chars + "..."`, plus `"\n\n " + instruction` when there is one
pub fn fallback_summary(text: &str, instruction: &str) -> String {
    let truncated: String = text.chars().take(SUMMARY_FALLBACK_CHARS).collect();
    let truncated = format!("{truncated}...");
    if instruction.is_empty() {
        truncated
    } else {
        format!("{truncated}\n\n {instruction}")
    }
}

/// Run `f` for both candidates concurrently and join
fn join_pair<T, F>(f: F) -> [T; 2]
where
    T: Send,
    F: Fn(Candidate) -> T + Sync,
{
    std::thread::scope(|s| {
        let b = s.spawn(|| f(Candidate::B));
        let a = f(Candidate::A);
        let b = b
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        [a, b]
    })
}

/// Images → summaries → reflection. Fails as a whole if either image or
/// the reflection fails; summary failures fall back locally.
pub fn run_image_pipeline(
    backend: &dyn Backend,
    image_url: &str,
    texts: &[String; 2],
    prompt: &str,
    history: &[String],
) -> Result<ImagesReady> {
    let [img_a, img_b] = join_pair(|c| backend.image(image_url, &texts[c.index()]));
    let images: [GeneratedImage; 2] = [img_a?, img_b?];

    let summaries = join_pair(|c| {
        let text = &texts[c.index()];
        let instruction = images[c.index()].instruction();
        backend.summary(text, instruction).unwrap_or_else(|err| {
            tracing::warn!(candidate = %c, %err, "summary failed, using fallback");
            fallback_summary(text, instruction)
        })
    });

    let reflection = backend.reflection(prompt, history)?;

    let [summary_a, summary_b] = summaries;
    let [image_a, image_b] = images;
    let build = |c: Candidate, image: GeneratedImage, summary: String| {
        let instruction = Some(image.instruction().to_string()).filter(|s| !s.is_empty());
        let audit = image
            .debug
            .as_ref()
            .and_then(|d| d.final_prompt.as_deref())
            .map(|final_prompt| {
                PromptHistoryEntry::image_generation(
                    final_prompt,
                    image.image_url.as_str(),
                    texts[c.index()].as_str(),
                )
            });
        CandidateImage {
            image_url: image.image_url,
            summary,
            instruction,
            audit,
        }
    };

    Ok(ImagesReady {
        candidates: [
            build(Candidate::A, image_a, summary_a),
            build(Candidate::B, image_b, summary_b),
        ],
        reflection,
    })
}

/// Fixed values taken from [`Config`]
#[derive(Debug, Clone)]
pub struct RoundSettings {
    pub time_unit: Duration,
    pub default_image: String,
    pub default_prompt: String,
}

impl From<&Config> for RoundSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            time_unit: cfg.time_unit(),
            default_image: cfg.default_image.clone(),
            default_prompt: cfg.default_prompt.clone(),
        }
    }
}

pub struct RoundMachine<S: KvStore> {
    store: SessionStore<S>,
    backend: Arc<dyn Backend>,
    executor: Arc<dyn Executor>,
    events: Sender<AppEvent>,
    settings: RoundSettings,

    phase: Phase,
    generation: u64,
    round: Round,
    tally: VoteTally,
    controls: Controls,
    buttons: PhysicalButtonState,
    poll: Option<PollTimer>,
    countdown: Option<Countdown>,
    clear_at: Option<Instant>,
    announcement: Option<String>,
    status: Option<String>,
    instruction_count: Option<u64>,
    bus: VoteBus,
}

impl<S: KvStore> RoundMachine<S> {
    pub fn new(
        store: SessionStore<S>,
        backend: Arc<dyn Backend>,
        executor: Arc<dyn Executor>,
        events: Sender<AppEvent>,
        settings: RoundSettings,
    ) -> Self {
        Self {
            store,
            backend,
            executor,
            events,
            settings,
            phase: Phase::Idle,
            generation: 0,
            round: Round::default(),
            tally: VoteTally::new(),
            controls: Controls::default(),
            buttons: PhysicalButtonState::Unknown,
            poll: None,
            countdown: None,
            clear_at: None,
            announcement: None,
            status: None,
            instruction_count: None,
            bus: VoteBus::new(),
        }
    }

    // ---- read access ----

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn tally(&self) -> &VoteTally {
        &self.tally
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    pub fn buttons(&self) -> PhysicalButtonState {
        self.buttons
    }

    pub fn countdown(&self) -> Option<Countdown> {
        self.countdown
    }

    pub fn is_polling(&self) -> bool {
        self.poll.is_some()
    }

    pub fn announcement(&self) -> Option<&str> {
        self.announcement.as_deref()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn instruction_count(&self) -> Option<u64> {
        self.instruction_count
    }

    pub fn store(&self) -> &SessionStore<S> {
        &self.store
    }

    pub fn current_image(&self) -> String {
        self.store
            .current_image()
            .unwrap_or_else(|| self.settings.default_image.clone())
    }

    pub fn current_prompt(&self) -> String {
        self.store
            .current_prompt()
            .unwrap_or_else(|| self.settings.default_prompt.clone())
    }

    pub fn history(&self) -> Vec<String> {
        self.store.history()
    }

    pub fn prompt_history(&self) -> Vec<PromptHistoryEntry> {
        self.store.prompt_history()
    }

    pub fn subscribe_votes(&mut self) -> std::sync::mpsc::Receiver<VoteSignal> {
        self.bus.subscribe()
    }

    fn units(&self, n: u32) -> Duration {
        self.settings.time_unit * n
    }

    /// Whole time units left on the countdown, rounded up
    pub fn countdown_remaining(&self, now: Instant) -> Option<u64> {
        self.countdown.map(|cd| {
            let left = cd.deadline.saturating_duration_since(now);
            let unit = self.settings.time_unit.as_nanos().max(1);
            left.as_nanos().div_ceil(unit) as u64
        })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce(&dyn Backend) -> Option<Completion> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();
        self.executor.spawn(Box::new(move || {
            if let Some(done) = job(backend.as_ref()) {
                // the loop may already be gone during shutdown
                let _ = events.send(AppEvent::Backend(done));
            }
        }));
    }

    // ---- startup ----

    /// Rebuild in-memory state from the store after a restart and probe the
    /// backend.
    pub fn resume(&mut self, now: Instant) -> Result<()> {
        for c in Candidate::ALL {
            let i = c.index();
            self.round.texts[i] = self.store.text(c);
            self.round.images[i] = self.store.image(c);
            self.round.instructions[i] = self.store.instruction(c);
        }
        self.round.reflection = self.store.reflection();
        self.tally = VoteTally::restore(
            self.store.votes(Candidate::A),
            self.store.votes(Candidate::B),
        );

        if self.round.has_images() {
            if let Some(winner) = self.tally.winner() {
                // promotion is written before the round is cleared
                tracing::info!(%winner, "stored round already has a winner, clearing it");
                self.reset_for_next_cycle()?;
            } else {
                tracing::info!("resuming voting round");
                self.phase = Phase::Voting;
                self.controls.start.set("Variants generated", false);
                self.controls.images = Control::new("Images generated", false, true);
                self.controls.voting_visible = true;
                self.begin_voting(now);
            }
        } else if self.round.has_texts() {
            tracing::info!("resuming with variants ready");
            self.phase = Phase::VariantsReady;
            self.controls.start.set("Variants generated", false);
            self.controls.images = Control::new(IMAGES_LABEL, true, true);
        }

        self.refresh_instruction_count();
        Ok(())
    }

    /// Fire-and-forget count probe; the answer arrives as a completion
    pub fn refresh_instruction_count(&self) {
        self.spawn(|backend| {
            let count = match backend.instruction_count() {
                Ok(count) => {
                    tracing::info!(count, "instruction pool size");
                    Some(count)
                }
                Err(err) => {
                    tracing::warn!(%err, "instruction count unavailable");
                    None
                }
            };
            Some(Completion::InstructionCount(count))
        });
    }

    // ---- Idle → VariantsPending → VariantsReady ----

    /// Request two variants of the current prompt. Returns false if a round
    /// is already under way.
    pub fn start_variants(&mut self) -> bool {
        if self.phase != Phase::Idle {
            tracing::debug!(phase = ?self.phase, "ignoring start request");
            return false;
        }
        self.countdown = None;
        self.phase = Phase::VariantsPending;
        self.controls.start.set("Generating variants...", false);
        self.controls.images.visible = false;
        self.controls.voting_visible = false;
        self.round.reflection = None;
        self.announcement = None;

        let token = self.generation;
        let prompt = self.current_prompt();
        let history = self.history();
        let image_url = self.current_image();
        tracing::info!(token, "requesting text variants");
        self.spawn(move |backend| {
            let result = backend.text_variants(&prompt, &history, &image_url);
            Some(Completion::Variants {
                token,
                prompt,
                result,
            })
        });
        true
    }

    fn on_variants(
        &mut self,
        prompt: String,
        result: Result<[String; 2]>,
        now: Instant,
    ) -> Result<()> {
        let texts = match result {
            Ok(texts) => texts,
            Err(err) => {
                tracing::error!(%err, "text variant generation failed");
                self.variants_failed();
                return Ok(());
            }
        };

        let mut batch = Batch::new();
        for (c, text) in Candidate::ALL.into_iter().zip(&texts) {
            batch.text(c, text);
        }
        batch.current_prompt(&prompt);
        if let Err(err) = self.store.commit(batch) {
            tracing::error!(%err, "saving variants failed");
            self.variants_failed();
            return Err(err);
        }

        for (c, text) in Candidate::ALL.into_iter().zip(texts) {
            self.round.texts[c.index()] = Some(text);
        }
        self.phase = Phase::VariantsReady;
        self.controls.start.set("Variants generated", false);
        self.controls.images = Control::new(IMAGES_LABEL, true, true);
        self.schedule(Scheduled::GenerateImages, IMAGE_COUNTDOWN_UNITS, now);
        tracing::info!("variants ready");
        Ok(())
    }

    fn variants_failed(&mut self) {
        self.phase = Phase::Idle;
        self.controls.start.set(ERROR_LABEL, true);
    }

    // ---- VariantsReady → ImagesPending → Voting ----

    /// Generate both images. Returns Ok(false) if not in `VariantsReady`.
    pub fn start_images(&mut self) -> Result<bool> {
        match self.phase {
            Phase::VariantsReady => {}
            Phase::Idle => {
                self.controls.images.set(ERROR_LABEL, true);
                return Err(Error::Validation("Generate the variants first!".into()));
            }
            _ => return Ok(false),
        }
        let texts = match (self.round.text(Candidate::A), self.round.text(Candidate::B)) {
            (Some(a), Some(b)) => [a.to_string(), b.to_string()],
            _ => {
                self.controls.images.set(ERROR_LABEL, true);
                return Err(Error::Validation("Generate the variants first!".into()));
            }
        };

        self.countdown = None;
        self.phase = Phase::ImagesPending;
        self.controls.images.set("Generating images...", false);
        self.round.reflection = None;

        let token = self.generation;
        let image_url = self.current_image();
        let prompt = self.current_prompt();
        let history = self.history();
        tracing::info!(token, "requesting images");
        self.spawn(move |backend| {
            let result = run_image_pipeline(backend, &image_url, &texts, &prompt, &history);
            Some(Completion::Images { token, result })
        });
        Ok(true)
    }

    fn on_images(&mut self, result: Result<ImagesReady>, now: Instant) -> Result<()> {
        let ready = match result {
            Ok(ready) => ready,
            Err(err) => {
                tracing::error!(%err, "image generation failed");
                self.images_failed();
                return Ok(());
            }
        };

        let audit: Vec<PromptHistoryEntry> = ready
            .candidates
            .iter()
            .filter_map(|c| c.audit.clone())
            .collect();
        let saved = self
            .stage_images(&ready, &audit)
            .and_then(|batch| self.store.commit(batch));
        if let Err(err) = saved {
            tracing::error!(%err, "saving images failed");
            self.images_failed();
            return Err(err);
        }

        let ImagesReady {
            candidates,
            reflection,
        } = ready;
        for (c, image) in Candidate::ALL.into_iter().zip(candidates) {
            let i = c.index();
            self.round.images[i] = Some(image.image_url);
            self.round.texts[i] = Some(image.summary);
            self.round.instructions[i] = image.instruction;
        }
        self.round.reflection = Some(reflection);
        self.tally.reset();

        self.phase = Phase::Voting;
        self.controls.images.set("Images generated", false);
        self.controls.voting_visible = true;
        tracing::info!(audit_entries = audit.len(), "images ready, voting open");
        self.begin_voting(now);
        Ok(())
    }

    fn images_failed(&mut self) {
        self.phase = Phase::VariantsReady;
        self.controls.images.set(ERROR_LABEL, true);
    }

    /// Everything a finished image step writes
    fn stage_images(&self, ready: &ImagesReady, audit: &[PromptHistoryEntry]) -> Result<Batch> {
        let mut batch = Batch::new();
        if !audit.is_empty() {
            let mut entries = self.store.prompt_history();
            entries.extend_from_slice(audit);
            batch.prompt_history(&entries)?;
        }
        for (c, image) in Candidate::ALL.into_iter().zip(&ready.candidates) {
            batch
                .image(c, &image.image_url)
                .text(c, &image.summary)
                .instruction(c, image.instruction.as_deref())
                .votes(c, 0);
        }
        batch.reflection(&ready.reflection);
        Ok(batch)
    }

    // ---- voting ----

    fn begin_voting(&mut self, now: Instant) {
        self.check_physical_buttons();
        self.start_poll(now);
    }

    /// Ask the backend whether a hardware device is attached
    pub fn check_physical_buttons(&self) {
        let token = self.generation;
        self.spawn(move |backend| {
            let enabled = match backend.button_status() {
                Ok(enabled) => enabled,
                Err(err) => {
                    tracing::warn!(%err, "physical button status unavailable");
                    false
                }
            };
            Some(Completion::ButtonStatus { token, enabled })
        });
    }

    fn set_buttons(&mut self, enabled: bool) {
        self.buttons = if enabled {
            PhysicalButtonState::Enabled
        } else {
            PhysicalButtonState::Unavailable
        };
        self.controls.digital_votes_enabled = !enabled;
        self.status = self.buttons.status_line().map(str::to_string);
    }

    /// Replace any running poll timer with a fresh one
    fn start_poll(&mut self, now: Instant) {
        if self.poll.is_some() {
            tracing::debug!("replacing previous poll timer");
        }
        self.poll = Some(PollTimer {
            next_at: now + self.units(POLL_PERIOD_UNITS),
            in_flight: false,
        });
    }

    fn stop_poll(&mut self) {
        if self.poll.take().is_some() {
            tracing::debug!("physical button polling stopped");
        }
    }

    fn poll_due(&mut self, now: Instant) {
        if self.phase != Phase::Voting {
            return;
        }
        let period = self.units(POLL_PERIOD_UNITS);
        let Some(poll) = self.poll.as_mut() else {
            return;
        };
        if poll.in_flight || now < poll.next_at {
            return;
        }
        poll.in_flight = true;
        poll.next_at = now + period;

        let token = self.generation;
        self.spawn(move |backend| {
            Some(Completion::ButtonPress {
                token,
                result: backend.poll_button(),
            })
        });
    }

    fn on_button_press(&mut self, result: Result<ButtonPress>, now: Instant) -> Result<()> {
        if let Some(poll) = self.poll.as_mut() {
            poll.in_flight = false;
        }
        if self.phase != Phase::Voting {
            return Ok(());
        }
        match result {
            Ok(ButtonPress {
                pressed: true,
                button,
            }) => match button.and_then(Candidate::from_number) {
                Some(candidate) => {
                    tracing::info!(%candidate, "physical button pressed");
                    let outcome = self.vote(candidate, now)?;
                    if let VoteOutcome::Counted { votes, .. } = outcome {
                        self.status = Some(format!(
                            "Physical Button {candidate} voted! ({votes}/{VOTES_TO_WIN} votes)"
                        ));
                    }
                }
                None => tracing::warn!(?button, "unknown physical button"),
            },
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(%err, "physical button poll failed");
                self.set_buttons(false);
            }
        }
        Ok(())
    }

    /// A digital vote; dropped while hardware buttons own the vote
    pub fn digital_vote(&mut self, candidate: Candidate, now: Instant) -> Result<VoteOutcome> {
        if !self.controls.digital_votes_enabled {
            tracing::debug!(%candidate, "digital vote ignored, physical buttons active");
            return Ok(VoteOutcome::Ignored);
        }
        self.vote(candidate, now)
    }

    /// Add one vote. Increment and threshold check happen together; the
    /// vote that reaches the threshold selects the winner before returning.
    pub fn vote(&mut self, candidate: Candidate, now: Instant) -> Result<VoteOutcome> {
        if self.phase != Phase::Voting {
            return Ok(VoteOutcome::Ignored);
        }
        let before = self.tally;
        let outcome = self.tally.push(candidate);
        let (votes, winner) = match outcome {
            VoteOutcome::Ignored => return Ok(outcome),
            VoteOutcome::Counted { votes, .. } => (votes, None),
            VoteOutcome::Won { candidate, votes } => (votes, Some(candidate)),
        };
        tracing::info!(%candidate, votes, "vote");

        let signal = VoteSignal {
            candidate,
            timestamp: Local::now(),
        };
        let mut batch = Batch::new();
        batch
            .votes(candidate, votes)
            .vote_trigger(candidate, signal.timestamp.timestamp_millis());
        let saved = match winner {
            Some(winner) => self.stage_promotion(winner, &mut batch),
            None => Ok(()),
        }
        .and_then(|()| self.store.commit(batch));
        if let Err(err) = saved {
            tracing::error!(%err, %candidate, "vote not saved");
            self.tally = before;
            return Err(err);
        }
        self.bus.publish(signal);

        if let Some(winner) = winner {
            self.select_winner(winner, now);
        }
        Ok(outcome)
    }

    // ---- Voting → WinnerSelected → Idle ----

    /// The winner's image and text become the new session head
    fn stage_promotion(&self, winner: Candidate, batch: &mut Batch) -> Result<()> {
        let (image, text) = match (self.round.image(winner), self.round.text(winner)) {
            (Some(i), Some(t)) => (i, t),
            _ => {
                return Err(Error::Validation(format!(
                    "variant {winner} has no image or text to promote"
                )))
            }
        };
        let mut history = self.store.history();
        history.push(text.to_string());
        batch
            .current_image(image)
            .current_prompt(text)
            .history(&history)?;
        Ok(())
    }

    /// Runs after the promotion is saved
    fn select_winner(&mut self, winner: Candidate, now: Instant) {
        self.stop_poll();
        let votes = self.tally.get(winner);
        tracing::info!(%winner, votes, "winner selected");
        self.phase = Phase::WinnerSelected(winner);
        self.announcement = Some(format!("Variant {winner} WINS with {votes} votes!"));
        self.clear_at = Some(now + self.units(WINNER_DELAY_UNITS));

        if let Some(instruction) = self.round.instruction(winner.other()).map(str::to_string) {
            self.retire_instruction(instruction);
        }
    }

    /// Best-effort: drop the losing instruction from the backend pool and
    /// refresh the count. Failures are only logged.
    fn retire_instruction(&self, instruction: String) {
        self.spawn(move |backend| {
            match backend.remove_instruction(&instruction) {
                Ok(ack) => tracing::info!(%instruction, %ack, "instruction removed"),
                Err(err) => {
                    tracing::warn!(%instruction, %err, "instruction removal failed");
                }
            }
            match backend.instruction_count() {
                Ok(count) => Some(Completion::InstructionCount(Some(count))),
                Err(err) => {
                    tracing::warn!(%err, "instruction count refresh failed");
                    None
                }
            }
        });
    }

    /// Clear round-scoped state, keeping the session
    pub fn reset_for_next_cycle(&mut self) -> Result<()> {
        self.store.clear_round()?;
        self.generation += 1;
        self.round = Round::default();
        self.tally.reset();
        self.phase = Phase::Idle;
        self.controls = Controls {
            digital_votes_enabled: self.controls.digital_votes_enabled,
            ..Controls::default()
        };
        self.stop_poll();
        self.countdown = None;
        self.clear_at = None;
        self.announcement = None;
        tracing::debug!(generation = self.generation, "round cleared");
        Ok(())
    }

    /// Wipe every durable key and return to the first-launch state
    pub fn full_reset(&mut self) -> Result<()> {
        self.store.clear_all()?;
        self.generation += 1;
        self.round = Round::default();
        self.tally.reset();
        self.phase = Phase::Idle;
        self.controls = Controls::default();
        self.buttons = PhysicalButtonState::Unknown;
        self.stop_poll();
        self.countdown = None;
        self.clear_at = None;
        self.announcement = None;
        self.status = None;
        tracing::info!("full reset");
        Ok(())
    }

    // ---- timers ----

    fn schedule(&mut self, action: Scheduled, units: u32, now: Instant) {
        self.countdown = Some(Countdown {
            action,
            deadline: now + self.units(units),
        });
        self.update_countdown_label(now);
    }

    fn update_countdown_label(&mut self, now: Instant) {
        let (Some(cd), Some(left)) = (self.countdown, self.countdown_remaining(now)) else {
            return;
        };
        match cd.action {
            Scheduled::GenerateImages => self
                .controls
                .images
                .set(format!("Generating images in {left}s"), true),
            Scheduled::GenerateVariants => self
                .controls
                .start
                .set(format!("Generating variants in {left}s"), true),
        }
    }

    /// Advance deadlines. Safe to call on every event.
    pub fn on_tick(&mut self, now: Instant) -> Result<()> {
        if let Some(at) = self.clear_at {
            if now >= at {
                self.reset_for_next_cycle()?;
                self.schedule(Scheduled::GenerateVariants, NEXT_ROUND_COUNTDOWN_UNITS, now);
            }
        }

        if let Some(cd) = self.countdown {
            if now >= cd.deadline {
                self.countdown = None;
                match cd.action {
                    Scheduled::GenerateImages => {
                        self.start_images()?;
                    }
                    Scheduled::GenerateVariants => {
                        self.start_variants();
                    }
                }
            } else {
                self.update_countdown_label(now);
            }
        }

        self.poll_due(now);
        Ok(())
    }

    // ---- completions ----

    /// Apply a backend completion. Stale completions are dropped.
    pub fn apply(&mut self, completion: Completion, now: Instant) -> Result<()> {
        match completion {
            Completion::InstructionCount(count) => {
                if count.is_some() {
                    self.instruction_count = count;
                }
                Ok(())
            }
            Completion::Variants {
                token,
                prompt,
                result,
            } => {
                if self.is_current(token, Phase::VariantsPending, "variants") {
                    self.on_variants(prompt, result, now)
                } else {
                    Ok(())
                }
            }
            Completion::Images { token, result } => {
                if self.is_current(token, Phase::ImagesPending, "images") {
                    self.on_images(result, now)
                } else {
                    Ok(())
                }
            }
            Completion::ButtonStatus { token, enabled } => {
                if self.is_current(token, Phase::Voting, "button status") {
                    self.set_buttons(enabled);
                }
                Ok(())
            }
            Completion::ButtonPress { token, result } => {
                if token == self.generation {
                    self.on_button_press(result, now)
                } else {
                    tracing::debug!(token, "dropping stale button poll");
                    Ok(())
                }
            }
        }
    }

    fn is_current(&self, token: u64, expected: Phase, what: &str) -> bool {
        let current = token == self.generation && self.phase == expected;
        if !current {
            tracing::debug!(
                token,
                generation = self.generation,
                phase = ?self.phase,
                what,
                "dropping stale completion"
            );
        }
        current
    }
}
