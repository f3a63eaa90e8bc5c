use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::round::RoundMachine;
use crate::runtime::AppEvent;
use crate::store::KvStore;
use crate::voting::{Candidate, VoteSignal};

/// How long a candidate panel stays highlighted after a vote
const FLASH_FOR: Duration = Duration::from_millis(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Round,
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct App<S: KvStore> {
    pub machine: RoundMachine<S>,
    pub view: View,
    pub history_scroll: u16,
    /// Last inline error shown under the controls
    pub error: Option<String>,
    votes: Receiver<VoteSignal>,
    flash: Option<(Candidate, Instant)>,
}

impl<S: KvStore> App<S> {
    pub fn new(mut machine: RoundMachine<S>) -> Self {
        let votes = machine.subscribe_votes();
        Self {
            machine,
            view: View::Round,
            history_scroll: 0,
            error: None,
            votes,
            flash: None,
        }
    }

    /// Candidate highlighted because it was just voted for
    pub fn flashing(&self, now: Instant) -> Option<Candidate> {
        self.flash
            .filter(|(_, at)| now.duration_since(*at) < FLASH_FOR)
            .map(|(c, _)| c)
    }

    fn report<T>(&mut self, result: crate::error::Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(err) => {
                if err.is_remote() {
                    tracing::warn!(%err, "backend request failed");
                } else {
                    tracing::error!(%err, "operation failed");
                }
                self.error = Some(err.to_string());
                None
            }
        }
    }

    /// Feed one event through the machine
    pub fn handle(&mut self, event: AppEvent, now: Instant) -> Flow {
        let flow = match event {
            AppEvent::Key(key) => self.on_key(key, now),
            AppEvent::Backend(done) => {
                let result = self.machine.apply(done, now);
                self.report(result);
                Flow::Continue
            }
            AppEvent::Resize | AppEvent::Tick => Flow::Continue,
        };

        let result = self.machine.on_tick(now);
        self.report(result);

        while let Ok(signal) = self.votes.try_recv() {
            self.flash = Some((signal.candidate, now));
        }
        flow
    }

    fn on_key(&mut self, key: KeyEvent, now: Instant) -> Flow {
        if key.code == KeyCode::Esc
            || (key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c'))
        {
            return Flow::Quit;
        }

        if self.view == View::History {
            match key.code {
                KeyCode::Char('h') | KeyCode::Char('b') | KeyCode::Backspace => {
                    self.view = View::Round;
                }
                KeyCode::Up => self.history_scroll = self.history_scroll.saturating_sub(1),
                KeyCode::Down => self.history_scroll = self.history_scroll.saturating_add(1),
                KeyCode::PageUp => self.history_scroll = self.history_scroll.saturating_sub(10),
                KeyCode::PageDown => self.history_scroll = self.history_scroll.saturating_add(10),
                KeyCode::Home => self.history_scroll = 0,
                _ => {}
            }
            return Flow::Continue;
        }

        match key.code {
            KeyCode::Char('g') => {
                self.error = None;
                self.machine.start_variants();
            }
            KeyCode::Char('i') => {
                self.error = None;
                let result = self.machine.start_images();
                self.report(result);
            }
            KeyCode::Char('1') => {
                let result = self.machine.digital_vote(Candidate::A, now);
                self.report(result);
            }
            KeyCode::Char('2') => {
                let result = self.machine.digital_vote(Candidate::B, now);
                self.report(result);
            }
            KeyCode::Char('h') => {
                self.view = View::History;
                self.history_scroll = 0;
            }
            KeyCode::Char('o') => {
                let image = self.machine.current_image();
                if webbrowser::Browser::is_available() {
                    if let Err(err) = webbrowser::open(&image) {
                        tracing::warn!(%image, %err, "could not open image");
                    }
                }
            }
            KeyCode::Char('R') => {
                self.error = None;
                let result = self.machine.full_reset();
                self.report(result);
            }
            _ => {}
        }
        Flow::Continue
    }
}
