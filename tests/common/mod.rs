// Shared fixtures: a scripted backend and a harness that pumps backend
// completions into the round machine without threads or a terminal.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use evolv::error::{Error, Result};
use evolv::gateway::{Backend, ButtonPress, DebugInfo, GeneratedImage};
use evolv::round::{Phase, RoundMachine, RoundSettings};
use evolv::runtime::{AppEvent, InlineExecutor};
use evolv::store::{KvStore, MemoryStore, SessionStore};
use serde_json::{json, Value};

pub const UNIT: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct Script {
    pub variants: Option<[String; 2]>,
    pub fail_variants: bool,
    /// Image generation fails for this variant text
    pub fail_image_for: Option<String>,
    /// Summary fails for this variant text
    pub fail_summary_for: Option<String>,
    pub fail_reflection: bool,
    pub fail_remove: bool,
    /// Omit debug info from image responses
    pub no_debug: bool,
    /// `None` means the status endpoint errors
    pub buttons: Option<bool>,
    pub presses: VecDeque<ButtonPress>,
    pub poll_error: bool,
    pub instruction_count: u64,
}

#[derive(Debug, Default)]
pub struct Calls {
    pub variants: usize,
    pub images: Vec<(String, String)>,
    pub summaries: usize,
    pub reflections: usize,
    pub removed: Vec<String>,
    pub status_checks: usize,
    pub polls: usize,
    pub counts: usize,
}

#[derive(Default)]
pub struct ScriptedBackend {
    pub script: Mutex<Script>,
    pub calls: Mutex<Calls>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: Mutex::new(Calls::default()),
        })
    }

    pub fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn calls(&self) -> std::sync::MutexGuard<'_, Calls> {
        self.calls.lock().unwrap()
    }
}

/// Deterministic image address for a variant text
pub fn image_url_for(text: &str) -> String {
    format!("https://img.test/{}.png", text.replace(' ', "-"))
}

fn down(what: &str) -> Error {
    Error::backend(Some(500), format!("{what} unavailable"))
}

impl Backend for ScriptedBackend {
    fn text_variants(
        &self,
        _prompt: &str,
        _history: &[String],
        _image_url: &str,
    ) -> Result<[String; 2]> {
        self.calls().variants += 1;
        let script = self.script();
        if script.fail_variants {
            return Err(down("variants"));
        }
        Ok(script.variants.clone().unwrap_or_else(|| {
            [
                "make the circle red".to_string(),
                "make the circle a square".to_string(),
            ]
        }))
    }

    fn image(&self, image_url: &str, prompt: &str) -> Result<GeneratedImage> {
        self.calls()
            .images
            .push((image_url.to_string(), prompt.to_string()));
        let script = self.script();
        if script.fail_image_for.as_deref() == Some(prompt) {
            return Err(down("image"));
        }
        let debug = (!script.no_debug).then(|| DebugInfo {
            final_prompt: Some(format!("final: {prompt}")),
            random_instruction: Some(format!("instruction for {prompt}")),
        });
        Ok(GeneratedImage {
            image_url: image_url_for(prompt),
            debug,
        })
    }

    fn summary(&self, variant_text: &str, _instruction: &str) -> Result<String> {
        self.calls().summaries += 1;
        if self.script().fail_summary_for.as_deref() == Some(variant_text) {
            return Err(down("summary"));
        }
        Ok(format!("summary: {variant_text}"))
    }

    fn reflection(&self, _prompt: &str, history: &[String]) -> Result<String> {
        self.calls().reflections += 1;
        if self.script().fail_reflection {
            return Err(down("reflection"));
        }
        Ok(format!("reflecting on {} generations", history.len()))
    }

    fn remove_instruction(&self, instruction: &str) -> Result<Value> {
        self.calls().removed.push(instruction.to_string());
        let mut script = self.script();
        if script.fail_remove {
            return Err(down("remove"));
        }
        script.instruction_count = script.instruction_count.saturating_sub(1);
        Ok(json!({"status": "ok"}))
    }

    fn instruction_count(&self) -> Result<u64> {
        self.calls().counts += 1;
        Ok(self.script().instruction_count)
    }

    fn button_status(&self) -> Result<bool> {
        self.calls().status_checks += 1;
        self.script()
            .buttons
            .ok_or_else(|| Error::Network("connection refused".into()))
    }

    fn poll_button(&self) -> Result<ButtonPress> {
        self.calls().polls += 1;
        let mut script = self.script();
        if script.poll_error {
            return Err(Error::Network("connection refused".into()));
        }
        Ok(script.presses.pop_front().unwrap_or(ButtonPress {
            pressed: false,
            button: None,
        }))
    }
}

pub struct Harness<S: KvStore = MemoryStore> {
    pub machine: RoundMachine<S>,
    pub backend: Arc<ScriptedBackend>,
    pub rx: Receiver<AppEvent>,
    pub t0: Instant,
}

pub fn settings() -> RoundSettings {
    RoundSettings {
        time_unit: UNIT,
        default_image: "CircleStart.png".into(),
        default_prompt: "a simple circle".into(),
    }
}

impl Harness {
    pub fn new(script: Script) -> Self {
        Self::with_store(script, MemoryStore::new())
    }

    pub fn with_store(script: Script, store: MemoryStore) -> Self {
        Self::with_kv(script, store)
    }
}

impl<S: KvStore> Harness<S> {
    pub fn with_kv(script: Script, store: S) -> Self {
        let backend = ScriptedBackend::new(script);
        let (tx, rx) = mpsc::channel();
        let machine = RoundMachine::new(
            SessionStore::new(store),
            backend.clone(),
            Arc::new(InlineExecutor),
            tx,
            settings(),
        );
        Self {
            machine,
            backend,
            rx,
            t0: Instant::now(),
        }
    }

    pub fn at(&self, units: u32) -> Instant {
        self.t0 + UNIT * units
    }

    /// Apply every queued backend completion
    pub fn pump(&mut self, now: Instant) -> usize {
        self.try_pump(now).unwrap()
    }

    /// Like `pump`, but stops at the first completion that fails to apply
    pub fn try_pump(&mut self, now: Instant) -> Result<usize> {
        let mut applied = 0;
        while let Ok(event) = self.rx.try_recv() {
            if let AppEvent::Backend(done) = event {
                self.machine.apply(done, now)?;
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Drain queued events without applying them
    pub fn take_pending(&mut self) -> Vec<AppEvent> {
        self.rx.try_iter().collect()
    }

    pub fn to_variants_ready(&mut self) {
        assert!(self.machine.start_variants());
        let t0 = self.t0;
        self.pump(t0);
        assert_eq!(self.machine.phase(), Phase::VariantsReady);
    }

    pub fn to_voting(&mut self) {
        self.to_variants_ready();
        assert!(self.machine.start_images().unwrap());
        let t0 = self.t0;
        self.pump(t0);
        assert_eq!(self.machine.phase(), Phase::Voting);
    }
}
