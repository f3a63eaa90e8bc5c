use clap::{error::ErrorKind, CommandFactory, Parser};
use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    tty::IsTty,
};
use evolv::{
    app::{App, Flow},
    app_dirs::AppDirs,
    config::{Config, ConfigStore, FileConfigStore},
    gateway::{resolve_base_url, HttpGateway},
    round::{RoundMachine, RoundSettings},
    runtime::{CrosstermEventSource, FixedTicker, Runner, ThreadExecutor},
    store::{KvStore, SessionStore, SqliteStore},
    ui,
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    Terminal,
};
use std::{
    error::Error,
    io::{self, stdin},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const TICK_RATE_MS: u64 = 100;
const LOG_FILE: &str = "evolv.log";

/// terminal client for a voted, round-based image evolution experiment
#[derive(Parser, Debug, Clone)]
#[clap(
    version,
    about,
    long_about = "Each round proposes two mutations of the current image prompt, renders both, and lets the audience vote. The first variant to reach three votes becomes the next generation."
)]
pub struct Cli {
    /// backend base URL; overrides origin inference
    #[clap(short = 'a', long)]
    api: Option<String>,

    /// origin the client is served from, used to infer the backend address
    #[clap(long)]
    origin: Option<String>,

    /// path of the session database
    #[clap(long)]
    state_db: Option<PathBuf>,

    /// path of the JSON config file
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// length of one countdown/poll time unit in milliseconds
    #[clap(short = 't', long)]
    time_unit_ms: Option<u64>,

    /// wipe all stored session state and exit
    #[clap(long)]
    reset: bool,
}

impl Cli {
    /// Layer command-line flags over the loaded config
    fn merge(&self, mut cfg: Config) -> Config {
        if let Some(api) = &self.api {
            cfg.api_base = Some(api.clone());
        }
        if let Some(origin) = &self.origin {
            cfg.origin = Some(origin.clone());
        }
        if let Some(ms) = self.time_unit_ms {
            cfg.time_unit_ms = ms;
        }
        cfg
    }

    fn db_path(&self) -> PathBuf {
        self.state_db
            .clone()
            .or_else(AppDirs::db_path)
            .unwrap_or_else(|| PathBuf::from("evolv_state.db"))
    }
}

fn init_tracing() -> Option<WorkerGuard> {
    let dir = AppDirs::log_dir()?;
    if let Err(err) = std::fs::create_dir_all(&dir) {
        eprintln!("logging disabled, cannot create {}: {err}", dir.display());
        return None;
    }
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
        dir, LOG_FILE,
    ));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("evolv=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let _guard = init_tracing();

    let config_store = match &cli.config {
        Some(path) => FileConfigStore::with_path(path),
        None => FileConfigStore::new(),
    };
    let cfg = cli.merge(config_store.load());
    let db_path = cli.db_path();
    tracing::info!(db = %db_path.display(), config = %config_store.path().display(), "starting");

    let mut store = SqliteStore::open(&db_path)?;
    if cli.reset {
        store.clear()?;
        tracing::info!("session state wiped");
        println!("session state in {} wiped", db_path.display());
        return Ok(());
    }

    if !stdin().is_tty() {
        let mut cmd = Cli::command();
        cmd.error(ErrorKind::Io, "stdin must be a tty").exit();
    }

    let base_url = resolve_base_url(cfg.api_base.as_deref(), cfg.origin.as_deref());
    let gateway = HttpGateway::new(base_url, cfg.request_timeout())?;
    tracing::info!(base_url = gateway.base_url(), "backend");

    let events = CrosstermEventSource::new();
    let mut machine = RoundMachine::new(
        SessionStore::new(store),
        Arc::new(gateway),
        Arc::new(ThreadExecutor),
        events.sender(),
        RoundSettings::from(&cfg),
    );
    machine.resume(Instant::now())?;
    let mut app = App::new(machine);

    enable_raw_mode()?;

    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let runner = Runner::new(events, FixedTicker::new(Duration::from_millis(TICK_RATE_MS)));
    let res = start_tui(&mut terminal, &mut app, &runner);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen,)?;
    terminal.show_cursor()?;

    if let Err(err) = &res {
        tracing::error!(%err, "terminal loop failed");
    }
    res
}

fn start_tui<B: Backend, S: KvStore>(
    terminal: &mut Terminal<B>,
    app: &mut App<S>,
    runner: &Runner<CrosstermEventSource, FixedTicker>,
) -> Result<(), Box<dyn Error>> {
    loop {
        let now = Instant::now();
        terminal.draw(|f| ui::draw(app, f, now))?;

        let event = runner.step();
        if app.handle(event, Instant::now()) == Flow::Quit {
            tracing::info!("quit");
            return Ok(());
        }
    }
}
