//! # mindwave-cli
//!
//! Runs one trial session against a MindWave headset through the
//! ThinkGear Connector and saves it under `<output>/<user>_NN/`:
//! `data.csv` with the tagged samples, `events.csv` with the session
//! steps and `session.info` with the subject and setup.
//!
//! Ctrl-C ends the session early; whatever was recorded is still saved.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use mindwave::config::MindwaveConfig;
use mindwave::session::{SessionDir, SessionSettings};
use mindwave::{Connector, Session};

/// Run a MindWave trial session and save it to a session directory.
#[derive(Parser)]
#[command(name = "mindwave-cli", version, about)]
struct Cli {
    /// Path to mindwave.toml config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// ThinkGear Connector host override
    #[arg(long)]
    host: Option<String>,

    /// ThinkGear Connector port override
    #[arg(long)]
    port: Option<u16>,

    /// Connection attempts before giving up
    #[arg(long)]
    tries: Option<u32>,

    /// Seconds to wait for headset data on each attempt
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Participant name recorded with the session
    #[arg(short, long)]
    user: Option<String>,

    /// Comma-separated class labels, e.g. `left,right`
    #[arg(long, value_delimiter = ',')]
    classes: Vec<String>,

    /// Trials per class
    #[arg(long)]
    trials: Option<u32>,

    /// Seed for trial order and motor jitter (replays a previous plan)
    #[arg(long)]
    seed: Option<u64>,

    /// Base directory; each run gets its own `<user>_NN` folder inside
    #[arg(short, long, default_value = "sessions")]
    output: PathBuf,

    /// Enable verbose logging (set RUST_LOG for fine-grained control)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn session_settings(&self, config: &MindwaveConfig) -> SessionSettings {
        let mut settings = config
            .session
            .clone()
            .unwrap_or_else(|| SessionSettings::new("anonymous"));
        if let Some(user) = &self.user {
            settings.user_name.clone_from(user);
        }
        if !self.classes.is_empty() {
            settings.classes.clone_from(&self.classes);
        }
        if let Some(trials) = self.trials {
            settings.n_trials = trials;
        }
        if self.seed.is_some() {
            settings.seed = self.seed;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("mindwave=debug,mindwave_cli=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("mindwave=info")
            .init();
    }

    let mut config = match MindwaveConfig::discover(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Note: {e}. Using defaults.");
            MindwaveConfig::default()
        }
    };
    if let Some(host) = &cli.host {
        config.connector.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.connector.port = port;
    }
    if let Some(tries) = cli.tries {
        config.connector.attempts = tries;
    }
    if let Some(secs) = cli.timeout_secs {
        config.connector.attempt_timeout_ms = secs.saturating_mul(1_000);
    }

    tracing::debug!(
        addr = %config.connector.addr(),
        attempts = config.connector.attempts,
        "Resolved connector config"
    );

    let session_config = cli.session_settings(&config).into_config()?;

    let connector = Connector::new(config.connector.clone());
    let _status = connector.on_status_change(|state| println!("[headset] {state}"));
    let _quality = connector.on_signal_quality_change(|q| println!("[headset] signal {q}%"));
    let _timeouts = connector.on_timeout(|attempt| {
        println!("[headset] attempt {attempt}: no data yet; is the headset on?");
    });

    println!("Connecting to {}...", config.connector.addr());
    let connected = connector
        .start(config.connector.attempts, config.connector.attempt_timeout())
        .await;
    if !connected {
        eprintln!("No headset data. Make sure the ThinkGear Connector is running.");
        return Ok(());
    }

    let mut session = Session::new(&connector, session_config);
    println!(
        "Session for {}: {} trials, seed {}",
        session.config().user_name(),
        session.trials().len(),
        session.seed()
    );
    let _signals = session.on_signal(|event| println!("[session] {event}"));

    let stop = session.stop_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Stopping session...");
            stop.stop();
        }
    });

    session.start()?;
    let recording = session.finished().await?;
    let samples = recording.len();
    let duration = (recording.ended_at - recording.started_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    ctrl_c.abort();
    println!("Recorded {samples} samples in {:.1}s", duration.as_secs_f32());

    if samples == 0 {
        println!("Nothing to save.");
    } else {
        let mut store = SessionDir::create_for_user(&cli.output, session.config().user_name())?;
        let rows = session.save(&mut store).await?;
        println!("Saved {rows} rows to {}", store.path().display());
    }

    connector.stop().await;
    Ok(())
}
