use std::fs::File;
use std::sync::Arc;

use jukebot::Jukebox;
use jukebot::config::{self, Config};
use jukebot::console::Console;
use jukebot::doctor;
use jukebot::player::ProcessOutput;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Log to a file so the console stays readable
    let log_path = std::env::temp_dir().join("jukebot.log");
    let log_file = File::create(&log_path).ok();

    if let Some(file) = log_file {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_target(false)
            .with_ansi(false)
            .with_writer(file)
            .init();
    } else {
        // Fallback to stderr if can't create log file
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_target(false)
            .init();
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(config::ConfigError::NotFound(_)) => Config::default(),
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            if let Ok(path) = Config::config_path() {
                eprintln!("\nConfig file: {}", path.display());
            }
            std::process::exit(1);
        }
    };

    if std::env::args().nth(1).as_deref() == Some("doctor") {
        let results = doctor::run_checks(&config);
        doctor::print_results(&results);
        return;
    }

    let jukebox = match Jukebox::from_config(&config).await {
        Ok(jukebox) => Arc::new(jukebox),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let output = Arc::new(ProcessOutput::new(&config.player));
    let user = std::env::var("USER").unwrap_or_else(|_| "console".to_string());
    if let Err(e) = Console::new(jukebox, output, user).run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
