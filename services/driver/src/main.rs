//! Hydra driver
//!
//! Thin command-line caller for the engine:
//! 1. Loads TOML configuration and sets up logging
//! 2. Builds the engine and refreshes fleet tokens
//! 3. Submits every URL given on the command line or via `--urls <file>`
//! 4. Prints the JSON-decoded responses, one per line
//!
//! Exit codes: 0 on success, 42 when the emergency-stop file is found
//! (raised by the engine's admission path), 130 on Ctrl-C.

use std::io::IsTerminal;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use intra_console::ConsoleCredentials;
use intra_hydra::{Hydra, HydraConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config = match flag_value(&args, "--config") {
        Some(path) => HydraConfig::load(Path::new(path))
            .with_context(|| format!("failed to load config from {path}"))?,
        None => HydraConfig::default(),
    };
    init_tracing(&config)?;
    info!("starting hydra");

    // Console credentials are optional: fleet control needs them, plain URL
    // submission does not.
    match ConsoleCredentials::from_env() {
        Ok(creds) => debug!(login = %creds.login, "console credentials loaded"),
        Err(e) => debug!(error = %e, "console credentials not available"),
    }

    let urls = collect_urls(&args, flag_value(&args, "--urls"))?;
    if urls.is_empty() {
        anyhow::bail!("no urls given (pass them as arguments or via --urls <file>)");
    }
    info!(urls = urls.len(), "submitting requests");

    let hydra = Hydra::new(config).await?;

    tokio::select! {
        result = run(&hydra, &urls) => {
            hydra.close().await;
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, finishing up");
            hydra.close().await;
            std::process::exit(130);
        }
    }
    Ok(())
}

/// Refresh tokens, fan the URLs out, and print the decoded responses.
async fn run(hydra: &Hydra, urls: &[String]) -> Result<()> {
    hydra.refresh_tokens().await;
    for url in urls {
        hydra.submit_get(url.clone(), None).await?;
    }
    hydra.join().await;

    for (url, body) in hydra.responses_as_json().await {
        println!("{url}\t{body}");
    }
    let stats = hydra.stats();
    info!(
        ok = stats.ok_requests,
        non_ok = stats.non_ok_requests,
        bytes = stats.response_bytes,
        "done"
    );
    Ok(())
}

/// Value following a `--flag` argument, if any.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// URLs from the `--urls` file (one per line, `#` comments) plus positional
/// arguments.
fn collect_urls(args: &[String], urls_file: Option<&str>) -> Result<Vec<String>> {
    let mut urls = Vec::new();
    if let Some(path) = urls_file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read url list from {path}"))?;
        urls.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_owned),
        );
    }
    let mut skip_next = false;
    for arg in args.iter().skip(1) {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "--config" || arg == "--urls" {
            skip_next = true;
            continue;
        }
        if arg.starts_with("--") {
            continue;
        }
        urls.push(arg.clone());
    }
    Ok(urls)
}

/// Initialize tracing from `LOG_LEVEL` (falling back to the configured
/// level). Color only goes to a terminal; a log file never gets ANSI.
fn init_tracing(config: &HydraConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    match &config.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(std::io::stdout().is_terminal())
                .init();
        }
    }
    Ok(())
}
