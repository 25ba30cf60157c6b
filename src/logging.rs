use std::fs::OpenOptions;

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

fn filter_from_env_or_default(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

pub fn init_terminal(verbose: bool) {
    let filter = filter_from_env_or_default(verbose);
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

pub fn init_file(path: &str, verbose: bool) -> anyhow::Result<()> {
    let filter = filter_from_env_or_default(verbose);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_target(false)
        .with_ansi(false)
        .try_init();
    Ok(())
}
