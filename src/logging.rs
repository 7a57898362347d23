//! `env_logger` setup for hosts embedding the library.
//!
//! Library code only uses the `log` macros. Hosts that have no logger of
//! their own call [`init`] once at startup; `RUST_LOG` overrides the
//! default `info` filter. Setting `WALLETLINK_LOG_FILE` redirects output
//! to that file (useful when stdout belongs to a UI).

use std::path::Path;

use anyhow::{Context, Result};

/// Environment variable naming an optional log file.
pub const LOG_FILE_ENV: &str = "WALLETLINK_LOG_FILE";

/// Install the global logger. Safe to call more than once.
pub fn init() -> Result<()> {
    match std::env::var(LOG_FILE_ENV) {
        Ok(path) => init_to_file(Path::new(&path)),
        Err(_) => {
            let _ = builder().try_init();
            Ok(())
        }
    }
}

/// Install the global logger writing to `path` (truncated).
pub fn init_to_file(path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create log file at {}", path.display()))?;
    let _ = builder()
        .target(env_logger::Target::Pipe(Box::new(file)))
        .try_init();
    Ok(())
}

fn builder() -> env_logger::Builder {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_to_file_creates_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("walletlink.log");
        init_to_file(&path).unwrap();
        assert!(path.exists());
        // A second install is a no-op rather than a panic.
        init().unwrap();
    }
}
