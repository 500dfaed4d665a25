//! Tracing initialisation

use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (for example `"mongowire=info"`).
///
/// Returns `Ok(false)` when a global subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> Result<bool> {
    let directive = default_directive
        .parse()
        .map_err(|e| Error::Config(format!("Invalid log directive '{}': {}", default_directive, e)))?;
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    let installed = tracing_subscriber::fmt()
        .with_env_filter(build_filter(from_env.as_deref(), directive))
        .with_target(true)
        .try_init()
        .is_ok();

    Ok(installed)
}

/// `RUST_LOG` replaces the default entirely; an unset, blank or unparsable
/// value falls back to it.
fn build_filter(from_env: Option<&str>, default: Directive) -> EnvFilter {
    from_env
        .filter(|value| !value.trim().is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::default().add_directive(default))
}
