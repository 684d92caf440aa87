//! Tracing bootstrap for the smoke run.

use std::env;

use tracing::debug;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,ditto_smoke=debug,ditto_session=debug,ditto_core=debug";

/// Filter variables after `RUST_LOG`, most specific first.
const FILTER_KEYS: [&str; 2] = ["DITTO_SMOKE_LOG", "DITTO_LOG"];

/// Install the global subscriber. `RUST_LOG` wins, then [`FILTER_KEYS`],
/// then the built-in default. Unparseable values are skipped.
pub fn init() {
    let (filter, source) = select_filter(|key| env::var(key).ok());
    let installed = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(filter)
        .try_init()
        .is_ok();
    if installed {
        debug!(source, "log filter selected");
    }
}

/// The first usable filter and the variable it came from.
fn select_filter<F>(mut lookup: F) -> (EnvFilter, &'static str)
where
    F: FnMut(&str) -> Option<String>,
{
    ["RUST_LOG"]
        .into_iter()
        .chain(FILTER_KEYS)
        .find_map(|key| {
            let value = lookup(key).filter(|value| !value.trim().is_empty())?;
            EnvFilter::try_new(value).ok().map(|filter| (filter, key))
        })
        .unwrap_or_else(|| (EnvFilter::new(DEFAULT_FILTER), "default"))
}
