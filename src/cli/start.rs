use crate::cli::{actions::Action, commands, dispatch, telemetry};
use anyhow::Result;

/// Parse the command line, bring up telemetry, and resolve the action.
///
/// Backend selection is checked before telemetry init: a launch without a
/// policy engine must fail with a plain error on stderr, not after a
/// subscriber and an OTLP exporter have already been installed.
///
/// # Errors
///
/// Returns an error on invalid arguments, missing policy backend, or
/// telemetry initialization failure.
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();
    commands::validate(&matches).map_err(anyhow::Error::msg)?;

    let verbosity = matches
        .get_one::<u8>(commands::logging::ARG_VERBOSITY)
        .copied()
        .unwrap_or(0);
    telemetry::init(level_for(verbosity))?;

    // dispatch re-checks the backend choice so it stays safe to call directly.
    dispatch::handler(&matches)
}

/// `-v` count to tracing level. Silent beyond errors by default; the audit
/// stream has its own directive in telemetry and is not affected by this.
const fn level_for(verbosity: u8) -> Option<tracing::Level> {
    match verbosity {
        0 => None,
        1 => Some(tracing::Level::WARN),
        2 => Some(tracing::Level::INFO),
        3 => Some(tracing::Level::DEBUG),
        _ => Some(tracing::Level::TRACE),
    }
}

#[cfg(test)]
mod tests {
    use super::level_for;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_for(0), None);
        assert_eq!(level_for(1), Some(tracing::Level::WARN));
        assert_eq!(level_for(2), Some(tracing::Level::INFO));
        assert_eq!(level_for(3), Some(tracing::Level::DEBUG));
        assert_eq!(level_for(9), Some(tracing::Level::TRACE));
    }
}
