use crate::cli::actions::{Action, server::Args};
use crate::cli::commands;
use anyhow::{Context, Result};
use std::path::PathBuf;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    commands::validate(matches).map_err(anyhow::Error::msg)?;

    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;
    let redis_url = matches
        .get_one::<String>("redis-url")
        .cloned()
        .context("missing required argument: --redis-url")?;
    let credential_key_hex = matches
        .get_one::<String>("credential-key")
        .cloned()
        .context("missing required argument: --credential-key")?;

    let policy_url = matches.get_one::<String>(commands::ARG_POLICY_URL).cloned();
    let policy_wasm = matches
        .get_one::<String>(commands::ARG_POLICY_WASM)
        .map(PathBuf::from);

    Ok(Action::Server(Args {
        port,
        dsn,
        redis_url,
        policy_url,
        policy_wasm,
        credential_key_hex,
        session_ttl_seconds: matches
            .get_one::<u64>("session-ttl-seconds")
            .copied()
            .unwrap_or(28_800),
        decision_cache_ttl_seconds: matches
            .get_one::<u64>("decision-cache-ttl-seconds")
            .copied()
            .unwrap_or(5),
        replay_ttl_seconds: matches
            .get_one::<u64>("replay-ttl-seconds")
            .copied()
            .unwrap_or(300),
        rate_limit_low: matches
            .get_one::<u32>("rate-limit-low")
            .copied()
            .unwrap_or(1000),
        rate_limit_medium: matches
            .get_one::<u32>("rate-limit-medium")
            .copied()
            .unwrap_or(200),
        rate_limit_high: matches
            .get_one::<u32>("rate-limit-high")
            .copied()
            .unwrap_or(20),
        risk_multiplier: matches
            .get_one::<u32>("risk-multiplier")
            .copied()
            .unwrap_or(5),
        audit_queue_capacity: matches
            .get_one::<usize>("audit-queue-capacity")
            .copied()
            .unwrap_or(1024),
        audit_max_attempts: matches
            .get_one::<u32>("audit-max-attempts")
            .copied()
            .unwrap_or(5),
        tenant_plan: matches
            .get_one::<String>("tenant-plan")
            .cloned()
            .unwrap_or_else(|| "standard".to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_backend_is_required() {
        temp_env::with_vars(
            [
                ("GARDI_POLICY_URL", None::<&str>),
                ("GARDI_POLICY_WASM", None::<&str>),
            ],
            || {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec![
                    "gardi",
                    "--dsn",
                    "postgres://localhost/gardi",
                    "--redis-url",
                    "redis://localhost:6379",
                    "--credential-key",
                    "00ff",
                ]);
                let result = handler(&matches);
                assert!(result.is_err());
            },
        );
    }

    #[test]
    fn server_action_carries_parsed_args() {
        temp_env::with_vars([("GARDI_POLICY_WASM", None::<&str>)], || {
            let command = crate::cli::commands::new();
            let matches = command.get_matches_from(vec![
                "gardi",
                "--dsn",
                "postgres://localhost/gardi",
                "--redis-url",
                "redis://localhost:6379",
                "--credential-key",
                "00ff",
                "--policy-url",
                "https://opa.internal:8181",
                "--rate-limit-high",
                "5",
            ]);
            let action = handler(&matches).expect("action");
            let Action::Server(args) = action;
            assert_eq!(args.port, 8080);
            assert_eq!(args.rate_limit_high, 5);
            assert_eq!(
                args.policy_url.as_deref(),
                Some("https://opa.internal:8181")
            );
            assert!(args.policy_wasm.is_none());
        });
    }
}
