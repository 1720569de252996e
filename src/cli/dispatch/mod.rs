use anyhow::{Context, Result};

use crate::cli::actions::{Action, server};
use crate::federated::SsoProvider;
use crate::validator::RolePolicy;

/// Build the action from parsed arguments.
///
/// # Errors
/// Returns an error if a required argument is missing or malformed.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;
    let state_secret = matches
        .get_one::<String>("state-secret")
        .cloned()
        .context("missing required argument: --state-secret")?;
    let base_url = matches
        .get_one::<String>("base-url")
        .cloned()
        .unwrap_or_else(|| "http://localhost:9701".to_string());

    let sso_providers = parse_sso_providers(matches.get_one::<String>("sso-providers"))?;

    let admin_policy = RolePolicy {
        require_device: matches.get_flag("admin-require-device"),
        secondary_provider: matches.get_one::<String>("admin-secondary-provider").cloned(),
    };
    let user_policy = RolePolicy {
        require_device: matches.get_flag("user-require-device"),
        secondary_provider: matches.get_one::<String>("user-secondary-provider").cloned(),
    };

    Ok(Action::Server(Box::new(server::Args {
        admin_port: matches.get_one::<u16>("admin-port").copied().unwrap_or(9700),
        user_port: matches.get_one::<u16>("user-port").copied().unwrap_or(9701),
        dsn,
        state_secret,
        base_url,
        demo: matches.get_flag("demo"),
        session_ttl_seconds: matches
            .get_one::<i64>("session-ttl-seconds")
            .copied()
            .unwrap_or(43_200),
        secondary_ttl_seconds: matches
            .get_one::<i64>("secondary-ttl-seconds")
            .copied()
            .unwrap_or(300),
        state_ttl_seconds: matches
            .get_one::<i64>("state-ttl-seconds")
            .copied()
            .unwrap_or(300),
        sso_providers,
        admin_policy,
        user_policy,
    })))
}

fn parse_sso_providers(raw: Option<&String>) -> Result<Vec<SsoProvider>> {
    match raw {
        Some(json) if !json.trim().is_empty() => {
            serde_json::from_str(json).context("invalid --sso-providers JSON")
        }
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    // temp_env serializes env access against the command tests that set
    // ZEROGATE_* variables.
    fn with_clean_env<F: FnOnce() -> R, R>(f: F) -> R {
        temp_env::with_vars(
            [
                ("ZEROGATE_ADMIN_PORT", None::<&str>),
                ("ZEROGATE_USER_PORT", None),
                ("ZEROGATE_DEMO", None),
                ("ZEROGATE_STATE_TTL_SECONDS", None),
                ("ZEROGATE_LOG_LEVEL", None),
            ],
            f,
        )
    }

    #[test]
    fn handler_builds_server_action() -> Result<()> {
        with_clean_env(|| {
            let matches = commands::new().try_get_matches_from(vec![
                "zerogate",
                "--dsn",
                "postgres://localhost/zerogate",
                "--state-secret",
                "secret",
                "--user-secondary-provider",
                "totp",
                "--sso-providers",
                r#"[{"id":"corp","type":"saml","label":"Corp","authorize_url":"https://idp/authorize"}]"#,
            ])?;

            let Action::Server(args) = handler(&matches)?;
            assert_eq!(args.admin_port, 9700);
            assert_eq!(args.user_port, 9701);
            assert_eq!(args.state_ttl_seconds, 300);
            assert_eq!(args.sso_providers.len(), 1);
            assert_eq!(args.sso_providers[0].id, "corp");
            assert_eq!(args.user_policy.secondary_provider.as_deref(), Some("totp"));
            assert!(!args.admin_policy.require_device);
            Ok(())
        })
    }

    #[test]
    fn invalid_provider_json_is_an_error() -> Result<()> {
        with_clean_env(|| {
            let matches = commands::new().try_get_matches_from(vec![
                "zerogate",
                "--dsn",
                "postgres://localhost/zerogate",
                "--state-secret",
                "secret",
                "--sso-providers",
                "not-json",
            ])?;
            assert!(handler(&matches).is_err());
            Ok(())
        })
    }
}
