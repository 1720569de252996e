use anyhow::Result;

use crate::api::{self, ServerConfig};
use crate::federated::SsoProvider;
use crate::validator::RolePolicy;

#[derive(Debug)]
pub struct Args {
    pub admin_port: u16,
    pub user_port: u16,
    pub dsn: String,
    pub state_secret: String,
    pub base_url: String,
    pub demo: bool,
    pub session_ttl_seconds: i64,
    pub secondary_ttl_seconds: i64,
    pub state_ttl_seconds: i64,
    pub sso_providers: Vec<SsoProvider>,
    pub admin_policy: RolePolicy,
    pub user_policy: RolePolicy,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    api::serve(ServerConfig {
        admin_port: args.admin_port,
        user_port: args.user_port,
        dsn: args.dsn,
        state_secret: args.state_secret,
        base_url: args.base_url,
        demo: args.demo,
        session_ttl_seconds: args.session_ttl_seconds,
        secondary_ttl_seconds: args.secondary_ttl_seconds,
        state_ttl_seconds: args.state_ttl_seconds,
        sso_providers: args.sso_providers,
        admin_policy: args.admin_policy,
        user_policy: args.user_policy,
    })
    .await
}
