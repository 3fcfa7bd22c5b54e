//! Security configuration consumed by the persistence core.

use std::path::PathBuf;

use dotenvy::dotenv;

/// Default lifetime of an issued auth token, in seconds.
pub const DEFAULT_AUTH_TOKEN_EXP_TIMEOUT: i64 = 900;

/// Name of the RBAC database file inside the security directory.
pub const RBAC_DB_FILE_NAME: &str = "rbac.db";

/// Runtime security settings.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Lifetime of issued tokens in seconds. Token invalidation rules stay
    /// alive at least this long so they outlive the tokens they reject.
    pub auth_token_exp_timeout: i64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            auth_token_exp_timeout: DEFAULT_AUTH_TOKEN_EXP_TIMEOUT,
        }
    }
}

impl SecurityConfig {
    /// Loads settings from the environment (reading a `.env` file if one
    /// is present), falling back to defaults.
    pub fn from_env() -> Self {
        dotenv().ok();

        let auth_token_exp_timeout = std::env::var("AEGIS_AUTH_TOKEN_EXP_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_AUTH_TOKEN_EXP_TIMEOUT);

        SecurityConfig {
            auth_token_exp_timeout,
        }
    }
}

/// Location of the RBAC database file: `$AEGIS_SECURITY_PATH/rbac.db`,
/// defaulting to `./security/rbac.db`.
pub fn rbac_db_file() -> PathBuf {
    dotenv().ok();

    let dir = std::env::var("AEGIS_SECURITY_PATH").unwrap_or_else(|_| "security".to_string());
    PathBuf::from(dir).join(RBAC_DB_FILE_NAME)
}
