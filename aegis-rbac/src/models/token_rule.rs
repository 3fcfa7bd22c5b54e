use diesel::{Insertable, Queryable};
use serde::{Deserialize, Serialize};

use crate::schema::{roles_token_blacklist, runas_token_blacklist, users_token_blacklist};

/// Invalidation rule for a user's tokens: tokens whose `nbf` is at or
/// before `nbf_invalid_until` are rejected until `is_valid_until` passes.
#[derive(Deserialize, Queryable, Insertable, Debug, Clone, Serialize)]
#[diesel(table_name = users_token_blacklist)]
pub struct UserTokenRule {
    pub user_id: i32,
    pub nbf_invalid_until: i64,
    pub is_valid_until: i64,
}

/// Invalidation rule for a role's tokens.
#[derive(Deserialize, Queryable, Insertable, Debug, Clone, Serialize)]
#[diesel(table_name = roles_token_blacklist)]
pub struct RoleTokenRule {
    pub role_id: i32,
    pub nbf_invalid_until: i64,
    pub is_valid_until: i64,
}

/// Invalidation rule for run-as tokens. At most one row exists.
#[derive(Deserialize, Queryable, Insertable, Debug, Clone, Serialize)]
#[diesel(table_name = runas_token_blacklist)]
pub struct RunAsTokenRule {
    pub nbf_invalid_until: i64,
    pub is_valid_until: i64,
}
