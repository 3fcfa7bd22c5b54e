//! RBAC persistence core of the Aegis security-management service.
//!
//! Owns the durable authorization model: users, roles, policies, rules,
//! their ordered many-to-many relationships, and the token-invalidation
//! ledgers. The HTTP surface lives in a separate crate and talks to this
//! one through the managers in [`orm`].

pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod orm;
pub mod schema;

pub use config::SecurityConfig;
pub use error::{IntegrityError, SecurityError};

/// Highest id reserved for built-in administrative resources. Resources at
/// or below this id cannot be changed through the normal manager APIs.
pub const MAX_ID_RESERVED: i32 = 99;

/// Lower bound of the window `[CLOUD_RESERVED_RANGE, MAX_ID_RESERVED]`
/// reserved for externally managed defaults during migration.
pub const CLOUD_RESERVED_RANGE: i32 = 90;

/// Rules that must stay linked to a role at all times, keyed by role id.
pub const REQUIRED_RULES_FOR_ROLE: &[(i32, &[i32])] = &[(1, &[1, 2])];

/// Returns the rule ids that may never be unlinked from `role_id`.
pub fn required_rules_for_role(role_id: i32) -> &'static [i32] {
    REQUIRED_RULES_FOR_ROLE
        .iter()
        .find(|(id, _)| *id == role_id)
        .map(|(_, rules)| *rules)
        .unwrap_or(&[])
}
