use chrono::NaiveDateTime;
use diesel::{Identifiable, Insertable, Queryable};
use serde::{Deserialize, Serialize};

use crate::schema::roles_policies;

/// Link row of the ordered Role<->Policy association. `level` is the
/// zero-based position of the policy in the role's policy list.
#[derive(Deserialize, Queryable, Identifiable, Debug, Clone, Serialize)]
#[diesel(table_name = roles_policies)]
pub struct RolePolicy {
    pub id: i32,
    pub role_id: i32,
    pub policy_id: i32,
    pub level: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Deserialize)]
#[diesel(table_name = roles_policies)]
pub struct NewRolePolicy {
    pub role_id: i32,
    pub policy_id: i32,
    pub level: i32,
    pub created_at: NaiveDateTime,
}
