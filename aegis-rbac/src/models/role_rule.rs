use chrono::NaiveDateTime;
use diesel::{Identifiable, Insertable, Queryable};
use serde::{Deserialize, Serialize};

use crate::schema::roles_rules;

/// Link row of the unordered Role<->Rule association.
#[derive(Deserialize, Queryable, Identifiable, Debug, Clone, Serialize)]
#[diesel(table_name = roles_rules)]
pub struct RoleRule {
    pub id: i32,
    pub role_id: i32,
    pub rule_id: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Deserialize)]
#[diesel(table_name = roles_rules)]
pub struct NewRoleRule {
    pub role_id: i32,
    pub rule_id: i32,
    pub created_at: NaiveDateTime,
}
