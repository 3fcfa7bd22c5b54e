use chrono::NaiveDateTime;
use diesel::{Identifiable, Insertable, Queryable};
use serde::{Deserialize, Serialize};

use crate::schema::user_roles;

/// Link row of the ordered User<->Role association. `level` is the
/// zero-based position of the role in the user's role list.
#[derive(Deserialize, Queryable, Identifiable, Debug, Clone, Serialize)]
#[diesel(table_name = user_roles)]
pub struct UserRole {
    pub id: i32,
    pub user_id: i32,
    pub role_id: i32,
    pub level: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Deserialize)]
#[diesel(table_name = user_roles)]
pub struct NewUserRole {
    pub user_id: i32,
    pub role_id: i32,
    pub level: i32,
    pub created_at: NaiveDateTime,
}
