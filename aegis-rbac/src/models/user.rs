use chrono::NaiveDateTime;
use diesel::{Identifiable, Insertable, Queryable, QueryableByName};
use serde::{Deserialize, Serialize};

use crate::models::ResourceType;
use crate::schema::users;

#[derive(Deserialize, Queryable, Identifiable, QueryableByName, Debug, Clone, Serialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub username: String, // Will be unique
    pub password_hash: String,
    pub allow_run_as: bool,
    pub resource_type: String,
    pub created_at: NaiveDateTime,
}

impl User {
    pub fn resource_type(&self) -> Option<ResourceType> {
        self.resource_type.parse().ok()
    }
}

#[derive(Insertable, Deserialize)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Option<i32>,
    pub username: String,
    pub password_hash: String,
    pub allow_run_as: bool,
    pub resource_type: String,
    pub created_at: NaiveDateTime,
}
