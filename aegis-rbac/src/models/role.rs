use chrono::NaiveDateTime;
use diesel::{Identifiable, Insertable, Queryable, QueryableByName};
use serde::{Deserialize, Serialize};

use crate::models::ResourceType;
use crate::schema::roles;

#[derive(Deserialize, Queryable, Identifiable, QueryableByName, Debug, Clone, Serialize)]
#[diesel(table_name = roles)]
pub struct Role {
    pub id: i32,
    pub name: String, // Will be unique, at most 64 chars
    pub resource_type: String,
    pub created_at: NaiveDateTime,
}

impl Role {
    pub fn resource_type(&self) -> Option<ResourceType> {
        self.resource_type.parse().ok()
    }
}

#[derive(Insertable, Deserialize)]
#[diesel(table_name = roles)]
pub struct NewRole {
    pub id: Option<i32>,
    pub name: String,
    pub resource_type: String,
    pub created_at: NaiveDateTime,
}
