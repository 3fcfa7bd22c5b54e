use chrono::NaiveDateTime;
use diesel::{Identifiable, Insertable, Queryable, QueryableByName};
use serde::{Deserialize, Serialize};

use crate::schema::policies;

/// An access policy. `body` is the canonical JSON text of an object with
/// exactly the keys `actions`, `resources` and `effect`; the text itself is
/// unique across the table.
#[derive(Deserialize, Queryable, Identifiable, QueryableByName, Debug, Clone, Serialize)]
#[diesel(table_name = policies)]
pub struct Policy {
    pub id: i32,
    pub name: String, // Will be unique
    pub body: String, // Will be unique
    pub resource_type: String,
    pub created_at: NaiveDateTime,
}

impl Policy {
    /// Parses the stored body back into a JSON value.
    pub fn body_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

#[derive(Insertable, Deserialize)]
#[diesel(table_name = policies)]
pub struct NewPolicy {
    pub id: Option<i32>,
    pub name: String,
    pub body: String,
    pub resource_type: String,
    pub created_at: NaiveDateTime,
}
