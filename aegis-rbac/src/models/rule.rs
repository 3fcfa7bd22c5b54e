use chrono::NaiveDateTime;
use diesel::{Identifiable, Insertable, Queryable, QueryableByName};
use serde::{Deserialize, Serialize};

use crate::schema::rules;

/// An authorization-context rule. `rule_body` holds the serialized JSON
/// object that authentication flows match against.
#[derive(Deserialize, Queryable, Identifiable, QueryableByName, Debug, Clone, Serialize)]
#[diesel(table_name = rules)]
pub struct Rule {
    pub id: i32,
    pub name: String, // Will be unique
    pub rule_body: String,
    pub resource_type: String,
    pub created_at: NaiveDateTime,
}

impl Rule {
    /// Parses the stored body back into a JSON value.
    pub fn body(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.rule_body)
    }
}

#[derive(Insertable, Deserialize)]
#[diesel(table_name = rules)]
pub struct NewRule {
    pub id: Option<i32>,
    pub name: String,
    pub rule_body: String,
    pub resource_type: String,
    pub created_at: NaiveDateTime,
}
