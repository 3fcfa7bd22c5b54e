//! Rule manager: validated CRUD over the `rules` table.
//!
//! A rule body is an arbitrary JSON object matched against the
//! authorization context at login time; anything that is not an object is
//! rejected before touching the database.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde_json::Value;

use crate::MAX_ID_RESERVED;
use crate::cache;
use crate::error::SecurityError;
use crate::models::{NewRule, ResourceType, Rule};
use crate::orm::db::{last_insert_rowid, sweep_orphan_links};

fn insert_rule_inner(
    conn: &mut SqliteConnection,
    mut new_rule: NewRule,
    check_default: bool,
) -> Result<Rule, SecurityError> {
    use crate::schema::rules::dsl::*;

    if check_default {
        let max_existing: Option<i32> = rules.select(diesel::dsl::max(id)).first(conn)?;
        if max_existing.unwrap_or(0) <= MAX_ID_RESERVED {
            new_rule.id = Some(MAX_ID_RESERVED + 1);
        }
    }

    diesel::insert_into(rules)
        .values(&new_rule)
        .execute(conn)
        .map_err(SecurityError::from_integrity)?;

    let new_id = last_insert_rowid(conn)?;
    rules
        .filter(id.eq(new_id))
        .first::<Rule>(conn)
        .map_err(SecurityError::from)
}

/// Creates a new rule. The body must be a JSON object, otherwise the call
/// returns `INVALID` without touching the database.
pub fn add_rule(
    conn: &mut SqliteConnection,
    name: &str,
    body: &Value,
) -> Result<Rule, SecurityError> {
    add_rule_with(conn, name, body, None, None, ResourceType::User, true)
}

/// Creates a new rule with full control over id, timestamp and resource
/// type. `check_default=false` honors reserved ids; only the defaults
/// loader and the migration coordinator use it.
pub fn add_rule_with(
    conn: &mut SqliteConnection,
    name: &str,
    body: &Value,
    rule_id: Option<i32>,
    created_at: Option<NaiveDateTime>,
    resource_type: ResourceType,
    check_default: bool,
) -> Result<Rule, SecurityError> {
    if !body.is_object() {
        return Err(SecurityError::Invalid);
    }

    let new_rule = NewRule {
        id: rule_id,
        name: name.to_string(),
        rule_body: body.to_string(),
        resource_type: resource_type.as_str().to_string(),
        created_at: created_at.unwrap_or_else(|| chrono::Utc::now().naive_utc()),
    };

    let rule = conn.transaction(|conn| insert_rule_inner(conn, new_rule, check_default))?;
    cache::invalidate_resource_cache();
    Ok(rule)
}

/// Gets a single rule by ID.
pub fn get_rule_by_id(conn: &mut SqliteConnection, rule_id: i32) -> Result<Rule, SecurityError> {
    use crate::schema::rules::dsl::*;

    rules
        .filter(id.eq(rule_id))
        .first::<Rule>(conn)
        .optional()?
        .ok_or(SecurityError::RuleNotExist)
}

/// Gets a single rule by name.
pub fn get_rule_by_name(conn: &mut SqliteConnection, rule_name: &str) -> Result<Rule, SecurityError> {
    use crate::schema::rules::dsl::*;

    rules
        .filter(name.eq(rule_name))
        .first::<Rule>(conn)
        .optional()?
        .ok_or(SecurityError::RuleNotExist)
}

/// Returns all rules in ascending order by id.
pub fn list_rules(conn: &mut SqliteConnection) -> Result<Vec<Rule>, SecurityError> {
    use crate::schema::rules::dsl::*;

    rules
        .order(id.asc())
        .load::<Rule>(conn)
        .map_err(SecurityError::from)
}

/// Renames a rule and/or replaces its body or resource type.
///
/// Reserved rules are rejected with `ADMIN_RESOURCES` unless
/// `check_default=false`. A non-object body returns `INVALID`. Passing no
/// fields is a silent no-op.
pub fn update_rule(
    conn: &mut SqliteConnection,
    rule_id: i32,
    new_name: Option<&str>,
    new_body: Option<&Value>,
    new_resource_type: Option<ResourceType>,
    check_default: bool,
) -> Result<bool, SecurityError> {
    use crate::schema::rules::dsl::*;

    if check_default && rule_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }
    if let Some(body) = new_body {
        if !body.is_object() {
            return Err(SecurityError::Invalid);
        }
    }

    let changed = conn.transaction(|conn| {
        rules
            .filter(id.eq(rule_id))
            .first::<Rule>(conn)
            .optional()?
            .ok_or(SecurityError::RuleNotExist)?;

        let mut changed = false;
        if let Some(rule_name) = new_name {
            diesel::update(rules.filter(id.eq(rule_id)))
                .set(name.eq(rule_name))
                .execute(conn)
                .map_err(SecurityError::from_integrity)?;
            changed = true;
        }
        if let Some(body) = new_body {
            diesel::update(rules.filter(id.eq(rule_id)))
                .set(rule_body.eq(body.to_string()))
                .execute(conn)
                .map_err(SecurityError::from_integrity)?;
            changed = true;
        }
        if let Some(rtype) = new_resource_type {
            diesel::update(rules.filter(id.eq(rule_id)))
                .set(resource_type.eq(rtype.as_str()))
                .execute(conn)
                .map_err(SecurityError::from_integrity)?;
            changed = true;
        }
        Ok::<bool, SecurityError>(changed)
    })?;

    if changed {
        cache::invalidate_resource_cache();
    }
    Ok(changed)
}

/// Deletes a rule by ID, cascading to its role links.
pub fn delete_rule_by_id(conn: &mut SqliteConnection, rule_id: i32) -> Result<bool, SecurityError> {
    use crate::schema::rules::dsl::*;

    if rule_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    let deleted = conn.transaction(|conn| {
        let removed = diesel::delete(rules.filter(id.eq(rule_id)))
            .execute(conn)
            .map_err(SecurityError::from_integrity)?;
        if removed > 0 {
            sweep_orphan_links(conn)?;
        }
        Ok::<bool, SecurityError>(removed > 0)
    })?;

    if deleted {
        cache::invalidate_resource_cache();
    }
    Ok(deleted)
}

/// Deletes a rule by name. Same contract as [`delete_rule_by_id`].
pub fn delete_rule_by_name(
    conn: &mut SqliteConnection,
    rule_name: &str,
) -> Result<bool, SecurityError> {
    use crate::schema::rules::dsl::*;

    let rule = rules
        .filter(name.eq(rule_name))
        .first::<Rule>(conn)
        .optional()?;
    match rule {
        Some(rule) => delete_rule_by_id(conn, rule.id),
        None => Ok(false),
    }
}

/// Deletes every non-reserved rule, returning the removed ids.
pub fn delete_all_rules(conn: &mut SqliteConnection) -> Result<Vec<i32>, SecurityError> {
    use crate::schema::rules::dsl::*;

    let removed = conn.transaction(|conn| {
        let targets: Vec<i32> = rules
            .select(id)
            .filter(id.gt(MAX_ID_RESERVED))
            .order(id.asc())
            .load(conn)?;
        if !targets.is_empty() {
            diesel::delete(rules.filter(id.gt(MAX_ID_RESERVED)))
                .execute(conn)
                .map_err(SecurityError::from_integrity)?;
            sweep_orphan_links(conn)?;
        }
        Ok::<Vec<i32>, SecurityError>(targets)
    })?;

    if !removed.is_empty() {
        cache::invalidate_resource_cache();
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orm::testing::setup_test_db;
    use serde_json::json;

    #[test]
    fn test_add_rule() {
        let mut conn = setup_test_db();

        let body = json!({"MATCH": {"definition": "internal"}});
        let rule = add_rule(&mut conn, "console", &body).unwrap();
        assert_eq!(rule.id, MAX_ID_RESERVED + 1);
        assert_eq!(rule.body().unwrap(), body);
    }

    #[test]
    fn test_add_rule_rejects_non_object_body() {
        let mut conn = setup_test_db();

        assert_eq!(
            add_rule(&mut conn, "bad", &json!(["not", "an", "object"])).unwrap_err(),
            SecurityError::Invalid
        );
        assert_eq!(
            add_rule(&mut conn, "bad", &json!("string")).unwrap_err(),
            SecurityError::Invalid
        );
        assert!(list_rules(&mut conn).unwrap().is_empty());
    }

    #[test]
    fn test_update_rule() {
        let mut conn = setup_test_db();

        let rule = add_rule(&mut conn, "console", &json!({"a": 1})).unwrap();
        assert!(!update_rule(&mut conn, rule.id, None, None, None, true).unwrap());

        let new_body = json!({"b": 2});
        assert!(update_rule(&mut conn, rule.id, None, Some(&new_body), None, true).unwrap());
        assert_eq!(
            get_rule_by_id(&mut conn, rule.id).unwrap().body().unwrap(),
            new_body
        );

        assert_eq!(
            update_rule(&mut conn, rule.id, None, Some(&json!(5)), None, true).unwrap_err(),
            SecurityError::Invalid
        );
    }

    #[test]
    fn test_reserved_rule_guard() {
        let mut conn = setup_test_db();

        add_rule_with(
            &mut conn,
            "required",
            &json!({"MATCH": {"definition": "internal"}}),
            Some(1),
            None,
            ResourceType::Default,
            false,
        )
        .unwrap();
        assert_eq!(
            delete_rule_by_id(&mut conn, 1).unwrap_err(),
            SecurityError::AdminResources
        );
        assert_eq!(
            update_rule(&mut conn, 1, Some("renamed"), None, None, true).unwrap_err(),
            SecurityError::AdminResources
        );
        assert!(get_rule_by_id(&mut conn, 1).is_ok());
    }
}
