//! Policy manager: validated CRUD over the `policies` table.
//!
//! A policy body is an object with exactly the keys `actions`, `resources`
//! and `effect`. Actions and resources are matched against the patterns
//! below before anything is written; the serialized body is unique across
//! the table.

use std::sync::LazyLock;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use regex::Regex;
use serde_json::Value;

use crate::cache;
use crate::error::SecurityError;
use crate::models::{NewPolicy, Policy, ResourceType};
use crate::orm::db::{last_insert_rowid, sweep_orphan_links};
use crate::{CLOUD_RESERVED_RANGE, MAX_ID_RESERVED};

static ACTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_\-]+:[a-zA-Z_\-]+$").expect("valid action regex"));
static RESOURCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_\-*]+:[\w_\-*]+:[\w_\-/.*]+$").expect("valid resource regex")
});

/// Checks a policy body against the required shape.
///
/// The body must be an object with exactly the keys `actions`, `resources`
/// and `effect`. `actions` is a non-empty list of `domain:verb` strings;
/// `resources` is a non-empty list where each item may be an
/// ampersand-joined compound of `type:attribute:value` components;
/// `effect` is a string.
pub fn validate_policy_body(body: &Value) -> bool {
    let Some(map) = body.as_object() else {
        return false;
    };
    if map.len() != 3 {
        return false;
    }
    let (Some(actions), Some(resources), Some(effect)) =
        (map.get("actions"), map.get("resources"), map.get("effect"))
    else {
        return false;
    };

    let Some(actions) = actions.as_array() else {
        return false;
    };
    if actions.is_empty()
        || !actions.iter().all(|action| {
            action
                .as_str()
                .is_some_and(|action| ACTION_REGEX.is_match(action))
        })
    {
        return false;
    }

    let Some(resources) = resources.as_array() else {
        return false;
    };
    if resources.is_empty()
        || !resources.iter().all(|resource| {
            resource.as_str().is_some_and(|resource| {
                resource
                    .split('&')
                    .all(|component| RESOURCE_REGEX.is_match(component))
            })
        })
    {
        return false;
    }

    effect.is_string()
}

fn insert_policy_inner(
    conn: &mut SqliteConnection,
    mut new_policy: NewPolicy,
    check_default: bool,
) -> Result<Policy, SecurityError> {
    use crate::schema::policies::dsl::*;

    if check_default {
        let max_existing: Option<i32> = policies.select(diesel::dsl::max(id)).first(conn)?;
        if max_existing.unwrap_or(0) <= MAX_ID_RESERVED {
            new_policy.id = Some(MAX_ID_RESERVED + 1);
        }
    } else if new_policy.id.is_none() {
        // Default policies are renumbered below the cloud-reserved window
        // so refreshed built-ins never collide with externally managed ids.
        let ids: Vec<i32> = policies.select(id).order(id.asc()).load(conn)?;
        let next = ids
            .iter()
            .filter(|&&existing| existing < CLOUD_RESERVED_RANGE)
            .max()
            .map(|&m| m + 1)
            .unwrap_or(1);
        new_policy.id = Some(next);
    }

    diesel::insert_into(policies)
        .values(&new_policy)
        .execute(conn)
        .map_err(SecurityError::from_integrity)?;

    let new_id = last_insert_rowid(conn)?;
    policies
        .filter(id.eq(new_id))
        .first::<Policy>(conn)
        .map_err(SecurityError::from)
}

/// Creates a new policy. Fails with `INVALID` if the body does not match
/// the required shape, `ALREADY_EXIST` if the name or body is taken.
pub fn add_policy(
    conn: &mut SqliteConnection,
    name: &str,
    body: &Value,
) -> Result<Policy, SecurityError> {
    add_policy_with(conn, name, body, None, None, ResourceType::User, true)
}

/// Creates a new policy with full control over id, timestamp and resource
/// type. `check_default=false` honors reserved ids; only the defaults
/// loader and the migration coordinator use it.
pub fn add_policy_with(
    conn: &mut SqliteConnection,
    name: &str,
    body: &Value,
    policy_id: Option<i32>,
    created_at: Option<NaiveDateTime>,
    resource_type: ResourceType,
    check_default: bool,
) -> Result<Policy, SecurityError> {
    if !validate_policy_body(body) {
        return Err(SecurityError::Invalid);
    }

    let new_policy = NewPolicy {
        id: policy_id,
        name: name.to_string(),
        body: body.to_string(),
        resource_type: resource_type.as_str().to_string(),
        created_at: created_at.unwrap_or_else(|| chrono::Utc::now().naive_utc()),
    };

    let policy = conn.transaction(|conn| insert_policy_inner(conn, new_policy, check_default))?;
    cache::invalidate_resource_cache();
    Ok(policy)
}

/// Gets a single policy by ID.
pub fn get_policy_by_id(
    conn: &mut SqliteConnection,
    policy_id: i32,
) -> Result<Policy, SecurityError> {
    use crate::schema::policies::dsl::*;

    policies
        .filter(id.eq(policy_id))
        .first::<Policy>(conn)
        .optional()?
        .ok_or(SecurityError::PolicyNotExist)
}

/// Gets a single policy by name.
pub fn get_policy_by_name(
    conn: &mut SqliteConnection,
    policy_name: &str,
) -> Result<Policy, SecurityError> {
    use crate::schema::policies::dsl::*;

    policies
        .filter(name.eq(policy_name))
        .first::<Policy>(conn)
        .optional()?
        .ok_or(SecurityError::PolicyNotExist)
}

/// Gets a single policy by its canonical body text.
pub fn get_policy_by_body(
    conn: &mut SqliteConnection,
    body_value: &Value,
) -> Result<Policy, SecurityError> {
    use crate::schema::policies::dsl::*;

    policies
        .filter(body.eq(body_value.to_string()))
        .first::<Policy>(conn)
        .optional()?
        .ok_or(SecurityError::PolicyNotExist)
}

/// Returns all policies in ascending order by id.
pub fn list_policies(conn: &mut SqliteConnection) -> Result<Vec<Policy>, SecurityError> {
    use crate::schema::policies::dsl::*;

    policies
        .order(id.asc())
        .load::<Policy>(conn)
        .map_err(SecurityError::from)
}

/// Renames a policy and/or replaces its body or resource type.
///
/// Reserved policies are rejected with `ADMIN_RESOURCES` unless
/// `check_default=false`. A malformed body returns `INVALID`. Passing no
/// fields is a silent no-op.
pub fn update_policy(
    conn: &mut SqliteConnection,
    policy_id: i32,
    new_name: Option<&str>,
    new_body: Option<&Value>,
    new_resource_type: Option<ResourceType>,
    check_default: bool,
) -> Result<bool, SecurityError> {
    use crate::schema::policies::dsl::*;

    if check_default && policy_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }
    if let Some(body_value) = new_body {
        if !validate_policy_body(body_value) {
            return Err(SecurityError::Invalid);
        }
    }

    let changed = conn.transaction(|conn| {
        policies
            .filter(id.eq(policy_id))
            .first::<Policy>(conn)
            .optional()?
            .ok_or(SecurityError::PolicyNotExist)?;

        let mut changed = false;
        if let Some(policy_name) = new_name {
            diesel::update(policies.filter(id.eq(policy_id)))
                .set(name.eq(policy_name))
                .execute(conn)
                .map_err(SecurityError::from_integrity)?;
            changed = true;
        }
        if let Some(body_value) = new_body {
            diesel::update(policies.filter(id.eq(policy_id)))
                .set(body.eq(body_value.to_string()))
                .execute(conn)
                .map_err(SecurityError::from_integrity)?;
            changed = true;
        }
        if let Some(rtype) = new_resource_type {
            diesel::update(policies.filter(id.eq(policy_id)))
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

/// Deletes a policy by ID, cascading to its role links.
pub fn delete_policy_by_id(
    conn: &mut SqliteConnection,
    policy_id: i32,
) -> Result<bool, SecurityError> {
    use crate::schema::policies::dsl::*;

    if policy_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    let deleted = conn.transaction(|conn| {
        let removed = diesel::delete(policies.filter(id.eq(policy_id)))
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

/// Deletes a policy by name. Same contract as [`delete_policy_by_id`].
pub fn delete_policy_by_name(
    conn: &mut SqliteConnection,
    policy_name: &str,
) -> Result<bool, SecurityError> {
    use crate::schema::policies::dsl::*;

    let policy = policies
        .filter(name.eq(policy_name))
        .first::<Policy>(conn)
        .optional()?;
    match policy {
        Some(policy) => delete_policy_by_id(conn, policy.id),
        None => Ok(false),
    }
}

/// Deletes every non-reserved policy, returning the removed ids.
pub fn delete_all_policies(conn: &mut SqliteConnection) -> Result<Vec<i32>, SecurityError> {
    use crate::schema::policies::dsl::*;

    let removed = conn.transaction(|conn| {
        let targets: Vec<i32> = policies
            .select(id)
            .filter(id.gt(MAX_ID_RESERVED))
            .order(id.asc())
            .load(conn)?;
        if !targets.is_empty() {
            diesel::delete(policies.filter(id.gt(MAX_ID_RESERVED)))
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
