//! Ordered Role<->Policy relationship manager.
//!
//! Mirrors the User<->Role manager: a role's policy links carry a
//! contiguous zero-based `level` that decides precedence when several
//! policies apply.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::MAX_ID_RESERVED;
use crate::cache;
use crate::error::SecurityError;
use crate::models::{NewRolePolicy, Policy, Role, RolePolicy};
use crate::schema::{policies, roles, roles_policies};

fn role_exists(conn: &mut SqliteConnection, role_id: i32) -> Result<bool, SecurityError> {
    let found: Option<i32> = roles::table
        .select(roles::id)
        .filter(roles::id.eq(role_id))
        .first(conn)
        .optional()?;
    Ok(found.is_some())
}

fn policy_exists(conn: &mut SqliteConnection, policy_id: i32) -> Result<bool, SecurityError> {
    let found: Option<i32> = policies::table
        .select(policies::id)
        .filter(policies::id.eq(policy_id))
        .first(conn)
        .optional()?;
    Ok(found.is_some())
}

fn find_link(
    conn: &mut SqliteConnection,
    role_id: i32,
    policy_id: i32,
) -> Result<Option<RolePolicy>, SecurityError> {
    roles_policies::table
        .filter(roles_policies::role_id.eq(role_id))
        .filter(roles_policies::policy_id.eq(policy_id))
        .first::<RolePolicy>(conn)
        .optional()
        .map_err(SecurityError::from)
}

pub(crate) fn add_policy_to_role_inner(
    conn: &mut SqliteConnection,
    role_id: i32,
    policy_id: i32,
    position: Option<i32>,
    created_at: Option<NaiveDateTime>,
    force_admin: bool,
) -> Result<(), SecurityError> {
    if role_id <= MAX_ID_RESERVED && !force_admin {
        return Err(SecurityError::AdminResources);
    }
    if !role_exists(conn, role_id)? {
        return Err(SecurityError::RoleNotExist);
    }
    if !policy_exists(conn, policy_id)? {
        return Err(SecurityError::PolicyNotExist);
    }
    if find_link(conn, role_id, policy_id)?.is_some() {
        return Err(SecurityError::AlreadyExist);
    }

    let count: i64 = roles_policies::table
        .filter(roles_policies::role_id.eq(role_id))
        .count()
        .get_result(conn)?;

    let new_level = if count == 0 {
        0
    } else {
        match position {
            None => count as i32,
            Some(position) => {
                let max_level: Option<i32> = roles_policies::table
                    .filter(roles_policies::role_id.eq(role_id))
                    .select(diesel::dsl::max(roles_policies::level))
                    .first(conn)?;
                let max_level = max_level.unwrap_or(0);
                let target = position.max(0).min(max_level + 1);
                if target <= max_level {
                    diesel::update(
                        roles_policies::table
                            .filter(roles_policies::role_id.eq(role_id))
                            .filter(roles_policies::level.ge(target)),
                    )
                    .set(roles_policies::level.eq(roles_policies::level + 1))
                    .execute(conn)?;
                }
                target
            }
        }
    };

    let new_link = NewRolePolicy {
        role_id,
        policy_id,
        level: new_level,
        created_at: created_at.unwrap_or_else(|| chrono::Utc::now().naive_utc()),
    };
    diesel::insert_into(roles_policies::table)
        .values(&new_link)
        .execute(conn)
        .map_err(SecurityError::from_integrity)?;
    Ok(())
}

/// Adds a relation between one specified role and one specified policy.
///
/// Same contract as [`crate::orm::user_role::add_role_to_user`], with the
/// role as the guarded parent.
pub fn add_policy_to_role(
    conn: &mut SqliteConnection,
    role_id: i32,
    policy_id: i32,
    position: Option<i32>,
    created_at: Option<NaiveDateTime>,
    force_admin: bool,
) -> Result<(), SecurityError> {
    conn.transaction(|conn| {
        add_policy_to_role_inner(conn, role_id, policy_id, position, created_at, force_admin)
    })?;
    cache::invalidate_resource_cache();
    Ok(())
}

/// Mirror of [`add_policy_to_role`].
pub fn add_role_to_policy(
    conn: &mut SqliteConnection,
    policy_id: i32,
    role_id: i32,
    position: Option<i32>,
    created_at: Option<NaiveDateTime>,
    force_admin: bool,
) -> Result<(), SecurityError> {
    add_policy_to_role(conn, role_id, policy_id, position, created_at, force_admin)
}

/// Checks if the role-policy relationship exists.
pub fn exists_role_policy(
    conn: &mut SqliteConnection,
    role_id: i32,
    policy_id: i32,
) -> Result<bool, SecurityError> {
    if !role_exists(conn, role_id)? {
        return Err(SecurityError::RoleNotExist);
    }
    if !policy_exists(conn, policy_id)? {
        return Err(SecurityError::PolicyNotExist);
    }
    Ok(find_link(conn, role_id, policy_id)?.is_some())
}

/// Gets all policies of a role, ordered by their level.
pub fn get_policies_from_role(
    conn: &mut SqliteConnection,
    role_id: i32,
) -> Result<Vec<Policy>, SecurityError> {
    roles_policies::table
        .inner_join(policies::table.on(policies::id.eq(roles_policies::policy_id)))
        .filter(roles_policies::role_id.eq(role_id))
        .order(roles_policies::level.asc())
        .select((
            policies::id,
            policies::name,
            policies::body,
            policies::resource_type,
            policies::created_at,
        ))
        .load::<Policy>(conn)
        .map_err(SecurityError::from)
}

/// Gets all roles holding a policy, ordered by role id.
pub fn get_roles_from_policy(
    conn: &mut SqliteConnection,
    policy_id: i32,
) -> Result<Vec<Role>, SecurityError> {
    roles_policies::table
        .inner_join(roles::table.on(roles::id.eq(roles_policies::role_id)))
        .filter(roles_policies::policy_id.eq(policy_id))
        .order(roles::id.asc())
        .select((roles::id, roles::name, roles::resource_type, roles::created_at))
        .load::<Role>(conn)
        .map_err(SecurityError::from)
}

/// Returns the raw link rows of a role, ordered by level. Exposed for the
/// migration coordinator and invariant checks.
pub fn get_role_policy_links(
    conn: &mut SqliteConnection,
    role_id: i32,
) -> Result<Vec<RolePolicy>, SecurityError> {
    roles_policies::table
        .filter(roles_policies::role_id.eq(role_id))
        .order(roles_policies::level.asc())
        .load::<RolePolicy>(conn)
        .map_err(SecurityError::from)
}

pub(crate) fn remove_policy_from_role_inner(
    conn: &mut SqliteConnection,
    role_id: i32,
    policy_id: i32,
) -> Result<(), SecurityError> {
    if role_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }
    if !role_exists(conn, role_id)? {
        return Err(SecurityError::RoleNotExist);
    }
    if !policy_exists(conn, policy_id)? {
        return Err(SecurityError::PolicyNotExist);
    }
    let link = find_link(conn, role_id, policy_id)?.ok_or(SecurityError::RelationshipError)?;

    diesel::delete(roles_policies::table.filter(roles_policies::id.eq(link.id))).execute(conn)?;
    diesel::update(
        roles_policies::table
            .filter(roles_policies::role_id.eq(role_id))
            .filter(roles_policies::level.gt(link.level)),
    )
    .set(roles_policies::level.eq(roles_policies::level - 1))
    .execute(conn)?;
    Ok(())
}

/// Removes a role-policy relationship. Does not remove the role or the
/// policy.
pub fn remove_policy_from_role(
    conn: &mut SqliteConnection,
    role_id: i32,
    policy_id: i32,
) -> Result<(), SecurityError> {
    conn.transaction(|conn| remove_policy_from_role_inner(conn, role_id, policy_id))?;
    cache::invalidate_resource_cache();
    Ok(())
}

/// Removes all policy links of a role in a single transaction.
pub fn remove_all_policies_from_role(
    conn: &mut SqliteConnection,
    role_id: i32,
) -> Result<(), SecurityError> {
    if role_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    conn.transaction(|conn| {
        let policy_ids: Vec<i32> = roles_policies::table
            .filter(roles_policies::role_id.eq(role_id))
            .order(roles_policies::level.asc())
            .select(roles_policies::policy_id)
            .load(conn)?;
        for policy_id in policy_ids {
            remove_policy_from_role_inner(conn, role_id, policy_id)
                .map_err(|_| SecurityError::RelationshipError)?;
        }
        Ok::<(), SecurityError>(())
    })?;
    cache::invalidate_resource_cache();
    Ok(())
}

/// Removes all role links of a policy in a single transaction.
///
/// Fails with `RELATIONSHIP_ERROR` (and rolls back) if any linked role is
/// in the reserved range.
pub fn remove_all_roles_from_policy(
    conn: &mut SqliteConnection,
    policy_id: i32,
) -> Result<(), SecurityError> {
    if policy_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    conn.transaction(|conn| {
        let role_ids: Vec<i32> = roles_policies::table
            .filter(roles_policies::policy_id.eq(policy_id))
            .order(roles_policies::role_id.asc())
            .select(roles_policies::role_id)
            .load(conn)?;
        for role_id in role_ids {
            remove_policy_from_role_inner(conn, role_id, policy_id)
                .map_err(|_| SecurityError::RelationshipError)?;
        }
        Ok::<(), SecurityError>(())
    })?;
    cache::invalidate_resource_cache();
    Ok(())
}

/// Replaces one policy of a role with another, atomically.
pub fn replace_policy_in_role(
    conn: &mut SqliteConnection,
    role_id: i32,
    current_policy_id: i32,
    new_policy_id: i32,
    position: Option<i32>,
) -> Result<(), SecurityError> {
    if role_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }
    if !exists_role_policy(conn, role_id, current_policy_id).unwrap_or(false) {
        return Err(SecurityError::RelationshipError);
    }
    if !policy_exists(conn, new_policy_id)? {
        return Err(SecurityError::RelationshipError);
    }

    conn.transaction(|conn| {
        remove_policy_from_role_inner(conn, role_id, current_policy_id)
            .map_err(|_| SecurityError::RelationshipError)?;
        add_policy_to_role_inner(conn, role_id, new_policy_id, position, None, false)
            .map_err(|_| SecurityError::RelationshipError)?;
        Ok::<(), SecurityError>(())
    })?;
    cache::invalidate_resource_cache();
    Ok(())
}
