//! Role manager: validated CRUD over the `roles` table.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::MAX_ID_RESERVED;
use crate::cache;
use crate::error::SecurityError;
use crate::models::{NewRole, ResourceType, Role};
use crate::orm::db::{last_insert_rowid, sweep_orphan_links};

fn insert_role_inner(
    conn: &mut SqliteConnection,
    mut new_role: NewRole,
    check_default: bool,
) -> Result<Role, SecurityError> {
    use crate::schema::roles::dsl::*;

    if check_default {
        let max_existing: Option<i32> = roles.select(diesel::dsl::max(id)).first(conn)?;
        if max_existing.unwrap_or(0) <= MAX_ID_RESERVED {
            new_role.id = Some(MAX_ID_RESERVED + 1);
        }
    }

    diesel::insert_into(roles)
        .values(&new_role)
        .execute(conn)
        .map_err(SecurityError::from_integrity)?;

    let new_id = last_insert_rowid(conn)?;
    roles
        .filter(id.eq(new_id))
        .first::<Role>(conn)
        .map_err(SecurityError::from)
}

/// Creates a new role. The id is auto-assigned above the reserved range;
/// duplicate names return `ALREADY_EXIST`, names over 64 characters hit
/// the length constraint.
pub fn add_role(conn: &mut SqliteConnection, name: &str) -> Result<Role, SecurityError> {
    add_role_with(conn, name, None, None, ResourceType::User, true)
}

/// Creates a new role with full control over id, timestamp and resource
/// type. `check_default=false` honors reserved ids; only the defaults
/// loader and the migration coordinator use it.
pub fn add_role_with(
    conn: &mut SqliteConnection,
    name: &str,
    role_id: Option<i32>,
    created_at: Option<NaiveDateTime>,
    resource_type: ResourceType,
    check_default: bool,
) -> Result<Role, SecurityError> {
    let new_role = NewRole {
        id: role_id,
        name: name.to_string(),
        resource_type: resource_type.as_str().to_string(),
        created_at: created_at.unwrap_or_else(|| chrono::Utc::now().naive_utc()),
    };

    let role = conn.transaction(|conn| insert_role_inner(conn, new_role, check_default))?;
    cache::invalidate_resource_cache();
    Ok(role)
}

/// Gets a single role by ID.
pub fn get_role_by_id(conn: &mut SqliteConnection, role_id: i32) -> Result<Role, SecurityError> {
    use crate::schema::roles::dsl::*;

    roles
        .filter(id.eq(role_id))
        .first::<Role>(conn)
        .optional()?
        .ok_or(SecurityError::RoleNotExist)
}

/// Gets a single role by name.
pub fn get_role_by_name(conn: &mut SqliteConnection, role_name: &str) -> Result<Role, SecurityError> {
    use crate::schema::roles::dsl::*;

    roles
        .filter(name.eq(role_name))
        .first::<Role>(conn)
        .optional()?
        .ok_or(SecurityError::RoleNotExist)
}

/// Returns all roles in ascending order by id.
pub fn list_roles(conn: &mut SqliteConnection) -> Result<Vec<Role>, SecurityError> {
    use crate::schema::roles::dsl::*;

    roles
        .order(id.asc())
        .load::<Role>(conn)
        .map_err(SecurityError::from)
}

/// Renames a role and/or changes its resource type.
///
/// Reserved roles are rejected with `ADMIN_RESOURCES` unless
/// `check_default=false`. Passing no fields is a silent no-op.
pub fn update_role(
    conn: &mut SqliteConnection,
    role_id: i32,
    new_name: Option<&str>,
    new_resource_type: Option<ResourceType>,
    check_default: bool,
) -> Result<bool, SecurityError> {
    use crate::schema::roles::dsl::*;

    if check_default && role_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    let changed = conn.transaction(|conn| {
        roles
            .filter(id.eq(role_id))
            .first::<Role>(conn)
            .optional()?
            .ok_or(SecurityError::RoleNotExist)?;

        let mut changed = false;
        if let Some(role_name) = new_name {
            diesel::update(roles.filter(id.eq(role_id)))
                .set(name.eq(role_name))
                .execute(conn)
                .map_err(SecurityError::from_integrity)?;
            changed = true;
        }
        if let Some(rtype) = new_resource_type {
            diesel::update(roles.filter(id.eq(role_id)))
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

/// Deletes a role by ID, cascading to its user, policy and rule links.
///
/// # Returns
/// * `Ok(true)` - Role removed
/// * `Ok(false)` - Role not found
/// * `Err(AdminResources)` - Reserved role
pub fn delete_role_by_id(conn: &mut SqliteConnection, role_id: i32) -> Result<bool, SecurityError> {
    use crate::schema::roles::dsl::*;

    if role_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    let deleted = conn.transaction(|conn| {
        let removed = diesel::delete(roles.filter(id.eq(role_id)))
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

/// Deletes a role by name. Same contract as [`delete_role_by_id`].
pub fn delete_role_by_name(
    conn: &mut SqliteConnection,
    role_name: &str,
) -> Result<bool, SecurityError> {
    use crate::schema::roles::dsl::*;

    let role = roles
        .filter(name.eq(role_name))
        .first::<Role>(conn)
        .optional()?;
    match role {
        Some(role) => delete_role_by_id(conn, role.id),
        None => Ok(false),
    }
}

/// Deletes every non-reserved role, returning the removed ids.
pub fn delete_all_roles(conn: &mut SqliteConnection) -> Result<Vec<i32>, SecurityError> {
    use crate::schema::roles::dsl::*;

    let removed = conn.transaction(|conn| {
        let targets: Vec<i32> = roles
            .select(id)
            .filter(id.gt(MAX_ID_RESERVED))
            .order(id.asc())
            .load(conn)?;
        if !targets.is_empty() {
            diesel::delete(roles.filter(id.gt(MAX_ID_RESERVED)))
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
