//! Ordered User<->Role relationship manager.
//!
//! Every user's role links carry a zero-based `level` that stays
//! contiguous: inserting at a taken position shifts later links up,
//! removing a link shifts them back down. All multi-step edits run in a
//! single transaction.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::MAX_ID_RESERVED;
use crate::cache;
use crate::error::SecurityError;
use crate::models::{NewUserRole, Role, User, UserRole};
use crate::schema::{roles, user_roles, users};

fn user_exists(conn: &mut SqliteConnection, user_id: i32) -> Result<bool, SecurityError> {
    let found: Option<i32> = users::table
        .select(users::id)
        .filter(users::id.eq(user_id))
        .first(conn)
        .optional()?;
    Ok(found.is_some())
}

fn role_exists(conn: &mut SqliteConnection, role_id: i32) -> Result<bool, SecurityError> {
    let found: Option<i32> = roles::table
        .select(roles::id)
        .filter(roles::id.eq(role_id))
        .first(conn)
        .optional()?;
    Ok(found.is_some())
}

fn find_link(
    conn: &mut SqliteConnection,
    user_id: i32,
    role_id: i32,
) -> Result<Option<UserRole>, SecurityError> {
    user_roles::table
        .filter(user_roles::user_id.eq(user_id))
        .filter(user_roles::role_id.eq(role_id))
        .first::<UserRole>(conn)
        .optional()
        .map_err(SecurityError::from)
}

pub(crate) fn add_role_to_user_inner(
    conn: &mut SqliteConnection,
    user_id: i32,
    role_id: i32,
    position: Option<i32>,
    created_at: Option<NaiveDateTime>,
    force_admin: bool,
) -> Result<(), SecurityError> {
    if user_id <= MAX_ID_RESERVED && !force_admin {
        return Err(SecurityError::AdminResources);
    }
    if !user_exists(conn, user_id)? {
        return Err(SecurityError::UserNotExist);
    }
    if !role_exists(conn, role_id)? {
        return Err(SecurityError::RoleNotExist);
    }
    if find_link(conn, user_id, role_id)?.is_some() {
        return Err(SecurityError::AlreadyExist);
    }

    let count: i64 = user_roles::table
        .filter(user_roles::user_id.eq(user_id))
        .count()
        .get_result(conn)?;

    let new_level = if count == 0 {
        0
    } else {
        match position {
            None => count as i32,
            Some(position) => {
                let max_level: Option<i32> = user_roles::table
                    .filter(user_roles::user_id.eq(user_id))
                    .select(diesel::dsl::max(user_roles::level))
                    .first(conn)?;
                let max_level = max_level.unwrap_or(0);
                let target = position.max(0).min(max_level + 1);
                if target <= max_level {
                    // Occupied position: make room by shifting later links up
                    diesel::update(
                        user_roles::table
                            .filter(user_roles::user_id.eq(user_id))
                            .filter(user_roles::level.ge(target)),
                    )
                    .set(user_roles::level.eq(user_roles::level + 1))
                    .execute(conn)?;
                }
                target
            }
        }
    };

    let new_link = NewUserRole {
        user_id,
        role_id,
        level: new_level,
        created_at: created_at.unwrap_or_else(|| chrono::Utc::now().naive_utc()),
    };
    diesel::insert_into(user_roles::table)
        .values(&new_link)
        .execute(conn)
        .map_err(SecurityError::from_integrity)?;
    Ok(())
}

/// Adds a relation between one specified user and one specified role.
///
/// # Arguments
/// * `position` - Order to be applied in case of multiple roles on the
///   same user. `None` appends; a taken position shifts later links up.
/// * `created_at` - Explicit link timestamp; `None` means now.
/// * `force_admin` - Permits touching users in the reserved range. Only
///   the defaults loader and the migration coordinator set this.
///
/// # Returns
/// * `Err(AdminResources)` - Reserved user without `force_admin`
/// * `Err(UserNotExist)` / `Err(RoleNotExist)` - Missing endpoint
/// * `Err(AlreadyExist)` - The relationship is already present
pub fn add_role_to_user(
    conn: &mut SqliteConnection,
    user_id: i32,
    role_id: i32,
    position: Option<i32>,
    created_at: Option<NaiveDateTime>,
    force_admin: bool,
) -> Result<(), SecurityError> {
    conn.transaction(|conn| {
        add_role_to_user_inner(conn, user_id, role_id, position, created_at, force_admin)
    })?;
    cache::invalidate_resource_cache();
    Ok(())
}

/// Mirror of [`add_role_to_user`].
pub fn add_user_to_role(
    conn: &mut SqliteConnection,
    user_id: i32,
    role_id: i32,
    position: Option<i32>,
    created_at: Option<NaiveDateTime>,
    force_admin: bool,
) -> Result<(), SecurityError> {
    add_role_to_user(conn, user_id, role_id, position, created_at, force_admin)
}

/// Checks if the user-role relationship exists.
///
/// Missing endpoints report `USER_NOT_EXIST` / `ROLE_NOT_EXIST` instead
/// of `false`.
pub fn exists_user_role(
    conn: &mut SqliteConnection,
    user_id: i32,
    role_id: i32,
) -> Result<bool, SecurityError> {
    if !user_exists(conn, user_id)? {
        return Err(SecurityError::UserNotExist);
    }
    if !role_exists(conn, role_id)? {
        return Err(SecurityError::RoleNotExist);
    }
    Ok(find_link(conn, user_id, role_id)?.is_some())
}

/// Gets all roles of a user, ordered by their level.
pub fn get_roles_from_user(
    conn: &mut SqliteConnection,
    user_id: i32,
) -> Result<Vec<Role>, SecurityError> {
    user_roles::table
        .inner_join(roles::table.on(roles::id.eq(user_roles::role_id)))
        .filter(user_roles::user_id.eq(user_id))
        .order(user_roles::level.asc())
        .select((roles::id, roles::name, roles::resource_type, roles::created_at))
        .load::<Role>(conn)
        .map_err(SecurityError::from)
}

/// Gets all users holding a role, ordered by user id.
pub fn get_users_from_role(
    conn: &mut SqliteConnection,
    role_id: i32,
) -> Result<Vec<User>, SecurityError> {
    user_roles::table
        .inner_join(users::table.on(users::id.eq(user_roles::user_id)))
        .filter(user_roles::role_id.eq(role_id))
        .order(users::id.asc())
        .select((
            users::id,
            users::username,
            users::password_hash,
            users::allow_run_as,
            users::resource_type,
            users::created_at,
        ))
        .load::<User>(conn)
        .map_err(SecurityError::from)
}

/// Returns the raw link rows of a user, ordered by level. Exposed for the
/// migration coordinator and invariant checks.
pub fn get_user_role_links(
    conn: &mut SqliteConnection,
    user_id: i32,
) -> Result<Vec<UserRole>, SecurityError> {
    user_roles::table
        .filter(user_roles::user_id.eq(user_id))
        .order(user_roles::level.asc())
        .load::<UserRole>(conn)
        .map_err(SecurityError::from)
}

pub(crate) fn remove_role_from_user_inner(
    conn: &mut SqliteConnection,
    user_id: i32,
    role_id: i32,
) -> Result<(), SecurityError> {
    if user_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }
    if !user_exists(conn, user_id)? {
        return Err(SecurityError::UserNotExist);
    }
    if !role_exists(conn, role_id)? {
        return Err(SecurityError::RoleNotExist);
    }
    let link = find_link(conn, user_id, role_id)?.ok_or(SecurityError::RelationshipError)?;

    diesel::delete(user_roles::table.filter(user_roles::id.eq(link.id))).execute(conn)?;
    // Close the gap left at the removed position
    diesel::update(
        user_roles::table
            .filter(user_roles::user_id.eq(user_id))
            .filter(user_roles::level.gt(link.level)),
    )
    .set(user_roles::level.eq(user_roles::level - 1))
    .execute(conn)?;
    Ok(())
}

/// Removes a user-role relationship. Does not remove the user or the role.
///
/// # Returns
/// * `Err(AdminResources)` - Reserved user
/// * `Err(UserNotExist)` / `Err(RoleNotExist)` - Missing endpoint
/// * `Err(RelationshipError)` - The relationship does not exist
pub fn remove_role_from_user(
    conn: &mut SqliteConnection,
    user_id: i32,
    role_id: i32,
) -> Result<(), SecurityError> {
    conn.transaction(|conn| remove_role_from_user_inner(conn, user_id, role_id))?;
    cache::invalidate_resource_cache();
    Ok(())
}

/// Removes all role links of a user in a single transaction.
pub fn remove_all_roles_from_user(
    conn: &mut SqliteConnection,
    user_id: i32,
) -> Result<(), SecurityError> {
    if user_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    conn.transaction(|conn| {
        let role_ids: Vec<i32> = user_roles::table
            .filter(user_roles::user_id.eq(user_id))
            .order(user_roles::level.asc())
            .select(user_roles::role_id)
            .load(conn)?;
        for role_id in role_ids {
            remove_role_from_user_inner(conn, user_id, role_id)
                .map_err(|_| SecurityError::RelationshipError)?;
        }
        Ok::<(), SecurityError>(())
    })?;
    cache::invalidate_resource_cache();
    Ok(())
}

/// Removes all user links of a role in a single transaction.
///
/// Fails with `RELATIONSHIP_ERROR` (and rolls back) if any linked user is
/// in the reserved range.
pub fn remove_all_users_from_role(
    conn: &mut SqliteConnection,
    role_id: i32,
) -> Result<(), SecurityError> {
    if role_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    conn.transaction(|conn| {
        let user_ids: Vec<i32> = user_roles::table
            .filter(user_roles::role_id.eq(role_id))
            .order(user_roles::user_id.asc())
            .select(user_roles::user_id)
            .load(conn)?;
        for user_id in user_ids {
            remove_role_from_user_inner(conn, user_id, role_id)
                .map_err(|_| SecurityError::RelationshipError)?;
        }
        Ok::<(), SecurityError>(())
    })?;
    cache::invalidate_resource_cache();
    Ok(())
}

/// Replaces one role of a user with another, atomically.
///
/// The removal and the insertion run in one transaction; if any step
/// fails the whole edit rolls back with `RELATIONSHIP_ERROR`.
pub fn replace_role_in_user(
    conn: &mut SqliteConnection,
    user_id: i32,
    current_role_id: i32,
    new_role_id: i32,
    position: Option<i32>,
) -> Result<(), SecurityError> {
    if user_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }
    if !exists_user_role(conn, user_id, current_role_id).unwrap_or(false) {
        return Err(SecurityError::RelationshipError);
    }
    if !role_exists(conn, new_role_id)? {
        return Err(SecurityError::RelationshipError);
    }

    conn.transaction(|conn| {
        remove_role_from_user_inner(conn, user_id, current_role_id)
            .map_err(|_| SecurityError::RelationshipError)?;
        add_role_to_user_inner(conn, user_id, new_role_id, position, None, false)
            .map_err(|_| SecurityError::RelationshipError)?;
        Ok::<(), SecurityError>(())
    })?;
    cache::invalidate_resource_cache();
    Ok(())
}
