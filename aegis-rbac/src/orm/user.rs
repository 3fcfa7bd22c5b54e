//! User manager: validated CRUD over the `users` table, credential
//! checking, and the run-as flag.

use argon2::{
    Argon2, PasswordHasher,
    password_hash::{PasswordHash, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::MAX_ID_RESERVED;
use crate::cache;
use crate::error::SecurityError;
use crate::models::{NewUser, ResourceType, User};
use crate::orm::db::{last_insert_rowid, sweep_orphan_links};

/// Hashes a password using Argon2 with a random salt.
///
/// # Returns
/// Argon2 hash string suitable for database storage
pub fn hash_password(password: &str) -> String {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .expect("Hashing should succeed")
        .to_string()
}

/// Verifies a plain text password against a stored Argon2 hash.
///
/// Returns `false` for unparsable hashes instead of failing; stored
/// hashes are treated as opaque strings.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

fn insert_user_inner(
    conn: &mut SqliteConnection,
    mut new_user: NewUser,
    check_default: bool,
) -> Result<User, SecurityError> {
    use crate::schema::users::dsl::*;

    if check_default {
        let max_existing: Option<i32> = users.select(diesel::dsl::max(id)).first(conn)?;
        if max_existing.unwrap_or(0) <= MAX_ID_RESERVED {
            new_user.id = Some(MAX_ID_RESERVED + 1);
        }
    }

    diesel::insert_into(users)
        .values(&new_user)
        .execute(conn)
        .map_err(SecurityError::from_integrity)?;

    let new_id = last_insert_rowid(conn)?;
    users
        .filter(id.eq(new_id))
        .first::<User>(conn)
        .map_err(SecurityError::from)
}

/// Creates a new user with a freshly hashed password.
///
/// The id is auto-assigned above the reserved range. Returns
/// `ALREADY_EXIST` if the username is taken.
pub fn add_user(
    conn: &mut SqliteConnection,
    username: &str,
    password: &str,
) -> Result<User, SecurityError> {
    add_user_with(
        conn,
        username,
        password,
        None,
        false,
        None,
        ResourceType::User,
        true,
    )
}

/// Creates a new user with full control over id, timestamp and resource
/// type.
///
/// `hashed` indicates that `password` is already an opaque hash and must
/// be stored verbatim. `check_default=false` honors a caller-supplied id
/// inside the reserved range; only the defaults loader and the migration
/// coordinator use it.
#[allow(clippy::too_many_arguments)]
pub fn add_user_with(
    conn: &mut SqliteConnection,
    username: &str,
    password: &str,
    user_id: Option<i32>,
    hashed: bool,
    created_at: Option<NaiveDateTime>,
    resource_type: ResourceType,
    check_default: bool,
) -> Result<User, SecurityError> {
    let new_user = NewUser {
        id: user_id,
        username: username.to_string(),
        password_hash: if hashed {
            password.to_string()
        } else {
            hash_password(password)
        },
        allow_run_as: false,
        resource_type: resource_type.as_str().to_string(),
        created_at: created_at.unwrap_or_else(|| chrono::Utc::now().naive_utc()),
    };

    let user = conn.transaction(|conn| insert_user_inner(conn, new_user, check_default))?;
    cache::invalidate_resource_cache();
    Ok(user)
}

/// Gets a single user by ID.
pub fn get_user_by_id(conn: &mut SqliteConnection, user_id: i32) -> Result<User, SecurityError> {
    use crate::schema::users::dsl::*;

    users
        .filter(id.eq(user_id))
        .first::<User>(conn)
        .optional()?
        .ok_or(SecurityError::UserNotExist)
}

/// Gets a single user by username.
pub fn get_user_by_name(conn: &mut SqliteConnection, name: &str) -> Result<User, SecurityError> {
    use crate::schema::users::dsl::*;

    users
        .filter(username.eq(name))
        .first::<User>(conn)
        .optional()?
        .ok_or(SecurityError::UserNotExist)
}

/// Returns all users in ascending order by id.
pub fn list_users(conn: &mut SqliteConnection) -> Result<Vec<User>, SecurityError> {
    use crate::schema::users::dsl::*;

    users
        .order(id.asc())
        .load::<User>(conn)
        .map_err(SecurityError::from)
}

/// Updates a user's password and/or resource type.
///
/// Reserved users are rejected with `ADMIN_RESOURCES` unless
/// `check_default=false`. Passing no fields is a silent no-op; the call
/// reports a change only if some field was actually written.
///
/// # Returns
/// * `Ok(true)` - At least one field was updated
/// * `Ok(false)` - Nothing to update
pub fn update_user(
    conn: &mut SqliteConnection,
    user_id: i32,
    new_password: Option<&str>,
    new_resource_type: Option<ResourceType>,
    check_default: bool,
) -> Result<bool, SecurityError> {
    use crate::schema::users::dsl::*;

    if check_default && user_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    let changed = conn.transaction(|conn| {
        users
            .filter(id.eq(user_id))
            .first::<User>(conn)
            .optional()?
            .ok_or(SecurityError::UserNotExist)?;

        let mut changed = false;
        if let Some(password) = new_password {
            diesel::update(users.filter(id.eq(user_id)))
                .set(password_hash.eq(hash_password(password)))
                .execute(conn)
                .map_err(SecurityError::from_integrity)?;
            changed = true;
        }
        if let Some(rtype) = new_resource_type {
            diesel::update(users.filter(id.eq(user_id)))
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

/// Changes the user's `allow_run_as` flag.
pub fn set_allow_run_as(
    conn: &mut SqliteConnection,
    user_id: i32,
    allow: bool,
) -> Result<(), SecurityError> {
    use crate::schema::users::dsl::*;

    conn.transaction(|conn| {
        users
            .filter(id.eq(user_id))
            .first::<User>(conn)
            .optional()?
            .ok_or(SecurityError::UserNotExist)?;

        diesel::update(users.filter(id.eq(user_id)))
            .set(allow_run_as.eq(allow))
            .execute(conn)
            .map_err(SecurityError::from_integrity)?;
        Ok::<(), SecurityError>(())
    })?;

    cache::invalidate_resource_cache();
    Ok(())
}

/// Returns the `allow_run_as` flag of the named user.
pub fn allow_run_as(conn: &mut SqliteConnection, name: &str) -> Result<bool, SecurityError> {
    Ok(get_user_by_name(conn, name)?.allow_run_as)
}

/// Validates a username-password pair against the stored hash.
///
/// Unknown usernames report `false` rather than an error so callers
/// cannot distinguish them from a wrong password.
pub fn check_credentials(
    conn: &mut SqliteConnection,
    name: &str,
    password: &str,
) -> Result<bool, SecurityError> {
    use crate::schema::users::dsl::*;

    let user = users
        .filter(username.eq(name))
        .first::<User>(conn)
        .optional()?;
    Ok(match user {
        Some(user) => verify_password(password, &user.password_hash),
        None => false,
    })
}

/// Deletes a user by ID, cascading to its role links.
///
/// # Returns
/// * `Ok(true)` - User removed
/// * `Ok(false)` - User not found
/// * `Err(AdminResources)` - Reserved user
pub fn delete_user_by_id(conn: &mut SqliteConnection, user_id: i32) -> Result<bool, SecurityError> {
    use crate::schema::users::dsl::*;

    if user_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    let deleted = conn.transaction(|conn| {
        let removed = diesel::delete(users.filter(id.eq(user_id)))
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

/// Deletes a user by username. Same contract as [`delete_user_by_id`].
pub fn delete_user_by_name(conn: &mut SqliteConnection, name: &str) -> Result<bool, SecurityError> {
    use crate::schema::users::dsl::*;

    let user = users
        .filter(username.eq(name))
        .first::<User>(conn)
        .optional()?;
    match user {
        Some(user) => delete_user_by_id(conn, user.id),
        None => Ok(false),
    }
}

/// Deletes every non-reserved user, returning the removed ids.
pub fn delete_all_users(conn: &mut SqliteConnection) -> Result<Vec<i32>, SecurityError> {
    use crate::schema::users::dsl::*;

    let removed = conn.transaction(|conn| {
        let targets: Vec<i32> = users
            .select(id)
            .filter(id.gt(MAX_ID_RESERVED))
            .order(id.asc())
            .load(conn)?;
        if !targets.is_empty() {
            diesel::delete(users.filter(id.gt(MAX_ID_RESERVED)))
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
