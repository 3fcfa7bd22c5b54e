//! Startup integrity check and schema/data migration.
//!
//! On every startup the coordinator verifies the RBAC database file: a
//! missing file becomes a fresh install, a stale `user_version` triggers
//! an upgrade. Upgrades build a brand-new database in a temporary file,
//! seed the current defaults into it, copy the user-defined resources
//! across, and atomically swap the files. Any failure leaves the original
//! database untouched; the temporary file is always removed on exit.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde_json::Value as Json;
use tracing::{debug, error, info, warn};

use crate::error::{IntegrityError, SecurityError};
use crate::models::ResourceType;
use crate::orm::{db, defaults, policy, role, role_policy, role_rule, rule, user, user_role};
use crate::schema::{policies, roles, roles_policies, roles_rules, rules, user_roles, users};
use crate::{CLOUD_RESERVED_RANGE, MAX_ID_RESERVED};

/// Consumed collaborator that fixes file ownership (uid/gid). The core
/// only adjusts permission bits itself; owning the service account is the
/// host's job.
pub trait FileOwnership {
    fn fix(&self, path: &Path) -> io::Result<()>;
}

/// No-op ownership fixer, used in tests and on platforms where the
/// service does not manage ownership.
pub struct NoOwnership;

impl FileOwnership for NoOwnership {
    fn fix(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

fn tmp_db_path(db_file: &Path) -> PathBuf {
    let mut os = db_file.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o640))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Moves `src` over `dst`, falling back to copy-and-remove when a plain
/// rename is not possible, then restores mode and ownership on the
/// destination.
fn safe_move(src: &Path, dst: &Path, ownership: &dyn FileOwnership) -> Result<(), IntegrityError> {
    if std::fs::rename(src, dst).is_err() {
        std::fs::copy(src, dst)?;
        std::fs::remove_file(src)?;
    }
    set_file_mode(dst)?;
    ownership.fix(dst)?;
    Ok(())
}

#[derive(Queryable)]
struct LegacyUser {
    id: i32,
    username: String,
    password_hash: String,
    allow_run_as: bool,
    created_at: NaiveDateTime,
}

#[derive(Queryable)]
struct LegacyNamed {
    id: i32,
    name: String,
    created_at: NaiveDateTime,
}

#[derive(Queryable)]
struct LegacyBodied {
    id: i32,
    name: String,
    body: String,
    created_at: NaiveDateTime,
}

#[derive(Queryable)]
struct LegacyOrderedLink {
    parent_id: i32,
    child_id: i32,
    level: i32,
    created_at: NaiveDateTime,
}

#[derive(Queryable)]
struct LegacyLink {
    parent_id: i32,
    child_id: i32,
    created_at: NaiveDateTime,
}

/// Finds the target-database id of a source user, rematching reserved
/// ids by name: built-in ids may have shifted between versions.
fn rematch_user(
    source: &mut SqliteConnection,
    target: &mut SqliteConnection,
    user_id: i32,
) -> Result<Option<i32>, IntegrityError> {
    if user_id > MAX_ID_RESERVED {
        return Ok(Some(user_id));
    }
    let name: Option<String> = users::table
        .select(users::username)
        .filter(users::id.eq(user_id))
        .first(source)
        .optional()?;
    let Some(name) = name else { return Ok(None) };
    match user::get_user_by_name(target, &name) {
        Ok(user) => Ok(Some(user.id)),
        Err(SecurityError::UserNotExist) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn rematch_role(
    source: &mut SqliteConnection,
    target: &mut SqliteConnection,
    role_id: i32,
) -> Result<Option<i32>, IntegrityError> {
    if role_id > MAX_ID_RESERVED {
        return Ok(Some(role_id));
    }
    let name: Option<String> = roles::table
        .select(roles::name)
        .filter(roles::id.eq(role_id))
        .first(source)
        .optional()?;
    let Some(name) = name else { return Ok(None) };
    match role::get_role_by_name(target, &name) {
        Ok(role) => Ok(Some(role.id)),
        Err(SecurityError::RoleNotExist) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn rematch_rule(
    source: &mut SqliteConnection,
    target: &mut SqliteConnection,
    rule_id: i32,
) -> Result<Option<i32>, IntegrityError> {
    if rule_id > MAX_ID_RESERVED {
        return Ok(Some(rule_id));
    }
    let name: Option<String> = rules::table
        .select(rules::name)
        .filter(rules::id.eq(rule_id))
        .first(source)
        .optional()?;
    let Some(name) = name else { return Ok(None) };
    match rule::get_rule_by_name(target, &name) {
        Ok(rule) => Ok(Some(rule.id)),
        Err(SecurityError::RuleNotExist) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Finds the target id of a source policy: body-collision remaps first,
/// then reserved-id rematch by name.
fn rematch_policy(
    source: &mut SqliteConnection,
    target: &mut SqliteConnection,
    policy_id: i32,
    remap: &HashMap<i32, i32>,
) -> Result<Option<i32>, IntegrityError> {
    if let Some(&mapped) = remap.get(&policy_id) {
        return Ok(Some(mapped));
    }
    if policy_id > MAX_ID_RESERVED {
        return Ok(Some(policy_id));
    }
    let name: Option<String> = policies::table
        .select(policies::name)
        .filter(policies::id.eq(policy_id))
        .first(source)
        .optional()?;
    let Some(name) = name else { return Ok(None) };
    match policy::get_policy_by_name(target, &name) {
        Ok(policy) => Ok(Some(policy.id)),
        Err(SecurityError::PolicyNotExist) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Copies one id window of resources from `source` into `target`.
///
/// Entities keep their ids, timestamps, hashes and ordering levels but
/// take the `resource_type` of the pass. Relationships whose reserved
/// endpoints cannot be rematched by name are skipped silently; policies
/// whose body collides with an existing default are dropped and their
/// role links retargeted to the surviving policy.
fn migrate_data(
    source: &mut SqliteConnection,
    target: &mut SqliteConnection,
    from_id: i32,
    to_id: Option<i32>,
    resource_type: ResourceType,
) -> Result<(), IntegrityError> {
    // Users
    let mut query = users::table
        .select((
            users::id,
            users::username,
            users::password_hash,
            users::allow_run_as,
            users::created_at,
        ))
        .order(users::id.asc())
        .into_boxed();
    query = match to_id {
        Some(to_id) => query.filter(users::id.between(from_id, to_id)),
        None => query.filter(users::id.ge(from_id)),
    };
    for legacy in query.load::<LegacyUser>(source)? {
        match user::add_user_with(
            target,
            &legacy.username,
            &legacy.password_hash,
            Some(legacy.id),
            true,
            Some(legacy.created_at),
            resource_type,
            false,
        ) {
            Ok(user) => user::set_allow_run_as(target, user.id, legacy.allow_run_as)?,
            Err(SecurityError::AlreadyExist) => {
                debug!("user {} already present in upgraded database", legacy.username)
            }
            Err(err) => warn!("could not migrate user {}: {err}", legacy.username),
        }
    }

    // Roles
    let mut query = roles::table
        .select((roles::id, roles::name, roles::created_at))
        .order(roles::id.asc())
        .into_boxed();
    query = match to_id {
        Some(to_id) => query.filter(roles::id.between(from_id, to_id)),
        None => query.filter(roles::id.ge(from_id)),
    };
    for legacy in query.load::<LegacyNamed>(source)? {
        match role::add_role_with(
            target,
            &legacy.name,
            Some(legacy.id),
            Some(legacy.created_at),
            resource_type,
            false,
        ) {
            Ok(_) => {}
            Err(SecurityError::AlreadyExist) => {
                debug!("role {} already present in upgraded database", legacy.name)
            }
            Err(err) => warn!("could not migrate role {}: {err}", legacy.name),
        }
    }

    // Rules
    let mut query = rules::table
        .select((rules::id, rules::name, rules::rule_body, rules::created_at))
        .order(rules::id.asc())
        .into_boxed();
    query = match to_id {
        Some(to_id) => query.filter(rules::id.between(from_id, to_id)),
        None => query.filter(rules::id.ge(from_id)),
    };
    for legacy in query.load::<LegacyBodied>(source)? {
        let Ok(body) = serde_json::from_str::<Json>(&legacy.body) else {
            warn!("rule {} carries an unreadable body; skipped", legacy.name);
            continue;
        };
        match rule::add_rule_with(
            target,
            &legacy.name,
            &body,
            Some(legacy.id),
            Some(legacy.created_at),
            resource_type,
            false,
        ) {
            Ok(_) => {}
            Err(SecurityError::AlreadyExist) => {
                debug!("rule {} already present in upgraded database", legacy.name)
            }
            Err(err) => warn!("could not migrate rule {}: {err}", legacy.name),
        }
    }

    // Policies. A body identical to an existing default cannot be
    // re-inserted (unique body); those ids are remapped so the
    // relationship pass retargets links to the surviving policy.
    let mut policy_remap: HashMap<i32, i32> = HashMap::new();
    let mut query = policies::table
        .select((policies::id, policies::name, policies::body, policies::created_at))
        .order(policies::id.asc())
        .into_boxed();
    query = match to_id {
        Some(to_id) => query.filter(policies::id.between(from_id, to_id)),
        None => query.filter(policies::id.ge(from_id)),
    };
    for legacy in query.load::<LegacyBodied>(source)? {
        let Ok(body) = serde_json::from_str::<Json>(&legacy.body) else {
            warn!("policy {} carries an unreadable body; skipped", legacy.name);
            continue;
        };
        match policy::add_policy_with(
            target,
            &legacy.name,
            &body,
            Some(legacy.id),
            Some(legacy.created_at),
            resource_type,
            false,
        ) {
            Ok(_) => {}
            Err(SecurityError::AlreadyExist) | Err(SecurityError::ConstraintError) => {
                match policy::get_policy_by_body(target, &body) {
                    Ok(surviving) => {
                        debug!(
                            "policy {} collides with {} in upgraded database",
                            legacy.name, surviving.name
                        );
                        policy_remap.insert(legacy.id, surviving.id);
                    }
                    Err(_) => debug!(
                        "policy {} collides by name in upgraded database; skipped",
                        legacy.name
                    ),
                }
            }
            Err(err) => warn!("could not migrate policy {}: {err}", legacy.name),
        }
    }

    // User-role links, in level order so positions replay exactly
    let mut query = user_roles::table
        .select((
            user_roles::user_id,
            user_roles::role_id,
            user_roles::level,
            user_roles::created_at,
        ))
        .order((user_roles::user_id.asc(), user_roles::level.asc()))
        .into_boxed();
    query = match to_id {
        Some(to_id) => query.filter(
            user_roles::user_id
                .between(from_id, to_id)
                .or(user_roles::role_id.between(from_id, to_id)),
        ),
        None => query.filter(
            user_roles::user_id
                .ge(from_id)
                .or(user_roles::role_id.ge(from_id)),
        ),
    };
    for link in query.load::<LegacyOrderedLink>(source)? {
        let Some(user_id) = rematch_user(source, target, link.parent_id)? else {
            continue;
        };
        let Some(role_id) = rematch_role(source, target, link.child_id)? else {
            continue;
        };
        match user_role::add_role_to_user(
            target,
            user_id,
            role_id,
            Some(link.level),
            Some(link.created_at),
            true,
        ) {
            Ok(()) | Err(SecurityError::AlreadyExist) => {}
            Err(err) => debug!("skipped user-role link {user_id}->{role_id}: {err}"),
        }
    }

    // Role-policy links
    let mut query = roles_policies::table
        .select((
            roles_policies::role_id,
            roles_policies::policy_id,
            roles_policies::level,
            roles_policies::created_at,
        ))
        .order((roles_policies::role_id.asc(), roles_policies::level.asc()))
        .into_boxed();
    query = match to_id {
        Some(to_id) => query.filter(
            roles_policies::role_id
                .between(from_id, to_id)
                .or(roles_policies::policy_id.between(from_id, to_id)),
        ),
        None => query.filter(
            roles_policies::role_id
                .ge(from_id)
                .or(roles_policies::policy_id.ge(from_id)),
        ),
    };
    for link in query.load::<LegacyOrderedLink>(source)? {
        let Some(role_id) = rematch_role(source, target, link.parent_id)? else {
            continue;
        };
        let Some(policy_id) = rematch_policy(source, target, link.child_id, &policy_remap)?
        else {
            continue;
        };
        match role_policy::add_policy_to_role(
            target,
            role_id,
            policy_id,
            Some(link.level),
            Some(link.created_at),
            true,
        ) {
            Ok(()) | Err(SecurityError::AlreadyExist) => {}
            Err(err) => debug!("skipped role-policy link {role_id}->{policy_id}: {err}"),
        }
    }

    // Role-rule links
    let mut query = roles_rules::table
        .select((roles_rules::role_id, roles_rules::rule_id, roles_rules::created_at))
        .order((roles_rules::role_id.asc(), roles_rules::id.asc()))
        .into_boxed();
    query = match to_id {
        Some(to_id) => query.filter(
            roles_rules::role_id
                .between(from_id, to_id)
                .or(roles_rules::rule_id.between(from_id, to_id)),
        ),
        None => query.filter(
            roles_rules::role_id
                .ge(from_id)
                .or(roles_rules::rule_id.ge(from_id)),
        ),
    };
    for link in query.load::<LegacyLink>(source)? {
        let Some(role_id) = rematch_role(source, target, link.parent_id)? else {
            continue;
        };
        let Some(rule_id) = rematch_rule(source, target, link.child_id)? else {
            continue;
        };
        match role_rule::add_rule_to_role(target, role_id, rule_id, Some(link.created_at), true) {
            Ok(()) | Err(SecurityError::AlreadyExist) => {}
            Err(err) => debug!("skipped role-rule link {role_id}->{rule_id}: {err}"),
        }
    }

    Ok(())
}

fn fresh_install(
    db_file: &Path,
    expected_version: i32,
    ownership: &dyn FileOwnership,
) -> Result<(), IntegrityError> {
    info!("RBAC database not found, creating a new one");
    let mut conn = db::connect(db_file)?;
    db::create_schema(&mut conn)?;
    set_file_mode(db_file)?;
    ownership.fix(db_file)?;
    defaults::insert_default_resources(&mut conn)?;
    db::set_database_version(&mut conn, expected_version)?;
    info!("RBAC database created successfully");
    Ok(())
}

fn upgrade(
    db_file: &Path,
    tmp_file: &Path,
    mut source: SqliteConnection,
    expected_version: i32,
    ownership: &dyn FileOwnership,
) -> Result<(), IntegrityError> {
    if tmp_file.exists() {
        std::fs::remove_file(tmp_file)?;
    }

    let mut target = db::connect(tmp_file)?;
    db::create_schema(&mut target)?;
    set_file_mode(tmp_file)?;
    ownership.fix(tmp_file)?;
    defaults::insert_default_resources(&mut target)?;

    migrate_data(
        &mut source,
        &mut target,
        CLOUD_RESERVED_RANGE,
        Some(MAX_ID_RESERVED),
        ResourceType::Protected,
    )?;
    migrate_data(
        &mut source,
        &mut target,
        MAX_ID_RESERVED + 1,
        None,
        ResourceType::User,
    )?;

    db::set_database_version(&mut target, expected_version)?;

    // Close both databases before touching the files
    drop(source);
    drop(target);
    safe_move(tmp_file, db_file, ownership)?;
    Ok(())
}

/// Verifies the RBAC database on startup and upgrades it when its stored
/// `user_version` lags `expected_version`.
///
/// * Missing file: create it, seed defaults, stamp the version.
/// * Version current: fix permissions and return.
/// * Version stale: build a fresh database in `<db>.tmp`, seed the
///   current defaults, migrate user data across in two passes (the
///   cloud-reserved window as `protected`, everything above the reserved
///   range as `user`), stamp the version and atomically swap the files.
///
/// On any upgrade failure the original file is left intact and the error
/// is both logged and returned. The temporary file is removed in every
/// outcome. Re-running after a completed upgrade is a no-op.
pub fn check_database_integrity(
    db_file: &Path,
    expected_version: i32,
    ownership: &dyn FileOwnership,
) -> Result<(), IntegrityError> {
    info!("Checking RBAC database integrity");
    let tmp_file = tmp_db_path(db_file);

    let result = (|| {
        if !db_file.exists() {
            return fresh_install(db_file, expected_version, ownership);
        }

        set_file_mode(db_file)?;
        ownership.fix(db_file)?;
        let mut source = db::connect(db_file)?;
        let current_version = db::database_version(&mut source)?;
        if current_version >= expected_version {
            return Ok(());
        }

        info!(
            "RBAC database migration required: version {current_version} should be \
             {expected_version}"
        );
        upgrade(db_file, &tmp_file, source, expected_version, ownership)?;
        info!("RBAC database upgraded to version {expected_version}");
        Ok(())
    })();

    if let Err(err) = &result {
        error!("RBAC database integrity check failed, keeping the previous database: {err}");
    }
    if tmp_file.exists() {
        if let Err(err) = std::fs::remove_file(&tmp_file) {
            warn!("could not remove temporary RBAC database: {err}");
        }
    }
    result
}
