//! Unordered Role<->Rule relationship manager.
//!
//! Unlike the other two associations there is no `level`; listing follows
//! insertion order. The guarded endpoint of this edge is the rule: rules
//! in the reserved range belong to the built-in login flows. Role 1 must
//! keep its required rules linked at all times.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::cache;
use crate::error::SecurityError;
use crate::models::{NewRoleRule, Role, RoleRule, Rule};
use crate::schema::{roles, roles_rules, rules};
use crate::{MAX_ID_RESERVED, required_rules_for_role};

fn role_exists(conn: &mut SqliteConnection, role_id: i32) -> Result<bool, SecurityError> {
    let found: Option<i32> = roles::table
        .select(roles::id)
        .filter(roles::id.eq(role_id))
        .first(conn)
        .optional()?;
    Ok(found.is_some())
}

fn rule_exists(conn: &mut SqliteConnection, rule_id: i32) -> Result<bool, SecurityError> {
    let found: Option<i32> = rules::table
        .select(rules::id)
        .filter(rules::id.eq(rule_id))
        .first(conn)
        .optional()?;
    Ok(found.is_some())
}

fn find_link(
    conn: &mut SqliteConnection,
    role_id: i32,
    rule_id: i32,
) -> Result<Option<RoleRule>, SecurityError> {
    roles_rules::table
        .filter(roles_rules::role_id.eq(role_id))
        .filter(roles_rules::rule_id.eq(rule_id))
        .first::<RoleRule>(conn)
        .optional()
        .map_err(SecurityError::from)
}

pub(crate) fn add_rule_to_role_inner(
    conn: &mut SqliteConnection,
    role_id: i32,
    rule_id: i32,
    created_at: Option<NaiveDateTime>,
    force_admin: bool,
) -> Result<(), SecurityError> {
    if rule_id <= MAX_ID_RESERVED && !force_admin {
        return Err(SecurityError::AdminResources);
    }
    if !rule_exists(conn, rule_id)? {
        return Err(SecurityError::RuleNotExist);
    }
    if !role_exists(conn, role_id)? {
        return Err(SecurityError::RoleNotExist);
    }
    if find_link(conn, role_id, rule_id)?.is_some() {
        return Err(SecurityError::AlreadyExist);
    }

    let new_link = NewRoleRule {
        role_id,
        rule_id,
        created_at: created_at.unwrap_or_else(|| chrono::Utc::now().naive_utc()),
    };
    diesel::insert_into(roles_rules::table)
        .values(&new_link)
        .execute(conn)
        .map_err(SecurityError::from_integrity)?;
    Ok(())
}

/// Adds a relation between one specified role and one specified rule.
///
/// # Returns
/// * `Err(AdminResources)` - Reserved rule without `force_admin`
/// * `Err(RuleNotExist)` / `Err(RoleNotExist)` - Missing endpoint
/// * `Err(AlreadyExist)` - The relationship is already present
pub fn add_rule_to_role(
    conn: &mut SqliteConnection,
    role_id: i32,
    rule_id: i32,
    created_at: Option<NaiveDateTime>,
    force_admin: bool,
) -> Result<(), SecurityError> {
    conn.transaction(|conn| add_rule_to_role_inner(conn, role_id, rule_id, created_at, force_admin))?;
    cache::invalidate_resource_cache();
    Ok(())
}

/// Mirror of [`add_rule_to_role`].
pub fn add_role_to_rule(
    conn: &mut SqliteConnection,
    rule_id: i32,
    role_id: i32,
    created_at: Option<NaiveDateTime>,
    force_admin: bool,
) -> Result<(), SecurityError> {
    add_rule_to_role(conn, role_id, rule_id, created_at, force_admin)
}

/// Checks if the role-rule relationship exists.
pub fn exists_role_rule(
    conn: &mut SqliteConnection,
    role_id: i32,
    rule_id: i32,
) -> Result<bool, SecurityError> {
    if !rule_exists(conn, rule_id)? {
        return Err(SecurityError::RuleNotExist);
    }
    if !role_exists(conn, role_id)? {
        return Err(SecurityError::RoleNotExist);
    }
    Ok(find_link(conn, role_id, rule_id)?.is_some())
}

/// Gets all rules linked to a role, in link-insertion order.
pub fn get_rules_from_role(
    conn: &mut SqliteConnection,
    role_id: i32,
) -> Result<Vec<Rule>, SecurityError> {
    roles_rules::table
        .inner_join(rules::table.on(rules::id.eq(roles_rules::rule_id)))
        .filter(roles_rules::role_id.eq(role_id))
        .order(roles_rules::id.asc())
        .select((
            rules::id,
            rules::name,
            rules::rule_body,
            rules::resource_type,
            rules::created_at,
        ))
        .load::<Rule>(conn)
        .map_err(SecurityError::from)
}

/// Gets all roles a rule is linked to, in link-insertion order.
pub fn get_roles_from_rule(
    conn: &mut SqliteConnection,
    rule_id: i32,
) -> Result<Vec<Role>, SecurityError> {
    roles_rules::table
        .inner_join(roles::table.on(roles::id.eq(roles_rules::role_id)))
        .filter(roles_rules::rule_id.eq(rule_id))
        .order(roles_rules::id.asc())
        .select((roles::id, roles::name, roles::resource_type, roles::created_at))
        .load::<Role>(conn)
        .map_err(SecurityError::from)
}

/// Removes a role-rule relationship. Does not remove the role or the rule.
///
/// Rules required by the role (rules {1, 2} on role 1) can never be
/// unlinked; the attempt fails with `CONSTRAINT_ERROR` before any other
/// check.
pub fn remove_rule_from_role(
    conn: &mut SqliteConnection,
    role_id: i32,
    rule_id: i32,
) -> Result<(), SecurityError> {
    if required_rules_for_role(role_id).contains(&rule_id) {
        return Err(SecurityError::ConstraintError);
    }
    if rule_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    conn.transaction(|conn| {
        if !rule_exists(conn, rule_id)? {
            return Err(SecurityError::RuleNotExist);
        }
        if !role_exists(conn, role_id)? {
            return Err(SecurityError::RoleNotExist);
        }
        let link = find_link(conn, role_id, rule_id)?.ok_or(SecurityError::RelationshipError)?;
        diesel::delete(roles_rules::table.filter(roles_rules::id.eq(link.id))).execute(conn)?;
        Ok::<(), SecurityError>(())
    })?;
    cache::invalidate_resource_cache();
    Ok(())
}

/// Removes all rule links of a role in a single transaction.
///
/// Refused with `CONSTRAINT_ERROR` for roles that carry required rules.
pub fn remove_all_rules_from_role(
    conn: &mut SqliteConnection,
    role_id: i32,
) -> Result<(), SecurityError> {
    if !required_rules_for_role(role_id).is_empty() {
        return Err(SecurityError::ConstraintError);
    }
    if role_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    conn.transaction(|conn| {
        if !role_exists(conn, role_id)? {
            return Err(SecurityError::RoleNotExist);
        }
        diesel::delete(roles_rules::table.filter(roles_rules::role_id.eq(role_id)))
            .execute(conn)
            .map_err(SecurityError::from_integrity)?;
        Ok::<(), SecurityError>(())
    })?;
    cache::invalidate_resource_cache();
    Ok(())
}

/// Removes all role links of a rule in a single transaction.
///
/// Required rules cannot be stripped from their roles, so a rule that any
/// role requires is refused with `CONSTRAINT_ERROR`.
pub fn remove_all_roles_from_rule(
    conn: &mut SqliteConnection,
    rule_id: i32,
) -> Result<(), SecurityError> {
    if crate::REQUIRED_RULES_FOR_ROLE
        .iter()
        .any(|(_, required)| required.contains(&rule_id))
    {
        return Err(SecurityError::ConstraintError);
    }
    if rule_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }

    conn.transaction(|conn| {
        if !rule_exists(conn, rule_id)? {
            return Err(SecurityError::RuleNotExist);
        }
        diesel::delete(roles_rules::table.filter(roles_rules::rule_id.eq(rule_id)))
            .execute(conn)
            .map_err(SecurityError::from_integrity)?;
        Ok::<(), SecurityError>(())
    })?;
    cache::invalidate_resource_cache();
    Ok(())
}

/// Moves a rule from one role to another, atomically.
pub fn replace_role_in_rule(
    conn: &mut SqliteConnection,
    rule_id: i32,
    current_role_id: i32,
    new_role_id: i32,
) -> Result<(), SecurityError> {
    if required_rules_for_role(current_role_id).contains(&rule_id) {
        return Err(SecurityError::ConstraintError);
    }
    if current_role_id <= MAX_ID_RESERVED {
        return Err(SecurityError::AdminResources);
    }
    if !exists_role_rule(conn, current_role_id, rule_id).unwrap_or(false) {
        return Err(SecurityError::RelationshipError);
    }
    if !role_exists(conn, new_role_id)? {
        return Err(SecurityError::RelationshipError);
    }

    conn.transaction(|conn| {
        let link = find_link(conn, current_role_id, rule_id)?
            .ok_or(SecurityError::RelationshipError)?;
        diesel::delete(roles_rules::table.filter(roles_rules::id.eq(link.id))).execute(conn)?;
        add_rule_to_role_inner(conn, new_role_id, rule_id, None, false)
            .map_err(|_| SecurityError::RelationshipError)?;
        Ok::<(), SecurityError>(())
    })?;
    cache::invalidate_resource_cache();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceType;
    use crate::orm::role::{add_role, add_role_with};
    use crate::orm::rule::{add_rule, add_rule_with};
    use crate::orm::testing::setup_test_db;
    use serde_json::json;

    fn seed_required(conn: &mut SqliteConnection) {
        add_role_with(conn, "administrator", Some(1), None, ResourceType::Default, false).unwrap();
        for (rule_id, name) in [(1, "internal_console"), (2, "management_console")] {
            add_rule_with(
                conn,
                name,
                &json!({"MATCH": {"definition": name}}),
                Some(rule_id),
                None,
                ResourceType::Default,
                false,
            )
            .unwrap();
            add_rule_to_role(conn, 1, rule_id, None, true).unwrap();
        }
    }

    #[test]
    fn test_add_and_list_rules() {
        let mut conn = setup_test_db();

        let role = add_role(&mut conn, "operators").unwrap();
        let r1 = add_rule(&mut conn, "first", &json!({"a": 1})).unwrap();
        let r2 = add_rule(&mut conn, "second", &json!({"b": 2})).unwrap();

        add_rule_to_role(&mut conn, role.id, r1.id, None, false).unwrap();
        add_rule_to_role(&mut conn, role.id, r2.id, None, false).unwrap();

        let linked: Vec<i32> = get_rules_from_role(&mut conn, role.id)
            .unwrap()
            .into_iter()
            .map(|rule| rule.id)
            .collect();
        assert_eq!(linked, vec![r1.id, r2.id]);
        assert!(exists_role_rule(&mut conn, role.id, r1.id).unwrap());

        assert_eq!(
            add_rule_to_role(&mut conn, role.id, r1.id, None, false).unwrap_err(),
            SecurityError::AlreadyExist
        );
    }

    #[test]
    fn test_reserved_rule_needs_force_admin() {
        let mut conn = setup_test_db();
        seed_required(&mut conn);
        let role = add_role(&mut conn, "operators").unwrap();

        assert_eq!(
            add_rule_to_role(&mut conn, role.id, 1, None, false).unwrap_err(),
            SecurityError::AdminResources
        );
        add_rule_to_role(&mut conn, role.id, 1, None, true).unwrap();
    }

    #[test]
    fn test_required_rules_cannot_be_removed() {
        let mut conn = setup_test_db();
        seed_required(&mut conn);

        assert_eq!(
            remove_rule_from_role(&mut conn, 1, 1).unwrap_err(),
            SecurityError::ConstraintError
        );
        assert_eq!(
            remove_rule_from_role(&mut conn, 1, 2).unwrap_err(),
            SecurityError::ConstraintError
        );
        assert_eq!(
            remove_all_rules_from_role(&mut conn, 1).unwrap_err(),
            SecurityError::ConstraintError
        );
        assert_eq!(
            remove_all_roles_from_rule(&mut conn, 1).unwrap_err(),
            SecurityError::ConstraintError
        );

        let still_linked: Vec<i32> = get_rules_from_role(&mut conn, 1)
            .unwrap()
            .into_iter()
            .map(|rule| rule.id)
            .collect();
        assert_eq!(still_linked, vec![1, 2]);
    }

    #[test]
    fn test_remove_rule_from_role() {
        let mut conn = setup_test_db();

        let role = add_role(&mut conn, "operators").unwrap();
        let rule = add_rule(&mut conn, "first", &json!({"a": 1})).unwrap();
        add_rule_to_role(&mut conn, role.id, rule.id, None, false).unwrap();

        remove_rule_from_role(&mut conn, role.id, rule.id).unwrap();
        assert!(!exists_role_rule(&mut conn, role.id, rule.id).unwrap());
        assert_eq!(
            remove_rule_from_role(&mut conn, role.id, rule.id).unwrap_err(),
            SecurityError::RelationshipError
        );
    }

    #[test]
    fn test_remove_all_rules_from_unprivileged_role() {
        let mut conn = setup_test_db();

        let role = add_role(&mut conn, "operators").unwrap();
        let r1 = add_rule(&mut conn, "first", &json!({"a": 1})).unwrap();
        let r2 = add_rule(&mut conn, "second", &json!({"b": 2})).unwrap();
        for rule_id in [r1.id, r2.id] {
            add_rule_to_role(&mut conn, role.id, rule_id, None, false).unwrap();
        }

        remove_all_rules_from_role(&mut conn, role.id).unwrap();
        assert!(get_rules_from_role(&mut conn, role.id).unwrap().is_empty());
        // The rules themselves survive
        assert!(crate::orm::rule::get_rule_by_id(&mut conn, r1.id).is_ok());
    }

    #[test]
    fn test_replace_role_in_rule() {
        let mut conn = setup_test_db();

        let role_a = add_role(&mut conn, "operators").unwrap();
        let role_b = add_role(&mut conn, "analysts").unwrap();
        let rule = add_rule(&mut conn, "first", &json!({"a": 1})).unwrap();
        add_rule_to_role(&mut conn, role_a.id, rule.id, None, false).unwrap();

        replace_role_in_rule(&mut conn, rule.id, role_a.id, role_b.id).unwrap();
        assert!(!exists_role_rule(&mut conn, role_a.id, rule.id).unwrap());
        assert!(exists_role_rule(&mut conn, role_b.id, rule.id).unwrap());
    }
}
