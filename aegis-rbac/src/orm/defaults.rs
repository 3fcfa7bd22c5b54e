//! Default-resources loader.
//!
//! Seeds the built-in users, roles, rules and policies from the YAML
//! bundles shipped with the service, plus the relationships between them.
//! Seeding is idempotent: resources that already exist by name are
//! preserved, except for default policies whose configured body changed,
//! which are refreshed in place (reserved id) or re-created (user-range
//! id) with their role links and positions restored.

use diesel::prelude::*;
use serde_json::Value as Json;
use serde_yaml::{Mapping, Value as Yaml};
use tracing::{debug, warn};

use crate::MAX_ID_RESERVED;
use crate::error::SecurityError;
use crate::models::ResourceType;
use crate::orm::{policy, role, role_policy, role_rule, rule, user, user_role};

const DEFAULT_USERS: &str = include_str!("../../default/users.yaml");
const DEFAULT_ROLES: &str = include_str!("../../default/roles.yaml");
const DEFAULT_RULES: &str = include_str!("../../default/rules.yaml");
const DEFAULT_POLICIES: &str = include_str!("../../default/policies.yaml");
const DEFAULT_RELATIONSHIPS: &str = include_str!("../../default/relationships.yaml");

/// Parses a bundle and returns the mapping under its single top-level key.
fn parse_bundle(raw: &str) -> Result<Mapping, SecurityError> {
    let doc: Yaml = serde_yaml::from_str(raw).map_err(|err| {
        warn!("malformed default resource bundle: {err}");
        SecurityError::Invalid
    })?;
    doc.as_mapping()
        .and_then(|mapping| mapping.values().next())
        .and_then(|section| section.as_mapping())
        .cloned()
        .ok_or(SecurityError::Invalid)
}

fn yaml_to_json(value: &Yaml) -> Result<Json, SecurityError> {
    serde_json::to_value(value).map_err(|err| {
        warn!("default resource body is not valid JSON: {err}");
        SecurityError::Invalid
    })
}

fn seed_users(conn: &mut SqliteConnection, bundle: &Mapping) -> Result<(), SecurityError> {
    for (name, payload) in bundle {
        let (Some(username), Some(payload)) = (name.as_str(), payload.as_mapping()) else {
            continue;
        };
        let password = payload
            .get("password")
            .and_then(Yaml::as_str)
            .unwrap_or_default();
        let run_as = payload
            .get("allow_run_as")
            .and_then(Yaml::as_bool)
            .unwrap_or(false);

        match user::add_user_with(
            conn,
            username,
            password,
            None,
            false,
            None,
            ResourceType::Default,
            false,
        ) {
            Ok(_) => debug!("created default user {username}"),
            Err(SecurityError::AlreadyExist) => {}
            Err(err) => return Err(err),
        }
        let user = user::get_user_by_name(conn, username)?;
        user::set_allow_run_as(conn, user.id, run_as)?;
    }
    Ok(())
}

fn seed_roles(conn: &mut SqliteConnection, bundle: &Mapping) -> Result<(), SecurityError> {
    for (name, _payload) in bundle {
        let Some(role_name) = name.as_str() else {
            continue;
        };
        match role::add_role_with(conn, role_name, None, None, ResourceType::Default, false) {
            Ok(_) => debug!("created default role {role_name}"),
            Err(SecurityError::AlreadyExist) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn seed_rules(conn: &mut SqliteConnection, bundle: &Mapping) -> Result<(), SecurityError> {
    for (name, payload) in bundle {
        let (Some(rule_name), Some(payload)) = (name.as_str(), payload.as_mapping()) else {
            continue;
        };
        let Some(body) = payload.get("rule") else {
            continue;
        };
        let body = yaml_to_json(body)?;
        match rule::add_rule_with(conn, rule_name, &body, None, None, ResourceType::Default, false)
        {
            Ok(_) => debug!("created default rule {rule_name}"),
            Err(SecurityError::AlreadyExist) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Re-applies a changed default policy body to an existing policy.
///
/// Reserved policies are updated in place. A policy that drifted into the
/// user range is deleted and re-created; each linked role's position is
/// recorded beforehand and restored afterwards.
fn refresh_existing_policy(
    conn: &mut SqliteConnection,
    policy_name: &str,
    body: &Json,
) -> Result<(), SecurityError> {
    let existing = match policy::get_policy_by_name(conn, policy_name) {
        Ok(existing) => existing,
        Err(_) => {
            // The conflict came from the body, not the name; leave the
            // colliding policy alone.
            debug!("default policy {policy_name} collides by body; skipped");
            return Ok(());
        }
    };

    if existing.id <= MAX_ID_RESERVED {
        if let Err(err) = policy::update_policy(
            conn,
            existing.id,
            Some(policy_name),
            Some(body),
            Some(ResourceType::Default),
            false,
        ) {
            warn!("could not refresh default policy {policy_name}: {err}");
        }
        return Ok(());
    }

    let linked_roles: Vec<i32> = role_policy::get_roles_from_policy(conn, existing.id)?
        .into_iter()
        .map(|role| role.id)
        .collect();
    let mut positions = Vec::new();
    for role_id in linked_roles {
        let index = role_policy::get_policies_from_role(conn, role_id)?
            .iter()
            .position(|policy| policy.id == existing.id);
        if let Some(index) = index {
            positions.push((role_id, index as i32));
        }
    }

    policy::delete_policy_by_id(conn, existing.id)?;
    let replacement = policy::add_policy_with(
        conn,
        policy_name,
        body,
        None,
        None,
        ResourceType::Default,
        false,
    )?;
    for (role_id, position) in positions {
        if let Err(err) = role_policy::add_policy_to_role(
            conn,
            role_id,
            replacement.id,
            Some(position),
            None,
            true,
        ) {
            warn!("could not relink default policy {policy_name} to role {role_id}: {err}");
        }
    }
    Ok(())
}

fn seed_policies(conn: &mut SqliteConnection, bundle: &Mapping) -> Result<(), SecurityError> {
    for (group, payload) in bundle {
        let (Some(group), Some(payload)) = (group.as_str(), payload.as_mapping()) else {
            continue;
        };
        let Some(sub_policies) = payload.get("policies").and_then(Yaml::as_mapping) else {
            continue;
        };
        for (sub_name, body) in sub_policies {
            let Some(sub_name) = sub_name.as_str() else {
                continue;
            };
            let policy_name = format!("{group}_{sub_name}");
            let body = yaml_to_json(body)?;
            match policy::add_policy_with(
                conn,
                &policy_name,
                &body,
                None,
                None,
                ResourceType::Default,
                false,
            ) {
                Ok(_) => debug!("created default policy {policy_name}"),
                Err(SecurityError::AlreadyExist) => {
                    refresh_existing_policy(conn, &policy_name, &body)?
                }
                Err(err) => return Err(err),
            }
        }
    }
    Ok(())
}

fn seed_relationships(
    conn: &mut SqliteConnection,
    bundle: &Mapping,
    policies_bundle: &Mapping,
) -> Result<(), SecurityError> {
    // User-role relationships
    if let Some(users) = bundle.get("users").and_then(Yaml::as_mapping) {
        for (username, payload) in users {
            let (Some(username), Some(payload)) = (username.as_str(), payload.as_mapping()) else {
                continue;
            };
            let Ok(user) = user::get_user_by_name(conn, username) else {
                warn!("default relationship references unknown user {username}");
                continue;
            };
            for role_name in list_of_names(payload.get("role_ids")) {
                let Ok(role) = role::get_role_by_name(conn, &role_name) else {
                    warn!("default relationship references unknown role {role_name}");
                    continue;
                };
                match user_role::add_role_to_user(conn, user.id, role.id, None, None, true) {
                    Ok(()) | Err(SecurityError::AlreadyExist) => {}
                    Err(err) => warn!("could not link user {username} to {role_name}: {err}"),
                }
            }
        }
    }

    // Role-policy and role-rule relationships
    if let Some(roles) = bundle.get("roles").and_then(Yaml::as_mapping) {
        for (role_name, payload) in roles {
            let (Some(role_name), Some(payload)) = (role_name.as_str(), payload.as_mapping())
            else {
                continue;
            };
            let Ok(role) = role::get_role_by_name(conn, role_name) else {
                warn!("default relationship references unknown role {role_name}");
                continue;
            };

            for group in list_of_names(payload.get("policy_ids")) {
                // A group name links every sub-policy of that group
                let sub_names: Vec<String> = policies_bundle
                    .get(group.as_str())
                    .and_then(Yaml::as_mapping)
                    .and_then(|payload| payload.get("policies"))
                    .and_then(Yaml::as_mapping)
                    .map(|subs| {
                        subs.keys()
                            .filter_map(Yaml::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                for sub_name in sub_names {
                    let policy_name = format!("{group}_{sub_name}");
                    let Ok(policy) = policy::get_policy_by_name(conn, &policy_name) else {
                        warn!("default relationship references unknown policy {policy_name}");
                        continue;
                    };
                    match role_policy::add_policy_to_role(conn, role.id, policy.id, None, None, true)
                    {
                        Ok(()) | Err(SecurityError::AlreadyExist) => {}
                        Err(err) => {
                            warn!("could not link role {role_name} to {policy_name}: {err}")
                        }
                    }
                }
            }

            for rule_name in list_of_names(payload.get("rule_ids")) {
                let Ok(rule) = rule::get_rule_by_name(conn, &rule_name) else {
                    warn!("default relationship references unknown rule {rule_name}");
                    continue;
                };
                match role_rule::add_rule_to_role(conn, role.id, rule.id, None, true) {
                    Ok(()) | Err(SecurityError::AlreadyExist) => {}
                    Err(err) => warn!("could not link role {role_name} to {rule_name}: {err}"),
                }
            }
        }
    }
    Ok(())
}

fn list_of_names(value: Option<&Yaml>) -> Vec<String> {
    value
        .and_then(Yaml::as_sequence)
        .map(|sequence| {
            sequence
                .iter()
                .filter_map(Yaml::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Seeds the shipped default resources into the database.
///
/// Called on a freshly created database and on the temporary database
/// built during an upgrade; safe to run against a database that already
/// carries the defaults.
pub fn insert_default_resources(conn: &mut SqliteConnection) -> Result<(), SecurityError> {
    let users = parse_bundle(DEFAULT_USERS)?;
    let roles = parse_bundle(DEFAULT_ROLES)?;
    let rules = parse_bundle(DEFAULT_RULES)?;
    let policies = parse_bundle(DEFAULT_POLICIES)?;
    let relationships = parse_bundle(DEFAULT_RELATIONSHIPS)?;

    seed_users(conn, &users)?;
    seed_roles(conn, &roles)?;
    seed_rules(conn, &rules)?;
    seed_policies(conn, &policies)?;
    seed_relationships(conn, &relationships, &policies)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orm::testing::setup_test_db;
    use serde_json::json;

    #[test]
    fn test_seed_creates_builtins() {
        let mut conn = setup_test_db();
        insert_default_resources(&mut conn).unwrap();

        let admin_role = role::get_role_by_id(&mut conn, 1).unwrap();
        assert_eq!(admin_role.name, "administrator");
        assert_eq!(admin_role.resource_type, "default");

        let linked: Vec<i32> = role_rule::get_rules_from_role(&mut conn, 1)
            .unwrap()
            .into_iter()
            .map(|rule| rule.id)
            .collect();
        assert_eq!(linked, vec![1, 2]);

        let admin = user::get_user_by_name(&mut conn, "admin").unwrap();
        assert!(admin.allow_run_as);
        assert!(user::check_credentials(&mut conn, "admin", "admin").unwrap());
        assert!(!user::check_credentials(&mut conn, "admin", "nope").unwrap());

        let auditor = user::get_user_by_name(&mut conn, "auditor").unwrap();
        assert!(!auditor.allow_run_as);

        // Every default policy sits below the cloud-reserved window
        for policy in policy::list_policies(&mut conn).unwrap() {
            assert!(policy.id < crate::CLOUD_RESERVED_RANGE);
        }
        assert!(policy::get_policy_by_name(&mut conn, "users_all").is_ok());
        assert!(policy::get_policy_by_name(&mut conn, "security_read_write").is_ok());
        assert!(policy::get_policy_by_name(&mut conn, "readonly_view").is_ok());
    }

    #[test]
    fn test_seed_is_idempotent() {
        let mut conn = setup_test_db();
        insert_default_resources(&mut conn).unwrap();

        let users_before = user::list_users(&mut conn).unwrap().len();
        let roles_before = role::list_roles(&mut conn).unwrap().len();
        let policies_before = policy::list_policies(&mut conn).unwrap().len();
        let rules_before = rule::list_rules(&mut conn).unwrap().len();

        insert_default_resources(&mut conn).unwrap();

        assert_eq!(user::list_users(&mut conn).unwrap().len(), users_before);
        assert_eq!(role::list_roles(&mut conn).unwrap().len(), roles_before);
        assert_eq!(policy::list_policies(&mut conn).unwrap().len(), policies_before);
        assert_eq!(rule::list_rules(&mut conn).unwrap().len(), rules_before);

        let linked: Vec<i32> = role_rule::get_rules_from_role(&mut conn, 1)
            .unwrap()
            .into_iter()
            .map(|rule| rule.id)
            .collect();
        assert_eq!(linked, vec![1, 2]);
    }

    #[test]
    fn test_changed_policy_in_user_range_is_recreated_with_positions() {
        let mut conn = setup_test_db();

        // A user created a policy squatting on a default name, with a
        // different body, and linked it behind another policy.
        let role = role::add_role(&mut conn, "ops").unwrap();
        let other = policy::add_policy(
            &mut conn,
            "other",
            &json!({
                "actions": ["nodes:read"],
                "resources": ["node:id:*"],
                "effect": "allow"
            }),
        )
        .unwrap();
        let squatter = policy::add_policy(
            &mut conn,
            "users_all",
            &json!({
                "actions": ["users:read"],
                "resources": ["user:id:legacy"],
                "effect": "deny"
            }),
        )
        .unwrap();
        role_policy::add_policy_to_role(&mut conn, role.id, other.id, None, None, false).unwrap();
        role_policy::add_policy_to_role(&mut conn, role.id, squatter.id, None, None, false)
            .unwrap();

        insert_default_resources(&mut conn).unwrap();

        // The squatter was replaced by the shipped default
        assert_eq!(
            policy::get_policy_by_id(&mut conn, squatter.id).unwrap_err(),
            SecurityError::PolicyNotExist
        );
        let replacement = policy::get_policy_by_name(&mut conn, "users_all").unwrap();
        assert!(replacement.id < crate::CLOUD_RESERVED_RANGE);

        // The role kept its ordering: "other" first, the default second
        let ordered: Vec<i32> = role_policy::get_policies_from_role(&mut conn, role.id)
            .unwrap()
            .into_iter()
            .map(|policy| policy.id)
            .collect();
        assert_eq!(ordered, vec![other.id, replacement.id]);
    }
}
