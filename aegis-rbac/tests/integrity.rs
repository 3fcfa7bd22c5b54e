//! End-to-end scenarios for the startup integrity check and the
//! schema/data migration.

use aegis_rbac::models::ResourceType;
use aegis_rbac::orm::integrity::{NoOwnership, check_database_integrity};
use aegis_rbac::orm::{db, policy, role, role_policy, role_rule, rule, user, user_role};
use serde_json::json;
use tempfile::TempDir;

const OLD_VERSION: i32 = 1;
const NEW_VERSION: i32 = 2;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn users_all_body() -> serde_json::Value {
    json!({
        "actions": ["users:read", "users:write"],
        "resources": ["user:id:*"],
        "effect": "allow"
    })
}

#[test]
fn fresh_install_creates_seeded_database() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let db_file = dir.path().join("rbac.db");

    check_database_integrity(&db_file, NEW_VERSION, &NoOwnership).unwrap();

    assert!(db_file.exists());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&db_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }
    assert!(!dir.path().join("rbac.db.tmp").exists());

    let mut conn = db::connect(&db_file).unwrap();
    assert_eq!(db::database_version(&mut conn).unwrap(), NEW_VERSION);

    // All defaults present
    let admin_role = role::get_role_by_id(&mut conn, 1).unwrap();
    assert_eq!(admin_role.name, "administrator");
    let linked: Vec<i32> = role_rule::get_rules_from_role(&mut conn, 1)
        .unwrap()
        .into_iter()
        .map(|rule| rule.id)
        .collect();
    assert_eq!(linked, vec![1, 2]);

    let admin = user::get_user_by_name(&mut conn, "admin").unwrap();
    assert!(admin.allow_run_as);
    assert!(!user::list_users(&mut conn).unwrap().is_empty());
    assert!(!policy::list_policies(&mut conn).unwrap().is_empty());
}

#[test]
fn integrity_check_is_idempotent_once_current() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let db_file = dir.path().join("rbac.db");

    check_database_integrity(&db_file, NEW_VERSION, &NoOwnership).unwrap();

    // Write a marker, re-run, marker must survive the short-circuit
    let mut conn = db::connect(&db_file).unwrap();
    let marker = user::add_user(&mut conn, "marker", "pw").unwrap();
    drop(conn);

    check_database_integrity(&db_file, NEW_VERSION, &NoOwnership).unwrap();

    let mut conn = db::connect(&db_file).unwrap();
    assert!(user::get_user_by_id(&mut conn, marker.id).is_ok());
    assert_eq!(db::database_version(&mut conn).unwrap(), NEW_VERSION);
}

#[test]
fn upgrade_preserves_user_data() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let db_file = dir.path().join("rbac.db");

    // Source database at the old version
    check_database_integrity(&db_file, OLD_VERSION, &NoOwnership).unwrap();
    let mut conn = db::connect(&db_file).unwrap();

    let legacy_user = user::add_user_with(
        &mut conn,
        "legacy",
        "hunter2",
        Some(150),
        false,
        None,
        ResourceType::User,
        false,
    )
    .unwrap();
    user::set_allow_run_as(&mut conn, 150, true).unwrap();
    role::add_role_with(&mut conn, "custom", Some(200), None, ResourceType::User, false).unwrap();

    // Four policies linked at levels 0..=3, the interesting one last
    for (policy_id, name) in [(210, "pa"), (211, "pb"), (212, "pc"), (250, "pd")] {
        let body = json!({
            "actions": ["nodes:read"],
            "resources": [format!("node:id:{name}")],
            "effect": "allow"
        });
        policy::add_policy_with(
            &mut conn,
            name,
            &body,
            Some(policy_id),
            None,
            ResourceType::User,
            false,
        )
        .unwrap();
        role_policy::add_policy_to_role(&mut conn, 200, policy_id, None, None, false).unwrap();
    }
    user_role::add_role_to_user(&mut conn, 150, 200, None, None, false).unwrap();
    rule::add_rule_with(
        &mut conn,
        "custom_rule",
        &json!({"MATCH": {"definition": "custom"}}),
        Some(300),
        None,
        ResourceType::User,
        false,
    )
    .unwrap();
    role_rule::add_rule_to_role(&mut conn, 200, 300, None, false).unwrap();
    drop(conn);

    check_database_integrity(&db_file, NEW_VERSION, &NoOwnership).unwrap();

    let mut conn = db::connect(&db_file).unwrap();
    assert_eq!(db::database_version(&mut conn).unwrap(), NEW_VERSION);
    assert!(!dir.path().join("rbac.db.tmp").exists());

    // The user survived with id, hash and run-as flag intact
    let migrated = user::get_user_by_id(&mut conn, 150).unwrap();
    assert_eq!(migrated.username, "legacy");
    assert_eq!(migrated.password_hash, legacy_user.password_hash);
    assert!(migrated.allow_run_as);
    assert_eq!(migrated.resource_type, "user");

    // The role-policy link kept its level
    let links = role_policy::get_role_policy_links(&mut conn, 200).unwrap();
    let link = links.iter().find(|link| link.policy_id == 250).unwrap();
    assert_eq!(link.level, 3);
    let levels: Vec<i32> = links.iter().map(|link| link.level).collect();
    assert_eq!(levels, vec![0, 1, 2, 3]);

    // Other relationships and the built-ins are intact
    assert!(user_role::exists_user_role(&mut conn, 150, 200).unwrap());
    assert!(role_rule::exists_role_rule(&mut conn, 200, 300).unwrap());
    let builtin_rules: Vec<i32> = role_rule::get_rules_from_role(&mut conn, 1)
        .unwrap()
        .into_iter()
        .map(|rule| rule.id)
        .collect();
    assert_eq!(builtin_rules, vec![1, 2]);
}

#[test]
fn upgrade_retargets_policy_with_colliding_body() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let db_file = dir.path().join("rbac.db");

    check_database_integrity(&db_file, OLD_VERSION, &NoOwnership).unwrap();
    let mut conn = db::connect(&db_file).unwrap();

    // In the old database the shipped body of users_all moved away, and a
    // user policy (id 300) carries the body the new defaults will ship.
    let users_all = policy::get_policy_by_name(&mut conn, "users_all").unwrap();
    policy::update_policy(
        &mut conn,
        users_all.id,
        None,
        Some(&json!({
            "actions": ["users:read"],
            "resources": ["user:id:legacy"],
            "effect": "allow"
        })),
        None,
        false,
    )
    .unwrap();
    policy::add_policy_with(
        &mut conn,
        "shadow",
        &users_all_body(),
        Some(300),
        None,
        ResourceType::User,
        false,
    )
    .unwrap();

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
    role::add_role_with(&mut conn, "custom", Some(400), None, ResourceType::User, false).unwrap();
    role_policy::add_policy_to_role(&mut conn, 400, other.id, None, None, false).unwrap();
    role_policy::add_policy_to_role(&mut conn, 400, 300, None, None, false).unwrap();
    drop(conn);

    check_database_integrity(&db_file, NEW_VERSION, &NoOwnership).unwrap();

    let mut conn = db::connect(&db_file).unwrap();
    // The colliding policy is gone; the shipped default owns the body
    assert!(policy::get_policy_by_id(&mut conn, 300).is_err());
    let surviving = policy::get_policy_by_body(&mut conn, &users_all_body()).unwrap();
    assert_eq!(surviving.name, "users_all");

    // The link that pointed at 300 now points at the surviving policy,
    // with its level preserved
    let links = role_policy::get_role_policy_links(&mut conn, 400).unwrap();
    let retargeted = links
        .iter()
        .find(|link| link.policy_id == surviving.id)
        .unwrap();
    assert_eq!(retargeted.level, 1);
    assert!(links.iter().any(|link| link.policy_id == other.id && link.level == 0));
}

#[test]
fn upgrade_skips_links_whose_endpoint_name_vanished() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let db_file = dir.path().join("rbac.db");

    check_database_integrity(&db_file, OLD_VERSION, &NoOwnership).unwrap();
    let mut conn = db::connect(&db_file).unwrap();

    // Rename a built-in role in the old database; the new defaults know
    // nothing about the old name, so the link cannot be rematched.
    role::update_role(&mut conn, 2, Some("forgotten"), None, false).unwrap();
    user::add_user_with(
        &mut conn,
        "legacy",
        "pw",
        Some(150),
        false,
        None,
        ResourceType::User,
        false,
    )
    .unwrap();
    user_role::add_role_to_user(&mut conn, 150, 2, None, None, false).unwrap();
    drop(conn);

    check_database_integrity(&db_file, NEW_VERSION, &NoOwnership).unwrap();

    let mut conn = db::connect(&db_file).unwrap();
    let migrated = user::get_user_by_id(&mut conn, 150).unwrap();
    assert_eq!(migrated.username, "legacy");
    assert!(user_role::get_user_role_links(&mut conn, 150).unwrap().is_empty());
}

#[test]
fn unreadable_database_aborts_and_preserves_file() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let db_file = dir.path().join("rbac.db");
    std::fs::write(&db_file, b"this is not a sqlite database, honest").unwrap();

    let result = check_database_integrity(&db_file, NEW_VERSION, &NoOwnership);
    assert!(result.is_err());

    let contents = std::fs::read(&db_file).unwrap();
    assert_eq!(contents, b"this is not a sqlite database, honest");
    assert!(!dir.path().join("rbac.db.tmp").exists());
}
