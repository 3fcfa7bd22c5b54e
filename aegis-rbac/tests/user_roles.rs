//! Workflow tests against a database seeded with the shipped defaults,
//! covering ordered role assignment and token invalidation end to end.

use std::collections::BTreeSet;

use aegis_rbac::SecurityConfig;
use aegis_rbac::error::SecurityError;
use aegis_rbac::orm::testing::setup_seeded_db;
use aegis_rbac::orm::{role, token, user, user_role};

#[test]
fn reorder_roles_with_explicit_position() {
    let mut conn = setup_seeded_db();

    let user = user::add_user(&mut conn, "karl", "pw").unwrap();
    assert_eq!(user.id, 100);

    let first = role::add_role(&mut conn, "first").unwrap();
    let second = role::add_role(&mut conn, "second").unwrap();
    let third = role::add_role(&mut conn, "third").unwrap();

    user_role::add_role_to_user(&mut conn, user.id, first.id, None, None, false).unwrap();
    user_role::add_role_to_user(&mut conn, user.id, second.id, None, None, false).unwrap();
    user_role::add_role_to_user(&mut conn, user.id, third.id, Some(0), None, false).unwrap();

    let ordered: Vec<String> = user_role::get_roles_from_user(&mut conn, user.id)
        .unwrap()
        .into_iter()
        .map(|role| role.name)
        .collect();
    assert_eq!(ordered, vec!["third", "first", "second"]);

    let levels: Vec<i32> = user_role::get_user_role_links(&mut conn, user.id)
        .unwrap()
        .into_iter()
        .map(|link| link.level)
        .collect();
    assert_eq!(levels, vec![0, 1, 2]);
}

#[test]
fn seeded_admin_cannot_be_touched_without_force() {
    let mut conn = setup_seeded_db();

    let admin = user::get_user_by_name(&mut conn, "admin").unwrap();
    assert_eq!(
        user::delete_user_by_id(&mut conn, admin.id).unwrap_err(),
        SecurityError::AdminResources
    );
    assert_eq!(
        user_role::remove_role_from_user(&mut conn, admin.id, 1).unwrap_err(),
        SecurityError::AdminResources
    );
    assert!(user_role::exists_user_role(&mut conn, admin.id, 1).unwrap());
}

#[test]
fn login_and_token_invalidation_flow() {
    let mut conn = setup_seeded_db();
    let config = SecurityConfig::default();

    assert!(user::check_credentials(&mut conn, "admin", "admin").unwrap());
    let admin = user::get_user_by_name(&mut conn, "admin").unwrap();

    let issued_at = 50_000;
    assert!(token::is_token_valid(&mut conn, issued_at, Some(admin.id), Some(1), true).unwrap());

    // Password change invalidates the admin's outstanding tokens
    token::add_token_rules(
        &mut conn,
        &BTreeSet::from([admin.id]),
        &BTreeSet::new(),
        false,
        issued_at + 10,
        config.auth_token_exp_timeout,
    )
    .unwrap();

    assert!(!token::is_token_valid(&mut conn, issued_at, Some(admin.id), Some(1), true).unwrap());
    assert!(
        token::is_token_valid(&mut conn, issued_at + 11, Some(admin.id), Some(1), true).unwrap()
    );

    // Once the rule itself expires it is reaped and tokens recover
    let after_expiry = issued_at + 10 + config.auth_token_exp_timeout + 1;
    let (reaped_users, reaped_roles) = token::delete_expired_rules(&mut conn, after_expiry).unwrap();
    assert_eq!(reaped_users, vec![admin.id]);
    assert!(reaped_roles.is_empty());
    assert!(token::is_token_valid(&mut conn, issued_at, Some(admin.id), Some(1), true).unwrap());
}
