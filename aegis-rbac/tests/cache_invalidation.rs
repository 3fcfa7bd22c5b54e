//! The external decision cache must be flushed exactly once per
//! successful mutation, and left alone by reads, no-ops and failures.
//!
//! Single test function: the invalidator hook is process-global.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use aegis_rbac::cache;
use aegis_rbac::error::SecurityError;
use aegis_rbac::orm::testing::setup_test_db;
use aegis_rbac::orm::{token, user, user_role};
use serde_json::json;

static INVALIDATIONS: AtomicUsize = AtomicUsize::new(0);

fn count() -> usize {
    INVALIDATIONS.load(Ordering::SeqCst)
}

#[test]
fn mutations_invalidate_the_decision_cache_exactly_once() {
    cache::set_resource_cache_invalidator(|| {
        INVALIDATIONS.fetch_add(1, Ordering::SeqCst);
    });
    let mut conn = setup_test_db();

    // Successful add: one flush
    let before = count();
    let user = user::add_user(&mut conn, "karl", "pw").unwrap();
    assert_eq!(count() - before, 1);

    // Failed add: no flush
    let before = count();
    assert_eq!(
        user::add_user(&mut conn, "karl", "pw").unwrap_err(),
        SecurityError::AlreadyExist
    );
    assert_eq!(count() - before, 0);

    // Read: no flush
    let before = count();
    user::get_user_by_id(&mut conn, user.id).unwrap();
    assert_eq!(count() - before, 0);

    // No-op update: no flush
    let before = count();
    assert!(!user::update_user(&mut conn, user.id, None, None, true).unwrap());
    assert_eq!(count() - before, 0);

    // Effective update: one flush
    let before = count();
    assert!(user::update_user(&mut conn, user.id, Some("newpw"), None, true).unwrap());
    assert_eq!(count() - before, 1);

    // Relationship add: one flush
    let role = aegis_rbac::orm::role::add_role(&mut conn, "ops").unwrap();
    let before = count();
    user_role::add_role_to_user(&mut conn, user.id, role.id, None, None, false).unwrap();
    assert_eq!(count() - before, 1);

    // Rule manager rejects a bad body before touching anything: no flush
    let before = count();
    assert_eq!(
        aegis_rbac::orm::rule::add_rule(&mut conn, "bad", &json!("nope")).unwrap_err(),
        SecurityError::Invalid
    );
    assert_eq!(count() - before, 0);

    // Token rules: one flush per call
    let before = count();
    token::add_token_rules(
        &mut conn,
        &BTreeSet::from([user.id]),
        &BTreeSet::new(),
        false,
        1000,
        900,
    )
    .unwrap();
    assert_eq!(count() - before, 1);

    // Reaping nothing: no flush
    let before = count();
    token::delete_expired_rules(&mut conn, 1000).unwrap();
    assert_eq!(count() - before, 0);

    // Delete: one flush
    let before = count();
    assert!(user::delete_user_by_id(&mut conn, user.id).unwrap());
    assert_eq!(count() - before, 1);

    cache::clear_resource_cache_invalidator();
}
