//! Token blacklist manager.
//!
//! Three ledgers record token-invalidation rules: one keyed by user, one
//! keyed by role, and a singleton for run-as tokens. A rule rejects every
//! token whose `nbf` is at or before `nbf_invalid_until`, and stays alive
//! until `is_valid_until` so it outlives the tokens it rejects.
//!
//! Timestamps are epoch seconds supplied by the caller; the wall clock is
//! a consumed collaborator, not something this module reads.

use std::collections::{BTreeMap, BTreeSet};

use diesel::prelude::*;

use crate::cache;
use crate::error::SecurityError;
use crate::models::{RoleTokenRule, RunAsTokenRule, UserTokenRule};
use crate::schema::{roles_token_blacklist, runas_token_blacklist, users_token_blacklist};

/// Snapshot of all active invalidation rules, keyed by subject id. Values
/// are `nbf_invalid_until` timestamps.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TokenRules {
    pub users: BTreeMap<i32, i64>,
    pub roles: BTreeMap<i32, i64>,
    pub run_as: Option<i64>,
}

/// Checks whether a token is still acceptable for the given subjects.
///
/// For each applicable ledger the token passes if no rule exists for the
/// subject, or its `nbf` is strictly newer than the rule's cut-off. The
/// run-as ledger only applies when `run_as` is set.
pub fn is_token_valid(
    conn: &mut SqliteConnection,
    token_nbf: i64,
    user_id: Option<i32>,
    role_id: Option<i32>,
    run_as: bool,
) -> Result<bool, SecurityError> {
    let user_rule = match user_id {
        Some(user_id) => users_token_blacklist::table
            .filter(users_token_blacklist::user_id.eq(user_id))
            .first::<UserTokenRule>(conn)
            .optional()?,
        None => None,
    };
    let role_rule = match role_id {
        Some(role_id) => roles_token_blacklist::table
            .filter(roles_token_blacklist::role_id.eq(role_id))
            .first::<RoleTokenRule>(conn)
            .optional()?,
        None => None,
    };
    let runas_rule = if run_as {
        runas_token_blacklist::table
            .first::<RunAsTokenRule>(conn)
            .optional()?
    } else {
        None
    };

    Ok(user_rule.is_none_or(|rule| token_nbf > rule.nbf_invalid_until)
        && role_rule.is_none_or(|rule| token_nbf > rule.nbf_invalid_until)
        && runas_rule.is_none_or(|rule| token_nbf > rule.nbf_invalid_until))
}

/// Records invalidation rules for the given subjects.
///
/// Any previous rule for a subject is replaced; the run-as ledger keeps a
/// single row. Expired rules are reaped first. `now` is the current epoch
/// time and `exp_timeout` the configured token lifetime
/// ([`crate::SecurityConfig::auth_token_exp_timeout`]).
pub fn add_token_rules(
    conn: &mut SqliteConnection,
    users: &BTreeSet<i32>,
    roles: &BTreeSet<i32>,
    run_as: bool,
    now: i64,
    exp_timeout: i64,
) -> Result<(), SecurityError> {
    conn.transaction(|conn| {
        delete_expired_rules_inner(conn, now)?;

        for &user_id in users {
            diesel::delete(
                users_token_blacklist::table.filter(users_token_blacklist::user_id.eq(user_id)),
            )
            .execute(conn)?;
            diesel::insert_into(users_token_blacklist::table)
                .values(UserTokenRule {
                    user_id,
                    nbf_invalid_until: now,
                    is_valid_until: now + exp_timeout,
                })
                .execute(conn)
                .map_err(SecurityError::from_integrity)?;
        }
        for &role_id in roles {
            diesel::delete(
                roles_token_blacklist::table.filter(roles_token_blacklist::role_id.eq(role_id)),
            )
            .execute(conn)?;
            diesel::insert_into(roles_token_blacklist::table)
                .values(RoleTokenRule {
                    role_id,
                    nbf_invalid_until: now,
                    is_valid_until: now + exp_timeout,
                })
                .execute(conn)
                .map_err(SecurityError::from_integrity)?;
        }
        if run_as {
            diesel::delete(runas_token_blacklist::table).execute(conn)?;
            diesel::insert_into(runas_token_blacklist::table)
                .values(RunAsTokenRule {
                    nbf_invalid_until: now,
                    is_valid_until: now + exp_timeout,
                })
                .execute(conn)
                .map_err(SecurityError::from_integrity)?;
        }
        Ok::<(), SecurityError>(())
    })?;

    cache::invalidate_resource_cache();
    Ok(())
}

/// Removes the invalidation rule of the given subjects, if present.
pub fn delete_token_rule(
    conn: &mut SqliteConnection,
    user_id: Option<i32>,
    role_id: Option<i32>,
    run_as: bool,
) -> Result<(), SecurityError> {
    let removed = conn.transaction(|conn| {
        let mut removed = 0;
        if let Some(user_id) = user_id {
            removed += diesel::delete(
                users_token_blacklist::table.filter(users_token_blacklist::user_id.eq(user_id)),
            )
            .execute(conn)?;
        }
        if let Some(role_id) = role_id {
            removed += diesel::delete(
                roles_token_blacklist::table.filter(roles_token_blacklist::role_id.eq(role_id)),
            )
            .execute(conn)?;
        }
        if run_as {
            removed += diesel::delete(runas_token_blacklist::table).execute(conn)?;
        }
        Ok::<usize, SecurityError>(removed)
    })?;

    if removed > 0 {
        cache::invalidate_resource_cache();
    }
    Ok(())
}

fn delete_expired_rules_inner(
    conn: &mut SqliteConnection,
    now: i64,
) -> Result<(Vec<i32>, Vec<i32>), SecurityError> {
    let expired_users: Vec<i32> = users_token_blacklist::table
        .filter(users_token_blacklist::is_valid_until.lt(now))
        .select(users_token_blacklist::user_id)
        .order(users_token_blacklist::user_id.asc())
        .load(conn)?;
    if !expired_users.is_empty() {
        diesel::delete(
            users_token_blacklist::table.filter(users_token_blacklist::is_valid_until.lt(now)),
        )
        .execute(conn)?;
    }

    let expired_roles: Vec<i32> = roles_token_blacklist::table
        .filter(roles_token_blacklist::is_valid_until.lt(now))
        .select(roles_token_blacklist::role_id)
        .order(roles_token_blacklist::role_id.asc())
        .load(conn)?;
    if !expired_roles.is_empty() {
        diesel::delete(
            roles_token_blacklist::table.filter(roles_token_blacklist::is_valid_until.lt(now)),
        )
        .execute(conn)?;
    }

    diesel::delete(
        runas_token_blacklist::table.filter(runas_token_blacklist::is_valid_until.lt(now)),
    )
    .execute(conn)?;

    Ok((expired_users, expired_roles))
}

/// Reaps every rule whose `is_valid_until` has passed. Safe to call
/// repeatedly.
///
/// # Returns
/// The `(user_ids, role_ids)` whose rules were removed.
pub fn delete_expired_rules(
    conn: &mut SqliteConnection,
    now: i64,
) -> Result<(Vec<i32>, Vec<i32>), SecurityError> {
    let removed = conn.transaction(|conn| delete_expired_rules_inner(conn, now))?;
    if !removed.0.is_empty() || !removed.1.is_empty() {
        cache::invalidate_resource_cache();
    }
    Ok(removed)
}

/// Truncates all three ledgers.
///
/// # Returns
/// The `(user_ids, role_ids)` whose rules were removed.
pub fn delete_all_rules(
    conn: &mut SqliteConnection,
) -> Result<(Vec<i32>, Vec<i32>), SecurityError> {
    let removed = conn.transaction(|conn| {
        let users: Vec<i32> = users_token_blacklist::table
            .select(users_token_blacklist::user_id)
            .order(users_token_blacklist::user_id.asc())
            .load(conn)?;
        let roles: Vec<i32> = roles_token_blacklist::table
            .select(roles_token_blacklist::role_id)
            .order(roles_token_blacklist::role_id.asc())
            .load(conn)?;
        diesel::delete(users_token_blacklist::table).execute(conn)?;
        diesel::delete(roles_token_blacklist::table).execute(conn)?;
        diesel::delete(runas_token_blacklist::table).execute(conn)?;
        Ok::<(Vec<i32>, Vec<i32>), SecurityError>((users, roles))
    })?;

    if !removed.0.is_empty() || !removed.1.is_empty() {
        cache::invalidate_resource_cache();
    }
    Ok(removed)
}

/// Returns a snapshot of every active rule across the three ledgers.
pub fn get_all_rules(conn: &mut SqliteConnection) -> Result<TokenRules, SecurityError> {
    let mut snapshot = TokenRules::default();
    for rule in users_token_blacklist::table.load::<UserTokenRule>(conn)? {
        snapshot.users.insert(rule.user_id, rule.nbf_invalid_until);
    }
    for rule in roles_token_blacklist::table.load::<RoleTokenRule>(conn)? {
        snapshot.roles.insert(rule.role_id, rule.nbf_invalid_until);
    }
    snapshot.run_as = runas_token_blacklist::table
        .first::<RunAsTokenRule>(conn)
        .optional()?
        .map(|rule| rule.nbf_invalid_until);
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orm::testing::setup_test_db;

    const TIMEOUT: i64 = 900;

    fn ids(values: &[i32]) -> BTreeSet<i32> {
        values.iter().copied().collect()
    }

    #[test]
    fn test_token_invalidation_for_user() {
        let mut conn = setup_test_db();

        add_token_rules(&mut conn, &ids(&[100]), &BTreeSet::new(), false, 1000, TIMEOUT).unwrap();

        // Issued before the rule: rejected
        assert!(!is_token_valid(&mut conn, 999, Some(100), None, false).unwrap());
        assert!(!is_token_valid(&mut conn, 1000, Some(100), None, false).unwrap());
        // Issued after the rule: accepted
        assert!(is_token_valid(&mut conn, 1001, Some(100), None, false).unwrap());
        // Other subjects are unaffected
        assert!(is_token_valid(&mut conn, 999, Some(200), None, false).unwrap());
        assert!(is_token_valid(&mut conn, 999, None, Some(100), false).unwrap());
    }

    #[test]
    fn test_token_invalidation_for_role_and_run_as() {
        let mut conn = setup_test_db();

        add_token_rules(&mut conn, &BTreeSet::new(), &ids(&[5]), true, 2000, TIMEOUT).unwrap();

        assert!(!is_token_valid(&mut conn, 1999, None, Some(5), false).unwrap());
        assert!(is_token_valid(&mut conn, 2001, None, Some(5), false).unwrap());

        // The run-as ledger only applies to run-as tokens
        assert!(is_token_valid(&mut conn, 1999, Some(7), None, false).unwrap());
        assert!(!is_token_valid(&mut conn, 1999, Some(7), None, true).unwrap());
    }

    #[test]
    fn test_rule_replacement_moves_cutoff_forward() {
        let mut conn = setup_test_db();

        add_token_rules(&mut conn, &ids(&[100]), &BTreeSet::new(), false, 1000, TIMEOUT).unwrap();
        add_token_rules(&mut conn, &ids(&[100]), &BTreeSet::new(), false, 1500, TIMEOUT).unwrap();

        let snapshot = get_all_rules(&mut conn).unwrap();
        assert_eq!(snapshot.users.get(&100), Some(&1500));
        assert!(!is_token_valid(&mut conn, 1200, Some(100), None, false).unwrap());
    }

    #[test]
    fn test_run_as_ledger_is_singleton() {
        let mut conn = setup_test_db();

        add_token_rules(&mut conn, &BTreeSet::new(), &BTreeSet::new(), true, 1000, TIMEOUT)
            .unwrap();
        add_token_rules(&mut conn, &BTreeSet::new(), &BTreeSet::new(), true, 2000, TIMEOUT)
            .unwrap();

        let rows: i64 = runas_token_blacklist::table.count().get_result(&mut conn).unwrap();
        assert_eq!(rows, 1);
        assert_eq!(get_all_rules(&mut conn).unwrap().run_as, Some(2000));
    }

    #[test]
    fn test_delete_expired_rules() {
        let mut conn = setup_test_db();

        add_token_rules(&mut conn, &ids(&[100]), &ids(&[5]), true, 1000, TIMEOUT).unwrap();

        // Nothing expires before the deadline
        let removed = delete_expired_rules(&mut conn, 1000 + TIMEOUT).unwrap();
        assert_eq!(removed, (vec![], vec![]));

        let removed = delete_expired_rules(&mut conn, 1001 + TIMEOUT).unwrap();
        assert_eq!(removed, (vec![100], vec![5]));
        assert_eq!(get_all_rules(&mut conn).unwrap(), TokenRules::default());

        // Idempotent
        let removed = delete_expired_rules(&mut conn, 1001 + TIMEOUT).unwrap();
        assert_eq!(removed, (vec![], vec![]));
    }

    #[test]
    fn test_delete_all_rules_reports_both_ledgers() {
        let mut conn = setup_test_db();

        add_token_rules(&mut conn, &ids(&[100, 101]), &ids(&[5]), true, 1000, TIMEOUT).unwrap();

        let (users, roles) = delete_all_rules(&mut conn).unwrap();
        assert_eq!(users, vec![100, 101]);
        assert_eq!(roles, vec![5]);
        assert_eq!(get_all_rules(&mut conn).unwrap(), TokenRules::default());
    }

    #[test]
    fn test_rules_outlive_tokens() {
        let mut conn = setup_test_db();

        add_token_rules(&mut conn, &ids(&[100]), &BTreeSet::new(), false, 1000, TIMEOUT).unwrap();
        let snapshot = get_all_rules(&mut conn).unwrap();
        let nbf_cutoff = snapshot.users[&100];

        let rule: UserTokenRule = users_token_blacklist::table
            .filter(users_token_blacklist::user_id.eq(100))
            .first(&mut conn)
            .unwrap();
        assert!(rule.is_valid_until >= nbf_cutoff + TIMEOUT);
    }
}
