//! Role-based topic permissions.
//!
//! Configuration defines named roles holding wildcard patterns for the topics
//! a holder may publish or subscribe to. Topic sets advertised by untrusted
//! discovery messages are filtered through the subject's roles; trusted
//! (broker-relayed) sets bypass the filter.

use std::collections::BTreeMap;

use crate::config::RoleConfig;

/// `*` matches any run of characters, `?` exactly one.
pub fn wildcard_match(pattern: &str, subject: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let subject: Vec<char> = subject.chars().collect();

    // Iterative glob match with single-star backtracking.
    let (mut p, mut s) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while s < subject.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == subject[s]) {
            p += 1;
            s += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, s));
            p += 1;
        } else if let Some((star_p, star_s)) = star {
            p = star_p + 1;
            s = star_s + 1;
            star = Some((star_p, star_s + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

pub struct RoleTable {
    roles: BTreeMap<String, RoleConfig>,
}

impl RoleTable {
    pub fn new(roles: BTreeMap<String, RoleConfig>) -> Self {
        Self { roles }
    }

    pub fn may_publish(&self, holder_roles: &[String], topic: &str) -> bool {
        self.check(holder_roles, topic, |role| &role.publications)
    }

    pub fn may_subscribe(&self, holder_roles: &[String], topic: &str) -> bool {
        self.check(holder_roles, topic, |role| &role.subscriptions)
    }

    fn check(
        &self,
        holder_roles: &[String],
        topic: &str,
        patterns: impl Fn(&RoleConfig) -> &Vec<String>,
    ) -> bool {
        holder_roles
            .iter()
            .filter_map(|name| self.roles.get(name))
            .any(|role| {
                patterns(role)
                    .iter()
                    .any(|pattern| wildcard_match(pattern, topic))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_basics() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("discovery.*", "discovery.register"));
        assert!(!wildcard_match("discovery.*", "delegation.assign"));
        assert!(wildcard_match("db-??", "db-01"));
        assert!(!wildcard_match("db-??", "db-001"));
        assert!(wildcard_match("*.assign", "delegation.assign"));
        assert!(wildcard_match("a*b*c", "aXXbYYc"));
        assert!(!wildcard_match("a*b*c", "aXXbYY"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("exact", "exactly"));
    }

    #[test]
    fn role_table_checks_all_held_roles() {
        let mut roles = BTreeMap::new();
        roles.insert(
            "checker".to_string(),
            RoleConfig {
                publications: vec!["delegation.*".to_string()],
                subscriptions: vec!["delegation.*".to_string()],
            },
        );
        roles.insert(
            "broker".to_string(),
            RoleConfig {
                publications: vec!["discovery.announce".to_string()],
                subscriptions: vec!["discovery.*".to_string()],
            },
        );
        let table = RoleTable::new(roles);

        let held = vec!["checker".to_string()];
        assert!(table.may_publish(&held, "delegation.assign"));
        assert!(!table.may_publish(&held, "discovery.announce"));

        let held = vec!["checker".to_string(), "broker".to_string()];
        assert!(table.may_publish(&held, "discovery.announce"));
        assert!(table.may_subscribe(&held, "discovery.register"));

        let none: Vec<String> = Vec::new();
        assert!(!table.may_publish(&none, "delegation.assign"));
    }
}
