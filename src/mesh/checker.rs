//! Assignee side of delegation.
//!
//! Answers `delegation.assign` requests for the local daemon: accept when the
//! service matches the locally configured accepts globs, reject otherwise.
//! `delegation.clear` discards everything a (re)connecting delegator may
//! consider stale. Actual check execution lives elsewhere; this component
//! only tracks which services this daemon is responsible for.

use std::collections::BTreeSet;

use super::endpoint::EndpointId;
use super::identity::topics;
use super::manager::EndpointManager;
use super::permissions::wildcard_match;
use super::proto::{Params, Reply, ReplyResult, Request};

pub struct Checker {
    local_endpoint: EndpointId,
    accepts: Vec<String>,
    assigned: BTreeSet<String>,
}

impl Checker {
    pub fn new(manager: &mut EndpointManager, accepts: Vec<String>) -> Self {
        let local_endpoint = manager.register_local(
            [],
            [
                topics::DELEGATION_ASSIGN.to_string(),
                topics::DELEGATION_CLEAR.to_string(),
            ],
        );
        Self {
            local_endpoint,
            accepts,
            assigned: BTreeSet::new(),
        }
    }

    pub fn local_endpoint(&self) -> EndpointId {
        self.local_endpoint
    }

    /// Services this daemon currently executes.
    pub fn assigned(&self) -> impl Iterator<Item = &str> {
        self.assigned.iter().map(String::as_str)
    }

    pub fn is_assigned(&self, service: &str) -> bool {
        self.assigned.contains(service)
    }

    pub fn handle_assign(
        &mut self,
        manager: &mut EndpointManager,
        sender: EndpointId,
        request: &Request,
    ) {
        let Some(name) = request.params.get_text("serviceName") else {
            tracing::debug!(target: "checker", "assign request without serviceName; dropping");
            return;
        };

        let accepted = self
            .accepts
            .iter()
            .any(|glob| wildcard_match(glob, name));
        if accepted {
            self.assigned.insert(name.to_string());
            tracing::info!(target: "checker", service = name, "accepted check assignment");
        } else {
            tracing::info!(target: "checker", service = name, "rejected check assignment");
        }

        if let Some(id) = request.id {
            let mut params = Params::new();
            params.set_bool("accepted", accepted);
            manager.send_reply(
                self.local_endpoint,
                sender,
                Reply {
                    id,
                    result: ReplyResult::Ok(params),
                },
            );
        }
    }

    pub fn handle_clear(&mut self) {
        if !self.assigned.is_empty() {
            tracing::info!(
                target: "checker",
                count = self.assigned.len(),
                "clearing delegated services"
            );
        }
        self.assigned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::identity::Identity;
    use crate::mesh::proto::Payload;

    #[test]
    fn accepts_matching_service_and_replies() {
        let mut mgr = EndpointManager::new(Identity::from("node-a"));
        let mut checker = Checker::new(&mut mgr, vec!["web-*".to_string()]);
        let delegator = mgr.register_local(
            [topics::DELEGATION_ASSIGN.to_string()],
            [],
        );
        while mgr.poll_notice().is_some() {}

        let mut params = Params::new();
        params.set_text("serviceName", "web-http");
        checker.handle_assign(
            &mut mgr,
            delegator,
            &Request::new(topics::DELEGATION_ASSIGN)
                .with_id(9)
                .with_params(params),
        );

        assert!(checker.is_assigned("web-http"));
        let (from, target, envelope) = mgr.poll_loopback().unwrap();
        assert_eq!(from, checker.local_endpoint());
        assert_eq!(target, delegator);
        match envelope.payload {
            Payload::Reply(reply) => {
                assert_eq!(reply.id, 9);
                assert!(matches!(
                    reply.result,
                    ReplyResult::Ok(ref p) if p.get_bool("accepted") == Some(true)
                ));
            }
            Payload::Request(_) => panic!("expected a reply"),
        }
    }

    #[test]
    fn rejects_non_matching_service() {
        let mut mgr = EndpointManager::new(Identity::from("node-a"));
        let mut checker = Checker::new(&mut mgr, vec!["db-*".to_string()]);
        let delegator = mgr.register_local([topics::DELEGATION_ASSIGN.to_string()], []);
        while mgr.poll_notice().is_some() {}

        let mut params = Params::new();
        params.set_text("serviceName", "web-http");
        checker.handle_assign(
            &mut mgr,
            delegator,
            &Request::new(topics::DELEGATION_ASSIGN)
                .with_id(10)
                .with_params(params),
        );

        assert!(!checker.is_assigned("web-http"));
        let (_, _, envelope) = mgr.poll_loopback().unwrap();
        match envelope.payload {
            Payload::Reply(reply) => {
                assert!(matches!(
                    reply.result,
                    ReplyResult::Ok(ref p) if p.get_bool("accepted") == Some(false)
                ));
            }
            Payload::Request(_) => panic!("expected a reply"),
        }
    }

    #[test]
    fn clear_discards_assignments() {
        let mut mgr = EndpointManager::new(Identity::from("node-a"));
        let mut checker = Checker::new(&mut mgr, vec!["*".to_string()]);
        let delegator = mgr.register_local([topics::DELEGATION_ASSIGN.to_string()], []);
        while mgr.poll_notice().is_some() {}

        let mut params = Params::new();
        params.set_text("serviceName", "web-http");
        checker.handle_assign(
            &mut mgr,
            delegator,
            &Request::new(topics::DELEGATION_ASSIGN).with_params(params),
        );
        assert!(checker.is_assigned("web-http"));

        checker.handle_clear();
        assert!(!checker.is_assigned("web-http"));
    }
}
