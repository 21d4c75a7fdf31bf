//! Stateless forwarding over the registry snapshot.
//!
//! Control messages travel controller -> agent and name their destination in the payload.
//! Telemetry travels agent -> controller(s); the destination comes from the sender's
//! association and the relay stamps the sender's id onto the payload. Payloads are
//! otherwise forwarded untouched, with no batching or coalescing.

use crate::error::RouteError;
use crate::protocol::{
    classify, destination_field, inject_origin, ConnectionId, Envelope, EventClass, PeerRole,
};
use crate::registry::{PairingMode, SessionRegistry};

/// Destination policy, fixed when the router is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingPolicy {
    /// Agent traffic fans out to every controller; any controller may address any agent.
    Broadcast,
    /// Agent traffic goes to the paired controller only; controllers address only their agents.
    Paired,
}

impl RoutingPolicy {
    pub fn for_mode(mode: PairingMode) -> Self {
        match mode {
            PairingMode::AutoDiscovery => RoutingPolicy::Broadcast,
            PairingMode::CodePairing => RoutingPolicy::Paired,
        }
    }
}

/// A message ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub destinations: Vec<ConnectionId>,
    pub envelope: Envelope,
}

#[derive(Debug, Clone)]
pub struct RelayRouter {
    policy: RoutingPolicy,
}

impl RelayRouter {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self { policy }
    }

    pub fn route(
        &self,
        registry: &SessionRegistry,
        sender: ConnectionId,
        envelope: Envelope,
    ) -> Result<Route, RouteError> {
        let role = registry.role_of(sender).ok_or(RouteError::NotRegistered)?;
        let destinations = self.resolve_destinations(registry, sender, role, &envelope)?;

        let envelope = match role {
            PeerRole::Agent => Envelope {
                data: inject_origin(envelope.data, sender),
                event: envelope.event,
            },
            PeerRole::Controller => envelope,
        };

        Ok(Route {
            destinations,
            envelope,
        })
    }

    pub fn resolve_destinations(
        &self,
        registry: &SessionRegistry,
        sender: ConnectionId,
        role: PeerRole,
        envelope: &Envelope,
    ) -> Result<Vec<ConnectionId>, RouteError> {
        match (classify(&envelope.event), role) {
            (EventClass::Control, PeerRole::Controller) => {
                let raw =
                    destination_field(&envelope.data).ok_or(RouteError::MissingDestination)?;
                let agent_id = ConnectionId::parse(raw).ok_or(RouteError::UnknownDestination)?;
                // Agents paired elsewhere are indistinguishable from absent ones.
                if registry.agent_visible_to(agent_id, sender) {
                    Ok(vec![agent_id])
                } else {
                    Err(RouteError::UnknownDestination)
                }
            }
            (EventClass::Telemetry, PeerRole::Agent) => match self.policy {
                RoutingPolicy::Broadcast => Ok(registry.controller_ids()),
                RoutingPolicy::Paired => registry
                    .agent(sender)
                    .and_then(|agent| agent.controller_id)
                    .map(|controller_id| vec![controller_id])
                    .ok_or(RouteError::Unassociated),
            },
            (EventClass::Control, _) | (EventClass::Telemetry, _) => {
                Err(RouteError::NotRegistered)
            }
            _ => Err(RouteError::UnroutableEvent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::DEFAULT_CODE_EXPIRY;
    use crate::protocol::AgentInfo;
    use chrono::Utc;
    use serde_json::json;

    struct Fixture {
        registry: SessionRegistry,
        router: RelayRouter,
    }

    impl Fixture {
        fn new(mode: PairingMode) -> Self {
            Self {
                registry: SessionRegistry::new(mode, DEFAULT_CODE_EXPIRY),
                router: RelayRouter::new(RoutingPolicy::for_mode(mode)),
            }
        }

        fn controller(&mut self) -> (ConnectionId, Option<String>) {
            let id = ConnectionId::generate();
            let registration = self
                .registry
                .register_controller(id, None, Utc::now())
                .unwrap();
            (id, registration.code.map(|code| code.to_string()))
        }

        fn agent(&mut self, code: Option<&str>) -> ConnectionId {
            let id = ConnectionId::generate();
            self.registry
                .register_agent(id, AgentInfo::default(), code, Utc::now())
                .unwrap();
            id
        }

        fn route(
            &self,
            sender: ConnectionId,
            event: &str,
            data: serde_json::Value,
        ) -> Result<Route, RouteError> {
            self.router
                .route(&self.registry, sender, Envelope::new(event, data))
        }
    }

    #[test_timeout::timeout]
    fn control_is_forwarded_verbatim() {
        let mut fx = Fixture::new(PairingMode::CodePairing);
        let (controller, code) = fx.controller();
        let agent = fx.agent(code.as_deref());
        let data = json!({ "agentId": agent.to_string(), "x": 10, "y": 20 });

        let route = fx.route(controller, "mouse-move", data.clone()).unwrap();

        assert_eq!(route.destinations, vec![agent]);
        assert_eq!(route.envelope, Envelope::new("mouse-move", data));
    }

    #[test_timeout::timeout]
    fn target_agent_field_is_accepted() {
        let mut fx = Fixture::new(PairingMode::AutoDiscovery);
        let (controller, _) = fx.controller();
        let agent = fx.agent(None);

        let route = fx
            .route(controller, "screenshot", json!({ "targetAgent": agent.to_string() }))
            .unwrap();
        assert_eq!(route.destinations, vec![agent]);
    }

    #[test_timeout::timeout]
    fn unknown_destination_is_dropped() {
        let mut fx = Fixture::new(PairingMode::AutoDiscovery);
        let (controller, _) = fx.controller();
        fx.agent(None);

        let ghost = ConnectionId::generate().to_string();
        assert_eq!(
            fx.route(controller, "key-type", json!({ "agentId": ghost })),
            Err(RouteError::UnknownDestination)
        );
        assert_eq!(
            fx.route(controller, "key-type", json!({ "agentId": "not-a-uuid" })),
            Err(RouteError::UnknownDestination)
        );
        assert_eq!(
            fx.route(controller, "key-type", json!({ "text": "hi" })),
            Err(RouteError::MissingDestination)
        );
    }

    #[test_timeout::timeout]
    fn paired_controller_cannot_reach_foreign_agent() {
        let mut fx = Fixture::new(PairingMode::CodePairing);
        let (first, first_code) = fx.controller();
        let (second, _) = fx.controller();
        let agent = fx.agent(first_code.as_deref());

        let data = json!({ "agentId": agent.to_string() });
        assert!(fx.route(first, "lock-screen", data.clone()).is_ok());
        assert_eq!(
            fx.route(second, "lock-screen", data),
            Err(RouteError::UnknownDestination)
        );
    }

    #[test_timeout::timeout]
    fn telemetry_broadcasts_under_auto_discovery() {
        let mut fx = Fixture::new(PairingMode::AutoDiscovery);
        let (first, _) = fx.controller();
        let (second, _) = fx.controller();
        let agent = fx.agent(None);

        let route = fx
            .route(agent, "screen-frame", json!({ "frame": "AAAA" }))
            .unwrap();

        let mut destinations = route.destinations.clone();
        destinations.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(destinations, expected);
        assert_eq!(route.envelope.data["agentId"], json!(agent.to_string()));
        assert_eq!(route.envelope.data["frame"], json!("AAAA"));
    }

    #[test_timeout::timeout]
    fn telemetry_goes_to_paired_controller_only() {
        let mut fx = Fixture::new(PairingMode::CodePairing);
        let (first, first_code) = fx.controller();
        let (_second, _) = fx.controller();
        let agent = fx.agent(first_code.as_deref());

        let route = fx
            .route(agent, "command-output", json!({ "agentId": "spoofed", "out": "ok" }))
            .unwrap();

        assert_eq!(route.destinations, vec![first]);
        assert_eq!(route.envelope.data["agentId"], json!(agent.to_string()));
    }

    #[test_timeout::timeout]
    fn orphaned_agent_telemetry_is_dropped() {
        let mut fx = Fixture::new(PairingMode::CodePairing);
        let (controller, code) = fx.controller();
        let agent = fx.agent(code.as_deref());
        fx.registry.remove_connection(controller);

        assert_eq!(
            fx.route(agent, "heartbeat", json!({})),
            Err(RouteError::Unassociated)
        );
    }

    #[test_timeout::timeout]
    fn roles_and_vocabulary_are_enforced() {
        let mut fx = Fixture::new(PairingMode::AutoDiscovery);
        let (controller, _) = fx.controller();
        let agent = fx.agent(None);
        let stranger = ConnectionId::generate();

        assert_eq!(
            fx.route(stranger, "screen-frame", json!({})),
            Err(RouteError::NotRegistered)
        );
        assert_eq!(
            fx.route(agent, "mouse-move", json!({ "agentId": agent.to_string() })),
            Err(RouteError::NotRegistered)
        );
        assert_eq!(
            fx.route(controller, "screen-frame", json!({})),
            Err(RouteError::NotRegistered)
        );
        assert_eq!(
            fx.route(controller, "teleport", json!({})),
            Err(RouteError::UnroutableEvent)
        );
    }

    #[test_timeout::timeout]
    fn control_reach_matches_agent_visibility() {
        let mut fx = Fixture::new(PairingMode::CodePairing);
        let (owner, code) = fx.controller();
        let (other, _) = fx.controller();
        let agent = fx.agent(code.as_deref());
        fx.registry.remove_connection(owner);

        assert!(!fx.registry.agent_visible_to(agent, other));
        assert_eq!(
            fx.route(other, "screenshot", json!({ "agentId": agent.to_string() })),
            Err(RouteError::UnknownDestination)
        );
    }
}
