use metrics::counter;
use tracing::debug;

use crate::error::RegistrationError;
use crate::protocol::{
    events, AgentConnectError, AgentLeft, AgentList, AgentSummary, ConnectionId,
    ControllerDisconnected, Envelope, PeerRole, RegisterFailure, Registered,
};
use crate::registry::{AgentRegistration, ControllerRegistration, Removal};

/// Outbound half of the transport.
pub trait PeerSink {
    /// Hands `envelope` to the connection without waiting. Returns `false` when the
    /// connection is already gone, in which case the message is dropped.
    fn deliver(&self, to: ConnectionId, envelope: Envelope) -> bool;
}

/// Turns registry outcomes into lifecycle events. Best effort: a stale destination
/// loses the event, nothing is queued or retried. Each method returns how many
/// events were actually handed to the transport.
pub struct MembershipNotifier<S> {
    sink: S,
}

impl<S: PeerSink> MembershipNotifier<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn agent_registered(&self, registration: &AgentRegistration) -> usize {
        let ack = Registered {
            id: registration.agent.id,
            role: PeerRole::Agent,
            code: None,
        };
        self.send(
            registration.agent.id,
            Envelope::typed(events::REGISTERED, &ack),
        );

        let joined = Envelope::typed(events::AGENT_JOINED, &registration.agent);
        self.fan_out(&registration.audience, &joined)
    }

    pub fn controller_registered(&self, registration: &ControllerRegistration) -> usize {
        let ack = Registered {
            id: registration.id,
            role: PeerRole::Controller,
            code: registration.code.clone(),
        };
        let acked = self.send(registration.id, Envelope::typed(events::REGISTERED, &ack));
        let listed = self.agent_list(registration.id, registration.agents.clone());
        usize::from(acked) + usize::from(listed)
    }

    pub fn registration_rejected(&self, to: ConnectionId, error: &RegistrationError) -> bool {
        let failure = RegisterFailure {
            reason: error.metric_label(),
            message: error.to_string(),
        };
        self.send(to, Envelope::typed(events::REGISTER_ERROR, &failure))
    }

    pub fn agent_list(&self, to: ConnectionId, agents: Vec<AgentSummary>) -> bool {
        self.send(to, Envelope::typed(events::AGENT_LIST, &AgentList { agents }))
    }

    pub fn agent_connected(&self, to: ConnectionId, agent: &AgentSummary) -> bool {
        self.send(to, Envelope::typed(events::AGENT_CONNECTED, agent))
    }

    pub fn agent_connect_failed(&self, to: ConnectionId, agent_id: &str, message: &str) -> bool {
        let error = AgentConnectError {
            agent_id: agent_id.to_string(),
            message: message.to_string(),
        };
        self.send(to, Envelope::typed(events::AGENT_CONNECT_ERROR, &error))
    }

    /// Tells whoever was attached to the removed connection that it is gone.
    pub fn connection_removed(&self, removal: &Removal) -> usize {
        match removal {
            Removal::Unknown => 0,
            Removal::Agent {
                agent_id,
                controllers,
            } => {
                let left = Envelope::typed(
                    events::AGENT_LEFT,
                    &AgentLeft {
                        agent_id: *agent_id,
                    },
                );
                self.fan_out(controllers, &left)
            }
            Removal::Controller {
                controller_id,
                orphaned_agents,
                ..
            } => {
                let gone = Envelope::typed(
                    events::CONTROLLER_DISCONNECTED,
                    &ControllerDisconnected {
                        controller_id: *controller_id,
                    },
                );
                self.fan_out(orphaned_agents, &gone)
            }
        }
    }

    fn fan_out(&self, destinations: &[ConnectionId], envelope: &Envelope) -> usize {
        destinations
            .iter()
            .filter(|to| self.send(**to, envelope.clone()))
            .count()
    }

    fn send(&self, to: ConnectionId, envelope: Envelope) -> bool {
        let event = envelope.event.clone();
        let delivered = self.sink.deliver(to, envelope);
        if !delivered {
            debug!(connection_id = %to, %event, "notification dropped; connection gone");
            counter!("beach_pier_notifications_dropped_total", "event" => event).increment(1);
        }
        delivered
    }
}
