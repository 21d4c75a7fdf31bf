use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RouteError;
use crate::notifier::{MembershipNotifier, PeerSink};
use crate::pairing::{PairingCode, DEFAULT_CODE_EXPIRY};
use crate::protocol::{
    classify, destination_field, events, ConnectionId, Envelope, ErrorMessage, EventClass,
    PeerRole, Registration, RelayFailure,
};
use crate::registry::{AgentScope, PairingMode, RegistryCounts, Removal, SessionRegistry};
use crate::router::{RelayRouter, RoutingPolicy};

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub mode: PairingMode,
    pub code_expiry: Duration,
    pub sweep_interval: Duration,
    /// Report routing drops back to the sender as `relay-error`.
    pub nack_unroutable: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mode: PairingMode::CodePairing,
            code_expiry: DEFAULT_CODE_EXPIRY,
            sweep_interval: DEFAULT_CODE_EXPIRY,
            nack_unroutable: false,
        }
    }
}

/// Outbound queues of every live connection, keyed by connection id.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    senders: Arc<DashMap<ConnectionId, mpsc::UnboundedSender<Envelope>>>,
}

impl ConnectionTable {
    pub fn attach(&self, id: ConnectionId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(id, tx);
        rx
    }

    pub fn detach(&self, id: ConnectionId) -> bool {
        self.senders.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl PeerSink for ConnectionTable {
    fn deliver(&self, to: ConnectionId, envelope: Envelope) -> bool {
        match self.senders.get(&to) {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub mode: PairingMode,
    #[serde(flatten)]
    pub counts: RegistryCounts,
    pub connections: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairingLookup {
    pub code: PairingCode,
    pub controller_id: ConnectionId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub agents: usize,
    pub controller_registered_at: DateTime<Utc>,
    /// Whatever the controller sent as `info` when it registered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_info: Option<Value>,
}

/// The relay's single coordination point. Every transport event runs to completion
/// under one registry lock, so registry, pairing codes and routing never observe a
/// half-applied change. Sends are non-blocking queue pushes, which also keeps
/// per-destination ordering intact.
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    registry: Mutex<SessionRegistry>,
    router: RelayRouter,
    notifier: MembershipNotifier<ConnectionTable>,
    config: HubConfig,
}

impl RelayHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: Mutex::new(SessionRegistry::new(config.mode, config.code_expiry)),
                router: RelayRouter::new(RoutingPolicy::for_mode(config.mode)),
                notifier: MembershipNotifier::new(ConnectionTable::default()),
                config,
            }),
        }
    }

    fn connections(&self) -> &ConnectionTable {
        self.inner.notifier.sink()
    }

    /// Transport connect event: allocates an identity and its outbound queue.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Envelope>) {
        let id = ConnectionId::generate();
        let rx = self.connections().attach(id);
        counter!("beach_pier_connections_total").increment(1);
        debug!(connection_id = %id, "connection attached");
        (id, rx)
    }

    /// Parses one text frame and handles it. Malformed frames are answered with `error`.
    pub fn handle_text(&self, id: ConnectionId, text: &str) {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => self.handle_envelope(id, envelope),
            Err(err) => {
                warn!(connection_id = %id, error = %err, "invalid frame");
                self.reply_error(id, format!("invalid message format: {err}"));
            }
        }
    }

    pub fn handle_envelope(&self, id: ConnectionId, envelope: Envelope) {
        let mut registry = self.inner.registry.lock();
        match classify(&envelope.event) {
            EventClass::Register => self.register(&mut registry, id, envelope.data),
            EventClass::Refresh => self.refresh(&registry, id),
            EventClass::ConnectAgent => self.connect_agent(&registry, id, &envelope.data),
            EventClass::Control | EventClass::Telemetry | EventClass::Unknown => {
                self.relay(&registry, id, envelope)
            }
        }
    }

    /// Transport disconnect event. Safe to call for ids that are already gone.
    pub fn disconnect(&self, id: ConnectionId) {
        let mut registry = self.inner.registry.lock();
        self.connections().detach(id);
        let removal = registry.remove_connection(id);
        let notified = self.inner.notifier.connection_removed(&removal);
        match &removal {
            Removal::Unknown => {
                debug!(connection_id = %id, "unregistered connection closed");
            }
            Removal::Agent { .. } => {
                info!(connection_id = %id, notified, "agent disconnected");
            }
            Removal::Controller {
                orphaned_agents,
                revoked_code,
                ..
            } => {
                info!(
                    connection_id = %id,
                    orphaned = orphaned_agents.len(),
                    code_revoked = revoked_code.is_some(),
                    "controller disconnected"
                );
            }
        }
        record_gauges(&registry);
    }

    /// Drops pairing codes older than the expiry window. Returns how many went.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut registry = self.inner.registry.lock();
        let removed = registry.sweep_expired_codes(now);
        if !removed.is_empty() {
            info!(expired = removed.len(), "expired pairing codes swept");
            counter!("beach_pier_pairing_codes_expired_total").increment(removed.len() as u64);
        }
        record_gauges(&registry);
        removed.len()
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let hub = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.sweep_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                hub.sweep_expired(Utc::now());
            }
        })
    }

    pub fn status(&self) -> HubStatus {
        let registry = self.inner.registry.lock();
        HubStatus {
            mode: registry.mode(),
            counts: registry.counts(),
            connections: self.connections().len(),
        }
    }

    pub fn pairing_lookup(&self, raw: &str) -> Option<PairingLookup> {
        let code = PairingCode::parse(raw)?;
        let registry = self.inner.registry.lock();
        let now = Utc::now();
        let entry = registry.pairing_entry(&code, now)?;
        let expiry = chrono::Duration::from_std(registry.code_expiry()?).ok()?;
        let controller = registry.controller(entry.controller_id)?;
        Some(PairingLookup {
            code: entry.code,
            controller_id: entry.controller_id,
            created_at: entry.created_at,
            expires_at: entry.created_at + expiry,
            agents: controller.agent_ids.len(),
            controller_registered_at: controller.registered_at,
            controller_info: controller.info.clone(),
        })
    }

    fn register(&self, registry: &mut SessionRegistry, id: ConnectionId, data: Value) {
        let registration = match serde_json::from_value::<Registration>(data) {
            Ok(registration) => registration,
            Err(err) => {
                warn!(connection_id = %id, error = %err, "invalid registration payload");
                self.reply_error(id, format!("invalid registration: {err}"));
                return;
            }
        };

        let notifier = &self.inner.notifier;
        let outcome = match registration {
            Registration::Agent { code, info } => registry
                .register_agent(id, info, code.as_deref(), Utc::now())
                .map(|registration| {
                    let notified = notifier.agent_registered(&registration);
                    info!(
                        connection_id = %id,
                        hostname = %registration.agent.info.hostname,
                        notified,
                        "agent registered"
                    );
                }),
            Registration::Controller { info } => registry
                .register_controller(id, info, Utc::now())
                .map(|registration| {
                    notifier.controller_registered(&registration);
                    info!(
                        connection_id = %id,
                        agents = registration.agents.len(),
                        "controller registered"
                    );
                }),
        };

        if let Err(err) = outcome {
            info!(connection_id = %id, error = %err, "registration rejected");
            counter!(
                "beach_pier_registrations_rejected_total",
                "reason" => err.metric_label()
            )
            .increment(1);
            notifier.registration_rejected(id, &err);
        }
        record_gauges(registry);
    }

    fn refresh(&self, registry: &SessionRegistry, id: ConnectionId) {
        if registry.role_of(id) != Some(PeerRole::Controller) {
            self.drop_route(id, events::REFRESH, RouteError::NotRegistered);
            return;
        }
        let agents = registry.list_agents(AgentScope::Controller(id));
        self.inner.notifier.agent_list(id, agents);
    }

    fn connect_agent(&self, registry: &SessionRegistry, id: ConnectionId, data: &Value) {
        if registry.role_of(id) != Some(PeerRole::Controller) {
            self.drop_route(id, events::CONNECT_AGENT, RouteError::NotRegistered);
            return;
        }
        let notifier = &self.inner.notifier;
        let Some(raw) = destination_field(data) else {
            notifier.agent_connect_failed(id, "", "agentId is required");
            return;
        };
        let agent = ConnectionId::parse(raw)
            .filter(|agent_id| registry.agent_visible_to(*agent_id, id))
            .and_then(|agent_id| registry.agent(agent_id));
        match agent {
            Some(agent) => {
                notifier.agent_connected(id, &agent.summary());
            }
            None => {
                notifier.agent_connect_failed(id, raw, "agent not found");
            }
        }
    }

    fn relay(&self, registry: &SessionRegistry, id: ConnectionId, envelope: Envelope) {
        let event = envelope.event.clone();
        let route = match self.inner.router.route(registry, id, envelope) {
            Ok(route) => route,
            Err(err) => {
                self.drop_route(id, &event, err);
                return;
            }
        };

        let direction = match registry.role_of(id) {
            Some(PeerRole::Agent) => "agent_to_controller",
            _ => "controller_to_agent",
        };
        let connections = self.connections();
        let mut delivered = 0u64;
        for destination in &route.destinations {
            if connections.deliver(*destination, route.envelope.clone()) {
                delivered += 1;
            }
        }
        if delivered > 0 {
            counter!("beach_pier_messages_relayed_total", "direction" => direction)
                .increment(delivered);
        }
    }

    fn drop_route(&self, id: ConnectionId, event: &str, err: RouteError) {
        debug!(connection_id = %id, %event, reason = %err, "message dropped");
        counter!("beach_pier_messages_dropped_total", "reason" => err.metric_label()).increment(1);
        if self.inner.config.nack_unroutable {
            let failure = RelayFailure {
                event: event.to_string(),
                reason: err.metric_label(),
            };
            self.connections()
                .deliver(id, Envelope::typed(events::RELAY_ERROR, &failure));
        }
    }

    fn reply_error(&self, id: ConnectionId, message: String) {
        self.connections()
            .deliver(id, Envelope::typed(events::ERROR, &ErrorMessage { message }));
    }
}

fn record_gauges(registry: &SessionRegistry) {
    let counts = registry.counts();
    gauge!("beach_pier_agents_active").set(counts.agents as f64);
    gauge!("beach_pier_controllers_active").set(counts.controllers as f64);
    gauge!("beach_pier_pairing_codes_active").set(counts.pairing_codes as f64);
}
