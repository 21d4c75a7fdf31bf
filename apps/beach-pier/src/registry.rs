use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::RegistrationError;
use crate::pairing::{PairingCode, PairingCodeStore, PairingEntry};
use crate::protocol::{AgentInfo, AgentSummary, ConnectionId, PeerRole};

/// How agents find their controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PairingMode {
    /// Every agent is visible to every controller.
    #[value(name = "auto")]
    #[serde(rename = "auto")]
    AutoDiscovery,
    /// Agents join the one controller whose pairing code they present.
    #[value(name = "paired")]
    #[serde(rename = "paired")]
    CodePairing,
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: ConnectionId,
    pub info: AgentInfo,
    /// Only ever set under code pairing.
    pub controller_id: Option<ConnectionId>,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id,
            info: self.info.clone(),
            registered_at: self.registered_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Controller {
    pub id: ConnectionId,
    pub info: Option<Value>,
    pub code: Option<PairingCode>,
    /// Only ever populated under code pairing.
    pub agent_ids: HashSet<ConnectionId>,
    pub registered_at: DateTime<Utc>,
}

/// Which agents a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentScope {
    All,
    Controller(ConnectionId),
}

#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub agent: AgentSummary,
    /// Controllers that now see this agent.
    pub audience: Vec<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct ControllerRegistration {
    pub id: ConnectionId,
    pub code: Option<PairingCode>,
    pub agents: Vec<AgentSummary>,
}

/// What `remove_connection` tore down, for the notifier.
#[derive(Debug, Clone, PartialEq)]
pub enum Removal {
    Unknown,
    Agent {
        agent_id: ConnectionId,
        controllers: Vec<ConnectionId>,
    },
    Controller {
        controller_id: ConnectionId,
        orphaned_agents: Vec<ConnectionId>,
        revoked_code: Option<PairingCode>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    pub agents: usize,
    pub controllers: usize,
    pub pairing_codes: usize,
}

/// Authoritative record of who is connected, in which role, and paired with whom.
pub struct SessionRegistry {
    mode: PairingMode,
    agents: HashMap<ConnectionId, Agent>,
    controllers: HashMap<ConnectionId, Controller>,
    /// Present only under code pairing.
    pairing: Option<PairingCodeStore>,
}

impl SessionRegistry {
    pub fn new(mode: PairingMode, code_expiry: Duration) -> Self {
        let pairing = match mode {
            PairingMode::AutoDiscovery => None,
            PairingMode::CodePairing => Some(PairingCodeStore::new(code_expiry)),
        };
        Self {
            mode,
            agents: HashMap::new(),
            controllers: HashMap::new(),
            pairing,
        }
    }

    pub fn mode(&self) -> PairingMode {
        self.mode
    }

    pub fn role_of(&self, id: ConnectionId) -> Option<PeerRole> {
        if self.agents.contains_key(&id) {
            Some(PeerRole::Agent)
        } else if self.controllers.contains_key(&id) {
            Some(PeerRole::Controller)
        } else {
            None
        }
    }

    pub fn agent(&self, id: ConnectionId) -> Option<&Agent> {
        self.agents.get(&id)
    }

    pub fn controller(&self, id: ConnectionId) -> Option<&Controller> {
        self.controllers.get(&id)
    }

    pub fn controller_ids(&self) -> Vec<ConnectionId> {
        self.controllers.keys().copied().collect()
    }

    pub fn counts(&self) -> RegistryCounts {
        RegistryCounts {
            agents: self.agents.len(),
            controllers: self.controllers.len(),
            pairing_codes: self.pairing.as_ref().map_or(0, PairingCodeStore::len),
        }
    }

    pub fn register_agent(
        &mut self,
        id: ConnectionId,
        info: AgentInfo,
        code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AgentRegistration, RegistrationError> {
        if self.role_of(id).is_some() {
            return Err(RegistrationError::AlreadyRegistered);
        }

        // Validate everything before touching state so a refusal leaves no trace.
        let controller_id = match &self.pairing {
            None => None,
            Some(store) => {
                let code = code
                    .and_then(PairingCode::parse)
                    .ok_or(RegistrationError::InvalidPairingCode)?;
                let controller_id = store
                    .resolve(&code, now)
                    .ok_or(RegistrationError::InvalidPairingCode)?;
                if !self.controllers.contains_key(&controller_id) {
                    return Err(RegistrationError::ControllerGone);
                }
                Some(controller_id)
            }
        };

        let agent = Agent {
            id,
            info,
            controller_id,
            registered_at: now,
        };
        let summary = agent.summary();
        self.agents.insert(id, agent);

        let audience = match controller_id {
            Some(controller_id) => {
                if let Some(controller) = self.controllers.get_mut(&controller_id) {
                    controller.agent_ids.insert(id);
                }
                vec![controller_id]
            }
            None => self.controller_ids(),
        };

        Ok(AgentRegistration {
            agent: summary,
            audience,
        })
    }

    pub fn register_controller(
        &mut self,
        id: ConnectionId,
        info: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<ControllerRegistration, RegistrationError> {
        if self.role_of(id).is_some() {
            return Err(RegistrationError::AlreadyRegistered);
        }

        let code = self.pairing.as_mut().map(|store| store.issue(id, now));
        self.controllers.insert(
            id,
            Controller {
                id,
                info,
                code: code.clone(),
                agent_ids: HashSet::new(),
                registered_at: now,
            },
        );

        Ok(ControllerRegistration {
            id,
            code,
            agents: self.list_agents(AgentScope::Controller(id)),
        })
    }

    /// Forgets a connection. Unknown ids are already clean and yield `Removal::Unknown`.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Removal {
        if let Some(agent) = self.agents.remove(&id) {
            let controllers = match agent.controller_id {
                Some(controller_id) => {
                    if let Some(controller) = self.controllers.get_mut(&controller_id) {
                        controller.agent_ids.remove(&id);
                    }
                    vec![controller_id]
                }
                None if self.mode == PairingMode::AutoDiscovery => self.controller_ids(),
                None => Vec::new(),
            };
            return Removal::Agent {
                agent_id: id,
                controllers,
            };
        }

        if let Some(controller) = self.controllers.remove(&id) {
            let mut orphaned_agents: Vec<ConnectionId> =
                controller.agent_ids.into_iter().collect();
            orphaned_agents.sort();
            for agent_id in &orphaned_agents {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.controller_id = None;
                }
            }
            let revoked_code = self.pairing.as_mut().and_then(|store| store.revoke(id));
            return Removal::Controller {
                controller_id: id,
                orphaned_agents,
                revoked_code,
            };
        }

        Removal::Unknown
    }

    pub fn list_agents(&self, scope: AgentScope) -> Vec<AgentSummary> {
        match (self.mode, scope) {
            (PairingMode::AutoDiscovery, _) | (_, AgentScope::All) => {
                self.agents.values().map(Agent::summary).collect()
            }
            (PairingMode::CodePairing, AgentScope::Controller(controller_id)) => self
                .controllers
                .get(&controller_id)
                .map(|controller| {
                    controller
                        .agent_ids
                        .iter()
                        .filter_map(|agent_id| self.agents.get(agent_id))
                        .map(Agent::summary)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Whether `controller_id` may see and address `agent_id`.
    pub fn agent_visible_to(&self, agent_id: ConnectionId, controller_id: ConnectionId) -> bool {
        match self.agents.get(&agent_id) {
            None => false,
            Some(_) if self.mode == PairingMode::AutoDiscovery => {
                self.controllers.contains_key(&controller_id)
            }
            Some(agent) => agent.controller_id == Some(controller_id),
        }
    }

    pub fn pairing_entry(&self, code: &PairingCode, now: DateTime<Utc>) -> Option<PairingEntry> {
        self.pairing
            .as_ref()
            .and_then(|store| store.entry(code, now))
            .cloned()
    }

    pub fn code_expiry(&self) -> Option<Duration> {
        self.pairing.as_ref().map(PairingCodeStore::expiry)
    }

    /// Expires stale pairing codes. Controllers keep their agents; they just stop
    /// accepting new ones on the old code.
    pub fn sweep_expired_codes(&mut self, now: DateTime<Utc>) -> Vec<PairingEntry> {
        let Some(store) = self.pairing.as_mut() else {
            return Vec::new();
        };
        let removed = store.sweep_expired(now);
        for entry in &removed {
            if let Some(controller) = self.controllers.get_mut(&entry.controller_id) {
                controller.code = None;
            }
        }
        removed
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for controller in self.controllers.values() {
            for agent_id in &controller.agent_ids {
                let agent = self
                    .agents
                    .get(agent_id)
                    .unwrap_or_else(|| panic!("controller lists dead agent {agent_id}"));
                assert_eq!(agent.controller_id, Some(controller.id));
            }
        }
        for agent in self.agents.values() {
            assert!(!self.controllers.contains_key(&agent.id));
            if let Some(controller_id) = agent.controller_id {
                let controller = self
                    .controllers
                    .get(&controller_id)
                    .unwrap_or_else(|| panic!("agent points at dead controller {controller_id}"));
                assert!(controller.agent_ids.contains(&agent.id));
            }
        }
        if let Some(store) = &self.pairing {
            for controller in self.controllers.values() {
                assert_eq!(controller.code.as_ref(), store.code_for(controller.id));
            }
        }
    }
}
