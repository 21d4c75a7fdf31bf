use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::protocol::ConnectionId;

/// Codes live for an hour unless their controller disconnects first.
pub const DEFAULT_CODE_EXPIRY: Duration = Duration::from_secs(60 * 60);

const CODE_LEN: usize = 6;

/// Six decimal digits, never starting with zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingCode(String);

impl PairingCode {
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen_range(100_000u32..1_000_000).to_string())
    }

    /// Accepts user input, tolerating surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() == CODE_LEN && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(trimmed.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingEntry {
    pub code: PairingCode,
    pub controller_id: ConnectionId,
    pub created_at: DateTime<Utc>,
}

/// Live pairing codes, indexed both ways so a controller owns at most one code and
/// a code maps to at most one controller.
pub struct PairingCodeStore {
    codes: HashMap<PairingCode, PairingEntry>,
    by_controller: HashMap<ConnectionId, PairingCode>,
    expiry: Duration,
}

impl PairingCodeStore {
    pub fn new(expiry: Duration) -> Self {
        Self {
            codes: HashMap::new(),
            by_controller: HashMap::new(),
            expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn issue(&mut self, controller_id: ConnectionId, now: DateTime<Utc>) -> PairingCode {
        let mut rng = rand::thread_rng();
        self.issue_with(controller_id, now, || PairingCode::random(&mut rng))
    }

    /// Issues a code drawn from `generate`, drawing again while the candidate collides
    /// with a live code. Any code the controller already held is replaced.
    pub fn issue_with<F>(
        &mut self,
        controller_id: ConnectionId,
        now: DateTime<Utc>,
        mut generate: F,
    ) -> PairingCode
    where
        F: FnMut() -> PairingCode,
    {
        self.revoke(controller_id);

        let code = loop {
            let candidate = generate();
            if !self.codes.contains_key(&candidate) {
                break candidate;
            }
            debug!(code = %candidate, "pairing code collision; regenerating");
        };

        self.codes.insert(
            code.clone(),
            PairingEntry {
                code: code.clone(),
                controller_id,
                created_at: now,
            },
        );
        self.by_controller.insert(controller_id, code.clone());
        code
    }

    /// Looks a code up without consuming it. Codes past the expiry window resolve to
    /// nothing even if the sweep has not run yet.
    pub fn resolve(&self, code: &PairingCode, now: DateTime<Utc>) -> Option<ConnectionId> {
        self.entry(code, now).map(|entry| entry.controller_id)
    }

    pub fn entry(&self, code: &PairingCode, now: DateTime<Utc>) -> Option<&PairingEntry> {
        self.codes
            .get(code)
            .filter(|entry| !self.is_expired(entry, now))
    }

    pub fn code_for(&self, controller_id: ConnectionId) -> Option<&PairingCode> {
        self.by_controller.get(&controller_id)
    }

    pub fn revoke(&mut self, controller_id: ConnectionId) -> Option<PairingCode> {
        let code = self.by_controller.remove(&controller_id)?;
        self.codes.remove(&code);
        Some(code)
    }

    /// Drops every code older than the expiry window and returns what was removed.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<PairingEntry> {
        let expired: Vec<PairingCode> = self
            .codes
            .values()
            .filter(|entry| self.is_expired(entry, now))
            .map(|entry| entry.code.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for code in expired {
            if let Some(entry) = self.codes.remove(&code) {
                self.by_controller.remove(&entry.controller_id);
                removed.push(entry);
            }
        }
        removed
    }

    fn is_expired(&self, entry: &PairingEntry, now: DateTime<Utc>) -> bool {
        match (now - entry.created_at).to_std() {
            Ok(age) => age > self.expiry,
            // created in the future relative to `now`
            Err(_) => false,
        }
    }
}
