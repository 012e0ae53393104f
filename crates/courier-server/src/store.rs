use std::collections::{HashMap, HashSet};

use courier_contracts::{AgentRegistration, AgentStatus, EventEnvelope};
use courier_kernel::{TraceEntry, TRACE_WINDOW_MS};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
}

/// The router's authoritative in-memory view: session logs, dedupe sets,
/// the trace index consulted by the loop guard, and the agent whitelist.
/// Held behind a single mutex by the server; methods assume exclusive access.
#[derive(Default)]
pub struct MemoryStore {
    sessions: HashMap<String, Vec<EventEnvelope>>,
    seen_event_ids: HashSet<String>,
    trace_index: HashMap<String, Vec<TraceEntry>>,
    registrations: HashMap<String, AgentRegistration>,
    approved_agents: HashSet<String>,
    sessions_by_agent: HashMap<String, HashSet<String>>,
    seen_emitted_event_ids: HashSet<String>,
}

impl MemoryStore {
    /// Appends an event to its session log. Returns false iff the eventId was
    /// already seen; the seen-id set is the sole source of truth for
    /// at-most-once append.
    pub fn append(&mut self, evt: EventEnvelope) -> bool {
        if !self.seen_event_ids.insert(evt.event_id.clone()) {
            return false;
        }
        let entries = self.trace_index.entry(evt.trace_id.clone()).or_default();
        entries.retain(|entry| entry.created_at >= evt.created_at - TRACE_WINDOW_MS);
        entries.push(TraceEntry {
            created_at: evt.created_at,
            text: evt.text.clone(),
        });
        self.sessions
            .entry(evt.session_key.clone())
            .or_default()
            .push(evt);
        true
    }

    pub fn list(&self, session_key: &str) -> Vec<EventEnvelope> {
        self.sessions.get(session_key).cloned().unwrap_or_default()
    }

    /// Events across all sessions on this trace whose createdAt falls inside
    /// the window, ascending by createdAt.
    pub fn recent_by_trace(&self, trace_id: &str, within_ms: i64, now_ms: i64) -> Vec<TraceEntry> {
        let cutoff = now_ms - within_ms;
        let mut recent: Vec<TraceEntry> = self
            .trace_index
            .get(trace_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.created_at >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        recent.sort_by_key(|entry| entry.created_at);
        recent
    }

    /// Upserts a registration as pending. A returning agent loses any prior
    /// approval and grants until an admin approves it again.
    pub fn register(&mut self, registration: AgentRegistration) {
        self.approved_agents.remove(&registration.agent_id);
        self.sessions_by_agent.remove(&registration.agent_id);
        self.registrations
            .insert(registration.agent_id.clone(), registration);
    }

    /// Approves an agent, replacing its session grants with exactly
    /// `session_keys`.
    pub fn approve(&mut self, agent_id: &str, session_keys: Vec<String>) -> Result<(), StoreError> {
        let registration = self
            .registrations
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::AgentNotFound(agent_id.to_string()))?;
        registration.status = AgentStatus::Approved;
        self.approved_agents.insert(agent_id.to_string());
        self.sessions_by_agent
            .insert(agent_id.to_string(), session_keys.into_iter().collect());
        Ok(())
    }

    pub fn reject(&mut self, agent_id: &str) -> Result<(), StoreError> {
        let registration = self
            .registrations
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::AgentNotFound(agent_id.to_string()))?;
        registration.status = AgentStatus::Rejected;
        self.approved_agents.remove(agent_id);
        self.sessions_by_agent.remove(agent_id);
        Ok(())
    }

    pub fn can_access(&self, agent_id: &str, session_key: &str) -> bool {
        self.approved_agents.contains(agent_id)
            && self
                .sessions_by_agent
                .get(agent_id)
                .map(|keys| keys.contains(session_key))
                .unwrap_or(false)
    }

    /// Approved registrations granted this session, ordered by registration
    /// time then agent id. Non-approved status excludes an agent even if
    /// stale membership lingers elsewhere.
    pub fn recipients_for(&self, session_key: &str) -> Vec<AgentRegistration> {
        let mut recipients: Vec<AgentRegistration> = self
            .registrations
            .values()
            .filter(|reg| reg.status == AgentStatus::Approved)
            .filter(|reg| self.approved_agents.contains(&reg.agent_id))
            .filter(|reg| {
                self.sessions_by_agent
                    .get(&reg.agent_id)
                    .map(|keys| keys.contains(session_key))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        recipients.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        recipients
    }

    /// Returns true iff this emittedEventId has not been seen before.
    pub fn note_emitted(&mut self, emitted_event_id: &str) -> bool {
        self.seen_emitted_event_ids
            .insert(emitted_event_id.to_string())
    }

    pub fn registrations_with_status(&self, status: AgentStatus) -> Vec<AgentRegistration> {
        let mut matching: Vec<AgentRegistration> = self
            .registrations
            .values()
            .filter(|reg| reg.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        matching
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn status_count(&self, status: AgentStatus) -> usize {
        self.registrations
            .values()
            .filter(|reg| reg.status == status)
            .count()
    }
}
