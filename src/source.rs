//! Exporter identity and per-source accounting.
//!
//! Every exporter endpoint is reduced to a 32-bit [`SourceKey`] fingerprint;
//! together with the observation domain id from the message header it forms a
//! [`SourceScope`], the unit of template-namespace and sequence-number
//! isolation. The [`SourceRegistry`] keeps one [`SourceState`] per scope with
//! the counters the preprocessor needs for sequence repair and for minting
//! collector-unique template ids.

use log::warn;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TemplateIdSpaceExhausted;
use crate::input::{InputInfo, InputOrigin};

/// First template id a collector may assign; 0-255 are reserved by RFC 7011.
pub const FIRST_ASSIGNED_TEMPLATE_ID: u16 = 256;

/// 32-bit fingerprint of an exporter endpoint.
///
/// File inputs hash the file path, network inputs hash the textual
/// `<ip>:<port>` form of the source endpoint. The fingerprint is stable for
/// the lifetime of a session; a CRC-32 collision between two endpoints merges
/// their statistics but cannot corrupt template resolution, so collisions are
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SourceKey(pub u32);

impl SourceKey {
    /// Fingerprints the endpoint described by `input`.
    pub fn from_input(input: &InputInfo) -> Self {
        match &input.origin {
            InputOrigin::File { path } => SourceKey(crc32fast::hash(path.as_bytes())),
            InputOrigin::Network { addr, port } => {
                SourceKey(crc32fast::hash(format!("{addr}:{port}").as_bytes()))
            }
        }
    }
}

/// The (source, observation domain) pair that scopes templates and sequence
/// numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SourceScope {
    /// Exporter fingerprint
    pub source: SourceKey,
    /// Observation domain id from the message header
    pub odid: u32,
}

/// Per-scope counters maintained by the preprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceCounters {
    /// Next sequence number the exporter is expected to send
    pub expected_sequence: u32,
    /// Monotone sequence number written into outgoing message headers
    pub normalized_sequence: u32,
    /// Next collector-unique template id; monotone, never wraps
    pub next_assigned_id: u32,
    /// Messages seen from this scope
    pub packets: u64,
    /// Data records seen from this scope
    pub data_records: u64,
    /// Set once the template id space is exhausted; the source is dead
    pub poisoned: bool,
}

impl Default for SourceCounters {
    fn default() -> Self {
        Self {
            expected_sequence: 0,
            normalized_sequence: 0,
            next_assigned_id: u32::from(FIRST_ASSIGNED_TEMPLATE_ID),
            packets: 0,
            data_records: 0,
            poisoned: false,
        }
    }
}

impl SourceCounters {
    /// Mints the next collector-unique template id for this scope.
    pub(crate) fn allocate_template_id(&mut self) -> Result<u16, TemplateIdSpaceExhausted> {
        if self.next_assigned_id > u32::from(u16::MAX) {
            return Err(TemplateIdSpaceExhausted);
        }
        let id = self.next_assigned_id as u16;
        self.next_assigned_id += 1;
        Ok(id)
    }
}

/// Mutable state of one registered scope.
///
/// The counters mutex doubles as the per-source serialization lock: the
/// preprocessor holds it across template processing, sequence repair and the
/// ring write, so messages of one scope reach the ring in arrival order.
#[derive(Debug, Default)]
pub struct SourceState {
    pub(crate) counters: Mutex<SourceCounters>,
}

impl SourceState {
    /// Copies out the current counter values.
    pub fn snapshot(&self) -> SourceCounters {
        *self.counters.lock()
    }
}

/// Flat registry of all live scopes.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    inner: Mutex<HashMap<SourceScope, Arc<SourceState>>>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a scope on session start.
    ///
    /// Registering a scope that already exists keeps the existing state and
    /// logs a warning, matching how non-conformant exporters that re-announce
    /// themselves are tolerated elsewhere.
    pub fn register(&self, scope: SourceScope) -> Arc<SourceState> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.get(&scope) {
            warn!(
                "[{}] trying to add the same data source again",
                scope.odid
            );
            return existing.clone();
        }
        let state = Arc::new(SourceState::default());
        inner.insert(scope, state.clone());
        state
    }

    /// Looks up a scope, creating it when first seen.
    pub fn get_or_create(&self, scope: SourceScope) -> Arc<SourceState> {
        self.inner
            .lock()
            .entry(scope)
            .or_insert_with(|| Arc::new(SourceState::default()))
            .clone()
    }

    /// Looks up a scope without creating it.
    pub fn get(&self, scope: SourceScope) -> Option<Arc<SourceState>> {
        self.inner.lock().get(&scope).cloned()
    }

    /// Removes a scope on session close, returning its final state.
    pub fn remove(&self, scope: SourceScope) -> Option<Arc<SourceState>> {
        self.inner.lock().remove(&scope)
    }

    /// Number of live scopes.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when no scope is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Copies out the counters of every live scope.
    pub fn snapshot(&self) -> Vec<(SourceScope, SourceCounters)> {
        self.inner
            .lock()
            .iter()
            .map(|(scope, state)| (*scope, state.snapshot()))
            .collect()
    }
}
