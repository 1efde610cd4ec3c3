//! Template lifecycle events and hooks.
//!
//! The dictionary emits an event for every template state change. Hooks let
//! the embedding runtime watch template churn in real time — feeding metrics
//! into an observability system, alerting on exporters that keep superseding
//! their own templates, or logging expiry patterns of flaky UDP sources.

use std::sync::Arc;

use crate::template::{TemplateKey, TemplateKind};

/// Template state changes observable from outside the dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateEvent {
    /// A new template was learned.
    Learned {
        /// Full dictionary key of the template
        key: TemplateKey,
        /// Collector-assigned id it will carry downstream
        assigned_id: u16,
        /// Data or options template
        kind: TemplateKind,
    },

    /// A template was re-announced with an unchanged layout.
    Refreshed {
        /// Full dictionary key of the template
        key: TemplateKey,
        /// Collector-assigned id, unchanged by the refresh
        assigned_id: u16,
        /// Data or options template
        kind: TemplateKind,
    },

    /// A template was re-announced with a different layout; the old object
    /// stays alive for in-flight messages, new data resolves against the new
    /// assigned id.
    Superseded {
        /// Full dictionary key of the template
        key: TemplateKey,
        /// Assigned id of the replaced template
        old_assigned_id: u16,
        /// Assigned id of the replacement
        new_assigned_id: u16,
        /// Data or options template
        kind: TemplateKind,
    },

    /// A TCP/SCTP exporter withdrew the template, or its source closed.
    Withdrawn {
        /// Full dictionary key of the template
        key: TemplateKey,
        /// Data or options template
        kind: TemplateKind,
    },

    /// A UDP template aged out.
    Expired {
        /// Full dictionary key of the template
        key: TemplateKey,
        /// Data or options template
        kind: TemplateKind,
    },

    /// The capacity backstop pushed the template out.
    Evicted {
        /// Full dictionary key of the template
        key: TemplateKey,
        /// Data or options template
        kind: TemplateKind,
    },

    /// A data set referenced a template the dictionary does not hold.
    Missing {
        /// Key the lookup was made with
        key: TemplateKey,
    },
}

/// Callback invoked for each [`TemplateEvent`].
pub type TemplateHook = Arc<dyn Fn(&TemplateEvent) + Send + Sync + 'static>;

/// Container for registered template event hooks.
#[derive(Clone, Default)]
pub struct TemplateHooks {
    hooks: Vec<TemplateHook>,
}

// Custom Debug implementation to avoid printing closures
impl std::fmt::Debug for TemplateHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateHooks")
            .field("hook_count", &self.hooks.len())
            .finish()
    }
}

impl TemplateHooks {
    /// Creates a new empty hook container.
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Registers a new hook.
    pub fn register<F>(&mut self, hook: F)
    where
        F: Fn(&TemplateEvent) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
    }

    /// Triggers all registered hooks with the given event.
    pub fn trigger(&self, event: &TemplateEvent) {
        for hook in &self.hooks {
            hook(event);
        }
    }

    /// Returns the number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns true if no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}
