//! Template subsystem: the shared [`Template`] object and the keyed,
//! reference-counted [`dictionary`] that owns it.
//!
//! Templates are template-based flow schemas: a template record declares the
//! field layout of every data record exported under its id. Exporter-local
//! template ids are only unique within one (source, observation domain)
//! scope, so the dictionary keys on the full [`TemplateKey`] triple and the
//! collector mints its own [`Template::assigned_id`] for everything that
//! leaves the preprocessor.
//!
//! # Lifetime
//!
//! A template moves through `Fresh -> Live -> Withdrawn -> Reclaimable`:
//! created on `add`, retained by the dictionary (one `Arc` strong count),
//! additionally held by every in-flight [`Message`](crate::message::Message)
//! that resolved data against it (one strong count per data couple), removed
//! from the dictionary on withdrawal or expiry, and freed when the last
//! holder drops its `Arc`.

pub mod dictionary;
pub mod events;
pub mod expiry;
pub mod metrics;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec::{FieldSpec, TemplateDefinition};
use crate::source::{SourceKey, SourceScope};
use crate::template::expiry::uptime_millis;

/// Whether a template describes plain data records or options records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TemplateKind {
    /// Ordinary data template (set id 2)
    Data,
    /// Options template with leading scope fields (set id 3)
    Options,
}

impl TemplateKind {
    /// Human-readable name used in log lines.
    pub fn label(self) -> &'static str {
        match self {
            TemplateKind::Data => "template",
            TemplateKind::Options => "options template",
        }
    }
}

/// Dictionary key: exporter fingerprint, observation domain and the
/// exporter-local template id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TemplateKey {
    /// Exporter fingerprint
    pub source: SourceKey,
    /// Observation domain id
    pub odid: u32,
    /// Template id as sent by the exporter
    pub template_id: u16,
}

impl TemplateKey {
    /// The (source, observation domain) prefix of this key.
    pub fn scope(&self) -> SourceScope {
        SourceScope {
            source: self.source,
            odid: self.odid,
        }
    }
}

/// One learned template.
///
/// The layout is immutable; only the UDP liveness stamps change after
/// creation. An update that alters the layout produces a *new* `Template`
/// with a fresh assigned id, leaving the superseded object alive for any
/// in-flight message that still references it.
#[derive(Debug)]
pub struct Template {
    kind: TemplateKind,
    original_id: u16,
    assigned_id: u16,
    scope_field_count: u16,
    fields: Vec<FieldSpec>,
    fixed_record_length: Option<usize>,
    /// Source-local message counter at the last sighting (UDP only)
    last_seen_message: AtomicU64,
    /// Collector uptime at the last sighting, in milliseconds (UDP only)
    last_seen_millis: AtomicU64,
}

impl Template {
    pub(crate) fn new(kind: TemplateKind, definition: &TemplateDefinition, assigned_id: u16) -> Self {
        Self {
            kind,
            original_id: definition.template_id,
            assigned_id,
            scope_field_count: definition.scope_field_count,
            fixed_record_length: definition.fixed_record_length(),
            fields: definition.fields.clone(),
            last_seen_message: AtomicU64::new(0),
            last_seen_millis: AtomicU64::new(uptime_millis()),
        }
    }

    /// Data or options template.
    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    /// Template id the exporter used.
    pub fn original_id(&self) -> u16 {
        self.original_id
    }

    /// Collector-unique id written into all downstream-visible bytes.
    pub fn assigned_id(&self) -> u16 {
        self.assigned_id
    }

    /// Leading scope fields; 0 for data templates.
    pub fn scope_field_count(&self) -> u16 {
        self.scope_field_count
    }

    /// Field specifiers, scope fields first.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Record length in octets, or `None` when any field is variable-length.
    pub fn fixed_record_length(&self) -> Option<usize> {
        self.fixed_record_length
    }

    /// True when the definition declares the same layout as this template.
    pub fn layout_matches(&self, definition: &TemplateDefinition) -> bool {
        self.scope_field_count == definition.scope_field_count && self.fields == definition.fields
    }

    /// Stamps the UDP liveness counters at a new sighting.
    pub(crate) fn touch(&self, message_counter: u64) {
        self.last_seen_message
            .store(message_counter, Ordering::Relaxed);
        self.last_seen_millis
            .store(uptime_millis(), Ordering::Relaxed);
    }

    /// Source-local message counter at the last sighting.
    pub fn last_seen_message(&self) -> u64 {
        self.last_seen_message.load(Ordering::Relaxed)
    }

    /// Collector uptime at the last sighting, in milliseconds.
    pub fn last_seen_millis(&self) -> u64 {
        self.last_seen_millis.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(template_id: u16, fields: Vec<FieldSpec>) -> TemplateDefinition {
        TemplateDefinition {
            template_id,
            scope_field_count: 0,
            fields,
            offset: 0,
        }
    }

    #[test]
    fn fixed_record_length_sums_field_lengths() {
        let def = definition(
            256,
            vec![
                FieldSpec {
                    element_id: 8,
                    length: 4,
                    enterprise_id: 0,
                },
                FieldSpec {
                    element_id: 7,
                    length: 2,
                    enterprise_id: 0,
                },
            ],
        );
        let template = Template::new(TemplateKind::Data, &def, 256);
        assert_eq!(template.fixed_record_length(), Some(6));
        assert!(template.layout_matches(&def));
    }

    #[test]
    fn variable_length_field_clears_fixed_length() {
        let def = definition(
            256,
            vec![FieldSpec {
                element_id: 95,
                length: crate::codec::VARIABLE_LENGTH,
                enterprise_id: 0,
            }],
        );
        let template = Template::new(TemplateKind::Data, &def, 256);
        assert_eq!(template.fixed_record_length(), None);
    }

    #[test]
    fn layout_mismatch_is_detected() {
        let original = definition(
            256,
            vec![FieldSpec {
                element_id: 8,
                length: 4,
                enterprise_id: 0,
            }],
        );
        let template = Template::new(TemplateKind::Data, &original, 256);

        let widened = definition(
            256,
            vec![FieldSpec {
                element_id: 8,
                length: 8,
                enterprise_id: 0,
            }],
        );
        assert!(!template.layout_matches(&widened));
    }
}
