//! The template dictionary: a keyed, reference-counted template store with
//! transport-aware expiry.
//!
//! One dictionary serves the whole collector. Writers (template sets,
//! withdrawals, source lifecycle, expiry) take the write half of a dictionary
//! lock; lookups take the read half and the lock is never held across I/O.
//! Retention is reference-counted through `Arc`: the dictionary's own slot
//! keeps a template alive while it is published, and every in-flight message
//! that resolved data against it holds one more reference, so a withdrawn
//! template survives exactly until the last such message is released.
//!
//! The store is an [`LruCache`] purely as a capacity backstop: reads use
//! `peek` (no reorder, shared lock suffices) and an eviction is handled like
//! a forced withdrawal of the least recently written template.

use log::{info, warn};
use lru::LruCache;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::codec::{MIN_DATA_SET_ID, TemplateDefinition};
use crate::source::SourceScope;
use crate::template::events::{TemplateEvent, TemplateHooks};
use crate::template::expiry::UdpTemplatePolicy;
use crate::template::metrics::{DictionaryMetrics, MetricsSnapshot};
use crate::template::{Template, TemplateKey, TemplateKind};

/// Default number of templates the dictionary retains before the capacity
/// backstop starts evicting.
pub const DEFAULT_TEMPLATE_CAPACITY: usize = 4096;

/// Result of a withdrawal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawOutcome {
    /// The dictionary slot was removed
    Removed,
    /// No such template was published; a warning, not an error
    Unknown,
}

/// Point-in-time utilization of the dictionary.
#[derive(Debug, Clone)]
pub struct DictionaryStats {
    /// Templates currently published
    pub current_size: usize,
    /// Capacity of the backstop
    pub capacity: usize,
    /// Activity counters
    pub metrics: MetricsSnapshot,
}

struct DictionaryInner {
    templates: LruCache<TemplateKey, Arc<Template>>,
    scopes: HashSet<SourceScope>,
}

/// Process-wide template store. See the [module docs](self).
pub struct TemplateDictionary {
    inner: RwLock<DictionaryInner>,
    metrics: DictionaryMetrics,
    hooks: TemplateHooks,
}

impl std::fmt::Debug for TemplateDictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateDictionary")
            .field("len", &self.len())
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl Default for TemplateDictionary {
    fn default() -> Self {
        Self::new(
            NonZeroUsize::new(DEFAULT_TEMPLATE_CAPACITY).expect("default capacity is non-zero"),
            TemplateHooks::new(),
        )
    }
}

impl TemplateDictionary {
    /// Creates a dictionary with the given capacity backstop and hooks.
    pub fn new(capacity: NonZeroUsize, hooks: TemplateHooks) -> Self {
        Self {
            inner: RwLock::new(DictionaryInner {
                templates: LruCache::new(capacity),
                scopes: HashSet::new(),
            }),
            metrics: DictionaryMetrics::new(),
            hooks,
        }
    }

    /// Looks a template up without touching its retention order.
    ///
    /// The returned `Arc` *is* the acquisition: holding it keeps the template
    /// alive past any withdrawal, dropping it releases the reference.
    pub fn get(&self, key: &TemplateKey) -> Option<Arc<Template>> {
        let inner = self.inner.read();
        match inner.templates.peek(key) {
            Some(template) => {
                self.metrics.record_hit();
                Some(template.clone())
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Like [`get`](Self::get), but notifies hooks when the template is
    /// absent. Used on the data-resolution path, where a miss means a data
    /// set will travel downstream without a template.
    pub fn resolve(&self, key: &TemplateKey) -> Option<Arc<Template>> {
        let found = self.get(key);
        if found.is_none() {
            self.hooks.trigger(&TemplateEvent::Missing { key: *key });
        }
        found
    }

    /// Publishes a new template under `key` with the given collector-assigned
    /// id.
    ///
    /// Template ids below 256 are reserved; the record is rejected with a
    /// warning and `None`.
    pub fn add(
        &self,
        key: TemplateKey,
        definition: &TemplateDefinition,
        kind: TemplateKind,
        assigned_id: u16,
    ) -> Option<Arc<Template>> {
        if key.template_id < MIN_DATA_SET_ID {
            warn!(
                "[{}] {} id {} is reserved and not valid for data sets",
                key.odid,
                kind.label(),
                key.template_id
            );
            return None;
        }

        let template = Arc::new(Template::new(kind, definition, assigned_id));
        let evicted = {
            let mut inner = self.inner.write();
            self.insert(&mut inner, key, template.clone())
        };
        if let Some((evicted_key, evicted_kind)) = evicted {
            self.hooks.trigger(&TemplateEvent::Evicted {
                key: evicted_key,
                kind: evicted_kind,
            });
        }
        self.metrics.record_add();
        self.hooks.trigger(&TemplateEvent::Learned {
            key,
            assigned_id,
            kind,
        });
        Some(template)
    }

    /// Re-announces a template: a withdrawal and an add in one atomic step.
    ///
    /// When the layout is unchanged the published object (and its assigned
    /// id) is kept and only refreshed. When the layout differs, `fresh_id`
    /// must mint a replacement id; the superseded object stays alive for
    /// in-flight messages but no new data resolves against it. `fresh_id`
    /// returning `None` (id space exhausted) aborts the update.
    pub fn update(
        &self,
        key: TemplateKey,
        definition: &TemplateDefinition,
        kind: TemplateKind,
        fresh_id: impl FnOnce() -> Option<u16>,
    ) -> Option<Arc<Template>> {
        let mut inner = self.inner.write();
        let existing = inner.templates.peek(&key).cloned();
        match existing {
            Some(current) if current.kind() == kind && current.layout_matches(definition) => {
                drop(inner);
                self.metrics.record_refresh();
                self.hooks.trigger(&TemplateEvent::Refreshed {
                    key,
                    assigned_id: current.assigned_id(),
                    kind,
                });
                Some(current)
            }
            Some(current) => {
                let new_id = fresh_id()?;
                let replacement = Arc::new(Template::new(kind, definition, new_id));
                let evicted = self.insert(&mut inner, key, replacement.clone());
                drop(inner);
                if let Some((evicted_key, evicted_kind)) = evicted {
                    self.hooks.trigger(&TemplateEvent::Evicted {
                        key: evicted_key,
                        kind: evicted_kind,
                    });
                }
                self.metrics.record_supersede();
                self.hooks.trigger(&TemplateEvent::Superseded {
                    key,
                    old_assigned_id: current.assigned_id(),
                    new_assigned_id: new_id,
                    kind,
                });
                Some(replacement)
            }
            None => {
                drop(inner);
                self.add(key, definition, kind, fresh_id()?)
            }
        }
    }

    /// Removes the dictionary's reference to `key`.
    ///
    /// The template object survives until the last in-flight message that
    /// holds it is released.
    pub fn withdraw(&self, key: &TemplateKey) -> WithdrawOutcome {
        let removed = self.inner.write().templates.pop(key);
        match removed {
            Some(template) => {
                self.metrics.record_withdrawal();
                self.hooks.trigger(&TemplateEvent::Withdrawn {
                    key: *key,
                    kind: template.kind(),
                });
                WithdrawOutcome::Removed
            }
            None => WithdrawOutcome::Unknown,
        }
    }

    /// Notes a scope as live. Returns false when it was already registered.
    pub fn register_source(&self, scope: SourceScope) -> bool {
        self.inner.write().scopes.insert(scope)
    }

    /// Drops a scope and withdraws every template published under it.
    ///
    /// Returns the number of templates withdrawn.
    pub fn unregister_source(&self, scope: SourceScope) -> usize {
        let mut inner = self.inner.write();
        inner.scopes.remove(&scope);

        let keys: Vec<TemplateKey> = inner
            .templates
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| key.scope() == scope)
            .collect();

        let mut withdrawn = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(template) = inner.templates.pop(&key) {
                withdrawn.push((key, template.kind()));
            }
        }
        drop(inner);

        for &(key, kind) in &withdrawn {
            self.metrics.record_withdrawal();
            self.hooks.trigger(&TemplateEvent::Withdrawn { key, kind });
        }
        withdrawn.len()
    }

    /// Removes every template of a UDP scope that has outlived `policy`.
    ///
    /// `message_counter` is the scope's current message count, used for the
    /// packet-based half of the policy. Returns the number of templates
    /// reaped.
    pub fn reap_udp(
        &self,
        scope: SourceScope,
        message_counter: u64,
        policy: &UdpTemplatePolicy,
    ) -> usize {
        let mut inner = self.inner.write();
        let expired: Vec<TemplateKey> = inner
            .templates
            .iter()
            .filter(|(key, template)| {
                key.scope() == scope && policy.is_expired(template, message_counter)
            })
            .map(|(key, _)| *key)
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(template) = inner.templates.pop(&key) {
                reaped.push((key, template.kind()));
            }
        }
        drop(inner);

        for &(key, kind) in &reaped {
            info!(
                "[{}] {} id {} expired; removing it",
                key.odid,
                kind.label(),
                key.template_id
            );
            self.metrics.record_expiration();
            self.hooks.trigger(&TemplateEvent::Expired { key, kind });
        }
        reaped.len()
    }

    /// Number of templates currently published.
    pub fn len(&self) -> usize {
        self.inner.read().templates.len()
    }

    /// True when no template is published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the backstop.
    pub fn capacity(&self) -> usize {
        self.inner.read().templates.cap().get()
    }

    /// Exporter-local ids currently published under a scope, sorted.
    pub fn template_ids(&self, scope: SourceScope) -> Vec<u16> {
        let inner = self.inner.read();
        let mut ids: Vec<u16> = inner
            .templates
            .iter()
            .filter(|(key, _)| key.scope() == scope)
            .map(|(key, _)| key.template_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Utilization and activity counters.
    pub fn stats(&self) -> DictionaryStats {
        DictionaryStats {
            current_size: self.len(),
            capacity: self.capacity(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Inserts under the write lock; the returned eviction (if any) is for
    /// the caller to report once the lock is released, since hooks may read
    /// the dictionary.
    fn insert(
        &self,
        inner: &mut DictionaryInner,
        key: TemplateKey,
        template: Arc<Template>,
    ) -> Option<(TemplateKey, TemplateKind)> {
        let (evicted_key, evicted) = inner.templates.push(key, template)?;
        // push returns the displaced same-key value on replacement and the
        // LRU victim when the backstop is full; only the latter is an
        // eviction.
        if evicted_key == key {
            return None;
        }
        warn!(
            "[{}] template dictionary full; evicting {} id {} (assigned id {})",
            evicted_key.odid,
            evicted.kind().label(),
            evicted_key.template_id,
            evicted.assigned_id()
        );
        self.metrics.record_eviction();
        Some((evicted_key, evicted.kind()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FieldSpec;
    use crate::source::SourceKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key(template_id: u16) -> TemplateKey {
        TemplateKey {
            source: SourceKey(0xfeed),
            odid: 1,
            template_id,
        }
    }

    fn definition(template_id: u16, lengths: &[u16]) -> TemplateDefinition {
        TemplateDefinition {
            template_id,
            scope_field_count: 0,
            fields: lengths
                .iter()
                .enumerate()
                .map(|(i, &length)| FieldSpec {
                    element_id: i as u16 + 1,
                    length,
                    enterprise_id: 0,
                })
                .collect(),
            offset: 0,
        }
    }

    #[test]
    fn add_then_get_round_trips() {
        let dictionary = TemplateDictionary::default();
        let def = definition(256, &[4, 2]);

        let added = dictionary
            .add(key(256), &def, TemplateKind::Data, 256)
            .unwrap();
        assert_eq!(added.assigned_id(), 256);
        assert_eq!(added.original_id(), 256);

        let found = dictionary.get(&key(256)).unwrap();
        assert!(Arc::ptr_eq(&added, &found));
        assert_eq!(dictionary.len(), 1);
    }

    #[test]
    fn reserved_ids_are_rejected() {
        let dictionary = TemplateDictionary::default();
        let def = definition(100, &[4]);

        assert!(
            dictionary
                .add(key(100), &def, TemplateKind::Data, 256)
                .is_none()
        );
        assert!(dictionary.is_empty());
    }

    #[test]
    fn unchanged_re_add_is_a_refresh() {
        let dictionary = TemplateDictionary::default();
        let def = definition(256, &[4, 2]);

        let first = dictionary
            .add(key(256), &def, TemplateKind::Data, 256)
            .unwrap();
        let second = dictionary
            .update(key(256), &def, TemplateKind::Data, || {
                panic!("unchanged layout must not mint an id")
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dictionary.len(), 1);
        assert_eq!(dictionary.stats().metrics.refreshes, 1);
    }

    #[test]
    fn changed_layout_supersedes_but_keeps_the_old_object_alive() {
        let dictionary = TemplateDictionary::default();

        let old = dictionary
            .add(key(256), &definition(256, &[4, 2]), TemplateKind::Data, 256)
            .unwrap();
        let new = dictionary
            .update(key(256), &definition(256, &[8]), TemplateKind::Data, || {
                Some(257)
            })
            .unwrap();

        assert_eq!(new.assigned_id(), 257);
        assert_eq!(dictionary.len(), 1);
        // The in-flight reference keeps the superseded object valid.
        assert_eq!(old.assigned_id(), 256);
        assert_eq!(Arc::strong_count(&old), 1);
        assert_eq!(dictionary.stats().metrics.supersedes, 1);
    }

    #[test]
    fn withdraw_removes_the_dictionary_slot_only() {
        let dictionary = TemplateDictionary::default();
        let template = dictionary
            .add(key(256), &definition(256, &[4]), TemplateKind::Data, 256)
            .unwrap();

        assert_eq!(dictionary.withdraw(&key(256)), WithdrawOutcome::Removed);
        assert!(dictionary.is_empty());
        // Outstanding handle still works; the object is freed when it drops.
        assert_eq!(template.assigned_id(), 256);
        assert_eq!(Arc::strong_count(&template), 1);

        assert_eq!(dictionary.withdraw(&key(256)), WithdrawOutcome::Unknown);
    }

    #[test]
    fn unregister_source_withdraws_the_whole_scope() {
        let dictionary = TemplateDictionary::default();
        let scope = key(256).scope();
        let foreign = TemplateKey {
            source: SourceKey(0xbeef),
            odid: 1,
            template_id: 256,
        };

        dictionary.register_source(scope);
        dictionary.add(key(256), &definition(256, &[4]), TemplateKind::Data, 256);
        dictionary.add(key(257), &definition(257, &[2]), TemplateKind::Options, 257);
        dictionary.add(foreign, &definition(256, &[4]), TemplateKind::Data, 256);

        assert_eq!(dictionary.unregister_source(scope), 2);
        assert_eq!(dictionary.len(), 1);
        assert!(dictionary.get(&foreign).is_some());
        assert_eq!(dictionary.template_ids(scope), Vec::<u16>::new());
    }

    #[test]
    fn capacity_backstop_evicts_like_a_withdrawal() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let seen = evictions.clone();
        let mut hooks = TemplateHooks::new();
        hooks.register(move |event| {
            if matches!(event, TemplateEvent::Evicted { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let dictionary = TemplateDictionary::new(NonZeroUsize::new(2).unwrap(), hooks);
        dictionary.add(key(256), &definition(256, &[4]), TemplateKind::Data, 256);
        dictionary.add(key(257), &definition(257, &[4]), TemplateKind::Data, 257);
        dictionary.add(key(258), &definition(258, &[4]), TemplateKind::Data, 258);

        assert_eq!(dictionary.len(), 2);
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert_eq!(dictionary.stats().metrics.evictions, 1);
        assert!(dictionary.get(&key(256)).is_none());
    }

    #[test]
    fn reap_udp_removes_only_expired_templates_of_the_scope() {
        let dictionary = TemplateDictionary::default();
        let policy = UdpTemplatePolicy::new(Duration::from_secs(3600), 5);

        let stale = dictionary
            .add(key(256), &definition(256, &[4]), TemplateKind::Data, 256)
            .unwrap();
        stale.touch(1);
        let fresh = dictionary
            .add(key(257), &definition(257, &[4]), TemplateKind::Data, 257)
            .unwrap();
        fresh.touch(9);

        assert_eq!(dictionary.reap_udp(key(256).scope(), 10, &policy), 1);
        assert!(dictionary.get(&key(256)).is_none());
        assert!(dictionary.get(&key(257)).is_some());
        assert_eq!(dictionary.stats().metrics.expirations, 1);
    }

    #[test]
    fn metrics_count_hits_and_misses() {
        let dictionary = TemplateDictionary::default();
        dictionary.add(key(256), &definition(256, &[4]), TemplateKind::Data, 256);

        dictionary.get(&key(256));
        dictionary.get(&key(999));
        dictionary.resolve(&key(999));

        let metrics = dictionary.stats().metrics;
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 2);
    }
}
