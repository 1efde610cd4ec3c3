//! The preprocessing stage between raw packet ingest and downstream
//! consumers.
//!
//! For every inbound event the preprocessor dissects the message, feeds
//! template sets into the dictionary, resolves data sets against it, rewrites
//! exporter-local template ids (and the data set ids referring to them) to
//! collector-unique ids *in place in the packet buffer*, repairs the header
//! sequence number, and hands the finished [`Message`] to the output ring.
//!
//! [`process`](Preprocessor::process) is entered concurrently from any number
//! of listener threads. A per-source mutex (the counters lock of the scope's
//! [`SourceState`](crate::source::SourceState)) is held across template
//! processing, sequence repair and the ring write, so messages of one
//! (source, observation domain) scope are serialized and reach the ring in
//! arrival order. No ordering is promised across scopes.

use log::{debug, info, warn};
use std::sync::Arc;

use crate::codec::{
    self, DataSetView, MIN_DATA_SET_ID, OPTIONS_TEMPLATE_SET_ID, SetView, TEMPLATE_SET_ID,
    TemplateDefinition, TemplateRecord,
};
use crate::input::{InputInfo, SourceStatus};
use crate::message::{DataCouple, Message, RecordMeta};
use crate::ring::Ring;
use crate::source::{SourceCounters, SourceKey, SourceRegistry, SourceScope};
use crate::template::dictionary::{TemplateDictionary, WithdrawOutcome};
use crate::template::expiry::UdpTemplatePolicy;
use crate::template::{TemplateKey, TemplateKind};

/// The preprocessing stage. See the [module docs](self).
#[derive(Debug)]
pub struct Preprocessor {
    dictionary: Arc<TemplateDictionary>,
    sources: Arc<SourceRegistry>,
    output: Arc<Ring<Message>>,
    default_udp_policy: UdpTemplatePolicy,
}

impl Preprocessor {
    /// Wires a preprocessor to the collector-wide state objects.
    ///
    /// `default_udp_policy` governs UDP sessions whose [`InputInfo`] does not
    /// carry its own policy.
    pub fn new(
        dictionary: Arc<TemplateDictionary>,
        sources: Arc<SourceRegistry>,
        output: Arc<Ring<Message>>,
        default_udp_policy: UdpTemplatePolicy,
    ) -> Self {
        Self {
            dictionary,
            sources,
            output,
            default_udp_policy,
        }
    }

    /// Handles one inbound event from a listener.
    ///
    /// `packet` ownership transfers here; whatever survives preprocessing
    /// reaches the ring as a [`Message`], everything else is dropped with a
    /// warning. A `Closed` status carries no packet and produces the close
    /// marker after the source's templates and counters are torn down.
    pub fn process(&self, packet: Option<Vec<u8>>, input: Arc<InputInfo>, status: SourceStatus) {
        let source = SourceKey::from_input(&input);

        if status == SourceStatus::Closed {
            self.close_source(source, input);
            return;
        }

        let Some(mut buf) = packet else {
            warn!("[{}] received an empty IPFIX message", input.odid_hint);
            return;
        };

        let dissection = match codec::dissect(&buf) {
            Ok(dissection) => dissection,
            Err(error) => {
                warn!("[{}] dropping message: {error}", input.odid_hint);
                return;
            }
        };
        let mut header = dissection.header;
        let scope = SourceScope {
            source,
            odid: header.observation_domain_id,
        };

        let state = if status == SourceStatus::New {
            if !self.dictionary.register_source(scope) {
                warn!(
                    "[{}] source was already registered in the template dictionary",
                    scope.odid
                );
            }
            self.sources.register(scope)
        } else {
            self.sources.get_or_create(scope)
        };

        // Serializes this scope up to and including the ring write.
        let mut counters = state.counters.lock();
        if counters.poisoned {
            warn!(
                "[{}] source has exhausted its template id space; dropping message",
                scope.odid
            );
            return;
        }

        counters.packets += 1;
        let message_counter = counters.packets;
        let first_message = message_counter == 1;

        let mut template_records = 0;
        for set in &dissection.template_sets {
            template_records += self.process_template_set(
                &mut buf,
                set,
                scope,
                TemplateKind::Data,
                &mut counters,
                message_counter,
                &input,
            );
        }
        let mut options_template_records = 0;
        for set in &dissection.options_template_sets {
            options_template_records += self.process_template_set(
                &mut buf,
                set,
                scope,
                TemplateKind::Options,
                &mut counters,
                message_counter,
                &input,
            );
        }

        let mut data_couples = Vec::with_capacity(dissection.data_sets.len());
        let mut metadata = Vec::new();
        let record_count = self.resolve_data_sets(
            &mut buf,
            &dissection.data_sets,
            scope,
            message_counter,
            &input,
            &mut data_couples,
            &mut metadata,
        );

        // Sequence repair: rebase the exporter's counter onto the scope's
        // normalized one, then advance both by this message's record count.
        let packet_sequence = header.sequence_number;
        if packet_sequence != counters.expected_sequence {
            if !first_message {
                warn!(
                    "[{}] sequence number error; expected {}, got {}",
                    scope.odid, counters.expected_sequence, packet_sequence
                );
            }
            counters.normalized_sequence = counters
                .normalized_sequence
                .wrapping_add(packet_sequence.wrapping_sub(counters.expected_sequence));
            counters.expected_sequence = packet_sequence;
        }
        codec::rewrite_sequence_number(&mut buf, counters.normalized_sequence);
        header.sequence_number = counters.normalized_sequence;

        counters.expected_sequence = counters.expected_sequence.wrapping_add(record_count);
        counters.normalized_sequence = counters.normalized_sequence.wrapping_add(record_count);
        counters.data_records += u64::from(record_count);

        self.enqueue(Message {
            buf,
            header: Some(header),
            template_sets: dissection.template_sets,
            options_template_sets: dissection.options_template_sets,
            data_couples,
            metadata,
            input,
            status,
            template_records,
            options_template_records,
        });
    }

    /// Tears a source down and emits its close marker.
    fn close_source(&self, source: SourceKey, input: Arc<InputInfo>) {
        let scope = SourceScope {
            source,
            odid: input.odid_hint,
        };
        let withdrawn = self.dictionary.unregister_source(scope);
        if withdrawn > 0 {
            debug!(
                "[{}] withdrew {withdrawn} templates of the closed source",
                scope.odid
            );
        }
        self.sources.remove(scope);
        self.enqueue(Message::closed(input));
    }

    /// Walks one (options) template set, learning definitions and honouring
    /// withdrawals. Returns the number of definitions processed.
    #[allow(clippy::too_many_arguments)]
    fn process_template_set(
        &self,
        buf: &mut Vec<u8>,
        set: &SetView,
        scope: SourceScope,
        kind: TemplateKind,
        counters: &mut SourceCounters,
        message_counter: u64,
        input: &InputInfo,
    ) -> u32 {
        let records: Vec<_> = codec::template_records(buf, set, kind).collect();

        let mut processed = 0;
        for record in records {
            match record {
                Err(error) => {
                    warn!(
                        "[{}] cannot parse {} set; skipping to the next set ({error})",
                        scope.odid,
                        kind.label()
                    );
                    break;
                }
                Ok(TemplateRecord::Withdrawal { template_id, .. }) => {
                    self.process_withdrawal(scope, template_id, kind, input);
                }
                Ok(TemplateRecord::Definition(definition)) => {
                    if let Some(assigned_id) = self.learn_template(
                        scope,
                        &definition,
                        kind,
                        counters,
                        message_counter,
                        input,
                    ) {
                        // Downstream stages must only ever see the
                        // collector-unique id.
                        codec::rewrite_template_id(buf, definition.offset, assigned_id);
                        processed += 1;
                    }
                }
            }
        }
        processed
    }

    /// Adds or updates one template definition, returning the
    /// collector-assigned id on success.
    fn learn_template(
        &self,
        scope: SourceScope,
        definition: &TemplateDefinition,
        kind: TemplateKind,
        counters: &mut SourceCounters,
        message_counter: u64,
        input: &InputInfo,
    ) -> Option<u16> {
        if definition.template_id < MIN_DATA_SET_ID {
            warn!(
                "[{}] {} id {} is reserved and not valid for data sets",
                scope.odid,
                kind.label(),
                definition.template_id
            );
            return None;
        }
        let key = TemplateKey {
            source: scope.source,
            odid: scope.odid,
            template_id: definition.template_id,
        };

        let template = if self.dictionary.get(&key).is_none() {
            info!(
                "[{}] new {} id {}",
                scope.odid,
                kind.label(),
                definition.template_id
            );
            let assigned_id = match counters.allocate_template_id() {
                Ok(id) => id,
                Err(_) => {
                    self.poison_source(scope, counters);
                    return None;
                }
            };
            self.dictionary.add(key, definition, kind, assigned_id)?
        } else {
            debug!(
                "[{}] {} id {} already exists; rewriting it",
                scope.odid,
                kind.label(),
                definition.template_id
            );
            let mut exhausted = false;
            let template = self
                .dictionary
                .update(key, definition, kind, || {
                    match counters.allocate_template_id() {
                        Ok(id) => Some(id),
                        Err(_) => {
                            exhausted = true;
                            None
                        }
                    }
                });
            if exhausted {
                self.poison_source(scope, counters);
            }
            template?
        };

        if input.is_udp() {
            template.touch(message_counter);
        }
        Some(template.assigned_id())
    }

    /// Handles a record with field count 0.
    fn process_withdrawal(
        &self,
        scope: SourceScope,
        template_id: u16,
        kind: TemplateKind,
        input: &InputInfo,
    ) {
        if input.is_udp() {
            // Withdrawal has no meaning without a session; RFC 7011 forbids
            // it over UDP.
            warn!(
                "[{}] received a template withdrawal over UDP; ignoring it",
                scope.odid
            );
            return;
        }
        if template_id == TEMPLATE_SET_ID || template_id == OPTIONS_TEMPLATE_SET_ID {
            warn!(
                "[{}] received an all-{}s withdrawal; not supported, ignoring it",
                scope.odid,
                kind.label()
            );
            return;
        }

        info!(
            "[{}] received a {} withdrawal for id {}",
            scope.odid,
            kind.label(),
            template_id
        );
        let key = TemplateKey {
            source: scope.source,
            odid: scope.odid,
            template_id,
        };
        if self.dictionary.withdraw(&key) == WithdrawOutcome::Unknown {
            warn!(
                "[{}] {} withdrawal received for unknown id {}",
                scope.odid,
                kind.label(),
                template_id
            );
        }
    }

    /// Pairs every data set with its template, rewrites the set ids and
    /// fills the per-record metadata. Returns the data record count.
    #[allow(clippy::too_many_arguments)]
    fn resolve_data_sets(
        &self,
        buf: &mut Vec<u8>,
        data_sets: &[DataSetView],
        scope: SourceScope,
        message_counter: u64,
        input: &InputInfo,
        couples: &mut Vec<DataCouple>,
        metadata: &mut Vec<RecordMeta>,
    ) -> u32 {
        let mut total = 0;
        for set in data_sets {
            let key = TemplateKey {
                source: scope.source,
                odid: scope.odid,
                template_id: set.set_id,
            };
            match self.dictionary.resolve(&key) {
                None => {
                    warn!(
                        "[{}] data template with id {} not found",
                        scope.odid, set.set_id
                    );
                    couples.push(DataCouple {
                        original_set_id: set.set_id,
                        header_offset: set.header_offset,
                        body: set.body.clone(),
                        template: None,
                    });
                }
                Some(template) => {
                    codec::rewrite_set_id(buf, set.header_offset, template.assigned_id());

                    // Best effort: an expired template is still better than
                    // dropping the records.
                    let policy = input
                        .udp_policy
                        .as_ref()
                        .unwrap_or(&self.default_udp_policy);
                    if input.is_udp() && policy.is_expired(&template, message_counter) {
                        warn!(
                            "[{}] data template with id {} has expired; using the old template",
                            scope.odid,
                            template.assigned_id()
                        );
                    }

                    let couple_index = couples.len();
                    total += codec::walk_data_records(
                        buf,
                        set.body.clone(),
                        template.fields(),
                        template.fixed_record_length(),
                        scope.odid,
                        |range| {
                            metadata.push(RecordMeta {
                                range,
                                couple: couple_index,
                            });
                        },
                    );
                    couples.push(DataCouple {
                        original_set_id: set.set_id,
                        header_offset: set.header_offset,
                        body: set.body.clone(),
                        template: Some(template),
                    });
                }
            }
        }
        total
    }

    /// Marks a source as out of template ids: its dictionary entries are
    /// withdrawn and all further traffic from it is dropped.
    fn poison_source(&self, scope: SourceScope, counters: &mut SourceCounters) {
        warn!(
            "[{}] no free template ids left for this source; dropping its traffic from now on",
            scope.odid
        );
        counters.poisoned = true;
        self.dictionary.unregister_source(scope);
    }

    /// Hands a finished message to the ring; a full ring drops the message
    /// and with it every template reference it acquired.
    fn enqueue(&self, message: Message) {
        let odid = message
            .header()
            .map(|header| header.observation_domain_id)
            .unwrap_or(message.input().odid_hint);
        if let Err(refused) = self.output.write(message, false) {
            warn!("[{odid}] unable to write into the output ring; skipping data");
            drop(refused);
        }
    }
}
