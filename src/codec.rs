//! # Wire codec
//!
//! Validates and walks RFC 7011 IPFIX messages.
//!
//! References:
//! - <https://datatracker.ietf.org/doc/html/rfc7011>
//! - <https://www.iana.org/assignments/ipfix/ipfix.xhtml>
//!
//! The codec is allocation-light: [`dissect`] returns byte *ranges* into the
//! caller's buffer instead of copies, so the preprocessor can later rewrite
//! template ids and the header sequence number in place. Template records and
//! data records are walked lazily by [`template_records`] and
//! [`walk_data_records`].

use log::warn;
use nom::number::complete::be_u32;
use nom_derive::{Nom, Parse};
use serde::Serialize;
use std::ops::Range;
use std::time::Duration;

use crate::error::DissectError;
use crate::template::TemplateKind;

/// Version field value of every IPFIX message.
pub const IPFIX_VERSION: u16 = 10;
/// Octets in the message header.
pub const HEADER_LENGTH: usize = 16;
/// Octets in a set header.
pub const SET_HEADER_LENGTH: usize = 4;
/// Set id carrying template records.
pub const TEMPLATE_SET_ID: u16 = 2;
/// Set id carrying options template records.
pub const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
/// Smallest set id that refers to a data set (and smallest valid template id).
pub const MIN_DATA_SET_ID: u16 = 256;
/// Field length value meaning "variable length, encoded per record".
pub const VARIABLE_LENGTH: u16 = 0xFFFF;
/// Octets in a withdrawal record (template id + zero field count).
pub const WITHDRAWAL_RECORD_LENGTH: usize = 4;

/// Byte offset of the sequence number within the message header.
const SEQUENCE_NUMBER_OFFSET: usize = 8;
/// High bit of a field specifier's element id, signalling an enterprise id.
const ENTERPRISE_BIT: u16 = 0x8000;

/// The 16-octet IPFIX message header.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct MessageHeader {
    /// Always 10 for IPFIX
    pub version: u16,
    /// Total length of the message in octets, header included
    pub length: u16,
    /// Export time of the message, seconds since the UNIX epoch
    #[nom(Map = "|secs| Duration::from_secs(u64::from(secs))", Parse = "be_u32")]
    pub export_time: Duration,
    /// Running count of data records sent before this message
    pub sequence_number: u32,
    /// Observation domain the message belongs to
    pub observation_domain_id: u32,
}

/// Position of one template or options template set inside the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetView {
    /// Offset of the 4-octet set header
    pub header_offset: usize,
    /// Byte range of the set body (records + padding)
    pub body: Range<usize>,
}

/// Position of one data set inside the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataSetView {
    /// Set id as sent by the exporter; resolves to a template of that id
    pub set_id: u16,
    /// Offset of the 4-octet set header
    pub header_offset: usize,
    /// Byte range of the set body (records + padding)
    pub body: Range<usize>,
}

/// Index over one validated IPFIX message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dissection {
    /// Parsed message header
    pub header: MessageHeader,
    /// Length the header declared (trailing garbage already trimmed)
    pub declared_length: usize,
    /// Template sets in wire order
    pub template_sets: Vec<SetView>,
    /// Options template sets in wire order
    pub options_template_sets: Vec<SetView>,
    /// Data sets in wire order
    pub data_sets: Vec<DataSetView>,
}

/// One field specifier of a template record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FieldSpec {
    /// Information element id with the enterprise bit stripped
    pub element_id: u16,
    /// Field length in octets; [`VARIABLE_LENGTH`] means per-record encoding
    pub length: u16,
    /// Enterprise id, 0 for IANA-registered elements
    pub enterprise_id: u32,
}

impl FieldSpec {
    /// True when the field uses the 1/3-octet per-record length encoding.
    pub fn is_variable_length(&self) -> bool {
        self.length == VARIABLE_LENGTH
    }
}

/// A parsed (options) template record, before any id rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDefinition {
    /// Template id as sent by the exporter
    pub template_id: u16,
    /// Leading scope fields; 0 for ordinary templates
    pub scope_field_count: u16,
    /// All field specifiers, scope fields first
    pub fields: Vec<FieldSpec>,
    /// Offset of the record's template id field within the buffer
    pub offset: usize,
}

impl TemplateDefinition {
    /// Record length implied by the field list, or `None` when any field is
    /// variable-length.
    pub fn fixed_record_length(&self) -> Option<usize> {
        self.fields
            .iter()
            .map(|f| (!f.is_variable_length()).then_some(usize::from(f.length)))
            .sum()
    }
}

/// One record yielded while walking a template set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRecord {
    /// A record with field count 0, retracting the given template
    Withdrawal {
        /// Template id being withdrawn (2/3 mean "all templates")
        template_id: u16,
        /// Offset of the record within the buffer
        offset: usize,
    },
    /// An ordinary template definition
    Definition(TemplateDefinition),
}

/// Validates the message header and indexes its sets.
///
/// Returns an error only for damage that makes the whole message unusable
/// (short or mis-versioned header, buffer shorter than the declared length).
/// A buffer *longer* than the declared length is tolerated: the excess is
/// logged and trimmed. Set-level damage stops the set walk and keeps the sets
/// indexed so far.
pub fn dissect(packet: &[u8]) -> Result<Dissection, DissectError> {
    let (_, header) = MessageHeader::parse(packet).map_err(|_| DissectError::TruncatedHeader {
        available: packet.len(),
    })?;

    if header.version != IPFIX_VERSION {
        return Err(DissectError::UnsupportedVersion {
            version: header.version,
        });
    }

    let declared = usize::from(header.length);
    if declared < HEADER_LENGTH {
        return Err(DissectError::MalformedSet {
            offset: 0,
            context: format!("declared length {declared} is shorter than the message header"),
        });
    }
    if declared > packet.len() {
        return Err(DissectError::TruncatedMessage {
            declared,
            available: packet.len(),
        });
    }
    if declared < packet.len() {
        warn!(
            "[{}] {} trailing octets after the declared message length; ignoring them",
            header.observation_domain_id,
            packet.len() - declared
        );
    }

    let mut dissection = Dissection {
        header,
        declared_length: declared,
        template_sets: Vec::new(),
        options_template_sets: Vec::new(),
        data_sets: Vec::new(),
    };

    let odid = header.observation_domain_id;
    let mut offset = HEADER_LENGTH;
    while declared - offset >= SET_HEADER_LENGTH {
        let set_id = read_u16(packet, offset);
        let set_length = usize::from(read_u16(packet, offset + 2));
        if set_length < SET_HEADER_LENGTH {
            warn!(
                "[{odid}] set at offset {offset} declares {set_length} octets; stopping the set walk"
            );
            break;
        }

        let mut end = offset + set_length;
        let mut last = false;
        if end > declared {
            warn!(
                "[{odid}] set at offset {offset} overruns the message by {} octets; truncating it",
                end - declared
            );
            end = declared;
            last = true;
        }

        let body = offset + SET_HEADER_LENGTH..end;
        match set_id {
            TEMPLATE_SET_ID => dissection.template_sets.push(SetView {
                header_offset: offset,
                body,
            }),
            OPTIONS_TEMPLATE_SET_ID => dissection.options_template_sets.push(SetView {
                header_offset: offset,
                body,
            }),
            id if id >= MIN_DATA_SET_ID => dissection.data_sets.push(DataSetView {
                set_id: id,
                header_offset: offset,
                body,
            }),
            id => {
                warn!("[{odid}] set id {id} is reserved; skipping the set");
            }
        }

        if last {
            break;
        }
        offset = end;
    }

    Ok(dissection)
}

/// Walks the template records of one (options) template set.
///
/// Trailing octets shorter than a record header are padding and end the walk
/// silently. A record that overruns the set yields one `Err` and ends the
/// walk; records parsed before it remain valid.
pub fn template_records<'a>(
    packet: &'a [u8],
    set: &SetView,
    kind: TemplateKind,
) -> TemplateRecordIter<'a> {
    TemplateRecordIter {
        packet,
        end: set.body.end,
        cursor: set.body.start,
        kind,
        failed: false,
    }
}

/// Iterator over the records of a template set. See [`template_records`].
#[derive(Debug)]
pub struct TemplateRecordIter<'a> {
    packet: &'a [u8],
    end: usize,
    cursor: usize,
    kind: TemplateKind,
    failed: bool,
}

impl TemplateRecordIter<'_> {
    fn fail(
        &mut self,
        offset: usize,
        context: impl Into<String>,
    ) -> Option<Result<TemplateRecord, DissectError>> {
        self.failed = true;
        Some(Err(DissectError::MalformedTemplate {
            offset,
            context: context.into(),
        }))
    }
}

impl Iterator for TemplateRecordIter<'_> {
    type Item = Result<TemplateRecord, DissectError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.end - self.cursor < WITHDRAWAL_RECORD_LENGTH {
            // Fewer than 4 remaining octets are padding.
            return None;
        }

        let record_start = self.cursor;
        let template_id = read_u16(self.packet, record_start);
        let field_count = read_u16(self.packet, record_start + 2);

        if field_count == 0 {
            self.cursor = record_start + WITHDRAWAL_RECORD_LENGTH;
            return Some(Ok(TemplateRecord::Withdrawal {
                template_id,
                offset: record_start,
            }));
        }

        let mut cursor = record_start + WITHDRAWAL_RECORD_LENGTH;
        let mut scope_field_count = 0;
        if self.kind == TemplateKind::Options {
            if self.end - cursor < 2 {
                return self.fail(cursor, "scope field count overruns the set");
            }
            scope_field_count = read_u16(self.packet, cursor);
            cursor += 2;
            if scope_field_count > field_count {
                return self.fail(
                    record_start,
                    format!(
                        "scope field count {scope_field_count} exceeds field count {field_count}"
                    ),
                );
            }
        }

        let mut fields = Vec::with_capacity(usize::from(field_count));
        for _ in 0..field_count {
            if self.end - cursor < 4 {
                return self.fail(cursor, "field specifier overruns the set");
            }
            let raw_element = read_u16(self.packet, cursor);
            let length = read_u16(self.packet, cursor + 2);
            cursor += 4;

            let enterprise_id = if raw_element & ENTERPRISE_BIT != 0 {
                if self.end - cursor < 4 {
                    return self.fail(cursor, "enterprise id overruns the set");
                }
                let enterprise = read_u32(self.packet, cursor);
                cursor += 4;
                enterprise
            } else {
                0
            };

            fields.push(FieldSpec {
                element_id: raw_element & !ENTERPRISE_BIT,
                length,
                enterprise_id,
            });
        }

        self.cursor = cursor;
        Some(Ok(TemplateRecord::Definition(TemplateDefinition {
            template_id,
            scope_field_count,
            fields,
            offset: record_start,
        })))
    }
}

/// Walks the records of a data set using the field layout of its template,
/// calling `visit` with the byte range of each record in wire order.
///
/// Returns the number of complete records. Trailing octets shorter than a set
/// header are padding; anything longer that does not fit a record is logged
/// and abandoned, matching the stop-at-damage rule of the template walk.
pub fn walk_data_records(
    packet: &[u8],
    body: Range<usize>,
    fields: &[FieldSpec],
    fixed_record_length: Option<usize>,
    odid: u32,
    mut visit: impl FnMut(Range<usize>),
) -> u32 {
    let mut count = 0;
    let mut cursor = body.start;
    let end = body.end;

    match fixed_record_length {
        Some(0) => {
            warn!("[{odid}] template describes zero-length records; skipping the data set");
        }
        Some(record_length) => {
            while end - cursor >= record_length {
                visit(cursor..cursor + record_length);
                cursor += record_length;
                count += 1;
            }
            if end - cursor >= SET_HEADER_LENGTH {
                warn!(
                    "[{odid}] data set leaves {} octets that do not fit a record",
                    end - cursor
                );
            }
        }
        None => {
            'records: while end - cursor >= SET_HEADER_LENGTH {
                let record_start = cursor;
                for field in fields {
                    match variable_field_span(packet, cursor, end, field) {
                        Some(advance) => cursor += advance,
                        None => {
                            warn!("[{odid}] data record overruns its set; stopping the walk");
                            break 'records;
                        }
                    }
                }
                visit(record_start..cursor);
                count += 1;
            }
        }
    }

    count
}

/// Octets one field occupies at `cursor`, honouring the 1/3-octet length
/// encoding of variable-length fields (a first octet of 255 switches to an
/// explicit 2-octet length).
fn variable_field_span(packet: &[u8], cursor: usize, end: usize, field: &FieldSpec) -> Option<usize> {
    if !field.is_variable_length() {
        let length = usize::from(field.length);
        return (end - cursor >= length).then_some(length);
    }

    if end == cursor {
        return None;
    }
    let prefix = packet[cursor];
    if prefix < 255 {
        let length = 1 + usize::from(prefix);
        (end - cursor >= length).then_some(length)
    } else {
        if end - cursor < 3 {
            return None;
        }
        let explicit = usize::from(read_u16(packet, cursor + 1));
        let length = 3 + explicit;
        (end - cursor >= length).then_some(length)
    }
}

/// Overwrites the header sequence number with the normalized value.
pub(crate) fn rewrite_sequence_number(packet: &mut [u8], sequence: u32) {
    packet[SEQUENCE_NUMBER_OFFSET..SEQUENCE_NUMBER_OFFSET + 4]
        .copy_from_slice(&sequence.to_be_bytes());
}

/// Overwrites a data set's id with the collector-assigned template id.
pub(crate) fn rewrite_set_id(packet: &mut [u8], header_offset: usize, id: u16) {
    packet[header_offset..header_offset + 2].copy_from_slice(&id.to_be_bytes());
}

/// Overwrites a template record's id with the collector-assigned id.
pub(crate) fn rewrite_template_id(packet: &mut [u8], record_offset: usize, id: u16) {
    packet[record_offset..record_offset + 2].copy_from_slice(&id.to_be_bytes());
}

fn read_u16(packet: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([packet[offset], packet[offset + 1]])
}

fn read_u32(packet: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        packet[offset],
        packet[offset + 1],
        packet[offset + 2],
        packet[offset + 3],
    ])
}
