//! The typed view of a preprocessed IPFIX message handed downstream.
//!
//! A [`Message`] owns the packet buffer from the moment the preprocessor
//! accepts it. Everything else is an index into that buffer: set positions,
//! data couples and the dense per-record metadata all carry byte ranges, so
//! downstream stages read record bytes without any copy. Template references
//! are `Arc` handles acquired from the dictionary; dropping the message is
//! the release that lets withdrawn templates reach the end of their life.

use std::ops::Range;
use std::sync::Arc;

use crate::codec::{MessageHeader, SetView};
use crate::input::{InputInfo, SourceStatus};
use crate::template::Template;

/// One data set paired with the template its records were resolved against.
///
/// `template == None` means the template was unknown when the message passed
/// the preprocessor; the set travels downstream unparsed and is skipped
/// there.
#[derive(Debug)]
pub struct DataCouple {
    /// Set id as the exporter sent it (before rewriting)
    pub original_set_id: u16,
    /// Offset of the set header within the buffer
    pub header_offset: usize,
    /// Byte range of the set body
    pub body: Range<usize>,
    /// Resolved template, holding one dictionary reference
    pub template: Option<Arc<Template>>,
}

/// Position of one data record, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    /// Byte range of the record within the buffer
    pub range: Range<usize>,
    /// Index of the owning couple in [`Message::data_couples`]
    pub couple: usize,
}

/// Borrowed view of one data record.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    /// The record's bytes
    pub bytes: &'a [u8],
    /// Template describing the record layout
    pub template: &'a Arc<Template>,
}

/// An owned, preprocessed IPFIX message. See the [module docs](self).
#[derive(Debug)]
pub struct Message {
    pub(crate) buf: Vec<u8>,
    pub(crate) header: Option<MessageHeader>,
    pub(crate) template_sets: Vec<SetView>,
    pub(crate) options_template_sets: Vec<SetView>,
    pub(crate) data_couples: Vec<DataCouple>,
    pub(crate) metadata: Vec<RecordMeta>,
    pub(crate) input: Arc<InputInfo>,
    pub(crate) status: SourceStatus,
    pub(crate) template_records: u32,
    pub(crate) options_template_records: u32,
}

impl Message {
    /// The close marker delivered when a source ends: no buffer, no records,
    /// just the input description and the closed status.
    pub(crate) fn closed(input: Arc<InputInfo>) -> Self {
        Self {
            buf: Vec::new(),
            header: None,
            template_sets: Vec::new(),
            options_template_sets: Vec::new(),
            data_couples: Vec::new(),
            metadata: Vec::new(),
            input,
            status: SourceStatus::Closed,
            template_records: 0,
            options_template_records: 0,
        }
    }

    /// True for the close marker of an ended source.
    pub fn is_source_closed(&self) -> bool {
        self.status == SourceStatus::Closed
    }

    /// Parsed message header; `None` only for the close marker.
    pub fn header(&self) -> Option<&MessageHeader> {
        self.header.as_ref()
    }

    /// The raw message bytes, with template ids, data set ids and the
    /// sequence number already rewritten to collector-unique values.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Description of the session this message arrived over.
    pub fn input(&self) -> &Arc<InputInfo> {
        &self.input
    }

    /// Session state at the time of this message.
    pub fn status(&self) -> SourceStatus {
        self.status
    }

    /// Template sets of the message, in wire order.
    pub fn template_sets(&self) -> &[SetView] {
        &self.template_sets
    }

    /// Options template sets of the message, in wire order.
    pub fn options_template_sets(&self) -> &[SetView] {
        &self.options_template_sets
    }

    /// Data sets paired with their resolved templates, in wire order.
    pub fn data_couples(&self) -> &[DataCouple] {
        &self.data_couples
    }

    /// Per-record metadata, one entry per data record in wire order.
    pub fn metadata(&self) -> &[RecordMeta] {
        &self.metadata
    }

    /// Number of data records carried by this message.
    pub fn data_record_count(&self) -> usize {
        self.metadata.len()
    }

    /// Number of template records processed from this message.
    pub fn template_record_count(&self) -> u32 {
        self.template_records
    }

    /// Number of options template records processed from this message.
    pub fn options_template_record_count(&self) -> u32 {
        self.options_template_records
    }

    /// Bytes of one set body.
    pub fn set_bytes(&self, set: &SetView) -> &[u8] {
        &self.buf[set.body.clone()]
    }

    /// Bytes of the data record at `index`, in wire order.
    pub fn record_bytes(&self, index: usize) -> &[u8] {
        &self.buf[self.metadata[index].range.clone()]
    }

    /// Iterates over all data records with their templates, in wire order.
    pub fn records(&self) -> impl Iterator<Item = RecordView<'_>> {
        self.metadata.iter().filter_map(move |meta| {
            let couple = &self.data_couples[meta.couple];
            couple.template.as_ref().map(|template| RecordView {
                bytes: &self.buf[meta.range.clone()],
                template,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_marker_carries_only_the_input() {
        let input = Arc::new(InputInfo::file("flows.ipfix").with_odid_hint(7));
        let message = Message::closed(input.clone());

        assert!(message.is_source_closed());
        assert!(message.header().is_none());
        assert!(message.bytes().is_empty());
        assert_eq!(message.data_record_count(), 0);
        assert_eq!(message.input().odid_hint, 7);
        assert!(Arc::ptr_eq(message.input(), &input));
    }
}
