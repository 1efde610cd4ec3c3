#[cfg(test)]
mod base_tests {

    use crate::{InputInfo, Message, Pipeline, SourceStatus, Transport};

    use std::sync::Arc;

    fn pipeline() -> Pipeline {
        // Surfaces the pipeline's warnings under `cargo test` when RUST_LOG
        // is set.
        let _ = env_logger::builder().is_test(true).try_init();
        Pipeline::builder()
            .with_ring_capacity(16)
            .build()
            .unwrap()
    }

    fn tcp_input() -> Arc<InputInfo> {
        Arc::new(InputInfo::network(
            Transport::Tcp,
            "192.0.2.1".parse().unwrap(),
            4739,
        ))
    }

    fn udp_input() -> Arc<InputInfo> {
        Arc::new(InputInfo::network(
            Transport::Udp,
            "192.0.2.1".parse().unwrap(),
            4739,
        ))
    }

    fn packet(hex_str: &str) -> Vec<u8> {
        hex::decode(hex_str).unwrap()
    }

    // Template 256 (sourceIPv4Address/4, destinationTransportPort/2) plus one
    // data record, exporter sequence 1.
    const TEMPLATE_AND_ONE_RECORD: &str = concat!(
        "000a002a000000010000000100000001",
        "00020010",
        "010000020008000400070002",
        "0100000a",
        "c0a800011f90",
    );

    fn read(pipeline: &Pipeline) -> Message {
        pipeline.output().try_read().expect("a message was enqueued")
    }

    #[test]
    fn single_template_and_data_record_over_tcp() {
        let pipeline = pipeline();
        pipeline.process(
            Some(packet(TEMPLATE_AND_ONE_RECORD)),
            tcp_input(),
            SourceStatus::New,
        );

        let message = read(&pipeline);
        // First allocation for the scope mints 256.
        let couple = &message.data_couples()[0];
        let template = couple.template.as_ref().unwrap();
        assert_eq!(template.assigned_id(), 256);
        assert_eq!(template.original_id(), 256);

        // The rewritten ids and sequence are visible in the raw bytes.
        assert_eq!(&message.bytes()[20..22], &[0x01, 0x00]);
        assert_eq!(&message.bytes()[8..12], &[0, 0, 0, 1]);
        assert_eq!(message.header().unwrap().sequence_number, 1);

        assert_eq!(message.template_record_count(), 1);
        assert_eq!(message.data_record_count(), 1);
        assert_eq!(message.record_bytes(0).len(), 6);
        assert_eq!(
            message.record_bytes(0),
            [0xc0, 0xa8, 0x00, 0x01, 0x1f, 0x90]
        );

        assert_eq!(pipeline.dictionary().len(), 1);
    }

    #[test]
    fn sequence_gap_is_rebased() {
        let pipeline = pipeline();
        let input = tcp_input();
        pipeline.process(
            Some(packet(TEMPLATE_AND_ONE_RECORD)),
            input.clone(),
            SourceStatus::New,
        );
        let first = read(&pipeline);
        assert_eq!(first.header().unwrap().sequence_number, 1);

        // The exporter jumps from 2 to 5 and sends two records.
        let jumped = concat!(
            "000a0020000000020000000500000001",
            "01000010",
            "c0a800011f90",
            "c0a800021f91",
        );
        pipeline.process(Some(packet(jumped)), input, SourceStatus::Opened);

        let second = read(&pipeline);
        assert_eq!(second.header().unwrap().sequence_number, 5);
        assert_eq!(second.data_record_count(), 2);

        let (_, counters) = pipeline.source_stats().pop().unwrap();
        assert_eq!(counters.normalized_sequence, 7);
        assert_eq!(counters.expected_sequence, 7);
    }

    #[test]
    fn tcp_withdrawal_detaches_subsequent_data() {
        let pipeline = pipeline();
        let input = tcp_input();
        pipeline.process(
            Some(packet(TEMPLATE_AND_ONE_RECORD)),
            input.clone(),
            SourceStatus::New,
        );
        let first = read(&pipeline);

        // Withdrawal record for template 256.
        let withdrawal = concat!(
            "000a0018000000030000000200000001",
            "00020008",
            "01000000",
        );
        pipeline.process(Some(packet(withdrawal)), input.clone(), SourceStatus::Opened);
        read(&pipeline);

        assert!(pipeline.dictionary().is_empty());
        // The in-flight message keeps its reference until released.
        assert!(first.data_couples()[0].template.is_some());
        drop(first);

        // Data for the withdrawn template travels with a null template.
        let orphan = concat!(
            "000a001a000000040000000200000001",
            "0100000a",
            "c0a800011f90",
        );
        pipeline.process(Some(packet(orphan)), input, SourceStatus::Opened);

        let third = read(&pipeline);
        assert_eq!(third.data_couples().len(), 1);
        assert!(third.data_couples()[0].template.is_none());
        assert_eq!(third.data_record_count(), 0);
    }

    #[test]
    fn udp_withdrawal_is_ignored() {
        let pipeline = pipeline();
        let input = udp_input();
        pipeline.process(
            Some(packet(TEMPLATE_AND_ONE_RECORD)),
            input.clone(),
            SourceStatus::New,
        );
        read(&pipeline);
        assert_eq!(pipeline.dictionary().len(), 1);

        let withdrawal = concat!(
            "000a0018000000030000000200000001",
            "00020008",
            "01000000",
        );
        pipeline.process(Some(packet(withdrawal)), input, SourceStatus::Opened);
        read(&pipeline);

        // Dictionary unchanged: withdrawal over UDP is a protocol violation.
        assert_eq!(pipeline.dictionary().len(), 1);
    }

    #[test]
    fn reserved_template_id_is_rejected() {
        let pipeline = pipeline();

        // Template record with reserved id 100 and one field.
        let reserved = concat!(
            "000a001c000000010000000000000001",
            "0002000c",
            "00640001",
            "00080004",
        );
        pipeline.process(Some(packet(reserved)), tcp_input(), SourceStatus::New);

        let message = read(&pipeline);
        assert_eq!(message.template_record_count(), 0);
        assert!(pipeline.dictionary().is_empty());
    }

    #[test]
    fn closed_source_restarts_template_allocation() {
        let pipeline = pipeline();
        let input = tcp_input();
        pipeline.process(
            Some(packet(TEMPLATE_AND_ONE_RECORD)),
            input.clone(),
            SourceStatus::New,
        );
        read(&pipeline);
        assert_eq!(pipeline.sources().len(), 1);

        let close_input = Arc::new(
            InputInfo::network(Transport::Tcp, "192.0.2.1".parse().unwrap(), 4739)
                .with_odid_hint(1),
        );
        pipeline.process(None, close_input, SourceStatus::Closed);

        let marker = read(&pipeline);
        assert!(marker.is_source_closed());
        assert!(marker.header().is_none());
        assert!(pipeline.sources().is_empty());
        assert!(pipeline.dictionary().is_empty());

        // The same endpoint comes back as a new source; allocation restarts
        // at 256.
        pipeline.process(
            Some(packet(TEMPLATE_AND_ONE_RECORD)),
            input,
            SourceStatus::New,
        );
        let reopened = read(&pipeline);
        let template = reopened.data_couples()[0].template.as_ref().unwrap();
        assert_eq!(template.assigned_id(), 256);
    }

    #[test]
    fn exporter_ids_never_leak_downstream() {
        let pipeline = pipeline();
        let input = tcp_input();

        // Exporter uses template id 999 (0x03e7).
        let foreign_id = concat!(
            "000a002a000000010000000000000001",
            "00020010",
            "03e700020008000400070002",
            "0100000a",
            "c0a800011f90",
        );
        let mut buf = packet(foreign_id);
        // Point the data set at the exporter's id too.
        buf[32] = 0x03;
        buf[33] = 0xe7;
        pipeline.process(Some(buf), input, SourceStatus::New);

        let message = read(&pipeline);
        let template = message.data_couples()[0].template.as_ref().unwrap();
        assert_eq!(template.original_id(), 999);
        assert_eq!(template.assigned_id(), 256);
        // Both the template record and the data set id were rewritten.
        assert_eq!(&message.bytes()[20..22], &[0x01, 0x00]);
        assert_eq!(&message.bytes()[32..34], &[0x01, 0x00]);
    }

    #[test]
    fn empty_packet_is_discarded_with_no_output() {
        let pipeline = pipeline();
        pipeline.process(None, tcp_input(), SourceStatus::Opened);
        assert!(pipeline.output().try_read().is_none());
    }

    #[test]
    fn malformed_messages_do_not_advance_sequence_state() {
        let pipeline = pipeline();
        let input = tcp_input();
        pipeline.process(
            Some(packet(TEMPLATE_AND_ONE_RECORD)),
            input.clone(),
            SourceStatus::New,
        );
        read(&pipeline);

        // Truncated: header declares more than arrived.
        let mut truncated = packet(TEMPLATE_AND_ONE_RECORD);
        truncated.truncate(30);
        pipeline.process(Some(truncated), input, SourceStatus::Opened);
        assert!(pipeline.output().try_read().is_none());

        let (_, counters) = pipeline.source_stats().pop().unwrap();
        assert_eq!(counters.packets, 1);
        assert_eq!(counters.expected_sequence, 2);
    }
}
