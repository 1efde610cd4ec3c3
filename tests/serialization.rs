use ipfix_collector::codec;
use ipfix_collector::{InputInfo, Pipeline, SourceStatus, Transport, UdpTemplatePolicy};

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn packet(hex_str: &str) -> Vec<u8> {
    hex::decode(hex_str).unwrap()
}

const TEMPLATE_AND_ONE_RECORD: &str = concat!(
    "000a002a000000010000000100000001",
    "00020010",
    "010000020008000400070002",
    "0100000a",
    "c0a800011f90",
);

#[test]
fn dissection_serializes_to_json() {
    let buf = packet(TEMPLATE_AND_ONE_RECORD);
    let dissection = codec::dissect(&buf).unwrap();
    let value = serde_json::to_value(&dissection).unwrap();

    assert_eq!(value["header"]["version"], 10);
    assert_eq!(value["header"]["length"], 0x2a);
    assert_eq!(value["header"]["sequence_number"], 1);
    assert_eq!(value["header"]["observation_domain_id"], 1);
    assert_eq!(value["header"]["export_time"]["secs"], 1);

    assert_eq!(
        value["template_sets"],
        json!([{ "header_offset": 16, "body": { "start": 20, "end": 32 } }])
    );
    assert_eq!(value["data_sets"][0]["set_id"], 256);
    assert_eq!(value["data_sets"][0]["body"]["start"], 36);
    assert_eq!(value["data_sets"][0]["body"]["end"], 42);
}

#[test]
fn input_info_serializes_with_transport_tag() {
    let input = InputInfo::network(Transport::Udp, "192.0.2.1".parse().unwrap(), 4739)
        .with_odid_hint(9);
    let value = serde_json::to_value(&input).unwrap();

    assert_eq!(value["transport"], "Udp");
    assert_eq!(value["origin"]["Network"]["addr"], "192.0.2.1");
    assert_eq!(value["origin"]["Network"]["port"], 4739);
    assert_eq!(value["odid_hint"], 9);
    // No per-session override; the collector default applies.
    assert!(value["udp_policy"].is_null());

    let file = InputInfo::file("/var/flows/capture.ipfix");
    let value = serde_json::to_value(&file).unwrap();
    assert_eq!(value["transport"], "File");
    assert_eq!(value["origin"]["File"]["path"], "/var/flows/capture.ipfix");
}

#[test]
fn udp_policy_serializes_its_lifetime_knobs() {
    let policy = UdpTemplatePolicy::new(Duration::from_secs(600), 25);
    let value = serde_json::to_value(&policy).unwrap();

    assert_eq!(value["template_life_time"]["secs"], 600);
    assert_eq!(value["template_life_packet"], 25);
    assert_eq!(value["options_template_life_time"]["secs"], 600);
    assert_eq!(value["options_template_life_packet"], 25);
}

#[test]
fn source_stats_serialize_for_export() {
    let pipeline = Pipeline::builder().with_ring_capacity(8).build().unwrap();
    let input = Arc::new(InputInfo::network(
        Transport::Tcp,
        "192.0.2.1".parse().unwrap(),
        4739,
    ));
    pipeline.process(
        Some(packet(TEMPLATE_AND_ONE_RECORD)),
        input,
        SourceStatus::New,
    );
    pipeline.output().try_read().unwrap();

    let stats = pipeline.source_stats();
    let value = serde_json::to_value(&stats).unwrap();

    let (scope, counters) = (&value[0][0], &value[0][1]);
    assert_eq!(scope["odid"], 1);
    assert!(scope["source"].is_u64());
    assert_eq!(counters["packets"], 1);
    assert_eq!(counters["data_records"], 1);
    assert_eq!(counters["expected_sequence"], 2);
    assert_eq!(counters["normalized_sequence"], 2);
    assert_eq!(counters["next_assigned_id"], 257);
    assert_eq!(counters["poisoned"], false);
}
