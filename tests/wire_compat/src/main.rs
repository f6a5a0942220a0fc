fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON values so that integer-valued floats compare equal.
    ///
    /// The original hub serializes `float64(65)` as `65`, Rust serializes
    /// `f64` as `65.0`. Both are semantically identical, so numbers are
    /// compared through f64.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    serde_json::json!(f)
                } else {
                    v.clone()
                }
            }
            serde_json::Value::Object(map) => {
                let normalized: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect();
                serde_json::Value::Object(normalized)
            }
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent, float-normalized comparison).
    fn roundtrip_test<T>(name: &str)
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        let norm_fixture = normalize_value(&fixture);
        let norm_reserialized = normalize_value(&reserialized);
        assert_eq!(
            norm_fixture, norm_reserialized,
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  Rust:    {reserialized}"
        );
    }

    // --- Envelope ---

    #[test]
    fn fixture_message_envelope() {
        roundtrip_test::<fleetlink_protocol::Message>("message_envelope.json");
    }

    #[test]
    fn fixture_message_error() {
        roundtrip_test::<fleetlink_protocol::Message>("message_error.json");
    }

    // --- Agent path ---

    #[test]
    fn fixture_device_report() {
        roundtrip_test::<fleetlink_protocol::messages::DeviceReport>("device_report.json");
    }

    #[test]
    fn fixture_ping_payload() {
        roundtrip_test::<fleetlink_protocol::messages::PingPayload>("ping_payload.json");
    }

    #[test]
    fn fixture_pong_payload() {
        roundtrip_test::<fleetlink_protocol::messages::PongPayload>("pong_payload.json");
    }

    #[test]
    fn fixture_command_ack() {
        roundtrip_test::<fleetlink_protocol::messages::CommandAck>("command_ack.json");
    }

    // --- Command path ---

    #[test]
    fn fixture_command_request() {
        roundtrip_test::<fleetlink_protocol::messages::CommandRequest>("command_request.json");
    }

    #[test]
    fn fixture_command_queued_response() {
        roundtrip_test::<fleetlink_protocol::messages::CommandQueuedResponse>(
            "command_queued_response.json",
        );
    }

    #[test]
    fn fixture_command_delivery() {
        roundtrip_test::<fleetlink_protocol::messages::CommandDelivery>("command_delivery.json");
    }

    #[test]
    fn fixture_command_failed_event() {
        roundtrip_test::<fleetlink_protocol::messages::CommandFailedEvent>(
            "command_failed_event.json",
        );
    }

    // --- Observer path ---

    #[test]
    fn fixture_snapshot_response() {
        roundtrip_test::<fleetlink_protocol::messages::SnapshotResponse>("snapshot_response.json");
    }

    #[test]
    fn fixture_device_ref() {
        roundtrip_test::<fleetlink_protocol::messages::DeviceRef>("device_ref.json");
    }

    #[test]
    fn fixture_device_record() {
        roundtrip_test::<fleetlink_protocol::DeviceRecord>("device_record.json");
    }

    // --- Secondary bulk channel ---

    #[test]
    fn fixture_device_list_report() {
        roundtrip_test::<fleetlink_protocol::messages::DeviceListReport>(
            "device_list_report.json",
        );
    }

    // --- Semantics beyond shape ---

    #[test]
    fn unknown_message_type_is_tolerated() {
        // Envelopes with types this build does not know must still parse,
        // so old hubs survive new agents.
        let json = r#"{"id":"m-1","type":"hologram_sync","payload":{"x":1}}"#;
        let msg: fleetlink_protocol::Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.msg_type, fleetlink_protocol::MessageType::Unknown);
    }

    #[test]
    fn command_request_minimal_form_parses() {
        let json = r#"{"deviceId":"tablet-7","name":"lock"}"#;
        let req: fleetlink_protocol::messages::CommandRequest =
            serde_json::from_str(json).unwrap();
        assert_eq!(
            req.priority,
            fleetlink_protocol::CommandPriority::Normal
        );
        assert_eq!(req.max_attempts, 0);
    }

    #[test]
    fn device_record_offline_minimal_form_parses() {
        let json = r#"{"deviceId":"kiosk-2","status":"offline"}"#;
        let rec: fleetlink_protocol::DeviceRecord = serde_json::from_str(json).unwrap();
        assert!(rec.name.is_empty());
        assert!(rec.last_seen.is_none());
        assert!(rec.attributes.is_null());
    }
}
