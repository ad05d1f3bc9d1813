fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use vaultline_protocol::{FileStatus, Method};
    use vaultline_transfer::{TransferDirection, TransferEvent, TransferState};

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

    /// Normalizes JSON numbers so `65` and `65.0` compare equal.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent, float-normalized comparison).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
        parsed
    }

    // --- Chunk procedure payloads ---

    #[test]
    fn fixture_upload_chunk_request() {
        let req = roundtrip_test::<vaultline_protocol::UploadChunkRequest>(
            "upload_chunk_request.json",
        );
        assert_eq!(req.chunk_num, 5);
        assert_eq!(req.data, (0u8..16).collect::<Vec<_>>());
        assert!(req.last);
    }

    #[test]
    fn fixture_file_state_request() {
        roundtrip_test::<vaultline_protocol::FileStateRequest>("file_state_request.json");
    }

    #[test]
    fn fixture_file_state_response() {
        let resp =
            roundtrip_test::<vaultline_protocol::FileStateResponse>("file_state_response.json");
        assert_eq!(resp.status, FileStatus::Uploading);
        assert_eq!(resp.next_chunk_num(), 4);
        assert!(!resp.is_complete());
    }

    #[test]
    fn fixture_file_state_response_nothing_stored() {
        let resp = roundtrip_test::<vaultline_protocol::FileStateResponse>(
            "file_state_response_empty.json",
        );
        assert_eq!(resp.last_chunk_num, None);
        assert_eq!(resp.next_chunk_num(), 0);
    }

    #[test]
    fn fixture_file_url_response() {
        let resp = roundtrip_test::<vaultline_protocol::FileUrlResponse>("file_url_response.json");
        assert!(resp.url.starts_with("https://"));
    }

    #[test]
    fn ready_status_without_complete_flag() {
        let json = r#"{ "status": "ready", "lastChunkNum": 9 }"#;
        let resp: vaultline_protocol::FileStateResponse = serde_json::from_str(json).unwrap();
        assert!(!resp.chunks_upload_complete, "missing flag should default to false");
        assert!(resp.is_complete());
    }

    #[test]
    fn method_names() {
        let names: Vec<String> = Method::ALL
            .iter()
            .map(|m| serde_json::to_value(m).unwrap().as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["file.chunk.upload", "file.url.get", "file.state.get"]);
    }

    // --- Transfer engine records ---

    #[test]
    fn fixture_resume_marker() {
        let marker = roundtrip_test::<vaultline_transfer::ResumeMarker>("resume_marker.json");
        assert_eq!(
            marker.local_path,
            PathBuf::from("/home/user/Downloads/report.pdf")
        );
    }

    #[test]
    fn fixture_transfer_event_progress() {
        let event = roundtrip_test::<TransferEvent>("transfer_event_progress.json");
        assert!(matches!(
            event,
            TransferEvent::Progress {
                direction: TransferDirection::Download,
                processed: 1048576,
                ..
            }
        ));
    }

    #[test]
    fn fixture_transfer_event_state() {
        let event = roundtrip_test::<TransferEvent>("transfer_event_state.json");
        assert!(matches!(
            event,
            TransferEvent::StateChanged {
                direction: TransferDirection::Upload,
                state: TransferState::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn fixture_transfer_summary() {
        let summary =
            roundtrip_test::<vaultline_transfer::TransferSummary>("transfer_summary.json");
        assert_eq!(summary.resumed_from_chunk, 2);
    }
}
