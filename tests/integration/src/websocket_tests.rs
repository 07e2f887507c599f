//! WebSocket consumers of fleet telemetry, in real time

use aerotask_bridge::{websocket, Envelope, TelemetryRecord, WsControl, WsSink, SCHEMA_VERSION};
use aerotask_core::TaskType;
use aerotask_fleet::TelemetrySink;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::test_utils::{node_config, TestFleet};

#[tokio::test]
async fn test_consumer_sees_fleet_records() {
    let listener = websocket::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sink = Arc::new(WsSink::new(64));
    let cancel = CancellationToken::new();
    let server = tokio::spawn(websocket::serve(listener, sink.clone(), cancel.clone()));

    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
    let ack = client.next().await.unwrap().unwrap();
    let ack: WsControl = serde_json::from_str(ack.to_text().unwrap()).unwrap();
    assert!(matches!(ack, WsControl::Ack { schema_version: SCHEMA_VERSION, .. }));

    let fleet = TestFleet::start_with(
        node_config(&[("uav-1", &[TaskType::Survey]), ("uav-2", &[TaskType::Survey])]),
        vec![sink.clone() as Arc<dyn TelemetrySink>],
    );

    let mut positions = std::collections::HashSet::new();
    let mut saw_status = false;
    timeout(Duration::from_secs(5), async {
        while positions.len() < 2 || !saw_status {
            let msg = client.next().await.unwrap().unwrap();
            let envelope: Envelope = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            assert_eq!(envelope.schema_version, SCHEMA_VERSION);
            match envelope.record {
                TelemetryRecord::Position(p) => {
                    positions.insert(p.entity_id);
                }
                TelemetryRecord::Status(s) => {
                    assert!(s.entity_id.starts_with("uav-"));
                    saw_status = true;
                }
            }
        }
    })
    .await
    .expect("records for both vehicles");

    fleet.runtime.shutdown().await;
    cancel.cancel();
    server.await.unwrap();
}
