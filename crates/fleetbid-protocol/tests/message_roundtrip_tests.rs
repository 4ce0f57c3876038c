use fleetbid_protocol::*;
use serde_json::json;

fn sample_messages() -> Vec<InboundMessage> {
    let mut metrics = DeviceMetrics::new(0.35, 72.0);
    metrics.ram = Some(json!({ "total_mb": 7680, "used_mb": 4100 }));

    let mut bid = Bid::new(0.25, 64.0, true);
    bid.storage = Some(json!({ "free_gb": 12.5 }));
    bid.timestamp = Some(1_700_000_000);

    vec![
        InboundMessage::Register(RegisterParams {
            device_id: DeviceId::from("pixel-7"),
            has_npu: true,
            capabilities: vec!["classify".into(), "generate_story".into()],
            metrics: metrics.clone(),
        }),
        InboundMessage::Status(StatusParams {
            device_id: DeviceId::from("pixel-7"),
            metrics,
        }),
        InboundMessage::TaskSource(TaskSourceParams {
            source: DeviceId::from("camera-1"),
            payload: json!({ "image_base64": "iVBORw0KGgo=" }),
            capability: Some("classify".into()),
        }),
        InboundMessage::Bid(BidParams {
            task_id: TaskId::from("task-42"),
            device_id: DeviceId::from("pixel-7"),
            bid,
        }),
        InboundMessage::Result(ResultParams {
            device_id: DeviceId::from("pixel-7"),
            task_id: Some(TaskId::from("task-42")),
            subtask: "classify".into(),
            confidence: Some(0.875),
            data: json!({ "label": "tabby cat", "confidence": 0.875 }),
        }),
        InboundMessage::Heartbeat(HeartbeatParams {
            device_id: DeviceId::from("pixel-7"),
        }),
    ]
}

#[test]
fn test_every_device_message_survives_the_wire() {
    for original in sample_messages() {
        let bytes = original.to_wire().to_bytes().unwrap();

        let mut framer = MessageFramer::default();
        framer.extend(&bytes);
        let decoded = framer
            .next_message()
            .unwrap()
            .expect("complete frame")
            .into_inbound()
            .unwrap();

        assert_eq!(decoded, original, "{} did not round-trip", original.kind());
    }
}

#[test]
fn test_outbound_messages_decode_as_envelopes() {
    let task_id = TaskId::from("task-7");
    let outbound = [
        WireMessage::bid_request(&task_id, "classify", 5_000),
        WireMessage::task_assignment(&task_id, "classify", &json!({ "image_base64": "AA==" }), false, &DeviceId::from("A")),
        WireMessage::task_failed(Some(&task_id), "classify", "no_bids"),
    ];

    let mut framer = MessageFramer::default();
    for msg in &outbound {
        framer.extend(&msg.to_bytes().unwrap());
    }
    for msg in &outbound {
        let decoded = framer.next_message().unwrap().unwrap();
        assert_eq!(&decoded, msg);
        assert_eq!(decoded.task_id, "task-7");
    }
}
