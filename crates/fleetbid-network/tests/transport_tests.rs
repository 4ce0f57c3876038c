use fleetbid_network::{BidTransport, ConnectionHandle, ConnectionRegistry, NetworkError};
use fleetbid_protocol::{DeviceId, DeviceMetrics, RegisterParams, TaskId, WireMessage};

fn register(registry: &mut ConnectionRegistry, conn: u64, id: &str, depth: usize) -> tokio::sync::mpsc::Receiver<WireMessage> {
    let (handle, rx) = ConnectionHandle::channel(conn, format!("127.0.0.1:{}", 40000 + conn), depth);
    registry.register(
        handle,
        RegisterParams {
            device_id: DeviceId::from(id),
            has_npu: false,
            capabilities: vec!["classify".into()],
            metrics: DeviceMetrics::new(0.2, 90.0),
        },
    );
    rx
}

#[test]
fn test_send_reaches_registered_connection() {
    let mut registry = ConnectionRegistry::new();
    let mut rx = register(&mut registry, 1, "A", 4);

    let msg = WireMessage::bid_request(&TaskId::from("t1"), "classify", 5_000);
    registry.send(&DeviceId::from("A"), &msg).unwrap();

    assert_eq!(rx.try_recv().unwrap(), msg);
}

#[test]
fn test_send_to_unknown_device_fails() {
    let registry = ConnectionRegistry::new();
    let msg = WireMessage::bid_request(&TaskId::from("t1"), "classify", 5_000);
    let err = registry.send(&DeviceId::from("ghost"), &msg).unwrap_err();
    assert!(matches!(err, NetworkError::UnknownDevice(_)));
}

#[test]
fn test_send_after_writer_closed_fails() {
    let mut registry = ConnectionRegistry::new();
    let rx = register(&mut registry, 1, "A", 4);
    drop(rx);

    assert!(!registry.is_reachable(&DeviceId::from("A")));
    let msg = WireMessage::bid_request(&TaskId::from("t1"), "classify", 5_000);
    let err = registry.send(&DeviceId::from("A"), &msg).unwrap_err();
    assert!(matches!(err, NetworkError::ConnectionClosed(_)));
}

#[test]
fn test_full_queue_is_reported() {
    let mut registry = ConnectionRegistry::new();
    let _rx = register(&mut registry, 1, "A", 1);
    let msg = WireMessage::bid_request(&TaskId::from("t1"), "classify", 5_000);

    registry.send(&DeviceId::from("A"), &msg).unwrap();
    let err = registry.send(&DeviceId::from("A"), &msg).unwrap_err();
    assert!(matches!(err, NetworkError::QueueFull(_)));
}

#[test]
fn test_broadcast_skips_failures_and_continues() {
    let mut registry = ConnectionRegistry::new();
    let mut rx_a = register(&mut registry, 1, "A", 4);
    let rx_b = register(&mut registry, 2, "B", 4);
    let mut rx_c = register(&mut registry, 3, "C", 4);
    drop(rx_b);

    let msg = WireMessage::bid_request(&TaskId::from("t1"), "classify", 5_000);
    let targets = [DeviceId::from("A"), DeviceId::from("B"), DeviceId::from("C"), DeviceId::from("D")];
    let report = registry.broadcast(&targets, &msg);

    assert_eq!(report.delivered, vec![DeviceId::from("A"), DeviceId::from("C")]);
    assert_eq!(report.failed.len(), 2);
    assert!(rx_a.try_recv().is_ok());
    assert!(rx_c.try_recv().is_ok());
}

#[test]
fn test_send_follows_reconnected_device() {
    let mut registry = ConnectionRegistry::new();
    let mut old_rx = register(&mut registry, 1, "A", 4);
    let mut new_rx = register(&mut registry, 2, "A", 4);

    let msg = WireMessage::task_failed(None, "classify", "no_bids");
    registry.send(&DeviceId::from("A"), &msg).unwrap();

    assert!(new_rx.try_recv().is_ok());
    assert!(old_rx.try_recv().is_err());
}
