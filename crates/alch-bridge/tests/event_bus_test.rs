use alch_bridge::{Event, EventBus, EventKind, ORCHESTRATOR_ID};

#[test]
fn fan_out_reaches_every_subscriber() {
    let bus = EventBus::new();
    let receivers: Vec<_> = (0..5).map(|_| bus.subscribe()).collect();

    bus.publish(
        Event::orchestrator(EventKind::Ready).with_text("Plan ready. 4 agent tasks queued."),
    );
    bus.publish(Event::agent("backend-t1", EventKind::Done).with_text("Agent completed"));

    for rx in receivers {
        let first = rx.recv().unwrap();
        assert_eq!(first.agent_id, ORCHESTRATOR_ID);
        assert_eq!(first.kind, EventKind::Ready);

        let second = rx.recv().unwrap();
        assert_eq!(second.agent_id, "backend-t1");
        assert_eq!(second.kind, EventKind::Done);
    }
}

#[test]
fn wire_shape_matches_the_event_contract() {
    let bus = EventBus::new();
    let rx = bus.subscribe();

    bus.publish(
        Event::orchestrator(EventKind::DagExecutionDone)
            .with("completed", vec!["t1", "t2"])
            .with("failed", Vec::<String>::new())
            .with_text("DAG complete: 2 succeeded, 0 failed"),
    );

    let event = rx.recv().unwrap();
    let value = serde_json::to_value(&event).unwrap();

    // Top-level contract fields.
    assert_eq!(value["agent_id"], "orchestrator");
    assert_eq!(value["type"], "dag_execution_done");
    assert!(value["timestamp"].is_string());
    // Payload is flattened, not nested.
    assert_eq!(value["completed"][0], "t1");
    assert!(value.get("fields").is_none());
}

#[tokio::test]
async fn publish_from_concurrent_tasks() {
    let bus = EventBus::new();
    let rx = bus.subscribe();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.publish(
                    Event::agent(format!("agent-{i}"), EventKind::Output).with_text("line"),
                );
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let mut seen = 0;
    while rx.try_recv().is_ok() {
        seen += 1;
    }
    assert_eq!(seen, 10);
}
