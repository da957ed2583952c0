use lingerprobe::{EngineBuilder, Event, Recorder, Role};

use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn has(events: &[(Role, Event)], role: Role, matches: impl Fn(&Event) -> bool) -> bool {
    events.iter().any(|(r, e)| *r == role && matches(e))
}

#[test]
fn test_client_connects_and_server_accepts_it() {
    let recorder = Recorder::new();
    let handle = EngineBuilder::new()
        .client_tick(Duration::from_millis(20))
        .message_limit(0)
        .observer(recorder.clone())
        .build()
        .start()
        .unwrap();

    assert!(handle.wait_for_server(TIMEOUT).is_some());
    assert!(recorder.wait_until(TIMEOUT, |events| {
        has(events, Role::Server, |e| matches!(e, Event::Accepted { .. }))
            && has(events, Role::Client, |e| matches!(e, Event::Connected { .. }))
    }));

    let events = recorder.events();
    let peer = events.iter().find_map(|(_, e)| match e {
        Event::Accepted { peer, .. } => *peer,
        _ => None,
    });
    let local = events.iter().find_map(|(_, e)| match e {
        Event::Connected { local, .. } => *local,
        _ => None,
    });
    assert!(peer.is_some());
    assert_eq!(peer, local);

    handle.stop();
    let report = handle.join();

    assert!(report.is_success(), "{report:?}");
    assert!(report.contexts.is_balanced(), "{:?}", report.contexts);
}

#[test]
fn test_three_messages_reconstruct_the_stream() {
    let recorder = Recorder::new();
    let handle = EngineBuilder::new()
        .client_tick(Duration::from_millis(10))
        .message_limit(3)
        .observer(recorder.clone())
        .build()
        .start()
        .unwrap();

    let expected = b"MSG 0MSG 1MSG 2";
    assert!(recorder.wait_until(TIMEOUT, |events| received_len(events) >= expected.len()));

    // No fourth message follows.
    std::thread::sleep(Duration::from_millis(100));

    handle.stop();
    let report = handle.join();

    assert_eq!(recorder.received(), expected);
    assert!(report.is_success(), "{report:?}");
    assert!(report.contexts.is_balanced(), "{:?}", report.contexts);
}

/// Server payload bytes recorded so far. `wait_until` holds the recorder
/// lock, so this works on the slice it is handed.
fn received_len(events: &[(Role, Event)]) -> usize {
    events
        .iter()
        .map(|(role, event)| match (role, event) {
            (Role::Server, Event::Received { bytes, .. }) => bytes.len(),
            _ => 0,
        })
        .sum()
}

#[test]
fn test_stop_ends_both_roles() {
    let recorder = Recorder::new();
    let handle = EngineBuilder::new()
        .client_tick(Duration::from_millis(50))
        .observer(recorder.clone())
        .build()
        .start()
        .unwrap();

    let liveness = handle.liveness();
    assert!(liveness.is_alive());
    liveness.stop();

    let report = handle.join();
    assert!(report.is_success(), "{report:?}");

    let events = recorder.events();
    for role in [Role::Server, Role::Client] {
        assert!(has(&events, role, |e| matches!(e, Event::Exited { error: None })));
    }
}

#[test]
fn test_abrupt_close_tears_the_listener_down() {
    let recorder = Recorder::new();
    let handle = EngineBuilder::new()
        .abrupt_close(true)
        .client_tick(Duration::from_millis(20))
        .observer(recorder.clone())
        .build()
        .start()
        .unwrap();

    assert!(recorder.wait_until(TIMEOUT, |events| {
        has(events, Role::Server, |e| {
            matches!(e, Event::SocketClosed { abortive: true, .. })
        })
    }));

    handle.stop();
    let report = handle.join();

    assert!(report.is_success(), "{report:?}");
    assert!(report.contexts.is_balanced(), "{:?}", report.contexts);
}
