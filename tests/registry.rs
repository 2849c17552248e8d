mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use scene_monitor::{
    Broadcaster, Collaborators, ConnectionStatus, LinkStatus, Locator, NewStream, RegistryError,
    StreamEvent, StreamRegistry, SupervisorSettings, SystemClock,
};

const WAIT: Duration = Duration::from_secs(5);

fn registry(source: Arc<FakeSource>) -> StreamRegistry {
    let deps = collaborators(source, FakeInference::ok(), Arc::new(SystemClock));
    StreamRegistry::new(deps, fast_settings())
}

#[test]
fn added_streams_get_unique_ids_and_are_listed_in_order() {
    let registry = registry(FakeSource::endless());

    let first = registry.add_stream(NewStream::new("0")).unwrap();
    let second = registry
        .add_stream(NewStream::named("rtsp://10.0.0.4/live", "Loading bay"))
        .unwrap();
    assert_eq!(first, "cam_1");
    assert_eq!(second, "cam_2");

    let listed = registry.list_streams();
    let ids: Vec<_> = listed.iter().map(|s| s.config.id.as_str()).collect();
    assert_eq!(ids, ["cam_1", "cam_2"]);
    assert_eq!(listed[0].config.name, "Camera 1");
    assert_eq!(listed[0].config.locator, Locator::Device(0));
    assert_eq!(listed[1].config.name, "Loading bay");
    assert!(listed.iter().all(|s| s.active));

    registry.shutdown();
    assert!(registry.list_streams().is_empty());
}

#[test]
fn blank_locator_is_rejected_without_consuming_an_id() {
    let source = FakeSource::endless();
    let registry = registry(source.clone());

    let err = registry.add_stream(NewStream::new("  ")).unwrap_err();
    assert!(matches!(err, RegistryError::InvalidConfig(_)));
    assert!(registry.list_streams().is_empty());
    assert_eq!(source.opens(), 0);

    assert_eq!(registry.add_stream(NewStream::new("0")).unwrap(), "cam_1");
}

#[test]
fn removing_unknown_stream_has_no_side_effects() {
    let registry = registry(FakeSource::endless());
    registry.add_stream(NewStream::new("0")).unwrap();

    let err = registry.remove_stream("cam_9").unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(id) if id == "cam_9"));
    assert_eq!(registry.list_streams().len(), 1);
    assert!(registry.list_streams()[0].active);
}

#[test]
fn removal_stops_the_stream_and_ids_are_not_reused() {
    let source = FakeSource::endless();
    let registry = registry(source.clone());
    let id = registry.add_stream(NewStream::new("0")).unwrap();
    assert!(wait_until(WAIT, || registry
        .stream(&id)
        .map(|s| s.frames_captured > 0)
        .unwrap_or(false)));

    registry.remove_stream(&id).unwrap();
    assert_eq!(source.closes(), 1);
    assert!(matches!(
        registry.stream(&id),
        Err(RegistryError::NotFound(_))
    ));
    assert!(matches!(
        registry.remove_stream(&id),
        Err(RegistryError::NotFound(_))
    ));

    assert_eq!(registry.add_stream(NewStream::new("1")).unwrap(), "cam_2");
}

#[test]
fn request_frame_republishes_the_last_frame() {
    let registry = registry(FakeSource::frames_then_fail(1));
    assert!(matches!(
        registry.request_frame("cam_1"),
        Err(RegistryError::NotFound(_))
    ));

    let id = registry.add_stream(NewStream::new("0")).unwrap();
    assert!(wait_until(WAIT, || registry
        .stream(&id)
        .map(|s| s.status == ConnectionStatus::Disconnected && s.frames_captured == 1)
        .unwrap_or(false)));

    let sub = registry.broadcaster().subscribe();
    assert!(registry.request_frame(&id).unwrap());
    let events = collect_until(&sub, WAIT, |events| count_frames(events) >= 1);
    let frame = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::Frame(frame) => Some(frame),
            _ => None,
        })
        .expect("republished frame");
    assert_eq!(frame.stream_id, id);
    assert_eq!(frame.sequence, 1);
    assert_eq!((frame.width, frame.height), (8, 4));
}

#[test]
fn slow_subscriber_converges_on_latest_frame() {
    let source = FakeSource::frames_then_fail(20);
    let deps = collaborators(source, FakeInference::ok(), Arc::new(SystemClock));
    let broadcaster = Broadcaster::new(2);
    let deps = Collaborators {
        broadcaster: broadcaster.clone(),
        ..deps
    };
    let registry = StreamRegistry::new(deps, fast_settings());
    let slow = broadcaster.subscribe();

    let id = registry.add_stream(NewStream::new("0")).unwrap();
    assert!(wait_until(WAIT, || registry
        .stream(&id)
        .map(|s| s.frames_captured == 20 && s.status == ConnectionStatus::Disconnected)
        .unwrap_or(false)));
    registry.shutdown();

    let pending = slow.drain();
    assert_eq!(pending.len(), 2);
    match &pending[0] {
        StreamEvent::Frame(frame) => assert_eq!(frame.sequence, 20),
        other => panic!("expected newest frame, got {:?}", other),
    }
    match &pending[1] {
        StreamEvent::Status(status) => assert_eq!(status.status, LinkStatus::Reconnecting),
        other => panic!("expected reconnecting status, got {:?}", other),
    }
    assert!(broadcaster.dropped_events() >= 18);
}

#[test]
fn device_stream_end_to_end() {
    let source = FakeSource::frames_then_fail(5);
    let inference = FakeInference::ok();
    let deps = collaborators(source.clone(), inference.clone(), Arc::new(SystemClock));
    let settings = SupervisorSettings {
        analysis_interval: Duration::from_secs(3600),
        ..fast_settings()
    };
    let registry = StreamRegistry::new(deps, settings);
    let sub = registry.broadcaster().subscribe();

    let id = registry.add_stream(NewStream::new("0")).unwrap();
    let events = collect_until(&sub, WAIT, |events| {
        count_frames(events) >= 5 && count_analyses(events) >= 1
    });
    // Nothing else should arrive for this stream's frames or analyses.
    std::thread::sleep(Duration::from_millis(100));
    let events: Vec<_> = events.into_iter().chain(sub.drain()).collect();
    registry.shutdown();

    assert_eq!(source.locators()[0], Locator::Device(0));
    assert_eq!(count_frames(&events), 5);
    assert_eq!(count_analyses(&events), 1);
    assert_eq!(inference.calls(), 1);

    let first_frame = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Frame(_)))
        .unwrap();
    let analysis = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Analysis(_)))
        .unwrap();
    assert!(analysis > first_frame);
    assert!(events.iter().all(|e| e.stream_id() == id));

    let sequences: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Frame(f) => Some(f.sequence),
            _ => None,
        })
        .collect();
    assert_eq!(sequences, [1, 2, 3, 4, 5]);
}
