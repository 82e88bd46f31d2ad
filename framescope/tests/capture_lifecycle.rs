mod common;

use assert2::check;
use common::{CapturingWriter, handshakes, thread_scopes, total_events};
use framescope::capture::{
    BackendRequest, CaptureCommand, CaptureConfig, CaptureEngine, CaptureState, CaptureStatus,
    Color, EventDescription, EventTime, ManualClock, Message, RegistrationError,
    SwitchContextDesc, SwitchContextResult, ThreadDescription, TraceBackend, scope,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn engine_with_clock(clock: &ManualClock) -> (CaptureEngine, Arc<Mutex<Vec<Message>>>) {
    let (writer, messages) = CapturingWriter::new();
    let engine = CaptureEngine::builder()
        .with_clock(clock.clone())
        .build(Box::new(writer))
        .unwrap();
    (engine, messages)
}

struct RefusingBackend(CaptureStatus);

impl TraceBackend for RefusingBackend {
    fn start(&mut self, _request: &BackendRequest) -> CaptureStatus {
        self.0
    }

    fn stop(&mut self) {}
}

#[derive(Clone, Default)]
struct RecordingBackend(Arc<Mutex<Vec<String>>>);

impl TraceBackend for RecordingBackend {
    fn start(&mut self, request: &BackendRequest) -> CaptureStatus {
        self.0
            .lock()
            .unwrap()
            .push(format!("start threads={}", request.threads.len()));
        CaptureStatus::Ok
    }

    fn stop(&mut self) {
        self.0.lock().unwrap().push("stop".into());
    }
}

#[test]
fn nested_scopes_form_one_root_with_colored_categories() {
    let clock = ManualClock::new(0);
    let (engine, messages) = engine_with_clock(&clock);
    engine.register_current_thread().unwrap();
    assert_eq!(engine.start_capture(), CaptureStatus::Ok);

    let a = EventDescription::create("lifecycle::A", file!(), line!(), Color::RED);
    let b = EventDescription::create("lifecycle::B", file!(), line!(), Color::NULL);
    {
        let _a = scope(a);
        clock.set(2);
        {
            let _b = scope(b);
            clock.set(5);
        }
        clock.set(10);
    }
    engine.next_frame();
    engine.dump_frames().unwrap();
    engine.flush_output().unwrap();

    let messages = messages.lock().unwrap();
    let scopes = thread_scopes(&messages, 0);
    check!(scopes.len() == 1);
    let scope = &scopes[0];
    check!(scope.header.event == EventTime::new(0, 10));
    check!(scope.header.board_number == 0);
    check!(scope.header.fiber_number == -1);
    let event_ids: Vec<u32> = scope.events.iter().map(|e| e.description_id).collect();
    check!(event_ids == vec![a.id(), b.id()]);
    let category_ids: Vec<u32> = scope.categories.iter().map(|e| e.description_id).collect();
    check!(category_ids == vec![a.id()]);
    check!(scope.events[1].time() == EventTime::new(2, 5));
}

#[test]
fn frame_board_precedes_scopes_and_frames_end_closes_it() {
    let clock = ManualClock::new(100);
    let (engine, messages) = engine_with_clock(&clock);
    engine.register_current_thread().unwrap();
    engine.start_capture();

    let tick = EventDescription::create("lifecycle::tick", file!(), line!(), Color::NULL);
    for _ in 0..3 {
        let _tick = scope(tick);
        clock.advance(10);
        drop(_tick);
        engine.next_frame();
    }
    engine.dump_frames().unwrap();
    engine.flush_output().unwrap();

    let messages = messages.lock().unwrap();
    let board_index = messages
        .iter()
        .position(|m| matches!(m, Message::FrameBoard(_)))
        .expect("frame board");
    let Message::FrameBoard(board) = &messages[board_index] else {
        unreachable!()
    };
    check!(board.time == EventTime::new(100, 130));
    check!(board.frames.len() == 4);
    check!(board.frames[0] == EventTime::new(100, 110));
    check!(board.threads.len() == 1);
    check!(board.frequency == 1_000_000_000);

    let first_scope = messages
        .iter()
        .position(|m| matches!(m, Message::Scope(_)))
        .unwrap();
    check!(board_index < first_scope);
    check!(matches!(messages.last(), Some(Message::FramesEnd { board_number: 0 })));
    check!(thread_scopes(&messages, 0).len() == 3);
}

#[test]
fn scope_open_across_a_dump_lands_in_the_next_board() {
    let clock = ManualClock::new(0);
    let (engine, messages) = engine_with_clock(&clock);
    engine.register_current_thread().unwrap();
    engine.start_capture();

    let long = EventDescription::create("lifecycle::long", file!(), line!(), Color::PURPLE);
    let guard = scope(long);
    clock.set(10);
    engine.next_frame();
    engine.dump_frames().unwrap();
    clock.set(15);
    drop(guard);
    clock.set(20);
    engine.next_frame();
    engine.dump_frames().unwrap();
    engine.flush_output().unwrap();

    let messages = messages.lock().unwrap();
    let scopes = thread_scopes(&messages, 0);
    check!(scopes.len() == 1);
    check!(scopes[0].header.board_number == 1);
    check!(scopes[0].header.event == EventTime::new(0, 15));
    check!(scopes[0].categories.len() == 1);
}

#[test]
fn events_survive_unregistration_until_dumped() {
    let (writer, messages) = CapturingWriter::new();
    let engine = CaptureEngine::builder().build(Box::new(writer)).unwrap();
    let description = EventDescription::here("lifecycle::survivor", Color::NULL);
    let k = 25;

    assert_eq!(engine.start_capture(), CaptureStatus::Ok);
    std::thread::scope(|s| {
        s.spawn(|| {
            engine.register_current_thread().unwrap();
            for _ in 0..k {
                let _scope = scope(description);
            }
            assert!(engine.unregister_current_thread());
            assert!(!scope(description).is_recording());
        });
    });
    check!(engine.threads().len() == 1);
    engine.next_frame();
    engine.dump_frames().unwrap();
    engine.flush_output().unwrap();

    let messages = messages.lock().unwrap();
    check!(total_events(&messages) == k);
    check!(!thread_scopes(&messages, 0).is_empty());
}

#[test]
fn second_start_reports_existing_tracer_and_keeps_buffers() {
    let clock = ManualClock::new(0);
    let (engine, messages) = engine_with_clock(&clock);
    let thread = engine.register_current_thread().unwrap();
    assert_eq!(engine.activate(true), CaptureStatus::Ok);

    let description = EventDescription::here("lifecycle::kept", Color::NULL);
    for _ in 0..5 {
        let _scope = scope(description);
        clock.advance(1);
    }
    let before = thread.storage().event_count();

    check!(engine.activate(true) == CaptureStatus::TracerAlreadyExists);
    check!(engine.state() == CaptureState::Active);
    check!(thread.storage().event_count() == before);
    check!(before == 5);

    assert_eq!(engine.activate(false), CaptureStatus::Ok);
    let messages = messages.lock().unwrap();
    check!(handshakes(&messages) == vec![CaptureStatus::Ok, CaptureStatus::TracerAlreadyExists]);
    check!(total_events(&messages) == 5);
}

#[test]
fn backend_refusal_leaves_engine_inactive() {
    let (writer, messages) = CapturingWriter::new();
    let engine = CaptureEngine::builder()
        .with_backend(RefusingBackend(CaptureStatus::TracerAccessDenied))
        .build(Box::new(writer))
        .unwrap();
    engine.register_current_thread().unwrap();

    check!(engine.activate(true) == CaptureStatus::TracerAccessDenied);
    check!(engine.state() == CaptureState::Inactive);
    check!(!engine.is_capturing());
    let description = EventDescription::here("lifecycle::refused", Color::NULL);
    check!(!scope(description).is_recording());

    engine.flush_output().unwrap();
    check!(handshakes(&messages.lock().unwrap()) == vec![CaptureStatus::TracerAccessDenied]);
}

#[test]
fn stop_is_synchronous_and_drives_backend() {
    let backend = RecordingBackend::default();
    let calls = backend.0.clone();
    let (writer, messages) = CapturingWriter::new();
    let engine = CaptureEngine::builder()
        .with_backend(backend)
        .build(Box::new(writer))
        .unwrap();
    engine.register_current_thread().unwrap();
    engine.start_capture();
    {
        let _scope = scope(EventDescription::here("lifecycle::sync_stop", Color::NULL));
    }
    check!(engine.stop_capture() == CaptureStatus::Ok);

    // No explicit flush: stop returns only after the dump has been written.
    let messages = messages.lock().unwrap();
    check!(matches!(messages.last(), Some(Message::FramesEnd { .. })));
    check!(total_events(&messages) == 1);
    check!(*calls.lock().unwrap() == vec!["start threads=1".to_string(), "stop".to_string()]);
    check!(engine.state() == CaptureState::Inactive);
    check!(engine.stop_capture() == CaptureStatus::Ok);
}

#[test]
fn switch_out_to_foreign_thread_is_kept_for_next_dump() {
    let clock = ManualClock::new(0);
    let (engine, messages) = engine_with_clock(&clock);
    engine
        .register_thread(ThreadDescription::new("t1", 1001))
        .unwrap();
    engine.start_capture();

    clock.set(5);
    let result = engine.report_switch_context(SwitchContextDesc {
        timestamp: 5,
        old_thread_id: 1001,
        new_thread_id: 2002,
        cpu_id: 3,
        reason: 1,
    });
    check!(result == SwitchContextResult::ThreadDisabled);

    clock.set(10);
    engine.next_frame();
    engine.dump_frames().unwrap();
    engine.flush_output().unwrap();

    let messages = messages.lock().unwrap();
    let records = messages
        .iter()
        .find_map(|m| match m {
            Message::Synchronization {
                thread_number: 0,
                records,
                ..
            } => Some(records.clone()),
            _ => None,
        })
        .expect("synchronization records for t1");
    check!(records.len() == 1);
    check!((records[0].start, records[0].finish) == (0, 5));
    check!(records[0].new_thread_id == 2002);
    check!(records[0].core == 3);
}

#[test]
fn switch_classification_follows_registry() {
    let (writer, _messages) = CapturingWriter::new();
    let engine = CaptureEngine::builder().build(Box::new(writer)).unwrap();
    engine.register_thread(ThreadDescription::new("a", 1)).unwrap();
    engine.register_thread(ThreadDescription::new("b", 2)).unwrap();
    let switch = |old, new| SwitchContextDesc {
        timestamp: 0,
        old_thread_id: old,
        new_thread_id: new,
        cpu_id: 0,
        reason: 0,
    };
    check!(engine.report_switch_context(switch(1, 2)) == SwitchContextResult::InsideProcess);
    check!(engine.report_switch_context(switch(9, 2)) == SwitchContextResult::ThreadEnabled);
    check!(engine.report_switch_context(switch(1, 9)) == SwitchContextResult::ThreadDisabled);
    check!(engine.report_switch_context(switch(8, 9)) == SwitchContextResult::OtherProcess);
}

#[test]
fn next_frame_reports_progress_once_per_interval() {
    let clock = ManualClock::new(0);
    let (writer, messages) = CapturingWriter::new();
    let engine = CaptureEngine::builder()
        .with_clock(clock.clone())
        .with_config(CaptureConfig {
            progress_interval: Duration::from_nanos(100),
            ..CaptureConfig::default()
        })
        .build(Box::new(writer))
        .unwrap();
    engine.start_capture();

    for _ in 0..4 {
        clock.advance(50);
        engine.next_frame();
    }
    engine.flush_output().unwrap();

    let progress: Vec<String> = messages
        .lock()
        .unwrap()
        .iter()
        .filter_map(|m| match m {
            Message::Progress { text } => Some(text.clone()),
            _ => None,
        })
        .collect();
    check!(progress == vec!["Capturing Frame 2...".to_string(), "Capturing Frame 4...".to_string()]);

    check!(!engine.is_time_to_report_progress());
    clock.advance(100);
    check!(engine.is_time_to_report_progress());
    check!(!engine.is_time_to_report_progress());
}

#[test]
fn dead_entries_are_only_reaped_between_sessions() {
    let (writer, _messages) = CapturingWriter::new();
    let engine = CaptureEngine::builder().build(Box::new(writer)).unwrap();
    engine.register_thread(ThreadDescription::new("a", 1)).unwrap();
    engine.register_thread(ThreadDescription::new("b", 2)).unwrap();
    engine.start_capture();

    check!(engine.unregister_thread(1));
    check!(!engine.unregister_thread(1));
    check!(!engine.is_registered_thread(1));
    engine.next_frame();
    check!(engine.threads().len() == 2);

    engine.stop_capture();
    check!(engine.threads().len() == 1);

    engine.unregister_thread(2);
    check!(engine.threads().len() == 1);
    engine.next_frame();
    check!(engine.threads().is_empty());
}

#[test]
fn registration_failures_have_no_side_effects() {
    let (writer, _messages) = CapturingWriter::new();
    let engine = CaptureEngine::builder()
        .with_config(CaptureConfig {
            max_threads: 1,
            ..CaptureConfig::default()
        })
        .build(Box::new(writer))
        .unwrap();
    engine.register_thread(ThreadDescription::new("a", 1)).unwrap();

    check!(
        engine.register_thread(ThreadDescription::new("a", 1)).err()
            == Some(RegistrationError::ThreadAlreadyRegistered(1))
    );
    check!(
        engine.register_thread(ThreadDescription::new("b", 2)).err()
            == Some(RegistrationError::RegistryFull { limit: 1 })
    );
    check!(engine.threads().len() == 1);
    check!(!engine.is_registered_thread(2));
}

#[test]
fn commands_drive_the_state_machine() {
    let (writer, messages) = CapturingWriter::new();
    let engine = CaptureEngine::builder().build(Box::new(writer)).unwrap();

    check!(engine.handle_command(CaptureCommand::Start) == CaptureStatus::Ok);
    check!(engine.state() == CaptureState::Active);
    check!(engine.handle_command(CaptureCommand::RequestProgress) == CaptureStatus::Ok);
    check!(engine.handle_command(CaptureCommand::Stop) == CaptureStatus::Ok);
    check!(engine.state() == CaptureState::Inactive);

    let messages = messages.lock().unwrap();
    check!(messages.iter().any(
        |m| matches!(m, Message::Progress { text } if text.starts_with("Active"))
    ));
}

#[test]
fn boards_are_numbered_per_dump() {
    let (writer, messages) = CapturingWriter::new();
    let engine = CaptureEngine::builder().build(Box::new(writer)).unwrap();
    engine.start_capture();
    engine.dump_frames().unwrap();
    engine.dump_frames().unwrap();
    engine.stop_capture();

    let boards: Vec<u32> = messages
        .lock()
        .unwrap()
        .iter()
        .filter_map(|m| match m {
            Message::FramesEnd { board_number } => Some(*board_number),
            _ => None,
        })
        .collect();
    check!(boards == vec![0, 1, 2]);
}
