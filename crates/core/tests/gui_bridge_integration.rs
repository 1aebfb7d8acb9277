#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use pcp_core::{
    GuiBridge, GuiEvent, ProgressLevel, ProgressReporter, Status, TaskManager, TaskManagerConfig,
    TaskOutcome, gui_channel,
};

fn running_manager() -> Arc<TaskManager> {
    let manager = Arc::new(TaskManager::new(TaskManagerConfig::default()));
    manager.start().expect("loop should start");
    manager
}

#[test]
fn waiter_unblocks_shortly_after_the_ui_signals() {
    let manager = running_manager();
    let bridge = GuiBridge::new(Arc::clone(&manager));
    let (event_id, event) = bridge.create_sync_event();
    assert_eq!(bridge.registered_events(), 1);

    let (woke_tx, woke_rx) = mpsc::channel();
    let waiter = manager
        .submit(Some("waiter"), async move {
            event.wait().await;
            let _ = woke_tx.send(Instant::now());
            Ok(())
        })
        .expect("submit should succeed");

    std::thread::sleep(Duration::from_millis(10));
    let signalled = Instant::now();
    bridge.signal_from_gui(&event_id);

    let woke_at = woke_rx
        .recv_timeout(Duration::from_millis(200))
        .expect("waiter should unblock within 200ms");
    assert!(woke_at.duration_since(signalled) < Duration::from_millis(200));
    assert_eq!(
        waiter.wait_timeout(Duration::from_secs(1)),
        Some(TaskOutcome::Completed)
    );

    bridge.cleanup_event(&event_id);
    manager.shutdown(Duration::from_secs(1));
}

#[test]
fn a_signal_raised_before_waiting_is_kept() {
    let manager = running_manager();
    let bridge = GuiBridge::new(Arc::clone(&manager));
    let (event_id, event) = bridge.create_sync_event();

    bridge.signal_from_gui(&event_id);
    let deadline = Instant::now() + Duration::from_secs(1);
    while !event.is_set() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(event.is_set());

    let waiter = manager
        .submit(Some("late-waiter"), async move {
            event.wait().await;
            Ok(())
        })
        .expect("submit should succeed");
    assert_eq!(
        waiter.wait_timeout(Duration::from_millis(200)),
        Some(TaskOutcome::Completed)
    );
    manager.shutdown(Duration::from_secs(1));
}

#[test]
fn without_a_loop_events_come_back_already_set() {
    let manager = Arc::new(TaskManager::new(TaskManagerConfig::default()));
    let bridge = GuiBridge::new(Arc::clone(&manager));

    let (event_id, event) = bridge.create_sync_event();
    assert!(event.is_set());
    assert_eq!(event.id(), event_id);
    assert_eq!(bridge.registered_events(), 0);
    futures::executor::block_on(event.wait());
    assert!(manager.loop_handle().is_none());
}

#[test]
fn cleanup_and_unknown_signals_are_harmless() {
    let manager = running_manager();
    let bridge = GuiBridge::new(Arc::clone(&manager));
    let (event_id, _event) = bridge.create_sync_event();

    bridge.cleanup_event(&event_id);
    bridge.cleanup_event(&event_id);
    bridge.signal_from_gui(&event_id);
    bridge.signal_from_gui("sync_event_missing");
    assert_eq!(bridge.registered_events(), 0);

    let (second_id, _second) = bridge.create_sync_event();
    assert_ne!(second_id, event_id);
    manager.shutdown(Duration::from_secs(1));
}

#[test]
fn progress_from_loop_tasks_reaches_the_ui_queue_in_order() {
    let manager = running_manager();
    let (sender, mut receiver) = gui_channel();
    let progress = ProgressReporter::to_gui(sender.clone(), "cleanup-alpha");

    let worker = manager
        .submit(Some("cleanup-alpha"), async move {
            progress.info("Starting operation...");
            progress.warning("one item could not be removed");
            sender.finished("cleanup-alpha", Status::Partial, String::from("done"));
            Ok(())
        })
        .expect("submit should succeed");
    worker.wait_timeout(Duration::from_secs(2));

    let events = receiver.drain();
    let levels: Vec<ProgressLevel> = events
        .iter()
        .filter_map(|event| match event {
            GuiEvent::Progress { level, .. } => Some(*level),
            _ => None,
        })
        .collect();
    assert_eq!(levels, vec![ProgressLevel::Info, ProgressLevel::Warning]);
    assert!(matches!(
        events.last(),
        Some(GuiEvent::Finished { status: Status::Partial, task, .. }) if task == "cleanup-alpha"
    ));
    manager.shutdown(Duration::from_secs(1));
}
