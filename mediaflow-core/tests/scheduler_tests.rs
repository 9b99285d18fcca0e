//! Integration tests for the task scheduler
//!
//! Readiness tests use Unix socket pairs so they run without any network.

use mediaflow_core::*;
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn readable_pair() -> (UnixStream, UnixStream) {
    let (mut writer, reader) = UnixStream::pair().unwrap();
    writer.write_all(b"ping").unwrap();
    (writer, reader)
}

fn step_until(scheduler: &mut TaskScheduler, mut done: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if done() {
            return;
        }
        scheduler.single_step(Some(Interval::from_millis(5))).unwrap();
    }
    panic!("condition not reached");
}

// ============================================================================
// Descriptor readiness
// ============================================================================

#[test]
fn test_read_handler_receives_readable() {
    let mut scheduler = TaskScheduler::new().unwrap();
    let (_writer, reader) = readable_pair();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let log = seen.clone();
    scheduler
        .turn_on_background_read_handling(reader.as_raw_fd(), move |_, conditions| {
            log.borrow_mut().push(conditions);
        })
        .unwrap();

    step_until(&mut scheduler, || !seen.borrow().is_empty());
    assert_eq!(seen.borrow()[0], ConditionSet::READABLE);
    assert_eq!(scheduler.stats().registered_descriptors, 1);
}

#[test]
fn test_handler_can_disable_itself() {
    let mut scheduler = TaskScheduler::new().unwrap();
    let (_writer, reader) = readable_pair();
    let fd = reader.as_raw_fd();
    let calls = Rc::new(Cell::new(0));

    let counter = calls.clone();
    scheduler
        .turn_on_background_read_handling(fd, move |sched, _| {
            counter.set(counter.get() + 1);
            sched.turn_off_background_read_handling(fd);
        })
        .unwrap();

    step_until(&mut scheduler, || calls.get() == 1);
    for _ in 0..5 {
        scheduler.single_step(Some(Interval::from_millis(1))).unwrap();
    }
    assert_eq!(calls.get(), 1);
    assert_eq!(scheduler.stats().registered_descriptors, 0);
}

#[test]
fn test_level_triggered_until_drained() {
    let mut scheduler = TaskScheduler::new().unwrap();
    let (_writer, reader) = readable_pair();
    let fd = reader.as_raw_fd();
    let reader = Rc::new(RefCell::new(reader));
    let reads = Rc::new(RefCell::new(Vec::new()));

    let source = reader.clone();
    let log = reads.clone();
    scheduler
        .turn_on_background_read_handling(fd, move |_, _| {
            // Two bytes at a time: the descriptor must be reported again.
            let mut buf = [0u8; 2];
            let n = source.borrow_mut().read(&mut buf).unwrap();
            log.borrow_mut().extend_from_slice(&buf[..n]);
        })
        .unwrap();

    step_until(&mut scheduler, || reads.borrow().len() == 4);
    assert_eq!(*reads.borrow(), b"ping".to_vec());
}

#[test]
fn test_ready_descriptors_served_round_robin() {
    let mut scheduler = TaskScheduler::new().unwrap();
    let (_w1, r1) = readable_pair();
    let (_w2, r2) = readable_pair();
    let order = Rc::new(RefCell::new(Vec::new()));

    for fd in [r1.as_raw_fd(), r2.as_raw_fd()] {
        let log = order.clone();
        scheduler
            .turn_on_background_read_handling(fd, move |_, _| log.borrow_mut().push(fd))
            .unwrap();
    }

    step_until(&mut scheduler, || order.borrow().len() >= 4);
    let order = order.borrow();
    // Neither handler drains its socket, so both stay ready and alternate.
    for pair in order.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
}

#[test]
fn test_write_readiness() {
    let mut scheduler = TaskScheduler::new().unwrap();
    let (writer, _reader) = UnixStream::pair().unwrap();
    let fd = writer.as_raw_fd();
    let seen = Rc::new(Cell::new(ConditionSet::NONE));

    let slot = seen.clone();
    scheduler
        .set_background_handling(
            fd,
            ConditionSet::READABLE | ConditionSet::WRITABLE,
            move |sched, conditions| {
                slot.set(conditions);
                sched.disable_background_handling(fd);
            },
        )
        .unwrap();

    step_until(&mut scheduler, || !seen.get().is_empty());
    assert_eq!(seen.get(), ConditionSet::WRITABLE);
}

#[test]
fn test_empty_conditions_disable_handling() {
    let mut scheduler = TaskScheduler::new().unwrap();
    let (_writer, reader) = readable_pair();
    let fd = reader.as_raw_fd();

    scheduler
        .turn_on_background_read_handling(fd, |_, _| panic!("should not run"))
        .unwrap();
    scheduler
        .set_background_handling(fd, ConditionSet::NONE, |_, _| {})
        .unwrap();

    for _ in 0..3 {
        scheduler.single_step(Some(Interval::from_millis(1))).unwrap();
    }
    assert_eq!(scheduler.stats().descriptor_dispatches, 0);
}

#[test]
fn test_move_socket_handling() {
    let mut scheduler = TaskScheduler::new().unwrap();
    let (_idle_writer, idle) = UnixStream::pair().unwrap();
    let (_writer, busy) = readable_pair();
    let busy_fd = busy.as_raw_fd();
    let hits = Rc::new(Cell::new(0));

    let counter = hits.clone();
    scheduler
        .turn_on_background_read_handling(idle.as_raw_fd(), move |sched, _| {
            counter.set(counter.get() + 1);
            sched.disable_background_handling(busy_fd);
        })
        .unwrap();
    scheduler
        .move_socket_handling(idle.as_raw_fd(), busy_fd)
        .unwrap();
    assert_eq!(scheduler.stats().registered_descriptors, 1);

    // The idle socket never becomes readable; the moved handler fires for
    // the busy one.
    step_until(&mut scheduler, || hits.get() > 0);
    assert_eq!(hits.get(), 1);
    assert_eq!(scheduler.stats().registered_descriptors, 0);
}

#[test]
fn test_moving_unregistered_descriptor_is_noop() {
    let mut scheduler = TaskScheduler::new().unwrap();
    let (a, b) = UnixStream::pair().unwrap();
    scheduler
        .move_socket_handling(a.as_raw_fd(), b.as_raw_fd())
        .unwrap();
    assert_eq!(scheduler.stats().registered_descriptors, 0);
}

// ============================================================================
// Dispatch priority
// ============================================================================

#[test]
fn test_one_callback_per_iteration() {
    let mut scheduler = TaskScheduler::new().unwrap();
    let (_writer, reader) = readable_pair();
    let fd = reader.as_raw_fd();
    let log = Rc::new(RefCell::new(Vec::new()));

    let descriptor_log = log.clone();
    scheduler
        .turn_on_background_read_handling(fd, move |sched, _| {
            descriptor_log.borrow_mut().push("descriptor");
            sched.disable_background_handling(fd);
        })
        .unwrap();
    let trigger_log = log.clone();
    let trigger = scheduler
        .create_event_trigger(move |_| trigger_log.borrow_mut().push("trigger"))
        .unwrap();
    let task_log = log.clone();
    scheduler.schedule_delayed_task(0, move |_| task_log.borrow_mut().push("task"));
    scheduler.trigger_event(trigger);

    step_until(&mut scheduler, || !log.borrow().is_empty());
    assert_eq!(log.borrow().len(), 1);
    step_until(&mut scheduler, || log.borrow().len() == 3);
    assert_eq!(*log.borrow(), vec!["descriptor", "trigger", "task"]);
}

#[test]
fn test_busy_descriptor_does_not_starve_timers() {
    let mut scheduler = TaskScheduler::new().unwrap();
    let (mut writer, reader) = UnixStream::pair().unwrap();
    writer.write_all(&[0u8; 1024]).unwrap();

    // Never drains, so the descriptor stays readable on every wait.
    scheduler
        .turn_on_background_read_handling(reader.as_raw_fd(), |_, _| {})
        .unwrap();
    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    scheduler.schedule_delayed_task(0, move |_| flag.set(true));

    for _ in 0..500 {
        if fired.get() {
            break;
        }
        scheduler.single_step(Some(Interval::from_millis(1))).unwrap();
    }
    assert!(fired.get());
    assert!(scheduler.stats().descriptor_dispatches > 0);
}

fn tick_forever(sched: &mut TaskScheduler, ticks: Rc<Cell<u32>>) {
    ticks.set(ticks.get() + 1);
    sched.schedule_delayed_task(0, move |sched| tick_forever(sched, ticks));
}

#[test]
fn test_busy_descriptor_and_due_timers_alternate() {
    let mut scheduler = TaskScheduler::new().unwrap();
    let (mut writer, reader) = UnixStream::pair().unwrap();
    writer.write_all(&[0u8; 1024]).unwrap();

    let reads = Rc::new(Cell::new(0u32));
    let count = reads.clone();
    scheduler
        .turn_on_background_read_handling(reader.as_raw_fd(), move |_, _| count.set(count.get() + 1))
        .unwrap();
    let ticks = Rc::new(Cell::new(0u32));
    tick_forever(&mut scheduler, ticks.clone());

    for _ in 0..200 {
        scheduler.single_step(Some(Interval::from_millis(1))).unwrap();
    }
    assert!(reads.get() >= 50, "descriptor ran {} times", reads.get());
    assert!(ticks.get() >= 50, "timer ran {} times", ticks.get());
}

// ============================================================================
// Cross-thread triggers
// ============================================================================

#[test]
fn test_trigger_fired_from_another_thread_wakes_loop() {
    let mut scheduler = TaskScheduler::with_config(SchedulerConfig {
        max_granularity_us: 0,
        ..Default::default()
    })
    .unwrap();
    let stop = StopFlag::new();

    let loop_stop = stop.clone();
    let id = scheduler
        .create_event_trigger(move |_| loop_stop.set())
        .unwrap();
    let trigger = scheduler.event_trigger(id).unwrap();

    let firer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        trigger.fire();
    });

    // No timers and no granularity: only the trigger can end the wait.
    scheduler.do_event_loop(Some(&stop)).unwrap();
    firer.join().unwrap();
    assert_eq!(scheduler.stats().trigger_dispatches, 1);
}

#[test]
fn test_triggers_served_in_turn() {
    let mut scheduler = TaskScheduler::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let log = order.clone();
        ids.push(
            scheduler
                .create_event_trigger(move |_| log.borrow_mut().push(name))
                .unwrap(),
        );
    }

    for id in &ids {
        scheduler.trigger_event(*id);
    }
    step_until(&mut scheduler, || order.borrow().len() == 3);
    let mut seen = order.borrow().clone();
    seen.sort();
    assert_eq!(seen, vec!["a", "b", "c"]);
}
