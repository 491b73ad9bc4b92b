mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;

use common::{setup_tracing_for_test, StubEmitter, StubWorker};
use deferral::{
  ClearOptions, CoordError, Coordinator, Join, Kind, ListenerOptions, TaskOptions,
};

fn coordinator(name: &str) -> Coordinator {
  Coordinator::new((), tokio::runtime::Handle::current(), name)
}

#[tokio::test]
async fn timeout_fires_once_with_owner() {
  setup_tracing_for_test();
  let coordinator = Coordinator::new(7usize, tokio::runtime::Handle::current(), "timeout_fires");
  let fired = Arc::new(AtomicUsize::new(0));

  let observed = fired.clone();
  coordinator.set_timeout(
    move |owner: &usize| {
      observed.fetch_add(*owner, Ordering::SeqCst);
    },
    Duration::from_millis(10),
    TaskOptions::new(),
  );

  sleep(Duration::from_millis(60)).await;
  assert_eq!(fired.load(Ordering::SeqCst), 7);
  assert_eq!(coordinator.live_task_count(), 0);
}

#[tokio::test]
async fn label_replacement_cancels_the_incumbent() {
  setup_tracing_for_test();
  let coordinator = coordinator("label_replacement");
  let first_ran = Arc::new(AtomicUsize::new(0));
  let second_ran = Arc::new(AtomicUsize::new(0));
  let clear_context = Arc::new(Mutex::new(None));

  let observed = first_ran.clone();
  let seen = clear_context.clone();
  let first_id = coordinator.set_timeout(
    move |_: &()| {
      observed.fetch_add(1, Ordering::SeqCst);
    },
    Duration::from_millis(10),
    TaskOptions::new().label("job").on_clear(move |context| {
      *seen.lock().unwrap() = Some(context.clone());
    }),
  );

  let observed = second_ran.clone();
  let second_id = coordinator.set_timeout(
    move |_: &()| {
      observed.fetch_add(1, Ordering::SeqCst);
    },
    Duration::from_millis(10),
    TaskOptions::new().label("job"),
  );
  assert_ne!(first_id, second_id);

  // The cascade clear runs synchronously during the second registration.
  let context = clear_context.lock().unwrap().clone().expect("clear hook must have run");
  assert_eq!(context.id, first_id);
  assert_eq!(context.replaced_by, Some(second_id));
  assert_eq!(context.label.as_deref(), Some("job"));

  sleep(Duration::from_millis(60)).await;
  assert_eq!(first_ran.load(Ordering::SeqCst), 0);
  assert_eq!(second_ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn merge_join_keeps_the_first_payload() {
  setup_tracing_for_test();
  let coordinator = coordinator("merge_join");
  let winner = Arc::new(AtomicUsize::new(0));

  let mut ids = Vec::new();
  for candidate in 1..=3usize {
    let observed = winner.clone();
    ids.push(coordinator.set_timeout(
      move |_: &()| {
        observed.store(candidate, Ordering::SeqCst);
      },
      Duration::from_millis(10),
      TaskOptions::new().label("job").join(Join::Merge),
    ));
  }
  assert_eq!(ids[0], ids[1]);
  assert_eq!(ids[0], ids[2]);

  sleep(Duration::from_millis(60)).await;
  assert_eq!(winner.load(Ordering::SeqCst), 1, "only the first caller's payload may run");
}

#[tokio::test]
async fn reentrant_registration_under_the_same_label() {
  setup_tracing_for_test();
  let coordinator = coordinator("reentrant_label");
  let fired = Arc::new(AtomicUsize::new(0));

  let observed = fired.clone();
  let rearm = coordinator.clone();
  coordinator.set_timeout(
    move |_: &()| {
      observed.fetch_add(1, Ordering::SeqCst);
      let observed = observed.clone();
      // The firing task's link is removed before this callback runs, so
      // the slot is free for the same label again.
      rearm.set_timeout(
        move |_: &()| {
          observed.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_millis(10),
        TaskOptions::new().label("job"),
      );
    },
    Duration::from_millis(10),
    TaskOptions::new().label("job"),
  );

  sleep(Duration::from_millis(100)).await;
  assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stale_id_alongside_label_is_a_noop() {
  setup_tracing_for_test();
  let coordinator = coordinator("stale_id_guard");
  let fired = Arc::new(AtomicUsize::new(0));

  let first_id = coordinator.set_timeout(|_: &()| {}, Duration::from_millis(10), TaskOptions::new().label("job"));
  let observed = fired.clone();
  coordinator.set_timeout(
    move |_: &()| {
      observed.fetch_add(1, Ordering::SeqCst);
    },
    Duration::from_millis(10),
    TaskOptions::new().label("job"),
  );

  // first_id no longer owns the label; the clear must not touch the
  // successor.
  coordinator
    .clear_timeout(ClearOptions::new().id(first_id).label("job"))
    .unwrap();

  sleep(Duration::from_millis(60)).await;
  assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clear_by_id_and_by_label() {
  setup_tracing_for_test();
  let coordinator = coordinator("clear_targets");
  let fired = Arc::new(AtomicUsize::new(0));

  let observed = fired.clone();
  let by_id = coordinator.set_timeout(
    move |_: &()| {
      observed.fetch_add(1, Ordering::SeqCst);
    },
    Duration::from_millis(10),
    TaskOptions::new(),
  );
  let observed = fired.clone();
  coordinator.set_timeout(
    move |_: &()| {
      observed.fetch_add(1, Ordering::SeqCst);
    },
    Duration::from_millis(10),
    TaskOptions::new().label("labelled"),
  );

  coordinator.clear_timeout(by_id).unwrap();
  coordinator.clear_timeout(ClearOptions::new().label("labelled")).unwrap();
  // Clearing an unknown label is a no-op, not an error.
  coordinator.clear_timeout(ClearOptions::new().label("missing")).unwrap();

  sleep(Duration::from_millis(60)).await;
  assert_eq!(fired.load(Ordering::SeqCst), 0);
  assert_eq!(coordinator.live_task_count(), 0);
}

#[tokio::test]
async fn groups_scope_labels_independently() {
  setup_tracing_for_test();
  let coordinator = coordinator("group_scoping");
  let fired = Arc::new(AtomicUsize::new(0));

  for group in ["alpha", "beta"] {
    let observed = fired.clone();
    coordinator.set_timeout(
      move |_: &()| {
        observed.fetch_add(1, Ordering::SeqCst);
      },
      Duration::from_millis(10),
      TaskOptions::new().label("job").group(group),
    );
  }

  sleep(Duration::from_millis(60)).await;
  // Same label, different groups: no replacement happened.
  assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn regex_group_clear_spares_the_root() {
  setup_tracing_for_test();
  let coordinator = coordinator("regex_groups");
  let fired = Arc::new(AtomicUsize::new(0));

  for group in ["poll.a", "poll.b"] {
    let observed = fired.clone();
    coordinator.set_timeout(
      move |_: &()| {
        observed.fetch_add(1, Ordering::SeqCst);
      },
      Duration::from_millis(10),
      TaskOptions::new().group(group),
    );
  }
  let observed = fired.clone();
  coordinator.set_timeout(
    move |_: &()| {
      observed.fetch_add(10, Ordering::SeqCst);
    },
    Duration::from_millis(10),
    TaskOptions::new(),
  );

  coordinator
    .clear_timeout(ClearOptions::new().group(regex::Regex::new("^poll\\.").unwrap()))
    .unwrap();

  sleep(Duration::from_millis(60)).await;
  assert_eq!(fired.load(Ordering::SeqCst), 10, "only the root task may fire");
}

#[tokio::test]
async fn interval_ticks_until_cleared() {
  setup_tracing_for_test();
  let coordinator = coordinator("interval_ticks");
  let ticks = Arc::new(AtomicUsize::new(0));

  let observed = ticks.clone();
  coordinator.set_interval(
    move |_: &()| {
      observed.fetch_add(1, Ordering::SeqCst);
    },
    Duration::from_millis(10),
    TaskOptions::new().label("beat"),
  );

  sleep(Duration::from_millis(75)).await;
  let seen = ticks.load(Ordering::SeqCst);
  assert!(seen >= 3, "expected at least 3 ticks, saw {seen}");

  coordinator.clear_interval(ClearOptions::new().label("beat")).unwrap();
  let frozen = ticks.load(Ordering::SeqCst);
  sleep(Duration::from_millis(50)).await;
  assert_eq!(ticks.load(Ordering::SeqCst), frozen, "interval must stop after clear");
}

#[tokio::test]
async fn worker_terminates_exactly_once() {
  setup_tracing_for_test();
  let coordinator = coordinator("worker_once");
  let worker = StubWorker::new();

  let id = coordinator.worker(worker.clone(), TaskOptions::new().label("crunch"));
  coordinator.terminate_worker(id).unwrap();
  // The registration is gone; a second clear has nothing to do.
  coordinator.terminate_worker(id).unwrap();
  coordinator.terminate_worker(ClearOptions::new().label("crunch")).unwrap();

  assert_eq!(worker.terminations.load(Ordering::SeqCst), 1);
  assert_eq!(coordinator.live_task_count_of(Kind::Worker), 0);
}

#[tokio::test]
async fn unstoppable_worker_reports_missing_destructor() {
  setup_tracing_for_test();
  let coordinator = coordinator("worker_missing_destructor");
  let worker = StubWorker::unstoppable();

  let id = coordinator.worker(worker, TaskOptions::new().name("mailbox worker"));
  let error = coordinator.terminate_worker(id).unwrap_err();
  assert!(matches!(error, CoordError::MissingDestructor { kind: Kind::Worker, .. }));
  // Leaking is worse than shouting: the registry entry is gone regardless.
  assert_eq!(coordinator.live_task_count_of(Kind::Worker), 0);
}

#[tokio::test]
async fn clear_all_tears_listeners_down_before_timers() {
  setup_tracing_for_test();
  let coordinator = coordinator("teardown_order");
  let emitter = StubEmitter::new();
  let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

  let seen = order.clone();
  coordinator.set_timeout(
    |_: &()| {},
    Duration::from_secs(5),
    TaskOptions::new().on_clear(move |_| seen.lock().unwrap().push("timer")),
  );
  let seen = order.clone();
  coordinator.on(
    emitter.clone(),
    "ready",
    |_: &(), _| {},
    ListenerOptions::new().on_clear(move |_| seen.lock().unwrap().push("listener")),
  );

  coordinator.clear_all(ClearOptions::new()).unwrap();

  assert_eq!(*order.lock().unwrap(), vec!["listener", "timer"]);
  assert_eq!(emitter.unlisten_calls.load(Ordering::SeqCst), 1);
  assert_eq!(coordinator.live_task_count(), 0);
}

#[tokio::test]
async fn panicking_clear_hook_does_not_stop_the_rest() {
  setup_tracing_for_test();
  let coordinator = coordinator("hook_panic");
  let survivors = Arc::new(AtomicUsize::new(0));

  let observed = survivors.clone();
  let id = coordinator.set_timeout(
    |_: &()| {},
    Duration::from_secs(5),
    TaskOptions::new()
      .on_clear(|_| panic!("hook blew up"))
      .on_clear(move |_| {
        observed.fetch_add(1, Ordering::SeqCst);
      }),
  );

  coordinator.clear_timeout(id).unwrap();
  assert_eq!(survivors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropping_the_coordinator_clears_everything() {
  setup_tracing_for_test();
  let emitter = StubEmitter::new();
  let worker = StubWorker::new();
  let cleared = Arc::new(AtomicUsize::new(0));
  let seen_reason: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

  {
    let coordinator = coordinator("drop_sweep");
    let observed = cleared.clone();
    let reason = seen_reason.clone();
    coordinator.set_timeout(
      |_: &()| {},
      Duration::from_secs(5),
      TaskOptions::new().on_clear(move |context| {
        *reason.lock().unwrap() = context.reason.as_deref().map(str::to_string);
        observed.fetch_add(1, Ordering::SeqCst);
      }),
    );
    coordinator.on(emitter.clone(), "ready", |_: &(), _| {}, ListenerOptions::new());
    coordinator.worker(worker.clone(), TaskOptions::new());
  }

  assert_eq!(cleared.load(Ordering::SeqCst), 1);
  assert_eq!(seen_reason.lock().unwrap().as_deref(), Some("coordinator dropped"));
  assert_eq!(emitter.unlisten_calls.load(Ordering::SeqCst), 1);
  assert_eq!(worker.terminations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn single_shot_tasks_complete_or_clear_never_both() {
  setup_tracing_for_test();
  let coordinator = coordinator("exactly_once");
  let completed = Arc::new(AtomicUsize::new(0));
  let cleared = Arc::new(AtomicUsize::new(0));

  let mut ids = Vec::new();
  for _ in 0..8 {
    let done = completed.clone();
    let gone = cleared.clone();
    ids.push(coordinator.set_timeout(
      move |_: &()| {
        done.fetch_add(1, Ordering::SeqCst);
      },
      Duration::from_millis(15),
      TaskOptions::new().on_clear(move |_| {
        gone.fetch_add(1, Ordering::SeqCst);
      }),
    ));
  }
  for id in ids.iter().take(4) {
    coordinator.clear_timeout(*id).unwrap();
  }

  sleep(Duration::from_millis(80)).await;
  assert_eq!(completed.load(Ordering::SeqCst), 4);
  assert_eq!(cleared.load(Ordering::SeqCst), 4);
  assert_eq!(coordinator.live_task_count(), 0);
}
