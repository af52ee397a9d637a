// tests/supervisor_restart.rs

mod common;
use crate::common::builders::OptionsBuilder;
use crate::common::{eventually, init_tracing, with_timeout, Harness, StartupStep};

use std::time::Duration;

use replvisor::backend::BackendHost;
use replvisor::supervisor::SupervisorPhase;

#[tokio::test]
async fn crashed_backend_is_replaced_with_a_fresh_instance() {
    init_tracing();
    let h = Harness::started(OptionsBuilder::new().build(), |_| {});

    let first = with_timeout(h.current()).await;
    first.crash();

    let second = with_timeout(h.replacement_of(first.id())).await;
    assert_ne!(first.id(), second.id());
    assert!(first.is_disposed(), "crashed backend must be disposed");
    assert!(!h.factory.overlapped(), "two backends were alive at once");

    h.supervisor.terminate().await;
}

#[tokio::test]
async fn at_most_one_backend_is_alive_across_many_restarts() {
    init_tracing();
    let h = Harness::started(OptionsBuilder::new().build(), |_| {});

    let mut previous = with_timeout(h.current()).await;
    for round in 0..5 {
        if round % 2 == 0 {
            previous.crash();
        } else {
            h.supervisor.restart_console();
        }
        let next = with_timeout(h.replacement_of(previous.id())).await;
        assert!(previous.is_disposed());
        previous = next;
    }

    assert!(!h.factory.overlapped());
    assert_eq!(h.factory.backends().len(), 6);
    assert_eq!(h.supervisor.state().instances_started, 6);

    h.supervisor.terminate().await;
}

#[tokio::test]
async fn restart_console_terminates_current_and_starts_another() {
    init_tracing();
    let h = Harness::started(OptionsBuilder::new().build(), |_| {});

    let first = with_timeout(h.current()).await;
    h.supervisor.restart_console();

    let second = with_timeout(h.replacement_of(first.id())).await;
    assert_eq!(first.terminate_codes(), vec![0]);
    assert!(first.is_disposed());
    assert!(second.is_alive());

    h.supervisor.terminate().await;
}

/// Crash at 0.5s and restart at 1.5s within a two second window: three
/// distinct instances in order, never two at once.
#[tokio::test]
async fn crash_then_restart_yields_three_instances_in_order() {
    init_tracing();
    let h = Harness::started(OptionsBuilder::new().build(), |_| {});

    let first = with_timeout(h.current()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    first.crash();

    let second = with_timeout(h.replacement_of(first.id())).await;
    tokio::time::sleep(Duration::from_millis(1000)).await;
    h.supervisor.restart_console();

    let third = with_timeout(h.replacement_of(second.id())).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let ids: Vec<_> = h.factory.backends().iter().map(|b| b.id()).collect();
    assert_eq!(ids, vec![first.id(), second.id(), third.id()]);
    assert!(first.id() < second.id() && second.id() < third.id());
    assert!(!h.factory.overlapped());
    assert_eq!(h.supervisor.current_instance(), Some(third.id()));

    h.supervisor.terminate().await;
}

#[tokio::test]
async fn failed_startup_is_retried() {
    init_tracing();
    let h = Harness::started(OptionsBuilder::new().build(), |factory| {
        factory.script([StartupStep::Fail, StartupStep::Fail]);
    });

    let backend = with_timeout(h.current()).await;
    assert_eq!(h.factory.attempts(), 3);
    assert_eq!(h.factory.backends().len(), 1);
    assert!(backend.is_alive());

    h.supervisor.terminate().await;
}

#[tokio::test]
async fn hung_startup_times_out_and_is_retried() {
    init_tracing();
    let options = OptionsBuilder::new()
        .startup_timeout(Duration::from_millis(100))
        .build();
    let h = Harness::started(options, |factory| {
        factory.script([StartupStep::Hang]);
    });

    let backend = with_timeout(h.current()).await;
    assert_eq!(h.factory.attempts(), 2);
    assert!(backend.is_alive());

    h.supervisor.terminate().await;
}

#[tokio::test]
async fn channel_failure_without_exit_still_ends_the_instance() {
    init_tracing();
    let h = Harness::started(OptionsBuilder::new().build(), |_| {});

    let first = with_timeout(h.current()).await;
    first.fail_channel(replvisor::transport::ChannelError::LeaseExpired(
        Duration::from_secs(1),
    ));
    // The fake keeps running until something ends it; a restart request does.
    h.supervisor.restart_console();

    let second = with_timeout(h.replacement_of(first.id())).await;
    assert!(first.is_disposed());
    assert!(second.is_alive());

    h.supervisor.terminate().await;
}

#[tokio::test]
async fn run_args_reach_every_instance() {
    init_tracing();
    let options = OptionsBuilder::new().run_arg("--fast").build();
    let h = Harness::started(options, |_| {});

    let first = with_timeout(h.current()).await;
    assert!(
        eventually(Duration::from_secs(1), || first.run_args().is_some()).await,
        "run was never called"
    );
    assert_eq!(first.run_args(), Some(vec!["--fast".to_string()]));

    first.crash();
    let second = with_timeout(h.replacement_of(first.id())).await;
    assert!(eventually(Duration::from_secs(1), || second.run_args().is_some()).await);
    assert_eq!(second.run_args(), Some(vec!["--fast".to_string()]));

    h.supervisor.terminate().await;
    assert_eq!(h.supervisor.state().phase, SupervisorPhase::Stopped);
}
