// tests/control_ops.rs

mod common;
use crate::common::builders::OptionsBuilder;
use crate::common::{eventually, init_tracing, with_timeout, Harness, StartupStep};

use std::sync::Arc;
use std::time::Duration;

use replvisor::backend::BackendHost;
use replvisor::dispatch::DispatchError;
use replvisor::engine::{CompiledCommand, RemoteError};
use replvisor::transport::ChannelError;

#[tokio::test]
async fn break_execution_interrupts_the_running_command() {
    init_tracing();
    let h = Harness::started(OptionsBuilder::new().build(), |_| {});
    let backend = with_timeout(h.current()).await;

    let supervisor = Arc::clone(&h.supervisor);
    let running = tokio::spawn(async move {
        supervisor.execute(CompiledCommand::new("hang"), None).await
    });

    let engine = Arc::clone(backend.fake_engine());
    assert!(
        eventually(Duration::from_secs(1), || engine.executed().contains(&"hang".to_string())).await
    );
    h.supervisor.break_execution();

    let result = with_timeout(running).await.unwrap();
    assert_eq!(result, Err(DispatchError::Remote(RemoteError::interrupted())));
    assert_eq!(engine.abort_count(), 1);

    // The backend survives an interrupt.
    assert_eq!(h.supervisor.current_instance(), Some(backend.id()));

    h.supervisor.terminate().await;
}

#[tokio::test]
async fn operations_without_a_backend_return_promptly() {
    init_tracing();
    let options = OptionsBuilder::new()
        .startup_timeout(Duration::from_secs(30))
        .build();
    let h = Harness::started(options, |factory| {
        factory.script([StartupStep::Hang]);
    });
    assert!(eventually(Duration::from_secs(1), || h.factory.attempts() == 1).await);

    h.supervisor.break_execution();
    h.supervisor.restart_console();
    assert!(with_timeout(h.supervisor.get_member_names("")).await.is_empty());
    assert_eq!(
        with_timeout(h.supervisor.execute(CompiledCommand::new("x"), None)).await,
        Err(DispatchError::Unreachable(ChannelError::NoBackend))
    );
    assert_eq!(
        with_timeout(h.supervisor.create_scope()).await,
        Err(DispatchError::Unreachable(ChannelError::NoBackend))
    );

    with_timeout(h.supervisor.terminate()).await;
    assert!(h.factory.backends().is_empty());
}

#[tokio::test]
async fn member_names_come_from_the_current_backend() {
    init_tracing();
    let h = Harness::started(OptionsBuilder::new().build(), |_| {});
    with_timeout(h.current()).await;

    let names = with_timeout(h.supervisor.get_member_names("")).await;
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);

    // Remote failures are swallowed into an empty list.
    assert!(with_timeout(h.supervisor.get_member_names("missing")).await.is_empty());

    h.supervisor.terminate().await;
}

#[tokio::test]
async fn member_names_over_a_failed_channel_are_empty() {
    init_tracing();
    let h = Harness::started(OptionsBuilder::new().build(), |_| {});
    let backend = with_timeout(h.current()).await;

    backend.fail_channel(ChannelError::Disconnected);
    assert!(with_timeout(h.supervisor.get_member_names("")).await.is_empty());

    h.supervisor.terminate().await;
}

#[tokio::test]
async fn scopes_are_created_in_the_current_backend() {
    init_tracing();
    let h = Harness::started(OptionsBuilder::new().build(), |_| {});
    with_timeout(h.current()).await;

    let a = with_timeout(h.supervisor.create_scope()).await.unwrap();
    let b = with_timeout(h.supervisor.create_scope()).await.unwrap();
    assert_ne!(a, b);

    let value = with_timeout(h.supervisor.execute(CompiledCommand::new("value"), Some(a)))
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("value"));

    h.supervisor.terminate().await;
}

#[tokio::test]
async fn command_in_flight_when_the_backend_dies_is_unreachable() {
    init_tracing();
    let h = Harness::started(OptionsBuilder::new().build(), |_| {});
    let backend = with_timeout(h.current()).await;

    let supervisor = Arc::clone(&h.supervisor);
    let running = tokio::spawn(async move {
        supervisor.execute(CompiledCommand::new("hang"), None).await
    });

    let engine = Arc::clone(backend.fake_engine());
    assert!(
        eventually(Duration::from_secs(1), || engine.executed().contains(&"hang".to_string())).await
    );
    backend.crash();

    let result = with_timeout(running).await.unwrap();
    assert_eq!(result, Err(DispatchError::Unreachable(ChannelError::Disconnected)));

    h.supervisor.terminate().await;
}

#[tokio::test]
async fn member_lookup_in_an_unresponsive_backend_gives_up_after_its_bound() {
    init_tracing();
    let options = OptionsBuilder::new()
        .member_lookup_timeout(Duration::from_millis(200))
        .build();
    let h = Harness::started(options, |_| {});
    let backend = with_timeout(h.current()).await;

    let started = tokio::time::Instant::now();
    let names = with_timeout(h.supervisor.get_member_names("hang")).await;
    assert!(names.is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));

    // The backend is still current and still answers.
    assert_eq!(h.supervisor.current_instance(), Some(backend.id()));
    assert_eq!(
        with_timeout(h.supervisor.get_member_names("")).await,
        vec!["alpha".to_string(), "beta".to_string()]
    );

    h.supervisor.terminate().await;
}
