// tests/process_backend.rs
//
// End-to-end: real backend processes (this crate's own binary in
// `serve-backend` mode) behind the process factory and the supervisor.

mod common;
use crate::common::builders::OptionsBuilder;
use crate::common::{init_tracing, with_timeout, CapturedOutput};

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use replvisor::backend::{
    BackendFactory, BackendHost, InstanceId, ProcessBackendFactory, ProcessOptions, StartupError,
    HANDSHAKE_PREFIX,
};
use replvisor::dispatch::{CommandDispatcher, DispatchError};
use replvisor::engine::{CompiledCommand, ScopeHandle};
use replvisor::output::spawn_output_pump;
use replvisor::supervisor::RestartSupervisor;
use replvisor::transport::frame::{decode_frame, write_frame};
use replvisor::transport::{BackendFrame, ClientFrame, ReplyBody, Request};

fn backend_options() -> ProcessOptions {
    let mut options = ProcessOptions::new(
        env!("CARGO_BIN_EXE_replvisor"),
        vec!["serve-backend".to_string()],
    );
    options.terminate_grace = Duration::from_secs(2);
    options
}

const SILENT_GRACE: Duration = Duration::from_millis(300);

/// A backend process that announces a channel and then stays alive, while
/// the peer behind that channel answers `Hello` and nothing else.
async fn silent_backend() -> (ProcessOptions, JoinHandle<Vec<Request>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer = tokio::spawn(async move {
        let mut seen = Vec::new();
        let Ok((stream, _)) = listener.accept().await else {
            return seen;
        };
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let frame: ClientFrame = decode_frame(&line).unwrap();
            if frame.request == Request::Hello {
                let ready = BackendFrame::Reply {
                    call: frame.call,
                    body: ReplyBody::Ready {
                        default_scope: ScopeHandle(1),
                    },
                };
                write_frame(&mut write, &ready).await.unwrap();
            }
            seen.push(frame.request);
        }
        seen
    });

    let script = format!("echo '{HANDSHAKE_PREFIX}tcp://127.0.0.1:{port}'; exec sleep 1000");
    let mut options = ProcessOptions::new("sh", vec!["-c".to_string(), script]);
    options.terminate_grace = SILENT_GRACE;
    (options, peer)
}

#[tokio::test]
async fn process_backend_runs_commands_and_terminates_with_the_requested_code() {
    init_tracing();
    let output = CapturedOutput::default();
    let (sink, barrier) = spawn_output_pump(output.clone());
    let factory = ProcessBackendFactory::new(backend_options(), sink);
    let dispatcher = CommandDispatcher::new(barrier);

    let host = with_timeout(factory.create(InstanceId(1))).await.unwrap();
    assert!(host.is_alive());

    let running = {
        let host = Arc::clone(&host);
        tokio::spawn(async move { host.run(vec!["first".to_string(), "second".to_string()]).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let argv = with_timeout(dispatcher.execute(host.as_ref(), CompiledCommand::new("argv"), None))
        .await
        .unwrap();
    assert_eq!(argv.as_deref(), Some("first second"));

    let assigned = with_timeout(dispatcher.execute(host.as_ref(), CompiledCommand::new("x = Hello"), None))
        .await
        .unwrap();
    assert_eq!(assigned.as_deref(), Some("Hello"));

    let printed = with_timeout(dispatcher.execute(host.as_ref(), CompiledCommand::new("print hi"), None))
        .await
        .unwrap();
    assert_eq!(printed, None);
    assert_eq!(output.contents(), "hi\n");

    let upper = with_timeout(dispatcher.execute(host.as_ref(), CompiledCommand::new("x.upper"), None))
        .await
        .unwrap();
    assert_eq!(upper.as_deref(), Some("HELLO"));

    host.terminate(4);
    assert_eq!(with_timeout(running).await.unwrap(), 4);
    host.dispose();
    host.dispose();
    assert!(!host.is_alive());
}

#[tokio::test]
async fn abort_interrupts_a_command_in_a_backend_process() {
    init_tracing();
    let (sink, barrier) = spawn_output_pump(CapturedOutput::default());
    let factory = ProcessBackendFactory::new(backend_options(), sink);
    let dispatcher = Arc::new(CommandDispatcher::new(barrier));

    let host = with_timeout(factory.create(InstanceId(1))).await.unwrap();
    let running = {
        let host = Arc::clone(&host);
        tokio::spawn(async move { host.run(Vec::new()).await })
    };

    let sleeping = {
        let host = Arc::clone(&host);
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .execute(host.as_ref(), CompiledCommand::new("sleep 60000"), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    with_timeout(host.abort_command()).await.unwrap();

    match with_timeout(sleeping).await.unwrap() {
        Err(DispatchError::Remote(err)) => assert!(err.is_interrupt()),
        other => panic!("expected an interrupt, got {other:?}"),
    }

    host.terminate(0);
    assert_eq!(with_timeout(running).await.unwrap(), 0);
    host.dispose();
}

#[tokio::test]
async fn spawn_failure_is_a_startup_error() {
    init_tracing();
    let (sink, _barrier) = spawn_output_pump(CapturedOutput::default());
    let options = ProcessOptions::new("/nonexistent/replvisor-backend", Vec::new());
    let factory = ProcessBackendFactory::new(options, sink);

    let err = with_timeout(factory.create(InstanceId(1))).await.err().unwrap();
    assert!(matches!(err, StartupError::Spawn(_)), "got {err:?}");
}

#[tokio::test]
async fn backend_without_handshake_is_a_startup_error() {
    init_tracing();
    let (sink, _barrier) = spawn_output_pump(CapturedOutput::default());
    // `--version` prints and exits without announcing an address.
    let options = ProcessOptions::new(env!("CARGO_BIN_EXE_replvisor"), vec!["--version".to_string()]);
    let factory = ProcessBackendFactory::new(options, sink);

    let err = with_timeout(factory.create(InstanceId(1))).await.err().unwrap();
    assert!(matches!(err, StartupError::Handshake(_)), "got {err:?}");
}

#[tokio::test]
async fn supervisor_replaces_a_crashed_backend_process() {
    init_tracing();
    let output = CapturedOutput::default();
    let (sink, barrier) = spawn_output_pump(output.clone());
    let factory = Arc::new(ProcessBackendFactory::new(backend_options(), sink));
    let dispatcher = Arc::new(CommandDispatcher::new(barrier));
    let options = OptionsBuilder::new()
        .startup_timeout(Duration::from_secs(5))
        .build();
    let supervisor = RestartSupervisor::new(factory, dispatcher, options);
    supervisor.start().unwrap();

    let first = with_timeout(supervisor.wait_for_instance(Duration::from_secs(5)))
        .await
        .expect("first backend");
    let set = with_timeout(supervisor.execute(CompiledCommand::new("x = 1"), None)).await;
    assert_eq!(set, Ok(Some("1".to_string())));

    let crashed = with_timeout(supervisor.execute(CompiledCommand::new("crash"), None)).await;
    assert!(matches!(crashed, Err(DispatchError::Unreachable(_))), "got {crashed:?}");

    let second = with_timeout(supervisor.wait_for_state(Duration::from_secs(5), |s| {
        s.current.is_some_and(|id| id != first)
    }))
    .await
    .and_then(|s| s.current)
    .expect("replacement backend");
    assert!(second > first);

    // State does not survive a restart.
    let lost = with_timeout(supervisor.execute(CompiledCommand::new("x"), None)).await;
    match lost {
        Err(DispatchError::Remote(err)) => assert_eq!(err.kind, "NameError"),
        other => panic!("expected NameError, got {other:?}"),
    }

    with_timeout(supervisor.terminate()).await;
    assert!(supervisor.state().is_stopped());
}

#[tokio::test]
async fn exit_on_normal_exit_stops_after_a_clean_backend_exit() {
    init_tracing();
    let (sink, barrier) = spawn_output_pump(CapturedOutput::default());
    let factory = Arc::new(ProcessBackendFactory::new(backend_options(), sink));
    let dispatcher = Arc::new(CommandDispatcher::new(barrier));
    let options = OptionsBuilder::new()
        .exit_on_normal_exit(true)
        .startup_timeout(Duration::from_secs(5))
        .build();
    let supervisor = RestartSupervisor::new(factory, dispatcher, options);
    supervisor.start().unwrap();

    with_timeout(supervisor.wait_for_instance(Duration::from_secs(5)))
        .await
        .expect("backend");
    let exited = with_timeout(supervisor.execute(CompiledCommand::new("exit"), None)).await;
    assert_eq!(exited, Ok(None));

    let stopped = with_timeout(supervisor.wait_for_state(Duration::from_secs(5), |s| s.is_stopped())).await;
    assert!(stopped.is_some());
    assert_eq!(supervisor.state().instances_started, 1);
}

#[tokio::test]
async fn terminate_kills_a_backend_that_stopped_answering() {
    init_tracing();
    let (options, peer) = silent_backend().await;
    let (sink, _barrier) = spawn_output_pump(CapturedOutput::default());
    let factory = ProcessBackendFactory::new(options, sink);

    let host = with_timeout(factory.create(InstanceId(1))).await.unwrap();
    let running = {
        let host = Arc::clone(&host);
        tokio::spawn(async move { host.run(vec!["arg".to_string()]).await })
    };
    // Let the unanswered start request go out.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let asked = tokio::time::Instant::now();
    host.terminate(0);
    let code = with_timeout(running).await.unwrap();
    assert_eq!(code, -1, "the process should have been killed");
    assert!(asked.elapsed() < SILENT_GRACE + Duration::from_secs(1));

    host.dispose();
    let requests = with_timeout(peer).await.unwrap();
    assert_eq!(
        requests[..2],
        [
            Request::Hello,
            Request::Start {
                args: vec!["arg".to_string()]
            }
        ]
    );
}

#[tokio::test]
async fn supervisor_stays_responsive_with_a_silent_backend() {
    init_tracing();
    let (options, _peer) = silent_backend().await;
    let (sink, barrier) = spawn_output_pump(CapturedOutput::default());
    let factory = Arc::new(ProcessBackendFactory::new(options, sink));
    let dispatcher = Arc::new(CommandDispatcher::new(barrier));
    let options = OptionsBuilder::new()
        .member_lookup_timeout(Duration::from_millis(200))
        .build();
    let supervisor = RestartSupervisor::new(factory, dispatcher, options);
    supervisor.start().unwrap();

    with_timeout(supervisor.wait_for_instance(Duration::from_secs(5)))
        .await
        .expect("backend");

    let asked = tokio::time::Instant::now();
    let names = with_timeout(supervisor.get_member_names("x")).await;
    assert!(names.is_empty());
    assert!(asked.elapsed() < Duration::from_secs(1));

    let asked = tokio::time::Instant::now();
    with_timeout(supervisor.terminate()).await;
    assert!(asked.elapsed() < SILENT_GRACE + Duration::from_secs(1));
    assert!(supervisor.state().is_stopped());
    assert_eq!(supervisor.state().instances_started, 1);
}
