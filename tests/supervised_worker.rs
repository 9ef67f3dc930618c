//! Supervisor behaviour against real `uia-bridge --worker` processes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use uia_bridge::config::{RequestDefaults, SupervisorConfig};
use uia_bridge::requests::{FindElementsRequest, InvokeRequest};
use uia_bridge::supervisor::{Supervisor, SupervisorError};
use uia_bridge::transport::{OperationRequest, ProcessLauncher, WorkerCommand};

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/desktop.json");

fn supervisor() -> Supervisor {
    let command = WorkerCommand::new(env!("CARGO_BIN_EXE_uia-bridge"))
        .arg("--worker")
        .arg("--log-level")
        .arg("warn")
        .arg("--fixture")
        .arg(FIXTURE)
        .shutdown_grace(Duration::from_secs(1));
    Supervisor::new(
        Arc::new(ProcessLauncher::new(command)),
        SupervisorConfig::default(),
        RequestDefaults::default(),
    )
}

fn invoke(element_id: &str) -> OperationRequest {
    OperationRequest::new("Invoke").with_parameter("elementId", element_id)
}

/// Whether `pid` is still running. Zombies count as gone.
#[cfg(target_os = "linux")]
fn process_exists(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
        stat.rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X")
    })
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(i32::try_from(pid).unwrap()), None).is_ok()
}

#[cfg(unix)]
async fn exited(pid: u32) -> bool {
    for _ in 0..50 {
        if !process_exists(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Shell worker that forks a helper, records the helper's pid, answers
/// `Ping` and hangs on anything else.
#[cfg(target_os = "linux")]
fn supervisor_with_helper(pid_file: &std::path::Path) -> Supervisor {
    let script = r#"
        sleep 300 & echo $! > "$HELPER_PID_FILE"
        while read line; do
            case "$line" in
                *'"Ping"'*) echo '{"success":true,"data":"pong","error":null}' ;;
                *) sleep 300 ;;
            esac
        done
    "#;
    let command = WorkerCommand::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .env("HELPER_PID_FILE", pid_file.display().to_string());
    Supervisor::new(
        Arc::new(ProcessLauncher::new(command)),
        SupervisorConfig::default(),
        RequestDefaults::default(),
    )
}

#[cfg(target_os = "linux")]
fn helper_pid(pid_file: &std::path::Path) -> u32 {
    std::fs::read_to_string(pid_file).unwrap().trim().parse().unwrap()
}

#[tokio::test]
async fn example_scenario() {
    let sup = supervisor();
    let resp = sup.execute(&invoke("OkButton"), 0).await;
    assert_eq!(
        serde_json::to_string(&resp).unwrap(),
        r#"{"success":true,"data":"Element invoked successfully","error":null}"#
    );

    let resp = sup.execute(&OperationRequest::new("Bogus"), 0).await;
    assert!(!resp.success);
    assert!(resp
        .error
        .unwrap()
        .starts_with("Unknown operation: Bogus. Supported operations: "));
    sup.shutdown().await;
}

#[tokio::test]
async fn typed_requests_round_trip() {
    let sup = supervisor();
    let found = sup
        .call(FindElementsRequest {
            control_type: Some("Button".into()),
            ..FindElementsRequest::default()
        })
        .await
        .decode::<Vec<uia_bridge::requests::ElementInfo>>()
        .unwrap();
    assert_eq!(found.len(), 3);

    let resp = sup.call(InvokeRequest::new(found[0].id.clone())).await;
    assert!(resp.is_success());
    sup.shutdown().await;
}

#[tokio::test]
async fn hung_call_times_out_and_worker_is_killed() {
    let sup = supervisor();
    sup.execute(&OperationRequest::new("Ping"), 0).await;
    let pid = sup.status()[0].pid.unwrap();

    let started = Instant::now();
    let err = sup.try_execute(&invoke("HangButton"), 1).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, SupervisorError::Timeout { .. }));
    assert_eq!(err.to_string(), "Invoke timed out after 1s");
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    #[cfg(unix)]
    assert!(exited(pid).await, "worker {pid} still running");

    let resp = sup.execute(&invoke("OkButton"), 0).await;
    assert!(resp.is_success());
    assert_ne!(sup.status()[0].pid, Some(pid));
    sup.shutdown().await;
}

#[tokio::test]
async fn crash_is_reported_then_recovered() {
    let sup = supervisor();
    let resp = sup.execute(&invoke("CrashButton"), 5).await;
    assert_eq!(resp.error.as_deref(), Some("worker process exited unexpectedly"));
    assert_eq!(resp.error_type(), Some("crash"));

    let resp = sup.execute(&invoke("OkButton"), 5).await;
    assert!(resp.is_success());
    let status = &sup.status()[0];
    assert_eq!(status.stats.crashes, 1);
    assert_eq!(status.stats.restarts, 1);
    sup.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn externally_killed_worker_is_replaced() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let sup = supervisor();
    sup.execute(&OperationRequest::new("Ping"), 0).await;
    let pid = sup.status()[0].pid.unwrap();
    kill(Pid::from_raw(i32::try_from(pid).unwrap()), Signal::SIGKILL).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let resp = sup.execute(&invoke("OkButton"), 5).await;
    assert!(resp.is_success());
    assert_ne!(sup.status()[0].pid, Some(pid));
    sup.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_workers() {
    let sup = supervisor();
    sup.execute(&OperationRequest::new("Ping"), 0).await;
    let pid = sup.status()[0].pid.unwrap();
    sup.shutdown().await;

    assert!(!sup.status()[0].alive);
    #[cfg(unix)]
    assert!(exited(pid).await);
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn timeout_kills_the_whole_worker_tree() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("helper.pid");
    let sup = supervisor_with_helper(&pid_file);

    let err = sup.try_execute(&invoke("OkButton"), 1).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Timeout { .. }));

    let helper = helper_pid(&pid_file);
    assert!(exited(helper).await, "helper {helper} outlived the timed-out worker");
    sup.shutdown().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn abandoned_request_kills_the_whole_worker_tree() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("helper.pid");
    let sup = supervisor_with_helper(&pid_file);

    let request = invoke("OkButton");
    let abandoned =
        tokio::time::timeout(Duration::from_millis(500), sup.execute(&request, 30)).await;
    assert!(abandoned.is_err());
    assert_eq!(sup.status()[0].pid, None);

    let helper = helper_pid(&pid_file);
    assert!(exited(helper).await, "helper {helper} outlived the abandoned worker");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn dropped_supervisor_kills_worker_trees() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("helper.pid");
    let sup = supervisor_with_helper(&pid_file);
    assert!(sup.execute(&OperationRequest::new("Ping"), 5).await.is_success());
    let worker = sup.status()[0].pid.unwrap();
    let helper = helper_pid(&pid_file);

    drop(sup);
    assert!(exited(helper).await, "helper {helper} outlived the supervisor");
    assert!(exited(worker).await, "worker {worker} outlived the supervisor");
}
