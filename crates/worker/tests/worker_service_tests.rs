//! 执行器端到端测试
//!
//! 在回环地址上起一个迷你协调器：认领返回一个作业，二进制从同一
//! 服务器下载（shell 脚本），作业跑完后记录终态上报。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use executr_domain::entities::Job;
use executr_testing::JobBuilder;
use executr_worker::{WorkerConfig, WorkerService};

const SCRIPT: &str = "#!/bin/sh\necho \"Hello from success binary\"\necho \"Arguments: [$*]\"\nenv\nexit 0\n";
const FAIL_SCRIPT: &str = "#!/bin/sh\necho \"ERROR: Intentional failure\" >&2\nexit 42\n";

#[derive(Clone)]
struct MockCoordinator {
    queue: Arc<Mutex<Vec<Job>>>,
    completions: Arc<Mutex<Vec<Value>>>,
    failures: Arc<Mutex<Vec<Value>>>,
    heartbeats: Arc<Mutex<u32>>,
    script: &'static str,
}

impl MockCoordinator {
    fn new(jobs: Vec<Job>, script: &'static str) -> Self {
        Self {
            queue: Arc::new(Mutex::new(jobs)),
            completions: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(Vec::new())),
            heartbeats: Arc::new(Mutex::new(0)),
            script,
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route(
                "/api/v1/jobs/claim",
                post(|State(state): State<MockCoordinator>| async move {
                    let job = state.queue.lock().unwrap().pop();
                    match job {
                        Some(job) => Json(job).into_response(),
                        None => StatusCode::NO_CONTENT.into_response(),
                    }
                }),
            )
            .route(
                "/api/v1/jobs/{id}/heartbeat",
                put(|State(state): State<MockCoordinator>| async move {
                    *state.heartbeats.lock().unwrap() += 1;
                    StatusCode::NO_CONTENT
                }),
            )
            .route(
                "/api/v1/jobs/{id}/complete",
                put(
                    |State(state): State<MockCoordinator>, Json(body): Json<Value>| async move {
                        state.completions.lock().unwrap().push(body);
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .route(
                "/api/v1/jobs/{id}/fail",
                put(
                    |State(state): State<MockCoordinator>, Json(body): Json<Value>| async move {
                        state.failures.lock().unwrap().push(body);
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .route(
                "/binary",
                get(|State(state): State<MockCoordinator>| async move {
                    state.script.as_bytes().to_vec()
                }),
            )
            .with_state(self.clone())
    }
}

fn spawn_server(router: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), handle)
}

fn script_digest(script: &str) -> String {
    format!("{:x}", Sha256::digest(script.as_bytes()))
}

fn fast_config(base_url: &str, dir: &std::path::Path) -> WorkerConfig {
    let mut config = WorkerConfig::new(base_url, "w");
    config.cache_dir = dir.join("cache").to_string_lossy().into_owned();
    config.work_dir = dir.join("work");
    config.poll_interval = Duration::from_millis(100);
    config.heartbeat_interval = Duration::from_millis(200);
    config
}

async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_worker_runs_job_and_reports_completion() {
    let dir = tempfile::tempdir().unwrap();
    let digest = script_digest(SCRIPT);

    let mock = MockCoordinator::new(Vec::new(), SCRIPT);
    let (base_url, server) = spawn_server(mock.router());

    let mut job = JobBuilder::new()
        .with_type("test-success")
        .with_arguments(vec!["arg1".to_string(), "arg2".to_string()])
        .build();
    job.binary_url = format!("{base_url}/binary");
    job.binary_sha256 = digest.clone();
    job.env_variables
        .insert("TEST_ENV".to_string(), "x".to_string());
    mock.queue.lock().unwrap().push(job);

    let worker = Arc::new(WorkerService::new(fast_config(&base_url, dir.path())).unwrap());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let worker_handle = tokio::spawn(worker.clone().run(shutdown_rx));

    let completions = mock.completions.clone();
    assert!(
        wait_until(
            || !completions.lock().unwrap().is_empty(),
            Duration::from_secs(15)
        )
        .await,
        "作业应在期限内完成"
    );

    shutdown_tx.send(()).unwrap();
    worker_handle.await.unwrap();

    let completion = mock.completions.lock().unwrap()[0].clone();
    assert_eq!(completion["exit_code"], 0);
    let stdout = completion["stdout"].as_str().unwrap();
    assert!(stdout.contains("Hello from success binary"));
    assert!(stdout.contains("Arguments: [arg1 arg2]"));
    assert!(stdout.contains("TEST_ENV=x"));
    assert!(completion["executor_id"]
        .as_str()
        .unwrap()
        .starts_with("w-"));

    // 二进制已按摘要落入缓存
    let cache_file = dir.path().join("cache").join(&digest);
    assert!(cache_file.exists());

    // 作业目录已清理
    let work_entries = std::fs::read_dir(dir.path().join("work")).unwrap().count();
    assert_eq!(work_entries, 0);

    server.abort();
}

#[tokio::test]
async fn test_worker_reports_nonzero_exit_as_failure() {
    let dir = tempfile::tempdir().unwrap();
    let digest = script_digest(FAIL_SCRIPT);

    let mock = MockCoordinator::new(Vec::new(), FAIL_SCRIPT);
    let (base_url, server) = spawn_server(mock.router());

    let mut job = JobBuilder::new().with_type("test-failure").build();
    job.binary_url = format!("{base_url}/binary");
    job.binary_sha256 = digest;
    mock.queue.lock().unwrap().push(job);

    let worker = Arc::new(WorkerService::new(fast_config(&base_url, dir.path())).unwrap());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let failures = mock.failures.clone();
    assert!(
        wait_until(
            || !failures.lock().unwrap().is_empty(),
            Duration::from_secs(15)
        )
        .await
    );

    shutdown_tx.send(()).unwrap();
    worker_handle.await.unwrap();

    let failure = mock.failures.lock().unwrap()[0].clone();
    assert_eq!(failure["exit_code"], 42);
    assert_eq!(failure["error_message"], "Job failed with non-zero exit code");
    assert!(failure["stderr"]
        .as_str()
        .unwrap()
        .contains("ERROR: Intentional failure"));

    server.abort();
}

#[tokio::test]
async fn test_digest_mismatch_fails_job() {
    let dir = tempfile::tempdir().unwrap();

    let mock = MockCoordinator::new(Vec::new(), SCRIPT);
    let (base_url, server) = spawn_server(mock.router());

    let mut job = JobBuilder::new().with_type("test-mismatch").build();
    job.binary_url = format!("{base_url}/binary");
    // 摘要故意声明错误
    job.binary_sha256 = "00".repeat(32);
    mock.queue.lock().unwrap().push(job);

    let worker = Arc::new(WorkerService::new(fast_config(&base_url, dir.path())).unwrap());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let failures = mock.failures.clone();
    assert!(
        wait_until(
            || !failures.lock().unwrap().is_empty(),
            Duration::from_secs(15)
        )
        .await
    );

    shutdown_tx.send(()).unwrap();
    worker_handle.await.unwrap();

    let failure = mock.failures.lock().unwrap()[0].clone();
    assert_eq!(failure["exit_code"], -1);
    assert!(failure["stderr"].as_str().unwrap().contains("Failed to get binary"));
    // 错误的字节没有进入缓存
    assert!(!dir.path().join("cache").join("00".repeat(32)).exists());

    server.abort();
}

#[tokio::test]
async fn test_cache_reuse_across_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let digest = script_digest(SCRIPT);

    let mock = MockCoordinator::new(Vec::new(), SCRIPT);
    let (base_url, server) = spawn_server(mock.router());

    // 两个作业共享同一摘要
    for _ in 0..2 {
        let mut job = JobBuilder::new().with_type("test-cache").build();
        job.binary_url = format!("{base_url}/binary");
        job.binary_sha256 = digest.clone();
        mock.queue.lock().unwrap().push(job);
    }

    let worker = Arc::new(WorkerService::new(fast_config(&base_url, dir.path())).unwrap());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let completions = mock.completions.clone();
    assert!(
        wait_until(
            || completions.lock().unwrap().len() == 2,
            Duration::from_secs(20)
        )
        .await
    );

    shutdown_tx.send(()).unwrap();
    worker_handle.await.unwrap();

    // 缓存目录里恰好一个以摘要命名的文件
    let entries: Vec<String> = std::fs::read_dir(dir.path().join("cache"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec![digest]);

    server.abort();
}

#[tokio::test]
async fn test_heartbeats_flow_during_execution() {
    let dir = tempfile::tempdir().unwrap();
    let slow_script: &'static str = "#!/bin/sh\nsleep 1\nexit 0\n";
    let digest = script_digest(slow_script);

    let mock = MockCoordinator::new(Vec::new(), slow_script);
    let (base_url, server) = spawn_server(mock.router());

    let mut job = JobBuilder::new().with_type("test-heartbeat").build();
    job.binary_url = format!("{base_url}/binary");
    job.binary_sha256 = digest;
    mock.queue.lock().unwrap().push(job);

    let worker = Arc::new(WorkerService::new(fast_config(&base_url, dir.path())).unwrap());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let completions = mock.completions.clone();
    assert!(
        wait_until(
            || !completions.lock().unwrap().is_empty(),
            Duration::from_secs(15)
        )
        .await
    );

    shutdown_tx.send(()).unwrap();
    worker_handle.await.unwrap();

    // 1 秒的作业配 200ms 心跳间隔，至少收到一次心跳
    assert!(*mock.heartbeats.lock().unwrap() >= 1);

    server.abort();
}
