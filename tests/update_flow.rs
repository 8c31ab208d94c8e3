//! End-to-end tests for the update service against a local mock manifest and
//! package server.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::StreamExt;
use tokio::sync::watch;

use update_agent::downloader::hash_file;
use update_agent::markers::{DownloadMarker, MarkerStore};
use update_agent::{UpdateCoordinator, UpdateEvent, UpdaterConfig, UpdaterState, Version};

#[derive(Clone)]
enum CheckReply {
    Body(String),
    Status(u16),
}

struct ServerState {
    check_reply: Mutex<CheckReply>,
    check_hits: Mutex<Vec<Instant>>,
    package: Vec<u8>,
    range_requests: Mutex<Vec<Option<String>>>,
    /// When false, ranged requests get a plain 200 with the full body
    honor_range: Mutex<bool>,
    /// When set, the package body is streamed in 4 KiB chunks with this
    /// delay between them
    chunk_delay: Mutex<Option<Duration>>,
}

struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl MockServer {
    async fn start(check_reply: CheckReply, package: Vec<u8>) -> Self {
        let state = Arc::new(ServerState {
            check_reply: Mutex::new(check_reply),
            check_hits: Mutex::new(Vec::new()),
            package,
            range_requests: Mutex::new(Vec::new()),
            honor_range: Mutex::new(true),
            chunk_delay: Mutex::new(None),
        });

        let app = Router::new()
            .route("/check", get(check_handler))
            .route("/pkg", get(package_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    fn set_check_reply(&self, reply: CheckReply) {
        *self.state.check_reply.lock().unwrap() = reply;
    }

    fn set_honor_range(&self, honor: bool) {
        *self.state.honor_range.lock().unwrap() = honor;
    }

    fn set_chunk_delay(&self, delay: Duration) {
        *self.state.chunk_delay.lock().unwrap() = Some(delay);
    }

    fn check_url(&self) -> String {
        format!("http://{}/check", self.addr)
    }

    fn package_url(&self) -> String {
        format!("http://{}/pkg", self.addr)
    }

    fn check_hits(&self) -> Vec<Instant> {
        self.state.check_hits.lock().unwrap().clone()
    }

    fn range_requests(&self) -> Vec<Option<String>> {
        self.state.range_requests.lock().unwrap().clone()
    }
}

async fn check_handler(State(state): State<Arc<ServerState>>) -> Response {
    state.check_hits.lock().unwrap().push(Instant::now());
    let reply = state.check_reply.lock().unwrap().clone();
    match reply {
        CheckReply::Status(code) => StatusCode::from_u16(code).unwrap().into_response(),
        CheckReply::Body(body) => (
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
    }
}

async fn package_handler(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    state.range_requests.lock().unwrap().push(range.clone());

    let data = &state.package;
    if *state.honor_range.lock().unwrap() {
        match range.and_then(|range| parse_range_start(&range)) {
            Some(start) if start < data.len() as u64 => {
                let start = start as usize;
                return (
                    StatusCode::PARTIAL_CONTENT,
                    [(
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", start, data.len() - 1, data.len()),
                    )],
                    data[start..].to_vec(),
                )
                    .into_response();
            }
            Some(_) => return StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
            None => {}
        }
    }

    match *state.chunk_delay.lock().unwrap() {
        Some(delay) => {
            let chunks: Vec<Bytes> = data.chunks(4096).map(Bytes::copy_from_slice).collect();
            let stream = futures::stream::iter(chunks).then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, std::io::Error>(chunk)
            });
            Body::from_stream(stream).into_response()
        }
        None => data.clone().into_response(),
    }
}

fn parse_range_start(range: &str) -> Option<u64> {
    range
        .strip_prefix("bytes=")?
        .split('-')
        .next()?
        .parse()
        .ok()
}

fn test_package() -> Vec<u8> {
    (0..65536u32).map(|i| (i % 251) as u8).collect()
}

async fn package_hash(bytes: &[u8]) -> String {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pkg");
    tokio::fs::write(&path, bytes).await.unwrap();
    hash_file(&path).await.unwrap()
}

fn descriptor_body(url: &str, hash: &str) -> String {
    format!(
        r#"{{"url": "{}", "hash": "{}", "version": "1.2.3.4", "channel": "Release",
            "required": false, "more_info": "http://example.com/notes"}}"#,
        url, hash
    )
}

fn base_config(check_url: String, dir: &Path) -> UpdaterConfig {
    let mut config = UpdaterConfig::new(check_url);
    config.data_dir = Some(dir.join("data"));
    config.download_dir = Some(dir.join("downloads"));
    config.auto_install = false;
    config.check_period_secs = 3600;
    config
}

fn record_events(coordinator: &UpdateCoordinator) -> Arc<Mutex<Vec<UpdateEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    coordinator.events().subscribe(move |event| {
        events_clone.lock().unwrap().push(event.clone());
    });
    events
}

async fn wait_for_state(rx: &mut watch::Receiver<UpdaterState>, target: UpdaterState) {
    let wait = async {
        loop {
            if *rx.borrow_and_update() == target {
                return;
            }
            if rx.changed().await.is_err() {
                assert_eq!(*rx.borrow(), target, "driver ended in unexpected state");
                return;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {target:?}"));
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .expect("timed out waiting for condition");
}

// Scenario A: check finds an update, the package downloads and verifies, the
// install marker lands on disk, and check-complete precedes download-complete.
#[tokio::test]
async fn full_download_cycle_writes_install_marker() {
    let package = test_package();
    let hash = package_hash(&package).await;
    let server = MockServer::start(CheckReply::Body(String::new()), package.clone()).await;
    server.set_check_reply(CheckReply::Body(descriptor_body(&server.package_url(), &hash)));

    let dir = tempfile::tempdir().unwrap();
    let config = base_config(server.check_url(), dir.path());
    let running = Version::new(1, 0, 0, 0);

    let mut coordinator = UpdateCoordinator::new(config, running).unwrap();
    let events = record_events(&coordinator);
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    wait_for_state(&mut state_rx, UpdaterState::Terminal).await;

    let markers = MarkerStore::new(dir.path().join("data"));
    let install = markers.read_install().expect("install marker missing");
    assert_eq!(install.update_version, "1.2.3.4");
    assert_eq!(install.update_channel, "Release");
    assert_eq!(install.current_version, "1.0.0.0");
    assert!(markers.read_download().is_none(), "download marker must be gone");

    // The downloaded file matches the served package
    let downloaded = tokio::fs::read(&install.path).await.unwrap();
    assert_eq!(downloaded, package);

    // check-complete arrives before download-complete
    let events = events.lock().unwrap();
    let check_pos = events
        .iter()
        .position(|event| matches!(event, UpdateEvent::CheckComplete { update_available: true, .. }))
        .expect("no check-complete event");
    let download_pos = events
        .iter()
        .position(|event| matches!(event, UpdateEvent::DownloadComplete { .. }))
        .expect("no download-complete event");
    assert!(check_pos < download_pos);

    coordinator.shutdown().await;
}

// Scenario B: two transport failures in a row leave the coordinator in
// TemporaryError, emit two check-error events, and retries are spaced by at
// least the configured period.
#[tokio::test]
async fn repeated_check_errors_retry_on_fixed_period() {
    let server = MockServer::start(CheckReply::Status(500), Vec::new()).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(server.check_url(), dir.path());
    config.check_period_secs = 1;

    let mut coordinator = UpdateCoordinator::new(config, Version::new(1, 0, 0, 0)).unwrap();
    let events = record_events(&coordinator);
    coordinator.start_checking().unwrap();

    let events_clone = events.clone();
    wait_until(move || {
        events_clone
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches!(event, UpdateEvent::CheckError { .. }))
            .count()
            >= 2
    })
    .await;

    assert_eq!(coordinator.state(), UpdaterState::TemporaryError);

    let hits = server.check_hits();
    assert!(hits.len() >= 2);
    assert!(
        hits[1].duration_since(hits[0]) >= Duration::from_millis(950),
        "retry came sooner than the configured period"
    );

    // No markers are written by failed checks
    let markers = MarkerStore::new(dir.path().join("data"));
    assert!(markers.read_download().is_none());
    assert!(markers.read_install().is_none());

    coordinator.shutdown().await;
}

// A no-update reply lands in UpToDate and touches no marker files.
#[tokio::test]
async fn no_update_reply_writes_no_markers() {
    let server = MockServer::start(CheckReply::Body(String::new()), Vec::new()).await;

    let dir = tempfile::tempdir().unwrap();
    let config = base_config(server.check_url(), dir.path());

    let mut coordinator = UpdateCoordinator::new(config, Version::new(1, 0, 0, 0)).unwrap();
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    wait_for_state(&mut state_rx, UpdaterState::UpToDate).await;

    let markers = MarkerStore::new(dir.path().join("data"));
    assert!(markers.read_download().is_none());
    assert!(markers.read_install().is_none());

    coordinator.shutdown().await;
}

// A valid download marker plus a partial file resumes from the partial
// length: the requested byte range starts at N and no earlier byte is
// re-requested.
#[tokio::test]
async fn resume_requests_only_missing_bytes() {
    let package = test_package();
    let hash = package_hash(&package).await;
    let server = MockServer::start(CheckReply::Body(String::new()), package.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let config = base_config(server.check_url(), dir.path());
    let running = Version::new(1, 0, 0, 0);
    let data_dir = config.resolve_data_dir().unwrap();
    let download_dir = config.resolve_download_dir().unwrap();

    // Seed a half-finished download from this same binary version
    let partial_len = 20_000usize;
    let path = download_dir.join("update-release-1.2.3.4.pkg");
    tokio::fs::write(&path, &package[..partial_len]).await.unwrap();
    let markers = MarkerStore::new(&data_dir);
    markers
        .write_download(&DownloadMarker {
            current_version: running.to_string(),
            update_channel: "Release".to_string(),
            update_version: "1.2.3.4".to_string(),
            url: server.package_url(),
            hash,
            path: path.clone(),
            required: false,
            more_info: String::new(),
        })
        .unwrap();

    let mut coordinator = UpdateCoordinator::new(config, running).unwrap();
    let events = record_events(&coordinator);
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    wait_for_state(&mut state_rx, UpdaterState::Terminal).await;

    let ranges = server.range_requests();
    assert_eq!(ranges.len(), 1, "expected exactly one package request");
    assert_eq!(ranges[0].as_deref(), Some(format!("bytes={}-", partial_len).as_str()));

    let downloaded = tokio::fs::read(&path).await.unwrap();
    assert_eq!(downloaded, package);
    assert!(markers.read_install().is_some());
    assert!(markers.read_download().is_none());
    assert!(
        events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, UpdateEvent::DownloadResume { .. }))
    );

    coordinator.shutdown().await;
}

// A manifest that offers an update but carries no content hash is malformed:
// the check errors, the package is never requested, and no marker is written.
#[tokio::test]
async fn manifest_without_hash_is_a_check_error() {
    let server = MockServer::start(CheckReply::Body(String::new()), test_package()).await;
    server.set_check_reply(CheckReply::Body(format!(
        r#"{{"url": "{}", "version": "1.2.3.4"}}"#,
        server.package_url()
    )));

    let dir = tempfile::tempdir().unwrap();
    let config = base_config(server.check_url(), dir.path());

    let mut coordinator = UpdateCoordinator::new(config, Version::new(1, 0, 0, 0)).unwrap();
    let events = record_events(&coordinator);
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    wait_for_state(&mut state_rx, UpdaterState::TemporaryError).await;

    let events_clone = events.clone();
    wait_until(move || {
        events_clone
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, UpdateEvent::CheckError { .. }))
    })
    .await;

    // An unverifiable package must never reach disk or the installer
    assert!(server.range_requests().is_empty(), "package must not be requested");
    let markers = MarkerStore::new(dir.path().join("data"));
    assert!(markers.read_download().is_none());
    assert!(markers.read_install().is_none());

    coordinator.shutdown().await;
}

// A server answering a ranged resume request with a plain 200 gets the file
// restarted from zero: the final bytes are exactly the full package, not the
// partial prefix with a second copy appended.
#[tokio::test]
async fn ranged_request_answered_with_full_body_restarts_from_zero() {
    let package = test_package();
    let hash = package_hash(&package).await;
    let server = MockServer::start(CheckReply::Body(String::new()), package.clone()).await;
    server.set_honor_range(false);

    let dir = tempfile::tempdir().unwrap();
    let config = base_config(server.check_url(), dir.path());
    let running = Version::new(1, 0, 0, 0);
    let data_dir = config.resolve_data_dir().unwrap();
    let download_dir = config.resolve_download_dir().unwrap();

    let partial_len = 20_000usize;
    let path = download_dir.join("update-release-1.2.3.4.pkg");
    tokio::fs::write(&path, &package[..partial_len]).await.unwrap();
    let markers = MarkerStore::new(&data_dir);
    markers
        .write_download(&DownloadMarker {
            current_version: running.to_string(),
            update_channel: "Release".to_string(),
            update_version: "1.2.3.4".to_string(),
            url: server.package_url(),
            hash,
            path: path.clone(),
            required: false,
            more_info: String::new(),
        })
        .unwrap();

    let mut coordinator = UpdateCoordinator::new(config, running).unwrap();
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    wait_for_state(&mut state_rx, UpdaterState::Terminal).await;

    let ranges = server.range_requests();
    assert_eq!(ranges.len(), 1, "expected exactly one package request");
    assert!(ranges[0].is_some(), "resume still asks for a range");

    // Truncate-and-restart, not append: the file equals the served package
    let downloaded = tokio::fs::read(&path).await.unwrap();
    assert_eq!(downloaded.len(), package.len());
    assert_eq!(downloaded, package);
    assert!(markers.read_install().is_some(), "restarted download still verifies");
    assert!(markers.read_download().is_none());

    coordinator.shutdown().await;
}

// Cancelling mid-transfer keeps the download marker and the partial file so
// the next run can resume; no download-error is reported.
#[tokio::test]
async fn cancel_mid_download_keeps_marker_and_partial() {
    let package = test_package();
    let hash = package_hash(&package).await;
    let server = MockServer::start(CheckReply::Body(String::new()), package.clone()).await;
    server.set_check_reply(CheckReply::Body(descriptor_body(&server.package_url(), &hash)));
    // 16 chunks, 100ms apart: plenty of time to cancel with bytes in flight
    server.set_chunk_delay(Duration::from_millis(100));

    let dir = tempfile::tempdir().unwrap();
    let config = base_config(server.check_url(), dir.path());
    let path = dir.path().join("downloads").join("update-release-1.2.3.4.pkg");

    let mut coordinator = UpdateCoordinator::new(config, Version::new(1, 0, 0, 0)).unwrap();
    let events = record_events(&coordinator);
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    // Cancel as soon as the first bytes hit disk
    let path_clone = path.clone();
    wait_until(move || {
        std::fs::metadata(&path_clone)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false)
    })
    .await;
    coordinator.stop_checking();
    wait_for_state(&mut state_rx, UpdaterState::Terminal).await;

    // Give the transfer loop a few chunk periods to observe the cancel
    tokio::time::sleep(Duration::from_millis(500)).await;

    let markers = MarkerStore::new(dir.path().join("data"));
    let marker = markers
        .read_download()
        .expect("download marker must survive cancellation");
    assert_eq!(marker.path, path);
    assert!(markers.read_install().is_none(), "cancelled download must not promote");

    let len = std::fs::metadata(&path).unwrap().len();
    assert!(len > 0, "partial bytes must be kept");
    assert!(len < package.len() as u64, "transfer must not have completed");

    // Cancellation is not an error
    assert!(
        !events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, UpdateEvent::DownloadError { .. }))
    );

    coordinator.shutdown().await;
}

// A download marker written by a different binary version is discarded along
// with its partial file, and startup proceeds straight to a fresh check.
#[tokio::test]
async fn stale_download_marker_is_discarded() {
    let server = MockServer::start(CheckReply::Body(String::new()), test_package()).await;

    let dir = tempfile::tempdir().unwrap();
    let config = base_config(server.check_url(), dir.path());
    let data_dir = config.resolve_data_dir().unwrap();
    let download_dir = config.resolve_download_dir().unwrap();

    let path = download_dir.join("update-release-1.2.3.4.pkg");
    tokio::fs::write(&path, b"partial bytes").await.unwrap();
    // An even older package no marker points at anymore
    let orphan = download_dir.join("update-release-1.1.0.0.pkg");
    tokio::fs::write(&orphan, b"old package").await.unwrap();
    let markers = MarkerStore::new(&data_dir);
    markers
        .write_download(&DownloadMarker {
            current_version: "0.9.0.0".to_string(), // not the running version
            update_channel: "Release".to_string(),
            update_version: "1.2.3.4".to_string(),
            url: server.package_url(),
            hash: String::new(),
            path: path.clone(),
            required: false,
            more_info: String::new(),
        })
        .unwrap();

    let mut coordinator =
        UpdateCoordinator::new(config, Version::new(1, 0, 0, 0)).unwrap();
    let events = record_events(&coordinator);
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    wait_for_state(&mut state_rx, UpdaterState::UpToDate).await;

    assert!(markers.read_download().is_none(), "stale marker must be gone");
    assert!(!path.exists(), "stale partial file must be gone");
    assert!(!orphan.exists(), "orphaned packages are swept with the stale marker");
    assert!(server.range_requests().is_empty(), "no resume may be attempted");
    // Stale markers are expected after a binary upgrade, not an error
    assert!(
        !events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, UpdateEvent::DownloadError { .. }))
    );

    coordinator.shutdown().await;
}

// A package whose recomputed hash differs from the descriptor's is a
// download error: the file and marker are discarded and no install marker
// appears.
#[tokio::test]
async fn hash_mismatch_discards_file_and_marker() {
    let package = test_package();
    let server = MockServer::start(CheckReply::Body(String::new()), package.clone()).await;
    server.set_check_reply(CheckReply::Body(descriptor_body(&server.package_url(), "deadbeef")));

    let dir = tempfile::tempdir().unwrap();
    let config = base_config(server.check_url(), dir.path());

    let mut coordinator = UpdateCoordinator::new(config, Version::new(1, 0, 0, 0)).unwrap();
    let events = record_events(&coordinator);
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    wait_for_state(&mut state_rx, UpdaterState::Failure).await;

    let events_clone = events.clone();
    wait_until(move || {
        events_clone
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, UpdateEvent::DownloadError { .. }))
    })
    .await;

    let markers = MarkerStore::new(dir.path().join("data"));
    assert!(markers.read_install().is_none(), "no install marker on mismatch");
    assert!(markers.read_download().is_none(), "download marker discarded");

    let package_path = dir.path().join("downloads").join("update-release-1.2.3.4.pkg");
    assert!(!package_path.exists(), "corrupt package must be removed");

    coordinator.shutdown().await;
}

// The download marker is written before any transfer byte is requested: even
// against an unreachable package server the marker exists afterwards.
#[tokio::test]
async fn download_marker_precedes_transfer() {
    let package = test_package();
    let hash = package_hash(&package).await;
    // Port 1 on localhost: connection refused, no byte ever transferred
    let server = MockServer::start(CheckReply::Body(String::new()), Vec::new()).await;
    server.set_check_reply(CheckReply::Body(descriptor_body("http://127.0.0.1:1/pkg", &hash)));

    let dir = tempfile::tempdir().unwrap();
    let config = base_config(server.check_url(), dir.path());

    let mut coordinator = UpdateCoordinator::new(config, Version::new(1, 0, 0, 0)).unwrap();
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    wait_for_state(&mut state_rx, UpdaterState::Failure).await;

    // Transport failure retains the marker for a later resume
    let markers = MarkerStore::new(dir.path().join("data"));
    let marker = markers.read_download().expect("marker must survive transport failure");
    assert_eq!(marker.update_version, "1.2.3.4");
    assert_eq!(marker.current_version, "1.0.0.0");

    coordinator.shutdown().await;
}

// Auto-install hand-off: with an install command configured, a completed
// download launches the installer and consumes the install marker.
#[cfg(unix)]
#[tokio::test]
async fn auto_install_launches_and_consumes_marker() {
    let package = test_package();
    let hash = package_hash(&package).await;
    let server = MockServer::start(CheckReply::Body(String::new()), package.clone()).await;
    server.set_check_reply(CheckReply::Body(descriptor_body(&server.package_url(), &hash)));

    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(server.check_url(), dir.path());
    config.auto_install = true;
    config.install_command = "true".to_string();

    let mut coordinator = UpdateCoordinator::new(config, Version::new(1, 0, 0, 0)).unwrap();
    let events = record_events(&coordinator);
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    wait_for_state(&mut state_rx, UpdaterState::Terminal).await;

    let markers = MarkerStore::new(dir.path().join("data"));
    assert!(markers.read_install().is_none(), "install marker consumed by invoke");
    assert!(
        !events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, UpdateEvent::InstallError { .. }))
    );

    coordinator.shutdown().await;
}

// Install failure: the installer cannot launch, an install-error event fires
// carrying the required flag, and the marker is removed regardless.
#[tokio::test]
async fn failed_install_launch_reports_and_removes_marker() {
    let package = test_package();
    let hash = package_hash(&package).await;
    let server = MockServer::start(CheckReply::Body(String::new()), package.clone()).await;
    server.set_check_reply(CheckReply::Body(format!(
        r#"{{"url": "{}", "hash": "{}", "version": "1.2.3.4", "required": true}}"#,
        server.package_url(),
        hash
    )));

    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(server.check_url(), dir.path());
    config.auto_install = true;
    config.install_command = "/nonexistent/installer-binary".to_string();

    let mut coordinator = UpdateCoordinator::new(config, Version::new(1, 0, 0, 0)).unwrap();
    let events = record_events(&coordinator);
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    wait_for_state(&mut state_rx, UpdaterState::Terminal).await;

    let markers = MarkerStore::new(dir.path().join("data"));
    assert!(markers.read_install().is_none(), "marker removed even on failure");

    let events = events.lock().unwrap();
    let install_error = events
        .iter()
        .find(|event| matches!(event, UpdateEvent::InstallError { .. }))
        .expect("no install-error event");
    if let UpdateEvent::InstallError { required, .. } = install_error {
        assert!(*required);
    }

    coordinator.shutdown().await;
}

// A valid install marker found at startup with auto-install disabled leaves
// the marker in place for the host to act on.
#[tokio::test]
async fn startup_with_install_marker_defers_when_not_auto_installing() {
    let server = MockServer::start(CheckReply::Body(String::new()), Vec::new()).await;

    let dir = tempfile::tempdir().unwrap();
    let config = base_config(server.check_url(), dir.path());
    let data_dir = config.resolve_data_dir().unwrap();
    let running = Version::new(1, 0, 0, 0);

    let markers = MarkerStore::new(&data_dir);
    let download = DownloadMarker {
        current_version: running.to_string(),
        update_channel: "Release".to_string(),
        update_version: "1.2.3.4".to_string(),
        url: server.package_url(),
        hash: String::new(),
        path: dir.path().join("downloads").join("pkg"),
        required: false,
        more_info: String::new(),
    };
    markers
        .write_install(&update_agent::InstallMarker::from_download(&download))
        .unwrap();

    let mut coordinator = UpdateCoordinator::new(config, running).unwrap();
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    wait_for_state(&mut state_rx, UpdaterState::Terminal).await;

    assert!(markers.read_install().is_some(), "marker left for the host");
    assert!(server.check_hits().is_empty(), "no check while an install is pending");
    assert!(markers.read_download().is_none());

    coordinator.shutdown().await;
}

// stop_checking cancels cleanly and leaves markers recoverable.
#[tokio::test]
async fn stop_checking_forces_terminal_and_keeps_markers() {
    let server = MockServer::start(CheckReply::Status(500), Vec::new()).await;

    let dir = tempfile::tempdir().unwrap();
    let config = base_config(server.check_url(), dir.path());

    let mut coordinator = UpdateCoordinator::new(config, Version::new(1, 0, 0, 0)).unwrap();
    let mut state_rx = coordinator.state_watch();
    coordinator.start_checking().unwrap();

    wait_for_state(&mut state_rx, UpdaterState::TemporaryError).await;
    coordinator.stop_checking();
    wait_for_state(&mut state_rx, UpdaterState::Terminal).await;

    coordinator.shutdown().await;
}
