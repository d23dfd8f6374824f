use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use futures_util::{future::{self, BoxFuture}, stream, StreamExt};
use modelfetch::{
    fetch::transport::{Body, Response, ResponseKind, Transport},
    ArtifactStatus, Catalog, FetchConfig, FetchError, FetchEvent, FetchObserver, Fetcher, LocalState,
    ModelSpec, TransportError,
};
use tempfile::TempDir;
use tokio::time::Instant;

const BASE: &str = "http://models.test/main";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Serve,
    Refuse,
    /// Send this many bytes from the requested offset, then reset the connection.
    CutAfter(usize),
    /// Send this many bytes, then go silent forever.
    StallAfter(usize),
    Empty,
    RejectRange,
    IgnoreRange,
    /// Accept the request and never answer it.
    NoHeaders,
}

struct Route {
    content: Vec<u8>,
    steps: VecDeque<Step>,
    fallback: Step,
}

#[derive(Debug, Clone)]
struct Call {
    url: String,
    offset: u64,
    at: Duration,
}

/// Scripted transport: each URL replays a list of steps, then repeats its fallback.
struct FakeTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<Call>>,
    start: Instant,
}

impl FakeTransport {
    fn new() -> Self {
        Self { routes: Mutex::new(HashMap::new()), calls: Mutex::new(Vec::new()), start: Instant::now() }
    }

    fn route(self, name: &str, content: &[u8], steps: &[Step], fallback: Step) -> Self {
        self.routes.lock().unwrap().insert(
            format!("{BASE}/{name}"),
            Route { content: content.to_vec(), steps: steps.iter().copied().collect(), fallback },
        );
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn offsets_for(&self, name: &str) -> Vec<u64> {
        let url = format!("{BASE}/{name}");
        self.calls().into_iter().filter(|c| c.url == url).map(|c| c.offset).collect()
    }
}

enum Tail {
    End,
    Reset,
    Silent,
}

fn body(data: &[u8], tail: Tail) -> Body {
    let chunks: Vec<Result<Bytes, TransportError>> =
        data.chunks(1024).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
    let head = stream::iter(chunks);
    match tail {
        Tail::End => head.boxed(),
        Tail::Reset => head
            .chain(stream::iter(vec![Err(TransportError::Body("connection reset".into()))]))
            .boxed(),
        Tail::Silent => head.chain(stream::pending()).boxed(),
    }
}

fn respond(content: &[u8], step: Step, offset: u64) -> Result<Response, TransportError> {
    let from = (offset as usize).min(content.len());
    let total = Some(content.len() as u64);
    let kind = if offset > 0 { ResponseKind::Resumed } else { ResponseKind::Full };
    let end = |n: usize| (from + n).min(content.len());
    match step {
        Step::Serve => Ok(Response::new(kind, total, body(&content[from..], Tail::End))),
        Step::Refuse => Err(TransportError::Status(503)),
        Step::CutAfter(n) => Ok(Response::new(kind, total, body(&content[from..end(n)], Tail::Reset))),
        Step::StallAfter(n) => Ok(Response::new(kind, total, body(&content[from..end(n)], Tail::Silent))),
        Step::Empty => Ok(Response::new(ResponseKind::Full, Some(0), body(&[], Tail::End))),
        Step::RejectRange if offset > 0 => Err(TransportError::RangeNotSatisfiable),
        Step::RejectRange => Ok(Response::new(kind, total, body(content, Tail::End))),
        Step::IgnoreRange => Ok(Response::new(ResponseKind::Full, total, body(content, Tail::End))),
        Step::NoHeaders => unreachable!("handled by the transport"),
    }
}

impl Transport for FakeTransport {
    fn get<'a>(&'a self, url: &'a str, offset: u64) -> BoxFuture<'a, Result<Response, TransportError>> {
        self.calls.lock().unwrap().push(Call { url: url.to_string(), offset, at: self.start.elapsed() });
        let mut routes = self.routes.lock().unwrap();
        let result = match routes.get_mut(url) {
            Some(route) => match route.steps.pop_front().unwrap_or(route.fallback) {
                Step::NoHeaders => return Box::pin(future::pending()),
                step => respond(&route.content, step, offset),
            },
            None => Err(TransportError::Status(404)),
        };
        Box::pin(future::ready(result))
    }
}

/// Records progress and flags any moment where the destination is visible
/// while bytes are still arriving.
struct Watcher {
    destination: PathBuf,
    saw_destination_early: AtomicBool,
    max_bytes: AtomicU64,
    retries: AtomicU64,
}

impl Watcher {
    fn new(destination: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            destination,
            saw_destination_early: AtomicBool::new(false),
            max_bytes: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        })
    }
}

impl FetchObserver for Watcher {
    fn on_event(&self, event: &FetchEvent<'_>) {
        match event {
            FetchEvent::Progress { bytes, .. } => {
                self.max_bytes.fetch_max(*bytes, Ordering::SeqCst);
                if self.destination.exists() {
                    self.saw_destination_early.store(true, Ordering::SeqCst);
                }
            }
            FetchEvent::Retrying { .. } => {
                self.retries.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

fn config(dir: &Path) -> FetchConfig {
    FetchConfig {
        model_dir: dir.to_path_buf(),
        model_url: BASE.to_string(),
        model_names: Vec::new(),
        overrides: BTreeMap::new(),
        backoff_unit: Duration::ZERO,
        ..FetchConfig::default()
    }
}

fn specs(names: &[&str]) -> Vec<ModelSpec> {
    Catalog::new(BASE, BTreeMap::new()).specs(names).unwrap()
}

fn artifact(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn part_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "part"))
        .collect()
}

#[tokio::test]
async fn second_run_makes_no_requests() {
    let tmp = TempDir::new().unwrap();
    let a = artifact(5000);
    let b = artifact(70);
    let transport = Arc::new(
        FakeTransport::new()
            .route("a.bin", &a, &[], Step::Serve)
            .route("b.bin", &b, &[], Step::Serve),
    );
    let fetcher = Fetcher::with_transport(config(tmp.path()), transport.clone());
    let list = specs(&["a.bin", "b.bin"]);

    let first = fetcher.fetch_all(&list).await.unwrap();
    assert!(first.is_success());
    assert!(first.artifacts.iter().all(|r| r.status == ArtifactStatus::Completed));
    assert_eq!(transport.calls().len(), 2);

    let second = fetcher.fetch_all(&list).await.unwrap();
    assert!(second.artifacts.iter().all(|r| r.status == ArtifactStatus::AlreadySatisfied));
    assert_eq!(second.get("a.bin").unwrap().size, 5000);
    assert_eq!(second.get("a.bin").unwrap().attempts, 0);
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test]
async fn empty_destination_is_not_satisfied() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a.bin"), b"").unwrap();
    let a = artifact(300);
    let transport = Arc::new(FakeTransport::new().route("a.bin", &a, &[], Step::Serve));
    let fetcher = Fetcher::with_transport(config(tmp.path()), transport.clone());

    let report = fetcher.fetch_all(&specs(&["a.bin"])).await.unwrap();
    assert_eq!(report.artifacts[0].status, ArtifactStatus::Completed);
    assert_eq!(fs::read(tmp.path().join("a.bin")).unwrap(), a);
}

#[tokio::test]
async fn resumed_attempts_assemble_exact_content() {
    let tmp = TempDir::new().unwrap();
    let a = artifact(10_000);
    let transport = Arc::new(FakeTransport::new().route(
        "a.bin",
        &a,
        &[Step::CutAfter(3000), Step::CutAfter(3000)],
        Step::Serve,
    ));
    let watcher = Watcher::new(tmp.path().join("a.bin"));
    let fetcher =
        Fetcher::with_transport(config(tmp.path()), transport.clone()).observer(watcher.clone());

    let report = fetcher.fetch_all(&specs(&["a.bin"])).await.unwrap();
    let a_report = report.get("a.bin").unwrap();
    assert_eq!(a_report.status, ArtifactStatus::Completed);
    assert_eq!(a_report.attempts, 3);
    assert_eq!(a_report.size, 10_000);
    assert_eq!(transport.offsets_for("a.bin"), [0, 3000, 6000]);
    assert_eq!(fs::read(tmp.path().join("a.bin")).unwrap(), a);
    assert!(!watcher.saw_destination_early.load(Ordering::SeqCst));
    assert_eq!(watcher.max_bytes.load(Ordering::SeqCst), 10_000);
    assert!(part_files(tmp.path()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn always_failing_url_gets_exactly_five_attempts() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(FakeTransport::new().route("a.bin", b"unused", &[], Step::Refuse));
    let mut cfg = config(tmp.path());
    cfg.backoff_unit = Duration::from_secs(1);
    let watcher = Watcher::new(tmp.path().join("a.bin"));
    let fetcher = Fetcher::with_transport(cfg, transport.clone()).observer(watcher.clone());

    let report = fetcher.fetch_all(&specs(&["a.bin"])).await.unwrap();
    let a_report = report.get("a.bin").unwrap();
    assert!(matches!(&a_report.status, ArtifactStatus::Failed { reason } if reason.contains("503")));
    assert_eq!(a_report.attempts, 5);

    let starts: Vec<u64> = transport.calls().iter().map(|c| c.at.as_secs()).collect();
    assert_eq!(starts, [0, 2, 6, 12, 20]);
    assert_eq!(watcher.retries.load(Ordering::SeqCst), 4);
    assert!(!report.is_success());
    assert_eq!(report.failed_names(), ["a.bin"]);
}

#[tokio::test]
async fn one_failure_does_not_block_the_next() {
    let tmp = TempDir::new().unwrap();
    let b = artifact(2048);
    let transport = Arc::new(
        FakeTransport::new()
            .route("a.bin", b"x", &[], Step::Refuse)
            .route("b.bin", &b, &[], Step::Serve),
    );
    let fetcher = Fetcher::with_transport(config(tmp.path()), transport.clone());

    let report = fetcher.fetch_all(&specs(&["a.bin", "b.bin"])).await.unwrap();
    assert!(matches!(report.artifacts[0].status, ArtifactStatus::Failed { .. }));
    assert_eq!(report.artifacts[1].status, ArtifactStatus::Completed);
    assert_eq!(fs::read(tmp.path().join("b.bin")).unwrap(), b);
    assert!(!tmp.path().join("a.bin").exists());
    assert_eq!(report.failed_names(), ["a.bin"]);
}

#[tokio::test]
async fn empty_body_counts_as_failed_attempt() {
    let tmp = TempDir::new().unwrap();
    let b = artifact(100);
    let transport = Arc::new(
        FakeTransport::new()
            .route("a.bin", b"never", &[], Step::Empty)
            .route("b.bin", &b, &[Step::Empty], Step::Serve),
    );
    let fetcher = Fetcher::with_transport(config(tmp.path()), transport.clone());

    let report = fetcher.fetch_all(&specs(&["a.bin", "b.bin"])).await.unwrap();
    let a_report = report.get("a.bin").unwrap();
    assert!(matches!(&a_report.status, ArtifactStatus::Failed { reason } if reason.contains("empty")));
    assert_eq!(a_report.attempts, 5);
    assert!(!tmp.path().join("a.bin").exists());

    let b_report = report.get("b.bin").unwrap();
    assert_eq!(b_report.status, ArtifactStatus::Completed);
    assert_eq!(b_report.attempts, 2);
    assert!(part_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn failed_session_leaves_no_partial_files() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("stale.bin.part"), b"from an older run").unwrap();
    let a = artifact(8000);
    let transport = Arc::new(FakeTransport::new().route("a.bin", &a, &[], Step::CutAfter(100)));
    let fetcher = Fetcher::with_transport(config(tmp.path()), transport.clone());

    let report = fetcher.fetch_all(&specs(&["a.bin"])).await.unwrap();
    assert!(!report.is_success());
    // Each attempt resumed where the previous one stopped.
    assert_eq!(transport.offsets_for("a.bin"), [0, 100, 200, 300, 400]);
    assert!(part_files(tmp.path()).is_empty());
    assert!(!tmp.path().join("a.bin").exists());
}

#[tokio::test]
async fn cancelled_session_removes_partial_files() {
    let tmp = TempDir::new().unwrap();
    let a = artifact(50_000);
    let transport = Arc::new(FakeTransport::new().route("a.bin", &a, &[], Step::StallAfter(4096)));
    let mut cfg = config(tmp.path());
    cfg.min_rate = 0;
    let watcher = Watcher::new(tmp.path().join("a.bin"));
    let fetcher = Fetcher::with_transport(cfg, transport.clone()).observer(watcher.clone());
    let list = specs(&["a.bin"]);

    let outcome = tokio::time::timeout(Duration::from_millis(300), fetcher.fetch_all(&list)).await;
    assert!(outcome.is_err(), "session should still be waiting on the silent body");
    assert_eq!(watcher.max_bytes.load(Ordering::SeqCst), 4096);
    assert!(part_files(tmp.path()).is_empty());
    assert!(!tmp.path().join("a.bin").exists());
}

#[tokio::test(start_paused = true)]
async fn silent_transfer_is_abandoned_as_stalled() {
    let tmp = TempDir::new().unwrap();
    let a = artifact(50_000);
    let transport = Arc::new(FakeTransport::new().route("a.bin", &a, &[], Step::StallAfter(100)));
    let mut cfg = config(tmp.path());
    cfg.max_attempts = 2;
    let fetcher = Fetcher::with_transport(cfg, transport.clone());

    let report = fetcher.fetch_all(&specs(&["a.bin"])).await.unwrap();
    let a_report = report.get("a.bin").unwrap();
    assert!(matches!(&a_report.status, ArtifactStatus::Failed { reason } if reason.contains("stalled")));
    assert_eq!(transport.offsets_for("a.bin"), [0, 100]);
    assert!(part_files(tmp.path()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_is_abandoned_as_stalled() {
    let tmp = TempDir::new().unwrap();
    let a = artifact(3000);
    let b = artifact(2000);
    let transport = Arc::new(
        FakeTransport::new()
            .route("a.bin", &a, &[], Step::NoHeaders)
            .route("b.bin", &b, &[], Step::Serve),
    );
    let mut cfg = config(tmp.path());
    cfg.max_attempts = 2;
    let fetcher = Fetcher::with_transport(cfg, transport.clone());

    let report = fetcher.fetch_all(&specs(&["a.bin", "b.bin"])).await.unwrap();
    let a_report = report.get("a.bin").unwrap();
    assert!(matches!(&a_report.status, ArtifactStatus::Failed { reason } if reason.contains("stalled")));
    assert_eq!(a_report.attempts, 2);
    assert_eq!(report.get("b.bin").unwrap().status, ArtifactStatus::Completed);
    // Each attempt gave up after one stall window of waiting for headers.
    let calls = transport.calls();
    assert_eq!(calls[0].at, Duration::ZERO);
    assert_eq!(calls[1].at, Duration::from_secs(30));
    assert!(part_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn rejected_range_restarts_from_zero() {
    let tmp = TempDir::new().unwrap();
    let a = artifact(4000);
    let transport = Arc::new(FakeTransport::new().route(
        "a.bin",
        &a,
        &[Step::CutAfter(1000), Step::RejectRange],
        Step::Serve,
    ));
    let fetcher = Fetcher::with_transport(config(tmp.path()), transport.clone());

    let report = fetcher.fetch_all(&specs(&["a.bin"])).await.unwrap();
    assert_eq!(report.artifacts[0].status, ArtifactStatus::Completed);
    assert_eq!(transport.offsets_for("a.bin"), [0, 1000, 0]);
    assert_eq!(fs::read(tmp.path().join("a.bin")).unwrap(), a);
}

#[tokio::test]
async fn ignored_range_truncates_partial() {
    let tmp = TempDir::new().unwrap();
    let a = artifact(4000);
    let transport = Arc::new(FakeTransport::new().route(
        "a.bin",
        &a,
        &[Step::CutAfter(1500)],
        Step::IgnoreRange,
    ));
    let fetcher = Fetcher::with_transport(config(tmp.path()), transport.clone());

    let report = fetcher.fetch_all(&specs(&["a.bin"])).await.unwrap();
    assert_eq!(report.artifacts[0].attempts, 2);
    assert_eq!(fs::read(tmp.path().join("a.bin")).unwrap(), a);
}

#[tokio::test]
async fn override_url_is_requested() {
    let tmp = TempDir::new().unwrap();
    let mut overrides = BTreeMap::new();
    overrides.insert("vad.bin".to_string(), format!("{BASE}/elsewhere/vad.bin"));
    let list = Catalog::new(BASE, overrides).specs(&["vad.bin"]).unwrap();
    let transport = Arc::new(FakeTransport::new().route("elsewhere/vad.bin", b"vad", &[], Step::Serve));
    let fetcher = Fetcher::with_transport(config(tmp.path()), transport.clone());

    let report = fetcher.fetch_all(&list).await.unwrap();
    assert!(report.is_success());
    assert_eq!(transport.calls()[0].url, format!("{BASE}/elsewhere/vad.bin"));
    assert_eq!(fs::read(tmp.path().join("vad.bin")).unwrap(), b"vad");
}

#[tokio::test]
async fn uncreatable_target_dir_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let blocker = tmp.path().join("blocker");
    fs::write(&blocker, b"not a directory").unwrap();
    let transport = Arc::new(FakeTransport::new());
    let fetcher = Fetcher::with_transport(config(&blocker.join("models")), transport.clone());

    let err = fetcher.fetch_all(&specs(&["a.bin"])).await.unwrap_err();
    assert!(matches!(err, FetchError::TargetDir { .. }));
    assert_eq!(err.exit_code(), 2);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn status_reports_without_network() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a.bin"), b"12345").unwrap();
    fs::write(tmp.path().join("b.bin"), b"").unwrap();
    let transport = Arc::new(FakeTransport::new());
    let fetcher = Fetcher::with_transport(config(tmp.path()), transport.clone());

    let states = fetcher.status(&specs(&["a.bin", "b.bin", "c.bin"])).await;
    let states: Vec<_> = states.into_iter().map(|(s, st)| (s.name, st)).collect();
    assert_eq!(
        states,
        [
            ("a.bin".to_string(), LocalState::Present { size: 5 }),
            ("b.bin".to_string(), LocalState::Missing),
            ("c.bin".to_string(), LocalState::Missing),
        ]
    );
    assert!(transport.calls().is_empty());
}
