use super::*;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Barrier;

use relaunch_core::{UpdateError, Version};
use relaunch_security::sha256_hex;

use crate::store::parse_record;

const ASSET: &str = "nym-node";

#[derive(Default)]
struct FakeFetcher {
    payloads: HashMap<String, Vec<u8>>,
    texts: HashMap<String, String>,
    truncate: bool,
    requested: RefCell<Vec<String>>,
}

impl FakeFetcher {
    fn serving(url: &str, payload: &[u8]) -> Self {
        let mut fetcher = Self::default();
        fetcher.payloads.insert(url.to_string(), payload.to_vec());
        fetcher
    }
}

impl ArtifactFetcher for FakeFetcher {
    fn fetch_to_path(&self, url: &str, dest: &Path) -> Result<u64, UpdateError> {
        self.requested.borrow_mut().push(url.to_string());
        let payload = self
            .payloads
            .get(url)
            .ok_or_else(|| UpdateError::Download(format!("GET {url} returned 404 Not Found")))?;
        if self.truncate {
            fs::write(dest, &payload[..payload.len() / 2]).expect("must write partial payload");
            return Err(UpdateError::Download(format!(
                "incomplete transfer of {url}: received {} of {} bytes",
                payload.len() / 2,
                payload.len()
            )));
        }
        fs::write(dest, payload).expect("must write payload");
        Ok(payload.len() as u64)
    }

    fn fetch_text(&self, url: &str) -> Result<String, UpdateError> {
        self.requested.borrow_mut().push(url.to_string());
        self.texts
            .get(url)
            .cloned()
            .ok_or_else(|| UpdateError::Download(format!("GET {url} returned 404 Not Found")))
    }
}

fn test_root() -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let root = std::env::temp_dir().join(format!(
        "relaunch-installer-tests-{}-{nanos}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&root).expect("must create test root");
    root
}

fn test_layout(root: &Path) -> StateLayout {
    let layout = StateLayout::new(root.join("state"), root.join("bin").join(ASSET));
    fs::create_dir_all(root.join("bin")).expect("must create bin dir");
    layout.ensure_base_dirs().expect("must create state dir");
    layout
}

fn test_plan() -> InstallPlan {
    InstallPlan {
        repo: "nymtech/nym".to_string(),
        asset: ASSET.to_string(),
        download_url_template: "https://example.test/{repo}/{tag}/{asset}".to_string(),
        checksum_url_template: None,
        keep_previous: true,
    }
}

fn v(tag: &str) -> Version {
    Version::parse_tag(tag).expect("tag must parse")
}

fn write_live_binary(layout: &StateLayout, payload: &[u8]) {
    fs::write(layout.install_path(), payload).expect("must write live binary");
}

const V120_URL: &str = "https://example.test/nymtech/nym/v1.2.0/nym-node";

#[test]
fn layout_places_state_and_siblings() {
    let layout = StateLayout::new("/var/lib/relaunch", "/opt/nym/nym-node");
    assert_eq!(
        layout.record_path(),
        PathBuf::from("/var/lib/relaunch/installed.record")
    );
    assert_eq!(layout.lock_path(), PathBuf::from("/var/lib/relaunch/run.lock"));
    assert_eq!(
        layout.previous_record_path(),
        PathBuf::from("/var/lib/relaunch/previous.record")
    );
    assert_eq!(
        layout.last_check_path(),
        PathBuf::from("/var/lib/relaunch/last-check")
    );
    assert_eq!(
        layout.staged_binary_path(),
        PathBuf::from("/opt/nym/.nym-node.relaunch-part")
    );
    assert_eq!(
        layout.previous_binary_path(),
        PathBuf::from("/opt/nym/nym-node.previous")
    );
}

#[test]
fn version_store_is_empty_on_first_run() {
    let root = test_root();
    let store = FileVersionStore::new(test_layout(&root));
    assert_eq!(store.read().expect("must read"), None);
    assert_eq!(store.last_check().expect("must read last check"), None);
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn version_store_round_trip() {
    let root = test_root();
    let store = FileVersionStore::new(test_layout(&root));

    store.write(&v("v1.1.0")).expect("must write");
    store.write(&v("v1.2.0")).expect("must overwrite");

    let record = store
        .read_record()
        .expect("must read")
        .expect("record must exist");
    assert_eq!(record.version, v("v1.2.0"));
    assert!(record.installed_at_unix.is_some());
    assert_eq!(store.read().expect("must read"), Some(v("v1.2.0")));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn version_store_reads_legacy_bare_tag() {
    let root = test_root();
    let layout = test_layout(&root);
    fs::write(layout.record_path(), "nym-binaries-v2025.13-emmental\n").expect("must seed");
    let store = FileVersionStore::new(layout);
    assert_eq!(
        store.read().expect("must read"),
        Some(v("nym-binaries-v2025.13-emmental"))
    );
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn version_store_rejects_corrupt_record() {
    let root = test_root();
    let layout = test_layout(&root);
    fs::write(layout.record_path(), "installed_at_unix=12\n").expect("must seed");
    let store = FileVersionStore::new(layout);
    let err = store.read().expect_err("must reject record without version");
    assert!(matches!(err, UpdateError::Parse(_)));
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn parse_record_ignores_unknown_keys_and_blank_files() {
    assert_eq!(parse_record("\n\n").expect("must parse"), None);
    let record = parse_record("version=v1.1.0\nhost=node-1\ninstalled_at_unix=42\n")
        .expect("must parse")
        .expect("record must exist");
    assert_eq!(record.version, v("v1.1.0"));
    assert_eq!(record.installed_at_unix, Some(42));
}

#[test]
fn last_check_is_recorded_separately_from_version() {
    let root = test_root();
    let layout = test_layout(&root);
    let store = FileVersionStore::new(layout.clone());

    store.record_check(1_700_000_000).expect("must record check");
    assert_eq!(store.last_check().expect("must read"), Some(1_700_000_000));
    assert!(!layout.record_path().exists());

    VersionStore::note_check(&store, 1_700_000_600).expect("must note check");
    assert_eq!(store.last_check().expect("must read"), Some(1_700_000_600));
    assert_eq!(store.read().expect("must read record"), None);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn run_lock_blocks_second_holder_while_owner_alive() {
    let root = test_root();
    let layout = test_layout(&root);

    let lock = RunLock::acquire_with_probe(&layout, |_| true).expect("must acquire");
    assert!(lock.path().exists());
    assert_eq!(
        RunLock::holder(&layout).expect("must read holder"),
        Some(std::process::id())
    );

    let err = RunLock::acquire_with_probe(&layout, |_| true).expect_err("must be held");
    assert!(matches!(err, UpdateError::LockHeld { pid } if pid == Some(std::process::id())));

    drop(lock);
    assert!(!layout.lock_path().exists());
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn run_lock_replaces_stale_marker() {
    let root = test_root();
    let layout = test_layout(&root);
    fs::write(layout.lock_path(), "999999\n").expect("must seed stale lock");

    let lock = RunLock::acquire_with_probe(&layout, |pid| pid != 999_999).expect("must take over");
    assert_eq!(
        RunLock::holder(&layout).expect("must read holder"),
        Some(std::process::id())
    );
    drop(lock);
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn run_lock_treats_fresh_unreadable_marker_as_held() {
    let root = test_root();
    let layout = test_layout(&root);
    fs::write(layout.lock_path(), "").expect("must seed empty lock");

    let err = RunLock::acquire_with_probe(&layout, |_| false).expect_err("must be held");
    assert!(matches!(err, UpdateError::LockHeld { pid: None }));
    assert_eq!(fs::read_to_string(layout.lock_path()).expect("must keep lock"), "");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn run_lock_reclaims_old_unreadable_marker() {
    let root = test_root();
    let layout = test_layout(&root);
    fs::write(layout.lock_path(), "garbage").expect("must seed lock");
    let aged = std::time::SystemTime::now() - std::time::Duration::from_secs(120);
    fs::File::options()
        .write(true)
        .open(layout.lock_path())
        .and_then(|file| file.set_modified(aged))
        .expect("must age lock");

    let lock = RunLock::acquire_with_probe(&layout, |_| true).expect("must take over");
    assert_eq!(
        RunLock::holder(&layout).expect("must read holder"),
        Some(std::process::id())
    );
    drop(lock);
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn run_lock_admits_one_of_many_racing_takeovers() {
    let root = test_root();
    let layout = test_layout(&root);
    fs::write(layout.lock_path(), "999999\n").expect("must seed stale lock");

    let barrier = Barrier::new(8);
    let (barrier, shared) = (&barrier, &layout);
    let results = std::thread::scope(|scope| {
        let handles = (0..8)
            .map(|_| {
                scope.spawn(move || {
                    barrier.wait();
                    RunLock::acquire_with_probe(shared, |pid| pid != 999_999)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("claimant must not panic"))
            .collect::<Vec<_>>()
    });

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|result| result.as_ref().err())
        .all(|err| matches!(err, UpdateError::LockHeld { .. })));

    drop(results);
    let leftovers = fs::read_dir(layout.state_dir())
        .expect("must list state dir")
        .count();
    assert_eq!(leftovers, 0);
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn install_swaps_binary_and_keeps_previous() {
    let root = test_root();
    let layout = test_layout(&root);
    write_live_binary(&layout, b"old-binary");

    let installer = ArtifactInstaller::new(
        layout.clone(),
        test_plan(),
        FakeFetcher::serving(V120_URL, b"new-binary"),
    );
    let installed = installer.install(&v("v1.2.0")).expect("must install");

    assert_eq!(fs::read(layout.install_path()).expect("must read"), b"new-binary");
    assert_eq!(installed.size, 10);
    assert_eq!(installed.sha256, sha256_hex(b"new-binary"));
    assert_eq!(installed.previous, Some(layout.previous_binary_path()));
    assert_eq!(
        fs::read(layout.previous_binary_path()).expect("must read previous"),
        b"old-binary"
    );
    assert!(!layout.staged_binary_path().exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(layout.install_path())
            .expect("must stat")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn install_without_existing_binary_keeps_nothing() {
    let root = test_root();
    let layout = test_layout(&root);

    let installer = ArtifactInstaller::new(
        layout.clone(),
        test_plan(),
        FakeFetcher::serving(V120_URL, b"new-binary"),
    );
    let installed = installer.install(&v("v1.2.0")).expect("must install");
    assert_eq!(installed.previous, None);
    assert!(!layout.previous_binary_path().exists());
    assert_eq!(fs::read(layout.install_path()).expect("must read"), b"new-binary");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn install_without_keep_previous_leaves_no_copy() {
    let root = test_root();
    let layout = test_layout(&root);
    write_live_binary(&layout, b"old-binary");

    let mut plan = test_plan();
    plan.keep_previous = false;
    let installer =
        ArtifactInstaller::new(layout.clone(), plan, FakeFetcher::serving(V120_URL, b"new"));
    let installed = installer.install(&v("v1.2.0")).expect("must install");
    assert_eq!(installed.previous, None);
    assert!(!layout.previous_binary_path().exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn failed_download_leaves_live_binary_untouched() {
    let root = test_root();
    let layout = test_layout(&root);
    write_live_binary(&layout, b"old-binary");

    let installer = ArtifactInstaller::new(layout.clone(), test_plan(), FakeFetcher::default());
    let err = installer.install(&v("v1.2.0")).expect_err("must fail");
    assert!(matches!(err, UpdateError::Download(_)));
    assert_eq!(fs::read(layout.install_path()).expect("must read"), b"old-binary");
    assert!(!layout.staged_binary_path().exists());
    assert!(!layout.previous_binary_path().exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn truncated_download_is_discarded() {
    let root = test_root();
    let layout = test_layout(&root);
    write_live_binary(&layout, b"old-binary");

    let mut fetcher = FakeFetcher::serving(V120_URL, b"new-binary-payload");
    fetcher.truncate = true;
    let installer = ArtifactInstaller::new(layout.clone(), test_plan(), fetcher);
    let err = installer.install(&v("v1.2.0")).expect_err("must fail");
    assert!(err.to_string().contains("incomplete transfer"));
    assert_eq!(fs::read(layout.install_path()).expect("must read"), b"old-binary");
    assert!(!layout.staged_binary_path().exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn empty_download_is_rejected() {
    let root = test_root();
    let layout = test_layout(&root);
    write_live_binary(&layout, b"old-binary");

    let installer =
        ArtifactInstaller::new(layout.clone(), test_plan(), FakeFetcher::serving(V120_URL, b""));
    let err = installer.install(&v("v1.2.0")).expect_err("must reject empty artifact");
    assert!(matches!(err, UpdateError::Download(ref message) if message.contains("empty")));
    assert_eq!(fs::read(layout.install_path()).expect("must read"), b"old-binary");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn checksum_mismatch_is_an_integrity_error() {
    let root = test_root();
    let layout = test_layout(&root);
    write_live_binary(&layout, b"old-binary");

    let mut plan = test_plan();
    plan.checksum_url_template = Some("https://example.test/{tag}/{asset}.sha256".to_string());
    let mut fetcher = FakeFetcher::serving(V120_URL, b"new-binary");
    fetcher.texts.insert(
        "https://example.test/v1.2.0/nym-node.sha256".to_string(),
        format!("{}  nym-node\n", sha256_hex(b"something-else")),
    );

    let installer = ArtifactInstaller::new(layout.clone(), plan, fetcher);
    let err = installer.install(&v("v1.2.0")).expect_err("must fail integrity");
    match err {
        UpdateError::Integrity { expected, actual } => {
            assert_eq!(expected, sha256_hex(b"something-else"));
            assert_eq!(actual, sha256_hex(b"new-binary"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fs::read(layout.install_path()).expect("must read"), b"old-binary");
    assert!(!layout.staged_binary_path().exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn matching_checksum_installs() {
    let root = test_root();
    let layout = test_layout(&root);

    let mut plan = test_plan();
    plan.checksum_url_template = Some("https://example.test/{tag}/SHA256SUMS".to_string());
    let mut fetcher = FakeFetcher::serving(V120_URL, b"new-binary");
    fetcher.texts.insert(
        "https://example.test/v1.2.0/SHA256SUMS".to_string(),
        format!(
            "{}  other\n{}  nym-node\n",
            sha256_hex(b"other"),
            sha256_hex(b"new-binary")
        ),
    );

    let installer = ArtifactInstaller::new(layout.clone(), plan, fetcher);
    installer.install(&v("v1.2.0")).expect("must install");
    assert_eq!(fs::read(layout.install_path()).expect("must read"), b"new-binary");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn rollback_restores_previous_binary() {
    let root = test_root();
    let layout = test_layout(&root);
    write_live_binary(&layout, b"old-binary");

    let installer = ArtifactInstaller::new(
        layout.clone(),
        test_plan(),
        FakeFetcher::serving(V120_URL, b"new-binary"),
    );
    installer.install(&v("v1.2.0")).expect("must install");
    assert!(installer.rollback().expect("must roll back"));
    assert_eq!(fs::read(layout.install_path()).expect("must read"), b"old-binary");
    assert!(!layout.previous_binary_path().exists());

    assert!(!installer.rollback().expect("second rollback has nothing to restore"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn install_clears_stale_staging_file() {
    let root = test_root();
    let layout = test_layout(&root);
    fs::write(layout.staged_binary_path(), b"half-written").expect("must seed stale part");

    let installer = ArtifactInstaller::new(
        layout.clone(),
        test_plan(),
        FakeFetcher::serving(V120_URL, b"new-binary"),
    );
    installer.install(&v("v1.2.0")).expect("must install");
    assert!(!layout.staged_binary_path().exists());
    assert_eq!(
        *installer.fetcher().requested.borrow(),
        vec![V120_URL.to_string()]
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn manual_rollback_restores_previous_version_record() {
    let root = test_root();
    let layout = test_layout(&root);
    write_live_binary(&layout, b"old-binary");
    let store = FileVersionStore::new(layout.clone());
    store.write(&v("v1.1.0")).expect("must seed record");

    let installer = ArtifactInstaller::new(
        layout.clone(),
        test_plan(),
        FakeFetcher::serving(V120_URL, b"new-binary"),
    );
    installer.install(&v("v1.2.0")).expect("must install");
    assert!(layout.previous_record_path().exists());
    store.write(&v("v1.2.0")).expect("must record healthy install");

    assert!(installer.rollback().expect("must roll back"));
    assert_eq!(
        store.restore_previous().expect("must restore record"),
        Some(v("v1.1.0"))
    );
    assert_eq!(store.read().expect("must read"), Some(v("v1.1.0")));
    assert!(!layout.previous_record_path().exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn manual_rollback_clears_record_when_previous_was_unrecorded() {
    let root = test_root();
    let layout = test_layout(&root);
    write_live_binary(&layout, b"hand-installed");
    let store = FileVersionStore::new(layout.clone());

    let installer = ArtifactInstaller::new(
        layout.clone(),
        test_plan(),
        FakeFetcher::serving(V120_URL, b"new-binary"),
    );
    installer.install(&v("v1.2.0")).expect("must install");
    store.write(&v("v1.2.0")).expect("must record healthy install");

    assert!(installer.rollback().expect("must roll back"));
    assert_eq!(store.restore_previous().expect("must restore record"), None);
    assert_eq!(store.read().expect("must read"), None);

    let _ = fs::remove_dir_all(&root);
}

/// Serves one canned HTTP response on a loopback port, then closes.
fn serve_once(response: Vec<u8>) -> (String, std::thread::JoinHandle<()>) {
    use std::io::{Read, Write};

    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("must bind loopback");
    let base = format!("http://{}", listener.local_addr().expect("must have address"));
    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("must accept request");
        let mut request = Vec::new();
        let mut chunk = [0_u8; 1024];
        while !request.windows(4).any(|window| window == b"\r\n\r\n") {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(read) => request.extend_from_slice(&chunk[..read]),
            }
        }
        let _ = stream.write_all(&response);
    });
    (base, handle)
}

#[test]
fn http_fetcher_streams_complete_body() {
    let root = test_root();
    let mut response = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\n".to_vec();
    response.extend_from_slice(b"new-binary");
    let (base, server) = serve_once(response);

    let fetcher = HttpFetcher::new(std::time::Duration::from_secs(5)).expect("must build client");
    let dest = root.join("artifact");
    let written = fetcher
        .fetch_to_path(&format!("{base}/nym-node"), &dest)
        .expect("must download");

    assert_eq!(written, 10);
    assert_eq!(fs::read(&dest).expect("must read artifact"), b"new-binary");
    server.join().expect("server must finish");
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn http_fetcher_rejects_body_shorter_than_content_length() {
    let root = test_root();
    let mut response =
        b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n".to_vec();
    response.extend_from_slice(&[7_u8; 50]);
    let (base, server) = serve_once(response);

    let fetcher = HttpFetcher::new(std::time::Duration::from_secs(5)).expect("must build client");
    let err = fetcher
        .fetch_to_path(&format!("{base}/nym-node"), &root.join("artifact"))
        .expect_err("must reject short body");

    assert!(matches!(err, UpdateError::Download(_)), "unexpected error: {err}");
    server.join().expect("server must finish");
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn http_fetcher_rejects_error_status() {
    let root = test_root();
    let (base, server) = serve_once(
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nConnection: close\r\n\r\nnot found".to_vec(),
    );

    let fetcher = HttpFetcher::new(std::time::Duration::from_secs(5)).expect("must build client");
    let url = format!("{base}/nym-node");
    let err = fetcher
        .fetch_to_path(&url, &root.join("artifact"))
        .expect_err("must reject 404");

    match err {
        UpdateError::Download(message) => assert!(message.contains("404"), "{message}"),
        other => panic!("unexpected error: {other}"),
    }
    server.join().expect("server must finish");
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn truncated_http_download_leaves_live_binary_untouched() {
    let root = test_root();
    let layout = test_layout(&root);
    write_live_binary(&layout, b"old-binary");
    let mut response =
        b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n".to_vec();
    response.extend_from_slice(&[7_u8; 50]);
    let (base, server) = serve_once(response);

    let mut plan = test_plan();
    plan.download_url_template = format!("{base}/{{repo}}/{{tag}}/{{asset}}");
    let fetcher = HttpFetcher::new(std::time::Duration::from_secs(5)).expect("must build client");
    let installer = ArtifactInstaller::new(layout.clone(), plan, fetcher);

    let err = installer.install(&v("v1.2.0")).expect_err("must fail");
    assert!(matches!(err, UpdateError::Download(_)), "unexpected error: {err}");
    assert_eq!(fs::read(layout.install_path()).expect("must read"), b"old-binary");
    assert!(!layout.staged_binary_path().exists());
    assert!(!layout.previous_binary_path().exists());

    server.join().expect("server must finish");
    let _ = fs::remove_dir_all(&root);
}
