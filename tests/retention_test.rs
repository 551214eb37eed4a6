//! Retention watcher test against a real spool directory.
//!
//! Exercises the whole path: inotify close-after-write events through the
//! per-pattern quota, with actual deletions on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

use fdas_engine::cleaner::RetentionWatcher;

fn touch(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"payload").unwrap();
    path
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test(flavor = "multi_thread")]
async fn oldest_capture_per_pattern_is_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let patterns = vec!["a*.dat".to_string(), "b*.dat".to_string()];

    let mut watcher = assert_ok!(RetentionWatcher::new(&patterns, 2));
    assert_ok!(watcher.watch(dir.path()));
    tokio::spawn(watcher.run());

    // No pattern matches the canary; it must survive everything below.
    let canary = touch(dir.path(), "canary.dat");

    let a1 = touch(dir.path(), "a1.dat");
    let b1 = touch(dir.path(), "b1.dat");
    let a2 = touch(dir.path(), "a2.dat");
    let b2 = touch(dir.path(), "b2.dat");

    // Both groups are at quota; nothing may be deleted yet. Give the watcher
    // a moment to have processed the burst.
    sleep(Duration::from_millis(200)).await;
    for f in [&canary, &a1, &b1, &a2, &b2] {
        assert!(f.exists(), "{} deleted prematurely", f.display());
    }

    // A third a-file pushes the oldest a-file out.
    let a3 = touch(dir.path(), "a3.dat");
    wait_until("a1 evicted", || !a1.exists()).await;

    assert!(a2.exists() && a3.exists());
    assert!(b1.exists() && b2.exists(), "b group was touched");
    assert!(canary.exists(), "unmatched file was touched");
}
