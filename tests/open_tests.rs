#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use common::{Harness, times};
use http::Method;
use restfs::fs::{CacheVerdict, FsError, OpenFlags, OpenHandle as _};
use restfs::notify::Alert;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn current_cache_is_served_without_fetching() {
    let h = Harness::new().await;
    h.put_remote("/a.txt", b"hello", 0o644, 2_000);
    h.put_cached("/a.txt", b"hello", 2_000);

    let file = h.fs.open("/a.txt", OpenFlags::RDONLY).await.unwrap();
    let data = file.read(0, 64).await.unwrap();
    file.release().await.unwrap();

    assert_eq!(&data[..], b"hello");
    assert_eq!(h.http.count(&Method::GET, "/a.txt"), 0);
    assert_eq!(h.http.count(&Method::PUT, "/a.txt"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_cache_is_fetched_once() {
    let h = Harness::new().await;
    h.put_remote("/a.txt", b"fresh contents", 0o640, 3_000);
    h.put_cached("/a.txt", b"old", 1_000);

    let file = h.fs.open("/a.txt", OpenFlags::RDONLY).await.unwrap();
    let data = file.read(0, 64).await.unwrap();
    file.release().await.unwrap();

    assert_eq!(&data[..], b"fresh contents");
    assert_eq!(h.http.count(&Method::GET, "/a.txt"), 1);
    assert_eq!(times(&h.cache_path("/a.txt")).1, 3_000);
    assert_eq!(
        h.fs.coherency().evaluate("/a.txt").await.unwrap(),
        CacheVerdict::Good
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uncached_file_is_fetched_with_its_parents() {
    let h = Harness::new().await;
    h.put_remote("/deep/er/a.txt", b"nested", 0o644, 1_500);

    let file = h.fs.open("/deep/er/a.txt", OpenFlags::RDONLY).await.unwrap();
    file.release().await.unwrap();

    assert_eq!(h.cached_contents("/deep/er/a.txt").unwrap(), b"nested");
    assert!(h.cache_path("/deep/er").is_dir());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_fetch_leaves_nothing_good() {
    let h = Harness::new().await;
    h.put_remote("/a.txt", b"fresh", 0o644, 3_000);
    h.put_cached("/b.txt", b"old", 1_000);
    h.put_remote("/b.txt", b"fresh", 0o644, 3_000);
    h.http.set_failing_gets(true);

    let err = h.fs.open("/a.txt", OpenFlags::RDONLY).await.err().unwrap();
    assert!(matches!(err, FsError::Transport(_)), "got {err:?}");
    assert!(!h.cache_path("/a.txt").exists());

    let err = h.fs.open("/b.txt", OpenFlags::RDONLY).await.err().unwrap();
    assert!(matches!(err, FsError::Transport(_)), "got {err:?}");
    assert_eq!(h.cached_contents("/b.txt").unwrap(), b"old");
    assert_eq!(
        h.fs.coherency().evaluate("/b.txt").await.unwrap(),
        CacheVerdict::Stale
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fetch_that_never_converges_is_an_error() {
    let h = Harness::new().await;
    h.put_remote("/a.txt", b"contents", 0o644, 3_000);
    h.http.set_head_mtime_skew(60);

    let err = h.fs.open("/a.txt", OpenFlags::RDONLY).await.err().unwrap();
    assert!(matches!(err, FsError::NotConverged(_)), "got {err:?}");
    assert_eq!(h.http.count(&Method::GET, "/a.txt"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_file_is_not_found() {
    let h = Harness::new().await;

    let err = h.fs.open("/nope.txt", OpenFlags::RDONLY).await.err().unwrap();
    assert!(err.is_not_found(), "got {err:?}");
    assert_eq!(i32::from(&err), libc::ENOENT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directories_cannot_be_opened_as_files() {
    let h = Harness::new().await;
    std::fs::create_dir(h.remote_path("/dir")).unwrap();

    let err = h.fs.open("/dir", OpenFlags::RDONLY).await.err().unwrap();
    assert!(matches!(err, FsError::IsDirectory(_)), "got {err:?}");
    assert_eq!(h.http.count(&Method::GET, "/dir"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offline_open_serves_the_cache() {
    let h = Harness::new().await;
    h.put_cached("/a.txt", b"cached", 1_000);
    h.http.set_offline(true);

    let file = h.fs.open("/a.txt", OpenFlags::RDONLY).await.unwrap();
    assert_eq!(&file.read(0, 64).await.unwrap()[..], b"cached");
    file.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_are_pushed_on_release() {
    let h = Harness::new().await;
    h.put_remote("/a.txt", b"hello world", 0o644, 2_000);
    h.put_cached("/a.txt", b"hello world", 2_000);

    let file = h.fs.open("/a.txt", OpenFlags::RDWR).await.unwrap();
    file.write(6, b"there").await.unwrap();
    assert!(file.is_dirty());
    assert_eq!(h.http.count(&Method::PUT, "/a.txt"), 0);
    file.release().await.unwrap();

    assert_eq!(h.remote_contents("/a.txt").unwrap(), b"hello there");
    assert_eq!(h.http.count(&Method::PUT, "/a.txt"), 1);
    assert_eq!(
        times(&h.remote_path("/a.txt")).1,
        times(&h.cache_path("/a.txt")).1
    );
    assert_eq!(
        h.fs.coherency().evaluate("/a.txt").await.unwrap(),
        CacheVerdict::Good
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncating_open_pushes_even_without_writes() {
    let h = Harness::new().await;
    h.put_remote("/a.txt", b"to be emptied", 0o644, 2_000);
    h.put_cached("/a.txt", b"to be emptied", 2_000);

    let file = h
        .fs
        .open("/a.txt", OpenFlags::WRONLY | OpenFlags::TRUNC)
        .await
        .unwrap();
    file.release().await.unwrap();

    assert_eq!(h.remote_contents("/a.txt").unwrap(), b"");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_write_back_raises_an_alert() {
    let mut h = Harness::new().await;
    h.put_remote("/a.txt", b"abc", 0o644, 2_000);
    h.put_cached("/a.txt", b"abc", 2_000);

    let file = h.fs.open("/a.txt", OpenFlags::RDWR).await.unwrap();
    file.write(0, b"xyz").await.unwrap();
    h.http.set_offline(true);
    // Release still succeeds; the kernel has no one to hand the failure to.
    file.release().await.unwrap();

    assert_eq!(h.remote_contents("/a.txt").unwrap(), b"abc");
    let alerts = h.take_alerts();
    assert!(
        alerts
            .iter()
            .any(|a| matches!(a, Alert::WriteBackFailed { path, .. } if path == "/a.txt")),
        "expected a write-back alert, got {alerts:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_handles_pin_their_path() {
    let h = Harness::new().await;
    h.put_remote("/a.txt", b"x", 0o644, 2_000);
    h.put_cached("/a.txt", b"x", 2_000);

    let file = h.fs.open("/a.txt", OpenFlags::RDONLY).await.unwrap();
    assert!(h.eviction.is_locked("/a.txt"));
    file.release().await.unwrap();
    assert!(!h.eviction.is_locked("/a.txt"));

    let err = file.release().await.err().unwrap();
    assert!(matches!(err, FsError::BadHandle), "got {err:?}");
}
