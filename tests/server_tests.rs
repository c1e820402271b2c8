#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::os::unix::fs::PermissionsExt as _;
use std::time::Duration;

use bytes::Bytes;
use common::{Harness, set_times, times};
use http::{HeaderValue, Method, StatusCode, header};
use restfs_http::wire::{self, ListingEntry, Metadata, WriteAttrs};
use restfs_http::{ClientConfig, HttpClient as _, HttpRequest, ReqwestClient, RestClient};

async fn raw(h: &Harness, method: Method, path: &str, user: Option<&str>) -> StatusCode {
    let mut request = HttpRequest::new(method, format!("http://{}{path}", h.addr));
    if let Some(user) = user {
        request = request.header(
            header::AUTHORIZATION,
            HeaderValue::from_str(&wire::encode_authorization(user)).unwrap(),
        );
    }
    ReqwestClient::new(Duration::from_secs(5))
        .unwrap()
        .send(request)
        .await
        .unwrap()
        .status
}

fn mode_of(path: &std::path::Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn put_then_head_reports_written_attributes() {
    let h = Harness::new().await;
    let attrs = WriteAttrs {
        mode: 0o644,
        atime: 1_000,
        mtime: 2_000,
    };

    let response = h
        .client
        .put("/x.txt", &attrs, Bytes::from_static(b"hi"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);

    let response = h.client.head("/x.txt").await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers[wire::FILE_MODE], "644");
    assert_eq!(response.headers[wire::IS_DIR], "false");
    let meta = Metadata::from_headers(&response.headers).unwrap();
    assert_eq!(meta, Metadata::file(0o644, 2, 2_000, 1_000));
    assert_eq!(times(&h.remote_path("/x.txt")), (1_000, 2_000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn put_replaces_existing_content() {
    let h = Harness::new().await;
    h.put_remote("/x.txt", b"a much longer original body", 0o600, 1_000);
    let attrs = WriteAttrs {
        mode: 0o640,
        atime: 3_000,
        mtime: 3_000,
    };

    h.client
        .put("/x.txt", &attrs, Bytes::from_static(b"short"))
        .await
        .unwrap();

    assert_eq!(h.remote_contents("/x.txt").unwrap(), b"short");
    assert_eq!(mode_of(&h.remote_path("/x.txt")), 0o640);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn put_without_attributes_is_rejected() {
    let h = Harness::new().await;
    assert_eq!(
        raw(&h, Method::PUT, "/x.txt", Some(common::USER)).await,
        StatusCode::BAD_REQUEST
    );
    assert!(h.remote_contents("/x.txt").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn put_to_a_directory_path_is_rejected() {
    let h = Harness::new().await;
    let attrs = WriteAttrs {
        mode: 0o644,
        atime: 0,
        mtime: 0,
    };
    let response = h.client.put("/d/", &attrs, Bytes::new()).await.unwrap();
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_preserves_access_time() {
    let h = Harness::new().await;
    h.put_remote("/a.txt", b"contents", 0o644, 2_000);
    set_times(&h.remote_path("/a.txt"), 1_000, 2_000);

    let response = h.client.get("/a.txt").await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"contents");
    assert_eq!(times(&h.remote_path("/a.txt")), (1_000, 2_000));

    let meta = Metadata::from_headers(&response.headers).unwrap();
    assert_eq!(meta.atime, 1_000);
    assert_eq!(meta.size, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_preserves_access_time_for_large_files() {
    let h = Harness::new().await;
    let contents: Vec<u8> = (0..6 * 1024 * 1024).map(|i: u32| (i % 251) as u8).collect();
    h.put_remote("/big.bin", &contents, 0o644, 2_000);
    set_times(&h.remote_path("/big.bin"), 1_000, 2_000);

    let response = h.client.get("/big.bin").await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.len(), contents.len());
    assert!(response.body[..] == contents[..]);
    assert_eq!(times(&h.remote_path("/big.bin")), (1_000, 2_000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trailing_slash_on_a_file_is_not_found() {
    let h = Harness::new().await;
    h.put_remote("/a.txt", b"x", 0o644, 1_000);

    for method in [Method::HEAD, Method::GET, Method::DELETE] {
        assert_eq!(
            raw(&h, method.clone(), "/a.txt/", Some(common::USER)).await,
            StatusCode::NOT_FOUND,
            "{method}"
        );
    }
    assert_eq!(h.remote_contents("/a.txt").unwrap(), b"x");

    std::fs::create_dir(h.remote_path("/d")).unwrap();
    assert_eq!(
        raw(&h, Method::HEAD, "/d/", Some(common::USER)).await,
        StatusCode::OK
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_lists_directories() {
    let h = Harness::new().await;
    h.put_remote("/d/a.txt", b"x", 0o644, 1_000);
    std::fs::create_dir(h.remote_path("/d/sub")).unwrap();
    std::fs::set_permissions(h.remote_path("/d/sub"), std::fs::Permissions::from_mode(0o755))
        .unwrap();
    set_times(&h.remote_path("/d"), 500, 600);

    let response = h.client.get("/d").await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers[wire::IS_DIR], "true");

    let entries = wire::parse_listing(&response.body).unwrap();
    assert_eq!(
        entries,
        vec![
            ListingEntry {
                name: "a.txt".into(),
                mode: wire::S_IFREG | 0o644,
            },
            ListingEntry {
                name: "sub".into(),
                mode: wire::S_IFDIR | 0o755,
            },
        ]
    );
    assert_eq!(times(&h.remote_path("/d")), (500, 600));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_creates_directories_exclusively() {
    let h = Harness::new().await;

    let response = h.client.post("/dir", 0o755, true).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert!(h.remote_path("/dir").is_dir());
    assert_eq!(mode_of(&h.remote_path("/dir")), 0o755);

    let response = h.client.post("/dir", 0o755, true).await.unwrap();
    assert_eq!(response.status, StatusCode::CONFLICT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_creates_files_exclusively() {
    let h = Harness::new().await;

    let response = h.client.post("/new.txt", 0o600, false).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(h.remote_contents("/new.txt").unwrap(), b"");
    assert_eq!(mode_of(&h.remote_path("/new.txt")), 0o600);

    let response = h.client.post("/new.txt", 0o600, false).await.unwrap();
    assert_eq!(response.status, StatusCode::CONFLICT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_removes_files_and_empty_directories() {
    let h = Harness::new().await;
    h.put_remote("/a.txt", b"x", 0o644, 1_000);
    std::fs::create_dir(h.remote_path("/empty")).unwrap();
    h.put_remote("/full/child", b"x", 0o644, 1_000);

    assert_eq!(h.client.delete("/a.txt").await.unwrap().status, StatusCode::OK);
    assert_eq!(h.client.delete("/empty").await.unwrap().status, StatusCode::OK);
    assert_eq!(
        h.client.delete("/full").await.unwrap().status,
        StatusCode::CONFLICT
    );
    assert_eq!(
        h.client.delete("/a.txt").await.unwrap().status,
        StatusCode::NOT_FOUND
    );
    assert_eq!(h.client.delete("/").await.unwrap().status, StatusCode::FORBIDDEN);

    assert!(!h.remote_path("/a.txt").exists());
    assert!(!h.remote_path("/empty").exists());
    assert!(h.remote_path("/full/child").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_entries_are_not_found() {
    let h = Harness::new().await;
    assert_eq!(
        h.client.head("/nope").await.unwrap().status,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        h.client.get("/nope").await.unwrap().status,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_and_anonymous_users_are_forbidden() {
    let h = Harness::new().await;
    h.put_remote("/a.txt", b"x", 0o644, 1_000);

    let mallory = RestClient::new(&ClientConfig::new(h.addr.to_string(), "mallory")).unwrap();
    assert_eq!(
        mallory.head("/a.txt").await.unwrap().status,
        StatusCode::FORBIDDEN
    );
    assert_eq!(
        raw(&h, Method::HEAD, "/a.txt", None).await,
        StatusCode::FORBIDDEN
    );
    assert_eq!(
        raw(&h, Method::HEAD, "/a.txt", Some("..")).await,
        StatusCode::FORBIDDEN
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paths_cannot_escape_the_sandbox() {
    let h = Harness::new().await;
    std::fs::write(h.store_dir.path().join("secret"), b"not yours").unwrap();

    assert_eq!(
        raw(&h, Method::GET, "/..%2Fsecret", Some(common::USER)).await,
        StatusCode::FORBIDDEN
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_methods_are_rejected() {
    let h = Harness::new().await;
    assert_eq!(
        raw(&h, Method::PATCH, "/a.txt", Some(common::USER)).await,
        StatusCode::METHOD_NOT_ALLOWED
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn names_are_percent_decoded() {
    let h = Harness::new().await;
    h.put_remote("/with space.txt", b"spaced", 0o644, 1_000);

    let response = h.client.get("/with space.txt").await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"spaced");
}
