//! Content insertion against the in-process fake server.
//!
//! Tests are organized by functionality:
//! - `insert_*` - wire form of single inserts
//! - `batch_*` - fail-fast batches and their retries
//! - `collect_*` - collect-errors batches
//! - `update_*` - inserts joining a caller's transaction

mod common;

use common::{Fault, FakeServer};
use std::io::Cursor;
use std::time::Duration;
use xcc_rs::content::{Capability, ContentPermission, DocumentFormat};
use xcc_rs::{
    BytesContent, Content, ContentCreateOptions, FileContent, ReaderContent, RequestOptions,
    Session, TransactionMode, XccError,
};

fn bytes(uri: &str, body: &str) -> Box<dyn Content> {
    Box::new(BytesContent::new(uri, body.as_bytes().to_vec(), ContentCreateOptions::xml()))
}

fn reader(uri: &str, body: &'static str) -> Box<dyn Content> {
    Box::new(ReaderContent::new(
        uri,
        Cursor::new(body.as_bytes()),
        ContentCreateOptions::text(),
    ))
}

fn fast_retries(session: &mut Session) {
    session.set_default_request_options(
        RequestOptions::new().with_auto_retry_delay(Duration::from_millis(1)),
    );
}

// ============================================================================
// Single Insert Tests
// ============================================================================

#[tokio::test]
async fn test_insert_single_document_commits() {
    let server = FakeServer::start().await;
    let mut session = server.default_source().new_session();
    let mut doc = BytesContent::new("/hello.xml", "<hello/>", ContentCreateOptions::xml());

    session.insert_content(&mut doc).await.unwrap();

    assert_eq!(session.transaction_mode(), TransactionMode::Auto);
    assert!(session.transaction_id().is_none());
    let state = server.state();
    assert_eq!(state.documents.get("/hello.xml").map(Vec::as_slice), Some(&b"<hello/>"[..]));
    assert_eq!(state.open_transactions(), 0);

    let insert = state.requests_to("/insert")[0];
    assert_eq!(insert.field("uri"), Some("/hello.xml"));
    assert_eq!(insert.field("format"), Some("xml"));
    assert_eq!(insert.field("txnmode"), Some("update"));
    assert_eq!(insert.header("Content-Length"), Some("8"));
    assert_eq!(state.queries().last().map(String::as_str), Some("xdmp:commit()"));
}

#[tokio::test]
async fn test_insert_create_options_on_the_wire() {
    let server = FakeServer::start().await;
    let mut session = server.default_source().new_session();
    let options = ContentCreateOptions::new()
        .with_format(DocumentFormat::Json)
        .with_collection("reports")
        .with_collection("2024")
        .with_permission(ContentPermission::new(Capability::Read, "reader"))
        .with_quality(3)
        .with_language("en")
        .with_placement_key(17)
        .with_temporal_collection("history");
    let mut doc = BytesContent::new("/r.json", r#"{"a":1}"#, options);

    session.insert_content(&mut doc).await.unwrap();

    let state = server.state();
    let insert = state.requests_to("/insert")[0];
    let colls: Vec<&str> = insert
        .query
        .iter()
        .filter(|(k, _)| k == "coll")
        .map(|(_, v)| v.as_str())
        .collect();
    assert_eq!(colls, vec!["reports", "2024"]);
    assert_eq!(insert.field("format"), Some("json"));
    assert_eq!(insert.field("perm"), Some("read:reader"));
    assert_eq!(insert.field("quality"), Some("3"));
    assert_eq!(insert.field("lang"), Some("en"));
    assert_eq!(insert.field("placeKey"), Some("17"));
    assert_eq!(insert.field("tcoll"), Some("history"));
}

#[tokio::test]
async fn test_insert_unsized_content_is_chunked() {
    let server = FakeServer::start().await;
    let mut session = server.default_source().new_session();
    let mut batch = vec![reader("/notes.txt", "a body of unknown length")];

    session.insert_contents(&mut batch).await.unwrap();

    let state = server.state();
    let insert = state.requests_to("/insert")[0];
    assert_eq!(insert.header("Transfer-Encoding"), Some("chunked"));
    assert_eq!(
        state.documents.get("/notes.txt").map(Vec::as_slice),
        Some(&b"a body of unknown length"[..])
    );
}

#[tokio::test]
async fn test_insert_file_content() {
    let server = FakeServer::start().await;
    let mut session = server.default_source().new_session();
    let path = std::env::temp_dir().join(format!("xcc-rs-insert-{}.xml", std::process::id()));
    tokio::fs::write(&path, b"<from-file/>").await.unwrap();

    let mut doc = FileContent::open("/file.xml", &path, ContentCreateOptions::xml())
        .await
        .unwrap();
    assert!(doc.is_rewindable());
    session.insert_content(&mut doc).await.unwrap();
    tokio::fs::remove_file(&path).await.ok();

    assert_eq!(
        server.state().documents.get("/file.xml").map(Vec::as_slice),
        Some(&b"<from-file/>"[..])
    );
}

#[tokio::test]
async fn test_insert_rejected_in_query_mode() {
    let server = FakeServer::start().await;
    let mut session = server.default_source().new_session();
    session.set_transaction_mode(TransactionMode::Query).unwrap();
    let mut batch = vec![bytes("/a.xml", "<a/>")];

    assert!(session.insert_contents(&mut batch).await.is_err());
    assert!(server.state().requests.is_empty());
}

// ============================================================================
// Fail-fast Batch Tests
// ============================================================================

#[tokio::test]
async fn test_batch_duplicate_uris_last_wins() {
    let server = FakeServer::start().await;
    let mut session = server.default_source().new_session();
    let mut batch = vec![bytes("/dup.xml", "<first/>"), bytes("/dup.xml", "<second/>")];

    session.insert_contents(&mut batch).await.unwrap();

    let state = server.state();
    assert_eq!(state.documents.len(), 1);
    assert_eq!(state.documents.get("/dup.xml").map(Vec::as_slice), Some(&b"<second/>"[..]));
}

#[tokio::test]
async fn test_batch_retryable_fault_restarts_from_first_item() {
    let server = FakeServer::start().await;
    server.state().fault_insert("/b.xml", &[Fault::Retryable]);
    let mut session = server.default_source().new_session();
    fast_retries(&mut session);
    let mut batch = vec![
        bytes("/a.xml", "<a/>"),
        bytes("/b.xml", "<b/>"),
        bytes("/c.xml", "<c/>"),
    ];

    session.insert_contents(&mut batch).await.unwrap();

    let state = server.state();
    assert_eq!(state.documents.len(), 3);
    assert_eq!(state.documents.get("/a.xml").map(Vec::as_slice), Some(&b"<a/>"[..]));
    let uris: Vec<&str> = state
        .requests_to("/insert")
        .into_iter()
        .filter_map(|r| r.field("uri"))
        .collect();
    assert_eq!(uris, vec!["/a.xml", "/b.xml", "/a.xml", "/b.xml", "/c.xml"]);
    assert!(state.queries().contains(&"xdmp:rollback()".to_string()));
    assert_eq!(state.open_transactions(), 0);
}

#[tokio::test]
async fn test_batch_dropped_connection_is_retried() {
    let server = FakeServer::start().await;
    server.state().fault_insert("/a.xml", &[Fault::Drop]);
    let mut session = server.default_source().new_session();
    fast_retries(&mut session);
    let mut batch = vec![bytes("/a.xml", "<a/>")];

    session.insert_contents(&mut batch).await.unwrap();
    assert!(server.state().documents.contains_key("/a.xml"));
}

#[tokio::test]
async fn test_batch_permanent_fault_rolls_back() {
    let server = FakeServer::start().await;
    server.state().fault_insert("/b.xml", &[Fault::Permanent]);
    let mut session = server.default_source().new_session();
    let mut batch = vec![bytes("/a.xml", "<a/>"), bytes("/b.xml", "<b/>")];

    let err = session.insert_contents(&mut batch).await.unwrap_err();

    assert_eq!(err.server_code(), Some("XDMP-DOCROOTTEXT"));
    assert_eq!(session.transaction_mode(), TransactionMode::Auto);
    assert!(session.transaction_id().is_none());
    let state = server.state();
    assert!(state.documents.is_empty());
    assert_eq!(state.open_transactions(), 0);
    assert_eq!(state.requests_to("/insert").len(), 2);
}

#[tokio::test]
async fn test_batch_non_rewindable_failure_is_not_retried() {
    let server = FakeServer::start().await;
    server.state().fault_insert("/stream.txt", &[Fault::Retryable]);
    let mut session = server.default_source().new_session();
    fast_retries(&mut session);
    let mut batch = vec![bytes("/a.xml", "<a/>"), reader("/stream.txt", "once only")];

    let err = session.insert_contents(&mut batch).await.unwrap_err();

    assert!(err.is_retryable());
    let state = server.state();
    assert!(state.documents.is_empty());
    assert_eq!(state.requests_to("/insert").len(), 2);
}

#[tokio::test]
async fn test_batch_retry_budget_from_options() {
    let server = FakeServer::start().await;
    server
        .state()
        .fault_insert("/a.xml", &[Fault::Retryable, Fault::Retryable, Fault::Retryable]);
    let mut session = server.default_source().new_session();
    session.set_default_request_options(
        RequestOptions::new()
            .with_max_auto_retry(1)
            .with_auto_retry_delay(Duration::from_millis(1)),
    );
    let mut batch = vec![bytes("/a.xml", "<a/>")];

    assert!(session.insert_contents(&mut batch).await.is_err());
    assert_eq!(server.state().requests_to("/insert").len(), 2);
}

// ============================================================================
// Collect-errors Tests
// ============================================================================

#[tokio::test]
async fn test_collect_keeps_successes_and_reports_failures() {
    let server = FakeServer::start().await;
    server.state().fault_insert("/b.xml", &[Fault::Permanent]);
    server.state().fault_insert("/stream.txt", &[Fault::Retryable]);
    let mut session = server.default_source().new_session();
    fast_retries(&mut session);
    let mut batch = vec![
        bytes("/a.xml", "<a/>"),
        bytes("/b.xml", "<b/>"),
        reader("/stream.txt", "once only"),
        bytes("/d.xml", "<d/>"),
    ];

    let failures = session.insert_contents_collect_errors(&mut batch).await.unwrap();

    let failed: Vec<(usize, &str)> = failures.iter().map(|f| (f.index, f.uri.as_str())).collect();
    assert_eq!(failed, vec![(1, "/b.xml"), (2, "/stream.txt")]);
    assert_eq!(failures[0].error.server_code(), Some("XDMP-DOCROOTTEXT"));
    assert!(failures[1].error.is_retryable());

    let state = server.state();
    let stored: Vec<&String> = state.documents.keys().collect();
    assert_eq!(stored, vec!["/a.xml", "/d.xml"]);
    assert_eq!(state.open_transactions(), 0);
}

#[tokio::test]
async fn test_collect_retries_rewindable_item() {
    let server = FakeServer::start().await;
    server
        .state()
        .fault_insert("/a.xml", &[Fault::Retryable, Fault::Drop]);
    let mut session = server.default_source().new_session();
    fast_retries(&mut session);
    let mut batch = vec![bytes("/a.xml", "<a/>")];

    let failures = session.insert_contents_collect_errors(&mut batch).await.unwrap();

    assert!(failures.is_empty());
    let state = server.state();
    assert_eq!(state.documents.get("/a.xml").map(Vec::as_slice), Some(&b"<a/>"[..]));
    assert_eq!(state.requests_to("/insert").len(), 3);
}

#[tokio::test]
async fn test_collect_validation_fails_whole_batch() {
    let server = FakeServer::start().await;
    let mut session = server.default_source().new_session();
    let mut batch = vec![bytes("/a.xml", "<a/>"), bytes("  ", "<b/>")];

    let err = session.insert_contents_collect_errors(&mut batch).await.unwrap_err();
    assert!(matches!(err, XccError::Usage(_)));
    assert!(server.state().requests.is_empty());
}

// ============================================================================
// Update-mode Tests
// ============================================================================

#[tokio::test]
async fn test_update_inserts_join_caller_transaction() {
    let server = FakeServer::start().await;
    let mut session = server.default_source().new_session();
    session.set_transaction_mode(TransactionMode::Update).unwrap();
    let mut batch = vec![bytes("/a.xml", "<a/>"), bytes("/b.xml", "<b/>")];

    session.insert_contents(&mut batch).await.unwrap();
    assert!(session.transaction_id().is_some());
    assert!(server.state().documents.is_empty());

    let read = session.new_adhoc_query(r#"doc("/a.xml")"#);
    let results = session.submit_request(&read).await.unwrap();
    assert_eq!(results.as_strings().await.unwrap(), vec!["<a/>"]);

    session.commit().await.unwrap();
    assert_eq!(server.state().documents.len(), 2);
}

#[tokio::test]
async fn test_update_failure_rolls_back_caller_transaction() {
    let server = FakeServer::start().await;
    server.state().fault_insert("/b.xml", &[Fault::Retryable]);
    let mut session = server.default_source().new_session();
    session.set_transaction_mode(TransactionMode::Update).unwrap();
    let mut batch = vec![bytes("/a.xml", "<a/>"), bytes("/b.xml", "<b/>")];

    assert!(session.insert_contents(&mut batch).await.is_err());

    assert!(session.transaction_id().is_none());
    assert_eq!(session.transaction_mode(), TransactionMode::Update);
    let state = server.state();
    assert!(state.documents.is_empty());
    assert_eq!(state.open_transactions(), 0);
    assert_eq!(state.requests_to("/insert").len(), 2);
}

#[tokio::test]
async fn test_update_collect_leaves_successes_pending() {
    let server = FakeServer::start().await;
    server.state().fault_insert("/b.xml", &[Fault::Permanent]);
    let mut session = server.default_source().new_session();
    session.set_transaction_mode(TransactionMode::Update).unwrap();
    let mut batch = vec![bytes("/a.xml", "<a/>"), bytes("/b.xml", "<b/>")];

    let failures = session.insert_contents_collect_errors(&mut batch).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert!(server.state().documents.is_empty());

    session.commit().await.unwrap();
    let state = server.state();
    assert!(state.documents.contains_key("/a.xml"));
    assert!(!state.documents.contains_key("/b.xml"));
}
