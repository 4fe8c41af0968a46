//! Checks the exact calls the engine makes against the remote contract

use async_trait::async_trait;
use bridge_desktop::SqliteTableStore;
use bridge_traits::remote::{PageRequest, RemoteError, RemoteOutcome, RemotePage, RemoteTable};
use chrono::{DateTime, Utc};
use core_sync::{
    CancellationToken, PullQuery, SchemaDescriptor, SyncConfig, SyncContext, SyncError,
};
use mockall::{mock, Sequence};
use serde_json::{json, Value};
use std::sync::Arc;

mock! {
    Remote {}

    #[async_trait]
    impl RemoteTable for Remote {
        async fn insert(&self, table: &str, item: &Value) -> RemoteOutcome;
        async fn update(
            &self,
            table: &str,
            id: &str,
            item: &Value,
            if_match: Option<String>,
        ) -> RemoteOutcome;
        async fn delete(&self, table: &str, id: &str, if_match: Option<String>) -> RemoteOutcome;
        async fn query(&self, table: &str, request: &PageRequest) -> Result<RemotePage, RemoteError>;
    }
}

async fn context(remote: MockRemote) -> SyncContext {
    let store = SqliteTableStore::in_memory().await.unwrap();
    SyncContext::builder(Arc::new(store), Arc::new(remote))
        .schema(
            SchemaDescriptor::new("note")
                .unwrap()
                .with_updated_at_field("modified")
                .with_version_field("etag"),
        )
        .config(
            SyncConfig::new()
                .with_page_size(2)
                .with_query("notes", PullQuery::new("note").with_filter("pinned eq true")),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_insert_sends_snapshot_and_stores_server_copy() {
    let mut remote = MockRemote::new();
    remote
        .expect_insert()
        .withf(|table, item| table.to_string() == "note" && item["text"] == "hello")
        .times(1)
        .returning(|_, item| {
            let mut stored = item.clone();
            stored["etag"] = json!("AAAAAAAAB9E=");
            stored["modified"] = json!("2024-05-01T00:00:00.000Z");
            RemoteOutcome::Ok(Some(stored))
        });
    let ctx = context(remote).await;

    ctx.insert("note", json!({ "id": "n1", "text": "hello" }))
        .await
        .unwrap();
    let result = ctx.push(&CancellationToken::new()).await.unwrap();

    assert_eq!(result.succeeded, 1);
    let local = ctx.get("note", "n1").await.unwrap().unwrap();
    assert_eq!(local["etag"], "AAAAAAAAB9E=");
}

#[tokio::test]
async fn test_update_uses_custom_version_field_as_precondition() {
    let mut remote = MockRemote::new();
    let mut seq = Sequence::new();
    remote
        .expect_query()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| {
            Ok(RemotePage {
                items: vec![json!({
                    "id": "n1",
                    "etag": "AQ==",
                    "modified": "2024-05-01T00:00:00Z",
                    "text": "server"
                })],
                next_link: None,
            })
        });
    remote
        .expect_update()
        .withf(|table, id, _, if_match| {
            table.to_string() == "note"
                && id.to_string() == "n1"
                && if_match.as_deref() == Some("AQ==")
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _, item, _| RemoteOutcome::Ok(Some(item.clone())));
    let ctx = context(remote).await;

    ctx.pull("notes", &CancellationToken::new()).await.unwrap();
    ctx.update("note", json!({ "id": "n1", "text": "edited" }))
        .await
        .unwrap();
    let result = ctx.push(&CancellationToken::new()).await.unwrap();

    assert_eq!(result.succeeded, 1);
}

#[tokio::test]
async fn test_pull_requests_keyset_pages() {
    let mut remote = MockRemote::new();
    let mut seq = Sequence::new();
    let at = "2024-05-01T00:00:00Z";
    let stamp: DateTime<Utc> = at.parse().unwrap();

    remote
        .expect_query()
        .withf(|table, request| {
            table.to_string() == "note"
                && request.top == 2
                && request.include_deleted
                && request.filter.as_deref() == Some("pinned eq true")
                && request.updated_at_field == "modified"
                && request.watermark.as_ref().map(|w| w.after_id.is_none()) == Some(true)
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(move |_, _| {
            Ok(RemotePage {
                items: vec![
                    json!({ "id": "a", "modified": at }),
                    json!({ "id": "b", "modified": at }),
                ],
                next_link: None,
            })
        });
    remote
        .expect_query()
        .withf(move |_, request| {
            request.watermark.as_ref().map(|w| (w.updated_at, w.after_id.clone()))
                == Some((stamp, Some("b".to_string())))
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(move |_, _| {
            Ok(RemotePage {
                items: vec![json!({ "id": "c", "modified": at })],
                next_link: None,
            })
        });
    let ctx = context(remote).await;

    let result = ctx.pull("notes", &CancellationToken::new()).await.unwrap();

    assert_eq!(result.pages, 2);
    assert_eq!(result.received, 3);
}

#[tokio::test]
async fn test_page_that_does_not_advance_is_rejected() {
    let mut remote = MockRemote::new();
    remote.expect_query().returning(|_, _| {
        Ok(RemotePage {
            items: vec![
                json!({ "id": "a", "modified": "2024-05-01T00:00:00Z" }),
                json!({ "id": "b", "modified": "2024-05-01T00:00:00Z" }),
            ],
            next_link: None,
        })
    });
    let ctx = context(remote).await;

    let result = ctx.pull("notes", &CancellationToken::new()).await;

    assert!(matches!(result, Err(SyncError::Remote { status: None, .. })));
    assert!(ctx.get("note", "a").await.unwrap().is_some());
}
