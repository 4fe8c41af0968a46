//! In-process table service used by the integration tests
//!
//! Assigns versions and timestamps the way the real service does, checks
//! `If-Match` preconditions and answers keyset-paged queries. Individual
//! writes can be scripted to fail, a write can be held open to simulate
//! local edits racing a push, and a token can be cancelled mid-cycle.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bridge_desktop::SqliteTableStore;
use bridge_traits::network::{NetworkMonitor, NetworkStatus};
use bridge_traits::remote::{PageRequest, RemoteError, RemoteOutcome, RemotePage, RemoteTable};
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use core_sync::{
    CancellationToken, SchemaDescriptor, SyncConfig, SyncContext, SyncContextBuilder,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: &'static str,
    pub id: String,
    pub if_match: Option<String>,
}

/// Handles to a held write
#[derive(Clone)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Default)]
struct ServerState {
    tables: HashMap<String, BTreeMap<String, Value>>,
    counter: u64,
    scripted: HashMap<String, VecDeque<RemoteOutcome>>,
    calls: Vec<Call>,
    query_error: Option<RemoteError>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl ServerState {
    fn stamp(&mut self, item: &mut Value) {
        self.counter += 1;
        item["version"] = json!(version_for(self.counter));
        item["updatedAt"] = json!(timestamp(self.counter));
    }

    fn record(&mut self, call: Call) {
        self.calls.push(call);
        if let Some((limit, cancel)) = &self.cancel_after {
            if self.calls.len() >= *limit {
                cancel.cancel();
            }
        }
    }

    fn scripted(&mut self, id: &str) -> Option<RemoteOutcome> {
        self.scripted.get_mut(id).and_then(VecDeque::pop_front)
    }

    fn get(&self, table: &str, id: &str) -> Option<Value> {
        self.tables.get(table).and_then(|rows| rows.get(id)).cloned()
    }

    fn put(&mut self, table: &str, id: &str, item: Value) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), item);
    }
}

pub fn version_for(counter: u64) -> String {
    STANDARD.encode(counter.to_be_bytes())
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn timestamp(counter: u64) -> String {
    (base_time() + Duration::seconds(counter as i64)).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse(item: &Value) -> DateTime<Utc> {
    item["updatedAt"]
        .as_str()
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<ServerState>,
    gate: Mutex<Option<Gate>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a record as another client would have created it
    pub async fn seed(&self, table: &str, item: Value) -> Value {
        let mut state = self.state.lock().await;
        let mut item = item;
        state.stamp(&mut item);
        let id = item["id"].as_str().unwrap_or_default().to_string();
        state.put(table, &id, item.clone());
        item
    }

    /// Store a record exactly as given
    pub async fn seed_raw(&self, table: &str, item: Value) {
        let mut state = self.state.lock().await;
        let id = item["id"].as_str().unwrap_or_default().to_string();
        state.put(table, &id, item);
    }

    /// Change a record as another client would, bumping its version
    pub async fn touch(&self, table: &str, id: &str, changes: Value) -> Value {
        let mut state = self.state.lock().await;
        let mut item = state.get(table, id).unwrap_or_else(|| json!({ "id": id }));
        merge(&mut item, &changes);
        state.stamp(&mut item);
        state.put(table, id, item.clone());
        item
    }

    pub async fn item(&self, table: &str, id: &str) -> Option<Value> {
        self.state.lock().await.get(table, id)
    }

    /// Answer the next write to `id` with `outcome`
    pub async fn script(&self, id: &str, outcome: RemoteOutcome) {
        self.state
            .lock()
            .await
            .scripted
            .entry(id.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub async fn fail_queries(&self, error: RemoteError) {
        self.state.lock().await.query_error = Some(error);
    }

    /// Cancel `cancel` while serving the `calls`-th request; that request still answers
    pub async fn cancel_after(&self, calls: usize, cancel: CancellationToken) {
        self.state.lock().await.cancel_after = Some((calls, cancel));
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    pub async fn write_calls(&self) -> Vec<Call> {
        self.calls()
            .await
            .into_iter()
            .filter(|call| call.kind != "query")
            .collect()
    }

    /// Hold the next write until `release` is notified
    pub async fn gate_next_write(&self) -> Gate {
        let gate = Gate {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        *self.gate.lock().await = Some(gate.clone());
        gate
    }

    async fn wait_gate(&self) {
        let gate = self.gate.lock().await.take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }
}

fn merge(target: &mut Value, changes: &Value) {
    if let (Some(target), Some(changes)) = (target.as_object_mut(), changes.as_object()) {
        for (key, value) in changes {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn not_found(id: &str) -> RemoteOutcome {
    RemoteOutcome::Failed(RemoteError::Permanent {
        status: 404,
        message: format!("{} not found", id),
    })
}

#[async_trait]
impl RemoteTable for FakeRemote {
    async fn insert(&self, table: &str, item: &Value) -> RemoteOutcome {
        self.wait_gate().await;
        let mut state = self.state.lock().await;
        let id = item["id"].as_str().unwrap_or_default().to_string();
        state.record(Call {
            kind: "insert",
            id: id.clone(),
            if_match: None,
        });

        if let Some(outcome) = state.scripted(&id) {
            return outcome;
        }
        if let Some(existing) = state.get(table, &id) {
            return RemoteOutcome::Conflict {
                status: 409,
                server_item: Some(existing),
            };
        }

        let mut stored = item.clone();
        state.stamp(&mut stored);
        state.put(table, &id, stored.clone());
        RemoteOutcome::Ok(Some(stored))
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        item: &Value,
        if_match: Option<String>,
    ) -> RemoteOutcome {
        self.wait_gate().await;
        let mut state = self.state.lock().await;
        state.record(Call {
            kind: "update",
            id: id.to_string(),
            if_match: if_match.clone(),
        });

        if let Some(outcome) = state.scripted(id) {
            return outcome;
        }
        let Some(existing) = state.get(table, id) else {
            return not_found(id);
        };
        if let Some(expected) = if_match {
            if existing["version"].as_str() != Some(expected.as_str()) {
                return RemoteOutcome::Conflict {
                    status: 412,
                    server_item: Some(existing),
                };
            }
        }

        let mut stored = existing;
        merge(&mut stored, item);
        state.stamp(&mut stored);
        state.put(table, id, stored.clone());
        RemoteOutcome::Ok(Some(stored))
    }

    async fn delete(&self, table: &str, id: &str, if_match: Option<String>) -> RemoteOutcome {
        self.wait_gate().await;
        let mut state = self.state.lock().await;
        state.record(Call {
            kind: "delete",
            id: id.to_string(),
            if_match: if_match.clone(),
        });

        if let Some(outcome) = state.scripted(id) {
            return outcome;
        }
        let Some(existing) = state.get(table, id) else {
            return not_found(id);
        };
        if let Some(expected) = if_match {
            if existing["version"].as_str() != Some(expected.as_str()) {
                return RemoteOutcome::Conflict {
                    status: 412,
                    server_item: Some(existing),
                };
            }
        }

        let mut stored = existing;
        stored["deleted"] = json!(true);
        state.stamp(&mut stored);
        state.put(table, id, stored);
        RemoteOutcome::Ok(None)
    }

    async fn query(&self, table: &str, request: &PageRequest) -> Result<RemotePage, RemoteError> {
        let mut state = self.state.lock().await;
        state.record(Call {
            kind: "query",
            id: table.to_string(),
            if_match: None,
        });
        if let Some(error) = &state.query_error {
            return Err(error.clone());
        }

        let mut rows: Vec<Value> = state
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        rows.retain(|item| request.include_deleted || item["deleted"] != json!(true));

        if let Some(watermark) = &request.watermark {
            rows.retain(|item| {
                let at = parse(item);
                let id = item["id"].as_str().unwrap_or_default();
                match &watermark.after_id {
                    Some(after) => {
                        at > watermark.updated_at
                            || (at == watermark.updated_at && id > after.as_str())
                    }
                    None => at >= watermark.updated_at,
                }
            });
        }

        rows.sort_by(|a, b| {
            parse(a)
                .cmp(&parse(b))
                .then_with(|| a["id"].as_str().cmp(&b["id"].as_str()))
        });
        rows.truncate(request.top);

        Ok(RemotePage {
            items: rows,
            next_link: None,
        })
    }
}

pub struct FixedNetwork(pub NetworkStatus);

#[async_trait]
impl NetworkMonitor for FixedNetwork {
    async fn status(&self) -> bridge_traits::error::Result<NetworkStatus> {
        Ok(self.0)
    }
}

/// Context over a fresh in-memory store with `todoitem` and `category` registered
pub async fn builder(remote: Arc<FakeRemote>) -> SyncContextBuilder {
    let store = SqliteTableStore::in_memory().await.unwrap();
    SyncContext::builder(Arc::new(store), remote)
        .schema(SchemaDescriptor::new("todoitem").unwrap())
        .schema(SchemaDescriptor::new("category").unwrap())
}

pub async fn context(remote: Arc<FakeRemote>, config: SyncConfig) -> SyncContext {
    builder(remote).await.config(config).build().unwrap()
}
