//! Session registry: worker lifecycle from hello to teardown.
//!
//! The registry validates credentials, applies hello state and answers
//! routing queries. It never touches a stream: stream ownership lives in
//! [`crate::streams::StreamHub`], and teardown belongs to each stream's
//! receive loop.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use onlyboxes_db::{CandidateRow, Database, HelloUpdate, TouchResult, WorkerNodeRow};
use onlyboxes_protocol::http_types::WorkerInfo;
use onlyboxes_protocol::{AccountId, CapabilityDecl, NodeId, WorkerType, LABEL_OWNER_ID, LABEL_WORKER_TYPE};
use onlyboxes_security::SecretHasher;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Routing scope for candidate selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteScope {
    /// Any online worker exposing the capability.
    Global,
    /// Only workers labeled `obx.owner_id = owner` and
    /// `obx.worker_type = worker-sys`.
    AccountScoped(AccountId),
}

/// A worker hello, decoded from the wire frame.
#[derive(Debug, Clone)]
pub struct HelloRequest {
    pub node_id: String,
    pub node_name: String,
    pub executor_kind: String,
    pub version: String,
    pub worker_secret: String,
    pub capabilities: Vec<CapabilityDecl>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum HelloError {
    #[error("unknown worker identity")]
    UnknownNode,
    #[error("worker secret does not match")]
    InvalidSecret,
    #[error("worker is not provisioned")]
    NotProvisioned,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct WorkerRegistry {
    db: Database,
    hasher: Arc<SecretHasher>,
    offline_ttl: Duration,
}

impl WorkerRegistry {
    pub fn new(db: Database, hasher: Arc<SecretHasher>, offline_ttl: Duration) -> Self {
        Self {
            db,
            hasher,
            offline_ttl,
        }
    }

    pub fn offline_ttl(&self) -> Duration {
        self.offline_ttl
    }

    fn offline_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.offline_ttl
    }

    /// Validate and apply a hello. On success the node row carries the
    /// freshly minted session id and the hello's capability set; system
    /// labels survive whatever the worker sent.
    ///
    /// The caller is responsible for closing any stream that owned the
    /// previous session.
    pub async fn upsert_hello(&self, hello: &HelloRequest) -> Result<(NodeId, String), HelloError> {
        let node_id = NodeId::parse(&hello.node_id).map_err(|_| HelloError::UnknownNode)?;

        let credential = self
            .db
            .workers()
            .get_credential(&node_id)
            .await?
            .ok_or(HelloError::UnknownNode)?;
        if !self.hasher.verify(&hello.worker_secret, &credential.secret_hash) {
            warn!(node_id = %node_id, "Hello rejected: secret mismatch");
            return Err(HelloError::InvalidSecret);
        }

        let node = self
            .db
            .workers()
            .get(&node_id)
            .await?
            .ok_or(HelloError::UnknownNode)?;
        if !node.provisioned {
            return Err(HelloError::NotProvisioned);
        }

        let session_id = Uuid::new_v4().to_string();
        self.db
            .workers()
            .apply_hello(&HelloUpdate {
                node_id: node_id.clone(),
                session_id: session_id.clone(),
                node_name: hello.node_name.clone(),
                executor_kind: hello.executor_kind.clone(),
                version: hello.version.clone(),
                capabilities: hello.capabilities.clone(),
                labels: hello.labels.clone(),
                now: Utc::now(),
            })
            .await?;

        info!(
            node_id = %node_id,
            session_id = %session_id,
            capabilities = hello.capabilities.len(),
            "Worker session established"
        );
        Ok((node_id, session_id))
    }

    /// Heartbeat: refresh `last_seen_at` iff the (node, session) pair
    /// still matches.
    pub async fn touch(&self, node_id: &NodeId, session_id: &str) -> Result<TouchResult> {
        self.db
            .workers()
            .heartbeat_touch(node_id, session_id, Utc::now())
            .await
    }

    /// Clear a session on stream teardown; matching makes reconnects
    /// race-free.
    pub async fn clear_session_if_match(&self, node_id: &NodeId, session_id: &str) -> Result<bool> {
        self.db.workers().clear_session_if_match(node_id, session_id).await
    }

    /// Online candidates exposing `capability` under the scope, node-id
    /// ASC. The capability match is case-insensitive.
    pub async fn candidates(
        &self,
        capability: &str,
        scope: &RouteScope,
    ) -> Result<Vec<CandidateRow>> {
        let cutoff = self.offline_cutoff(Utc::now());
        match scope {
            RouteScope::Global => self.db.workers().online_by_capability(capability, cutoff).await,
            RouteScope::AccountScoped(owner_id) => {
                self.db
                    .workers()
                    .online_by_owner_capability(owner_id, capability, cutoff)
                    .await
            }
        }
    }

    /// Assemble the dashboard view of a node row.
    pub async fn worker_info(
        &self,
        row: &WorkerNodeRow,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<WorkerInfo> {
        let node_id = NodeId::parse(&row.node_id)
            .map_err(|e| anyhow::anyhow!("corrupt node id in store: {e}"))?;
        let capabilities = self
            .db
            .workers()
            .capabilities_for(&node_id)
            .await?
            .into_iter()
            .map(|cap| CapabilityDecl {
                name: cap.name,
                max_inflight: cap.max_inflight.max(0) as u32,
            })
            .collect();
        let labels = self.db.workers().labels_for(&node_id).await?;
        let worker_type = labels
            .get(LABEL_WORKER_TYPE)
            .and_then(|value| value.parse::<WorkerType>().ok());
        let owner_id = labels
            .get(LABEL_OWNER_ID)
            .and_then(|value| AccountId::parse(value).ok());

        Ok(WorkerInfo {
            node_id,
            node_name: row.node_name.clone(),
            executor_kind: row.executor_kind.clone(),
            version: row.version.clone(),
            worker_type,
            owner_id,
            provisioned: row.provisioned,
            online: row.is_online(now, self.offline_ttl),
            stale: row.is_stale(now, stale_after),
            registered_at: row.registered_at,
            last_seen_at: row.last_seen_at,
            capabilities,
            labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onlyboxes_protocol::capability_key;

    async fn setup() -> (Database, WorkerRegistry, Arc<SecretHasher>) {
        let (db, _) = Database::open_in_memory(Duration::days(30)).await.unwrap();
        let hasher = Arc::new(SecretHasher::new("test-key").unwrap());
        let registry = WorkerRegistry::new(db.clone(), hasher.clone(), Duration::seconds(15));
        (db, registry, hasher)
    }

    async fn provision(db: &Database, hasher: &SecretHasher, secret: &str) -> NodeId {
        let node_id = NodeId::new();
        let now = Utc::now();
        db.workers().insert_provisioned(&node_id, now).await.unwrap();
        db.workers()
            .insert_credential(&node_id, &hasher.hash(secret), now)
            .await
            .unwrap();
        node_id
    }

    fn hello(node_id: &NodeId, secret: &str) -> HelloRequest {
        HelloRequest {
            node_id: node_id.as_str().to_string(),
            node_name: "box-1".into(),
            executor_kind: "container".into(),
            version: "0.1.0".into(),
            worker_secret: secret.into(),
            capabilities: vec![CapabilityDecl {
                name: "echo".into(),
                max_inflight: 4,
            }],
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_hello_with_valid_secret_goes_online() {
        let (db, registry, hasher) = setup().await;
        let node_id = provision(&db, &hasher, "obx_secret").await;

        let (id, session) = registry
            .upsert_hello(&hello(&node_id, "obx_secret"))
            .await
            .unwrap();
        assert_eq!(id, node_id);
        assert!(!session.is_empty());

        let candidates = registry
            .candidates("ECHO", &RouteScope::Global)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].node_id, node_id.as_str());
    }

    #[tokio::test]
    async fn test_hello_with_bad_secret_is_rejected() {
        let (db, registry, hasher) = setup().await;
        let node_id = provision(&db, &hasher, "obx_secret").await;

        let err = registry
            .upsert_hello(&hello(&node_id, "obx_wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, HelloError::InvalidSecret));

        let node = db.workers().get(&node_id).await.unwrap().unwrap();
        assert_eq!(node.session_id, "");
    }

    #[tokio::test]
    async fn test_hello_for_unknown_node_is_rejected() {
        let (_db, registry, _hasher) = setup().await;
        let err = registry
            .upsert_hello(&hello(&NodeId::new(), "obx_secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, HelloError::UnknownNode));
    }

    #[tokio::test]
    async fn test_re_hello_mints_new_session() {
        let (db, registry, hasher) = setup().await;
        let node_id = provision(&db, &hasher, "obx_secret").await;

        let (_, first) = registry
            .upsert_hello(&hello(&node_id, "obx_secret"))
            .await
            .unwrap();
        let (_, second) = registry
            .upsert_hello(&hello(&node_id, "obx_secret"))
            .await
            .unwrap();
        assert_ne!(first, second);

        // Only the second session may touch now
        assert_eq!(
            registry.touch(&node_id, &first).await.unwrap(),
            TouchResult::SessionMismatch
        );
        assert_eq!(
            registry.touch(&node_id, &second).await.unwrap(),
            TouchResult::Touched
        );
    }

    #[tokio::test]
    async fn test_candidates_normalize_capability_case() {
        let (db, registry, hasher) = setup().await;
        let node_id = provision(&db, &hasher, "obx_secret").await;
        let mut request = hello(&node_id, "obx_secret");
        request.capabilities = vec![CapabilityDecl {
            name: "pythonExec".into(),
            max_inflight: 2,
        }];
        registry.upsert_hello(&request).await.unwrap();

        for spelling in ["pythonExec", "pythonexec", "PYTHONEXEC"] {
            let candidates = registry
                .candidates(spelling, &RouteScope::Global)
                .await
                .unwrap();
            assert_eq!(candidates.len(), 1, "spelling {spelling}");
            assert_eq!(capability_key(spelling), "pythonexec");
        }
    }
}
