//! Worker provisioning: identity issuance and revocation.

use chrono::Utc;
use onlyboxes_db::Database;
use onlyboxes_protocol::http_types::CreateWorkerResponse;
use onlyboxes_protocol::{NodeId, WorkerType, LABEL_OWNER_ID, LABEL_WORKER_TYPE};
use onlyboxes_security::{generate_secret, SecretHasher};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::auth::Identity;
use crate::streams::StreamHub;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("not authorized")]
    Forbidden,
    #[error("account already owns a worker-sys")]
    AlreadyClaimed,
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct Provisioner {
    db: Database,
    hasher: Arc<SecretHasher>,
    hub: Arc<StreamHub>,
    /// gRPC address embedded in the startup command template.
    advertised_grpc_addr: String,
}

impl Provisioner {
    pub fn new(
        db: Database,
        hasher: Arc<SecretHasher>,
        hub: Arc<StreamHub>,
        advertised_grpc_addr: String,
    ) -> Self {
        Self {
            db,
            hasher,
            hub,
            advertised_grpc_addr,
        }
    }

    /// Issue a worker identity and its one-time secret.
    ///
    /// `normal` workers are admin-only; `worker-sys` is open to every
    /// account but limited to one via the owner-claim table. The
    /// plaintext secret exists only in the returned startup command.
    pub async fn create_worker(
        &self,
        identity: &Identity,
        worker_type: WorkerType,
    ) -> Result<CreateWorkerResponse, ProvisionError> {
        if worker_type == WorkerType::Normal && !identity.is_admin {
            return Err(ProvisionError::Forbidden);
        }

        let node_id = NodeId::new();
        let now = Utc::now();
        if worker_type == WorkerType::WorkerSys {
            let claimed = self
                .db
                .workers()
                .claim_worker_sys_owner(&identity.account_id, &node_id, now)
                .await?;
            if !claimed {
                return Err(ProvisionError::AlreadyClaimed);
            }
        }

        let secret = generate_secret();
        let workers = self.db.workers();
        workers.insert_provisioned(&node_id, now).await?;
        workers
            .set_label(&node_id, LABEL_OWNER_ID, identity.account_id.as_str())
            .await?;
        workers
            .set_label(&node_id, LABEL_WORKER_TYPE, worker_type.as_str())
            .await?;
        workers
            .insert_credential(&node_id, &self.hasher.hash(&secret), now)
            .await?;

        info!(node_id = %node_id, worker_type = %worker_type, "Provisioned worker");
        let command = format!(
            "onlyboxes-worker --console {} --node-id {} --worker-secret {}",
            self.advertised_grpc_addr, node_id, secret
        );
        Ok(CreateWorkerResponse {
            node_id,
            worker_type,
            command,
        })
    }

    /// Revoke a worker: credential, labels, capabilities, claims and the
    /// node row go away; a live stream is told to exit. For a non-admin
    /// caller anything that is not their own worker-sys reads as absent.
    pub async fn delete_worker(
        &self,
        identity: &Identity,
        node_id: &NodeId,
    ) -> Result<(), ProvisionError> {
        let workers = self.db.workers();
        let Some(_node) = workers.get(node_id).await? else {
            return Err(ProvisionError::NotFound);
        };

        if !identity.is_admin {
            let owner = workers.label_value(node_id, LABEL_OWNER_ID).await?;
            let kind = workers.label_value(node_id, LABEL_WORKER_TYPE).await?;
            let owns_it = owner.as_deref() == Some(identity.account_id.as_str())
                && kind.as_deref() == Some(WorkerType::WorkerSys.as_str());
            if !owns_it {
                return Err(ProvisionError::NotFound);
            }
        }

        // Tell the live stream to exit; its receive loop owns teardown
        // (session clear + in-flight command failure).
        if let Some(handle) = self.hub.get(node_id) {
            handle.signal_close();
        }

        if !workers.delete(node_id).await? {
            return Err(ProvisionError::NotFound);
        }
        info!(node_id = %node_id, "Worker deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use onlyboxes_protocol::AccountId;

    async fn setup() -> (Database, Provisioner) {
        let (db, _) = Database::open_in_memory(Duration::days(30)).await.unwrap();
        let hasher = Arc::new(SecretHasher::new("test-key").unwrap());
        let provisioner = Provisioner::new(
            db.clone(),
            hasher,
            Arc::new(StreamHub::new()),
            "127.0.0.1:50051".into(),
        );
        (db, provisioner)
    }

    fn admin() -> Identity {
        Identity {
            account_id: AccountId::new(),
            is_admin: true,
        }
    }

    fn user() -> Identity {
        Identity {
            account_id: AccountId::new(),
            is_admin: false,
        }
    }

    #[tokio::test]
    async fn test_normal_worker_is_admin_only() {
        let (_db, provisioner) = setup().await;
        assert!(matches!(
            provisioner
                .create_worker(&user(), WorkerType::Normal)
                .await
                .unwrap_err(),
            ProvisionError::Forbidden
        ));
        assert!(provisioner
            .create_worker(&admin(), WorkerType::Normal)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_worker_sys_limited_to_one_per_account() {
        let (_db, provisioner) = setup().await;
        let account = user();
        provisioner
            .create_worker(&account, WorkerType::WorkerSys)
            .await
            .unwrap();
        assert!(matches!(
            provisioner
                .create_worker(&account, WorkerType::WorkerSys)
                .await
                .unwrap_err(),
            ProvisionError::AlreadyClaimed
        ));

        // Another account is unaffected
        assert!(provisioner
            .create_worker(&user(), WorkerType::WorkerSys)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_created_worker_carries_system_labels_and_secret() {
        let (db, provisioner) = setup().await;
        let account = user();
        let created = provisioner
            .create_worker(&account, WorkerType::WorkerSys)
            .await
            .unwrap();
        assert!(created.command.contains("--worker-secret obx_"));

        let labels = db.workers().labels_for(&created.node_id).await.unwrap();
        assert_eq!(
            labels.get(LABEL_OWNER_ID).map(String::as_str),
            Some(account.account_id.as_str())
        );
        assert_eq!(
            labels.get(LABEL_WORKER_TYPE).map(String::as_str),
            Some("worker-sys")
        );
        assert!(db
            .workers()
            .get_credential(&created.node_id)
            .await
            .unwrap()
            .is_some());
        let node = db.workers().get(&created.node_id).await.unwrap().unwrap();
        assert!(node.provisioned);
        assert_eq!(node.session_id, "");
    }

    #[tokio::test]
    async fn test_delete_scoping_is_indistinguishable_from_missing() {
        let (db, provisioner) = setup().await;
        let owner = user();
        let created = provisioner
            .create_worker(&owner, WorkerType::WorkerSys)
            .await
            .unwrap();

        // A stranger sees 404, not 403
        assert!(matches!(
            provisioner
                .delete_worker(&user(), &created.node_id)
                .await
                .unwrap_err(),
            ProvisionError::NotFound
        ));

        // The owner can delete; the claim is released with it
        provisioner
            .delete_worker(&owner, &created.node_id)
            .await
            .unwrap();
        assert!(db.workers().get(&created.node_id).await.unwrap().is_none());
        assert!(db
            .workers()
            .get_owner_claim(&owner.account_id)
            .await
            .unwrap()
            .is_none());

        // And the account can provision a fresh worker-sys again
        assert!(provisioner
            .create_worker(&owner, WorkerType::WorkerSys)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_admin_can_delete_any_worker() {
        let (_db, provisioner) = setup().await;
        let owner = user();
        let created = provisioner
            .create_worker(&owner, WorkerType::WorkerSys)
            .await
            .unwrap();
        provisioner
            .delete_worker(&admin(), &created.node_id)
            .await
            .unwrap();
    }
}
