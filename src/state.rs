//! Application state management
//!
//! Wires the collaborators behind the ports into the escrow service and the
//! job manager. Handlers receive a clone of [`AppState`].

use std::sync::Arc;

use tracing::info;

use crate::config::Settings;
use crate::error::Result;
use crate::infrastructure::{MemoryStore, RedisStore, SandboxGateway};
use crate::jobs::{EscrowJobs, JobManager, SharedConfig};
use crate::ports::{Notifier, PaymentGateway, Store};
use crate::services::escrow_service::EscrowService;
use crate::services::notification_service::SlackNotifier;

/// Shared application state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub escrow: Arc<EscrowService>,
    pub jobs: Arc<JobManager>,
}

impl AppState {
    /// Connects to redis when configured, otherwise keeps records in memory.
    pub async fn new(settings: &Settings) -> Result<Self> {
        let store: Arc<dyn Store> = match settings.redis_url.as_deref() {
            Some(url) => {
                info!("using redis store");
                Arc::new(RedisStore::connect(url).await?)
            }
            None => {
                info!("REDIS_URL not set, using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };
        let gateway = Arc::new(SandboxGateway::new(settings.auto_accept_payments));
        let notifier = Arc::new(SlackNotifier::new(settings.slack_webhook_url.clone()));

        Ok(Self::with_parts(store, gateway, notifier, settings))
    }

    pub fn with_parts(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        settings: &Settings,
    ) -> Self {
        let config = SharedConfig::new(settings.jobs.clone());
        let escrow = Arc::new(EscrowService::new(
            store,
            gateway,
            notifier,
            config.clone(),
            settings.escrow.clone(),
        ));
        let executor = Arc::new(EscrowJobs::new(escrow.clone(), config.clone()));
        let jobs = Arc::new(JobManager::new(executor, config));

        Self { escrow, jobs }
    }
}
