//! Builder for [`TransferService`].

use payflow_common::{
    DynAccountService, DynEventPublisher, DynIdempotencyCache, DynTransferDatabase, Error,
};

use super::TransferService;
use crate::types::ServiceConfig;

/// Assembles a [`TransferService`] from its four collaborators.
///
/// All collaborators are required; the configuration defaults to
/// [`ServiceConfig::default`].
#[derive(Default)]
pub struct TransferServiceBuilder {
    store: Option<DynTransferDatabase>,
    account: Option<DynAccountService>,
    cache: Option<DynIdempotencyCache>,
    publisher: Option<DynEventPublisher>,
    config: Option<ServiceConfig>,
}

impl TransferServiceBuilder {
    /// Set the transfer store
    pub fn with_store(mut self, store: DynTransferDatabase) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the account port
    pub fn with_account_service(mut self, account: DynAccountService) -> Self {
        self.account = Some(account);
        self
    }

    /// Set the idempotency cache
    pub fn with_cache(mut self, cache: DynIdempotencyCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the event publisher
    pub fn with_publisher(mut self, publisher: DynEventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Override the default configuration
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the service, failing when a collaborator is missing
    pub fn build(self) -> Result<TransferService, Error> {
        let store = self
            .store
            .ok_or_else(|| Error::Custom("transfer store is required".to_string()))?;
        let account = self
            .account
            .ok_or_else(|| Error::Custom("account service is required".to_string()))?;
        let cache = self
            .cache
            .ok_or_else(|| Error::Custom("idempotency cache is required".to_string()))?;
        let publisher = self
            .publisher
            .ok_or_else(|| Error::Custom("event publisher is required".to_string()))?;

        Ok(TransferService::new(
            store,
            account,
            cache,
            publisher,
            self.config.unwrap_or_default(),
        ))
    }
}
