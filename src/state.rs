use std::sync::Arc;

use crate::{
    config::IdentityBackend,
    lifecycle::Lifecycle,
    pdp::EntitlementPdp,
    resolve::{
        dynamo::DynamoDirectory, keycloak::KeycloakDirectory, memory::MemoryDirectory,
        store::StoreError, EntityResolve, EntityResolver,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub pdp: Arc<EntitlementPdp>,
    pub resolver: Arc<dyn EntityResolve>,
    pub lifecycle: Arc<Lifecycle>,
}

impl AppState {
    pub fn new(pdp: EntitlementPdp, resolver: Arc<dyn EntityResolve>) -> Self {
        Self {
            pdp: Arc::new(pdp),
            resolver,
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }
}

/// Build the resolver for the configured identity backend. For Keycloak this
/// performs the initial service-account login, so an unreachable or
/// misconfigured provider fails here rather than on the first request.
pub async fn identity_resolver(
    backend: &IdentityBackend,
) -> Result<Arc<dyn EntityResolve>, StoreError> {
    match backend {
        IdentityBackend::Keycloak(config) => {
            tracing::info!(url = %config.url, realm = %config.realm, "using Keycloak identity backend");
            let directory = KeycloakDirectory::new(config.clone())?;
            directory.login().await?;
            Ok(Arc::new(EntityResolver::new(directory)))
        }
        IdentityBackend::DynamoDb(config) => {
            let directory = DynamoDirectory::connect(config.clone()).await;
            Ok(Arc::new(EntityResolver::new(directory)))
        }
        IdentityBackend::Memory { seed } => {
            let directory = match seed {
                Some(path) => MemoryDirectory::from_seed_file(path).await?,
                None => {
                    tracing::info!("using empty in-memory identity backend");
                    MemoryDirectory::new()
                }
            };
            Ok(Arc::new(EntityResolver::new(directory)))
        }
    }
}
