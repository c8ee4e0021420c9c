//! Explicit wiring of the gateway's services.

use std::sync::Arc;

use axum::http::HeaderMap;
use hestia_core::{HestiaError, Result, User};
use tracing::{info, warn};

use crate::auth::{AuthClaims, Authenticator};
use crate::config::GatewaySettings;
use crate::connections::ConnectionService;
use crate::drivers::DriverRegistry;
use crate::gaia::GaiaService;
use crate::index::MetadataIndex;
use crate::store::Store;
use crate::sync::SyncService;

/// Written by clients on first sign-in; storing it may auto-register the user.
pub const PROFILE_FILE: &str = "profile.json";

/// Application state shared across handlers.
pub struct Hestia {
    pub settings: GatewaySettings,
    pub store: Arc<dyn Store>,
    pub index: MetadataIndex,
    pub drivers: Arc<DriverRegistry>,
    pub connections: Arc<ConnectionService>,
    pub gaia: Arc<GaiaService>,
    pub sync: Arc<SyncService>,
    pub auth: Arc<dyn Authenticator>,
}

impl Hestia {
    pub fn new(
        settings: GatewaySettings,
        store: Arc<dyn Store>,
        drivers: DriverRegistry,
        auth: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        let drivers = Arc::new(drivers);
        let index = MetadataIndex::new(store.clone());
        let connections = Arc::new(ConnectionService::new(
            store.clone(),
            index.clone(),
            drivers.clone(),
            settings.page_size,
        ));
        let gaia = Arc::new(GaiaService::new(
            store.clone(),
            index.clone(),
            drivers.clone(),
            connections.clone(),
            settings.page_size,
            settings.max_blob_size,
        ));
        let sync = Arc::new(SyncService::new(store.clone(), index.clone(), connections.clone()));

        Arc::new(Self {
            settings,
            store,
            index,
            drivers,
            connections,
            gaia,
            sync,
            auth,
        })
    }

    /// Public URL of a stored file.
    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/gaia/read/{}/{}", self.settings.origin, bucket, path)
    }

    /// Verify the request's token for `bucket` and check it against the
    /// bucket's revocation watermark.
    async fn claims_for(&self, bucket: &str, headers: &HeaderMap) -> Result<AuthClaims> {
        let claims = self.auth.validate_bucket(bucket, headers).await?;
        let watermark = self.gaia.get_auth_timestamp(bucket).await;
        if claims.issued_at < watermark {
            return Err(HestiaError::Auth(format!(
                "Token issued before {} was revoked",
                watermark.to_rfc3339()
            )));
        }
        Ok(claims)
    }

    /// Authorize a bucket operation and load the owning user.
    ///
    /// Storing `profile.json` into the bucket of an unknown address registers
    /// that address with every auto-registering driver first.
    pub async fn authorize(&self, bucket: &str, headers: &HeaderMap, path: Option<&str>) -> Result<User> {
        let claims = self.claims_for(bucket, headers).await?;

        let user = match self.store.get_user_from_bucket(bucket).await {
            Ok(u) => u,
            Err(e) if e.is_not_found() && path == Some(PROFILE_FILE) => self.auto_register(bucket, None).await?,
            Err(e) => return Err(e),
        };

        let owner = claims.signer_address == bucket
            || claims.signer_address == user.address
            || claims.issuer_address == user.address;
        if !owner {
            return Err(HestiaError::Auth(format!(
                "{} may not write to bucket {}",
                claims.signer_address, bucket
            )));
        }
        Ok(user)
    }

    /// Authorize a request acting on the user `address` itself.
    pub async fn authorize_user(&self, address: &str, headers: &HeaderMap) -> Result<User> {
        self.authenticate_address(address, headers).await?;
        self.store.get_user(address).await
    }

    /// Sign `address` in, registering it on first sight. A token issued by a
    /// key other than the signer's makes the issuer the user's internal bucket.
    pub async fn login(&self, address: &str, headers: &HeaderMap) -> Result<User> {
        let claims = self.claims_for(address, headers).await?;
        if claims.signer_address != address {
            return Err(HestiaError::Auth(format!(
                "{} may not sign in as {}",
                claims.signer_address, address
            )));
        }
        let internal = (claims.issuer_address != claims.signer_address).then_some(claims.issuer_address);

        let mut user = match self.store.get_user(address).await {
            Ok(u) => u,
            Err(e) if e.is_not_found() => return self.auto_register(address, internal).await,
            Err(e) => return Err(e),
        };
        if let Some(issuer) = internal {
            if user.internal_bucket_address.as_deref() != Some(issuer.as_str()) {
                info!("{} now writes through internal bucket {}", address, issuer);
                user.internal_bucket_address = Some(issuer);
                self.store.update_user(&user).await?;
            }
        }
        Ok(user)
    }

    /// Check the caller is `address`, without requiring a user record.
    pub async fn authenticate_address(&self, address: &str, headers: &HeaderMap) -> Result<()> {
        let claims = self.claims_for(address, headers).await?;
        if claims.signer_address != address && claims.issuer_address != address {
            return Err(HestiaError::Auth(format!(
                "{} may not act for {}",
                claims.signer_address, address
            )));
        }
        Ok(())
    }

    async fn auto_register(&self, address: &str, internal: Option<String>) -> Result<User> {
        if !self.drivers.any_auto_register() {
            return Err(HestiaError::not_found(format!("No user found for \"{}\"", address)));
        }
        if !self.settings.allows(address) {
            warn!("Refusing to auto-register {}: not whitelisted", address);
            return Err(HestiaError::not_allowed(format!("{} is not whitelisted", address)));
        }

        let mut user = User::new(address);
        user.internal_bucket_address = internal;
        if !self.drivers.auto_register_user(&mut user).await? {
            return Err(HestiaError::not_allowed(format!(
                "No driver could auto-register {}",
                address
            )));
        }
        self.store.register_user(&user).await?;
        info!("Auto-registered new user {}", address);
        Ok(user)
    }
}
