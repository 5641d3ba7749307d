//! Contracts of the collaborators the registry consumes.
//!
//! None of these are implemented here: the backing store, the policy and
//! extension providers and the X.509 inspector all live outside this crate.

use crate::types::{
    CertType, CertificateHandle, ImportOutcome, ImportStatus, Pkcs12Bundle, TrustBits,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;

// ============================================================================
// BACKING STORE
// ============================================================================

/// Persistent certificate database.
///
/// The store serializes concurrent access itself; the registry adds no
/// locking around these calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Unlock crypto modules that need a password before listing.
    async fn unlock_modules(&self) {}

    /// Every certificate currently in the store
    async fn list_certificates(&self) -> Vec<CertificateHandle>;

    fn set_trust(&self, handle: &CertificateHandle, cert_type: CertType, trust: TrustBits) -> bool;

    /// Remove a certificate together with its private key, if any
    fn delete_certificate_and_key(&self, handle: &CertificateHandle) -> bool;

    fn import_pkcs12(&self, bundle: &Pkcs12Bundle) -> ImportStatus;

    fn import_user_certificate(&self, data: &[u8]) -> ImportStatus;

    fn import_ca_chain(&self, certificates: &[CertificateHandle], trust: TrustBits) -> ImportOutcome;

    fn import_server_chain(
        &self,
        certificates: &[CertificateHandle],
        trust: TrustBits,
    ) -> ImportOutcome;

    fn is_read_only(&self, handle: &CertificateHandle) -> bool;

    fn is_untrusted(&self, handle: &CertificateHandle) -> bool;

    fn is_hardware_backed(&self, handle: &CertificateHandle) -> bool;

    fn is_web_trust_anchor(&self, handle: &CertificateHandle) -> bool;

    /// Whether a user-writable slot exists
    fn has_public_slot(&self) -> bool;
}

/// Outcome of asking the loader for the store
pub enum StoreAcquisition {
    /// The store was already open
    Ready(Arc<dyn CertificateStore>),
    /// The store is being opened; the receiver resolves once it is.
    /// A dropped sender means opening failed.
    Pending(oneshot::Receiver<Arc<dyn CertificateStore>>),
    /// The store cannot be opened at all
    Unavailable(String),
}

/// Obtains the backing store and probes platform capabilities.
///
/// Both calls may block and are only ever made from the I/O context.
pub trait StoreLoader: Send + Sync {
    fn acquire_store(&self) -> StoreAcquisition;

    fn hardware_token_available(&self) -> bool;
}

// ============================================================================
// POLICY PROVIDER
// ============================================================================

/// Token returned by [`PolicyCertificateProvider::add_observer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// Push notification from the policy provider
pub trait PolicyObserver: Send + Sync {
    fn on_policy_certificates_changed(&self);
}

/// Certificates installed through enterprise policy, as DER blobs
pub trait PolicyCertificateProvider: Send + Sync {
    fn certificates_without_web_trust(&self) -> Vec<Vec<u8>>;

    fn web_trusted_certificates(&self) -> Vec<Vec<u8>>;

    fn add_observer(&self, observer: Arc<dyn PolicyObserver>) -> ObserverId;

    fn remove_observer(&self, id: ObserverId);
}

// ============================================================================
// EXTENSION PROVIDER
// ============================================================================

/// A client certificate offered by an extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificateIdentity {
    pub certificate_der: Vec<u8>,
    pub extension_id: String,
}

#[async_trait]
pub trait ExtensionCertificateProvider: Send + Sync {
    async fn certificates(&self) -> Vec<ClientCertificateIdentity>;
}

// ============================================================================
// INSPECTION & OBSERVATION
// ============================================================================

/// Read-only view into certificate contents (parsing lives elsewhere)
pub trait CertificateInspector: Send + Sync {
    fn cert_type(&self, handle: &CertificateHandle) -> CertType;

    fn name_or_nickname(&self, handle: &CertificateHandle) -> String;

    /// Subject organization (O=), empty when absent
    fn subject_organization(&self, handle: &CertificateHandle) -> String;

    fn subject_display_name(&self, handle: &CertificateHandle) -> String;
}

/// Notified whenever the aggregated catalog is complete and has changed
pub trait CatalogObserver: Send + Sync {
    fn on_catalog_refreshed(&self);
}
