//! In-memory collaborators shared by the integration tests.
//!
//! Certificates are plain text DER stand-ins of the form
//! `"type|organization|name"`, which [`PipeInspector`] splits apart.

#![allow(dead_code)]

use async_trait::async_trait;
use cert_registry::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub fn der(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

pub fn cert(text: &str) -> CertificateHandle {
    CertificateHandle::from_der(der(text)).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// INSPECTOR & OBSERVER
// ============================================================================

pub struct PipeInspector;

fn field(handle: &CertificateHandle, index: usize) -> String {
    String::from_utf8_lossy(handle.der())
        .split('|')
        .nth(index)
        .unwrap_or_default()
        .to_string()
}

impl CertificateInspector for PipeInspector {
    fn cert_type(&self, handle: &CertificateHandle) -> CertType {
        match field(handle, 0).as_str() {
            "ca" => CertType::Ca,
            "user" => CertType::User,
            "server" => CertType::Server,
            "email" => CertType::Email,
            _ => CertType::Other,
        }
    }

    fn name_or_nickname(&self, handle: &CertificateHandle) -> String {
        field(handle, 2)
    }

    fn subject_organization(&self, handle: &CertificateHandle) -> String {
        field(handle, 1)
    }

    fn subject_display_name(&self, handle: &CertificateHandle) -> String {
        field(handle, 2)
    }
}

#[derive(Default)]
pub struct CountingObserver {
    count: AtomicUsize,
}

impl CountingObserver {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl CatalogObserver for CountingObserver {
    fn on_catalog_refreshed(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// STORE
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    certificates: Mutex<Vec<CertificateHandle>>,
    hardware_backed: Mutex<HashSet<CertificateHandle>>,
    rejected: Mutex<HashSet<CertificateHandle>>,
    list_delay: Mutex<Option<Duration>>,
    public_slot: bool,
    pub list_calls: AtomicUsize,
    pub unlock_calls: AtomicUsize,
    pub trust_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(certificates: &[&str]) -> Self {
        Self {
            certificates: Mutex::new(certificates.iter().map(|c| cert(c)).collect()),
            public_slot: true,
            ..Default::default()
        }
    }

    pub fn without_public_slot(mut self) -> Self {
        self.public_slot = false;
        self
    }

    pub fn with_list_delay(self, delay: Duration) -> Self {
        *self.list_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn mark_hardware_backed(&self, text: &str) {
        self.hardware_backed.lock().unwrap().insert(cert(text));
    }

    pub fn reject_on_import(&self, text: &str) {
        self.rejected.lock().unwrap().insert(cert(text));
    }

    pub fn contains(&self, text: &str) -> bool {
        self.certificates.lock().unwrap().contains(&cert(text))
    }

    fn import_chain(&self, certificates: &[CertificateHandle]) -> ImportOutcome {
        let rejected = self.rejected.lock().unwrap().clone();
        let mut stored = self.certificates.lock().unwrap();
        let mut outcome = ImportOutcome::succeeded();
        for handle in certificates {
            if rejected.contains(handle) {
                outcome
                    .not_imported
                    .push(ImportFailure::new(handle.clone(), "rejected by store"));
            } else if !stored.contains(handle) {
                stored.push(handle.clone());
            }
        }
        outcome
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn unlock_modules(&self) {
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn list_certificates(&self) -> Vec<CertificateHandle> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.certificates.lock().unwrap().clone()
    }

    fn set_trust(&self, handle: &CertificateHandle, _cert_type: CertType, _trust: TrustBits) -> bool {
        self.trust_calls.fetch_add(1, Ordering::SeqCst);
        self.certificates.lock().unwrap().contains(handle)
    }

    fn delete_certificate_and_key(&self, handle: &CertificateHandle) -> bool {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.certificates.lock().unwrap();
        let before = stored.len();
        stored.retain(|c| c != handle);
        stored.len() != before
    }

    fn import_pkcs12(&self, bundle: &Pkcs12Bundle) -> ImportStatus {
        if bundle.data.is_empty() {
            return ImportStatus::InvalidData;
        }
        self.certificates
            .lock()
            .unwrap()
            .push(CertificateHandle::from_der(bundle.data.clone()).unwrap());
        ImportStatus::Ok
    }

    fn import_user_certificate(&self, data: &[u8]) -> ImportStatus {
        match CertificateHandle::from_der(data.to_vec()) {
            Some(handle) => {
                self.certificates.lock().unwrap().push(handle);
                ImportStatus::Ok
            }
            None => ImportStatus::InvalidData,
        }
    }

    fn import_ca_chain(&self, certificates: &[CertificateHandle], _trust: TrustBits) -> ImportOutcome {
        self.import_chain(certificates)
    }

    fn import_server_chain(&self, certificates: &[CertificateHandle], _trust: TrustBits) -> ImportOutcome {
        self.import_chain(certificates)
    }

    fn is_read_only(&self, _handle: &CertificateHandle) -> bool {
        false
    }

    fn is_untrusted(&self, _handle: &CertificateHandle) -> bool {
        false
    }

    fn is_hardware_backed(&self, handle: &CertificateHandle) -> bool {
        self.hardware_backed.lock().unwrap().contains(handle)
    }

    fn is_web_trust_anchor(&self, _handle: &CertificateHandle) -> bool {
        false
    }

    fn has_public_slot(&self) -> bool {
        self.public_slot
    }
}

// ============================================================================
// PROVIDERS
// ============================================================================

#[derive(Default)]
pub struct MemoryPolicyProvider {
    without_web_trust: Mutex<Vec<Vec<u8>>>,
    web_trusted: Mutex<Vec<Vec<u8>>>,
    observers: Mutex<HashMap<u64, Arc<dyn PolicyObserver>>>,
    next_id: AtomicU64,
}

impl MemoryPolicyProvider {
    pub fn new(without_web_trust: &[&str], web_trusted: &[&str]) -> Self {
        Self {
            without_web_trust: Mutex::new(without_web_trust.iter().map(|c| der(c)).collect()),
            web_trusted: Mutex::new(web_trusted.iter().map(|c| der(c)).collect()),
            ..Default::default()
        }
    }

    pub fn set_web_trusted(&self, certificates: Vec<Vec<u8>>) {
        *self.web_trusted.lock().unwrap() = certificates;
    }

    /// Simulate a policy update reaching every subscriber
    pub fn push_change(&self) {
        let observers: Vec<_> = self.observers.lock().unwrap().values().cloned().collect();
        for observer in observers {
            observer.on_policy_certificates_changed();
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }
}

impl PolicyCertificateProvider for MemoryPolicyProvider {
    fn certificates_without_web_trust(&self) -> Vec<Vec<u8>> {
        self.without_web_trust.lock().unwrap().clone()
    }

    fn web_trusted_certificates(&self) -> Vec<Vec<u8>> {
        self.web_trusted.lock().unwrap().clone()
    }

    fn add_observer(&self, observer: Arc<dyn PolicyObserver>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.observers.lock().unwrap().insert(id, observer);
        ObserverId(id)
    }

    fn remove_observer(&self, id: ObserverId) {
        self.observers.lock().unwrap().remove(&id.0);
    }
}

#[derive(Default)]
pub struct MemoryExtensionProvider {
    identities: Mutex<Vec<ClientCertificateIdentity>>,
    delay: Option<Duration>,
}

impl MemoryExtensionProvider {
    pub fn new(certificates: &[&str]) -> Self {
        Self {
            identities: Mutex::new(
                certificates
                    .iter()
                    .map(|c| ClientCertificateIdentity {
                        certificate_der: der(c),
                        extension_id: "test-extension".to_string(),
                    })
                    .collect(),
            ),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ExtensionCertificateProvider for MemoryExtensionProvider {
    async fn certificates(&self) -> Vec<ClientCertificateIdentity> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.identities.lock().unwrap().clone()
    }
}

// ============================================================================
// LOADER
// ============================================================================

pub enum LoaderMode {
    Ready(Arc<MemoryStore>),
    Pending(oneshot::Receiver<Arc<dyn CertificateStore>>),
    Unavailable,
}

pub struct FakeLoader {
    mode: Mutex<Option<LoaderMode>>,
    hardware_token: bool,
    pub acquire_threads: Mutex<Vec<Option<String>>>,
}

impl FakeLoader {
    pub fn new(mode: LoaderMode, hardware_token: bool) -> Self {
        Self {
            mode: Mutex::new(Some(mode)),
            hardware_token,
            acquire_threads: Mutex::new(Vec::new()),
        }
    }

    pub fn ready(store: Arc<MemoryStore>) -> Self {
        Self::new(LoaderMode::Ready(store), false)
    }

    /// A loader whose store opens when the returned sender fires
    pub fn pending() -> (Self, oneshot::Sender<Arc<dyn CertificateStore>>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(LoaderMode::Pending(rx), false), tx)
    }
}

impl StoreLoader for FakeLoader {
    fn acquire_store(&self) -> StoreAcquisition {
        self.acquire_threads
            .lock()
            .unwrap()
            .push(std::thread::current().name().map(str::to_string));

        match self.mode.lock().unwrap().take() {
            Some(LoaderMode::Ready(store)) => StoreAcquisition::Ready(store),
            Some(LoaderMode::Pending(rx)) => StoreAcquisition::Pending(rx),
            Some(LoaderMode::Unavailable) | None => {
                StoreAcquisition::Unavailable("no certificate database".to_string())
            }
        }
    }

    fn hardware_token_available(&self) -> bool {
        self.hardware_token
    }
}

// ============================================================================
// REGISTRY SETUP
// ============================================================================

pub struct Fixture {
    pub store: Option<Arc<MemoryStore>>,
    pub policy: Option<Arc<MemoryPolicyProvider>>,
    pub extensions: Option<Arc<MemoryExtensionProvider>>,
    pub observer: Arc<CountingObserver>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            store: None,
            policy: None,
            extensions: None,
            observer: Arc::new(CountingObserver::default()),
        }
    }

    pub fn store(mut self, store: MemoryStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn policy(mut self, provider: MemoryPolicyProvider) -> Self {
        self.policy = Some(Arc::new(provider));
        self
    }

    pub fn extensions(mut self, provider: MemoryExtensionProvider) -> Self {
        self.extensions = Some(Arc::new(provider));
        self
    }

    pub fn params(&self) -> RegistryParams {
        let mut params = RegistryParams::new(Arc::new(PipeInspector));
        if let Some(policy) = &self.policy {
            params = params.with_policy_provider(policy.clone());
        }
        if let Some(extensions) = &self.extensions {
            params = params.with_extension_provider(extensions.clone());
        }
        params
    }

    pub fn registry(&self) -> Registry {
        let store = self
            .store
            .clone()
            .map(|store| store as Arc<dyn CertificateStore>);
        Registry::new(
            self.params(),
            self.observer.clone(),
            store,
            CapabilityFlags::default(),
        )
    }
}
