use crate::config::RegistryConfig;
use crate::interfaces::{
    CatalogObserver, CertificateInspector, CertificateStore, ExtensionCertificateProvider,
    PolicyCertificateProvider,
};
use crate::source::{
    ExtensionSource, PlatformSource, PolicyMode, PolicySource, Source, SourceContext, SourceEvent,
    SourceId,
};
use crate::types::{
    CapabilityFlags, CertType, CertificateHandle, CertificateRecord, ImportOutcome, ImportStatus,
    OrganizationGroupingMap, Pkcs12Bundle, TrustBits,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Builds one source once its context (priority slot + event line) is known
pub type SourceFactory = Box<dyn FnOnce(SourceContext) -> Box<dyn Source> + Send>;

/// Collaborators handed to the registry at creation
pub struct RegistryParams {
    pub inspector: Arc<dyn CertificateInspector>,
    pub policy_provider: Option<Arc<dyn PolicyCertificateProvider>>,
    pub extension_provider: Option<Arc<dyn ExtensionCertificateProvider>>,
    pub config: RegistryConfig,
}

impl RegistryParams {
    pub fn new(inspector: Arc<dyn CertificateInspector>) -> Self {
        Self {
            inspector,
            policy_provider: None,
            extension_provider: None,
            config: RegistryConfig::default(),
        }
    }

    pub fn with_policy_provider(mut self, provider: Arc<dyn PolicyCertificateProvider>) -> Self {
        self.policy_provider = Some(provider);
        self
    }

    pub fn with_extension_provider(mut self, provider: Arc<dyn ExtensionCertificateProvider>) -> Self {
        self.extension_provider = Some(provider);
        self
    }

    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }
}

/// Aggregates the certificate sources into one catalog.
///
/// Lives on a single owner context: every method, and every
/// [`SourceEvent`] the sources emit, is processed there. Sources are kept in
/// priority order; earlier sources win duplicate and ownership decisions.
pub struct Registry {
    sources: Vec<Box<dyn Source>>,
    hold_back: bool,
    observer: Arc<dyn CatalogObserver>,
    inspector: Arc<dyn CertificateInspector>,
    store: Option<Arc<dyn CertificateStore>>,
    capabilities: CapabilityFlags,
    events: mpsc::UnboundedReceiver<SourceEvent>,
    runtime: Option<Handle>,
    notifications: u64,
}

impl Registry {
    /// Wire the standard sources in priority order:
    /// web-trusted policy, platform store, policy without web trust, extensions.
    pub fn new(
        params: RegistryParams,
        observer: Arc<dyn CatalogObserver>,
        store: Option<Arc<dyn CertificateStore>>,
        capabilities: CapabilityFlags,
    ) -> Self {
        let RegistryParams {
            inspector,
            policy_provider,
            extension_provider,
            config,
        } = params;

        let policy_provider = policy_provider.filter(|_| config.sources.policy_enabled);
        let extension_provider = extension_provider.filter(|_| config.sources.extensions_enabled);
        let mut factories: Vec<SourceFactory> = Vec::new();

        // Policy certificates with web trust come first so a certificate that
        // is also in the platform store shows up as its most trusted variant.
        if let Some(provider) = &policy_provider {
            factories.push(policy_factory(
                Arc::clone(provider),
                Arc::clone(&inspector),
                PolicyMode::WithWebTrust,
            ));
        }

        if let Some(store) = &store {
            let store = Arc::clone(store);
            let inspector = Arc::clone(&inspector);
            let label = config.display.hardware_backed_label.clone();
            factories.push(Box::new(move |context: SourceContext| -> Box<dyn Source> {
                Box::new(PlatformSource::new(context, store, inspector, label))
            }));
        }

        // Below the platform store: users can add trust to a policy
        // certificate by re-importing it.
        if let Some(provider) = policy_provider {
            factories.push(policy_factory(
                provider,
                Arc::clone(&inspector),
                PolicyMode::WithoutWebTrust,
            ));
        }

        if let Some(provider) = extension_provider {
            let inspector = Arc::clone(&inspector);
            let suffix = config.display.extension_provided_suffix.clone();
            factories.push(Box::new(move |context: SourceContext| -> Box<dyn Source> {
                Box::new(ExtensionSource::new(context, provider, inspector, suffix))
            }));
        }

        Self::from_factories(factories, observer, inspector, store, capabilities)
    }

    /// Build a registry from an explicit, already ordered list of sources.
    ///
    /// Asynchronous listing runs on the Tokio runtime current at this call.
    /// Built outside a runtime, asynchronous sources keep their records
    /// when refreshed.
    pub fn from_factories(
        factories: Vec<SourceFactory>,
        observer: Arc<dyn CatalogObserver>,
        inspector: Arc<dyn CertificateInspector>,
        store: Option<Arc<dyn CertificateStore>>,
        capabilities: CapabilityFlags,
    ) -> Self {
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            warn!("Certificate registry created outside a Tokio runtime");
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let sources: Vec<Box<dyn Source>> = factories
            .into_iter()
            .enumerate()
            .map(|(index, factory)| {
                factory(SourceContext::new(
                    SourceId::new(index),
                    events_tx.clone(),
                    runtime.clone(),
                ))
            })
            .collect();

        info!(
            sources = sources.len(),
            user_db_available = capabilities.user_db_available,
            hardware_token_available = capabilities.hardware_token_available,
            "Certificate registry created"
        );

        Self {
            sources,
            hold_back: false,
            observer,
            inspector,
            store,
            capabilities,
            events,
            runtime,
            notifications: 0,
        }
    }

    // ========================================================================
    // REFRESH & NOTIFICATION
    // ========================================================================

    /// Ask every source to refresh. Returns before asynchronous sources are
    /// done; wait for the observer before reading the catalog.
    pub fn refresh(&mut self) {
        debug!(sources = self.sources.len(), "Catalog refresh started");
        self.hold_back = true;

        for source in &mut self.sources {
            source.refresh();
        }

        // Sources that finished synchronously have queued their update;
        // absorb those while notifications are still held back.
        self.process_pending_events();

        self.hold_back = false;
        self.on_source_updated();
    }

    /// Deliver the observer notification unless the registry or any source
    /// is holding back. Returns whether the observer was notified.
    pub fn on_source_updated(&mut self) -> bool {
        if self.hold_back {
            trace!("Registry holding back, notification suppressed");
            return false;
        }
        if let Some(source) = self.sources.iter().find(|source| source.is_holding_back()) {
            trace!(source = %source.core().id(), kind = %source.kind(), "Source holding back, notification suppressed");
            return false;
        }

        self.notifications = self.notifications.saturating_add(1);
        debug!(notifications = self.notifications, "Catalog refreshed");
        self.observer.on_catalog_refreshed();
        true
    }

    /// Apply one message from a source
    pub fn handle_event(&mut self, event: SourceEvent) {
        let id = event.source();
        let Some(source) = self.sources.get_mut(id.index()) else {
            warn!(source = %id, "Event from unknown source ignored");
            return;
        };

        match event {
            SourceEvent::Published {
                generation, records, ..
            } => {
                if source.core_mut().accept_publication(generation, records) {
                    self.on_source_updated();
                }
            }
            SourceEvent::Updated { .. } => {
                self.on_source_updated();
            }
            SourceEvent::RefreshRequested { .. } => {
                debug!(source = %id, kind = %source.kind(), "Source refresh requested upstream");
                source.refresh();
            }
        }
    }

    /// Apply every event already queued, without waiting. Returns how many
    /// were handled.
    pub fn process_pending_events(&mut self) -> usize {
        let mut handled = 0usize;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            handled = handled.saturating_add(1);
        }
        handled
    }

    /// Wait for the next source event. The registry keeps a sender alive
    /// through its sources, so this only yields `None` when it has none.
    pub async fn next_event(&mut self) -> Option<SourceEvent> {
        if self.sources.is_empty() {
            return None;
        }
        self.events.recv().await
    }

    /// Handle events until no source is holding back, then drain whatever
    /// else is queued
    pub async fn run_until_settled(&mut self) {
        while !self.is_settled() {
            match self.next_event().await {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
        self.process_pending_events();
    }

    /// No refresh in flight: neither the registry nor any source holds back
    pub fn is_settled(&self) -> bool {
        !self.hold_back && !self.sources.iter().any(|source| source.is_holding_back())
    }

    pub fn is_holding_back(&self) -> bool {
        self.hold_back
    }

    /// Runtime captured at construction; asynchronous listing runs here
    pub fn runtime(&self) -> Option<&Handle> {
        self.runtime.as_ref()
    }

    /// How many times the observer has been notified
    pub fn notification_count(&self) -> u64 {
        self.notifications
    }

    // ========================================================================
    // OWNERSHIP & MUTATION
    // ========================================================================

    /// First source, in priority order, that holds `handle`
    pub fn find_owning_source(&self, handle: &CertificateHandle) -> Option<SourceId> {
        self.sources
            .iter()
            .find(|source| source.has_certificate(handle))
            .map(|source| source.core().id())
    }

    pub fn set_trust(&mut self, handle: &CertificateHandle, cert_type: CertType, trust: TrustBits) -> bool {
        match self.owning_source_mut(handle) {
            Some(source) => source.set_trust(handle, cert_type, trust),
            None => false,
        }
    }

    pub fn delete(&mut self, handle: &CertificateHandle) -> bool {
        match self.owning_source_mut(handle) {
            Some(source) => source.delete(handle),
            None => false,
        }
    }

    fn owning_source_mut(&mut self, handle: &CertificateHandle) -> Option<&mut Box<dyn Source>> {
        let owner = self.find_owning_source(handle);
        match owner {
            Some(id) => self.sources.get_mut(id.index()),
            None => {
                debug!(certificate = ?handle, "No source owns certificate");
                None
            }
        }
    }

    // ========================================================================
    // CATALOG VIEWS
    // ========================================================================

    /// Records of `filter` type, deduplicated across sources (the highest
    /// priority copy wins) and bucketed by organization. The map holds its
    /// own copies, unaffected by later refreshes.
    pub fn build_organization_grouping(&self, filter: CertType) -> OrganizationGroupingMap {
        let mut unique: BTreeMap<CertificateHandle, CertificateRecord> = BTreeMap::new();
        for source in &self.sources {
            for record in source.records() {
                if record.cert_type() != filter {
                    continue;
                }
                unique
                    .entry(record.handle().clone())
                    .or_insert_with(|| record.clone());
            }
        }

        let mut grouping = OrganizationGroupingMap::new();
        for (handle, record) in unique {
            let organization = organization_of(self.inspector.as_ref(), &handle);
            grouping.entry(organization).or_default().push(record);
        }
        grouping
    }

    /// Every published record of every source, in priority order, duplicates
    /// included
    pub fn all_records(&self) -> Vec<CertificateRecord> {
        self.sources
            .iter()
            .flat_map(|source| source.records().iter().cloned())
            .collect()
    }

    pub fn source(&self, id: SourceId) -> Option<&dyn Source> {
        self.sources.get(id.index()).map(|source| source.as_ref())
    }

    pub fn sources(&self) -> impl Iterator<Item = &dyn Source> {
        self.sources.iter().map(|source| source.as_ref())
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn capabilities(&self) -> CapabilityFlags {
        self.capabilities
    }

    pub fn is_user_db_available(&self) -> bool {
        self.capabilities.user_db_available
    }

    pub fn is_hardware_token_available(&self) -> bool {
        self.capabilities.hardware_token_available
    }

    // ========================================================================
    // IMPORTS
    // ========================================================================

    /// Import a PKCS#12 bundle into the store; refreshes on success
    pub fn import_from_store(&mut self, bundle: &Pkcs12Bundle) -> ImportStatus {
        let Some(store) = self.store.clone() else {
            return store_unavailable_status();
        };
        let status = store.import_pkcs12(bundle);
        self.refresh_after_import("pkcs12", status.is_ok());
        status
    }

    pub fn import_user_certificate(&mut self, data: &[u8]) -> ImportStatus {
        let Some(store) = self.store.clone() else {
            return store_unavailable_status();
        };
        let status = store.import_user_certificate(data);
        self.refresh_after_import("user_certificate", status.is_ok());
        status
    }

    /// Import CA certificates. Refreshes when the store reports success and
    /// at least one certificate went in.
    pub fn import_ca_chain(&mut self, certificates: &[CertificateHandle], trust: TrustBits) -> ImportOutcome {
        let Some(store) = self.store.clone() else {
            warn!("CA import requested without a certificate store");
            return ImportOutcome::failed();
        };
        let outcome = store.import_ca_chain(certificates, trust);
        self.refresh_after_import("ca_chain", outcome.imported_any(certificates.len()));
        outcome
    }

    pub fn import_server_chain(
        &mut self,
        certificates: &[CertificateHandle],
        trust: TrustBits,
    ) -> ImportOutcome {
        let Some(store) = self.store.clone() else {
            warn!("Server certificate import requested without a certificate store");
            return ImportOutcome::failed();
        };
        let outcome = store.import_server_chain(certificates, trust);
        self.refresh_after_import("server_chain", outcome.imported_any(certificates.len()));
        outcome
    }

    fn refresh_after_import(&mut self, kind: &str, changed: bool) {
        if changed {
            debug!(import = kind, "Import changed the store, refreshing");
            self.refresh();
        } else {
            debug!(import = kind, "Import changed nothing");
        }
    }
}

fn policy_factory(
    provider: Arc<dyn PolicyCertificateProvider>,
    inspector: Arc<dyn CertificateInspector>,
    mode: PolicyMode,
) -> SourceFactory {
    Box::new(move |context: SourceContext| -> Box<dyn Source> {
        Box::new(PolicySource::new(context, provider, inspector, mode))
    })
}

fn store_unavailable_status() -> ImportStatus {
    warn!("Import requested without a certificate store");
    ImportStatus::Failed("certificate store unavailable".to_string())
}

/// Subject organization, or the subject display name when there is none
pub fn organization_of(inspector: &dyn CertificateInspector, handle: &CertificateHandle) -> String {
    let organization = inspector.subject_organization(handle);
    if organization.is_empty() {
        inspector.subject_display_name(handle)
    } else {
        organization
    }
}
