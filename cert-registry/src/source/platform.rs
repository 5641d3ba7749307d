use super::{Source, SourceContext, SourceCore};
use crate::interfaces::{CertificateInspector, CertificateStore};
use crate::types::{
    CertType, CertificateHandle, CertificateRecord, RecordFlags, SourceKind, TrustBits,
};
use std::sync::Arc;
use tracing::debug;

/// Certificates enumerable from the platform certificate store.
///
/// Listing is asynchronous: modules are unlocked first, then the store is
/// enumerated on a spawned task and the result is published back.
pub struct PlatformSource {
    core: SourceCore,
    store: Arc<dyn CertificateStore>,
    inspector: Arc<dyn CertificateInspector>,
    hardware_backed_label: String,
}

impl PlatformSource {
    pub fn new(
        context: SourceContext,
        store: Arc<dyn CertificateStore>,
        inspector: Arc<dyn CertificateInspector>,
        hardware_backed_label: impl Into<String>,
    ) -> Self {
        Self {
            core: SourceCore::new(context),
            store,
            inspector,
            hardware_backed_label: hardware_backed_label.into(),
        }
    }

    fn build_records(
        store: &dyn CertificateStore,
        inspector: &dyn CertificateInspector,
        hardware_backed_label: &str,
        certificates: Vec<CertificateHandle>,
    ) -> Vec<CertificateRecord> {
        certificates
            .into_iter()
            .map(|handle| {
                let flags = RecordFlags {
                    read_only: store.is_read_only(&handle),
                    untrusted: store.is_untrusted(&handle),
                    web_trust_anchor: store.is_web_trust_anchor(&handle),
                    hardware_backed: store.is_hardware_backed(&handle),
                };
                let cert_type = inspector.cert_type(&handle);
                let mut name = inspector.name_or_nickname(&handle);
                if flags.hardware_backed {
                    name = format!("{} ({})", name, hardware_backed_label);
                }
                CertificateRecord::new(handle, cert_type, name, SourceKind::Platform, flags)
            })
            .collect()
    }
}

impl Source for PlatformSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Platform
    }

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SourceCore {
        &mut self.core
    }

    fn refresh(&mut self) {
        let generation = self.core.begin_refresh();
        self.core.set_holding_back(true);
        debug!(source = %self.core.id(), generation, "Platform refresh started");

        let store = Arc::clone(&self.store);
        let inspector = Arc::clone(&self.inspector);
        let label = self.hardware_backed_label.clone();
        let context = self.core.context().clone();

        let spawned = self.core.context().spawn(async move {
            debug!("Platform refresh waiting for module unlock");
            store.unlock_modules().await;

            debug!("Platform refresh listing certificates");
            let certificates = store.list_certificates().await;
            let records = Self::build_records(store.as_ref(), inspector.as_ref(), &label, certificates);

            debug!(count = records.len(), "Platform refresh finished");
            context.publish(generation, records);
        });
        if !spawned {
            self.core.publish_unchanged(generation);
        }
    }

    fn set_trust(&mut self, handle: &CertificateHandle, cert_type: CertType, trust: TrustBits) -> bool {
        if !self.core.has_certificate(handle) {
            debug!(source = %self.core.id(), "Trust change for a certificate this source does not hold");
            return false;
        }
        self.store.set_trust(handle, cert_type, trust)
    }

    fn delete(&mut self, handle: &CertificateHandle) -> bool {
        if !self.core.has_certificate(handle) {
            debug!(source = %self.core.id(), "Delete for a certificate this source does not hold");
            return false;
        }
        let deleted = self.store.delete_certificate_and_key(handle);
        if deleted {
            self.refresh();
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::MockCertificateStore;
    use crate::source::{SourceEvent, SourceId};
    use tokio::sync::mpsc;

    struct NameInspector;

    impl CertificateInspector for NameInspector {
        fn cert_type(&self, _: &CertificateHandle) -> CertType {
            CertType::Ca
        }

        fn name_or_nickname(&self, handle: &CertificateHandle) -> String {
            String::from_utf8_lossy(handle.der()).into_owned()
        }

        fn subject_organization(&self, _: &CertificateHandle) -> String {
            String::new()
        }

        fn subject_display_name(&self, handle: &CertificateHandle) -> String {
            self.name_or_nickname(handle)
        }
    }

    fn handle(der: &str) -> CertificateHandle {
        CertificateHandle::from_der(der.as_bytes().to_vec()).unwrap()
    }

    fn source(store: MockCertificateStore) -> (PlatformSource, mpsc::UnboundedReceiver<SourceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = SourceContext::new(SourceId::new(0), tx, None);
        let source = PlatformSource::new(context, Arc::new(store), Arc::new(NameInspector), "hardware");
        (source, rx)
    }

    fn held(source: &mut PlatformSource, der: &str) {
        let record = CertificateRecord::new(
            handle(der),
            CertType::Ca,
            der,
            SourceKind::Platform,
            RecordFlags::default(),
        );
        source.core_mut().set_records(vec![record]);
    }

    #[test]
    fn test_set_trust_ignores_certificates_held_elsewhere() {
        let mut store = MockCertificateStore::new();
        store.expect_set_trust().never();
        store.expect_delete_certificate_and_key().never();
        let (mut source, _rx) = source(store);
        held(&mut source, "ca|Acme|Mine");

        let foreign = handle("ca|Acme|Policy Root");
        assert!(!source.set_trust(&foreign, CertType::Ca, TrustBits::TRUSTED_SSL));
        assert!(!source.delete(&foreign));
    }

    #[test]
    fn test_set_trust_forwards_held_certificates() {
        let mut store = MockCertificateStore::new();
        store.expect_set_trust().times(1).returning(|_, _, _| true);
        let (mut source, _rx) = source(store);
        held(&mut source, "ca|Acme|Mine");

        assert!(source.set_trust(&handle("ca|Acme|Mine"), CertType::Ca, TrustBits::TRUSTED_SSL));
    }

    #[test]
    fn test_refresh_outside_runtime_republishes_current_set() {
        let mut store = MockCertificateStore::new();
        store.expect_list_certificates().never();
        let (mut source, mut rx) = source(store);
        held(&mut source, "ca|Acme|Mine");
        let _ = rx.try_recv();

        source.refresh();
        let current = source.core().generation();

        assert!(matches!(
            rx.try_recv(),
            Ok(SourceEvent::Published { generation, records, .. })
                if generation == current && records.len() == 1
        ));
    }
}
