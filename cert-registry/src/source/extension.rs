use super::{Source, SourceContext, SourceCore, OPERATION_NOT_PERMITTED};
use crate::interfaces::{CertificateInspector, ClientCertificateIdentity, ExtensionCertificateProvider};
use crate::types::{
    CertType, CertificateHandle, CertificateRecord, RecordFlags, SourceKind, TrustBits,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Client certificates offered by extensions. These are user certificates
/// the registry can neither re-trust nor delete.
pub struct ExtensionSource {
    core: SourceCore,
    provider: Arc<dyn ExtensionCertificateProvider>,
    inspector: Arc<dyn CertificateInspector>,
    name_suffix: String,
}

impl ExtensionSource {
    pub fn new(
        context: SourceContext,
        provider: Arc<dyn ExtensionCertificateProvider>,
        inspector: Arc<dyn CertificateInspector>,
        name_suffix: impl Into<String>,
    ) -> Self {
        Self {
            core: SourceCore::new(context),
            provider,
            inspector,
            name_suffix: name_suffix.into(),
        }
    }

    fn build_records(
        inspector: &dyn CertificateInspector,
        name_suffix: &str,
        identities: Vec<ClientCertificateIdentity>,
    ) -> Vec<CertificateRecord> {
        identities
            .into_iter()
            .filter_map(|identity| {
                let Some(handle) = CertificateHandle::from_der(identity.certificate_der) else {
                    debug!(extension = %identity.extension_id, "Skipping unconvertible certificate");
                    return None;
                };
                let name = format!("{} {}", inspector.name_or_nickname(&handle), name_suffix);
                let flags = RecordFlags {
                    read_only: true,
                    ..RecordFlags::default()
                };
                Some(CertificateRecord::new(
                    handle,
                    CertType::User,
                    name,
                    SourceKind::Extension,
                    flags,
                ))
            })
            .collect()
    }
}

impl Source for ExtensionSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Extension
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

        let provider = Arc::clone(&self.provider);
        let inspector = Arc::clone(&self.inspector);
        let suffix = self.name_suffix.clone();
        let context = self.core.context().clone();

        let spawned = self.core.context().spawn(async move {
            let identities = provider.certificates().await;
            let records = Self::build_records(inspector.as_ref(), &suffix, identities);
            debug!(count = records.len(), "Extension refresh finished");
            context.publish(generation, records);
        });
        if !spawned {
            self.core.publish_unchanged(generation);
        }
    }

    fn set_trust(&mut self, _handle: &CertificateHandle, _cert_type: CertType, _trust: TrustBits) -> bool {
        warn!(source = %SourceKind::Extension, "{}{}", OPERATION_NOT_PERMITTED, SourceKind::Extension);
        false
    }

    fn delete(&mut self, _handle: &CertificateHandle) -> bool {
        warn!(source = %SourceKind::Extension, "{}{}", OPERATION_NOT_PERMITTED, SourceKind::Extension);
        false
    }
}
