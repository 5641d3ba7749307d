use super::{Source, SourceContext, SourceCore, OPERATION_NOT_PERMITTED};
use crate::interfaces::{
    CertificateInspector, ObserverId, PolicyCertificateProvider, PolicyObserver,
};
use crate::types::{
    CertType, CertificateHandle, CertificateRecord, RecordFlags, SourceKind, TrustBits,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which policy-installed certificates a [`PolicySource`] yields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    /// Installed by policy, not trusted for the web
    WithoutWebTrust,
    /// Installed by policy and trusted for the web
    WithWebTrust,
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Scoped registration with the policy provider.
///
/// Registers on creation and unregisters when dropped, so a source never
/// outlives its subscription.
pub struct PolicySubscription {
    provider: Arc<dyn PolicyCertificateProvider>,
    id: ObserverId,
}

impl PolicySubscription {
    pub fn subscribe(
        provider: Arc<dyn PolicyCertificateProvider>,
        observer: Arc<dyn PolicyObserver>,
    ) -> Self {
        let id = provider.add_observer(observer);
        Self { provider, id }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }
}

impl Drop for PolicySubscription {
    fn drop(&mut self) {
        self.provider.remove_observer(self.id);
    }
}

/// Forwards provider change notifications to the owner context, where the
/// subscribed source refreshes itself.
pub struct PolicyRefreshTrigger {
    context: SourceContext,
}

impl PolicyRefreshTrigger {
    pub fn new(context: SourceContext) -> Self {
        Self { context }
    }
}

impl PolicyObserver for PolicyRefreshTrigger {
    fn on_policy_certificates_changed(&self) {
        debug!(source = %self.context.id(), "Policy certificates changed");
        self.context.request_refresh();
    }
}

// ============================================================================
// SOURCE
// ============================================================================

/// Certificates installed through enterprise policy. Read only: trust
/// changes and deletion are always refused.
pub struct PolicySource {
    core: SourceCore,
    provider: Arc<dyn PolicyCertificateProvider>,
    inspector: Arc<dyn CertificateInspector>,
    mode: PolicyMode,
    subscription: PolicySubscription,
}

impl PolicySource {
    pub fn new(
        context: SourceContext,
        provider: Arc<dyn PolicyCertificateProvider>,
        inspector: Arc<dyn CertificateInspector>,
        mode: PolicyMode,
    ) -> Self {
        let trigger = Arc::new(PolicyRefreshTrigger::new(context.clone()));
        let subscription = PolicySubscription::subscribe(Arc::clone(&provider), trigger);
        Self {
            core: SourceCore::new(context),
            provider,
            inspector,
            mode,
            subscription,
        }
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    pub fn subscription(&self) -> &PolicySubscription {
        &self.subscription
    }

    fn build_records(&self, certificates: Vec<Vec<u8>>, web_trusted: bool) -> Vec<CertificateRecord> {
        let mut records = Vec::with_capacity(certificates.len());
        for der in certificates {
            let Some(handle) = CertificateHandle::from_der(der) else {
                debug!("Skipping policy certificate that could not be converted");
                continue;
            };

            let cert_type = self.inspector.cert_type(&handle);
            let name = self.inspector.name_or_nickname(&handle);
            let flags = RecordFlags {
                read_only: true,
                untrusted: false,
                web_trust_anchor: web_trusted,
                hardware_backed: false,
            };
            records.push(CertificateRecord::new(
                handle,
                cert_type,
                name,
                SourceKind::Policy,
                flags,
            ));
        }
        records
    }
}

impl Source for PolicySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Policy
    }

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SourceCore {
        &mut self.core
    }

    fn refresh(&mut self) {
        self.core.begin_refresh();
        let records = match self.mode {
            PolicyMode::WithoutWebTrust => {
                let certificates = self.provider.certificates_without_web_trust();
                self.build_records(certificates, false)
            }
            PolicyMode::WithWebTrust => {
                let certificates = self.provider.web_trusted_certificates();
                self.build_records(certificates, true)
            }
        };
        debug!(source = %self.core.id(), mode = ?self.mode, count = records.len(), "Policy refresh finished");
        self.core.set_records(records);
    }

    fn set_trust(&mut self, _handle: &CertificateHandle, _cert_type: CertType, _trust: TrustBits) -> bool {
        warn!(source = %SourceKind::Policy, "{}{}", OPERATION_NOT_PERMITTED, SourceKind::Policy);
        false
    }

    fn delete(&mut self, _handle: &CertificateHandle) -> bool {
        warn!(source = %SourceKind::Policy, "{}{}", OPERATION_NOT_PERMITTED, SourceKind::Policy);
        false
    }
}
