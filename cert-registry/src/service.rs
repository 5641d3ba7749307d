use crate::error::{RegistryError, Result};
use crate::registry::Registry;
use crate::types::{
    CapabilityFlags, CertType, CertificateHandle, CertificateRecord, ImportOutcome, ImportStatus,
    OrganizationGroupingMap, Pkcs12Bundle, TrustBits,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

enum Command {
    Refresh {
        reply: oneshot::Sender<()>,
    },
    SetTrust {
        handle: CertificateHandle,
        cert_type: CertType,
        trust: TrustBits,
        reply: oneshot::Sender<bool>,
    },
    Delete {
        handle: CertificateHandle,
        reply: oneshot::Sender<bool>,
    },
    OrganizationGrouping {
        filter: CertType,
        reply: oneshot::Sender<OrganizationGroupingMap>,
    },
    AllRecords {
        reply: oneshot::Sender<Vec<CertificateRecord>>,
    },
    ImportPkcs12 {
        bundle: Pkcs12Bundle,
        reply: oneshot::Sender<ImportStatus>,
    },
    ImportUserCertificate {
        data: Vec<u8>,
        reply: oneshot::Sender<ImportStatus>,
    },
    ImportCaChain {
        certificates: Vec<CertificateHandle>,
        trust: TrustBits,
        reply: oneshot::Sender<ImportOutcome>,
    },
    ImportServerChain {
        certificates: Vec<CertificateHandle>,
        trust: TrustBits,
        reply: oneshot::Sender<ImportOutcome>,
    },
    Capabilities {
        reply: oneshot::Sender<CapabilityFlags>,
    },
    Settled {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front end to a [`Registry`] running on its own owner task.
///
/// The task multiplexes these commands with the events the sources send
/// back, so every registry call happens on that single task. The task stops
/// once every handle is dropped.
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::Sender<Command>,
}

impl RegistryHandle {
    /// Spawn the owner task on the runtime the registry was built on, or
    /// else the current one.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Internal`] when there is neither.
    pub fn spawn(registry: Registry, buffer: usize) -> Result<Self> {
        let runtime = match registry.runtime() {
            Some(runtime) => runtime.clone(),
            None => Handle::try_current()
                .map_err(|e| RegistryError::Internal(format!("no runtime for the registry owner task: {}", e)))?,
        };
        Ok(Self::spawn_on(registry, buffer, &runtime))
    }

    pub fn spawn_on(registry: Registry, buffer: usize, runtime: &Handle) -> Self {
        let (commands, receiver) = mpsc::channel(buffer.max(1));
        runtime.spawn(run(registry, receiver));
        Self { commands }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).await?;
        Ok(response.await?)
    }

    // ========================================================================
    // CATALOG OPERATIONS
    // ========================================================================

    /// Start a refresh. Resolves once every source has been asked, not when
    /// the catalog is complete; see [`RegistryHandle::wait_until_settled`].
    pub async fn refresh(&self) -> Result<()> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    pub async fn set_trust(
        &self,
        handle: CertificateHandle,
        cert_type: CertType,
        trust: TrustBits,
    ) -> Result<bool> {
        self.request(|reply| Command::SetTrust {
            handle,
            cert_type,
            trust,
            reply,
        })
        .await
    }

    pub async fn delete(&self, handle: CertificateHandle) -> Result<bool> {
        self.request(|reply| Command::Delete { handle, reply }).await
    }

    pub async fn organization_grouping(&self, filter: CertType) -> Result<OrganizationGroupingMap> {
        self.request(|reply| Command::OrganizationGrouping { filter, reply })
            .await
    }

    pub async fn all_records(&self) -> Result<Vec<CertificateRecord>> {
        self.request(|reply| Command::AllRecords { reply }).await
    }

    pub async fn import_pkcs12(&self, bundle: Pkcs12Bundle) -> Result<ImportStatus> {
        self.request(|reply| Command::ImportPkcs12 { bundle, reply }).await
    }

    pub async fn import_user_certificate(&self, data: Vec<u8>) -> Result<ImportStatus> {
        self.request(|reply| Command::ImportUserCertificate { data, reply })
            .await
    }

    pub async fn import_ca_chain(
        &self,
        certificates: Vec<CertificateHandle>,
        trust: TrustBits,
    ) -> Result<ImportOutcome> {
        self.request(|reply| Command::ImportCaChain {
            certificates,
            trust,
            reply,
        })
        .await
    }

    pub async fn import_server_chain(
        &self,
        certificates: Vec<CertificateHandle>,
        trust: TrustBits,
    ) -> Result<ImportOutcome> {
        self.request(|reply| Command::ImportServerChain {
            certificates,
            trust,
            reply,
        })
        .await
    }

    pub async fn capabilities(&self) -> Result<CapabilityFlags> {
        self.request(|reply| Command::Capabilities { reply }).await
    }

    /// Resolves once no refresh is in flight
    pub async fn wait_until_settled(&self) -> Result<()> {
        self.request(|reply| Command::Settled { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

// ============================================================================
// OWNER TASK
// ============================================================================

async fn run(mut registry: Registry, mut commands: mpsc::Receiver<Command>) {
    info!(sources = registry.source_count(), "Registry owner task started");
    let mut settle_waiters: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Settled { reply }) => settle_waiters.push(reply),
                Some(command) => dispatch(&mut registry, command),
                None => break,
            },
            Some(event) = registry.next_event() => registry.handle_event(event),
        }

        if settle_waiters.is_empty() {
            continue;
        }
        // Updates already queued (a policy push, say) notify before waiters resume
        registry.process_pending_events();
        if registry.is_settled() {
            for waiter in settle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    debug!("Registry owner task stopped");
}

// A caller that gave up on its reply is not an error for the registry.
fn dispatch(registry: &mut Registry, command: Command) {
    match command {
        Command::Refresh { reply } => {
            registry.refresh();
            let _ = reply.send(());
        }
        Command::SetTrust {
            handle,
            cert_type,
            trust,
            reply,
        } => {
            let _ = reply.send(registry.set_trust(&handle, cert_type, trust));
        }
        Command::Delete { handle, reply } => {
            let _ = reply.send(registry.delete(&handle));
        }
        Command::OrganizationGrouping { filter, reply } => {
            let _ = reply.send(registry.build_organization_grouping(filter));
        }
        Command::AllRecords { reply } => {
            let _ = reply.send(registry.all_records());
        }
        Command::ImportPkcs12 { bundle, reply } => {
            let _ = reply.send(registry.import_from_store(&bundle));
        }
        Command::ImportUserCertificate { data, reply } => {
            let _ = reply.send(registry.import_user_certificate(&data));
        }
        Command::ImportCaChain {
            certificates,
            trust,
            reply,
        } => {
            let _ = reply.send(registry.import_ca_chain(&certificates, trust));
        }
        Command::ImportServerChain {
            certificates,
            trust,
            reply,
        } => {
            let _ = reply.send(registry.import_server_chain(&certificates, trust));
        }
        Command::Capabilities { reply } => {
            let _ = reply.send(registry.capabilities());
        }
        // Queued by the loop itself
        Command::Settled { reply } => {
            let _ = reply.send(());
        }
    }
}
