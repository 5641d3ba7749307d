//! Certificate sources.
//!
//! A source owns one slice of the catalog. It refreshes its records either
//! synchronously (publishing before `refresh` returns) or asynchronously (a
//! spawned task delivers the records back to the registry's owner context as
//! a [`SourceEvent`]). Asynchronous sources hold back registry notifications
//! until their new record set is published.

pub mod extension;
pub mod platform;
pub mod policy;

pub use extension::ExtensionSource;
pub use platform::PlatformSource;
pub use policy::{PolicyMode, PolicyRefreshTrigger, PolicySource, PolicySubscription};

use crate::types::{CertType, CertificateHandle, CertificateRecord, SourceKind, TrustBits};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Log line for mutations an immutable source refuses
pub(crate) const OPERATION_NOT_PERMITTED: &str = "Operation not permitted on a certificate. Source: ";

/// Position of a source in the registry's priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(usize);

impl SourceId {
    pub fn new(index: usize) -> Self {
        SourceId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Message from a source to the registry's owner context
#[derive(Debug)]
pub enum SourceEvent {
    /// An asynchronous refresh finished with a complete record set
    Published {
        source: SourceId,
        generation: u64,
        records: Vec<CertificateRecord>,
    },
    /// The source published synchronously
    Updated { source: SourceId },
    /// Upstream data changed; the source wants to refresh itself
    RefreshRequested { source: SourceId },
}

impl SourceEvent {
    pub fn source(&self) -> SourceId {
        match self {
            SourceEvent::Published { source, .. }
            | SourceEvent::Updated { source }
            | SourceEvent::RefreshRequested { source } => *source,
        }
    }
}

/// A source's line back into the registry, plus the runtime its listing
/// tasks run on.
///
/// The runtime is captured when the registry is built, so a source can be
/// refreshed from any thread afterwards.
#[derive(Debug, Clone)]
pub struct SourceContext {
    id: SourceId,
    events: mpsc::UnboundedSender<SourceEvent>,
    runtime: Option<Handle>,
}

impl SourceContext {
    pub fn new(
        id: SourceId,
        events: mpsc::UnboundedSender<SourceEvent>,
        runtime: Option<Handle>,
    ) -> Self {
        Self { id, events, runtime }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn runtime(&self) -> Option<&Handle> {
        self.runtime.as_ref()
    }

    /// Run `task` on the captured runtime. Returns false, without running
    /// it, when the registry was built outside of one.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => {
                runtime.spawn(task);
                true
            }
            None => false,
        }
    }

    fn send(&self, event: SourceEvent) {
        // The registry is gone; nobody is left to observe the result.
        if self.events.send(event).is_err() {
            trace!(source = %self.id, "Registry dropped, discarding source event");
        }
    }

    pub(crate) fn notify_updated(&self) {
        self.send(SourceEvent::Updated { source: self.id });
    }

    /// Hand an asynchronously built record set to the owner context
    pub fn publish(&self, generation: u64, records: Vec<CertificateRecord>) {
        self.send(SourceEvent::Published {
            source: self.id,
            generation,
            records,
        });
    }

    pub fn request_refresh(&self) {
        self.send(SourceEvent::RefreshRequested { source: self.id });
    }
}

// ============================================================================
// SHARED SOURCE STATE
// ============================================================================

/// State every source variant shares: the published record set, the
/// hold-back flag and the refresh generation.
///
/// The record set is swapped wholesale, never edited in place; a reader
/// holding a [`SourceCore::snapshot`] keeps seeing the set it took.
pub struct SourceCore {
    records: Arc<[CertificateRecord]>,
    holding_back: bool,
    generation: u64,
    context: SourceContext,
}

impl SourceCore {
    pub fn new(context: SourceContext) -> Self {
        Self {
            records: Arc::from(Vec::new()),
            holding_back: false,
            generation: 0,
            context,
        }
    }

    pub fn context(&self) -> &SourceContext {
        &self.context
    }

    pub fn id(&self) -> SourceId {
        self.context.id
    }

    pub fn records(&self) -> &[CertificateRecord] {
        &self.records
    }

    pub fn snapshot(&self) -> Arc<[CertificateRecord]> {
        Arc::clone(&self.records)
    }

    pub fn has_certificate(&self, handle: &CertificateHandle) -> bool {
        self.records.iter().any(|record| record.handle() == handle)
    }

    pub fn is_holding_back(&self) -> bool {
        self.holding_back
    }

    /// Asks the registry to suppress notifications until the next publish.
    /// Only for sources that list asynchronously but quickly.
    pub fn set_holding_back(&mut self, holding_back: bool) {
        self.holding_back = holding_back;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a refresh cycle; any publication from an older cycle is stale
    pub fn begin_refresh(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    /// Synchronous publish: swap in the records, lift hold-back and tell the
    /// registry.
    pub fn set_records(&mut self, records: Vec<CertificateRecord>) {
        self.replace(records);
        self.context.notify_updated();
    }

    /// End a cycle whose listing task could not be spawned by publishing the
    /// current set again, so hold-back still lifts.
    pub(crate) fn publish_unchanged(&self, generation: u64) {
        warn!(source = %self.id(), "No runtime to list on, keeping current certificates");
        self.context.publish(generation, self.records.to_vec());
    }

    /// Apply an asynchronous publication. Returns false and leaves the
    /// current set untouched when a newer refresh has started since.
    pub(crate) fn accept_publication(
        &mut self,
        generation: u64,
        records: Vec<CertificateRecord>,
    ) -> bool {
        if generation != self.generation {
            debug!(
                source = %self.id(),
                stale = generation,
                current = self.generation,
                "Dropping superseded refresh result"
            );
            return false;
        }
        self.replace(records);
        true
    }

    fn replace(&mut self, records: Vec<CertificateRecord>) {
        self.records = Arc::from(records);
        self.holding_back = false;
    }
}

// ============================================================================
// SOURCE CONTRACT
// ============================================================================

/// A provider of part of the catalog.
///
/// All methods run on the registry's owner context.
pub trait Source: Send {
    fn kind(&self) -> SourceKind;

    fn core(&self) -> &SourceCore;

    fn core_mut(&mut self) -> &mut SourceCore;

    /// Replace the record set, now or later. Every cycle ends in exactly one
    /// publication; asynchronous variants hold back until it arrives.
    fn refresh(&mut self);

    /// Change trust of a certificate this source owns
    fn set_trust(&mut self, handle: &CertificateHandle, cert_type: CertType, trust: TrustBits) -> bool;

    /// Remove a certificate this source owns; on success the source refreshes
    fn delete(&mut self, handle: &CertificateHandle) -> bool;

    fn has_certificate(&self, handle: &CertificateHandle) -> bool {
        self.core().has_certificate(handle)
    }

    fn records(&self) -> &[CertificateRecord] {
        self.core().records()
    }

    fn is_holding_back(&self) -> bool {
        self.core().is_holding_back()
    }
}
