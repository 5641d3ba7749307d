use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::BitOr;
use std::sync::Arc;

// ============================================================================
// CERTIFICATE HANDLE
// ============================================================================

/// Opaque, shared reference to an underlying certificate.
///
/// Cloning a handle is cheap and yields the same certificate. Two handles
/// built from the same DER bytes are the same certificate: identity is the
/// SHA-256 fingerprint of the encoding, not the allocation, so a certificate
/// surfaced by several sources deduplicates by handle equality.
#[derive(Clone)]
pub struct CertificateHandle {
    inner: Arc<CertificateData>,
}

struct CertificateData {
    der: Vec<u8>,
    fingerprint: [u8; 32],
}

impl CertificateHandle {
    /// Wrap a DER encoded certificate. Returns `None` for an empty encoding,
    /// which no backend can turn into a usable certificate.
    pub fn from_der(der: impl Into<Vec<u8>>) -> Option<Self> {
        let der = der.into();
        if der.is_empty() {
            return None;
        }

        let fingerprint: [u8; 32] = Sha256::digest(&der).into();
        Some(Self {
            inner: Arc::new(CertificateData { der, fingerprint }),
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.inner.der
    }

    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.inner.fingerprint
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.inner.fingerprint)
    }

    /// Number of live references to this exact allocation.
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl PartialEq for CertificateHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.fingerprint == other.inner.fingerprint
    }
}

impl Eq for CertificateHandle {}

impl Hash for CertificateHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.fingerprint.hash(state);
    }
}

impl PartialOrd for CertificateHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CertificateHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner.fingerprint.cmp(&other.inner.fingerprint)
    }
}

impl fmt::Debug for CertificateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.fingerprint_hex();
        f.debug_tuple("CertificateHandle")
            .field(&hex.get(..16).unwrap_or(&hex))
            .finish()
    }
}

// ============================================================================
// CLASSIFICATION & TRUST
// ============================================================================

/// Certificate classification, as determined by the certificate inspector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertType {
    Other,
    Ca,
    User,
    Email,
    Server,
}

/// Trust flags understood by the backing store.
///
/// `TrustBits::DEFAULT` means "inherit whatever the store decides".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustBits(u32);

impl TrustBits {
    pub const DEFAULT: TrustBits = TrustBits(0);
    pub const TRUSTED_SSL: TrustBits = TrustBits(1 << 0);
    pub const TRUSTED_EMAIL: TrustBits = TrustBits(1 << 1);
    pub const TRUSTED_OBJ_SIGN: TrustBits = TrustBits(1 << 2);
    pub const DISTRUSTED_SSL: TrustBits = TrustBits(1 << 3);
    pub const DISTRUSTED_EMAIL: TrustBits = TrustBits(1 << 4);
    pub const DISTRUSTED_OBJ_SIGN: TrustBits = TrustBits(1 << 5);

    pub const fn from_bits(bits: u32) -> Self {
        TrustBits(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: TrustBits) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TrustBits {
    type Output = TrustBits;

    fn bitor(self, rhs: TrustBits) -> TrustBits {
        TrustBits(self.0 | rhs.0)
    }
}

/// Which source variant produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Platform,
    Policy,
    Extension,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Platform => "Platform",
            SourceKind::Policy => "Policy",
            SourceKind::Extension => "Extension",
        };
        f.write_str(name)
    }
}

// ============================================================================
// CERTIFICATE RECORD
// ============================================================================

/// Presentation flags of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordFlags {
    pub read_only: bool,
    pub untrusted: bool,
    pub web_trust_anchor: bool,
    pub hardware_backed: bool,
}

/// One certificate plus its presentation metadata.
///
/// Immutable once built. `clone()` produces an independent record that
/// shares the underlying certificate, so a copy outlives any refresh of the
/// source it came from.
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    handle: CertificateHandle,
    cert_type: CertType,
    display_name: String,
    flags: RecordFlags,
    source: SourceKind,
}

impl CertificateRecord {
    pub fn new(
        handle: CertificateHandle,
        cert_type: CertType,
        display_name: impl Into<String>,
        source: SourceKind,
        flags: RecordFlags,
    ) -> Self {
        Self {
            handle,
            cert_type,
            display_name: display_name.into(),
            flags,
            source,
        }
    }

    pub fn handle(&self) -> &CertificateHandle {
        &self.handle
    }

    pub fn cert_type(&self) -> CertType {
        self.cert_type
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn read_only(&self) -> bool {
        self.flags.read_only
    }

    pub fn untrusted(&self) -> bool {
        self.flags.untrusted
    }

    pub fn web_trust_anchor(&self) -> bool {
        self.flags.web_trust_anchor
    }

    pub fn hardware_backed(&self) -> bool {
        self.flags.hardware_backed
    }

    pub fn flags(&self) -> RecordFlags {
        self.flags
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    /// Duplicate check: same underlying certificate, regardless of source
    pub fn same_certificate(&self, other: &CertificateRecord) -> bool {
        self.handle == other.handle
    }
}

/// Organization name -> deduplicated records of that organization
pub type OrganizationGroupingMap = BTreeMap<String, Vec<CertificateRecord>>;

// ============================================================================
// IMPORTS
// ============================================================================

/// A PKCS#12 bundle handed to the backing store
#[derive(Debug)]
pub struct Pkcs12Bundle {
    pub data: Vec<u8>,
    pub password: SecretString,
    pub extractable: bool,
}

impl Pkcs12Bundle {
    pub fn new(data: impl Into<Vec<u8>>, password: impl Into<String>, extractable: bool) -> Self {
        Self {
            data: data.into(),
            password: SecretString::new(password.into()),
            extractable,
        }
    }
}

/// Result code of single-blob imports (PKCS#12, user certificate)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Ok,
    InvalidPassword,
    InvalidData,
    NoWritableSlot,
    Failed(String),
}

impl ImportStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ImportStatus::Ok)
    }
}

/// A certificate the store refused to import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFailure {
    pub handle: CertificateHandle,
    pub reason: String,
}

impl ImportFailure {
    pub fn new(handle: CertificateHandle, reason: impl Into<String>) -> Self {
        Self {
            handle,
            reason: reason.into(),
        }
    }
}

/// Result of a chain import (CA or server certificates)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportOutcome {
    /// Overall verdict reported by the store
    pub success: bool,
    /// Certificates that were not imported
    pub not_imported: Vec<ImportFailure>,
}

impl ImportOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            not_imported: Vec::new(),
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }

    /// True when at least one of `attempted` certificates went in
    pub fn imported_any(&self, attempted: usize) -> bool {
        self.success && self.not_imported.len() != attempted
    }
}

// ============================================================================
// CAPABILITIES
// ============================================================================

/// Platform capabilities derived while constructing the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilityFlags {
    /// The store exposes a user-writable slot
    pub user_db_available: bool,
    /// A hardware token backs private keys
    pub hardware_token_available: bool,
}
