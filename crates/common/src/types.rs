// Shared types for the reverse-tunnel subsystem.

use serde::{Deserialize, Serialize};

/// The two independent certificate-authority trust sets a presented
/// certificate can be checked against (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertRole {
    Host,
    User,
}

impl std::fmt::Display for CertRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertRole::Host => write!(f, "host"),
            CertRole::User => write!(f, "user"),
        }
    }
}

/// A site's liveness verdict (spec.md §4.5 `GetStatus`). The two literal
/// strings `"online"`/`"offline"` are part of the external contract (§6),
/// so this type serializes to exactly those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Online,
    Offline,
}

impl std::fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SiteStatus::Online => write!(f, "online"),
            SiteStatus::Offline => write!(f, "offline"),
        }
    }
}

/// One authority-domain CA record, as produced by the trust store
/// (spec.md §3, §6). `checkers` are the CA's ordered signer public keys,
/// stored as raw SSH wire-format key blobs.
#[derive(Debug, Clone)]
pub struct CertAuthority {
    pub domain: String,
    pub role: CertRole,
    pub checkers: Vec<Vec<u8>>,
}
