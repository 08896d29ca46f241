/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// TLSA record set published for one MX host under `_25._tcp.<mx>`.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tlsa {
    pub entries: Vec<TlsaEntry>,
    pub has_end_entities: bool,
    pub has_intermediates: bool,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsaEntry {
    pub usage: CertUsage,
    pub selector: TlsaSelector,
    pub matching: TlsaMatching,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertUsage {
    /// Usage 0: CA constraint, PKIX validation required.
    PkixTa,
    /// Usage 1: end-entity constraint, PKIX validation required.
    PkixEe,
    /// Usage 2: trust anchor assertion.
    DaneTa,
    /// Usage 3: end-entity match, PKIX short-circuited.
    DaneEe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsaSelector {
    FullCert,
    Spki,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsaMatching {
    Raw,
    Sha256,
    Sha512,
}

impl CertUsage {
    pub fn is_end_entity(&self) -> bool {
        matches!(self, CertUsage::PkixEe | CertUsage::DaneEe)
    }

    pub fn requires_pkix(&self) -> bool {
        matches!(self, CertUsage::PkixTa | CertUsage::PkixEe)
    }
}

impl Tlsa {
    pub fn has_entries(&self) -> bool {
        !self.entries.is_empty()
    }
}

/// MTA-STS policy fetched over HTTPS after TXT discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub mode: Mode,
    pub mx: Vec<MxPattern>,
    pub max_age: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Enforce,
    Testing,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MxPattern {
    Equals(String),
    StartsWith(String),
}

impl Policy {
    pub fn enforce(&self) -> bool {
        self.mode == Mode::Enforce
    }

    /// Case-insensitive hostname match with left `*.` wildcard covering a
    /// single label.
    pub fn verify(&self, mx_host: &str) -> bool {
        let mx_host = mx_host.to_lowercase();
        for pattern in &self.mx {
            match pattern {
                MxPattern::Equals(host) => {
                    if host == &mx_host {
                        return true;
                    }
                }
                MxPattern::StartsWith(domain) => {
                    if let Some((label, suffix)) = mx_host.split_once('.') {
                        if !label.is_empty() && suffix == domain {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }
}

/// Transport security selected for one MX host, DANE taking precedence over
/// MTA-STS, with opportunistic TLS as the fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SecurityPolicy {
    Dane { mx: String, tlsa: Arc<Tlsa> },
    MtaSts { mx: String, mode: Mode },
    Opportunistic { mx: String },
}

impl SecurityPolicy {
    pub fn mx(&self) -> &str {
        match self {
            SecurityPolicy::Dane { mx, .. }
            | SecurityPolicy::MtaSts { mx, .. }
            | SecurityPolicy::Opportunistic { mx } => mx,
        }
    }

    pub fn tls_mandatory(&self) -> bool {
        match self {
            SecurityPolicy::Dane { .. } => true,
            SecurityPolicy::MtaSts { mode, .. } => *mode == Mode::Enforce,
            SecurityPolicy::Opportunistic { .. } => false,
        }
    }
}
