/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{
    config::smtp::resolver::{CertUsage, Tlsa, TlsaEntry, TlsaMatching, TlsaSelector},
    dns::DnsError,
    Server,
};
use mail_auth::{
    common::resolver::IntoFqdn,
    hickory_resolver::{
        error::ResolveErrorKind,
        proto::{
            error::ProtoErrorKind,
            rr::rdata::tlsa::{CertUsage as RrCertUsage, Matching, Selector},
        },
        Name,
    },
};
use std::{future::Future, sync::Arc};

pub trait TlsaLookup: Sync + Send {
    fn tlsa_lookup<'x>(
        &self,
        key: impl IntoFqdn<'x> + Sync + Send,
    ) -> impl Future<Output = Result<Option<Arc<Tlsa>>, DnsError>> + Send;
}

impl TlsaLookup for Server {
    /// TLSA set for `_25._tcp.<mx>`. `Ok(None)` means the zone is unsigned
    /// or publishes no usable records; the host is then not DANE-enabled
    /// but the policy is not downgraded to an error.
    async fn tlsa_lookup<'x>(
        &self,
        key: impl IntoFqdn<'x> + Sync + Send,
    ) -> Result<Option<Arc<Tlsa>>, DnsError> {
        let key = key.into_fqdn();
        if let Some(value) = self.inner.cache.dns_tlsa.get(key.as_ref()) {
            return Ok(Some(value));
        }

        #[cfg(any(test, feature = "test_mode"))]
        if true {
            return Ok(None);
        }

        let mut entries = Vec::new();
        let tlsa_lookup = match self
            .core
            .resolvers
            .dnssec
            .resolver
            .tlsa_lookup(
                Name::from_str_relaxed(key.as_ref())
                    .map_err(|err| DnsError::Temporary(err.to_string()))?,
            )
            .await
        {
            Ok(tlsa_lookup) => tlsa_lookup,
            Err(err) => {
                return match &err.kind() {
                    ResolveErrorKind::Proto(proto_err)
                        if matches!(proto_err.kind(), ProtoErrorKind::RrsigsNotPresent { .. }) =>
                    {
                        Ok(None)
                    }
                    _ => match DnsError::from(err) {
                        DnsError::NotFound => Ok(None),
                        err => Err(err),
                    },
                };
            }
        };

        let mut has_end_entities = false;
        let mut has_intermediates = false;

        for tlsa in tlsa_lookup.iter() {
            // Records carrying unknown enum values are dropped without
            // downgrading the rest of the set.
            let usage = match tlsa.cert_usage() {
                RrCertUsage::CA => CertUsage::PkixTa,
                RrCertUsage::Service => CertUsage::PkixEe,
                RrCertUsage::TrustAnchor => CertUsage::DaneTa,
                RrCertUsage::DomainIssued => CertUsage::DaneEe,
                _ => continue,
            };
            let matching = match tlsa.matching() {
                Matching::Raw => TlsaMatching::Raw,
                Matching::Sha256 => TlsaMatching::Sha256,
                Matching::Sha512 => TlsaMatching::Sha512,
                _ => continue,
            };
            let selector = match tlsa.selector() {
                Selector::Full => TlsaSelector::FullCert,
                Selector::Spki => TlsaSelector::Spki,
                _ => continue,
            };
            if usage.is_end_entity() {
                has_end_entities = true;
            } else {
                has_intermediates = true;
            }
            entries.push(TlsaEntry {
                usage,
                selector,
                matching,
                data: tlsa.cert_data().to_vec(),
            });
        }

        if entries.is_empty() {
            return Ok(None);
        }

        let tlsa = Arc::new(Tlsa {
            entries,
            has_end_entities,
            has_intermediates,
        });

        self.inner.cache.dns_tlsa.insert_with_expiry(
            key.into_owned(),
            tlsa.clone(),
            tlsa_lookup.valid_until(),
        );

        Ok(Some(tlsa))
    }
}
