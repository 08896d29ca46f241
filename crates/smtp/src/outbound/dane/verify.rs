/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::config::smtp::resolver::{Tlsa, TlsaMatching, TlsaSelector};
use rustls_pki_types::CertificateDer;
use sha2::{Digest, Sha256, Sha512};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::queue::{Error, ErrorDetails, RecipientStatus, Status};

pub trait TlsaVerify {
    fn verify(
        &self,
        hostname: &str,
        certificates: Option<&[CertificateDer<'_>]>,
    ) -> Result<(), RecipientStatus>;
}

impl TlsaVerify for Tlsa {
    /// Validates the peer chain against the TLSA set. The first certificate
    /// is the end entity; end-entity records (usages 1 and 3) are matched
    /// against it, trust-anchor records (usages 0 and 2) against the rest
    /// of the chain. At least one record has to match.
    fn verify(
        &self,
        hostname: &str,
        certificates: Option<&[CertificateDer<'_>]>,
    ) -> Result<(), RecipientStatus> {
        let certificates = match certificates {
            Some(certificates) if !certificates.is_empty() => certificates,
            _ => {
                return Err(Status::TemporaryFailure(Error::DaneError(ErrorDetails {
                    entity: hostname.to_string(),
                    details: "No certificates were provided by the server".to_string(),
                })));
            }
        };

        let mut matched_end_entity = false;
        let mut matched_intermediate = false;

        'outer: for (pos, der_certificate) in certificates.iter().enumerate() {
            let certificate = match X509Certificate::from_der(der_certificate.as_ref()) {
                Ok((_, certificate)) => certificate,
                Err(err) => {
                    tracing::debug!(
                        mx = hostname,
                        %err,
                        "failed to parse peer certificate"
                    );
                    return Err(Status::TemporaryFailure(Error::DaneError(ErrorDetails {
                        entity: hostname.to_string(),
                        details: "Failed to parse certificates provided by the server".to_string(),
                    })));
                }
            };

            let is_end_entity = pos == 0;
            let spki = certificate.public_key().raw;
            let der = der_certificate.as_ref();

            for record in self
                .entries
                .iter()
                .filter(|record| record.usage.is_end_entity() == is_end_entity)
            {
                let selected = match record.selector {
                    TlsaSelector::FullCert => der,
                    TlsaSelector::Spki => spki,
                };
                let matches = match record.matching {
                    TlsaMatching::Raw => selected == record.data.as_slice(),
                    TlsaMatching::Sha256 => {
                        Sha256::digest(selected).as_slice() == record.data.as_slice()
                    }
                    TlsaMatching::Sha512 => {
                        Sha512::digest(selected).as_slice() == record.data.as_slice()
                    }
                };
                if matches {
                    if is_end_entity {
                        matched_end_entity = true;
                        if !self.has_intermediates {
                            break 'outer;
                        }
                    } else {
                        matched_intermediate = true;
                        if !self.has_end_entities {
                            break 'outer;
                        }
                    }
                }
            }
        }

        if (self.has_end_entities && matched_end_entity)
            || (self.has_intermediates && matched_intermediate)
        {
            tracing::debug!(mx = hostname, "DANE authentication successful");
            Ok(())
        } else {
            Err(Status::PermanentFailure(Error::DaneError(ErrorDetails {
                entity: hostname.to_string(),
                details: "No matching certificates found in TLSA records".to_string(),
            })))
        }
    }
}
