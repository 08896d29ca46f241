/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use smtp_proto::{Response, Severity};

use crate::queue::{Error, ErrorDetails, HostResponse, RecipientStatus, Status};

pub mod dane;
pub mod delivery;
pub mod lookup;
pub mod mta_sts;
pub mod session;

impl RecipientStatus {
    pub fn from_smtp_error(hostname: &str, err: mail_send::Error) -> Self {
        match err {
            mail_send::Error::Io(_)
            | mail_send::Error::Tls(_)
            | mail_send::Error::Base64(_)
            | mail_send::Error::UnparseableReply
            | mail_send::Error::AuthenticationFailed(_)
            | mail_send::Error::MissingCredentials
            | mail_send::Error::MissingMailFrom
            | mail_send::Error::MissingRcptTo
            | mail_send::Error::Timeout => Status::TemporaryFailure(Error::ConnectionError(
                ErrorDetails {
                    entity: hostname.to_string(),
                    details: err.to_string(),
                },
            )),

            mail_send::Error::UnexpectedReply(response) => {
                let response = HostResponse {
                    hostname: hostname.to_string(),
                    response,
                };
                if response.response.severity() == Severity::PermanentNegativeCompletion {
                    Status::PermanentFailure(Error::UnexpectedResponse(response))
                } else {
                    Status::TemporaryFailure(Error::UnexpectedResponse(response))
                }
            }

            mail_send::Error::Auth(_)
            | mail_send::Error::UnsupportedAuthMechanism
            | mail_send::Error::InvalidTLSName
            | mail_send::Error::MissingStartTls => {
                Status::PermanentFailure(Error::ConnectionError(ErrorDetails {
                    entity: hostname.to_string(),
                    details: err.to_string(),
                }))
            }
        }
    }

    pub fn from_starttls_error(hostname: &str, response: Option<Response<String>>) -> Self {
        match response {
            Some(response) => {
                let response = HostResponse {
                    hostname: hostname.to_string(),
                    response,
                };
                if response.response.severity() == Severity::PermanentNegativeCompletion {
                    Status::PermanentFailure(Error::UnexpectedResponse(response))
                } else {
                    Status::TemporaryFailure(Error::UnexpectedResponse(response))
                }
            }
            None => Status::PermanentFailure(Error::TlsError(ErrorDetails {
                entity: hostname.to_string(),
                details: "STARTTLS not advertised by host".to_string(),
            })),
        }
    }

    pub fn from_tls_error(hostname: &str, err: std::io::Error) -> Self {
        Status::TemporaryFailure(Error::TlsError(ErrorDetails {
            entity: hostname.to_string(),
            details: format!("Handshake failed: {err}"),
        }))
    }

    pub fn timeout(hostname: &str, stage: &str) -> Self {
        Status::TemporaryFailure(Error::ConnectionError(ErrorDetails {
            entity: hostname.to_string(),
            details: format!("Timeout while {stage}"),
        }))
    }

    pub fn from_dns_error(entity: &str, err: &common::dns::DnsError) -> Self {
        match err {
            common::dns::DnsError::NotFound => {
                Status::PermanentFailure(Error::DnsError(format!(
                    "Domain {entity:?} not found"
                )))
            }
            common::dns::DnsError::Temporary(details) => {
                Status::TemporaryFailure(Error::DnsError(details.clone()))
            }
        }
    }
}
