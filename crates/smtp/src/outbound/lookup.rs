/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{fmt::Write, future::Future, net::IpAddr, time::Duration};

use common::{
    config::smtp::resolver::{Mode, SecurityPolicy},
    dns::DnsError,
    Server,
};
use sha2::{Digest, Sha256};

use super::{
    dane::dnssec::TlsaLookup,
    mta_sts::lookup::MtaStsLookup,
};

/// One MX host of a route with its resolved addresses, in canonical
/// (priority, hostname) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxServer {
    pub hostname: String,
    pub priority: u16,
    pub ips: Vec<IpAddr>,
}

/// Canonical MX set shared by one or more recipient domains. The identity
/// is the SHA-256 of `prio:name|prio:name|…` over the ordered set; domains
/// are plain strings, the authoritative direction is route to server to
/// domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRoute {
    pub hash: String,
    pub servers: Vec<MxServer>,
    pub domains: Vec<String>,
}

impl MxRoute {
    pub fn canonical(servers: &[(u16, String)]) -> String {
        let mut canonical = String::new();
        for (priority, hostname) in servers {
            if !canonical.is_empty() {
                canonical.push('|');
            }
            let _ = write!(canonical, "{priority}:{hostname}");
        }
        canonical
    }

    pub fn hash_of(canonical: &str) -> String {
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hash = String::with_capacity(64);
        for byte in digest {
            let _ = write!(hash, "{byte:02x}");
        }
        hash
    }

    pub fn ips(&self) -> Vec<IpAddr> {
        self.servers
            .iter()
            .flat_map(|server| server.ips.iter().copied())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct RouteResolution {
    pub routes: Vec<MxRoute>,
    /// Domains whose MX set could not be resolved, with the failure kind.
    pub failed: Vec<(String, DnsError)>,
}

pub trait MxLookup: Sync + Send {
    /// Ordered `(priority, hostname)` pairs for a domain, canonically
    /// sorted by priority then hostname. A domain without MX records is
    /// treated as publishing an implicit zero-preference MX pointing at
    /// itself.
    fn canonical_mx_set(
        &self,
        domain: &str,
    ) -> impl Future<Output = Result<Vec<(u16, String)>, DnsError>> + Send;

    /// Security policy per MX host for a domain. Any TLSA-bearing MX makes
    /// DANE dominate the whole domain and MTA-STS is not consulted at all;
    /// otherwise a valid STS policy filters the MX set; otherwise delivery
    /// is opportunistic.
    fn resolve_policies(
        &self,
        domain: &str,
    ) -> impl Future<Output = Result<Vec<SecurityPolicy>, DnsError>> + Send;

    /// Groups domains by the SHA-256 identity of their canonical MX set.
    /// Routes come out in insertion order of the first domain seen per
    /// hash; domains with no resolvable MX set are reported in `failed`.
    fn resolve_routes(&self, domains: &[String]) -> impl Future<Output = RouteResolution> + Send;
}

impl MxLookup for Server {
    async fn canonical_mx_set(&self, domain: &str) -> Result<Vec<(u16, String)>, DnsError> {
        let mx_list = self.mx_lookup(domain).await?;

        let mut servers: Vec<(u16, String)> = Vec::new();
        for mx in mx_list.iter() {
            for exchange in &mx.exchanges {
                servers.push((mx.preference, exchange.to_lowercase()));
            }
        }
        if servers.is_empty() {
            servers.push((0, domain.to_lowercase()));
        }
        servers.sort();
        servers.dedup();
        Ok(servers)
    }

    async fn resolve_policies(
        &self,
        domain: &str,
    ) -> Result<Vec<SecurityPolicy>, DnsError> {
        let servers = match self.canonical_mx_set(domain).await {
            Ok(servers) => servers,
            Err(DnsError::NotFound) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut tlsa_sets = Vec::with_capacity(servers.len());
        for (_, hostname) in &servers {
            let tlsa = match self.tlsa_lookup(format!("_25._tcp.{hostname}.")).await {
                Ok(tlsa) => tlsa.filter(|tlsa| tlsa.has_entries()),
                Err(err) => {
                    tracing::debug!(domain, mx = hostname.as_str(), %err, "TLSA lookup failed");
                    None
                }
            };
            tlsa_sets.push(tlsa);
        }

        if tlsa_sets.iter().any(|tlsa| tlsa.is_some()) {
            return Ok(servers
                .into_iter()
                .zip(tlsa_sets)
                .map(|((_, hostname), tlsa)| match tlsa {
                    Some(tlsa) => SecurityPolicy::Dane { mx: hostname, tlsa },
                    None => SecurityPolicy::Opportunistic { mx: hostname },
                })
                .collect());
        }

        let sts_policy = match self
            .lookup_mta_sts_policy(
                domain,
                Duration::from_secs(self.core.queue.mta_sts_timeout_secs),
            )
            .await
        {
            Ok(policy) if policy.mode != Mode::None => Some(policy),
            Ok(_) => None,
            Err(err) => {
                if !err.is_absent() {
                    tracing::debug!(domain, %err, "MTA-STS policy unavailable");
                }
                None
            }
        };

        if let Some(policy) = sts_policy {
            let mut policies = Vec::with_capacity(servers.len());
            for (_, hostname) in &servers {
                if policy.verify(hostname) {
                    policies.push(SecurityPolicy::MtaSts {
                        mx: hostname.clone(),
                        mode: policy.mode,
                    });
                } else {
                    tracing::warn!(
                        domain,
                        mx = hostname.as_str(),
                        "MX not covered by MTA-STS policy, skipping host"
                    );
                }
            }
            if !policies.is_empty() {
                return Ok(policies);
            }
            tracing::warn!(domain, "no MX matches the MTA-STS policy");
        }

        Ok(servers
            .into_iter()
            .map(|(_, hostname)| SecurityPolicy::Opportunistic { mx: hostname })
            .collect())
    }

    async fn resolve_routes(&self, domains: &[String]) -> RouteResolution {
        let mut resolution = RouteResolution::default();

        'next_domain: for domain in domains {
            let servers = match self.canonical_mx_set(domain).await {
                Ok(servers) => servers,
                Err(err) => {
                    resolution.failed.push((domain.clone(), err));
                    continue;
                }
            };
            let hash = MxRoute::hash_of(&MxRoute::canonical(&servers));

            for route in resolution.routes.iter_mut() {
                if route.hash == hash {
                    route.domains.push(domain.clone());
                    continue 'next_domain;
                }
            }

            let mut mx_servers = Vec::with_capacity(servers.len());
            for (priority, hostname) in servers {
                let ips = match self.ip_lookup(format!("{hostname}.")).await {
                    Ok(ips) => ips.as_ref().clone(),
                    Err(err) => {
                        tracing::debug!(domain, mx = hostname.as_str(), %err, "A lookup failed");
                        Vec::new()
                    }
                };
                mx_servers.push(MxServer {
                    hostname,
                    priority,
                    ips,
                });
            }

            resolution.routes.push(MxRoute {
                hash,
                servers: mx_servers,
                domains: vec![domain.clone()],
            });
        }

        resolution
    }
}
