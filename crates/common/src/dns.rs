/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    fmt,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use mail_auth::{
    common::resolver::IntoFqdn,
    hickory_resolver::{
        config::{ResolverConfig, ResolverOpts},
        error::{ResolveError, ResolveErrorKind},
        system_conf::read_system_conf,
        Name, TokioAsyncResolver,
    },
    MX,
};

use crate::Server;

pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct Resolvers {
    pub dns: TokioAsyncResolver,
    pub dnssec: DnssecResolver,
    pub negative_ttl: Duration,
}

/// Resolver with DNSSEC validation enabled, used for TLSA lookups only.
#[derive(Clone)]
pub struct DnssecResolver {
    pub resolver: TokioAsyncResolver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// SERVFAIL, timeout, transport error; the caller may retry later.
    Temporary(String),
    /// NXDOMAIN or an empty answer.
    NotFound,
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsError::Temporary(err) => write!(f, "DNS lookup failed: {err}"),
            DnsError::NotFound => f.write_str("DNS record not found"),
        }
    }
}

impl From<ResolveError> for DnsError {
    fn from(err: ResolveError) -> Self {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound,
            _ => DnsError::Temporary(err.to_string()),
        }
    }
}

impl Resolvers {
    pub fn new(
        config: ResolverConfig,
        options: ResolverOpts,
        negative_ttl: Duration,
    ) -> Self {
        let mut dnssec_options = options.clone();
        dnssec_options.validate = true;

        Resolvers {
            dns: TokioAsyncResolver::tokio(config.clone(), options),
            dnssec: DnssecResolver {
                resolver: TokioAsyncResolver::tokio(config, dnssec_options),
            },
            negative_ttl,
        }
    }

    pub fn new_system() -> Self {
        let (config, options) =
            read_system_conf().unwrap_or_else(|_| (ResolverConfig::default(), ResolverOpts::default()));
        Self::new(config, options, DEFAULT_NEGATIVE_TTL)
    }
}

impl Default for Resolvers {
    fn default() -> Self {
        Self::new_system()
    }
}

impl Server {
    /// MX set for a domain, sorted by preference. `Ok` with an empty vector
    /// means the domain exists but publishes no MX records.
    pub async fn mx_lookup<'x>(
        &self,
        domain: impl IntoFqdn<'x>,
    ) -> Result<Arc<Vec<MX>>, DnsError> {
        let key = domain.into_fqdn();
        match self.inner.cache.dns_mx.get(key.as_ref()) {
            Some(Some(value)) => return Ok(value),
            Some(None) => return Err(DnsError::NotFound),
            None => (),
        }

        let resolvers = &self.core.resolvers;
        let name = Name::from_str_relaxed(key.as_ref())
            .map_err(|err| DnsError::Temporary(err.to_string()))?;
        let lookup = match resolvers.dns.mx_lookup(name).await {
            Ok(lookup) => lookup,
            Err(err) => {
                let err = DnsError::from(err);
                if err == DnsError::NotFound {
                    self.inner.cache.dns_mx.insert(
                        key.into_owned(),
                        None,
                        resolvers.negative_ttl,
                    );
                }
                return Err(err);
            }
        };

        let mut records: Vec<(u16, String)> = lookup
            .iter()
            .map(|mx| {
                (
                    mx.preference(),
                    mx.exchange()
                        .to_lowercase()
                        .to_string()
                        .trim_end_matches('.')
                        .to_string(),
                )
            })
            .collect();
        records.sort();

        let mut result: Vec<MX> = Vec::new();
        for (preference, exchange) in records {
            match result.last_mut() {
                Some(mx) if mx.preference == preference => mx.exchanges.push(exchange),
                _ => result.push(MX {
                    preference,
                    exchanges: vec![exchange],
                }),
            }
        }

        let result = Arc::new(result);
        self.inner.cache.dns_mx.insert_with_expiry(
            key.into_owned(),
            Some(result.clone()),
            lookup.valid_until(),
        );
        Ok(result)
    }

    /// A/AAAA addresses for a hostname, IPv4 first.
    pub async fn ip_lookup<'x>(
        &self,
        host: impl IntoFqdn<'x>,
    ) -> Result<Arc<Vec<IpAddr>>, DnsError> {
        let key = host.into_fqdn();
        match self.inner.cache.dns_ip.get(key.as_ref()) {
            Some(Some(value)) => return Ok(value),
            Some(None) => return Err(DnsError::NotFound),
            None => (),
        }

        let resolvers = &self.core.resolvers;
        let name = Name::from_str_relaxed(key.as_ref())
            .map_err(|err| DnsError::Temporary(err.to_string()))?;

        let mut ips = Vec::new();
        let mut valid_until = Instant::now() + resolvers.negative_ttl;
        let mut last_err = None;

        match resolvers.dns.ipv4_lookup(name.clone()).await {
            Ok(lookup) => {
                valid_until = lookup.valid_until();
                ips.extend(lookup.iter().map(|a| IpAddr::V4(a.0)));
            }
            Err(err) => last_err = Some(DnsError::from(err)),
        }
        match resolvers.dns.ipv6_lookup(name).await {
            Ok(lookup) => {
                if ips.is_empty() {
                    valid_until = lookup.valid_until();
                }
                ips.extend(lookup.iter().map(|aaaa| IpAddr::V6(aaaa.0)));
            }
            Err(err) => {
                if last_err.is_none() {
                    last_err = Some(DnsError::from(err));
                }
            }
        }

        if ips.is_empty() {
            let err = last_err.unwrap_or(DnsError::NotFound);
            if err == DnsError::NotFound {
                self.inner
                    .cache
                    .dns_ip
                    .insert(key.into_owned(), None, resolvers.negative_ttl);
            }
            return Err(err);
        }

        let ips = Arc::new(ips);
        self.inner
            .cache
            .dns_ip
            .insert_with_expiry(key.into_owned(), Some(ips.clone()), valid_until);
        Ok(ips)
    }

    /// Raw TXT strings published at a name, character-strings concatenated
    /// per record.
    pub async fn txt_lookup<'x>(
        &self,
        name: impl IntoFqdn<'x>,
    ) -> Result<Arc<Vec<String>>, DnsError> {
        let key = name.into_fqdn();
        match self.inner.cache.dns_txt.get(key.as_ref()) {
            Some(Some(value)) => return Ok(value),
            Some(None) => return Err(DnsError::NotFound),
            None => (),
        }

        let resolvers = &self.core.resolvers;
        let name = Name::from_str_relaxed(key.as_ref())
            .map_err(|err| DnsError::Temporary(err.to_string()))?;
        let lookup = match resolvers.dns.txt_lookup(name).await {
            Ok(lookup) => lookup,
            Err(err) => {
                let err = DnsError::from(err);
                if err == DnsError::NotFound {
                    self.inner.cache.dns_txt.insert(
                        key.into_owned(),
                        None,
                        resolvers.negative_ttl,
                    );
                }
                return Err(err);
            }
        };

        let records: Vec<String> = lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part))
                    .collect::<String>()
            })
            .collect();

        let records = Arc::new(records);
        self.inner.cache.dns_txt.insert_with_expiry(
            key.into_owned(),
            Some(records.clone()),
            lookup.valid_until(),
        );
        Ok(records)
    }

    /// Reverse DNS for a peer address; lookup failures are reported as an
    /// absent PTR rather than an error.
    pub async fn ptr_lookup(&self, ip: IpAddr) -> Option<Arc<Vec<String>>> {
        match self.inner.cache.dns_ptr.get(&ip) {
            Some(value) => return value,
            None => (),
        }

        let resolvers = &self.core.resolvers;
        match resolvers.dns.reverse_lookup(ip).await {
            Ok(lookup) => {
                let names: Vec<String> = lookup
                    .iter()
                    .map(|ptr| {
                        ptr.0
                            .to_lowercase()
                            .to_string()
                            .trim_end_matches('.')
                            .to_string()
                    })
                    .collect();
                let names = Arc::new(names);
                self.inner.cache.dns_ptr.insert_with_expiry(
                    ip,
                    Some(names.clone()),
                    lookup.valid_until(),
                );
                Some(names)
            }
            Err(_) => {
                self.inner
                    .cache
                    .dns_ptr
                    .insert(ip, None, resolvers.negative_ttl);
                None
            }
        }
    }
}
