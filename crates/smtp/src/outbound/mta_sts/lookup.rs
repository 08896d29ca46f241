/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use common::{config::smtp::resolver::Policy, dns::DnsError, Server};

use super::{parse::ParsePolicy, Error};

pub trait MtaStsLookup: Sync + Send {
    fn lookup_mta_sts_policy(
        &self,
        domain: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Arc<Policy>, Error>> + Send;
}

impl MtaStsLookup for Server {
    async fn lookup_mta_sts_policy(
        &self,
        domain: &str,
        timeout: Duration,
    ) -> Result<Arc<Policy>, Error> {
        // Lookup TXT record; a policy is only present when the name carries
        // exactly one STSv1 record.
        let record_id = match self.txt_lookup(format!("_mta-sts.{domain}.")).await {
            Ok(records) => {
                let mut sts_records = records
                    .iter()
                    .filter(|record| {
                        record
                            .split(';')
                            .any(|part| part.trim().eq_ignore_ascii_case("v=STSv1"))
                    })
                    .collect::<Vec<_>>();
                match (sts_records.pop(), sts_records.is_empty()) {
                    (Some(record), true) => record
                        .split(';')
                        .find_map(|part| part.trim().strip_prefix("id="))
                        .map(|id| id.trim().to_string())
                        .ok_or_else(|| {
                            Error::InvalidPolicy("STSv1 record has no id".to_string())
                        })?,
                    (Some(_), false) => {
                        return Err(Error::InvalidPolicy(
                            "multiple STSv1 records published".to_string(),
                        ));
                    }
                    (None, _) => return Err(Error::Dns(DnsError::NotFound)),
                }
            }
            Err(err) => {
                // Serve the cached policy while the TXT lookup is failing.
                return if let Some(value) = self.inner.cache.dns_mta_sts.get(domain) {
                    Ok(value)
                } else {
                    Err(err.into())
                };
            }
        };

        if let Some(value) = self.inner.cache.dns_mta_sts.get(domain) {
            if value.id == record_id {
                return Ok(value);
            }
        }

        #[cfg(not(any(test, feature = "test_mode")))]
        let bytes = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?
            .get(format!("https://mta-sts.{domain}/.well-known/mta-sts.txt"))
            .send()
            .await?
            .bytes()
            .await?;
        #[cfg(any(test, feature = "test_mode"))]
        let bytes = {
            let _ = timeout;
            super::STS_TEST_POLICY.lock().clone()
        };

        let policy = Policy::parse(
            std::str::from_utf8(&bytes).map_err(|err| Error::InvalidPolicy(err.to_string()))?,
            record_id,
        )?;

        let valid_until = Instant::now()
            + Duration::from_secs(if (3600..31557600).contains(&policy.max_age) {
                policy.max_age
            } else {
                86400
            });

        let policy = Arc::new(policy);
        self.inner
            .cache
            .dns_mta_sts
            .insert_with_expiry(domain.to_string(), policy.clone(), valid_until);

        Ok(policy)
    }
}
