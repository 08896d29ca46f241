/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Disk,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub path: PathBuf,
    pub max_retries: u32,
    /// First retry interval, seconds; doubles on every attempt.
    pub retry_base_secs: u64,
    /// Ceiling for the exponential backoff, seconds.
    pub retry_cap_secs: u64,
    /// Items popped per scheduler pass.
    pub max_dequeue: usize,
    /// Scheduler pass interval, seconds.
    pub interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub greeting_timeout_secs: u64,
    pub tls_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub data_timeout_secs: u64,
    pub mta_sts_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            backend: QueueBackend::Disk,
            path: std::env::temp_dir().join("relay-queue"),
            max_retries: 6,
            retry_base_secs: 60,
            retry_cap_secs: 3600,
            max_dequeue: 128,
            interval_secs: 10,
            connect_timeout_secs: 60,
            greeting_timeout_secs: 60,
            tls_timeout_secs: 60,
            command_timeout_secs: 60,
            data_timeout_secs: 300,
            mta_sts_timeout_secs: 30,
        }
    }
}

impl QueueConfig {
    /// Exponential backoff for a given retry count: `base * 2^retries`,
    /// capped. The first delivery (zero retries) is immediate.
    pub fn backoff(&self, retry_count: u32) -> u64 {
        if retry_count == 0 {
            return 0;
        }
        self.retry_base_secs
            .saturating_mul(1u64 << (retry_count - 1).min(16))
            .min(self.retry_cap_secs)
    }
}
