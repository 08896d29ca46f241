/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use serde::Deserialize;

/// Per-listener conversation limits. A value of zero disables the check.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionLimits {
    /// Total verbs accepted over one connection.
    pub transactions_limit: usize,
    /// 4xx/5xx replies tolerated before the connection is dropped with 421.
    pub error_limit: usize,
    /// Forward paths accepted per envelope.
    pub recipients_limit: usize,
    /// Successful MAIL transactions per connection.
    pub envelope_limit: usize,
    /// Message size ceiling, enforced against SIZE= and the actual payload.
    pub email_size_limit: usize,
    /// Command read timeout, seconds.
    pub socket_timeout_secs: u64,
    /// DATA/BDAT payload read timeout, seconds.
    pub extended_timeout_secs: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        SessionLimits {
            transactions_limit: 0,
            error_limit: 0,
            recipients_limit: 0,
            envelope_limit: 0,
            email_size_limit: 0,
            socket_timeout_secs: 300,
            extended_timeout_secs: 600,
        }
    }
}

/// Abuse controls consulted by the receipt engine through the connection
/// tracker. Zero disables the individual knob; `enabled = false` disables
/// them all.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DosConfig {
    pub enabled: bool,
    pub max_connections_per_ip: u64,
    pub max_total_connections: u64,
    pub rate_limit_window_secs: u64,
    pub max_connections_per_window: u64,
    pub max_commands_per_minute: u64,
    pub min_data_rate_bytes: u64,
    pub max_data_timeout_secs: u64,
    pub tarpit_delay_ms: u64,
}

impl Default for DosConfig {
    fn default() -> Self {
        DosConfig {
            enabled: true,
            max_connections_per_ip: 0,
            max_total_connections: 0,
            rate_limit_window_secs: 60,
            max_connections_per_window: 0,
            max_commands_per_minute: 0,
            min_data_rate_bytes: 0,
            max_data_timeout_secs: 0,
            tarpit_delay_ms: 0,
        }
    }
}
