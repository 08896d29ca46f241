/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{path::PathBuf, time::Duration};

use common::config::session::{DosConfig, SessionLimits};
use smtp_proto::{AUTH_CRAM_MD5, AUTH_LOGIN, AUTH_PLAIN};
use tokio::io::{AsyncRead, AsyncWrite};

use super::Session;

/// Listener- and snapshot-derived knobs for one conversation, evaluated at
/// connect time and re-evaluated after STARTTLS.
#[derive(Debug, Clone)]
pub struct SessionParameters {
    pub timeout: Duration,
    pub data_timeout: Duration,
    pub limits: SessionLimits,
    pub dos: DosConfig,

    pub can_starttls: bool,
    pub can_auth: bool,
    pub auth_required: bool,
    pub auth_mechanisms: u64,
    pub can_chunking: bool,
    pub max_message_size: usize,

    pub xclient_enabled: bool,
    pub chaos_headers: bool,
    pub spool_path: PathBuf,
}

impl Default for SessionParameters {
    fn default() -> Self {
        SessionParameters {
            timeout: Duration::from_secs(300),
            data_timeout: Duration::from_secs(600),
            limits: SessionLimits::default(),
            dos: DosConfig::default(),
            can_starttls: false,
            can_auth: false,
            auth_required: false,
            auth_mechanisms: 0,
            can_chunking: true,
            max_message_size: 0,
            xclient_enabled: false,
            chaos_headers: false,
            spool_path: std::env::temp_dir(),
        }
    }
}

impl<T: AsyncRead + AsyncWrite> Session<T> {
    pub fn eval_session_params(&mut self) {
        let core = self.server.snapshot();
        let config = &self.instance.config;

        let tls_active = self.data.record.tls.negotiated;
        let auth = &core.server.auth;
        let mut mechanisms = 0;
        for mechanism in &auth.mechanisms {
            match mechanism.to_uppercase().as_str() {
                "PLAIN" => mechanisms |= AUTH_PLAIN,
                "LOGIN" => mechanisms |= AUTH_LOGIN,
                "CRAM-MD5" => mechanisms |= AUTH_CRAM_MD5,
                other => {
                    tracing::warn!(mechanism = other, "unsupported SASL mechanism in config")
                }
            }
        }
        if mechanisms == 0 {
            mechanisms = AUTH_PLAIN | AUTH_LOGIN | AUTH_CRAM_MD5;
        }

        self.params = SessionParameters {
            timeout: Duration::from_secs(config.limits.socket_timeout_secs.max(1)),
            data_timeout: Duration::from_secs(config.limits.extended_timeout_secs.max(1)),
            limits: config.limits.clone(),
            dos: config.dos.clone(),
            can_starttls: core.server.starttls
                && self.instance.tls_acceptor.is_some()
                && !tls_active,
            can_auth: auth.enabled && (tls_active || auth.allow_plain_text),
            auth_required: auth.required,
            auth_mechanisms: mechanisms,
            can_chunking: core.server.chunking,
            max_message_size: config.limits.email_size_limit,
            xclient_enabled: core.server.xclient_enabled,
            chaos_headers: core.server.chaos_headers,
            spool_path: PathBuf::from(&core.server.spool_path),
        };
    }
}
