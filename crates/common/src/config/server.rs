/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{fs, io, net::SocketAddr, sync::Arc};

use rustls::ServerConfig as RustlsServerConfig;
use serde::Deserialize;
use tokio_rustls::TlsAcceptor;

use super::session::{DosConfig, SessionLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerProtocol {
    Smtp,
    Lmtp,
}

impl Default for ServerProtocol {
    fn default() -> Self {
        ServerProtocol::Smtp
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub hostname: String,
    pub greeting: String,
    pub listeners: Vec<Listener>,
    pub auth: AuthConfig,
    pub starttls: bool,
    pub chunking: bool,
    pub allow_self_signed: bool,
    /// Dev-only knobs; inert unless explicitly set.
    pub xclient_enabled: bool,
    pub chaos_headers: bool,
    pub tls: Option<TlsConfig>,
    pub scanner: ScannerConfig,
    pub spool_path: String,
    /// Domains handed to the local delivery agent instead of the relay.
    pub local_domains: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            hostname: "localhost".to_string(),
            greeting: "Relay MTA at your service".to_string(),
            listeners: Vec::new(),
            auth: AuthConfig::default(),
            starttls: true,
            chunking: true,
            allow_self_signed: false,
            xclient_enabled: false,
            chaos_headers: false,
            tls: None,
            scanner: ScannerConfig::default(),
            spool_path: std::env::temp_dir()
                .join("relay-spool")
                .to_string_lossy()
                .into_owned(),
            local_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Listener {
    pub id: String,
    pub bind: Vec<SocketAddr>,
    pub protocol: ServerProtocol,
    pub implicit_tls: bool,
    pub backlog: u32,
    pub max_pool: u64,
    pub limits: SessionLimits,
    pub dos: DosConfig,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            id: "smtp".to_string(),
            bind: vec!["0.0.0.0:25".parse().unwrap()],
            protocol: ServerProtocol::Smtp,
            implicit_tls: false,
            backlog: 1024,
            max_pool: 8192,
            limits: SessionLimits::default(),
            dos: DosConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuthConfig {
    pub enabled: bool,
    pub required: bool,
    /// Allows AUTH on cleartext connections. Off by default; mechanisms are
    /// only advertised once TLS is negotiated.
    pub allow_plain_text: bool,
    pub mechanisms: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TlsConfig {
    pub certificate: String,
    pub private_key: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            certificate: String::new(),
            private_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ScannerConfig {
    pub virus_enabled: bool,
    pub spam_enabled: bool,
    pub reject_threshold: f64,
    pub discard_threshold: f64,
    pub tag_threshold: f64,
    pub subject_tag: Option<String>,
    /// When true, a failed webhook dispatch fails the gated verb instead of
    /// being ignored.
    pub webhook_strict: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            virus_enabled: false,
            spam_enabled: false,
            reject_threshold: 0.0,
            discard_threshold: 0.0,
            tag_threshold: 0.0,
            subject_tag: None,
            webhook_strict: false,
        }
    }
}

impl TlsConfig {
    /// Builds the server-side acceptor from PEM key material on disk.
    pub fn build_acceptor(&self) -> Result<TlsAcceptor, String> {
        let certs = rustls_pemfile::certs(&mut io::BufReader::new(
            fs::File::open(&self.certificate)
                .map_err(|err| format!("failed to open {}: {err}", self.certificate))?,
        ))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("failed to read certificates: {err}"))?;
        let key = rustls_pemfile::private_key(&mut io::BufReader::new(
            fs::File::open(&self.private_key)
                .map_err(|err| format!("failed to open {}: {err}", self.private_key))?,
        ))
        .map_err(|err| format!("failed to read private key: {err}"))?
        .ok_or_else(|| "no private key found".to_string())?;

        let config = RustlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| format!("invalid TLS key material: {err}"))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

impl ServerConfig {
    /// Listeners with the conventional ports when none are configured:
    /// 25 (relay), 465 (implicit TLS), 587 (submission).
    pub fn effective_listeners(&self) -> Vec<Listener> {
        if !self.listeners.is_empty() {
            return self.listeners.clone();
        }
        [(25u16, "smtp", false), (465, "secure", true), (587, "submission", false)]
            .iter()
            .map(|(port, id, implicit_tls)| Listener {
                id: id.to_string(),
                bind: vec![SocketAddr::from(([0, 0, 0, 0], *port))],
                implicit_tls: *implicit_tls,
                ..Listener::default()
            })
            .collect()
    }
}
