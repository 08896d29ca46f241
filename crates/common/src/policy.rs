/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Contracts for the external policy collaborators the receipt engine and
//! the relay consult. Concrete backends (directory sockets, scanner wire
//! protocols, webhook transports) live outside this tree; the engine only
//! depends on these traits.

use std::{path::Path, sync::Arc};

use ahash::AHashMap;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    Unavailable(String),
}

#[async_trait]
pub trait UserLookup: Sync + Send {
    async fn exists(&self, address: &str) -> Result<bool, LookupError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslCredentials {
    Plain {
        authcid: String,
        secret: String,
    },
    Login {
        username: String,
        secret: String,
    },
    CramMd5 {
        username: String,
        challenge: String,
        digest: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Authenticated principal name.
    Success(String),
    Failed,
    /// Backend unreachable; the session replies 454 and may retry.
    Unavailable,
}

#[async_trait]
pub trait SaslAuthenticator: Sync + Send {
    async fn authenticate(&self, credentials: &SaslCredentials) -> AuthResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected(String),
    Error(String),
}

#[async_trait]
pub trait ContentScanner: Sync + Send {
    async fn scan(&self, artifact: &Path) -> ScanVerdict;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpamScore {
    pub score: f64,
    pub symbols: Vec<String>,
}

#[async_trait]
pub trait SpamScorer: Sync + Send {
    async fn score(&self, artifact: &Path) -> Result<SpamScore, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    TempFail,
    PermFail,
}

#[async_trait]
pub trait LocalDelivery: Sync + Send {
    async fn deliver(&self, recipient: &str, artifact: &Path) -> DeliveryOutcome;
}

/// Fire-and-forget notification of a protocol event. A dispatcher may
/// override the SMTP reply for the gated verb.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub stage: &'static str,
    pub session_id: String,
    pub fields: AHashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyOverride {
    pub code: u16,
    pub message: String,
}

#[async_trait]
pub trait WebhookDispatcher: Sync + Send {
    async fn dispatch(&self, event: WebhookEvent) -> Result<Option<ReplyOverride>, String>;
}

#[derive(Clone)]
pub struct Hooks {
    pub user_lookup: Arc<dyn UserLookup>,
    pub authenticator: Arc<dyn SaslAuthenticator>,
    pub virus_scanner: Arc<dyn ContentScanner>,
    pub spam_scorer: Arc<dyn SpamScorer>,
    pub local_delivery: Arc<dyn LocalDelivery>,
    pub webhook: Arc<dyn WebhookDispatcher>,
}

impl Default for Hooks {
    fn default() -> Self {
        Hooks {
            user_lookup: Arc::new(AcceptAll),
            authenticator: Arc::new(DenyAll),
            virus_scanner: Arc::new(NoScanner),
            spam_scorer: Arc::new(NoScanner),
            local_delivery: Arc::new(NoScanner),
            webhook: Arc::new(NoScanner),
        }
    }
}

/// Accepts every recipient; stands in until a directory backend is wired.
pub struct AcceptAll;

#[async_trait]
impl UserLookup for AcceptAll {
    async fn exists(&self, _address: &str) -> Result<bool, LookupError> {
        Ok(true)
    }
}

/// Rejects every credential; stands in until an auth backend is wired.
pub struct DenyAll;

#[async_trait]
impl SaslAuthenticator for DenyAll {
    async fn authenticate(&self, _credentials: &SaslCredentials) -> AuthResult {
        AuthResult::Failed
    }
}

/// Neutral collaborator: everything is clean, unscored, undeliverable
/// locally, and webhooks are swallowed.
pub struct NoScanner;

#[async_trait]
impl ContentScanner for NoScanner {
    async fn scan(&self, _artifact: &Path) -> ScanVerdict {
        ScanVerdict::Clean
    }
}

#[async_trait]
impl SpamScorer for NoScanner {
    async fn score(&self, _artifact: &Path) -> Result<SpamScore, String> {
        Ok(SpamScore::default())
    }
}

#[async_trait]
impl LocalDelivery for NoScanner {
    async fn deliver(&self, _recipient: &str, _artifact: &Path) -> DeliveryOutcome {
        DeliveryOutcome::PermFail
    }
}

#[async_trait]
impl WebhookDispatcher for NoScanner {
    async fn dispatch(&self, _event: WebhookEvent) -> Result<Option<ReplyOverride>, String> {
        Ok(None)
    }
}
