/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::IpAddr, sync::Arc};

use ahash::AHashSet;
use arc_swap::ArcSwap;
use config::{
    queue::QueueConfig,
    rules::RuleConfig,
    server::ServerConfig,
    smtp::resolver::{Policy, Tlsa},
};
use dns::Resolvers;
use ipc::{build_ipc, Ipc};
use listener::tracker::ConnectionTracker;
use mail_auth::MX;
use mail_send::smtp::tls::build_tls_connector;
use parking_lot::RwLock;
use policy::Hooks;
use tokio_rustls::TlsConnector;
use utils::cache::CacheWithTtl;

pub mod config;
pub mod dns;
pub mod ipc;
pub mod listener;
pub mod policy;

pub static USER_AGENT: &str = concat!("RelayMta/", env!("CARGO_PKG_VERSION"),);
pub static DAEMON_NAME: &str = concat!("Relay MTA v", env!("CARGO_PKG_VERSION"),);

pub const IPC_CHANNEL_BUFFER: usize = 1024;

#[derive(Clone)]
pub struct Server {
    pub inner: Arc<Inner>,
    pub core: Arc<Core>,
}

pub struct Inner {
    pub shared_core: ArcSwap<Core>,
    pub data: Data,
    pub cache: Caches,
    pub ipc: Ipc,
}

pub struct Data {
    pub blocked_ips: RwLock<AHashSet<IpAddr>>,
    pub tracker: ConnectionTracker,
    pub smtp_connectors: TlsConnectors,
}

pub struct Caches {
    pub dns_mx: CacheWithTtl<String, Option<Arc<Vec<MX>>>>,
    pub dns_ip: CacheWithTtl<String, Option<Arc<Vec<IpAddr>>>>,
    pub dns_ptr: CacheWithTtl<IpAddr, Option<Arc<Vec<String>>>>,
    pub dns_txt: CacheWithTtl<String, Option<Arc<Vec<String>>>>,
    pub dns_tlsa: CacheWithTtl<String, Arc<Tlsa>>,
    pub dns_mta_sts: CacheWithTtl<String, Arc<Policy>>,
}

#[derive(Clone)]
pub struct Core {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub rules: RuleConfig,
    pub resolvers: Resolvers,
    pub hooks: Hooks,
}

pub struct TlsConnectors {
    pub pki_verify: TlsConnector,
    pub dummy_verify: TlsConnector,
}

impl Server {
    pub fn new(core: Core) -> Self {
        let (ipc, _) = build_ipc();
        Server {
            core: Arc::new(core.clone()),
            inner: Arc::new(Inner {
                shared_core: ArcSwap::from_pointee(core),
                data: Data::default(),
                cache: Caches::default(),
                ipc,
            }),
        }
    }

    pub fn with_ipc(core: Core, ipc: Ipc) -> Self {
        Server {
            core: Arc::new(core.clone()),
            inner: Arc::new(Inner {
                shared_core: ArcSwap::from_pointee(core),
                data: Data::default(),
                cache: Caches::default(),
                ipc,
            }),
        }
    }

    /// Atomically replaces the configuration snapshot. Sessions pick up the
    /// new snapshot on their next access; in-flight conversations keep the
    /// snapshot they started with.
    pub fn reload(&self, core: Core) {
        self.inner.shared_core.store(Arc::new(core));
    }

    pub fn snapshot(&self) -> Arc<Core> {
        self.inner.shared_core.load_full()
    }

    pub fn is_ip_blocked(&self, ip: &IpAddr) -> bool {
        self.inner.data.blocked_ips.read().contains(ip)
            || self.core.rules.blocklist.matches(ip)
    }

    pub fn block_ip(&self, ip: IpAddr) {
        self.inner.data.blocked_ips.write().insert(ip);
    }
}

impl Default for Data {
    fn default() -> Self {
        Data {
            blocked_ips: RwLock::new(AHashSet::new()),
            tracker: ConnectionTracker::default(),
            smtp_connectors: TlsConnectors::default(),
        }
    }
}

impl Default for Caches {
    fn default() -> Self {
        const CACHE_CAPACITY: usize = 1024;
        Caches {
            dns_mx: CacheWithTtl::new(CACHE_CAPACITY),
            dns_ip: CacheWithTtl::new(CACHE_CAPACITY),
            dns_ptr: CacheWithTtl::new(CACHE_CAPACITY),
            dns_txt: CacheWithTtl::new(CACHE_CAPACITY),
            dns_tlsa: CacheWithTtl::new(CACHE_CAPACITY),
            dns_mta_sts: CacheWithTtl::new(CACHE_CAPACITY),
        }
    }
}

impl Default for TlsConnectors {
    fn default() -> Self {
        TlsConnectors {
            pki_verify: build_tls_connector(false),
            dummy_verify: build_tls_connector(true),
        }
    }
}

impl Default for Core {
    fn default() -> Self {
        Core {
            server: ServerConfig::default(),
            queue: QueueConfig::default(),
            rules: RuleConfig::default(),
            resolvers: Resolvers::default(),
            hooks: Hooks::default(),
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Server::new(Core::default())
    }
}

