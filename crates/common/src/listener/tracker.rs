/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    collections::VecDeque,
    net::IpAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;

use crate::config::session::DosConfig;

/// Entries idle longer than this are dropped by the maintenance pass.
pub const STALE_AGE_SECS: u64 = 300;
pub const CLEANUP_INTERVAL_SECS: u64 = 60;

/// Longest history any rolling window may need.
const MAX_HISTORY_SECS: u64 = 3600;

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    TooManyPerIp,
    TooManyTotal,
    RateWindow,
}

#[derive(Debug, Default)]
pub struct IpStats {
    pub active_connections: u64,
    pub last_activity: u64,
    connect_events: VecDeque<u64>,
    command_events: VecDeque<u64>,
    bytes_transferred: VecDeque<(u64, u64)>,
}

impl IpStats {
    fn trim(&mut self, now: u64) {
        let horizon = now.saturating_sub(MAX_HISTORY_SECS);
        while self.connect_events.front().map_or(false, |ts| *ts < horizon) {
            self.connect_events.pop_front();
        }
        while self.command_events.front().map_or(false, |ts| *ts < horizon) {
            self.command_events.pop_front();
        }
        while self
            .bytes_transferred
            .front()
            .map_or(false, |(ts, _)| *ts < horizon)
        {
            self.bytes_transferred.pop_front();
        }
    }

    fn count_since(events: &VecDeque<u64>, since: u64) -> u64 {
        events.iter().rev().take_while(|ts| **ts >= since).count() as u64
    }
}

/// Process-wide per-IP accounting consulted by every listener.
#[derive(Default)]
pub struct ConnectionTracker {
    entries: DashMap<IpAddr, IpStats>,
    total_active: AtomicU64,
}

impl ConnectionTracker {
    /// Records the connection attempt and decides whether to accept it.
    /// The attempt is counted against the rate window even when denied.
    pub fn try_accept(&self, ip: IpAddr, dos: &DosConfig) -> Result<(), DenyReason> {
        let now = now();
        let mut entry = self.entries.entry(ip).or_default();
        entry.last_activity = now;
        entry.connect_events.push_back(now);
        entry.trim(now);

        if dos.enabled {
            if dos.max_connections_per_ip > 0
                && entry.active_connections >= dos.max_connections_per_ip
            {
                return Err(DenyReason::TooManyPerIp);
            }
            if dos.max_total_connections > 0
                && self.total_active.load(Ordering::Relaxed) >= dos.max_total_connections
            {
                return Err(DenyReason::TooManyTotal);
            }
            if dos.max_connections_per_window > 0 && dos.rate_limit_window_secs > 0 {
                let since = now.saturating_sub(dos.rate_limit_window_secs);
                if IpStats::count_since(&entry.connect_events, since)
                    > dos.max_connections_per_window
                {
                    return Err(DenyReason::RateWindow);
                }
            }
        }

        entry.active_connections += 1;
        self.total_active.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn release(&self, ip: IpAddr) {
        if let Some(mut entry) = self.entries.get_mut(&ip) {
            entry.active_connections = entry.active_connections.saturating_sub(1);
            entry.last_activity = now();
        }
        let total = &self.total_active;
        let _ = total.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    pub fn record_command(&self, ip: IpAddr) {
        let now = now();
        let mut entry = self.entries.entry(ip).or_default();
        entry.last_activity = now;
        entry.command_events.push_back(now);
        entry.trim(now);
    }

    pub fn record_bytes(&self, ip: IpAddr, bytes: u64) {
        let now = now();
        let mut entry = self.entries.entry(ip).or_default();
        entry.last_activity = now;
        entry.bytes_transferred.push_back((now, bytes));
        entry.trim(now);
    }

    pub fn active_connections(&self, ip: &IpAddr) -> u64 {
        self.entries
            .get(ip)
            .map_or(0, |entry| entry.active_connections)
    }

    pub fn total_active(&self) -> u64 {
        self.total_active.load(Ordering::Relaxed)
    }

    pub fn recent_connection_count(&self, ip: &IpAddr, window: Duration) -> u64 {
        let since = now().saturating_sub(window.as_secs());
        self.entries.get(ip).map_or(0, |entry| {
            IpStats::count_since(&entry.connect_events, since)
        })
    }

    /// Drops entries with no active connections that have been idle longer
    /// than `stale_age_secs`.
    pub fn cleanup(&self, stale_age_secs: u64) {
        let now = now();
        self.entries.retain(|_, entry| {
            entry.active_connections > 0 || now.saturating_sub(entry.last_activity) <= stale_age_secs
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Releases the tracker slot when the connection ends, on every exit path.
pub struct TrackedConnection {
    server: crate::Server,
    ip: IpAddr,
}

impl TrackedConnection {
    pub fn new(server: crate::Server, ip: IpAddr) -> Self {
        TrackedConnection { server, ip }
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.server.inner.data.tracker.release(self.ip);
    }
}

/// Per-connection command meter. Once the per-minute budget is exceeded,
/// every further command is delayed, with the delay growing per breach.
#[derive(Debug, Default)]
pub struct CommandRate {
    events: VecDeque<Instant>,
    breaches: u32,
}

impl CommandRate {
    pub fn ingest(&mut self, dos: &DosConfig) -> Option<Duration> {
        if !dos.enabled || dos.max_commands_per_minute == 0 {
            return None;
        }
        let now = Instant::now();
        self.events.push_back(now);
        while self
            .events
            .front()
            .map_or(false, |ts| now.duration_since(*ts) > Duration::from_secs(60))
        {
            self.events.pop_front();
        }
        if self.events.len() as u64 > dos.max_commands_per_minute {
            self.breaches += 1;
            Some(Duration::from_millis(
                dos.tarpit_delay_ms.saturating_mul(u64::from(self.breaches)),
            ))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    TooSlow,
    Timeout,
}

/// Slow-transfer guard for DATA/BDAT payloads: a 5 second grace period,
/// then the average rate is checked every 5 seconds.
#[derive(Debug)]
pub struct TransferMonitor {
    started: Instant,
    last_check: Instant,
}

pub const TRANSFER_GRACE: Duration = Duration::from_secs(5);

impl TransferMonitor {
    pub fn start() -> Self {
        let now = Instant::now();
        TransferMonitor {
            started: now,
            last_check: now,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn check(&mut self, bytes_received: u64, dos: &DosConfig) -> Result<(), TransferError> {
        let elapsed = self.started.elapsed();

        if dos.enabled
            && dos.max_data_timeout_secs > 0
            && elapsed >= Duration::from_secs(dos.max_data_timeout_secs)
        {
            return Err(TransferError::Timeout);
        }

        if dos.enabled
            && dos.min_data_rate_bytes > 0
            && elapsed >= TRANSFER_GRACE
            && self.last_check.elapsed() >= TRANSFER_GRACE
        {
            self.last_check = Instant::now();
            let rate = bytes_received / elapsed.as_secs().max(1);
            if rate < dos.min_data_rate_bytes {
                return Err(TransferError::TooSlow);
            }
        }

        Ok(())
    }
}
