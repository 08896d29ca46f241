/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    fmt,
    net::IpAddr,
    str::FromStr,
};

use regex::Regex;
use serde::{de, Deserialize, Deserializer};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuleConfig {
    pub blocklist: BlocklistConfig,
    pub blackhole: BlackholeConfig,
    pub proxy: ProxyConfig,
    pub bots: BotsConfig,
}

/// A compiled regex that deserializes from its string form.
#[derive(Clone)]
pub struct Pattern(pub Regex);

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, String> {
        Regex::new(pattern)
            .map(Pattern)
            .map_err(|err| format!("invalid pattern {pattern:?}: {err}"))
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Pattern::new(&pattern).map_err(de::Error::custom)
    }
}

/// An IP network in CIDR notation. A bare address parses as a /32 or /128.
/// Prefix comparison is done on the raw octets, so IPv6 is handled the same
/// way as IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let (net, host) = match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(host)) => {
                (u128::from(u32::from(net)), u128::from(u32::from(*host)))
            }
            (IpAddr::V6(net), IpAddr::V6(host)) => (u128::from(net), u128::from(*host)),
            _ => return false,
        };
        let width: u8 = if self.addr.is_ipv4() { 32 } else { 128 };
        if self.prefix == 0 {
            return true;
        }
        let shift = u32::from(width - self.prefix);
        (net >> shift) == (host >> shift)
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match value.split_once('/') {
            Some((addr, prefix)) => {
                let addr = addr
                    .parse::<IpAddr>()
                    .map_err(|err| format!("invalid address in {value:?}: {err}"))?;
                let max = if addr.is_ipv4() { 32 } else { 128 };
                let prefix = prefix
                    .parse::<u8>()
                    .ok()
                    .filter(|prefix| *prefix <= max)
                    .ok_or_else(|| format!("invalid prefix length in {value:?}"))?;
                (addr, prefix)
            }
            None => {
                let addr = value
                    .parse::<IpAddr>()
                    .map_err(|err| format!("invalid address {value:?}: {err}"))?;
                (addr, if addr.is_ipv4() { 32 } else { 128 })
            }
        };
        Ok(Cidr { addr, prefix })
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BlocklistConfig {
    pub enabled: bool,
    pub entries: Vec<Cidr>,
}

impl BlocklistConfig {
    pub fn matches(&self, ip: &IpAddr) -> bool {
        self.enabled && self.entries.iter().any(|entry| entry.contains(ip))
    }
}

/// Matching sessions are accepted over the wire and silently discarded.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BlackholeConfig {
    pub enabled: bool,
    pub rules: Vec<BlackholeRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BlackholeRule {
    pub ip: Option<Pattern>,
    pub ehlo: Option<Pattern>,
    pub mail: Option<Pattern>,
    pub rcpt: Option<Pattern>,
}

impl BlackholeRule {
    /// Every present matcher must match; `rcpt` matches if any recipient
    /// does.
    pub fn matches(&self, ip: &str, ehlo: &str, mail: &str, rcpts: &[&str]) -> bool {
        fn check(pattern: &Option<Pattern>, value: &str) -> bool {
            pattern.as_ref().map_or(true, |p| p.is_match(value))
        }
        (self.ip.is_some() || self.ehlo.is_some() || self.mail.is_some() || self.rcpt.is_some())
            && check(&self.ip, ip)
            && check(&self.ehlo, ehlo)
            && check(&self.mail, mail)
            && self
                .rcpt
                .as_ref()
                .map_or(true, |p| rcpts.iter().any(|rcpt| p.is_match(rcpt)))
    }
}

impl BlackholeConfig {
    pub fn matches(&self, ip: &str, ehlo: &str, mail: &str, rcpts: &[&str]) -> bool {
        self.enabled
            && self
                .rules
                .iter()
                .any(|rule| rule.matches(ip, ehlo, mail, rcpts))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyDirection {
    Inbound,
    Outbound,
}

/// First matching rule turns the session into a tunnel to the named
/// upstream.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProxyConfig {
    pub enabled: bool,
    pub rules: Vec<ProxyRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProxyRule {
    pub ip: Option<Pattern>,
    pub ehlo: Option<Pattern>,
    pub mail: Option<Pattern>,
    pub rcpt: Option<Pattern>,
    pub direction: Option<ProxyDirection>,
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Default for ProxyRule {
    fn default() -> Self {
        ProxyRule {
            ip: None,
            ehlo: None,
            mail: None,
            rcpt: None,
            direction: None,
            host: String::new(),
            port: 25,
            tls: false,
        }
    }
}

impl ProxyConfig {
    pub fn find(&self, ip: &str, ehlo: &str, mail: &str, rcpts: &[&str]) -> Option<&ProxyRule> {
        if !self.enabled {
            return None;
        }
        self.rules.iter().find(|rule| {
            fn check(pattern: &Option<Pattern>, value: &str) -> bool {
                pattern.as_ref().map_or(true, |p| p.is_match(value))
            }
            (rule.ip.is_some() || rule.ehlo.is_some() || rule.mail.is_some() || rule.rcpt.is_some())
                && check(&rule.ip, ip)
                && check(&rule.ehlo, ehlo)
                && check(&rule.mail, mail)
                && rule
                    .rcpt
                    .as_ref()
                    .map_or(true, |p| rcpts.iter().any(|rcpt| p.is_match(rcpt)))
        })
    }
}

/// Bot mailboxes: a recipient matching `address_pattern` is only accepted
/// when the client IP matches, or when the plus-token in the local part is
/// one of the allowed tokens.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BotsConfig {
    pub bots: Vec<BotRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BotRule {
    pub bot_name: String,
    pub address_pattern: Option<Pattern>,
    pub allowed_ips: Vec<Cidr>,
    pub allowed_tokens: Vec<String>,
}

impl BotsConfig {
    /// `Some(true)` authorized, `Some(false)` denied, `None` when no bot
    /// rule covers the address.
    pub fn authorize(&self, address: &str, ip: &IpAddr) -> Option<bool> {
        let rule = self.bots.iter().find(|rule| {
            rule.address_pattern
                .as_ref()
                .map_or(false, |p| p.is_match(address))
        })?;

        if rule.allowed_ips.iter().any(|cidr| cidr.contains(ip)) {
            return Some(true);
        }
        Some(
            plus_token(address)
                .map_or(false, |token| rule.allowed_tokens.iter().any(|t| t == token)),
        )
    }
}

/// Extracts `token` from `local+token@domain`.
fn plus_token(address: &str) -> Option<&str> {
    let local = address.split('@').next()?;
    local.split_once('+').map(|(_, token)| token)
}
