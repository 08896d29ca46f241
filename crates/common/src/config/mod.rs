/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use serde::Deserialize;

use crate::config::{queue::QueueConfig, rules::RuleConfig, server::ServerConfig};

pub mod queue;
pub mod rules;
pub mod server;
pub mod session;
pub mod smtp;

/// Root of the configuration snapshot. The concrete loader is an external
/// concern; any deserializer that produces this tree works. `main` reads it
/// from a JSON document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    #[serde(flatten)]
    pub rules: RuleConfig,
}

impl Config {
    pub fn parse(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|err| format!("invalid configuration: {err}"))
    }
}
