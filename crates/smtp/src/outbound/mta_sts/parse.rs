/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::config::smtp::resolver::{Mode, MxPattern, Policy};

pub trait ParsePolicy {
    fn parse(data: &str, id: String) -> Result<Policy, String>;
}

impl ParsePolicy for Policy {
    /// Parses the well-known policy text. A policy is valid when it carries
    /// the STSv1 version tag, a mode, and at least one mx pattern.
    fn parse(data: &str, id: String) -> Result<Policy, String> {
        let mut mode = None;
        let mut max_age: u64 = 86400;
        let mut mx = Vec::new();

        for line in data.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "version" => {
                    if value != "STSv1" {
                        return Err(format!("unsupported policy version {value:?}"));
                    }
                }
                "mode" => {
                    mode = Some(match value {
                        "enforce" => Mode::Enforce,
                        "testing" => Mode::Testing,
                        "none" => Mode::None,
                        _ => return Err(format!("unsupported mode {value:?}")),
                    });
                }
                "mx" => {
                    let value = value.to_lowercase();
                    if let Some(suffix) = value.strip_prefix("*.") {
                        if !suffix.is_empty() {
                            mx.push(MxPattern::StartsWith(suffix.to_string()));
                        }
                    } else if !value.is_empty() {
                        mx.push(MxPattern::Equals(value));
                    }
                }
                "max_age" => {
                    if let Ok(value) = value.parse() {
                        max_age = value;
                    }
                }
                _ => (),
            }
        }

        let mode = mode.ok_or_else(|| "missing 'mode' property".to_string())?;
        if mx.is_empty() {
            return Err("missing 'mx' property".to_string());
        }

        Ok(Policy {
            id,
            mode,
            mx,
            max_age,
        })
    }
}
