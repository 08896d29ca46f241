/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod core;
pub mod inbound;
pub mod outbound;
pub mod queue;

pub use common::USER_AGENT;
