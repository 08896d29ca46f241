/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use tokio::sync::mpsc;

use crate::IPC_CHANNEL_BUFFER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// A new item was enqueued; the scheduler should run a pass.
    Refresh,
    /// A delivery worker finished its item.
    WorkerDone,
    Stop,
}

pub struct Ipc {
    pub queue_tx: mpsc::Sender<QueueEvent>,
}

pub struct IpcReceivers {
    pub queue_rx: Option<mpsc::Receiver<QueueEvent>>,
}

pub fn build_ipc() -> (Ipc, IpcReceivers) {
    let (queue_tx, queue_rx) = mpsc::channel(IPC_CHANNEL_BUFFER);
    (
        Ipc { queue_tx },
        IpcReceivers {
            queue_rx: Some(queue_rx),
        },
    )
}
