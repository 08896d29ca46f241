/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::SocketAddr, sync::Arc};

use common::{
    listener::{limiter::InFlight, tracker::CommandRate, ServerInstance, SessionManager},
    Server,
};
use smtp_proto::request::receiver::{
    BdatReceiver, DataReceiver, DummyDataReceiver, DummyLineReceiver, LineReceiver,
    RequestReceiver,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::{
    inbound::auth::SaslToken,
    queue::{Direction, Envelope, SessionRecord},
};

pub mod params;

use params::SessionParameters;

#[derive(Clone)]
pub struct SmtpSessionManager;

impl SessionManager for SmtpSessionManager {
    async fn handle(
        self,
        server: Server,
        instance: Arc<ServerInstance>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        in_flight: InFlight,
    ) {
        crate::inbound::session::handle_conn(server, instance, stream, remote_addr, in_flight)
            .await;
    }
}

pub enum State {
    Request(RequestReceiver),
    Bdat(BdatReceiver),
    Data(DataReceiver),
    Sasl(LineReceiver<SaslToken>),
    DataTooLarge(DummyDataReceiver),
    RequestTooLarge(DummyLineReceiver),
    None,
}

impl Default for State {
    fn default() -> Self {
        State::Request(RequestReceiver::default())
    }
}

pub struct Session<T: AsyncRead + AsyncWrite> {
    pub state: State,
    pub server: Server,
    pub instance: Arc<ServerInstance>,
    pub span: tracing::Span,
    pub stream: T,
    pub data: SessionData,
    pub params: SessionParameters,
}

pub struct SessionData {
    /// Serialisable record of the conversation; envelopes move out of it
    /// into the relay queue as they are accepted.
    pub record: SessionRecord,
    /// The open MAIL transaction, if any.
    pub envelope: Option<Envelope>,
    /// Payload buffer for the transaction in flight.
    pub message: Vec<u8>,
    pub bdat_last: bool,
    /// The current BDAT chunk was rejected; consume and drop it silently.
    pub bdat_discard: bool,

    pub transactions: usize,
    pub errors: usize,
    pub envelopes_accepted: usize,
    pub auth_errors: usize,
    pub command_rate: CommandRate,
    /// A command line is buffered but incomplete.
    pub partial_command: bool,

    /// Set when a blackhole rule matched; the conversation proceeds
    /// normally but nothing is enqueued.
    pub blackholed: bool,
}

impl SessionData {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        let mut record = SessionRecord::new(Direction::Inbound, local_addr.ip(), remote_addr.ip());
        record.put_magic("remote.ip", remote_addr.ip().to_string());
        record.put_magic("remote.port", remote_addr.port().to_string());
        SessionData {
            record,
            envelope: None,
            message: Vec::with_capacity(0),
            bdat_last: false,
            bdat_discard: false,
            transactions: 0,
            errors: 0,
            envelopes_accepted: 0,
            auth_errors: 0,
            command_rate: CommandRate::default(),
            partial_command: false,
            blackholed: false,
        }
    }

    /// Drops the open transaction, keeping HELO and authentication state.
    pub fn reset_envelope(&mut self) {
        self.envelope = None;
        self.message = Vec::with_capacity(0);
        self.bdat_last = false;
        self.bdat_discard = false;
    }
}

impl<T: AsyncRead + AsyncWrite> Session<T> {
    pub fn new(
        server: Server,
        instance: Arc<ServerInstance>,
        stream: T,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        let data = SessionData::new(local_addr, remote_addr);
        let span = tracing::info_span!(
            "session",
            "listener" = instance.id.as_str(),
            "remote" = %remote_addr.ip(),
            "session-id" = %data.record.id,
        );
        Session {
            state: State::default(),
            server,
            instance,
            span,
            stream,
            data,
            params: SessionParameters::default(),
        }
    }
}
