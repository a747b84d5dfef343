//! OpenVPN session state machine
//!
//! [`SessionProxy`] owns the control channel, the key slots and the data
//! paths of one session. It performs no I/O and reads no clock: the owner
//! feeds it link packets, tunnel packets and timer ticks with the current
//! [`Instant`], and drains [`SessionEvent`]s with [`SessionProxy::poll_event`].

use crate::crypto::tls::{RustlsEngineFactory, TlsEngineFactory};
use crate::crypto::{CryptoEngine, CryptoProvider, DataPath, NativeCryptoProvider};
use crate::error::{DataPathError, Result, SessionError, VpnError};
use crate::options::PushReply;
use crate::protocol::auth::{peer_info, Authenticator};
use crate::protocol::constants::{
    KEY_COUNT, PING_STRING, PING_TIMEOUT, PUSH_REQUEST_INTERVAL, RETRANSMISSION_LIMIT,
    SOFT_RESET_DELAY,
};
use crate::protocol::session::{KeyState, SessionKey};
use crate::protocol::{seconds, ControlChannel, ControlPacket, PacketCode};
use crate::tunnel::{LinkInterface, TunnelInterface};
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

pub mod configuration;

pub use configuration::{
    CompressionAlgorithm, CompressionFraming, Credentials, SessionConfiguration,
    SessionConfigurationBuilder,
};

/// Control fragment size used before a link is attached
const FALLBACK_MTU: usize = 1000;

const PUSH_REQUEST: &[u8] = b"PUSH_REQUEST\0";

/// What the owner should do after the session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// Give up
    Shutdown,
    /// Reconnect to the same endpoint
    Reconnect,
    /// Try the next endpoint or transport
    ChangeTransport,
}

/// Notifications for the session owner
#[derive(Debug)]
pub enum SessionEvent {
    /// The first key is connected and the tunnel can be configured
    Started {
        remote_address: Option<String>,
        reply: Box<PushReply>,
    },
    /// The session stopped; no further packets will be written
    Stopped {
        action: StopAction,
        error: Option<VpnError>,
    },
}

/// Sans-IO OpenVPN client session
pub struct SessionProxy {
    configuration: SessionConfiguration,
    credentials: Option<Credentials>,
    tls_factory: Arc<dyn TlsEngineFactory>,
    crypto: Arc<dyn CryptoProvider>,
    engine: CryptoEngine,

    control: ControlChannel,
    keys: BTreeMap<u8, SessionKey>,
    old_keys: VecDeque<u8>,
    negotiation_key_idx: u8,
    current_key_idx: Option<u8>,
    authenticator: Option<Authenticator>,
    push_reply: Option<PushReply>,
    next_push_request: Option<Instant>,
    last_ping_in: Option<Instant>,
    last_ping_out: Option<Instant>,

    link: Option<Box<dyn LinkInterface>>,
    tunnel: Option<Box<dyn TunnelInterface>>,
    is_stopping: bool,
    events: VecDeque<SessionEvent>,
}

impl SessionProxy {
    pub fn new(
        configuration: SessionConfiguration,
        credentials: Option<Credentials>,
        tls_factory: Arc<dyn TlsEngineFactory>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        let control =
            ControlChannel::with_tls_wrap(configuration.tls_wrap.as_ref(), configuration.digest);
        Self {
            configuration,
            credentials,
            tls_factory,
            crypto,
            engine: CryptoEngine::new(),
            control,
            keys: BTreeMap::new(),
            old_keys: VecDeque::new(),
            negotiation_key_idx: 0,
            current_key_idx: None,
            authenticator: None,
            push_reply: None,
            next_push_request: None,
            last_ping_in: None,
            last_ping_out: None,
            link: None,
            tunnel: None,
            is_stopping: false,
            events: VecDeque::new(),
        }
    }

    /// Session using rustls for the handshake and the native data channel ciphers
    pub fn with_defaults(
        configuration: SessionConfiguration,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let tls_factory = RustlsEngineFactory::new(&configuration)?;
        Ok(Self::new(
            configuration,
            credentials,
            Arc::new(tls_factory),
            Arc::new(NativeCryptoProvider),
        ))
    }

    pub fn configuration(&self) -> &SessionConfiguration {
        &self.configuration
    }

    /// Attach the link and send the hard reset
    pub fn set_link(&mut self, link: Box<dyn LinkInterface>, now: Instant) {
        if self.link.is_some() {
            warn!("Link interface already set");
            return;
        }
        debug!("Starting with link {:?}", link.remote_address());
        self.link = Some(link);
        self.hard_reset(now);
    }

    pub fn set_tunnel(&mut self, tunnel: Box<dyn TunnelInterface>) {
        self.tunnel = Some(tunnel);
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    /// Remove and return the next pending event
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// The last push reply, kept across soft resets
    pub fn push_reply(&self) -> Option<&PushReply> {
        self.push_reply.as_ref()
    }

    /// Whether data can flow
    pub fn is_connected(&self) -> bool {
        self.current_key_idx
            .and_then(|idx| self.keys.get(&idx))
            .is_some_and(SessionKey::is_connected)
    }

    pub fn is_stopping(&self) -> bool {
        self.is_stopping
    }

    /// Bytes (received, sent) on the data channel since the last reset
    pub fn data_count(&self) -> (u64, u64) {
        self.control.current_data_count()
    }

    /// Handle packets read from the link
    pub fn receive_link(&mut self, packets: Vec<Bytes>, now: Instant) {
        if !self.should_handle_packets() {
            return;
        }
        self.last_ping_in = Some(now);
        self.maybe_renegotiate(now);

        let mut data_by_key: BTreeMap<u8, Vec<Bytes>> = BTreeMap::new();
        for packet in packets {
            if self.is_stopping {
                return;
            }
            let Some(&first) = packet.first() else {
                warn!("Dropped empty packet");
                continue;
            };
            let (code, key) = match PacketCode::parse_header(first) {
                Ok(header) => header,
                Err(e) => {
                    warn!("Dropped packet: {e}");
                    continue;
                }
            };
            if code.is_data() {
                if !self.keys.contains_key(&key) {
                    error!("Data packet for unknown key {key}");
                    self.stop(StopAction::Shutdown, Some(SessionError::BadKey.into()));
                    return;
                }
                data_by_key.entry(key).or_default().push(packet);
                continue;
            }

            let control_packet = match self.control.read_inbound_packet(&packet) {
                Ok(control_packet) => control_packet,
                Err(e) => {
                    warn!("Dropped malformed control packet: {e}");
                    continue;
                }
            };
            self.handle_inbound_control(control_packet, now);
        }

        for (key, packets) in data_by_key {
            if self.is_stopping {
                return;
            }
            self.handle_data_packets(key, packets);
        }
    }

    /// Encrypt packets read from the tunnel and send them
    pub fn receive_tunnel(&mut self, packets: Vec<Bytes>, now: Instant) {
        if !self.should_handle_packets() {
            return;
        }
        if !self.is_connected() {
            trace!("Dropped {} tunnel packet(s) before connection", packets.len());
            return;
        }
        self.send_data_packets(&packets, now);
    }

    /// Timer hook, expected every [`crate::protocol::constants::TICK_INTERVAL`]
    pub fn tick(&mut self, now: Instant) {
        if !self.should_handle_packets() {
            return;
        }
        let Some(link) = self.link.as_ref() else {
            return;
        };
        let hard_reset_timeout = link.hard_reset_timeout();
        let reliable = link.is_reliable();

        if let Some(key) = self.keys.get(&self.negotiation_key_idx) {
            if key.did_hard_reset_time_out(hard_reset_timeout, now) {
                error!("Negotiation timed out waiting for hard reset");
                self.stop(
                    StopAction::ChangeTransport,
                    Some(SessionError::NegotiationTimeout.into()),
                );
                return;
            }
            if key.did_negotiation_time_out(now) {
                error!("Negotiation of key {} timed out", key.id());
                self.stop(
                    StopAction::ChangeTransport,
                    Some(SessionError::NegotiationTimeout.into()),
                );
                return;
            }
        }

        if !reliable {
            if let Err(e) = self.push_request(now) {
                self.stop(StopAction::Shutdown, Some(e));
                return;
            }
            self.flush_control(now);
        }
        if self.is_stopping {
            return;
        }
        self.maybe_renegotiate(now);
        self.ping(now);
    }

    /// Report a failure of the link reader or writer
    pub fn link_write_failed(&mut self) {
        self.stop(
            StopAction::Reconnect,
            Some(SessionError::FailedLinkWrite.into()),
        );
    }

    pub fn shutdown(&mut self, error: Option<VpnError>) {
        if self.is_stopping {
            warn!("Ignored shutdown, already stopping");
            return;
        }
        self.stop(StopAction::Shutdown, error);
    }

    pub fn reconnect(&mut self, error: Option<VpnError>) {
        if self.is_stopping {
            warn!("Ignored reconnect, already stopping");
            return;
        }
        self.stop(StopAction::Reconnect, error);
    }

    /// The server identifies this client by peer id, so the link may change
    pub fn can_rebind_link(&self) -> bool {
        self.push_reply
            .as_ref()
            .is_some_and(|reply| reply.peer_id.is_some())
    }

    /// Replace the link of a stopped session without renegotiating
    pub fn rebind_link(&mut self, link: Box<dyn LinkInterface>, now: Instant) -> bool {
        if !self.can_rebind_link() {
            warn!("Session has no peer id, cannot rebind link");
            return false;
        }
        info!("Rebinding link to {:?}", link.remote_address());
        self.link = Some(link);
        self.is_stopping = false;
        self.last_ping_in = Some(now);
        true
    }

    /// Drop all session state; a persistent tunnel is kept
    pub fn cleanup(&mut self) {
        debug!("Cleaning up session");
        self.control = ControlChannel::with_tls_wrap(
            self.configuration.tls_wrap.as_ref(),
            self.configuration.digest,
        );
        self.keys.clear();
        self.old_keys.clear();
        self.negotiation_key_idx = 0;
        self.current_key_idx = None;
        self.authenticator = None;
        self.push_reply = None;
        self.next_push_request = None;
        self.last_ping_in = None;
        self.last_ping_out = None;
        self.link = None;
        if !self.tunnel.as_ref().is_some_and(|t| t.is_persistent()) {
            self.tunnel = None;
        }
        self.is_stopping = false;
    }

    fn should_handle_packets(&self) -> bool {
        !self.is_stopping && !self.keys.is_empty()
    }

    fn stop(&mut self, action: StopAction, error: Option<VpnError>) {
        if self.is_stopping {
            return;
        }
        match &error {
            Some(e) => error!("Session stopped ({action:?}): {e}"),
            None => info!("Session stopped ({action:?})"),
        }
        self.is_stopping = true;
        self.events.push_back(SessionEvent::Stopped { action, error });
    }

    fn is_reliable_link(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_reliable())
    }

    fn negotiation_key(&mut self) -> Result<&mut SessionKey> {
        self.keys
            .get_mut(&self.negotiation_key_idx)
            .ok_or_else(|| SessionError::BadKey.into())
    }

    // Link output

    fn write_link(&mut self, packets: Vec<Bytes>) {
        if self.is_stopping || packets.is_empty() {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            warn!("Dropped {} packet(s), no link", packets.len());
            return;
        };
        if let Err(e) = link.write_packets(packets) {
            error!("Failed link write: {e}");
            self.link_write_failed();
        }
    }

    fn enqueue_control(&mut self, code: PacketCode, key: u8, payload: &[u8], now: Instant) {
        let mtu = self.link.as_ref().map_or(FALLBACK_MTU, |link| link.mtu());
        self.control.enqueue_outbound(code, key, payload, mtu);
        self.flush_control(now);
    }

    fn flush_control(&mut self, now: Instant) {
        match self.control.writable_packets(now) {
            Ok(packets) => self.write_link(packets),
            Err(e) => self.stop(StopAction::Shutdown, Some(e)),
        }
    }

    // Negotiation

    fn hard_reset(&mut self, now: Instant) {
        debug!("Send hard reset");
        self.control.reset(true);
        self.keys.clear();
        self.old_keys.clear();
        self.current_key_idx = None;
        self.authenticator = None;
        self.push_reply = None;
        self.next_push_request = None;
        self.last_ping_in = Some(now);
        self.last_ping_out = None;

        self.negotiation_key_idx = 0;
        self.keys.insert(0, SessionKey::new(0, false, now));
        self.enqueue_control(PacketCode::HardResetClientV2, 0, &[], now);
    }

    /// Start a new key; `adopted` is the key id picked by the server
    fn soft_reset(&mut self, now: Instant, adopted: Option<u8>) {
        let id = adopted.unwrap_or_else(|| ((self.negotiation_key_idx + 1) % KEY_COUNT).max(1));
        if Some(id) == self.current_key_idx {
            warn!("Ignored soft reset onto the current key {id}");
            return;
        }
        debug!("Send soft reset for key {id}");
        self.control.reset(false);
        self.authenticator = None;
        self.next_push_request = None;

        self.old_keys.retain(|old| *old != id);
        self.keys.insert(id, SessionKey::new(id, true, now));
        self.negotiation_key_idx = id;
        self.enqueue_control(PacketCode::SoftResetV1, id, &[], now);
    }

    fn maybe_renegotiate(&mut self, now: Instant) {
        let Some(interval) = self.configuration.renegotiates_after else {
            return;
        };
        if self.current_key_idx != Some(self.negotiation_key_idx) {
            return;
        }
        let Some(key) = self.keys.get(&self.negotiation_key_idx) else {
            return;
        };
        if !key.is_connected() || key.elapsed(now) <= interval {
            return;
        }
        info!("Renegotiating after {}s", key.elapsed(now).as_secs());
        self.soft_reset(now, None);
    }

    /// The server may rekey first; its soft reset arrives on the next key id
    fn is_server_soft_reset(&self, packet: &ControlPacket) -> bool {
        packet.code == PacketCode::SoftResetV1
            && packet.key != self.negotiation_key_idx
            && self.current_key_idx == Some(self.negotiation_key_idx)
            && self.is_connected()
    }

    fn handle_inbound_control(&mut self, packet: ControlPacket, now: Instant) {
        if let Some(remote) = packet.ack_remote_session_id {
            if !packet.ack_ids.is_empty() {
                self.handle_acks(&packet.ack_ids, remote, now);
                if self.is_stopping {
                    return;
                }
            }
        }
        if packet.is_ack() {
            return;
        }
        // Left unacknowledged so the server retransmits once the window reaches it
        if !self.control.accepts_inbound(packet.packet_id) {
            debug!(
                "Control: ignoring packet {} beyond the receive window",
                packet.packet_id
            );
            return;
        }

        match self
            .control
            .write_ack(packet.key, packet.packet_id, packet.session_id)
        {
            Ok(ack) => self.write_link(vec![ack]),
            Err(e) => {
                self.stop(StopAction::Shutdown, Some(e));
                return;
            }
        }

        if self.is_server_soft_reset(&packet) {
            info!("Server requested soft reset on key {}", packet.key);
            self.soft_reset(now, Some(packet.key));
        }

        for delivered in self.control.enqueue_inbound(packet) {
            if self.is_stopping {
                return;
            }
            if let Err(e) = self.handle_control_packet(delivered, now) {
                self.stop(StopAction::Shutdown, Some(e));
            }
        }
    }

    fn handle_acks(&mut self, ids: &[u32], remote: crate::protocol::SessionId, now: Instant) {
        if let Err(e) = self.control.read_acks(ids, remote) {
            error!("Ack for another session");
            self.stop(StopAction::Shutdown, Some(e));
            return;
        }
        // reliable links get no timer-driven push requests
        if self.is_reliable_link() && !self.control.has_pending_acks() {
            if let Err(e) = self.push_request(now) {
                self.stop(StopAction::Shutdown, Some(e));
            }
        }
    }

    fn check_remote_session_id(&self, packet: &ControlPacket) -> Result<()> {
        let remote = self
            .control
            .remote_session_id()
            .ok_or(SessionError::MissingSessionId)?;
        if packet.session_id != remote {
            error!(
                "Packet session mismatch ({} != {})",
                hex::encode(packet.session_id),
                hex::encode(remote)
            );
            return Err(SessionError::SessionMismatch.into());
        }
        Ok(())
    }

    fn handle_control_packet(&mut self, packet: ControlPacket, now: Instant) -> Result<()> {
        if packet.key != self.negotiation_key_idx {
            error!(
                "Bad key in control packet ({} != {})",
                packet.key, self.negotiation_key_idx
            );
            return Ok(());
        }
        let state = self.negotiation_key()?.state();
        trace!(
            "Control packet {:?} id {} in state {state:?}",
            packet.code,
            packet.packet_id
        );

        match (packet.code, state) {
            (PacketCode::HardResetServerV2, KeyState::HardReset)
            | (PacketCode::SoftResetV1, KeyState::SoftReset) => {
                if state == KeyState::HardReset {
                    self.control.set_remote_session_id(packet.session_id);
                }
                self.check_remote_session_id(&packet)?;
                self.start_tls(now)
            }
            (
                PacketCode::ControlV1,
                KeyState::Tls | KeyState::PreAuth | KeyState::PreIfConfig | KeyState::Connected,
            ) => {
                self.check_remote_session_id(&packet)?;
                let Some(payload) = packet.payload else {
                    return Ok(());
                };
                self.handle_tls_data(&payload, now)
            }
            (code, state) => {
                debug!("Ignored {code:?} in state {state:?}");
                Ok(())
            }
        }
    }

    fn start_tls(&mut self, now: Instant) -> Result<()> {
        debug!(
            "Remote session id is {}, starting TLS handshake",
            self.control.remote_session_id().map(hex::encode).unwrap_or_default()
        );
        let mut tls = self.tls_factory.create()?;
        tls.start()?;
        let hello = tls.pull_cipher_text()?;
        if hello.is_empty() {
            return Err(SessionError::Tls("no ciphertext after handshake start".into()).into());
        }

        let key = self.negotiation_key()?;
        key.set_state(KeyState::Tls);
        key.set_tls(tls);
        let id = key.id();
        self.enqueue_control(PacketCode::ControlV1, id, &hello, now);
        Ok(())
    }

    fn handle_tls_data(&mut self, payload: &[u8], now: Instant) -> Result<()> {
        let key = self.negotiation_key()?;
        let id = key.id();
        let tls = key.tls()?;
        tls.put_cipher_text(payload)?;
        let out = tls.pull_cipher_text()?;
        if !out.is_empty() {
            self.enqueue_control(PacketCode::ControlV1, id, &out, now);
        }

        if self.negotiation_key()?.should_on_tls_connect() {
            self.on_tls_connect(now)?;
        }

        let plain = self.negotiation_key()?.tls()?.pull_plain_text()?;
        if !plain.is_empty() {
            self.handle_control_data(&plain, now)?;
        }
        Ok(())
    }

    fn write_tls_plain(&mut self, data: &[u8], now: Instant) -> Result<()> {
        let key = self.negotiation_key()?;
        let id = key.id();
        let tls = key.tls()?;
        tls.put_plain_text(data)?;
        let out = tls.pull_cipher_text()?;
        self.enqueue_control(PacketCode::ControlV1, id, &out, now);
        Ok(())
    }

    fn on_tls_connect(&mut self, now: Instant) -> Result<()> {
        debug!("TLS handshake complete, sending credentials");
        let authenticator = Authenticator::new(&self.engine)?;
        let auth_token = self
            .push_reply
            .as_ref()
            .and_then(|reply| reply.auth_token.as_deref());
        let request = authenticator.request(
            self.credentials.as_ref(),
            auth_token,
            &peer_info(self.configuration.compression_framing),
        )?;
        self.authenticator = Some(authenticator);
        self.negotiation_key()?.set_state(KeyState::PreAuth);
        self.write_tls_plain(&request, now)
    }

    fn handle_control_data(&mut self, data: &[u8], now: Instant) -> Result<()> {
        let key = self.negotiation_key()?;
        let state = key.state();
        let soft_reset = key.is_soft_reset();
        let Some(authenticator) = self.authenticator.as_mut() else {
            debug!("Dropped {} bytes of control data", data.len());
            return Ok(());
        };
        authenticator.append_control_data(data);

        if state == KeyState::PreAuth {
            if !authenticator.parse_auth_reply()? {
                return Ok(());
            }
            self.negotiation_key()?.set_state(KeyState::PreIfConfig);
            let delay = if soft_reset {
                SOFT_RESET_DELAY
            } else {
                RETRANSMISSION_LIMIT
            };
            self.next_push_request = Some(now + delay);
            self.push_request(now)?;
        }

        let messages = match self.authenticator.as_mut() {
            Some(authenticator) => authenticator.parse_messages(),
            None => return Ok(()),
        };
        for message in messages {
            self.handle_control_message(&message, now)?;
            if self.is_stopping {
                break;
            }
        }
        Ok(())
    }

    fn handle_control_message(&mut self, message: &str, now: Instant) -> Result<()> {
        debug!(
            "Received control message \"{}\"",
            message.split(',').next().unwrap_or_default()
        );
        if message.starts_with("AUTH_FAILED") {
            self.stop(
                StopAction::Shutdown,
                Some(SessionError::BadCredentials.into()),
            );
            return Ok(());
        }
        if message.starts_with("RESTART") {
            self.stop(
                StopAction::Reconnect,
                Some(SessionError::ServerRestart.into()),
            );
            return Ok(());
        }

        let key = self.negotiation_key()?;
        if key.state() != KeyState::PreIfConfig {
            return Ok(());
        }
        let soft_reset = key.is_soft_reset();
        let Some(reply) = PushReply::parse(message)? else {
            return Ok(());
        };
        info!("Received PUSH_REPLY: \"{reply}\"");
        self.push_reply = Some(reply);
        self.complete_connection(now)?;

        if !soft_reset {
            if let Some(reply) = &self.push_reply {
                let remote_address = self.link.as_ref().and_then(|link| link.remote_address());
                self.events.push_back(SessionEvent::Started {
                    remote_address,
                    reply: Box::new(reply.clone()),
                });
            }
        }
        Ok(())
    }

    fn push_request(&mut self, now: Instant) -> Result<()> {
        let Some(key) = self.keys.get(&self.negotiation_key_idx) else {
            return Ok(());
        };
        if key.state() != KeyState::PreIfConfig {
            return Ok(());
        }
        let soft_reset = key.is_soft_reset();
        if !self.is_reliable_link() {
            match self.next_push_request {
                Some(at) if now > at => {}
                _ => return Ok(()),
            }
        }

        debug!("Send PUSH_REQUEST");
        self.write_tls_plain(PUSH_REQUEST, now)?;
        if soft_reset {
            self.complete_connection(now)?;
        }
        self.next_push_request = Some(now + PUSH_REQUEST_INTERVAL);
        Ok(())
    }

    fn complete_connection(&mut self, now: Instant) -> Result<()> {
        let session_id = self
            .control
            .session_id()
            .ok_or(SessionError::MissingSessionId)?;
        let remote_session_id = self
            .control
            .remote_session_id()
            .ok_or(SessionError::MissingSessionId)?;
        let authenticator = self
            .authenticator
            .as_ref()
            .ok_or_else(|| VpnError::Crypto("no key material to derive from".into()))?;
        let keys = authenticator.derive_keys(&session_id, &remote_session_id)?;

        let reply = self
            .push_reply
            .as_ref()
            .ok_or_else(|| SessionError::MalformedPushReply("no reply to configure from".into()))?;
        let cipher = reply.cipher.unwrap_or(self.configuration.cipher);
        let framing = reply
            .compression_framing
            .unwrap_or(self.configuration.compression_framing);
        let peer_id = reply.peer_id;
        let digest = self.configuration.digest;
        let crypto = self.crypto.data_channel(cipher, digest, &keys)?;

        let key = self.negotiation_key()?;
        let data_path = DataPath::new(crypto, key.id(), peer_id, framing);
        info!(
            "Key {} connected: cipher {cipher}, digest {digest}, peer id {:?}",
            key.id(),
            peer_id
        );
        key.set_data_path(data_path);
        key.set_state(KeyState::Connected);

        self.last_ping_in = Some(now);
        self.last_ping_out = Some(now);
        self.transition_keys();
        Ok(())
    }

    /// Make the negotiated key current; at most one old key stays decryptable
    fn transition_keys(&mut self) {
        if let Some(current) = self.current_key_idx {
            if current != self.negotiation_key_idx {
                self.old_keys.push_back(current);
            }
        }
        self.current_key_idx = Some(self.negotiation_key_idx);
        while self.old_keys.len() > 1 {
            if let Some(id) = self.old_keys.pop_front() {
                debug!("Removed key {id}");
                self.keys.remove(&id);
            }
        }
    }

    // Data channel

    fn ping(&mut self, now: Instant) {
        if !self.is_connected() {
            return;
        }
        let reply = self.push_reply.as_ref();
        let timeout = reply
            .and_then(|r| r.keep_alive_timeout_seconds)
            .and_then(seconds)
            .or(self.configuration.keep_alive_timeout)
            .unwrap_or(PING_TIMEOUT);
        let interval = reply
            .and_then(|r| r.keep_alive_seconds)
            .and_then(seconds)
            .or(self.configuration.keep_alive_interval);

        if let Some(last_in) = self.last_ping_in {
            if now.saturating_duration_since(last_in) > timeout {
                self.stop(StopAction::Reconnect, Some(SessionError::PingTimeout.into()));
                return;
            }
        }
        let Some(interval) = interval else {
            return;
        };
        if self
            .last_ping_out
            .is_some_and(|last_out| now.saturating_duration_since(last_out) < interval)
        {
            return;
        }
        debug!("Send ping");
        self.send_data_packets(&[Bytes::from_static(&PING_STRING)], now);
    }

    fn send_data_packets(&mut self, packets: &[Bytes], now: Instant) {
        let Some(idx) = self.current_key_idx else {
            return;
        };
        let Some(key) = self.keys.get_mut(&idx) else {
            return;
        };
        let mut encrypted = Vec::with_capacity(packets.len());
        let result = key.encrypt(packets, &mut encrypted);

        if !encrypted.is_empty() {
            self.control
                .add_sent_data_count(encrypted.iter().map(Bytes::len).sum());
            self.last_ping_out = Some(now);
            self.write_link(encrypted);
        }
        match result {
            Ok(true) => {}
            Ok(false) => debug!("Key {idx} has no data path, dropped outbound packets"),
            Err(e) => self.handle_data_error(e),
        }
    }

    fn handle_data_packets(&mut self, key_id: u8, packets: Vec<Bytes>) {
        self.control
            .add_received_data_count(packets.iter().map(Bytes::len).sum());
        let Some(key) = self.keys.get_mut(&key_id) else {
            return;
        };
        let mut decrypted = Vec::with_capacity(packets.len());
        let result = key.decrypt(&packets, &mut decrypted);

        if !decrypted.is_empty() {
            match self.tunnel.as_mut() {
                Some(tunnel) => {
                    if let Err(e) = tunnel.write_packets(decrypted) {
                        warn!("Failed tunnel write: {e}");
                    }
                }
                None => trace!("Dropped {} packet(s), no tunnel", decrypted.len()),
            }
        }
        match result {
            Ok(true) => {}
            Ok(false) => debug!("Key {key_id} has no data path, dropped inbound packets"),
            Err(e) => self.handle_data_error(e),
        }
    }

    fn handle_data_error(&mut self, error: DataPathError) {
        let action = if error == DataPathError::Overflow {
            StopAction::Shutdown
        } else {
            StopAction::Reconnect
        };
        self.stop(action, Some(error.into()));
    }
}
