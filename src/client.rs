//! VPN Client - tokio driver for [`SessionProxy`]
//!
//! [`SessionRunner`] is the serial owner of one proxy: it feeds it link
//! events, tunnel packets, owner commands and timer ticks, and reports how
//! the session ended. [`VpnClient`] strings runs together over the endpoints
//! of a profile, applying the retry policy of `[connection_limits]`.

use crate::config::ClientProfile;
use crate::error::{Result, VpnError};
use crate::options::Endpoint;
use crate::protocol::constants::TICK_INTERVAL;
use crate::proxy::{SessionEvent, SessionProxy, StopAction};
use crate::tunnel::socket::{LinkEvent, SocketLink};
use crate::tunnel::{LinkInterface, TunnelConfig, TunnelInterface};
use bytes::Bytes;
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

/// OpenVPN's default `tun-mtu`
const TUNNEL_MTU: u16 = 1500;

/// Connection status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    /// A key is connected and the push reply applied
    Connected,
}

#[derive(Debug)]
enum RunnerCommand {
    Packets(Vec<Bytes>),
    Shutdown,
    Reconnect,
}

/// Cloneable handle for talking to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<RunnerCommand>,
    status: watch::Receiver<ConnectionStatus>,
}

impl SessionHandle {
    /// Queue IP packets read from the tunnel device
    pub fn send_packets(&self, packets: Vec<Bytes>) -> Result<()> {
        self.send(RunnerCommand::Packets(packets))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(RunnerCommand::Shutdown)
    }

    /// Stop the session and let the client reconnect
    pub fn reconnect(&self) -> Result<()> {
        self.send(RunnerCommand::Reconnect)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Wait until the status changes
    pub async fn status_changed(&mut self) -> Option<ConnectionStatus> {
        self.status.changed().await.ok()?;
        Some(*self.status.borrow())
    }

    fn send(&self, command: RunnerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| VpnError::Network("Session runner is gone".into()))
    }
}

/// How a run of the session ended
#[derive(Debug)]
pub struct SessionOutcome {
    pub action: StopAction,
    pub error: Option<VpnError>,
    /// The session reached the connected state during this run
    pub started: bool,
    /// The run resumed a previous session on a new link
    pub resumed: bool,
}

/// Serial executor of a [`SessionProxy`]
pub struct SessionRunner {
    proxy: SessionProxy,
    commands: mpsc::UnboundedReceiver<RunnerCommand>,
    status: watch::Sender<ConnectionStatus>,
    interface_name: String,
    last_outcome_resumable: bool,
}

impl SessionRunner {
    pub fn new(proxy: SessionProxy) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        (
            Self {
                proxy,
                commands,
                status,
                interface_name: "tun0".to_string(),
                last_outcome_resumable: false,
            },
            SessionHandle {
                commands: commands_tx,
                status: status_rx,
            },
        )
    }

    pub fn set_tunnel(&mut self, tunnel: Box<dyn TunnelInterface>) {
        self.proxy.set_tunnel(tunnel);
    }

    /// Name reported with the pushed interface settings
    pub fn set_interface_name(&mut self, name: impl Into<String>) {
        self.interface_name = name.into();
    }

    pub fn proxy(&self) -> &SessionProxy {
        &self.proxy
    }

    /// Forget a session kept for rebinding
    pub fn reset(&mut self) {
        if self.proxy.has_link() {
            self.proxy.cleanup();
        }
        self.last_outcome_resumable = false;
    }

    /// Drive the session over `link` until it stops
    ///
    /// A session stopped with [`StopAction::Reconnect`] that owns a peer id is
    /// rebound to the new link instead of negotiating from scratch.
    pub async fn run(
        &mut self,
        link: Box<dyn LinkInterface>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> SessionOutcome {
        let resumed = self.last_outcome_resumable && self.proxy.can_rebind_link();
        if resumed {
            self.proxy.rebind_link(link, Instant::now());
            self.set_status(ConnectionStatus::Connected);
        } else {
            if self.proxy.has_link() {
                self.proxy.cleanup();
            }
            self.set_status(ConnectionStatus::Connecting);
            self.proxy.set_link(link, Instant::now());
        }

        let mut started = false;
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some((action, error)) = self.drain_events(&mut started) {
                // A fresh session that reached the server once may float to a new link
                self.last_outcome_resumable = action == StopAction::Reconnect && !resumed;
                if !self.last_outcome_resumable || !self.proxy.can_rebind_link() {
                    self.proxy.cleanup();
                    self.last_outcome_resumable = false;
                }
                self.set_status(ConnectionStatus::Disconnected);
                return SessionOutcome {
                    action,
                    error,
                    started,
                    resumed,
                };
            }

            tokio::select! {
                event = events.recv() => {
                    let now = Instant::now();
                    match event {
                        Some(LinkEvent::Packets(packets)) => self.proxy.receive_link(packets, now),
                        Some(LinkEvent::Failed(reason)) => {
                            warn!("Link failed: {reason}");
                            self.proxy.link_write_failed();
                        }
                        Some(LinkEvent::Closed) | None => {
                            self.proxy.reconnect(Some(VpnError::Network("Link closed".into())));
                        }
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(RunnerCommand::Packets(packets)) => {
                            self.proxy.receive_tunnel(packets, Instant::now());
                        }
                        Some(RunnerCommand::Reconnect) => self.proxy.reconnect(None),
                        Some(RunnerCommand::Shutdown) | None => self.proxy.shutdown(None),
                    }
                }
                _ = interval.tick() => {
                    self.proxy.tick(Instant::now());
                }
            }
        }
    }

    fn drain_events(&mut self, started: &mut bool) -> Option<(StopAction, Option<VpnError>)> {
        while let Some(event) = self.proxy.poll_event() {
            match event {
                SessionEvent::Started {
                    remote_address,
                    reply,
                } => {
                    *started = true;
                    let config =
                        TunnelConfig::from_reply(&self.interface_name, &reply, TUNNEL_MTU);
                    info!(
                        "Connected to {}: {config}",
                        remote_address.as_deref().unwrap_or("server")
                    );
                    debug!("Pushed settings: {reply}");
                    self.set_status(ConnectionStatus::Connected);
                }
                SessionEvent::Stopped { action, error } => return Some((action, error)),
            }
        }
        None
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }
}

/// Endpoint rotation for [`StopAction::ChangeTransport`]
#[derive(Debug, Clone)]
pub struct ConnectionStrategy {
    endpoints: Vec<Endpoint>,
    index: usize,
}

impl ConnectionStrategy {
    pub fn new(mut endpoints: Vec<Endpoint>, randomize: bool) -> Self {
        if randomize {
            endpoints.shuffle(&mut rand::thread_rng());
        }
        Self {
            endpoints,
            index: 0,
        }
    }

    pub fn current(&self) -> Option<&Endpoint> {
        self.endpoints.get(self.index)
    }

    /// Move to the next endpoint, if any is left
    pub fn try_next(&mut self) -> Option<&Endpoint> {
        if self.index + 1 >= self.endpoints.len() {
            return None;
        }
        self.index += 1;
        self.current()
    }
}

/// OpenVPN client over tokio sockets
pub struct VpnClient {
    profile: ClientProfile,
    strategy: ConnectionStrategy,
    runner: SessionRunner,
    handle: SessionHandle,
}

impl VpnClient {
    /// Create a new VPN client from a profile
    ///
    /// # Errors
    /// Returns an error if the profile or its `.ovpn` file is invalid
    pub fn new(profile: ClientProfile) -> Result<Self> {
        profile.validate()?;
        let parsed = profile.load_session()?;
        if let Some(warning) = &parsed.warning {
            warn!("{warning}");
        }
        if parsed.endpoints.is_empty() {
            return Err(VpnError::Config("Profile has no remote".into()));
        }

        let strategy = ConnectionStrategy::new(
            parsed.endpoints,
            parsed.configuration.randomize_endpoint,
        );
        let proxy = SessionProxy::with_defaults(parsed.configuration, profile.credentials())?;
        let (runner, handle) = SessionRunner::new(proxy);
        Ok(Self {
            profile,
            strategy,
            runner,
            handle,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn set_tunnel(&mut self, tunnel: Box<dyn TunnelInterface>) {
        self.runner.set_tunnel(tunnel);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    /// Connect and keep the session up until shut down or out of options
    pub async fn run(&mut self) -> Result<()> {
        let limits = self.profile.connection_limits.clone();
        let connect_timeout = Duration::from_secs(self.profile.session.connect_timeout);
        let mtu = self.profile.session.mtu;
        let mut attempts = 0u32;

        loop {
            let endpoint = self
                .strategy
                .current()
                .cloned()
                .ok_or_else(|| VpnError::Config("No endpoint left".into()))?;

            let outcome = match SocketLink::connect(&endpoint, connect_timeout, mtu).await {
                Ok((link, events)) => self.runner.run(Box::new(link), events).await,
                Err(e) => {
                    error!("Cannot connect to {}:{}: {e}", endpoint.hostname, endpoint.port);
                    self.runner.reset();
                    SessionOutcome {
                        action: StopAction::ChangeTransport,
                        error: Some(e),
                        started: false,
                        resumed: false,
                    }
                }
            };
            if outcome.started {
                attempts = 0;
            }

            match outcome.action {
                StopAction::Shutdown => {
                    info!("Session shut down");
                    return outcome.error.map_or(Ok(()), Err);
                }
                StopAction::ChangeTransport => {
                    let Some(next) = self.strategy.try_next() else {
                        return Err(outcome.error.unwrap_or_else(|| {
                            VpnError::Network("All endpoints failed".into())
                        }));
                    };
                    info!("Trying next endpoint {}:{} ({})", next.hostname, next.port, next.socket_type);
                }
                StopAction::Reconnect => {
                    attempts += 1;
                    if attempts > limits.max_retry_attempts {
                        error!("Giving up after {} reconnect attempts", limits.max_retry_attempts);
                        return Err(outcome.error.unwrap_or_else(|| {
                            VpnError::Network("Too many reconnect attempts".into())
                        }));
                    }
                    info!(
                        "Reconnecting in {}s (attempt {attempts}/{})",
                        limits.retry_delay, limits.max_retry_attempts
                    );
                    tokio::time::sleep(Duration::from_secs(u64::from(limits.retry_delay))).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SocketType;
    use crate::proxy::SessionConfiguration;
    use crate::error::SessionError;
    use std::sync::{Arc, Mutex};

    const CA: &str = include_str!("../testdata/ca.crt");

    struct MemoryLink {
        written: Arc<Mutex<Vec<Bytes>>>,
        failing: bool,
    }

    impl LinkInterface for MemoryLink {
        fn is_reliable(&self) -> bool {
            false
        }

        fn mtu(&self) -> usize {
            1000
        }

        fn remote_address(&self) -> Option<String> {
            Some("192.0.2.1".into())
        }

        fn write_packets(&mut self, packets: Vec<Bytes>) -> Result<()> {
            if self.failing {
                return Err(VpnError::Network("broken pipe".into()));
            }
            self.written.lock().unwrap().extend(packets);
            Ok(())
        }
    }

    fn runner() -> (SessionRunner, SessionHandle) {
        let configuration = SessionConfiguration::builder(CA).build().unwrap();
        let proxy = SessionProxy::with_defaults(configuration, None).unwrap();
        SessionRunner::new(proxy)
    }

    fn link(failing: bool) -> (Box<dyn LinkInterface>, Arc<Mutex<Vec<Bytes>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(MemoryLink {
                written: written.clone(),
                failing,
            }),
            written,
        )
    }

    fn endpoint(hostname: &str) -> Endpoint {
        Endpoint {
            hostname: hostname.into(),
            port: 1194,
            socket_type: SocketType::Udp,
        }
    }

    #[tokio::test]
    async fn test_failing_link_reconnects() {
        let (mut runner, handle) = runner();
        let (link, _) = link(true);
        let (_events_tx, events) = mpsc::unbounded_channel();

        let outcome = runner.run(link, events).await;
        assert_eq!(outcome.action, StopAction::Reconnect);
        assert!(matches!(
            outcome.error,
            Some(VpnError::Session(SessionError::FailedLinkWrite))
        ));
        assert!(!outcome.started);
        assert!(!runner.proxy().has_link());
        assert_eq!(handle.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_closed_link_reconnects() {
        let (mut runner, _handle) = runner();
        let (link, written) = link(false);
        let (events_tx, events) = mpsc::unbounded_channel();
        events_tx.send(LinkEvent::Closed).unwrap();

        let outcome = runner.run(link, events).await;
        assert_eq!(outcome.action, StopAction::Reconnect);
        assert!(matches!(outcome.error, Some(VpnError::Network(_))));
        // The hard reset went out before the close was noticed
        let written = written.lock().unwrap();
        assert!(!written.is_empty());
        assert_eq!(written[0][0] >> 3, 7);
    }

    #[tokio::test]
    async fn test_shutdown_command() {
        let (mut runner, handle) = runner();
        let (link, _) = link(false);
        let (_events_tx, events) = mpsc::unbounded_channel();
        handle.shutdown().unwrap();

        let outcome = runner.run(link, events).await;
        assert_eq!(outcome.action, StopAction::Shutdown);
        assert!(outcome.error.is_none());
        assert!(!outcome.resumed);
    }

    #[tokio::test]
    async fn test_link_failure_event() {
        let (mut runner, handle) = runner();
        let (link, _) = link(false);
        let (events_tx, events) = mpsc::unbounded_channel();
        events_tx.send(LinkEvent::Packets(vec![Bytes::from_static(&[0xFF])])).unwrap();
        events_tx.send(LinkEvent::Failed("reset".into())).unwrap();

        let outcome = runner.run(link, events).await;
        assert_eq!(outcome.action, StopAction::Reconnect);
        assert!(matches!(
            outcome.error,
            Some(VpnError::Session(SessionError::FailedLinkWrite))
        ));

        drop(runner);
        assert!(handle.shutdown().is_err());
    }

    #[test]
    fn test_connection_strategy() {
        let mut strategy =
            ConnectionStrategy::new(vec![endpoint("a.example"), endpoint("b.example")], false);
        assert_eq!(strategy.current().unwrap().hostname, "a.example");
        assert_eq!(strategy.try_next().unwrap().hostname, "b.example");
        assert!(strategy.try_next().is_none());
        assert_eq!(strategy.current().unwrap().hostname, "b.example");

        let empty = ConnectionStrategy::new(Vec::new(), true);
        assert!(empty.current().is_none());
    }

    #[test]
    fn test_randomized_strategy_keeps_endpoints() {
        let endpoints: Vec<Endpoint> = (0..8).map(|i| endpoint(&format!("{i}.example"))).collect();
        let mut strategy = ConnectionStrategy::new(endpoints, true);
        let mut seen = vec![strategy.current().unwrap().hostname.clone()];
        while let Some(next) = strategy.try_next() {
            seen.push(next.hostname.clone());
        }
        seen.sort();
        let expected: Vec<String> = (0..8).map(|i| format!("{i}.example")).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_client_requires_valid_profile() {
        let profile = ClientProfile::new("/nonexistent/client.ovpn");
        assert!(VpnClient::new(profile).is_err());
    }
}
