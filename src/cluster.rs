//! Backend topology and session provider.
//!
//! A `Cluster` is connected once at startup: a control connection negotiates
//! the protocol version with the first reachable contact point and reads the
//! backend's real `system.local` row for the metadata the proxy republishes.
//! `Session`s are pooled sets of backend connections bound to one keyspace.
//! Session establishment is deliberately asynchronous: `Session::connect`
//! returns immediately and a background thread works through the reconnect
//! policy, so the proxy keeps serving clients while a keyspace session
//! comes up. The connected/failed transition is observable three
//! ways: a non-blocking `is_connected` poll (used on the hot path), a
//! `wait_ready` blocking wait (used by keyspace switches), and one-shot
//! subscription callbacks (used to drain pending request queues).

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::frame::{
    decode_response, error_code, query_frame, startup_frame, RawFrame, Response, ResultBody,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Lowest protocol version the negotiation will fall back to.
const MIN_VERSION: u8 = 0x03;

// ============================================================================
// Configuration
// ============================================================================

/// Credentials surface. Backend auth challenges are currently an error; the
/// field exists so the configuration shape is complete.
#[derive(Debug, Clone)]
pub struct Authenticator {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Protocol version to request; negotiation may settle lower.
    pub version: u8,
    pub contact_points: Vec<SocketAddr>,
    pub reconnect: ReconnectPolicy,
    pub auth: Option<Authenticator>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Empty string = no keyspace.
    pub keyspace: String,
    /// Pooled connections per session.
    pub num_conns: usize,
    pub reconnect: ReconnectPolicy,
}

/// Exponential backoff between session-establishment attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based): base * 2^(attempt-1),
    /// capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// Metadata scraped from the backend's `system.local`.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub release_version: String,
    pub partitioner: String,
    pub cql_version: String,
}

pub struct Cluster {
    pub info: ClusterInfo,
    pub negotiated_version: u8,
    pub hosts: Vec<SocketAddr>,
}

impl Cluster {
    /// Connect the control connection and scrape cluster metadata. Fatal on
    /// failure: the proxy cannot serve without knowing what to put in its
    /// virtual `system.local` row.
    pub fn connect(config: &ClusterConfig) -> Result<Cluster> {
        if config.contact_points.is_empty() {
            return Err(ProxyError::NoContactPoints);
        }
        if config.auth.is_some() {
            warn!("authenticator configured but backend auth is not implemented; ignoring");
        }

        let mut last_err = None;
        for &addr in &config.contact_points {
            match Self::try_contact(addr, config.version) {
                Ok(cluster) => return Ok(cluster),
                Err(e) => {
                    warn!(contact_point = %addr, error = %e, "contact point unusable");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(ProxyError::NoContactPoints))
    }

    fn try_contact(addr: SocketAddr, requested_version: u8) -> Result<Cluster> {
        let (mut stream, version) = negotiate(addr, requested_version)?;
        stream.set_read_timeout(Some(CONTROL_READ_TIMEOUT))?;

        let resp = exchange(
            &mut stream,
            &query_frame(
                version,
                1,
                "SELECT release_version, partitioner, cql_version FROM system.local",
            ),
        )?;
        let rows = match decode_response(&resp)? {
            Response::Result(ResultBody::Rows(rows)) => rows,
            Response::Error { code, message } => {
                return Err(ProxyError::Backend { code, message })
            }
            _ => return Err(ProxyError::UnexpectedResponse),
        };

        let column = |name: &str| -> Result<String> {
            let bytes = rows.first_row_value(name).ok_or_else(|| {
                ProxyError::Frame(format!("backend system.local missing column {}", name))
            })?;
            String::from_utf8(bytes.to_vec())
                .map_err(|_| ProxyError::Frame(format!("non-utf8 value in column {}", name)))
        };

        let info = ClusterInfo {
            release_version: column("release_version")?,
            partitioner: column("partitioner")?,
            cql_version: column("cql_version")?,
        };
        info!(
            contact_point = %addr,
            version,
            release_version = %info.release_version,
            "control connection established"
        );

        // Host discovery from system.peers is out of scope; the candidate
        // set is the configured contact points. The control connection is
        // dropped here since event subscription is not implemented.
        Ok(Cluster {
            info,
            negotiated_version: version,
            hosts: vec![addr],
        })
    }

}

/// Write a request and read its matching reply, skipping unsolicited events
/// (stream id -1).
fn exchange(stream: &mut TcpStream, request: &RawFrame) -> Result<RawFrame> {
    request.write_to(stream)?;
    loop {
        match RawFrame::read_from(stream)? {
            None => return Err(ProxyError::Closed),
            Some(frame) if frame.header.stream == -1 => continue,
            Some(frame) if frame.header.stream == request.header.stream => return Ok(frame),
            Some(frame) => {
                return Err(ProxyError::Frame(format!(
                    "reply for unexpected stream {}",
                    frame.header.stream
                )))
            }
        }
    }
}

/// STARTUP handshake on a fresh stream.
fn handshake(stream: &mut TcpStream, version: u8) -> Result<()> {
    let resp = exchange(stream, &startup_frame(version, 0))?;
    match decode_response(&resp)? {
        Response::Ready => Ok(()),
        Response::Authenticate(_) => Err(ProxyError::AuthRequired),
        Response::Error { code, message } => Err(ProxyError::Backend { code, message }),
        _ => Err(ProxyError::UnexpectedResponse),
    }
}

/// Open a connection, downgrading the protocol version while the backend
/// rejects it with a protocol error.
fn negotiate(addr: SocketAddr, requested: u8) -> Result<(TcpStream, u8)> {
    let mut version = requested;
    loop {
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        match handshake(&mut stream, version) {
            Ok(()) => return Ok((stream, version)),
            Err(ProxyError::Backend { code, .. })
                if code == error_code::PROTOCOL_ERROR && version > MIN_VERSION =>
            {
                debug!(version, "backend rejected protocol version, downgrading");
                version -= 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Load balancing
// ============================================================================

/// Rotates the host list by an atomic counter; every call yields the full
/// candidate set in a different starting order.
pub struct RoundRobinLoadBalancer {
    hosts: Vec<SocketAddr>,
    next: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new(hosts: Vec<SocketAddr>) -> Self {
        RoundRobinLoadBalancer {
            hosts,
            next: AtomicUsize::new(0),
        }
    }

    pub fn new_query_plan(&self) -> Vec<SocketAddr> {
        if self.hosts.is_empty() {
            return Vec::new();
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        let mut plan = Vec::with_capacity(self.hosts.len());
        plan.extend_from_slice(&self.hosts[start..]);
        plan.extend_from_slice(&self.hosts[..start]);
        plan
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Failed(String),
}

#[derive(Debug, Clone)]
enum SessionState {
    Connecting,
    Connected,
    Failed(String),
}

type Listener = Box<dyn Fn(&SessionEvent) + Send + Sync>;

/// A pooled set of backend connections bound to one keyspace.
pub struct Session {
    keyspace: String,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    connected: AtomicBool,
    conns: RwLock<Vec<Arc<PooledConn>>>,
    next_conn: AtomicUsize,
    listeners: Mutex<Vec<Listener>>,
}

impl Session {
    /// Begin establishing a session. Returns immediately; establishment runs
    /// on a background thread driven by the reconnect policy.
    pub fn connect(cluster: &Cluster, config: SessionConfig) -> Arc<Session> {
        let session = Arc::new(Session::new(config.keyspace.clone()));

        let worker = Arc::clone(&session);
        let hosts = cluster.hosts.clone();
        let version = cluster.negotiated_version;
        let num_conns = config.num_conns.max(1);
        let policy = config.reconnect;
        let name = if config.keyspace.is_empty() {
            "session-establish".to_string()
        } else {
            format!("session-establish-{}", config.keyspace)
        };
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || worker.establish(&hosts, version, num_conns, policy));
        if let Err(e) = spawned {
            session.resolve(SessionEvent::Failed(format!(
                "unable to spawn establishment thread: {}",
                e
            )));
        }

        session
    }

    fn new(keyspace: String) -> Session {
        Session {
            keyspace,
            state: Mutex::new(SessionState::Connecting),
            state_changed: Condvar::new(),
            connected: AtomicBool::new(false),
            conns: RwLock::new(Vec::new()),
            next_conn: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn establish(&self, hosts: &[SocketAddr], version: u8, num_conns: usize, policy: ReconnectPolicy) {
        if hosts.is_empty() {
            self.resolve(SessionEvent::Failed("no backend hosts".to_string()));
            return;
        }
        let mut attempt = 0u32;
        let mut last_err = String::from("no hosts");
        loop {
            let mut conns: Vec<Arc<PooledConn>> = Vec::with_capacity(num_conns);
            for i in 0..num_conns {
                let addr = hosts[i % hosts.len()];
                match PooledConn::open(addr, version, &self.keyspace) {
                    Ok(conn) => conns.push(Arc::new(conn)),
                    Err(e) => {
                        warn!(host = %addr, keyspace = %self.keyspace, error = %e, "backend connection failed");
                        last_err = e.to_string();
                    }
                }
            }

            if !conns.is_empty() {
                let opened = conns.len();
                *self.conns.write().unwrap() = conns;
                info!(keyspace = %self.keyspace, conns = opened, "session connected");
                self.resolve(SessionEvent::Connected);
                return;
            }

            attempt += 1;
            if attempt >= policy.max_attempts {
                warn!(keyspace = %self.keyspace, attempts = attempt, "session establishment failed");
                self.resolve(SessionEvent::Failed(last_err));
                return;
            }
            thread::sleep(policy.delay(attempt));
        }
    }

    fn resolve(&self, event: SessionEvent) {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            match &event {
                SessionEvent::Connected => {
                    self.connected.store(true, Ordering::Release);
                    *state = SessionState::Connected;
                }
                SessionEvent::Failed(msg) => *state = SessionState::Failed(msg.clone()),
            }
            self.state_changed.notify_all();
            std::mem::take(&mut *self.listeners.lock().unwrap())
        };
        for listener in &listeners {
            listener(&event);
        }
    }

    /// Non-blocking connectivity poll; this is the hot-path check and must
    /// never wait on a reconnecting session.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    /// The failure message, if establishment has already failed.
    pub fn failed_reason(&self) -> Option<String> {
        match &*self.state.lock().unwrap() {
            SessionState::Failed(msg) => Some(msg.clone()),
            _ => None,
        }
    }

    /// Block until establishment resolves, up to `timeout`.
    pub fn wait_ready(&self, timeout: Duration) -> std::result::Result<(), String> {
        let state = self.state.lock().unwrap();
        let (state, _timed_out) = self
            .state_changed
            .wait_timeout_while(state, timeout, |s| matches!(s, SessionState::Connecting))
            .unwrap();
        match &*state {
            SessionState::Connected => Ok(()),
            SessionState::Failed(msg) => Err(msg.clone()),
            SessionState::Connecting => Err("session establishment timed out".to_string()),
        }
    }

    /// Register a one-shot observer for the connected/failed transition. If
    /// the session has already resolved the observer fires immediately on
    /// the calling thread.
    pub fn subscribe(&self, listener: Listener) {
        let resolved = {
            let state = self.state.lock().unwrap();
            match &*state {
                SessionState::Connecting => {
                    self.listeners.lock().unwrap().push(listener);
                    return;
                }
                SessionState::Connected => SessionEvent::Connected,
                SessionState::Failed(msg) => SessionEvent::Failed(msg.clone()),
            }
        };
        // Fire outside the state lock.
        listener(&resolved);
    }

    /// Execute a raw frame against the first usable host in the query plan.
    /// A transport failure moves on to the next host only for idempotent
    /// requests.
    pub fn execute(&self, plan: &[SocketAddr], raw: &RawFrame, idempotent: bool) -> Result<RawFrame> {
        let conns: Vec<Arc<PooledConn>> = self.conns.read().unwrap().clone();
        if conns.is_empty() {
            return Err(ProxyError::NotConnected);
        }

        let mut last_err = None;
        let mut attempted = false;
        for &host in plan {
            let candidates: Vec<&Arc<PooledConn>> =
                conns.iter().filter(|c| c.addr == host).collect();
            if candidates.is_empty() {
                continue;
            }
            let pick = self.next_conn.fetch_add(1, Ordering::Relaxed) % candidates.len();
            attempted = true;
            match candidates[pick].execute(raw) {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    warn!(host = %host, error = %e, "backend request failed");
                    last_err = Some(e);
                    if !idempotent {
                        break;
                    }
                }
            }
        }

        // The plan may name hosts this pool has no connection to (it is
        // built from cluster topology, the pool from what actually opened).
        if !attempted {
            let pick = self.next_conn.fetch_add(1, Ordering::Relaxed) % conns.len();
            return conns[pick].execute(raw);
        }

        Err(last_err.unwrap_or(ProxyError::NoHostAvailable))
    }

    #[cfg(test)]
    pub(crate) fn stub(keyspace: &str) -> Arc<Session> {
        Arc::new(Session::new(keyspace.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn resolve_for_tests(&self, event: SessionEvent) {
        self.resolve(event);
    }
}

/// One backend connection. The stream mutex is held across a full
/// send/receive exchange, so each connection carries one request at a time
/// and stream id 0 can be reused for every forwarded frame.
struct PooledConn {
    addr: SocketAddr,
    stream: Mutex<TcpStream>,
}

impl PooledConn {
    fn open(addr: SocketAddr, version: u8, keyspace: &str) -> Result<PooledConn> {
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        handshake(&mut stream, version)?;

        if !keyspace.is_empty() {
            let resp = exchange(
                &mut stream,
                &query_frame(version, 0, &format!("USE \"{}\"", keyspace)),
            )?;
            match decode_response(&resp)? {
                Response::Result(ResultBody::SetKeyspace(_)) | Response::Result(ResultBody::Void) => {}
                Response::Error { code, message } => {
                    return Err(ProxyError::Backend { code, message })
                }
                _ => return Err(ProxyError::UnexpectedResponse),
            }
        }

        Ok(PooledConn {
            addr,
            stream: Mutex::new(stream),
        })
    }

    fn execute(&self, raw: &RawFrame) -> Result<RawFrame> {
        let mut stream = self.stream.lock().unwrap();
        let mut forwarded = raw.clone();
        forwarded.header.stream = 0;
        forwarded.write_to(&mut *stream)?;
        loop {
            match RawFrame::read_from(&mut *stream)? {
                None => return Err(ProxyError::Closed),
                Some(frame) if frame.header.stream == -1 => continue, // unsolicited event
                Some(mut frame) => {
                    frame.header.stream = raw.header.stream;
                    return Ok(frame);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod cluster_tests {
    use super::*;

    #[test]
    fn test_reconnect_policy_doubles_and_caps() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: 8,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500)); // capped
        assert_eq!(policy.delay(30), Duration::from_millis(500));
    }

    #[test]
    fn test_round_robin_rotates_full_plan() {
        let hosts: Vec<SocketAddr> = vec![
            "10.0.0.1:9042".parse().unwrap(),
            "10.0.0.2:9042".parse().unwrap(),
            "10.0.0.3:9042".parse().unwrap(),
        ];
        let lb = RoundRobinLoadBalancer::new(hosts.clone());

        let plan1 = lb.new_query_plan();
        let plan2 = lb.new_query_plan();
        assert_eq!(plan1.len(), 3);
        assert_eq!(plan2.len(), 3);
        assert_eq!(plan1[0], hosts[0]);
        assert_eq!(plan2[0], hosts[1]);
        // Every plan covers every host.
        for host in &hosts {
            assert!(plan1.contains(host));
            assert!(plan2.contains(host));
        }
    }

    #[test]
    fn test_round_robin_empty_hosts() {
        let lb = RoundRobinLoadBalancer::new(Vec::new());
        assert!(lb.new_query_plan().is_empty());
    }

    #[test]
    fn test_session_state_transitions() {
        let session = Session::stub("ks1");
        assert!(!session.is_connected());

        session.resolve_for_tests(SessionEvent::Connected);
        assert!(session.is_connected());
        assert!(session.wait_ready(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_session_failure_reported_to_waiters() {
        let session = Session::stub("ks1");
        session.resolve_for_tests(SessionEvent::Failed("refused".to_string()));
        assert!(!session.is_connected());
        assert_eq!(
            session.wait_ready(Duration::from_millis(10)),
            Err("refused".to_string())
        );
    }

    #[test]
    fn test_subscribe_fires_immediately_when_resolved() {
        use std::sync::atomic::AtomicUsize;

        let session = Session::stub("ks1");
        session.resolve_for_tests(SessionEvent::Connected);

        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        session.subscribe(Box::new(move |event| {
            assert!(matches!(event, SessionEvent::Connected));
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_fires_on_transition() {
        use std::sync::atomic::AtomicUsize;

        let session = Session::stub("ks1");
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        session.subscribe(Box::new(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        session.resolve_for_tests(SessionEvent::Connected);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
