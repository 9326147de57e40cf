//! Connection handling and request dispatch.
//!
//! Each client connection gets a reader thread that decodes frames and
//! dispatches them. System-table reads, `USE`, and protocol negotiation are
//! answered locally from cached cluster metadata; everything else is handed
//! to a bounded worker pool that forwards it over a per-keyspace backend
//! session. One reply per request, always, carrying the client's stream id.

use std::io::{BufReader, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::cluster::{
    Authenticator, Cluster, ClusterConfig, ReconnectPolicy, RoundRobinLoadBalancer, Session,
    SessionConfig,
};
use crate::error::{ProxyError, Result};
use crate::frame::{
    decode_client_message, error_code, error_frame, ready_frame, rows_result_frame,
    supported_frame, void_result_frame, ClientMessage, RawFrame, MAX_VERSION, VERSION_MASK,
};
use crate::metrics::Metrics;
use crate::parse::{classify, Statement};
use crate::registry::{SessionEntry, SessionRegistry};
use crate::system::LocalRowCache;
use crate::worker::WorkerPool;

/// Cap on requests being executed or queued for execution at once.
pub const MAX_WORKERS: usize = 2048;

/// Default wait for a keyspace switch's session to come up.
pub const SESSION_READY_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub contact_points: Vec<SocketAddr>,
    /// Protocol version requested from the backend.
    pub version: u8,
    /// Pooled backend connections per keyspace session.
    pub num_conns: usize,
    pub reconnect: ReconnectPolicy,
    pub auth: Option<Authenticator>,
    /// How long `USE` (and startup) waits for a session to come up.
    pub session_ready_timeout: Duration,
}

// ============================================================================
// Proxy
// ============================================================================

pub struct Proxy {
    config: ProxyConfig,
    cluster: Cluster,
    lb: RoundRobinLoadBalancer,
    registry: SessionRegistry,
    pool: WorkerPool<Request>,
    local_rows: LocalRowCache,
    metrics: Option<Arc<Metrics>>,
    listener: TcpListener,
}

impl Proxy {
    /// Connect to the backend, warm the no-keyspace session, and bind the
    /// listening socket. The listener is not bound until the default
    /// session is usable, so a client accepted by `serve` can always be
    /// served.
    pub fn listen(config: ProxyConfig, metrics: Option<Arc<Metrics>>) -> Result<Arc<Proxy>> {
        let cluster = Cluster::connect(&ClusterConfig {
            version: config.version,
            contact_points: config.contact_points.clone(),
            reconnect: config.reconnect,
            auth: config.auth.clone(),
        })?;
        let local_rows = LocalRowCache::build(&cluster.info, cluster.negotiated_version);
        let lb = RoundRobinLoadBalancer::new(cluster.hosts.clone());
        let pool = WorkerPool::new(MAX_WORKERS, |request: Request| request.run());

        // The no-keyspace session must exist before any client does.
        let session = Session::connect(
            &cluster,
            SessionConfig {
                keyspace: String::new(),
                num_conns: config.num_conns,
                reconnect: config.reconnect,
            },
        );
        if let Err(reason) = session.wait_ready(config.session_ready_timeout) {
            return Err(ProxyError::SessionUnavailable {
                keyspace: String::new(),
                reason,
            });
        }
        let registry = SessionRegistry::new();
        registry.insert("", SessionEntry::new(session, pool.clone()));

        let listener = TcpListener::bind(config.listen)?;
        info!(listen = %listener.local_addr()?, "proxy listening");

        Ok(Arc::new(Proxy {
            config,
            cluster,
            lb,
            registry,
            pool,
            local_rows,
            metrics,
            listener,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Blocks the calling thread; each accepted client gets
    /// its own reader thread.
    pub fn serve(self: Arc<Self>) {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
                    if let Some(m) = &self.metrics {
                        m.record_connection();
                    }
                    let proxy = Arc::clone(&self);
                    let spawned = thread::Builder::new()
                        .name(format!("client-{}", client_id))
                        .spawn(move || {
                            if let Err(e) = handle_client(proxy, stream, client_id) {
                                error!(client_id, error = %e, "client connection failed");
                            }
                        });
                    if let Err(e) = spawned {
                        error!(error = %e, "unable to spawn client thread");
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }

    fn session_for_keyspace(&self, keyspace: &str) -> Arc<SessionEntry> {
        self.registry.get_or_create(keyspace, || {
            let session = Session::connect(
                &self.cluster,
                SessionConfig {
                    keyspace: keyspace.to_string(),
                    num_conns: self.config.num_conns,
                    reconnect: self.config.reconnect,
                },
            );
            SessionEntry::new(session, self.pool.clone())
        })
    }
}

fn handle_client(proxy: Arc<Proxy>, stream: TcpStream, client_id: usize) -> Result<()> {
    stream.set_nodelay(true)?;
    let local_ip = stream.local_addr()?.ip();
    let writer = ConnWriter::new(stream.try_clone()?);
    let mut reader = BufReader::new(stream);

    let mut conn = ClientConn {
        proxy,
        writer,
        keyspace: String::new(),
        local_ip,
        client_id,
    };

    loop {
        match RawFrame::read_from(&mut reader)? {
            None => {
                debug!(client_id, "client disconnected");
                return Ok(());
            }
            Some(raw) => conn.dispatch(raw)?,
        }
    }
}

// ============================================================================
// Client connection
// ============================================================================

/// Shared write half of a client socket. Workers and the reader thread both
/// reply through this; the mutex keeps frames from interleaving.
#[derive(Clone)]
pub struct ConnWriter {
    stream: Arc<Mutex<TcpStream>>,
}

impl ConnWriter {
    fn new(stream: TcpStream) -> Self {
        ConnWriter {
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    /// Best effort: a client that hung up mid-flight is not an error worth
    /// propagating out of a worker.
    pub fn send(&self, frame: &RawFrame) {
        let mut stream = self.stream.lock().unwrap();
        let result = frame
            .write_to(&mut *stream)
            .and_then(|_| stream.flush().map_err(ProxyError::from));
        if let Err(e) = result {
            debug!(error = %e, "reply write failed");
        }
    }
}

struct ClientConn {
    proxy: Arc<Proxy>,
    writer: ConnWriter,
    /// Keyspace adopted by the most recent successful `USE`.
    keyspace: String,
    local_ip: IpAddr,
    client_id: usize,
}

impl ClientConn {
    /// Handle one client frame. `Err` tears the connection down; a request
    /// the proxy can answer or refuse politely is always `Ok`.
    fn dispatch(&mut self, raw: RawFrame) -> Result<()> {
        if let Some(m) = &self.proxy.metrics {
            m.record_frame();
        }

        let version = raw.header.version & VERSION_MASK;
        let stream = raw.header.stream;

        if version > MAX_VERSION {
            if let Some(m) = &self.proxy.metrics {
                m.record_protocol_error();
            }
            // Reply in a version the client is guaranteed to parse.
            self.writer.send(&error_frame(
                MAX_VERSION,
                stream,
                error_code::PROTOCOL_ERROR,
                "Invalid or unsupported protocol version",
            ));
            return Ok(());
        }

        match decode_client_message(&raw)? {
            ClientMessage::Options => {
                self.writer.send(&supported_frame(
                    version,
                    stream,
                    &[("CQL_VERSION", &["3.0.0"]), ("COMPRESSION", &[])],
                ));
            }
            ClientMessage::Startup | ClientMessage::Register => {
                self.writer.send(&ready_frame(version, stream));
            }
            ClientMessage::Prepare { query } => self.handle_prepare(version, stream, &query),
            ClientMessage::Execute { .. } => {
                self.writer.send(&error_frame(
                    version,
                    stream,
                    error_code::SERVER_ERROR,
                    "Proxy: prepared statement execution is not supported",
                ));
            }
            ClientMessage::Query { query } => self.handle_query(raw, &query),
            ClientMessage::Other(op) => {
                if let Some(m) = &self.proxy.metrics {
                    m.record_protocol_error();
                }
                debug!(client_id = self.client_id, opcode = op, "unsupported opcode");
                self.writer.send(&error_frame(
                    version,
                    stream,
                    error_code::PROTOCOL_ERROR,
                    "Unsupported operation",
                ));
            }
        }
        Ok(())
    }

    fn handle_prepare(&self, version: u8, stream: i16, query: &str) {
        let classified = classify(&self.keyspace, query);
        let message = if classified.handled {
            match classified.statement {
                Statement::Passthrough => "Proxy attempted to intercept an unhandled query",
                _ => "Proxy: cannot prepare an intercepted query",
            }
        } else {
            "Proxy: prepare pass-through is not supported"
        };
        self.writer
            .send(&error_frame(version, stream, error_code::SERVER_ERROR, message));
    }

    fn handle_query(&mut self, raw: RawFrame, query: &str) {
        let version = raw.header.version & VERSION_MASK;
        let stream = raw.header.stream;
        let classified = classify(&self.keyspace, query);
        debug!(
            client_id = self.client_id,
            handled = classified.handled,
            query,
            "query"
        );

        if !classified.handled {
            self.execute_backend(raw, classified.idempotent);
            return;
        }

        if let Some(m) = &self.proxy.metrics {
            m.record_intercepted();
        }
        match classified.statement {
            Statement::Select { table, selectors } => {
                self.intercept_select(version, stream, &table, &selectors)
            }
            Statement::Use { keyspace } => self.switch_keyspace(version, stream, &keyspace),
            Statement::ErrorSelect { message } => {
                self.writer
                    .send(&error_frame(version, stream, error_code::INVALID, &message));
            }
            Statement::Passthrough => {
                // classify never marks a passthrough handled; reaching this
                // arm is a bug in the classifier.
                self.writer.send(&error_frame(
                    version,
                    stream,
                    error_code::SERVER_ERROR,
                    "Proxy attempted to intercept an unhandled query",
                ));
            }
        }
    }

    fn intercept_select(
        &self,
        version: u8,
        stream: i16,
        table: &str,
        selectors: &[crate::parse::Selector],
    ) {
        let cache = &self.proxy.local_rows;
        let evaluated = match table {
            "local" => crate::system::evaluate_selectors(
                selectors,
                Some(cache),
                cache.local_schema(),
                "local",
                1,
                Some(self.local_ip),
            )
            .map(|(row, columns)| (vec![row], columns)),
            "peers" => crate::system::evaluate_selectors(
                selectors,
                None,
                cache.peers_schema(),
                "peers",
                0,
                None,
            )
            .map(|(row, columns)| {
                // No peers are published; only an aggregate yields a row.
                if crate::system::contains_aggregate(selectors) {
                    (vec![row], columns)
                } else {
                    (Vec::new(), columns)
                }
            }),
            other => {
                self.writer.send(&error_frame(
                    version,
                    stream,
                    error_code::INVALID,
                    &format!("Doesn't exist: system.{}", other),
                ));
                return;
            }
        };

        match evaluated {
            Ok((rows, columns)) => {
                self.writer
                    .send(&rows_result_frame(version, stream, &columns, &rows));
            }
            Err(message) => {
                self.writer
                    .send(&error_frame(version, stream, error_code::INVALID, &message));
            }
        }
    }

    /// A keyspace is adopted only once its session is known good; on
    /// failure the client stays on its previous keyspace. Only a session
    /// that has resolved `Failed` is evicted (so a later `USE` retries);
    /// a session that merely outlasted the wait is still connecting, and
    /// dropping its entry would spawn a duplicate establishment for the
    /// same keyspace on the next `USE`.
    fn switch_keyspace(&mut self, version: u8, stream: i16, keyspace: &str) {
        let entry = self.proxy.session_for_keyspace(keyspace);
        match entry.session.wait_ready(self.proxy.config.session_ready_timeout) {
            Ok(()) => {
                self.keyspace = keyspace.to_string();
                self.writer.send(&void_result_frame(version, stream));
            }
            Err(reason) => {
                warn!(
                    client_id = self.client_id,
                    keyspace,
                    reason = %reason,
                    "keyspace switch refused"
                );
                if entry.session.failed_reason().is_some() {
                    self.proxy.registry.remove(keyspace);
                }
                self.writer.send(&error_frame(
                    version,
                    stream,
                    error_code::SERVER_ERROR,
                    &format!("Proxy: unable to create session for keyspace: {}", reason),
                ));
            }
        }
    }

    fn execute_backend(&self, raw: RawFrame, idempotent: bool) {
        let Some(entry) = self.proxy.registry.get(&self.keyspace) else {
            // The entry can only be missing if a failed switch removed it
            // out from under this connection.
            let version = raw.header.version & VERSION_MASK;
            self.writer.send(&error_frame(
                version,
                raw.header.stream,
                error_code::SERVER_ERROR,
                "Proxy: Attempt to use invalid keyspace",
            ));
            return;
        };

        let request = Request {
            session: Arc::clone(&entry.session),
            writer: self.writer.clone(),
            raw,
            idempotent,
            plan: self.proxy.lb.new_query_plan(),
            metrics: self.proxy.metrics.clone(),
            started: Instant::now(),
        };

        if entry.session.is_connected() {
            if let Err(rejected) = self.proxy.pool.submit(request) {
                rejected.reject_overloaded("Proxy: Too many requests");
            }
            return;
        }

        match entry.push_pending(request) {
            Ok(()) => {
                // The session may have resolved between the poll above and
                // the push; drain (or fail) so the request cannot sit in a
                // queue no callback will ever visit again.
                if entry.session.is_connected() {
                    entry.drain_now();
                } else if let Some(reason) = entry.session.failed_reason() {
                    entry.fail_pending(&reason);
                }
            }
            Err(rejected) => {
                rejected.reject_overloaded("Proxy: Too many requests during keyspace change")
            }
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// One forwarded request. Completion consumes the request, so exactly one
/// reply reaches the client no matter which path finishes it.
pub struct Request {
    session: Arc<Session>,
    writer: ConnWriter,
    raw: RawFrame,
    idempotent: bool,
    plan: Vec<SocketAddr>,
    metrics: Option<Arc<Metrics>>,
    started: Instant,
}

impl Request {
    pub fn run(self) {
        let version = self.raw.header.version & VERSION_MASK;
        let stream = self.raw.header.stream;
        match self.session.execute(&self.plan, &self.raw, self.idempotent) {
            Ok(response) => {
                if let Some(m) = &self.metrics {
                    m.record_forwarded(self.started.elapsed().as_millis() as u64);
                }
                self.writer.send(&response);
            }
            Err(e) => {
                self.writer.send(&error_frame(
                    version,
                    stream,
                    error_code::SERVER_ERROR,
                    &format!("Proxy: {}", e),
                ));
            }
        }
    }

    pub fn reject_overloaded(self, message: &str) {
        if let Some(m) = &self.metrics {
            m.record_overloaded();
        }
        self.reply_error(error_code::OVERLOADED, message);
    }

    pub fn reject_server_error(self, message: &str) {
        self.reply_error(error_code::SERVER_ERROR, message);
    }

    fn reply_error(self, code: i32, message: &str) {
        let version = self.raw.header.version & VERSION_MASK;
        self.writer
            .send(&error_frame(version, self.raw.header.stream, code, message));
    }

    #[cfg(test)]
    pub(crate) fn stub_with_writer(writer: ConnWriter) -> Request {
        use crate::frame::{opcode, Header};

        Request {
            session: Session::stub("ks_stub"),
            writer,
            raw: RawFrame::new(
                Header {
                    version: MAX_VERSION,
                    flags: 0,
                    stream: 1,
                    opcode: opcode::QUERY,
                },
                Vec::new(),
            ),
            idempotent: false,
            plan: Vec::new(),
            metrics: None,
            started: Instant::now(),
        }
    }
}

/// Writer over a loopback pair, returned with the read side so a test can
/// observe the frames written through it.
#[cfg(test)]
pub(crate) fn stub_writer_pair() -> (ConnWriter, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let stream = TcpStream::connect(addr).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    accepted
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    (ConnWriter::new(stream), accepted)
}

/// Writer whose read side is discarded; replies sent through it go nowhere.
#[cfg(test)]
pub(crate) fn stub_writer() -> ConnWriter {
    stub_writer_pair().0
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod request_tests {
    use super::*;
    use crate::frame::{decode_response, Response};

    #[test]
    fn test_overload_rejection_replies_overloaded() {
        let (writer, mut read_side) = stub_writer_pair();
        let request = Request::stub_with_writer(writer);

        request.reject_overloaded("Proxy: Too many requests");

        let reply = RawFrame::read_from(&mut read_side).unwrap().unwrap();
        assert_eq!(reply.header.stream, 1);
        match decode_response(&reply).unwrap() {
            Response::Error { code, message } => {
                assert_eq!(code, error_code::OVERLOADED);
                assert_eq!(message, "Proxy: Too many requests");
            }
            other => panic!("expected error reply, got {:?}", other),
        }
    }

    #[test]
    fn test_server_error_rejection_carries_message() {
        let (writer, mut read_side) = stub_writer_pair();
        let request = Request::stub_with_writer(writer);

        request.reject_server_error("Proxy: keyspace session unavailable: refused");

        let reply = RawFrame::read_from(&mut read_side).unwrap().unwrap();
        match decode_response(&reply).unwrap() {
            Response::Error { code, message } => {
                assert_eq!(code, error_code::SERVER_ERROR);
                assert_eq!(message, "Proxy: keyspace session unavailable: refused");
            }
            other => panic!("expected error reply, got {:?}", other),
        }
    }
}
