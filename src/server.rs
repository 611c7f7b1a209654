//! Server layer: acceptor + worker pool + connection registry.
//!
//! The server lives on the accepting (base) loop: the acceptor's channel
//! fires there, new connections are handed off round-robin to worker
//! loops, and registry mutations always route back through the base loop.

use crate::acceptor::Acceptor;
use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::config::Config;
use crate::connection::TcpConnection;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;
use crate::stats::ServerStats;
use crate::thread_pool::EventLoopThreadPool;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A TCP server: listening socket on the base loop, connections on
/// worker loops, and the name-keyed registry that owns them.
pub struct TcpServer {
    base_loop: LoopHandle,
    name: String,
    local_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    pool: Arc<EventLoopThreadPool>,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    high_water_mark: usize,
    stats: ServerStats,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<HighWaterMarkCallback>>,
}

impl TcpServer {
    /// Bind the listening socket and prepare the worker pool. Nothing is
    /// accepted until [`start`](Self::start).
    pub fn bind(base_loop: &LoopHandle, config: &Config) -> io::Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let acceptor = Acceptor::new(
            base_loop.clone(),
            config.address,
            config.backlog,
            config.reuse_address,
            config.reuse_port,
        )?;
        let local_addr = acceptor.local_addr()?;
        let pool = Arc::new(EventLoopThreadPool::new(
            base_loop.clone(),
            config.name.clone(),
            config.worker_loops(),
        ));

        let server = Arc::new(Self {
            base_loop: base_loop.clone(),
            name: config.name.clone(),
            local_addr,
            acceptor,
            pool,
            connections: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
            high_water_mark: config.high_water_mark,
            stats: ServerStats::new(),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
        });

        let weak: Weak<TcpServer> = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Arc::new(move |socket, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer);
                }
            }));

        Ok(server)
    }

    /// Launch the worker loops and start accepting. Idempotent.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.pool.start()?;
            let acceptor = self.acceptor.clone();
            self.base_loop.run_in_loop(move || acceptor.listen());
            tracing::info!("server '{}' listening on {}", self.name, self.local_addr);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound listening address (port resolved when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_loop(&self) -> &LoopHandle {
        &self.base_loop
    }

    /// Worker loops backing this server; empty in single-reactor mode.
    pub fn worker_loops(&self) -> Vec<LoopHandle> {
        self.pool.loops()
    }

    /// Number of live connections in the registry.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        *self.connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, &mut crate::buffer::Buffer, std::time::Instant)
            + Send
            + Sync
            + 'static,
    ) {
        *self.message_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        *self.write_complete_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
    ) {
        *self.high_water_mark_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Runs on the base loop for every accepted socket.
    fn new_connection(self: &Arc<Self>, socket: Socket, peer: SocketAddr) {
        self.base_loop.assert_in_loop_thread();

        let worker = self.pool.next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}-{}#{}", self.name, self.local_addr, id);
        let local = socket.local_addr().unwrap_or(self.local_addr);
        tracing::info!("server '{}': connection [{}] from {}", self.name, name, peer);

        let conn = TcpConnection::new(worker.clone(), name.clone(), socket, local, peer);
        conn.set_connection_callback(
            self.connection_cb
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Arc::new(default_connection_callback)),
        );
        conn.set_message_callback(
            self.message_cb
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Arc::new(default_message_callback)),
        );
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        if let Some(cb) = self.high_water_mark_cb.lock().unwrap().clone() {
            conn.set_high_water_mark_callback(cb);
        }
        conn.set_high_water_mark(self.high_water_mark);

        let weak: Weak<TcpServer> = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections.lock().unwrap().insert(name, conn.clone());
        self.stats.inc_accepted();

        worker.run_in_loop(move || conn.connect_established());
    }

    /// Invoked from the connection's close path on its worker loop;
    /// registry mutation belongs to the base loop.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        let server = self.clone();
        let conn = conn.clone();
        self.base_loop
            .run_in_loop(move || server.remove_connection_in_base(conn));
    }

    fn remove_connection_in_base(&self, conn: TcpConnectionPtr) {
        self.base_loop.assert_in_loop_thread();
        tracing::info!("server '{}': removing connection [{}]", self.name, conn.name());

        let removed = self.connections.lock().unwrap().remove(conn.name());
        if removed.is_some() {
            self.stats.dec_active();
        }

        // queue (not run) so the connection outlives the registry erase
        // even when worker and base are the same loop.
        let worker = conn.loop_handle().clone();
        worker.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        tracing::info!("server '{}' shutting down", self.name);

        let acceptor = self.acceptor.clone();
        self.base_loop.run_in_loop(move || acceptor.stop());

        let connections: Vec<TcpConnectionPtr> = {
            let mut map = self.connections.lock().unwrap();
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            self.stats.dec_active();
            let worker = conn.loop_handle().clone();
            worker.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
