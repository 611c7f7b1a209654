//! Multi-reactor TCP networking library.
//!
//! One event loop per thread, each owning a readiness multiplexer; an
//! accepting loop hands new connections to worker loops round-robin; any
//! thread reaches a loop through its handle's task queue plus an eventfd
//! wakeup. Connections are state machines pinned to exactly one loop and
//! driven through user callbacks.
//!
//! # Example
//!
//! ```no_run
//! use kiln::{Config, EventLoop, TcpServer};
//!
//! let config = Config::for_address("127.0.0.1:7000".parse().unwrap());
//! let mut base_loop = EventLoop::new().unwrap();
//! let server = TcpServer::bind(&base_loop.handle(), &config).unwrap();
//! server.set_message_callback(|conn, buf, _when| {
//!     let data = buf.retrieve_all();
//!     conn.send(&data); // echo
//! });
//! server.start().unwrap();
//! base_loop.run();
//! ```

pub mod acceptor;
pub mod buffer;
pub mod callbacks;
pub(crate) mod channel;
pub mod config;
pub mod connection;
pub mod event_loop;
pub mod event_loop_thread;
pub mod logging;
pub(crate) mod poller;
pub mod server;
pub mod socket;
pub mod stats;
pub mod thread;
pub mod thread_pool;

pub use buffer::Buffer;
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use config::{Config, LoggingConfig, WorkerLoops};
pub use connection::{ConnState, TcpConnection};
pub use event_loop::{EventLoop, LoopHandle};
pub use event_loop_thread::EventLoopThread;
pub use server::TcpServer;
pub use thread_pool::EventLoopThreadPool;
