//! Round-robin connection assignment across worker loops.

use kiln::{Config, EventLoopThread, TcpServer};
use std::net::TcpStream;
use std::sync::{mpsc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

#[test]
fn test_two_workers_round_robin() {
    let mut base = EventLoopThread::new("rr-base");
    let base_handle = base.start().unwrap();

    let mut config = Config::for_address("127.0.0.1:0".parse().unwrap());
    config.worker_loops = kiln::config::WorkerLoops::Count(2);
    let server = TcpServer::bind(&base_handle, &config).unwrap();

    let (tx, rx) = mpsc::channel::<ThreadId>();
    let tx = Mutex::new(tx);
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            let _ = tx.lock().unwrap().send(std::thread::current().id());
        }
    });
    server.start().unwrap();
    let addr = server.local_addr();

    // The base loop's thread id, for contrast with the workers.
    let (base_tx, base_rx) = mpsc::channel();
    base_handle.run_in_loop(move || {
        let _ = base_tx.send(std::thread::current().id());
    });
    let base_tid = base_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Sequential connects so assignment order is deterministic.
    let _c1 = TcpStream::connect(addr).unwrap();
    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let _c2 = TcpStream::connect(addr).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let _c3 = TcpStream::connect(addr).unwrap();
    let third = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Two workers: distinct threads, neither is the accepting loop, and
    // the third connection wraps back to the first worker.
    assert_ne!(first, second);
    assert_ne!(first, base_tid);
    assert_ne!(second, base_tid);
    assert_eq!(third, first);

    assert_eq!(server.connection_count(), 3);
    drop(server);
}

#[test]
fn test_zero_workers_collapses_to_accepting_loop() {
    let mut base = EventLoopThread::new("single-base");
    let base_handle = base.start().unwrap();

    let config = Config::for_address("127.0.0.1:0".parse().unwrap());
    let server = TcpServer::bind(&base_handle, &config).unwrap();

    let (tx, rx) = mpsc::channel::<ThreadId>();
    let tx = Mutex::new(tx);
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            let _ = tx.lock().unwrap().send(std::thread::current().id());
        }
    });
    server.start().unwrap();
    assert!(server.worker_loops().is_empty());

    let (base_tx, base_rx) = mpsc::channel();
    base_handle.run_in_loop(move || {
        let _ = base_tx.send(std::thread::current().id());
    });
    let base_tid = base_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let _client = TcpStream::connect(server.local_addr()).unwrap();
    let conn_tid = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(conn_tid, base_tid);
}
