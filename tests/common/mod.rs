#![allow(dead_code)]

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{mpsc, Mutex},
    thread,
    time::Duration,
};

use qsmp::{
    client,
    connection::ConnectionState,
    kex::{ClientKey, ServerKey},
    server::Server,
};

/// A served instance bound to an ephemeral port, with the stream of
/// messages its sink received.
pub struct TestServer {
    pub address: SocketAddr,
    pub key: ClientKey,
    pub server: Server,
    pub messages: mpsc::Receiver<(u32, Vec<u8>)>,
}

/// Spin up a server on an ephemeral port and wait for its listener.
pub fn server() -> TestServer {
    let key = ServerKey::generate(Duration::from_secs(3600));
    let public = key.client_key();
    let server = Server::with_port(key, 0);

    let (sender, messages) = mpsc::channel();
    let sender = Mutex::new(sender);

    {
        let server = server.clone();

        thread::spawn(move || {
            server
                .start_ipv4(move |instance: u32, message: &[u8]| {
                    let _ = sender
                        .lock()
                        .expect("sender lock poisonned")
                        .send((instance, message.to_vec()));
                })
                .expect("the server failed to start");
        });
    }

    let address = loop {
        if let Some(address) = server.local_addr() {
            break address;
        }

        thread::sleep(Duration::from_millis(10));
    };

    TestServer {
        address,
        key: public,
        server,
        messages,
    }
}

/// Connect a client to the test server and complete the key exchange.
pub fn connect(server: &TestServer) -> ConnectionState {
    client::connect_ipv4(Ipv4Addr::LOCALHOST, server.address.port(), &server.key)
        .expect("the key exchange failed")
}

/// Install the tracing subscriber honoring `RUST_LOG`.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}
