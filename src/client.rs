//! Client-side connection establishment.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream},
    time::Duration,
};

use crate::{
    connection::ConnectionState,
    kex::{self, ClientKey},
    Error, Result, KEX_SKEW_MAX,
};

/// Connect to an IPv4 server and run the key exchange, returning the
/// established channel.
///
/// The server is authenticated against `key`, obtained out of band; the
/// client stays anonymous.
pub fn connect_ipv4(address: Ipv4Addr, port: u16, key: &ClientKey) -> Result<ConnectionState> {
    connect((address, port).into(), key)
}

/// Connect to an IPv6 server and run the key exchange, returning the
/// established channel.
///
/// The server is authenticated against `key`, obtained out of band; the
/// client stays anonymous.
pub fn connect_ipv6(address: Ipv6Addr, port: u16, key: &ClientKey) -> Result<ConnectionState> {
    connect((address, port).into(), key)
}

fn connect(address: SocketAddr, key: &ClientKey) -> Result<ConnectionState> {
    let stream = TcpStream::connect(address).map_err(|error| {
        tracing::warn!("Failed to connect to `{address}`: {error}");

        Error::ConnectionFailure
    })?;

    let mut cns = ConnectionState::new(stream, 0)?;

    cns.set_read_timeout(Some(Duration::from_secs(KEX_SKEW_MAX)))?;
    if let Err(error) = kex::client::key_exchange(&mut cns, key) {
        tracing::warn!("Key exchange with `{address}` failed: {error}");

        cns.close(None, false);

        return Err(error);
    }
    cns.set_read_timeout(None)?;

    Ok(cns)
}
