//! Bind contract for the debug-protocol socket.
//!
//! The debug protocol itself is served elsewhere; the supervisor only owns
//! the bound socket for the lifetime of a launch and closes it on teardown.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener},
};

use tracing::info;

/// A bound debug-protocol socket. Dropping it closes the socket.
#[derive(Debug)]
pub struct DebugListener {
    listener: TcpListener,
}

impl DebugListener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Factory seam so embedders (and tests) can swap the socket implementation.
pub trait DebugSocketFactory: Send {
    fn bind(&self, port: u16) -> io::Result<DebugListener>;
}

/// Default factory: loopback bind, IPv4 first with IPv6 as fallback.
#[derive(Debug, Default)]
pub struct LoopbackSocketFactory;

impl DebugSocketFactory for LoopbackSocketFactory {
    fn bind(&self, port: u16) -> io::Result<DebugListener> {
        let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => listener,
            Err(_) => TcpListener::bind((Ipv6Addr::LOCALHOST, port))?,
        };

        info!(port, "debug socket listening");
        Ok(DebugListener { listener })
    }
}
