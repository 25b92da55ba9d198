use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use crate::error::{Error, Result};

use super::connection::RecvHandler;
use super::protocol::Protocol;

/// State a finished handshake drops a connection into, per
/// direction. `Raw` connections wait for the application to promote
/// them; `Active` ones immediately poll their pool for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartState {
    Raw,
    Passive,
    Active,
}

/// Per-direction start options.
#[derive(Debug, Clone, Copy)]
pub struct SideConfiguration {
    pub start_state: StartState,
    pub start_secure: bool,
}

/// Asynchronous name resolution, injected so the reactor never blocks
/// on DNS. The callback runs on the resolver's thread; callers bounce
/// the outcome back to the owning reactor as an event.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(
        &self,
        name: &str,
        default_port: u16,
        done: Box<dyn FnOnce(Result<Vec<SocketAddr>>) + Send>,
    );
}

/// Default resolver: one short-lived thread per lookup around the
/// blocking std resolver.
pub struct ThreadResolver;

impl Resolver for ThreadResolver {
    fn resolve(
        &self,
        name: &str,
        default_port: u16,
        done: Box<dyn FnOnce(Result<Vec<SocketAddr>>) + Send>,
    ) {
        let name = name.to_owned();
        thread::spawn(move || {
            let target = if name.contains(':') {
                name.clone()
            } else {
                format!("{}:{}", name, default_port)
            };
            let res = match target.to_socket_addrs() {
                Ok(addrs) => {
                    // reversed so pop() walks the list in resolver order
                    let mut v: Vec<_> = addrs.collect();
                    v.reverse();
                    if v.is_empty() {
                        Err(Error::Resolve)
                    } else {
                        Ok(v)
                    }
                }
                Err(_) => Err(Error::Resolve),
            };
            done(res);
        });
    }
}

/// Service configuration. Built once, validated in `Service::start`,
/// then shared read-only by every connection.
#[derive(Clone)]
pub struct Configuration {
    pub listener_address: Option<SocketAddr>,
    pub connections_per_pool: usize,
    /// Receive buffer capacity in KiB, at most 64.
    pub connection_recv_buffer_capacity_kb: u8,
    /// Send buffer capacity in KiB, at most 64.
    pub connection_send_buffer_capacity_kb: u8,
    /// Receive buffers a connection may have parked with relays.
    pub connection_relay_buffer_count: u16,
    /// Seconds of silence a server tolerates before closing; zero
    /// disables the inactivity timer.
    pub inactivity_timeout_seconds: u32,
    /// Seconds of outbound idle before a client probes; zero
    /// disables keepalives.
    pub keepalive_timeout_seconds: u32,
    /// Consecutive keepalives a server accepts with nothing else in
    /// between.
    pub inactivity_keepalive_count: u32,
    /// In-flight outbound messages per connection.
    pub writer_message_count: usize,
    /// Send buffers that may be in flight before the peer must ack.
    pub writer_flow_credit: u32,
    /// Reject packets with non-zero reserved fields.
    pub strict_decode: bool,
    pub relay_enabled: bool,
    pub server: SideConfiguration,
    pub client: SideConfiguration,
    /// Default port appended to peer names without one.
    pub default_port: u16,
    pub protocol: Arc<dyn Protocol>,
    pub resolver: Arc<dyn Resolver>,
    pub on_message: Option<RecvHandler>,
    #[cfg(feature = "tls")]
    pub tls_client: Option<Arc<rustls::ClientConfig>>,
    #[cfg(feature = "tls")]
    pub tls_server: Option<Arc<rustls::ServerConfig>>,
    /// Server name presented for certificate checks on outgoing TLS.
    #[cfg(feature = "tls")]
    pub tls_server_name: String,
}

impl Configuration {
    pub fn new(protocol: Arc<dyn Protocol>) -> Configuration {
        Configuration {
            listener_address: None,
            connections_per_pool: 1,
            connection_recv_buffer_capacity_kb: 8,
            connection_send_buffer_capacity_kb: 8,
            connection_relay_buffer_count: 8,
            inactivity_timeout_seconds: 60 * 20,
            keepalive_timeout_seconds: 60 * 5,
            inactivity_keepalive_count: 2,
            writer_message_count: 64,
            writer_flow_credit: 8,
            strict_decode: true,
            relay_enabled: false,
            server: SideConfiguration {
                start_state: StartState::Active,
                start_secure: false,
            },
            client: SideConfiguration {
                start_state: StartState::Active,
                start_secure: false,
            },
            default_port: 0,
            protocol,
            resolver: Arc::new(ThreadResolver),
            on_message: None,
            #[cfg(feature = "tls")]
            tls_client: None,
            #[cfg(feature = "tls")]
            tls_server: None,
            #[cfg(feature = "tls")]
            tls_server_name: String::new(),
        }
    }

    pub fn recv_buffer_capacity(&self) -> usize {
        usize::from(self.connection_recv_buffer_capacity_kb) * 1024
    }

    pub fn send_buffer_capacity(&self) -> usize {
        usize::from(self.connection_send_buffer_capacity_kb) * 1024
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_recv_buffer_capacity_kb == 0
            || self.connection_recv_buffer_capacity_kb > 64
        {
            return Err(Error::InvalidConfiguration(
                "receive buffer capacity must be 1..=64 KiB",
            ));
        }
        if self.connection_send_buffer_capacity_kb == 0
            || self.connection_send_buffer_capacity_kb > 64
        {
            return Err(Error::InvalidConfiguration(
                "send buffer capacity must be 1..=64 KiB",
            ));
        }
        if self.connections_per_pool == 0 {
            return Err(Error::InvalidConfiguration(
                "connections_per_pool must be at least 1",
            ));
        }
        if self.writer_message_count == 0 || self.writer_message_count > usize::from(u16::MAX) {
            return Err(Error::InvalidConfiguration(
                "writer_message_count out of range",
            ));
        }
        if self.relay_enabled && self.connection_relay_buffer_count == 0 {
            return Err(Error::InvalidConfiguration(
                "relaying requires at least one relay buffer",
            ));
        }
        #[cfg(feature = "tls")]
        {
            if self.client.start_secure && self.tls_client.is_none() {
                return Err(Error::InvalidConfiguration(
                    "client.start_secure requires a tls client config",
                ));
            }
            if self.server.start_secure && self.tls_server.is_none() {
                return Err(Error::InvalidConfiguration(
                    "server.start_secure requires a tls server config",
                ));
            }
        }
        #[cfg(not(feature = "tls"))]
        {
            if self.client.start_secure || self.server.start_secure {
                return Err(Error::InvalidConfiguration(
                    "secure start requires the tls feature",
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Configuration")
            .field("listener_address", &self.listener_address)
            .field("connections_per_pool", &self.connections_per_pool)
            .field("recv_kb", &self.connection_recv_buffer_capacity_kb)
            .field("send_kb", &self.connection_send_buffer_capacity_kb)
            .field("relay_buffers", &self.connection_relay_buffer_count)
            .field("inactivity_s", &self.inactivity_timeout_seconds)
            .field("keepalive_s", &self.keepalive_timeout_seconds)
            .field("relay_enabled", &self.relay_enabled)
            .finish()
    }
}
