use std::io::{Read, Write};
use std::sync::Arc;

use log::trace;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection, ServerName};

use crate::error::{Error, Result};

/// Sans-IO TLS session layered between a connection and its stream.
///
/// Wire bytes received from the socket go in through [`feed_wire`];
/// wire bytes to transmit come out through [`pull_wire`]; plaintext
/// crosses through [`read_plain`] / [`write_plain`]. The handshake is
/// driven by pumping those four until [`is_handshaking`] clears.
/// Certificate verification policy and trust anchors come entirely
/// from the injected rustls configs; hostname pinning is the server
/// name handed to [`SecureSession::client`].
///
/// [`feed_wire`]: SecureSession::feed_wire
/// [`pull_wire`]: SecureSession::pull_wire
/// [`read_plain`]: SecureSession::read_plain
/// [`write_plain`]: SecureSession::write_plain
/// [`is_handshaking`]: SecureSession::is_handshaking
pub struct SecureSession {
    conn: Connection,
    client: bool,
}

impl SecureSession {
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<SecureSession> {
        let name = ServerName::try_from(server_name).map_err(|_| Error::SecureContext)?;
        let conn = ClientConnection::new(config, name).map_err(|_| Error::SecureContext)?;
        Ok(SecureSession {
            conn: Connection::Client(conn),
            client: true,
        })
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<SecureSession> {
        let conn = ServerConnection::new(config).map_err(|_| Error::SecureContext)?;
        Ok(SecureSession {
            conn: Connection::Server(conn),
            client: false,
        })
    }

    pub fn is_client(&self) -> bool {
        self.client
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn wants_read(&self) -> bool {
        self.conn.wants_read()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Feeds wire bytes from the socket; returns how many were
    /// consumed. Alert and record errors surface as `SecureSocket`
    /// (the connection refines them to accept/connect failures while
    /// the handshake is still running).
    pub fn feed_wire(&mut self, mut wire: &[u8]) -> Result<usize> {
        let total = wire.len();
        while !wire.is_empty() {
            let n = self
                .conn
                .read_tls(&mut wire)
                .map_err(|_| Error::SecureSocket)?;
            if n == 0 {
                break;
            }
            self.conn
                .process_new_packets()
                .map_err(|e| {
                    trace!("tls record processing failed: {:?}", e);
                    Error::SecureSocket
                })?;
        }
        Ok(total - wire.len())
    }

    /// Pulls pending wire bytes to transmit into `out`; returns how
    /// many were produced.
    pub fn pull_wire(&mut self, out: &mut [u8]) -> Result<usize> {
        let capacity = out.len();
        let mut out = out;
        while self.conn.wants_write() && !out.is_empty() {
            self.conn
                .write_tls(&mut out)
                .map_err(|_| Error::SecureSocket)?;
        }
        Ok(capacity - out.len())
    }

    /// Drains decrypted plaintext into `out`; returns the byte count,
    /// zero when none is buffered.
    pub fn read_plain(&mut self, out: &mut [u8]) -> usize {
        match self.conn.reader().read(out) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    /// Buffers plaintext for encryption; drained by `pull_wire`.
    pub fn write_plain(&mut self, data: &[u8]) -> Result<usize> {
        self.conn
            .writer()
            .write(data)
            .map_err(|_| Error::SecureSocket)
    }

    /// Queues close_notify; flush through `pull_wire` afterwards.
    pub fn start_shutdown(&mut self) {
        self.conn.send_close_notify();
    }
}
