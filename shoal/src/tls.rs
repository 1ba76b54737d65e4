//! Contract between the manager and an external TLS provider. The provider
//! owns all cryptography; the dispatcher only pumps the handshake and routes
//! reads and writes through the session once one is attached.

use mio::net::TcpStream;

/// Certificate material handed to the provider. Paths reference PEM files;
/// a server PEM concatenates certificate and private key.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert: Option<String>,
    pub ca_cert: Option<String>,
}

/// Outcome of one handshake step.
#[derive(Debug)]
pub enum TlsHandshake {
    Done,
    WantRead,
    WantWrite,
    Failed(String),
}

/// Outcome of one encrypted read or write.
#[derive(Debug)]
pub enum TlsIo {
    /// Bytes moved.
    Done(usize),
    WantRead,
    WantWrite,
    /// The peer closed the TLS session.
    Closed,
    Failed(String),
}

/// An established (or establishing) TLS session over one socket.
pub trait TlsSession {
    fn handshake(&mut self, stream: &mut TcpStream) -> TlsHandshake;

    fn read(&mut self, stream: &mut TcpStream, buf: &mut [u8]) -> TlsIo;

    fn write(&mut self, stream: &mut TcpStream, buf: &[u8]) -> TlsIo;
}

/// Factory for sessions, registered once on the manager. Errors are
/// human-readable messages, returned verbatim from `set_ssl`.
pub trait TlsProvider {
    fn server_session(&self, config: &TlsConfig) -> Result<Box<dyn TlsSession>, String>;

    fn client_session(&self, config: &TlsConfig) -> Result<Box<dyn TlsSession>, String>;
}
