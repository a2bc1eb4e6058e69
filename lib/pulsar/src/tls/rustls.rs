use crate::net::buffer::NetBuffer;
use crate::tls::engine::{
    Engine, EngineError, EngineResult, EngineStatus, EngineTask, HandshakeStatus, NetReader,
};
use rustls::{Certificate, PrivateKey, ServerConfig, ServerConnection};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

// Capacity hints: one maximum-size TLS record plus framing margin on the
// network side, one record's worth of plaintext on the application side.
const PACKET_BUFFER_SIZE: usize = 16 * 1024 + 512;
const APP_BUFFER_SIZE: usize = 16 * 1024;

/// Server-side TLS configuration shared across connections. Cheap to clone.
#[derive(Clone)]
pub struct TlsConfig {
    config: Arc<ServerConfig>,
}

#[derive(Debug)]
pub enum TlsConfigError {
    Io(io::Error),
    /// The certificate PEM file held no usable certificates.
    BadCertificates,
    /// The private key PEM file held no PKCS#8 or RSA key.
    NoPrivateKey,
    Tls(rustls::Error),
}

impl fmt::Display for TlsConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlsConfigError::Io(err) => write!(f, "io error: {}", err),
            TlsConfigError::BadCertificates => write!(f, "no usable certificates in PEM file"),
            TlsConfigError::NoPrivateKey => write!(f, "no usable private key in PEM file"),
            TlsConfigError::Tls(err) => write!(f, "tls error: {}", err),
        }
    }
}

impl std::error::Error for TlsConfigError {}

impl From<io::Error> for TlsConfigError {
    fn from(err: io::Error) -> TlsConfigError {
        TlsConfigError::Io(err)
    }
}

impl TlsConfig {
    /// Builds a configuration from a PEM certificate chain and a PEM private
    /// key (PKCS#8 preferred, RSA accepted).
    pub fn from_pem_files<P, Q>(chain: P, key: Q) -> Result<TlsConfig, TlsConfigError>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let certs = load_certificates(chain.as_ref())?;
        let key = load_private_key(key.as_ref())?;
        TlsConfig::from_der(certs, key)
    }

    /// Builds a configuration from DER-encoded material.
    pub fn from_der(chain: Vec<Vec<u8>>, key: Vec<u8>) -> Result<TlsConfig, TlsConfigError> {
        let certs = chain.into_iter().map(Certificate).collect();

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, PrivateKey(key))
            .map_err(TlsConfigError::Tls)?;

        Ok(TlsConfig {
            config: Arc::new(config),
        })
    }

    /// Creates a fresh engine for one connection.
    pub fn new_engine(&self) -> Result<RustlsEngine, rustls::Error> {
        let conn = ServerConnection::new(Arc::clone(&self.config))?;
        Ok(RustlsEngine::new(conn))
    }
}

fn load_certificates(path: &Path) -> Result<Vec<Vec<u8>>, TlsConfigError> {
    let file = fs::File::open(path)?;
    let mut reader = io::BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader).map_err(|_| TlsConfigError::BadCertificates)?;
    if certs.is_empty() {
        return Err(TlsConfigError::BadCertificates);
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<Vec<u8>, TlsConfigError> {
    let mut pkcs8 = {
        let file = fs::File::open(path)?;
        let mut reader = io::BufReader::new(file);
        rustls_pemfile::pkcs8_private_keys(&mut reader).map_err(|_| TlsConfigError::NoPrivateKey)?
    };
    if !pkcs8.is_empty() {
        return Ok(pkcs8.remove(0));
    }

    let mut rsa = {
        let file = fs::File::open(path)?;
        let mut reader = io::BufReader::new(file);
        rustls_pemfile::rsa_private_keys(&mut reader).map_err(|_| TlsConfigError::NoPrivateKey)?
    };
    if !rsa.is_empty() {
        return Ok(rsa.remove(0));
    }

    Err(TlsConfigError::NoPrivateKey)
}

/// Adapts a `rustls::ServerConnection` to the record-level [`Engine`]
/// contract. rustls performs its cryptography inline, so this engine never
/// yields delegated tasks.
pub struct RustlsEngine {
    conn: ServerConnection,
    was_handshaking: bool,
    closed_inbound: bool,
    closed_outbound: bool,
}

impl RustlsEngine {
    pub fn new(conn: ServerConnection) -> RustlsEngine {
        RustlsEngine {
            conn,
            was_handshaking: true,
            closed_inbound: false,
            closed_outbound: false,
        }
    }

    /// Handshake status for a completed operation, reporting `Finished`
    /// exactly once when the handshake ends.
    fn handshake_result(&mut self) -> HandshakeStatus {
        if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if self.was_handshaking {
            self.was_handshaking = false;
            HandshakeStatus::Finished
        } else {
            HandshakeStatus::NotHandshaking
        }
    }
}

impl Engine for RustlsEngine {
    fn wrap(
        &mut self,
        src: &mut NetReader<'_>,
        dst: &mut NetBuffer,
    ) -> Result<EngineResult, EngineError> {
        let mut consumed = 0;

        // Feed plaintext into the session. rustls buffers it internally
        // (during the handshake as well) up to its own limit.
        loop {
            let taken = {
                let chunk = match src.chunk() {
                    Some(chunk) => chunk,
                    None => break,
                };
                self.conn
                    .writer()
                    .write(chunk)
                    .map_err(|err| EngineError::new(format!("plaintext write: {}", err)))?
            };
            if taken == 0 {
                break;
            }
            src.consume(taken);
            consumed += taken;
        }

        // Drain encoded records into the destination.
        let mut produced = 0;
        dst.flip_append();
        while self.conn.wants_write() {
            if dst.is_full() {
                return Ok(EngineResult {
                    status: EngineStatus::BufferOverflow,
                    handshake: self.handshake_result(),
                    consumed,
                    produced,
                });
            }

            let mut sink = BufSink(dst);
            match self.conn.write_tls(&mut sink) {
                Ok(0) => break,
                Ok(count) => produced += count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(EngineResult {
                        status: EngineStatus::BufferOverflow,
                        handshake: self.handshake_result(),
                        consumed,
                        produced,
                    });
                }
                Err(err) => return Err(EngineError::new(format!("record write: {}", err))),
            }
        }

        let status = if self.closed_outbound && consumed == 0 && produced == 0 {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };

        Ok(EngineResult {
            status,
            handshake: self.handshake_result(),
            consumed,
            produced,
        })
    }

    fn unwrap(
        &mut self,
        src: &mut NetBuffer,
        dst: &mut NetBuffer,
    ) -> Result<EngineResult, EngineError> {
        src.flip_read();

        let mut consumed = 0;
        while !src.is_empty() {
            match self.conn.read_tls(&mut BufSource(src)) {
                Ok(0) => break,
                Ok(count) => consumed += count,
                Err(err) => return Err(EngineError::new(format!("record read: {}", err))),
            }
        }

        let io_state = self
            .conn
            .process_new_packets()
            .map_err(|err| EngineError::new(format!("tls: {}", err)))?;

        let expected = io_state.plaintext_bytes_to_read();
        let mut produced = 0;

        dst.flip_append();
        while produced < expected {
            if dst.is_full() {
                return Ok(EngineResult {
                    status: EngineStatus::BufferOverflow,
                    handshake: self.handshake_result(),
                    consumed,
                    produced,
                });
            }
            match self.conn.reader().read(dst.write_slice()) {
                Ok(0) => break,
                Ok(count) => {
                    dst.advance_write(count);
                    produced += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(EngineError::new(format!("plaintext read: {}", err))),
            }
        }

        let status = if produced > 0 {
            EngineStatus::Ok
        } else if io_state.peer_has_closed() {
            EngineStatus::Closed
        } else if self.conn.is_handshaking() && self.conn.wants_write() {
            // The handshake wants to respond; no more input is needed yet.
            EngineStatus::Ok
        } else {
            EngineStatus::BufferUnderflow
        };

        Ok(EngineResult {
            status,
            handshake: self.handshake_result(),
            consumed,
            produced,
        })
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn wants_wrap(&self) -> bool {
        self.conn.wants_write()
    }

    fn next_task(&mut self) -> Option<EngineTask> {
        None
    }

    fn close_inbound(&mut self) {
        self.closed_inbound = true;
    }

    fn close_outbound(&mut self) {
        if !self.closed_outbound {
            self.closed_outbound = true;
            self.conn.send_close_notify();
        }
    }

    fn is_outbound_done(&self) -> bool {
        self.closed_outbound && !self.conn.wants_write()
    }

    fn packet_buffer_size(&self) -> usize {
        PACKET_BUFFER_SIZE
    }

    fn app_buffer_size(&self) -> usize {
        APP_BUFFER_SIZE
    }
}

/// `io::Read` over the readable region of a buffer.
struct BufSource<'a>(&'a mut NetBuffer);

impl<'a> Read for BufSource<'a> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let slice = self.0.read_slice();
        let count = slice.len().min(out.len());
        out[..count].copy_from_slice(&slice[..count]);
        self.0.advance_read(count);
        Ok(count)
    }
}

/// `io::Write` over the appendable region of a buffer. Reports `WouldBlock`
/// when full so record drains surface as overflows rather than truncation.
struct BufSink<'a>(&'a mut NetBuffer);

impl<'a> Write for BufSink<'a> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let free = self.0.free();
        if free == 0 && !data.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let count = free.min(data.len());
        self.0.write_slice()[..count].copy_from_slice(&data[..count]);
        self.0.advance_write(count);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
