//! Device stream handling: big-endian plist framing plus the in-place
//! plaintext-to-TLS switch used by lockdown and service channels.
//!
//! A [`DeviceConnection`] starts out plaintext. `start_tls` wraps the same
//! underlying socket in a TLS client session; `dismiss_tls` drops the TLS
//! layer again and resumes on the bare socket, which the Instruments service
//! requires once its port is open.

use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use log::{debug, warn};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_openssl::SslStream;

use crate::pairing_record::PairRecord;
use crate::{Error, ReadWrite};

/// Picks the TLS protocol bounds for a device's major OS version.
///
/// Devices up to major version 10 only complete a handshake pinned to
/// TLS 1.1; newer ones negotiate anything from 1.1 through 1.3.
pub(crate) fn tls_protocol_bounds(major: u64) -> (SslVersion, SslVersion) {
    if major > 10 {
        (SslVersion::TLS1_1, SslVersion::TLS1_3)
    } else {
        (SslVersion::TLS1_1, SslVersion::TLS1_1)
    }
}

/// Cloneable handle to the raw socket so the TLS layer can borrow it while
/// the plain variant keeps a way back after `dismiss_tls`.
///
/// Only one layer performs I/O at any time, so the lock is never contended.
pub(crate) struct SharedStream(Arc<Mutex<Box<dyn ReadWrite>>>);

impl SharedStream {
    fn new(socket: Box<dyn ReadWrite>) -> Self {
        Self(Arc::new(Mutex::new(socket)))
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn ReadWrite>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clone for SharedStream {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl std::fmt::Debug for SharedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedStream")
    }
}

impl AsyncRead for SharedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut guard = self.lock();
        Pin::new(&mut **guard).poll_read(cx, buf)
    }
}

impl AsyncWrite for SharedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut guard = self.lock();
        Pin::new(&mut **guard).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.lock();
        Pin::new(&mut **guard).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.lock();
        Pin::new(&mut **guard).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let mut guard = self.lock();
        Pin::new(&mut **guard).poll_write_vectored(cx, bufs)
    }
}

#[derive(Debug)]
enum StreamState {
    Plain(SharedStream),
    Secure(Box<SslStream<SharedStream>>),
}

/// A duplex channel to one device service.
///
/// Wraps the byte pipe handed out by usbmuxd's `Connect` and layers the
/// length-prefixed plist framing that lockdown and most services speak on
/// top of it.
#[derive(Debug)]
pub struct DeviceConnection {
    state: StreamState,
    label: String,
}

impl DeviceConnection {
    /// Creates a connection over an established socket.
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            state: StreamState::Plain(SharedStream::new(socket)),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether traffic currently traverses a TLS session.
    pub fn is_tls(&self) -> bool {
        matches!(self.state, StreamState::Secure(_))
    }

    /// Performs a TLS client handshake in place, using the pair record's
    /// root credentials as the client identity.
    ///
    /// Peer verification is disabled; the mutual trust anchor is the pair
    /// record itself. The handshake is not reentrant.
    pub async fn start_tls(
        &mut self,
        record: &PairRecord,
        version_major: u64,
    ) -> Result<(), Error> {
        let shared = match &self.state {
            StreamState::Plain(s) => s.clone(),
            StreamState::Secure(_) => return Err(Error::TlsAlreadyActive),
        };

        let (min, max) = tls_protocol_bounds(version_major);
        let mut builder = SslConnector::builder(SslMethod::tls())?;
        builder.set_min_proto_version(Some(min))?;
        builder.set_max_proto_version(Some(max))?;
        if min == SslVersion::TLS1_1 {
            // Modern openssl refuses TLS 1.1 handshakes above security level 0.
            builder.set_cipher_list("ALL:!aNULL:!eNULL:@SECLEVEL=0")?;
        }

        let mut ssl = builder.build().configure()?.into_ssl("Device")?;
        ssl.set_certificate(&record.root_certificate)?;
        ssl.set_private_key(&record.root_private_key)?;
        ssl.set_verify(SslVerifyMode::NONE);

        let mut stream = SslStream::new(ssl, shared)?;
        Pin::new(&mut stream).connect().await?;

        debug!("TLS session established ({:?})", stream.ssl().version_str());
        self.state = StreamState::Secure(Box::new(stream));
        Ok(())
    }

    /// Drops the TLS layer and resumes plaintext I/O on the underlying
    /// socket. No close-notify is exchanged; the Instruments service expects
    /// the wrapper to simply disappear.
    pub fn dismiss_tls(&mut self) {
        if let StreamState::Secure(stream) = &self.state {
            let shared = stream.get_ref().clone();
            self.state = StreamState::Plain(shared);
        }
    }

    /// Sends a plist message as XML with a big-endian length prefix.
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), Error> {
        let mut body = Vec::new();
        message.to_writer_xml(&mut body)?;
        self.send_frame(&body).await
    }

    /// Sends a plist message in binary form with a big-endian length prefix.
    pub async fn send_bplist(&mut self, message: plist::Value) -> Result<(), Error> {
        let mut body = Vec::new();
        message.to_writer_binary(&mut body)?;
        self.send_frame(&body).await
    }

    async fn send_frame(&mut self, body: &[u8]) -> Result<(), Error> {
        let len = body.len() as u32;
        self.write_all(&len.to_be_bytes()).await?;
        self.write_all(body).await?;
        self.flush().await?;
        Ok(())
    }

    /// Reads one length-prefixed frame and parses it as a plist value.
    /// XML and binary bodies are both accepted.
    pub async fn read_plist_value(&mut self) -> Result<plist::Value, Error> {
        let mut len = [0u8; 4];
        self.read_exact(&mut len).await?;
        let len = u32::from_be_bytes(len);
        let mut body = vec![0; len as usize];
        self.read_exact(&mut body).await?;
        Ok(plist::from_bytes(&body)?)
    }

    /// Reads one frame as a dictionary and surfaces any `Error` entry the
    /// device put into it.
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, Error> {
        let value = self.read_plist_value().await?;
        let dict: plist::Dictionary = plist::from_value(&value)?;

        if let Some(e) = dict.get("Error") {
            match e.as_string() {
                Some(e) if !e.is_empty() => return Err(Error::from_lockdown_string(e)),
                Some(_) => {}
                None => {
                    warn!("device sent a non-string Error entry: {e:?}");
                    return Err(Error::UnexpectedResponse);
                }
            }
        }
        Ok(dict)
    }

    /// Sends raw bytes outside the plist framing.
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), Error> {
        self.write_all(message).await?;
        self.flush().await?;
        Ok(())
    }

    /// Reads exactly `len` raw bytes.
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; len];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads up to `max_size` raw bytes. An empty result means EOF.
    pub async fn read_any(&mut self, max_size: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; max_size];
        let n = self.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}

impl AsyncRead for DeviceConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            StreamState::Plain(s) => Pin::new(s).poll_read(cx, buf),
            StreamState::Secure(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DeviceConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().state {
            StreamState::Plain(s) => Pin::new(s).poll_write(cx, buf),
            StreamState::Secure(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            StreamState::Plain(s) => Pin::new(s).poll_flush(cx),
            StreamState::Secure(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            StreamState::Plain(s) => Pin::new(s).poll_shutdown(cx),
            StreamState::Secure(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_bounds_follow_device_version() {
        assert_eq!(
            tls_protocol_bounds(9),
            (SslVersion::TLS1_1, SslVersion::TLS1_1)
        );
        assert_eq!(
            tls_protocol_bounds(10),
            (SslVersion::TLS1_1, SslVersion::TLS1_1)
        );
        assert_eq!(
            tls_protocol_bounds(11),
            (SslVersion::TLS1_1, SslVersion::TLS1_3)
        );
    }

    #[tokio::test]
    async fn two_concatenated_frames_parse_without_bleed() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = DeviceConnection::new(Box::new(client), "test");

        let mut frame = Vec::new();
        for request in ["QueryType", "GetValue"] {
            let mut dict = plist::Dictionary::new();
            dict.insert("Request".into(), request.into());
            let mut body = Vec::new();
            plist::Value::Dictionary(dict).to_writer_xml(&mut body).unwrap();
            frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
            frame.extend_from_slice(&body);
        }
        server.write_all(&frame).await.unwrap();

        let first = conn.read_plist().await.unwrap();
        assert_eq!(first.get("Request").and_then(|v| v.as_string()), Some("QueryType"));
        let second = conn.read_plist().await.unwrap();
        assert_eq!(second.get("Request").and_then(|v| v.as_string()), Some("GetValue"));
    }

    #[tokio::test]
    async fn error_entries_surface_as_typed_errors() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = DeviceConnection::new(Box::new(client), "test");

        let mut dict = plist::Dictionary::new();
        dict.insert("Request".into(), "StartSession".into());
        dict.insert("Error".into(), "InvalidHostID".into());
        let mut body = Vec::new();
        plist::Value::Dictionary(dict).to_writer_xml(&mut body).unwrap();
        server.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        server.write_all(&body).await.unwrap();

        assert!(matches!(conn.read_plist().await, Err(Error::InvalidHostId)));
    }

    #[tokio::test]
    async fn tls_upgrade_routes_frames_through_the_session() {
        use openssl::ssl::{Ssl, SslAcceptor};

        let identity = crate::ca::generate_pair_certificates(
            &crate::ca::tests::sample_device_public_key_pem(),
        )
        .unwrap();
        let record = PairRecord {
            device_certificate: identity.device_certificate.clone(),
            host_certificate: identity.host_certificate.clone(),
            host_private_key: identity.host_private_key.clone(),
            root_certificate: identity.root_certificate.clone(),
            root_private_key: identity.root_private_key.clone(),
            host_id: "00000000-0000-0000-0000-000000000000".into(),
            system_buid: "buid".into(),
            escrow_bag: None,
            wifi_mac_address: None,
        };

        let (client, server) = tokio::io::duplex(16 * 1024);
        let mut conn = DeviceConnection::new(Box::new(client), "test");

        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
        acceptor
            .set_private_key(&identity.root_private_key)
            .unwrap();
        acceptor.set_certificate(&identity.root_certificate).unwrap();
        let acceptor = acceptor.build();

        let server_task = tokio::spawn(async move {
            let ssl = Ssl::new(acceptor.context()).unwrap();
            let mut stream = SslStream::new(ssl, server).unwrap();
            Pin::new(&mut stream).accept().await.unwrap();

            // Echo one lockdown-style frame back to the client.
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).await.unwrap();
            let mut body = vec![0; u32::from_be_bytes(len) as usize];
            stream.read_exact(&mut body).await.unwrap();
            stream.write_all(&len).await.unwrap();
            stream.write_all(&body).await.unwrap();
            stream.flush().await.unwrap();
        });

        conn.start_tls(&record, 17).await.unwrap();
        assert!(conn.is_tls());

        let mut dict = plist::Dictionary::new();
        dict.insert("Request".into(), "Echo".into());
        conn.send_plist(plist::Value::Dictionary(dict)).await.unwrap();
        let reply = conn.read_plist().await.unwrap();
        assert_eq!(reply.get("Request").and_then(|v| v.as_string()), Some("Echo"));

        server_task.await.unwrap();
    }
}
