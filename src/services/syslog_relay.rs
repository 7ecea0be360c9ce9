//! The syslog relay, a read-only stream of log text.

use bytes::{BufMut, Bytes, BytesMut};

use crate::connection::DeviceConnection;
use crate::services::DeviceService;
use crate::Error;

/// The in-band escape the relay substitutes for ESC: `\^[`.
const ESC_SEQUENCE: &[u8] = &[0x5c, 0x5e, 0x5b];

/// Client for the syslog relay service.
#[derive(Debug)]
pub struct SyslogRelayClient {
    conn: DeviceConnection,
    buffer: BytesMut,
}

impl DeviceService for SyslogRelayClient {
    fn service_name() -> &'static str {
        "com.apple.syslog_relay"
    }

    async fn from_stream(conn: DeviceConnection) -> Result<Self, Error> {
        Ok(Self {
            conn,
            buffer: BytesMut::with_capacity(0x1000),
        })
    }
}

impl SyslogRelayClient {
    /// Reads the next chunk of log bytes, with the escape sequence
    /// translated back to ESC. `None` means the device closed the stream.
    pub async fn next(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            let chunk = self.conn.read_any(0xffff).await?;
            if chunk.is_empty() {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                // Flush whatever is left, partial escape included.
                let rest = self.buffer.split();
                return Ok(Some(unescape(&rest)));
            }
            self.buffer.extend_from_slice(&chunk);

            // Hold back a trailing partial escape for the next read.
            let keep = partial_escape_len(&self.buffer);
            if self.buffer.len() > keep {
                let ready = self.buffer.split_to(self.buffer.len() - keep);
                return Ok(Some(unescape(&ready)));
            }
        }
    }

    /// Feeds chunks to `callback` until it returns `false` or the stream
    /// ends.
    pub async fn relay(
        &mut self,
        mut callback: impl FnMut(&[u8]) -> bool,
    ) -> Result<(), Error> {
        while let Some(chunk) = self.next().await? {
            if !callback(&chunk) {
                break;
            }
        }
        Ok(())
    }
}

/// Length of the escape-sequence prefix dangling at the end of `buf`.
fn partial_escape_len(buf: &[u8]) -> usize {
    for keep in (1..ESC_SEQUENCE.len()).rev() {
        if buf.len() >= keep && buf[buf.len() - keep..] == ESC_SEQUENCE[..keep] {
            return keep;
        }
    }
    0
}

fn unescape(bytes: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes.len() - i >= ESC_SEQUENCE.len() && &bytes[i..i + ESC_SEQUENCE.len()] == ESC_SEQUENCE
        {
            out.put_u8(0x1b);
            i += ESC_SEQUENCE.len();
        } else {
            out.put_u8(bytes[i]);
            i += 1;
        }
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn escape_sequence_becomes_esc() {
        assert_eq!(
            unescape(b"a\\^[[1mb").as_ref(),
            b"a\x1b[1mb"
        );
        assert_eq!(unescape(b"plain").as_ref(), b"plain");
    }

    #[test]
    fn partial_prefixes_are_detected() {
        assert_eq!(partial_escape_len(b"log\\"), 1);
        assert_eq!(partial_escape_len(b"log\\^"), 2);
        assert_eq!(partial_escape_len(b"log\\^["), 0);
        assert_eq!(partial_escape_len(b"log"), 0);
    }

    #[tokio::test]
    async fn escapes_split_across_reads_still_translate() {
        let (client, mut remote) = tokio::io::duplex(4096);
        let mut relay =
            SyslogRelayClient::from_stream(DeviceConnection::new(Box::new(client), "test"))
                .await
                .unwrap();

        remote.write_all(b"first\\^").await.unwrap();
        let chunk = relay.next().await.unwrap().unwrap();
        assert_eq!(chunk.as_ref(), b"first");

        remote.write_all(b"[rest\n").await.unwrap();
        drop(remote);
        let chunk = relay.next().await.unwrap().unwrap();
        assert_eq!(chunk.as_ref(), b"\x1b[rest\n");

        assert!(relay.next().await.unwrap().is_none());
    }
}
