//! Location simulation.
//!
//! The service takes coordinates as length-prefixed ASCII strings behind a
//! start word; a lone stop word ends the simulation. Stopping only works on
//! iOS 13 and later builds.

use crate::connection::DeviceConnection;
use crate::services::DeviceService;
use crate::Error;

#[derive(Debug)]
pub struct SimulateLocationClient {
    conn: DeviceConnection,
}

impl DeviceService for SimulateLocationClient {
    fn service_name() -> &'static str {
        "com.apple.dt.simulatelocation"
    }

    async fn from_stream(conn: DeviceConnection) -> Result<Self, Error> {
        Ok(Self { conn })
    }
}

impl SimulateLocationClient {
    /// Starts simulating at the given WGS-84 coordinates, passed as the
    /// decimal strings the service expects.
    pub async fn set(&mut self, latitude: &str, longitude: &str) -> Result<(), Error> {
        let mut message = 0u32.to_be_bytes().to_vec();
        message.extend_from_slice(&(latitude.len() as u32).to_be_bytes());
        message.extend_from_slice(latitude.as_bytes());
        message.extend_from_slice(&(longitude.len() as u32).to_be_bytes());
        message.extend_from_slice(longitude.as_bytes());
        self.conn.send_raw(&message).await
    }

    /// Ends the simulation.
    pub async fn clear(&mut self) -> Result<(), Error> {
        self.conn.send_raw(&1u32.to_be_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn start_message_is_length_prefixed_ascii() {
        let (client, mut remote) = tokio::io::duplex(4096);
        let mut sim =
            SimulateLocationClient::from_stream(DeviceConnection::new(Box::new(client), "test"))
                .await
                .unwrap();

        sim.set("37.33", "-122.03").await.unwrap();

        let mut buf = vec![0u8; 4 + 4 + 5 + 4 + 7];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[0..4], &[0, 0, 0, 0]);
        assert_eq!(&buf[4..8], &5u32.to_be_bytes());
        assert_eq!(&buf[8..13], b"37.33");
        assert_eq!(&buf[13..17], &7u32.to_be_bytes());
        assert_eq!(&buf[17..24], b"-122.03");

        sim.clear().await.unwrap();
        let mut stop = [0u8; 4];
        remote.read_exact(&mut stop).await.unwrap();
        assert_eq!(stop, [0, 0, 0, 1]);
    }
}
