//! Local port relay: a TCP listener whose every client is bridged to a
//! fixed port on the device through a fresh mux connection.

use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, ToSocketAddrs};

use crate::usbmuxd::{MuxDevice, UsbmuxdConnection};
use crate::Error;

#[derive(Debug)]
pub struct PortRelay {
    listener: TcpListener,
    device_id: u32,
    port: u16,
}

impl PortRelay {
    /// Binds a listener that forwards to `port` on `device`.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        device: &MuxDevice,
        port: u16,
    ) -> Result<Self, Error> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            device_id: device.device_id,
            port,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Each accepted client gets its own device connection and
    /// a pair of copy tasks; a failure on either side tears both down.
    pub async fn run(self) -> Result<(), Error> {
        loop {
            let (front, peer) = self.listener.accept().await?;
            debug!("relay accepted {peer}");
            let device_id = self.device_id;
            let port = self.port;

            tokio::spawn(async move {
                let back = match UsbmuxdConnection::default().await {
                    Ok(mux) => match mux.connect_to_device(device_id, port).await {
                        Ok(back) => back,
                        Err(e) => {
                            warn!("device port {port} refused relay client: {e:?}");
                            return;
                        }
                    },
                    Err(e) => {
                        warn!("mux unavailable for relay client: {e:?}");
                        return;
                    }
                };

                let (mut front_read, mut front_write) = front.into_split();
                let (mut back_read, mut back_write) = tokio::io::split(back);

                tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut front_read, &mut back_write).await;
                    let _ = back_write.shutdown().await;
                });
                tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut back_read, &mut front_write).await;
                    let _ = front_write.shutdown().await;
                });
            });
        }
    }
}
