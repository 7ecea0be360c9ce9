//! Service clients and the shared bring-up path they use.

use crate::connection::DeviceConnection;
use crate::usbmuxd::MuxDevice;
use crate::Error;

pub mod afc;
pub mod house_arrest;
pub mod installation_proxy;
pub mod instruments;
pub mod lockdown;
pub mod mount;
pub mod screenshot;
pub mod simulate_location;
pub mod syslog_relay;

use lockdown::LockdownClient;

/// Interface for services that can be started on a device.
///
/// Implementors name their lockdown service identifier and build themselves
/// from the connected channel; the default `connect` drives the whole
/// session dance.
pub trait DeviceService: Sized {
    /// The service identifier as registered with lockdownd.
    fn service_name() -> &'static str;

    /// Starts the service and connects to it.
    #[allow(async_fn_in_trait)]
    async fn connect(device: &MuxDevice) -> Result<Self, Error> {
        let conn = connect_service(device, Self::service_name()).await?;
        Self::from_stream(conn).await
    }

    #[allow(async_fn_in_trait)]
    async fn from_stream(conn: DeviceConnection) -> Result<Self, Error>;
}

/// Runs a full lockdown session to start `name` and opens the channel it
/// comes back on: dial, session (pairing if needed), `StartService`,
/// session teardown, then a fresh mux connect with an optional TLS
/// handshake.
pub async fn connect_service(device: &MuxDevice, name: &str) -> Result<DeviceConnection, Error> {
    let mut lockdown = LockdownClient::connect(device).await?;
    lockdown.start_session().await?;
    let service = lockdown.start_service(name).await?;
    lockdown.stop_session().await?;
    lockdown.open_service_channel(&service).await
}
