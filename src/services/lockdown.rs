//! Lockdown, the device's control service on port 62078.
//!
//! Lockdown answers capability queries, brokers pairing, upgrades its own
//! channel to TLS and hands out ports for every other service. The session
//! state machine is: dial, query, pair record on file (pairing if not),
//! `StartSession` with an optional TLS upgrade, any number of
//! `StartService` calls, teardown.

use log::{debug, warn};

use crate::connection::DeviceConnection;
use crate::pairing_record::PairRecord;
use crate::usbmuxd::{MuxDevice, UsbmuxdConnection};
use crate::{ca, Error, BUNDLE_ID, PROG_NAME, PROTOCOL_VERSION};

/// What `StartService` hands back: where and how to reach the new service.
#[derive(Debug, Clone)]
pub struct ServicePort {
    pub port: u16,
    pub use_ssl: bool,
    pub service: String,
}

/// A live lockdown control channel.
pub struct LockdownClient {
    conn: DeviceConnection,
    device: MuxDevice,
    /// `ProductVersion` split on `.`; only the major is consulted.
    version: Vec<u64>,
    pair_record: Option<PairRecord>,
    session_id: Option<String>,
}

impl std::fmt::Debug for LockdownClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockdownClient")
            .field("device", &self.device.serial_number)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl LockdownClient {
    pub const LOCKDOWN_PORT: u16 = 62078;

    /// Dials the lockdown service on a device through a fresh mux
    /// connection.
    pub async fn connect(device: &MuxDevice) -> Result<Self, Error> {
        let socket = UsbmuxdConnection::default()
            .await?
            .connect_to_device(device.device_id, Self::LOCKDOWN_PORT)
            .await?;
        Ok(Self {
            conn: DeviceConnection::new(socket, BUNDLE_ID),
            device: device.clone(),
            version: Vec::new(),
            pair_record: None,
            session_id: None,
        })
    }

    fn request(&self, request: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), BUNDLE_ID.into());
        req.insert("ProtocolVersion".into(), PROTOCOL_VERSION.into());
        req.insert("Request".into(), request.into());
        req
    }

    /// Asks the service what it is; anything but the lockdown type string is
    /// rejected.
    pub async fn query_type(&mut self) -> Result<String, Error> {
        let req = self.request("QueryType");
        self.conn.send_plist(plist::Value::Dictionary(req)).await?;
        let res = self.conn.read_plist().await?;
        match res.get("Type").and_then(|t| t.as_string()) {
            Some(t) => Ok(t.to_string()),
            None => Err(Error::UnexpectedResponse),
        }
    }

    /// Retrieves a value, optionally from a domain. The whole value-dict
    /// comes back for `key = None`.
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<plist::Value, Error> {
        let mut req = self.request("GetValue");
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.conn.send_plist(plist::Value::Dictionary(req)).await?;
        let res = self.conn.read_plist().await?;
        match res.get("Value") {
            Some(v) => Ok(v.to_owned()),
            None => Err(Error::UnexpectedResponse),
        }
    }

    pub async fn get_string_value(&mut self, key: &str) -> Result<String, Error> {
        let value = self.get_value(Some(key), None).await?;
        match value.as_string() {
            Some(s) => Ok(s.to_string()),
            None => Err(Error::UnexpectedResponse),
        }
    }

    /// Sets a value, optionally within a domain.
    pub async fn set_value(
        &mut self,
        key: &str,
        value: plist::Value,
        domain: Option<&str>,
    ) -> Result<(), Error> {
        let mut req = self.request("SetValue");
        req.insert("Key".into(), key.into());
        req.insert("Value".into(), value);
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.conn.send_plist(plist::Value::Dictionary(req)).await?;
        self.conn.read_plist().await?;
        Ok(())
    }

    pub async fn unique_device_id(&mut self) -> Result<String, Error> {
        self.get_string_value("UniqueDeviceID").await
    }

    pub async fn device_name(&mut self) -> Result<String, Error> {
        self.get_string_value("DeviceName").await
    }

    pub async fn product_version(&mut self) -> Result<String, Error> {
        self.get_string_value("ProductVersion").await
    }

    /// Puts the device into recovery mode.
    pub async fn enter_recovery(&mut self) -> Result<(), Error> {
        let req = self.request("EnterRecovery");
        self.conn.send_plist(plist::Value::Dictionary(req)).await?;
        self.conn.read_plist().await?;
        Ok(())
    }

    /// Confirms the peer, learns the device version and puts a pair record
    /// in hand, pairing from scratch when the mux has none on file.
    pub async fn handshake(&mut self) -> Result<(), Error> {
        let kind = self.query_type().await?;
        if kind != "com.apple.mobile.lockdown" {
            warn!("dialed port 62078 but found `{kind}`");
            return Err(Error::UnexpectedResponse);
        }

        let version = self.get_string_value("ProductVersion").await?;
        self.version = version
            .split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect();

        let stored = UsbmuxdConnection::default()
            .await?
            .read_pair_record(&self.device.serial_number)
            .await;
        match stored {
            Ok(record) => self.pair_record = Some(record),
            Err(e) => {
                debug!("no usable pair record ({e:?}), pairing");
                let record = self.pair().await?;
                UsbmuxdConnection::default()
                    .await?
                    .save_pair_record(&self.device.serial_number, self.device.device_id, &record)
                    .await?;
                self.pair_record = Some(record);
            }
        }
        Ok(())
    }

    /// Generates certificate material and asks the device to trust it.
    ///
    /// The returned record is complete (private keys, escrow bag, wi-fi MAC
    /// when available) but not yet persisted; `handshake` saves it through
    /// the mux. Note that key generation is computationally heavy in a
    /// debug build.
    pub async fn pair(&mut self) -> Result<PairRecord, Error> {
        let public_key = self.get_value(Some("DevicePublicKey"), None).await?;
        let public_key = match public_key.as_data() {
            Some(data) => data.to_vec(),
            None => {
                warn!("device public key did not decode as data");
                return Err(Error::UnexpectedResponse);
            }
        };

        let buid = UsbmuxdConnection::default().await?.read_buid().await?;
        let identity = ca::generate_pair_certificates(&public_key)?;
        let host_id = uuid::Uuid::new_v4().to_string().to_uppercase();
        let mut record = PairRecord::new(identity, host_id, buid);

        // Best effort; old builds answer GetProhibited here.
        record.wifi_mac_address = self
            .get_value(Some("WiFiAddress"), None)
            .await
            .ok()
            .and_then(|v| v.as_string().map(str::to_string));

        let mut req = self.request("Pair");
        req.insert("HostName".into(), PROG_NAME.into());
        req.insert("PairRecord".into(), record.pair_request_value()?);
        let mut options = plist::Dictionary::new();
        options.insert("ExtendedPairingErrors".into(), true.into());
        req.insert("PairingOptions".into(), plist::Value::Dictionary(options));

        loop {
            self.conn
                .send_plist(plist::Value::Dictionary(req.clone()))
                .await?;
            match self.conn.read_plist().await {
                Ok(res) => {
                    if let Some(escrow) = res.get("EscrowBag").and_then(|e| e.as_data()) {
                        record.escrow_bag = Some(escrow.to_vec());
                    }
                    return Ok(record);
                }
                Err(Error::PairingDialogResponsePending) => {
                    debug!("waiting on the trust dialog");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Starts an authenticated session, upgrading this channel to TLS when
    /// the device asks for it.
    ///
    /// `InvalidHostID` means the device no longer trusts our record; the
    /// stale record is deleted and pairing re-runs exactly once before the
    /// failure surfaces.
    pub async fn start_session(&mut self) -> Result<(), Error> {
        if self.pair_record.is_none() {
            self.handshake().await?;
        }

        match self.try_start_session().await {
            Err(Error::InvalidHostId) => {
                warn!("host id rejected, re-pairing");
                match UsbmuxdConnection::default().await {
                    Ok(conn) => {
                        if let Err(e) = conn.delete_pair_record(&self.device.serial_number).await {
                            warn!("could not delete stale pair record: {e:?}");
                        }
                    }
                    Err(e) => warn!("could not reach mux to delete pair record: {e:?}"),
                }
                self.pair_record = None;
                self.handshake().await?;
                self.try_start_session().await
            }
            other => other,
        }
    }

    async fn try_start_session(&mut self) -> Result<(), Error> {
        if self.session_id.is_some() {
            self.stop_session().await?;
        }
        let record = self.pair_record.as_ref().ok_or(Error::NotConnected)?;

        let mut req = self.request("StartSession");
        req.insert("HostID".into(), record.host_id.clone().into());
        req.insert("SystemBUID".into(), record.system_buid.clone().into());
        self.conn.send_plist(plist::Value::Dictionary(req)).await?;
        let res = self.conn.read_plist().await?;

        self.session_id = res
            .get("SessionID")
            .and_then(|s| s.as_string())
            .map(str::to_string);

        let enable_ssl = res
            .get("EnableSessionSSL")
            .and_then(|e| e.as_boolean())
            .unwrap_or(false);
        if enable_ssl {
            let record = self.pair_record.as_ref().ok_or(Error::NotConnected)?;
            self.conn.start_tls(record, self.version_major()).await?;
        }
        Ok(())
    }

    /// Ends the session. A no-op when none is active.
    pub async fn stop_session(&mut self) -> Result<(), Error> {
        let session_id = match self.session_id.take() {
            Some(id) => id,
            None => return Ok(()),
        };
        let mut req = self.request("StopSession");
        req.insert("SessionID".into(), session_id.into());
        self.conn.send_plist(plist::Value::Dictionary(req)).await?;
        self.conn.read_plist().await?;
        Ok(())
    }

    /// Asks lockdown to start `service`. The reply names a fresh device
    /// port for the caller to open through the mux.
    pub async fn start_service(&mut self, service: &str) -> Result<ServicePort, Error> {
        let mut req = self.request("StartService");
        req.insert("Service".into(), service.into());
        if let Some(escrow) = self
            .pair_record
            .as_ref()
            .and_then(|r| r.escrow_bag.clone())
        {
            req.insert("EscrowBag".into(), plist::Value::Data(escrow));
        }
        self.conn.send_plist(plist::Value::Dictionary(req)).await?;
        let res = self.conn.read_plist().await?;

        let port = match res.get("Port").and_then(|p| p.as_unsigned_integer()) {
            Some(p) => p as u16,
            None => return Err(Error::UnexpectedResponse),
        };
        let use_ssl = res
            .get("EnableServiceSSL")
            .and_then(|s| s.as_boolean())
            .unwrap_or(false);
        let service = res
            .get("Service")
            .and_then(|s| s.as_string())
            .unwrap_or(service)
            .to_string();

        Ok(ServicePort {
            port,
            use_ssl,
            service,
        })
    }

    /// Opens the channel a `StartService` reply points at: a new mux
    /// connection, TLS-wrapped right away when the reply said so.
    ///
    /// The returned channel is independent of this session and stays valid
    /// after the session closes.
    pub async fn open_service_channel(
        &self,
        service: &ServicePort,
    ) -> Result<DeviceConnection, Error> {
        let socket = UsbmuxdConnection::default()
            .await?
            .connect_to_device(self.device.device_id, service.port)
            .await?;
        let mut conn = DeviceConnection::new(socket, BUNDLE_ID);
        if service.use_ssl {
            let record = self.pair_record.as_ref().ok_or(Error::NotConnected)?;
            conn.start_tls(record, self.version_major()).await?;
        }
        Ok(conn)
    }

    fn version_major(&self) -> u64 {
        self.version.first().copied().unwrap_or(0)
    }

    #[cfg(test)]
    fn over_connection(conn: DeviceConnection) -> Self {
        Self {
            conn,
            device: MuxDevice {
                device_id: 1,
                serial_number: "test-udid".into(),
                connection: crate::usbmuxd::ConnectionInfo::Unknown("Test".into()),
            },
            version: vec![17, 0],
            pair_record: None,
            session_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn read_request(remote: &mut tokio::io::DuplexStream) -> plist::Dictionary {
        let mut len = [0u8; 4];
        remote.read_exact(&mut len).await.unwrap();
        let mut body = vec![0; u32::from_be_bytes(len) as usize];
        remote.read_exact(&mut body).await.unwrap();
        plist::from_bytes(&body).unwrap()
    }

    async fn send_reply(remote: &mut tokio::io::DuplexStream, dict: plist::Dictionary) {
        let mut body = Vec::new();
        plist::Value::Dictionary(dict)
            .to_writer_xml(&mut body)
            .unwrap();
        remote
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        remote.write_all(&body).await.unwrap();
    }

    #[tokio::test]
    async fn query_type_checks_the_peer() {
        let (client, mut remote) = tokio::io::duplex(16 * 1024);
        let mut lockdown =
            LockdownClient::over_connection(DeviceConnection::new(Box::new(client), "test"));

        let device = tokio::spawn(async move {
            let req = read_request(&mut remote).await;
            assert_eq!(
                req.get("Request").and_then(|v| v.as_string()),
                Some("QueryType")
            );
            assert_eq!(
                req.get("ProtocolVersion").and_then(|v| v.as_string()),
                Some("2")
            );

            let mut reply = plist::Dictionary::new();
            reply.insert("Request".into(), "QueryType".into());
            reply.insert("Type".into(), "com.apple.mobile.lockdown".into());
            send_reply(&mut remote, reply).await;
        });

        assert_eq!(
            lockdown.query_type().await.unwrap(),
            "com.apple.mobile.lockdown"
        );
        device.await.unwrap();
    }

    #[tokio::test]
    async fn get_value_returns_data_values_raw() {
        let (client, mut remote) = tokio::io::duplex(16 * 1024);
        let mut lockdown =
            LockdownClient::over_connection(DeviceConnection::new(Box::new(client), "test"));

        let device = tokio::spawn(async move {
            let req = read_request(&mut remote).await;
            assert_eq!(
                req.get("Key").and_then(|v| v.as_string()),
                Some("DevicePublicKey")
            );
            let mut reply = plist::Dictionary::new();
            reply.insert(
                "Value".into(),
                plist::Value::Data(b"-----BEGIN RSA PUBLIC KEY-----".to_vec()),
            );
            send_reply(&mut remote, reply).await;
        });

        let value = lockdown
            .get_value(Some("DevicePublicKey"), None)
            .await
            .unwrap();
        assert_eq!(
            value.as_data(),
            Some(&b"-----BEGIN RSA PUBLIC KEY-----"[..])
        );
        device.await.unwrap();
    }

    #[tokio::test]
    async fn start_service_reports_port_and_ssl() {
        let (client, mut remote) = tokio::io::duplex(16 * 1024);
        let mut lockdown =
            LockdownClient::over_connection(DeviceConnection::new(Box::new(client), "test"));

        let device = tokio::spawn(async move {
            let req = read_request(&mut remote).await;
            assert_eq!(
                req.get("Service").and_then(|v| v.as_string()),
                Some("com.apple.afc")
            );

            let mut reply = plist::Dictionary::new();
            reply.insert("Request".into(), "StartService".into());
            reply.insert("Service".into(), "com.apple.afc".into());
            reply.insert("Port".into(), 49152u64.into());
            reply.insert("EnableServiceSSL".into(), true.into());
            send_reply(&mut remote, reply).await;
        });

        let service = lockdown.start_service("com.apple.afc").await.unwrap();
        assert_eq!(service.port, 49152);
        assert!(service.use_ssl);
        assert_eq!(service.service, "com.apple.afc");
        device.await.unwrap();
    }

    #[tokio::test]
    async fn service_errors_carry_the_lockdown_string() {
        let (client, mut remote) = tokio::io::duplex(16 * 1024);
        let mut lockdown =
            LockdownClient::over_connection(DeviceConnection::new(Box::new(client), "test"));

        let device = tokio::spawn(async move {
            let _ = read_request(&mut remote).await;
            let mut reply = plist::Dictionary::new();
            reply.insert("Request".into(), "StartService".into());
            reply.insert("Error".into(), "InvalidService".into());
            send_reply(&mut remote, reply).await;
        });

        match lockdown.start_service("com.apple.nonsense").await {
            Err(Error::Lockdown(e)) => assert_eq!(e, "InvalidService"),
            other => panic!("expected a lockdown error, got {other:?}"),
        }
        device.await.unwrap();
    }

    #[tokio::test]
    async fn stop_session_is_idempotent() {
        let (client, _remote) = tokio::io::duplex(16 * 1024);
        let mut lockdown =
            LockdownClient::over_connection(DeviceConnection::new(Box::new(client), "test"));

        // No session: nothing is sent, nothing fails.
        lockdown.stop_session().await.unwrap();
        lockdown.stop_session().await.unwrap();
    }
}
