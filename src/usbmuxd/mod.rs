//! Client for the usbmuxd daemon.
//!
//! The daemon multiplexes TCP-like connections to attached devices over a
//! local socket (a filesystem socket on unix, a loopback TCP port on
//! Windows). Messages are XML plists in 16-byte little-endian frames.
//!
//! One-shot RPCs consume the connection: the daemon serves a single
//! request-reply pair per connection, so the methods here take `self` by
//! value. Only `listen` and a post-`connect_to_device` data channel keep
//! the socket alive.

use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::pairing_record::PairRecord;
use crate::{Error, ReadWrite, BUNDLE_ID, CLIENT_VERSION, LIB_USBMUX_VERSION, PROG_NAME};

mod des;
mod raw_packet;

pub use raw_packet::RawPacket;

/// How a device is attached to the host.
#[derive(Debug, Clone)]
pub enum ConnectionInfo {
    Usb {
        connection_speed: i64,
        location_id: i64,
        product_id: i64,
    },
    Network {
        interface_index: i64,
        address: Vec<u8>,
        service_name: String,
    },
    Unknown(String),
}

/// A device as enumerated by the daemon. The numeric id is ephemeral; the
/// serial number (UDID) is the stable identity.
#[derive(Debug, Clone)]
pub struct MuxDevice {
    pub device_id: u32,
    pub serial_number: String,
    pub connection: ConnectionInfo,
}

impl MuxDevice {
    pub fn udid(&self) -> &str {
        &self.serial_number
    }

    pub fn connection_type(&self) -> &str {
        match &self.connection {
            ConnectionInfo::Usb { .. } => "USB",
            ConnectionInfo::Network { .. } => "Network",
            ConnectionInfo::Unknown(s) => s,
        }
    }
}

/// Notification from a `Listen` subscription, in arrival order.
#[derive(Debug, Clone)]
pub enum MuxEvent {
    Attached(MuxDevice),
    Detached(u32),
    Result(u64),
}

/// Cancellation handle for a `listen` reader task.
#[derive(Debug)]
pub struct ListenHandle {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ListenHandle {
    /// Stops the reader. The event channel closes once the task winds down.
    pub async fn cancel(self) {
        let _ = self.cancel.send(());
        let _ = self.task.await;
    }
}

/// The byte-swapped form `Connect` requests carry the port in: 16-bit
/// network order expressed inside the little-endian frame.
pub fn swap_port(port: u16) -> u16 {
    ((port << 8) & 0xFF00) | (port >> 8)
}

#[derive(Debug)]
pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

impl UsbmuxdConnection {
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";
    pub const TCP_PORT: u16 = 27015;

    /// Dial timeout, also applied to each one-shot RPC reply.
    pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

    /// Dials the daemon at its conventional platform endpoint.
    pub async fn default() -> Result<Self, Error> {
        #[cfg(unix)]
        let socket: Box<dyn ReadWrite> = {
            let socket = tokio::time::timeout(
                Self::RPC_TIMEOUT,
                tokio::net::UnixStream::connect(Self::SOCKET_FILE),
            )
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(dial_error)?;
            Box::new(socket)
        };

        #[cfg(windows)]
        let socket: Box<dyn ReadWrite> = {
            let socket = tokio::time::timeout(
                Self::RPC_TIMEOUT,
                tokio::net::TcpStream::connect(("127.0.0.1", Self::TCP_PORT)),
            )
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(dial_error)?;
            Box::new(socket)
        };

        Ok(Self::new(socket, 0))
    }

    pub fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self { socket, tag }
    }

    fn base_request(message_type: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), message_type.into());
        req.insert("BundleID".into(), BUNDLE_ID.into());
        req.insert("ClientVersionString".into(), CLIENT_VERSION.into());
        req.insert("ProgName".into(), PROG_NAME.into());
        req
    }

    async fn write_packet(&mut self, req: plist::Dictionary) -> Result<(), Error> {
        let raw = RawPacket::new(
            req,
            RawPacket::XML_PLIST_VERSION,
            RawPacket::PLIST_MESSAGE_TYPE,
            self.tag,
        );
        self.socket.write_all(&raw.serialize()?).await?;
        self.socket.flush().await?;
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<plist::Dictionary, Error> {
        let mut header = [0u8; 16];
        self.socket.read_exact(&mut header).await?;

        let packet_size = u32::from_le_bytes(header[..4].try_into().unwrap());
        if packet_size < RawPacket::HEADER_LEN {
            return Err(Error::UnexpectedResponse);
        }
        let body_size = packet_size - RawPacket::HEADER_LEN;
        debug!("reading {body_size} byte body from the muxer");

        let mut body = vec![0; body_size as usize];
        self.socket.read_exact(&mut body).await?;
        Ok(plist::from_bytes(&body)?)
    }

    /// One request, one deadline-bounded reply.
    async fn round_trip(&mut self, req: plist::Dictionary) -> Result<plist::Dictionary, Error> {
        self.write_packet(req).await?;
        tokio::time::timeout(Self::RPC_TIMEOUT, self.read_packet())
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Enumerates attached devices. No devices is an empty list, not an
    /// error.
    pub async fn list_devices(mut self) -> Result<Vec<MuxDevice>, Error> {
        let mut req = Self::base_request("ListDevices");
        req.insert("kLibUSBMuxVersion".into(), LIB_USBMUX_VERSION.into());
        let res = self.round_trip(req).await?;

        if !res.contains_key("DeviceList") {
            return Err(result_error(&res));
        }
        let res: des::ListDevicesResponse = plist::from_value(&plist::Value::Dictionary(res))?;

        Ok(res
            .device_list
            .into_iter()
            .map(|entry| device_from_properties(entry.device_id, entry.properties))
            .collect())
    }

    /// Reads the stable identifier of this host's mux install.
    pub async fn read_buid(mut self) -> Result<String, Error> {
        let req = Self::base_request("ReadBUID");
        let mut res = self.round_trip(req).await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(result_error(&res)),
        }
    }

    /// Fetches the pair record stored under a device's serial number.
    pub async fn read_pair_record(mut self, udid: &str) -> Result<PairRecord, Error> {
        let mut req = Self::base_request("ReadPairRecord");
        req.insert("PairRecordID".into(), udid.into());
        let res = self.round_trip(req).await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(data)) => PairRecord::from_bytes(data),
            _ => Err(result_error(&res)),
        }
    }

    /// Stores a pair record under a device's serial number.
    pub async fn save_pair_record(
        mut self,
        udid: &str,
        device_id: u32,
        record: &PairRecord,
    ) -> Result<(), Error> {
        let mut req = Self::base_request("SavePairRecord");
        req.insert("PairRecordID".into(), udid.into());
        req.insert(
            "PairRecordData".into(),
            plist::Value::Data(record.serialize()?),
        );
        req.insert("DeviceID".into(), device_id.into());
        let res = self.round_trip(req).await?;
        expect_result_ok(&res)
    }

    /// Deletes a device's stored pair record.
    pub async fn delete_pair_record(mut self, udid: &str) -> Result<(), Error> {
        let mut req = Self::base_request("DeletePairRecord");
        req.insert("PairRecordID".into(), udid.into());
        let res = self.round_trip(req).await?;
        expect_result_ok(&res)
    }

    /// Asks the daemon to connect this socket to `(device_id, port)` on the
    /// device. On success the socket becomes a raw pipe carrying device
    /// bytes and is handed to the caller.
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
    ) -> Result<Box<dyn ReadWrite>, Error> {
        debug!("connecting to device {device_id} port {port}");
        let mut req = Self::base_request("Connect");
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), swap_port(port).into());
        let res = self.round_trip(req).await?;
        expect_result_ok(&res)?;
        Ok(self.socket)
    }

    /// Subscribes to attach/detach notifications.
    ///
    /// The returned receiver yields events in arrival order and closes when
    /// the reader terminates, either through the handle's cancel or on the
    /// first read error.
    pub async fn listen(mut self) -> Result<(mpsc::Receiver<MuxEvent>, ListenHandle), Error> {
        let mut req = Self::base_request("Listen");
        req.insert("kLibUSBMuxVersion".into(), LIB_USBMUX_VERSION.into());
        self.write_packet(req).await?;

        let (tx, rx) = mpsc::channel(32);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    pkt = self.read_packet() => {
                        let dict = match pkt {
                            Ok(d) => d,
                            Err(e) => {
                                debug!("listen reader terminating: {e:?}");
                                break;
                            }
                        };
                        let event = match parse_listen_event(&dict) {
                            Some(e) => e,
                            None => continue,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok((
            rx,
            ListenHandle {
                cancel: cancel_tx,
                task,
            },
        ))
    }
}

fn dial_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => {
            Error::MuxUnavailable
        }
        _ => Error::Io(e),
    }
}

/// Maps a reply that is not the expected success shape onto the numeric
/// result taxonomy.
fn result_error(res: &plist::Dictionary) -> Error {
    match res.get("Number").and_then(|n| n.as_unsigned_integer()) {
        Some(n) => Error::from_mux_result(n).unwrap_or(Error::UnexpectedResponse),
        None => Error::UnexpectedResponse,
    }
}

fn expect_result_ok(res: &plist::Dictionary) -> Result<(), Error> {
    match res.get("Number").and_then(|n| n.as_unsigned_integer()) {
        Some(n) => match Error::from_mux_result(n) {
            None => Ok(()),
            Some(e) => Err(e),
        },
        None => Err(Error::UnexpectedResponse),
    }
}

fn device_from_properties(device_id: u32, props: des::DeviceProperties) -> MuxDevice {
    let connection = match props.connection_type.as_str() {
        "USB" => ConnectionInfo::Usb {
            connection_speed: props.connection_speed.unwrap_or_default(),
            location_id: props.location_id.unwrap_or_default(),
            product_id: props.product_id.unwrap_or_default(),
        },
        "Network" => ConnectionInfo::Network {
            interface_index: props.interface_index.unwrap_or_default(),
            address: props.network_address.map(Into::into).unwrap_or_default(),
            service_name: props.escaped_full_service_name.unwrap_or_default(),
        },
        other => ConnectionInfo::Unknown(other.to_string()),
    };
    MuxDevice {
        device_id,
        serial_number: props.serial_number,
        connection,
    }
}

fn parse_listen_event(dict: &plist::Dictionary) -> Option<MuxEvent> {
    let message_type = dict.get("MessageType").and_then(|m| m.as_string())?;
    match message_type {
        "Attached" => {
            let device_id = dict.get("DeviceID")?.as_unsigned_integer()? as u32;
            let properties = dict.get("Properties")?;
            match plist::from_value::<des::DeviceProperties>(properties) {
                Ok(props) => Some(MuxEvent::Attached(device_from_properties(device_id, props))),
                Err(e) => {
                    warn!("unparseable Attached properties: {e:?}");
                    None
                }
            }
        }
        "Detached" => {
            let device_id = dict.get("DeviceID")?.as_unsigned_integer()? as u32;
            Some(MuxEvent::Detached(device_id))
        }
        "Result" => {
            let number = dict.get("Number")?.as_unsigned_integer()?;
            Some(MuxEvent::Result(number))
        }
        other => {
            warn!("unknown mux notification type {other}");
            None
        }
    }
}
