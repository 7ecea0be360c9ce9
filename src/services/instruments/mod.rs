//! The Instruments remote server, spoken over DTX.
//!
//! After lockdown starts the service, the TLS wrapper is dismissed: the
//! remote server expects plaintext on the open port. Conversation starts
//! with a capability exchange on channel 0; named channels are then
//! allocated with sequential codes and methods are invoked on them as
//! keyed-archive selectors.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::io::AsyncWriteExt;

use crate::connection::DeviceConnection;
use crate::services::DeviceService;
use crate::Error;

pub mod message;
pub mod message_aux;

use message::Message;
use message_aux::AuxValue;

const CHANNEL_APP_LISTING: &str = "com.apple.instruments.server.services.device.applictionListing";
const CHANNEL_DEVICE_INFO: &str = "com.apple.instruments.server.services.deviceinfo";
const CHANNEL_PROCESS_CONTROL: &str = "com.apple.instruments.server.services.processcontrol";

/// An installed application as reported by the device.
#[derive(Debug, Clone, Default)]
pub struct AppInfo {
    pub bundle_identifier: String,
    pub display_name: Option<String>,
    pub executable_name: Option<String>,
    pub bundle_path: Option<String>,
    pub version: Option<String>,
    pub app_type: Option<String>,
    pub restricted: Option<i64>,
    pub placeholder: Option<String>,
    pub container_bundle_identifier: Option<String>,
    pub container_bundle_path: Option<String>,
    pub plugin_identifier: Option<String>,
    pub plugin_uuid: Option<String>,
    pub app_extension_uuids: Vec<String>,
}

/// A running process as reported by the device.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u64,
    pub name: String,
    pub real_app_name: String,
    pub is_application: bool,
    pub start_date: Option<DateTime<Utc>>,
}

/// Client for the Instruments remote server.
pub struct InstrumentsClient {
    conn: DeviceConnection,
    /// Last identifier this end originated.
    message_id: u32,
    /// Capability set the server advertised at handshake.
    capabilities: HashMap<String, i64>,
    /// Allocated channel codes, by name.
    channels: HashMap<String, u32>,
}

impl std::fmt::Debug for InstrumentsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentsClient")
            .field("message_id", &self.message_id)
            .field("channels", &self.channels)
            .finish()
    }
}

impl DeviceService for InstrumentsClient {
    fn service_name() -> &'static str {
        "com.apple.instruments.remoteserver"
    }

    async fn from_stream(mut conn: DeviceConnection) -> Result<Self, Error> {
        // The remote server wants the TLS wrapper gone once the port is
        // open.
        conn.dismiss_tls();
        let mut client = Self {
            conn,
            message_id: 0,
            capabilities: HashMap::new(),
            channels: HashMap::new(),
        };
        client.handshake().await?;
        Ok(client)
    }
}

impl InstrumentsClient {
    /// The capability set the server advertised, by channel name.
    pub fn capabilities(&self) -> &HashMap<String, i64> {
        &self.capabilities
    }

    async fn send_message(
        &mut self,
        channel: u32,
        selector: Option<plist::Value>,
        aux: Option<Vec<AuxValue>>,
        expects_reply: bool,
    ) -> Result<(), Error> {
        self.message_id += 1;
        let bytes = Message::encode(
            self.message_id,
            0,
            channel,
            expects_reply,
            selector.as_ref(),
            aux.as_deref(),
        )?;
        self.conn.write_all(&bytes).await?;
        self.conn.flush().await?;
        Ok(())
    }

    /// Reads the next message, enforcing the identifier discipline: replies
    /// echo our last identifier, server-originated identifiers may advance
    /// but never retreat.
    async fn recv_message(&mut self) -> Result<Message, Error> {
        let message = Message::read_from(&mut self.conn).await?;
        let header = &message.header;
        match header.conversation_index {
            1 => {
                if header.identifier != self.message_id {
                    warn!(
                        "reply identifier {} does not match request {}",
                        header.identifier, self.message_id
                    );
                    return Err(Error::UnexpectedResponse);
                }
            }
            0 => {
                if header.identifier > self.message_id {
                    self.message_id = header.identifier;
                } else if header.identifier < self.message_id {
                    warn!("server identifier retreated to {}", header.identifier);
                    return Err(Error::UnexpectedResponse);
                }
            }
            other => {
                warn!("invalid conversation index {other}");
                return Err(Error::UnexpectedResponse);
            }
        }
        Ok(message)
    }

    /// Publishes our capabilities and records the server's advertised set.
    async fn handshake(&mut self) -> Result<(), Error> {
        let mut capabilities = plist::Dictionary::new();
        capabilities.insert("com.apple.private.DTXBlockCompression".into(), 2u64.into());
        capabilities.insert("com.apple.private.DTXConnection".into(), 1u64.into());

        self.send_message(
            0,
            Some("_notifyOfPublishedCapabilities:".into()),
            Some(vec![AuxValue::Object(plist::Value::Dictionary(
                capabilities,
            ))]),
            false,
        )
        .await?;

        let res = self.recv_message().await?;
        match res.object.as_ref().and_then(|o| o.as_string()) {
            Some("_notifyOfPublishedCapabilities:") => {}
            other => {
                warn!("unexpected handshake selector {other:?}");
                return Err(Error::UnexpectedResponse);
            }
        }

        let advertised = match res.aux.first() {
            Some(AuxValue::Object(plist::Value::Dictionary(d))) => d,
            _ => return Err(Error::UnexpectedResponse),
        };
        self.capabilities = advertised
            .iter()
            .filter_map(|(k, v)| {
                v.as_signed_integer().map(|v| (k.clone(), v))
            })
            .collect();
        debug!("server advertised {} services", self.capabilities.len());
        Ok(())
    }

    /// Returns the code for a named channel, allocating it on first use.
    /// Codes count up from 1; the capability channel is 0.
    async fn make_channel(&mut self, name: &str) -> Result<u32, Error> {
        if !self.capabilities.contains_key(name) {
            return Err(Error::DtxChannelUnavailable(name.to_string()));
        }
        if let Some(code) = self.channels.get(name) {
            return Ok(*code);
        }

        let code = self.channels.len() as u32 + 1;
        self.send_message(
            0,
            Some("_requestChannelWithCode:identifier:".into()),
            Some(vec![
                AuxValue::I32(code as i32),
                AuxValue::object(name),
            ]),
            true,
        )
        .await?;
        self.recv_message().await?;

        self.channels.insert(name.to_string(), code);
        Ok(code)
    }

    /// Lists installed applications.
    pub async fn app_list(&mut self) -> Result<Vec<AppInfo>, Error> {
        let channel = self.make_channel(CHANNEL_APP_LISTING).await?;
        self.send_message(
            channel,
            Some("installedApplicationsMatching:registerUpdateToken:".into()),
            Some(vec![
                AuxValue::Object(plist::Value::Dictionary(plist::Dictionary::new())),
                AuxValue::object(""),
            ]),
            true,
        )
        .await?;

        let res = self.recv_message().await?;
        let apps = match res.object {
            Some(plist::Value::Array(apps)) => apps,
            _ => return Err(Error::UnexpectedResponse),
        };

        Ok(apps
            .iter()
            .filter_map(|v| v.as_dictionary())
            .map(parse_app_info)
            .collect())
    }

    /// Lists running processes.
    pub async fn process_list(&mut self) -> Result<Vec<ProcessInfo>, Error> {
        let channel = self.make_channel(CHANNEL_DEVICE_INFO).await?;
        self.send_message(channel, Some("runningProcesses".into()), None, true)
            .await?;

        let res = self.recv_message().await?;
        let processes = match res.object {
            Some(plist::Value::Array(processes)) => processes,
            _ => return Err(Error::UnexpectedResponse),
        };

        Ok(processes
            .iter()
            .filter_map(|v| v.as_dictionary())
            .filter_map(parse_process_info)
            .collect())
    }

    /// Kills a process by pid. The server sends no confirmation.
    pub async fn kill(&mut self, pid: u32) -> Result<(), Error> {
        let channel = self.make_channel(CHANNEL_PROCESS_CONTROL).await?;
        self.send_message(
            channel,
            Some("killPid:".into()),
            Some(vec![AuxValue::I32(pid as i32)]),
            false,
        )
        .await?;
        Ok(())
    }

    /// Launches an app by bundle identifier and returns its pid.
    pub async fn launch(&mut self, bundle_id: &str) -> Result<u64, Error> {
        let channel = self.make_channel(CHANNEL_PROCESS_CONTROL).await?;

        let mut options = plist::Dictionary::new();
        options.insert("StartSuspendedKey".into(), 0u64.into());
        options.insert("KillExisting".into(), 1u64.into());

        self.send_message(
            channel,
            Some(
                "launchSuspendedProcessWithDevicePath:bundleIdentifier:environment:arguments:options:"
                    .into(),
            ),
            Some(vec![
                AuxValue::object(""),
                AuxValue::object(bundle_id),
                AuxValue::Object(plist::Value::Dictionary(plist::Dictionary::new())),
                AuxValue::Object(plist::Value::Array(Vec::new())),
                AuxValue::Object(plist::Value::Dictionary(options)),
            ]),
            true,
        )
        .await?;

        let res = self.recv_message().await?;
        match res.object {
            Some(plist::Value::Integer(pid)) => {
                pid.as_unsigned().ok_or(Error::UnexpectedResponse)
            }
            Some(ref object) => match as_ns_error(object) {
                Some(e) => Err(e),
                None => Err(Error::UnexpectedResponse),
            },
            None => Err(Error::UnexpectedResponse),
        }
    }
}

/// Recognizes a decoded NSError and lifts it into the error type.
fn as_ns_error(value: &plist::Value) -> Option<Error> {
    let dict = value.as_dictionary()?;
    let code = dict.get("NSCode")?.as_signed_integer()?;
    let domain = dict.get("NSDomain")?.as_string()?.to_string();
    let description = dict
        .get("NSUserInfo")
        .and_then(|u| u.as_dictionary())
        .and_then(|u| u.get("NSLocalizedDescription"))
        .and_then(|d| d.as_string())
        .unwrap_or("no description")
        .to_string();
    Some(Error::RemoteNsError {
        domain,
        code,
        description,
    })
}

fn parse_app_info(dict: &plist::Dictionary) -> AppInfo {
    let string = |key: &str| {
        dict.get(key)
            .and_then(|v| v.as_string())
            .map(str::to_string)
    };
    AppInfo {
        bundle_identifier: string("CFBundleIdentifier").unwrap_or_default(),
        display_name: string("DisplayName"),
        executable_name: string("ExecutableName"),
        bundle_path: string("BundlePath"),
        version: string("Version"),
        app_type: string("Type"),
        restricted: dict.get("Restricted").and_then(|v| v.as_signed_integer()),
        placeholder: string("Placeholder"),
        container_bundle_identifier: string("ContainerBundleIdentifier"),
        container_bundle_path: string("ContainerBundlePath"),
        plugin_identifier: string("PluginIdentifier"),
        plugin_uuid: string("PluginUUID"),
        app_extension_uuids: dict
            .get("AppExtensionUUIDs")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_string())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn parse_process_info(dict: &plist::Dictionary) -> Option<ProcessInfo> {
    Some(ProcessInfo {
        pid: dict.get("pid")?.as_unsigned_integer()?,
        name: dict.get("name")?.as_string()?.to_string(),
        real_app_name: dict
            .get("realAppName")
            .and_then(|v| v.as_string())
            .unwrap_or_default()
            .to_string(),
        is_application: dict
            .get("isApplication")
            .and_then(|v| v.as_boolean())
            .unwrap_or(false),
        start_date: dict.get("startDate").and_then(|v| match v {
            plist::Value::Date(d) => Some(DateTime::<Utc>::from(std::time::SystemTime::from(*d))),
            _ => None,
        }),
    })
}
