//! Screenshot capture over the DeviceLink protocol.

use log::warn;

use crate::connection::DeviceConnection;
use crate::services::DeviceService;
use crate::Error;

/// Client for the screenshotr service.
///
/// DeviceLink opens with a version exchange; the device's offered version
/// is echoed back. Captures then go through `DLMessageProcessMessage`.
#[derive(Debug)]
pub struct ScreenshotClient {
    conn: DeviceConnection,
}

impl DeviceService for ScreenshotClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.screenshotr"
    }

    async fn from_stream(conn: DeviceConnection) -> Result<Self, Error> {
        let mut client = Self { conn };
        client.version_exchange().await?;
        Ok(client)
    }
}

impl ScreenshotClient {
    /// Receives a DeviceLink array and returns its leading tag plus the
    /// full array.
    async fn receive_dl_message(&mut self) -> Result<(String, Vec<plist::Value>), Error> {
        let value = self.conn.read_plist_value().await?;
        if let plist::Value::Array(array) = value {
            if let Some(plist::Value::String(tag)) = array.first() {
                return Ok((tag.clone(), array));
            }
        }
        warn!("malformed DeviceLink message");
        Err(Error::UnexpectedResponse)
    }

    async fn send_dl_array(&mut self, array: Vec<plist::Value>) -> Result<(), Error> {
        self.conn.send_bplist(plist::Value::Array(array)).await
    }

    async fn version_exchange(&mut self) -> Result<(), Error> {
        let (tag, array) = self.receive_dl_message().await?;
        if tag != "DLMessageVersionExchange" {
            warn!("expected DLMessageVersionExchange, got {tag}");
            return Err(Error::UnexpectedResponse);
        }
        let offered = array
            .get(1)
            .cloned()
            .ok_or(Error::UnexpectedResponse)?;

        self.send_dl_array(vec![
            "DLMessageVersionExchange".into(),
            "DLVersionsOk".into(),
            offered,
        ])
        .await?;

        let (tag, _) = self.receive_dl_message().await?;
        if tag != "DLMessageDeviceReady" {
            warn!("expected DLMessageDeviceReady, got {tag}");
            return Err(Error::UnexpectedResponse);
        }
        Ok(())
    }

    /// Captures the screen and returns the raw image stream (TIFF or PNG,
    /// depending on the OS build).
    pub async fn take_screenshot(&mut self) -> Result<Vec<u8>, Error> {
        let mut request = plist::Dictionary::new();
        request.insert("MessageType".into(), "ScreenShotRequest".into());
        self.send_dl_array(vec![
            "DLMessageProcessMessage".into(),
            plist::Value::Dictionary(request),
        ])
        .await?;

        let (tag, array) = self.receive_dl_message().await?;
        if tag != "DLMessageProcessMessage" {
            warn!("expected DLMessageProcessMessage, got {tag}");
            return Err(Error::UnexpectedResponse);
        }

        // The reply shape varies across OS builds; the screenshot map is
        // the first dictionary element wherever it sits.
        let map = array
            .iter()
            .find_map(|v| v.as_dictionary())
            .ok_or(Error::UnexpectedResponse)?;
        match map.get("ScreenShotData") {
            Some(plist::Value::Data(data)) => Ok(data.clone()),
            _ => {
                warn!("reply map carried no ScreenShotData");
                Err(Error::UnexpectedResponse)
            }
        }
    }
}
