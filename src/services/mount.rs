//! The disk image mounter, used for developer images.

use log::{debug, warn};

use crate::connection::DeviceConnection;
use crate::services::DeviceService;
use crate::Error;

/// Client for the mobile image mounter service.
#[derive(Debug)]
pub struct ImageMounterClient {
    conn: DeviceConnection,
}

impl DeviceService for ImageMounterClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.mobile_image_mounter"
    }

    async fn from_stream(conn: DeviceConnection) -> Result<Self, Error> {
        Ok(Self { conn })
    }
}

impl ImageMounterClient {
    fn status_of(res: &plist::Dictionary) -> Option<&str> {
        res.get("Status").and_then(|s| s.as_string())
    }

    /// Returns the signatures of images already mounted for `image_type`
    /// (usually "Developer"). Empty when nothing is mounted.
    pub async fn lookup_image(&mut self, image_type: &str) -> Result<Vec<Vec<u8>>, Error> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "LookupImage".into());
        req.insert("ImageType".into(), image_type.into());
        self.conn.send_plist(plist::Value::Dictionary(req)).await?;

        let res = self.conn.read_plist().await?;
        match res.get("ImageSignature") {
            Some(plist::Value::Array(signatures)) => Ok(signatures
                .iter()
                .filter_map(|s| s.as_data().map(<[u8]>::to_vec))
                .collect()),
            Some(plist::Value::Data(signature)) => Ok(vec![signature.clone()]),
            _ => Ok(Vec::new()),
        }
    }

    /// Streams an image to the device: a `ReceiveBytes` announcement, the
    /// raw bytes after the ack, then a completion status.
    pub async fn upload_image(
        &mut self,
        image_type: &str,
        image: &[u8],
        signature: &[u8],
    ) -> Result<(), Error> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "ReceiveBytes".into());
        req.insert("ImageType".into(), image_type.into());
        req.insert("ImageSize".into(), (image.len() as u64).into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature.to_vec()));
        self.conn.send_plist(plist::Value::Dictionary(req)).await?;

        let res = self.conn.read_plist().await?;
        match Self::status_of(&res) {
            Some("ReceiveBytesAck") => {}
            status => {
                warn!("upload not acknowledged: {status:?}");
                return Err(Error::UnexpectedResponse);
            }
        }

        debug!("streaming {} image bytes", image.len());
        self.conn.send_raw(image).await?;

        let res = self.conn.read_plist().await?;
        match Self::status_of(&res) {
            Some("Complete") => Ok(()),
            status => {
                warn!("upload finished with status {status:?}");
                Err(Error::UnexpectedResponse)
            }
        }
    }

    /// Mounts a previously uploaded image.
    pub async fn mount_image(
        &mut self,
        image_path: &str,
        image_type: &str,
        signature: &[u8],
    ) -> Result<(), Error> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "MountImage".into());
        req.insert("ImageType".into(), image_type.into());
        req.insert("ImagePath".into(), image_path.into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature.to_vec()));
        self.conn.send_plist(plist::Value::Dictionary(req)).await?;

        let res = self.conn.read_plist().await?;
        match Self::status_of(&res) {
            Some("Complete") => Ok(()),
            status => {
                warn!("mount finished with status {status:?}");
                Err(Error::UnexpectedResponse)
            }
        }
    }
}
