//! House arrest: AFC access into an app's sandbox.

use log::warn;

use crate::connection::DeviceConnection;
use crate::services::afc::AfcClient;
use crate::services::DeviceService;
use crate::Error;

/// Client for the house arrest service.
///
/// After a successful vend command the same channel switches protocols and
/// speaks AFC rooted in the app's sandbox, so vending consumes the client.
#[derive(Debug)]
pub struct HouseArrestClient {
    conn: DeviceConnection,
}

impl DeviceService for HouseArrestClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.house_arrest"
    }

    async fn from_stream(conn: DeviceConnection) -> Result<Self, Error> {
        Ok(Self { conn })
    }
}

impl HouseArrestClient {
    /// Vends the app's Documents directory. Only paths under `/Documents`
    /// are accessible afterwards.
    pub async fn vend_documents(self, bundle_id: &str) -> Result<AfcClient, Error> {
        self.vend("VendDocuments", bundle_id).await
    }

    /// Vends the app's whole container.
    pub async fn vend_container(self, bundle_id: &str) -> Result<AfcClient, Error> {
        self.vend("VendContainer", bundle_id).await
    }

    async fn vend(mut self, command: &str, bundle_id: &str) -> Result<AfcClient, Error> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), command.into());
        req.insert("Identifier".into(), bundle_id.into());
        self.conn.send_plist(plist::Value::Dictionary(req)).await?;

        let res = self.conn.read_plist().await?;
        match res.get("Status").and_then(|s| s.as_string()) {
            Some("Complete") => Ok(AfcClient::new(self.conn)),
            Some(status) => {
                warn!("vend finished with status {status}");
                Err(Error::Lockdown(status.to_string()))
            }
            None => Err(Error::UnexpectedResponse),
        }
    }
}
