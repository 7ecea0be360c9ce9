//! The installation proxy: the device's installed-application catalog.

use log::warn;

use crate::connection::DeviceConnection;
use crate::services::DeviceService;
use crate::Error;

/// Filtering options for browse and lookup commands.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// "System", "User", "Internal" or "Any".
    pub application_type: Option<String>,
    /// Restrict the returned dictionaries to these keys.
    pub return_attributes: Option<Vec<String>>,
    /// Restrict `lookup` to these bundle ids.
    pub bundle_ids: Option<Vec<String>>,
    /// Ask for the installation metadata blob as well.
    pub metadata: bool,
}

impl ClientOptions {
    fn to_value(&self) -> plist::Value {
        let mut dict = plist::Dictionary::new();
        if let Some(t) = &self.application_type {
            dict.insert("ApplicationType".into(), t.clone().into());
        }
        if let Some(attributes) = &self.return_attributes {
            dict.insert(
                "ReturnAttributes".into(),
                plist::Value::Array(attributes.iter().map(|a| a.clone().into()).collect()),
            );
        }
        if let Some(ids) = &self.bundle_ids {
            dict.insert(
                "BundleIDs".into(),
                plist::Value::Array(ids.iter().map(|i| i.clone().into()).collect()),
            );
        }
        if self.metadata {
            dict.insert("com.apple.mobile_installation.metadata".into(), true.into());
        }
        plist::Value::Dictionary(dict)
    }
}

/// Client for the installation proxy service.
#[derive(Debug)]
pub struct InstallationProxyClient {
    conn: DeviceConnection,
}

impl DeviceService for InstallationProxyClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.installation_proxy"
    }

    async fn from_stream(conn: DeviceConnection) -> Result<Self, Error> {
        Ok(Self { conn })
    }
}

impl InstallationProxyClient {
    fn command(command: &str, options: Option<&ClientOptions>) -> plist::Value {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), command.into());
        if let Some(options) = options {
            req.insert("ClientOptions".into(), options.to_value());
        }
        plist::Value::Dictionary(req)
    }

    /// Enumerates installed applications. The device pages the result as
    /// `CurrentList` chunks until a `Complete` status.
    pub async fn browse(
        &mut self,
        options: Option<&ClientOptions>,
    ) -> Result<Vec<plist::Dictionary>, Error> {
        self.conn
            .send_plist(Self::command("Browse", options))
            .await?;

        let mut apps = Vec::new();
        loop {
            let res = self.conn.read_plist().await?;
            match res.get("Status").and_then(|s| s.as_string()) {
                Some("Complete") => break,
                Some(_) => {}
                None => return Err(Error::UnexpectedResponse),
            }
            if let Some(plist::Value::Array(list)) = res.get("CurrentList") {
                apps.extend(
                    list.iter()
                        .filter_map(|v| v.as_dictionary())
                        .cloned(),
                );
            }
        }
        Ok(apps)
    }

    /// Looks up applications, keyed by bundle id.
    pub async fn lookup(
        &mut self,
        options: Option<&ClientOptions>,
    ) -> Result<plist::Dictionary, Error> {
        self.conn
            .send_plist(Self::command("Lookup", options))
            .await?;

        let res = self.conn.read_plist().await?;
        match res.get("Status").and_then(|s| s.as_string()) {
            Some("Complete") => match res.get("LookupResult") {
                Some(plist::Value::Dictionary(result)) => Ok(result.clone()),
                _ => Err(Error::UnexpectedResponse),
            },
            Some(status) => {
                warn!("lookup finished with status {status}");
                Err(Error::UnexpectedResponse)
            }
            None => Err(Error::UnexpectedResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn send_frame(remote: &mut tokio::io::DuplexStream, dict: plist::Dictionary) {
        let mut body = Vec::new();
        plist::Value::Dictionary(dict).to_writer_xml(&mut body).unwrap();
        remote
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        remote.write_all(&body).await.unwrap();
    }

    #[tokio::test]
    async fn browse_accumulates_pages_until_complete() {
        let (client, mut remote) = tokio::io::duplex(64 * 1024);
        let mut proxy = InstallationProxyClient::from_stream(DeviceConnection::new(
            Box::new(client),
            "test",
        ))
        .await
        .unwrap();

        let device = tokio::spawn(async move {
            // Swallow the request frame.
            let mut len = [0u8; 4];
            remote.read_exact(&mut len).await.unwrap();
            let mut body = vec![0; u32::from_be_bytes(len) as usize];
            remote.read_exact(&mut body).await.unwrap();

            for name in ["app-one", "app-two"] {
                let mut entry = plist::Dictionary::new();
                entry.insert("CFBundleIdentifier".into(), name.into());
                let mut page = plist::Dictionary::new();
                page.insert("Status".into(), "BrowsingApplications".into());
                page.insert(
                    "CurrentList".into(),
                    plist::Value::Array(vec![plist::Value::Dictionary(entry)]),
                );
                send_frame(&mut remote, page).await;
            }

            let mut done = plist::Dictionary::new();
            done.insert("Status".into(), "Complete".into());
            send_frame(&mut remote, done).await;
        });

        let apps = proxy.browse(None).await.unwrap();
        assert_eq!(apps.len(), 2);
        assert_eq!(
            apps[1].get("CFBundleIdentifier").and_then(|v| v.as_string()),
            Some("app-two")
        );
        device.await.unwrap();
    }
}
