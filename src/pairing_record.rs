//! Long-lived per-device pairing credentials.
//!
//! A pair record is generated once during pairing, persisted by usbmuxd
//! under the device's serial number, and read back at every session start.
//! Private keys never leave the host: the plist sent with the `Pair`
//! request omits them.

use log::warn;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use plist::Data;
use serde::{Deserialize, Serialize};

use crate::ca::PairCertificates;
use crate::Error;

#[derive(Clone, Debug)]
pub struct PairRecord {
    pub device_certificate: X509,
    pub host_certificate: X509,
    pub host_private_key: PKey<Private>,
    pub root_certificate: X509,
    pub root_private_key: PKey<Private>,
    pub host_id: String,
    pub system_buid: String,
    pub escrow_bag: Option<Vec<u8>>,
    pub wifi_mac_address: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RawPairRecord {
    device_certificate: Data,
    host_certificate: Data,
    host_private_key: Data,
    root_certificate: Data,
    root_private_key: Data,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    escrow_bag: Option<Data>,
    #[serde(rename = "WiFiMACAddress", skip_serializing_if = "Option::is_none")]
    wifi_mac_address: Option<String>,
}

impl PairRecord {
    /// Assembles a record from freshly generated certificate material.
    pub fn new(
        identity: PairCertificates,
        host_id: impl Into<String>,
        system_buid: impl Into<String>,
    ) -> Self {
        Self {
            device_certificate: identity.device_certificate,
            host_certificate: identity.host_certificate,
            host_private_key: identity.host_private_key,
            root_certificate: identity.root_certificate,
            root_private_key: identity.root_private_key,
            host_id: host_id.into(),
            system_buid: system_buid.into(),
            escrow_bag: None,
            wifi_mac_address: None,
        }
    }

    /// Parses the plist blob usbmuxd stores for a device.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let raw: RawPairRecord = match plist::from_bytes(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("unable to parse pair record plist: {e:?}");
                return Err(Error::UnexpectedResponse);
            }
        };
        raw.try_into()
    }

    /// Serializes the record, private keys included, for usbmuxd storage.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let raw = RawPairRecord::try_from(self)?;
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }

    /// The record as sent with the lockdown `Pair` request: certificates and
    /// identifiers only, no private keys.
    pub fn pair_request_value(&self) -> Result<plist::Value, Error> {
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "DeviceCertificate".into(),
            plist::Value::Data(self.device_certificate.to_pem()?),
        );
        dict.insert(
            "HostCertificate".into(),
            plist::Value::Data(self.host_certificate.to_pem()?),
        );
        dict.insert(
            "RootCertificate".into(),
            plist::Value::Data(self.root_certificate.to_pem()?),
        );
        dict.insert("HostID".into(), self.host_id.clone().into());
        dict.insert("SystemBUID".into(), self.system_buid.clone().into());
        Ok(plist::Value::Dictionary(dict))
    }
}

impl TryFrom<RawPairRecord> for PairRecord {
    type Error = Error;

    fn try_from(value: RawPairRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            device_certificate: X509::from_pem(&Into::<Vec<u8>>::into(value.device_certificate))?,
            host_certificate: X509::from_pem(&Into::<Vec<u8>>::into(value.host_certificate))?,
            host_private_key: PKey::private_key_from_pem(&Into::<Vec<u8>>::into(
                value.host_private_key,
            ))?,
            root_certificate: X509::from_pem(&Into::<Vec<u8>>::into(value.root_certificate))?,
            root_private_key: PKey::private_key_from_pem(&Into::<Vec<u8>>::into(
                value.root_private_key,
            ))?,
            host_id: value.host_id,
            system_buid: value.system_buid,
            escrow_bag: value.escrow_bag.map(Into::into),
            wifi_mac_address: value.wifi_mac_address,
        })
    }
}

impl TryFrom<&PairRecord> for RawPairRecord {
    type Error = Error;

    fn try_from(value: &PairRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            device_certificate: Data::new(value.device_certificate.to_pem()?),
            host_certificate: Data::new(value.host_certificate.to_pem()?),
            host_private_key: Data::new(value.host_private_key.private_key_to_pem_pkcs8()?),
            root_certificate: Data::new(value.root_certificate.to_pem()?),
            root_private_key: Data::new(value.root_private_key.private_key_to_pem_pkcs8()?),
            host_id: value.host_id.clone(),
            system_buid: value.system_buid.clone(),
            escrow_bag: value.escrow_bag.clone().map(Data::new),
            wifi_mac_address: value.wifi_mac_address.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca;

    fn sample_record() -> PairRecord {
        let identity =
            ca::generate_pair_certificates(&ca::tests::sample_device_public_key_pem()).unwrap();
        let mut record = PairRecord::new(identity, "ABCDEF01-2345-6789-ABCD-EF0123456789", "buid");
        record.escrow_bag = Some(vec![1, 2, 3, 4]);
        record.wifi_mac_address = Some("aa:bb:cc:dd:ee:ff".into());
        record
    }

    #[test]
    fn serialize_then_parse_preserves_the_record() {
        let record = sample_record();
        let bytes = record.serialize().unwrap();
        let parsed = PairRecord::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.host_id, record.host_id);
        assert_eq!(parsed.system_buid, record.system_buid);
        assert_eq!(parsed.escrow_bag, record.escrow_bag);
        assert_eq!(parsed.wifi_mac_address, record.wifi_mac_address);
        assert_eq!(
            parsed.device_certificate.to_pem().unwrap(),
            record.device_certificate.to_pem().unwrap()
        );
        assert_eq!(
            parsed.root_certificate.to_pem().unwrap(),
            record.root_certificate.to_pem().unwrap()
        );
    }

    #[test]
    fn pair_request_form_carries_no_private_keys() {
        let record = sample_record();
        let value = record.pair_request_value().unwrap();
        let dict = value.as_dictionary().unwrap();

        assert!(dict.contains_key("DeviceCertificate"));
        assert!(dict.contains_key("HostCertificate"));
        assert!(dict.contains_key("RootCertificate"));
        assert!(dict.contains_key("HostID"));
        assert!(dict.contains_key("SystemBUID"));
        assert!(!dict.contains_key("HostPrivateKey"));
        assert!(!dict.contains_key("RootPrivateKey"));
        assert!(!dict.contains_key("EscrowBag"));
    }
}
