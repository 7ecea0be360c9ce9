//! Serde mirrors of the usbmuxd reply envelopes.

use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceEntry>,
}

#[derive(Deserialize, Debug)]
pub struct DeviceEntry {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DeviceProperties,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceProperties {
    pub connection_type: String,
    pub serial_number: String,
    pub connection_speed: Option<i64>,
    #[serde(rename = "LocationID")]
    pub location_id: Option<i64>,
    #[serde(rename = "ProductID")]
    pub product_id: Option<i64>,
    pub interface_index: Option<i64>,
    pub network_address: Option<plist::Data>,
    pub escaped_full_service_name: Option<String>,
}
