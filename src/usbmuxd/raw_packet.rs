//! The 16-byte little-endian frame every usbmuxd message travels in.

use crate::Error;

/// One framed usbmuxd message: header fields plus an XML plist body.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    pub version: u32,
    pub message: u32,
    pub tag: u32,
    pub plist: plist::Dictionary,
}

impl RawPacket {
    pub const HEADER_LEN: u32 = 16;

    pub const XML_PLIST_VERSION: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    pub fn new(plist: plist::Dictionary, version: u32, message: u32, tag: u32) -> Self {
        Self {
            version,
            message,
            tag,
            plist,
        }
    }

    /// Serializes header plus XML body. The length field counts the header
    /// itself, so it is always `body + 16`.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let mut body = Vec::new();
        plist::Value::Dictionary(self.plist.clone()).to_writer_xml(&mut body)?;

        let mut res = Vec::with_capacity(Self::HEADER_LEN as usize + body.len());
        res.extend_from_slice(&(body.len() as u32 + Self::HEADER_LEN).to_le_bytes());
        res.extend_from_slice(&self.version.to_le_bytes());
        res.extend_from_slice(&self.message.to_le_bytes());
        res.extend_from_slice(&self.tag.to_le_bytes());
        res.extend_from_slice(&body);
        Ok(res)
    }

    /// Parses one complete frame.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::HEADER_LEN as usize {
            return Err(Error::UnexpectedResponse);
        }
        let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if size as usize != bytes.len() {
            return Err(Error::UnexpectedResponse);
        }
        Ok(Self {
            version: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            message: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            tag: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            plist: plist::from_bytes(&bytes[16..])?,
        })
    }
}
