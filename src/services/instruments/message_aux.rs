//! The typed auxiliary slots DTX messages carry their arguments in.

use log::warn;

use crate::{ns_archive, Error};

/// Magic leading the auxiliary section.
const AUX_MAGIC: u64 = 0x1f0;

/// Per-slot tag; every serialized slot starts with it.
const SLOT_TAG: u32 = 10;

const TYPE_OBJECT: u32 = 2;
const TYPE_I32: u32 = 3;
const TYPE_I64: u32 = 4;
const TYPE_I32_ALT: u32 = 5;
const TYPE_I64_ALT: u32 = 6;
const TYPE_KEY_MARKER: u32 = 10;

/// One auxiliary argument.
#[derive(Debug, Clone, PartialEq)]
pub enum AuxValue {
    /// A keyed-archive object.
    Object(plist::Value),
    I32(i32),
    I64(i64),
}

impl AuxValue {
    /// Shorthand for an archived plist object.
    pub fn object(value: impl Into<plist::Value>) -> Self {
        Self::Object(value.into())
    }
}

/// Serializes slots behind the 16-byte auxiliary header.
pub fn serialize_aux(values: &[AuxValue]) -> Result<Vec<u8>, Error> {
    let mut body = Vec::new();
    for value in values {
        body.extend_from_slice(&SLOT_TAG.to_le_bytes());
        match value {
            AuxValue::Object(object) => {
                let archived = ns_archive::encode_to_bytes(object)?;
                body.extend_from_slice(&TYPE_OBJECT.to_le_bytes());
                body.extend_from_slice(&(archived.len() as u32).to_le_bytes());
                body.extend_from_slice(&archived);
            }
            AuxValue::I32(v) => {
                body.extend_from_slice(&TYPE_I32.to_le_bytes());
                body.extend_from_slice(&v.to_le_bytes());
            }
            AuxValue::I64(v) => {
                body.extend_from_slice(&TYPE_I64.to_le_bytes());
                body.extend_from_slice(&v.to_le_bytes());
            }
        }
    }

    let mut out = Vec::with_capacity(16 + body.len());
    out.extend_from_slice(&AUX_MAGIC.to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parses an auxiliary section.
pub fn parse_aux(bytes: &[u8]) -> Result<Vec<AuxValue>, Error> {
    if bytes.len() < 16 {
        return Ok(Vec::new());
    }
    let magic = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    if magic != AUX_MAGIC {
        // Some server builds put a buffer-size hint here instead.
        warn!("odd aux header {magic:#x}");
    }

    let mut rest = &bytes[16..];
    let mut values = Vec::new();
    loop {
        if rest.len() < 8 {
            break;
        }
        // tag, then the type code
        let type_code = u32::from_le_bytes(rest[4..8].try_into().unwrap());
        rest = &rest[8..];
        match type_code {
            TYPE_OBJECT => {
                if rest.len() < 4 {
                    return Err(Error::UnexpectedResponse);
                }
                let len = u32::from_le_bytes(rest[0..4].try_into().unwrap()) as usize;
                rest = &rest[4..];
                if rest.len() < len {
                    return Err(Error::UnexpectedResponse);
                }
                values.push(AuxValue::Object(ns_archive::decode_from_bytes(&rest[..len])?));
                rest = &rest[len..];
            }
            TYPE_I32 | TYPE_I32_ALT => {
                if rest.len() < 4 {
                    return Err(Error::UnexpectedResponse);
                }
                values.push(AuxValue::I32(i32::from_le_bytes(
                    rest[0..4].try_into().unwrap(),
                )));
                rest = &rest[4..];
            }
            TYPE_I64 | TYPE_I64_ALT => {
                if rest.len() < 8 {
                    return Err(Error::UnexpectedResponse);
                }
                values.push(AuxValue::I64(i64::from_le_bytes(
                    rest[0..8].try_into().unwrap(),
                )));
                rest = &rest[8..];
            }
            TYPE_KEY_MARKER => {
                // dictionary-key marker, no value follows
            }
            other => return Err(Error::DtxUnknownAuxType(other)),
        }
    }
    Ok(values)
}
