//! DTX message framing: 32-byte headers, fragmentation and the payload
//! envelope around auxiliary slots plus a keyed-archive selector object.

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{ns_archive, Error};

use super::message_aux::{parse_aux, serialize_aux, AuxValue};

pub const MESSAGE_MAGIC: u32 = 0x1F3D5B79;
pub const HEADER_LEN: u32 = 32;
pub const PAYLOAD_HEADER_LEN: usize = 16;

/// Payload flag for an object-plus-aux method invocation.
const FLAG_INVOCATION: u32 = 0x2;
/// Payload flag set when the sender expects a reply.
const FLAG_EXPECTS_REPLY: u32 = 0x1000;

/// The fixed per-fragment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub fragment_id: u16,
    pub fragment_count: u16,
    /// Bytes following the header for this fragment.
    pub length: u32,
    pub identifier: u32,
    /// 0 on requests, 1 on replies.
    pub conversation_index: u32,
    pub channel_code: u32,
    pub expects_reply: bool,
}

impl MessageHeader {
    pub fn parse(buf: &[u8; 32]) -> Result<Self, Error> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MESSAGE_MAGIC {
            return Err(Error::DtxBadMagic(magic));
        }
        Ok(Self {
            fragment_id: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
            fragment_count: u16::from_le_bytes(buf[10..12].try_into().unwrap()),
            length: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            identifier: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            conversation_index: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            channel_code: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            expects_reply: u32::from_le_bytes(buf[28..32].try_into().unwrap()) == 1,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(HEADER_LEN as usize);
        res.extend_from_slice(&MESSAGE_MAGIC.to_le_bytes());
        res.extend_from_slice(&HEADER_LEN.to_le_bytes());
        res.extend_from_slice(&self.fragment_id.to_le_bytes());
        res.extend_from_slice(&self.fragment_count.to_le_bytes());
        res.extend_from_slice(&self.length.to_le_bytes());
        res.extend_from_slice(&self.identifier.to_le_bytes());
        res.extend_from_slice(&self.conversation_index.to_le_bytes());
        res.extend_from_slice(&self.channel_code.to_le_bytes());
        res.extend_from_slice(&u32::from(self.expects_reply).to_le_bytes());
        res
    }
}

/// One reassembled logical message.
#[derive(Debug)]
pub struct Message {
    pub header: MessageHeader,
    pub aux: Vec<AuxValue>,
    /// The selector or return object, when one is present.
    pub object: Option<plist::Value>,
}

impl Message {
    /// Reads fragments off `reader` until a full message is assembled.
    ///
    /// When `fragment_count > 1`, the leading fragment (id 0) carries no
    /// body; subsequent fragments of the same identifier are concatenated
    /// in order.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, Error> {
        let mut body: Vec<u8> = Vec::new();
        let mut expected: Option<(u32, u16)> = None;

        let header = loop {
            let mut buf = [0u8; 32];
            reader.read_exact(&mut buf).await?;
            let header = MessageHeader::parse(&buf)?;
            debug!("dtx fragment {header:?}");

            if let Some((identifier, next_id)) = expected {
                if header.identifier != identifier || header.fragment_id != next_id {
                    return Err(Error::DtxFragmentOutOfOrder);
                }
            }

            if header.fragment_id == 0 && header.fragment_count > 1 {
                // The head fragment is header-only.
                expected = Some((header.identifier, 1));
                continue;
            }

            let mut fragment = vec![0u8; header.length as usize];
            reader.read_exact(&mut fragment).await?;
            body.extend_from_slice(&fragment);

            if header.fragment_id == header.fragment_count.saturating_sub(1) {
                break header;
            }
            expected = Some((header.identifier, header.fragment_id + 1));
        };

        let (aux, object) = parse_payload(&body)?;
        Ok(Self {
            header,
            aux,
            object,
        })
    }

    /// Encodes a single-fragment message.
    pub fn encode(
        identifier: u32,
        conversation_index: u32,
        channel_code: u32,
        expects_reply: bool,
        selector: Option<&plist::Value>,
        aux: Option<&[AuxValue]>,
    ) -> Result<Vec<u8>, Error> {
        let aux = match aux {
            Some(values) => serialize_aux(values)?,
            None => Vec::new(),
        };
        let object = match selector {
            Some(value) => ns_archive::encode_to_bytes(value)?,
            None => Vec::new(),
        };

        let mut flags = FLAG_INVOCATION;
        if expects_reply {
            flags |= FLAG_EXPECTS_REPLY;
        }
        let total_length = (aux.len() + object.len()) as u64;

        let header = MessageHeader {
            fragment_id: 0,
            fragment_count: 1,
            length: PAYLOAD_HEADER_LEN as u32 + total_length as u32,
            identifier,
            conversation_index,
            channel_code,
            expects_reply,
        };

        let mut out = header.serialize();
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&(aux.len() as u32).to_le_bytes());
        out.extend_from_slice(&total_length.to_le_bytes());
        out.extend_from_slice(&aux);
        out.extend_from_slice(&object);
        Ok(out)
    }
}

fn parse_payload(body: &[u8]) -> Result<(Vec<AuxValue>, Option<plist::Value>), Error> {
    if body.is_empty() {
        return Ok((Vec::new(), None));
    }
    if body.len() < PAYLOAD_HEADER_LEN {
        return Err(Error::UnexpectedResponse);
    }

    let flags = u32::from_le_bytes(body[0..4].try_into().unwrap());
    let aux_length = u32::from_le_bytes(body[4..8].try_into().unwrap()) as usize;
    let total_length = u64::from_le_bytes(body[8..16].try_into().unwrap()) as usize;

    // The expects-reply marker shares bit 12 with the compression field;
    // mask it off before deciding the payload is compressed.
    let compression = ((flags & !FLAG_EXPECTS_REPLY) >> 12) & 0xff;
    if compression != 0 {
        return Err(Error::DtxCompressionUnsupported(compression));
    }

    if body.len() < PAYLOAD_HEADER_LEN + total_length || aux_length > total_length {
        return Err(Error::UnexpectedResponse);
    }

    let aux_bytes = &body[PAYLOAD_HEADER_LEN..PAYLOAD_HEADER_LEN + aux_length];
    let object_bytes =
        &body[PAYLOAD_HEADER_LEN + aux_length..PAYLOAD_HEADER_LEN + total_length];

    let aux = if aux_bytes.is_empty() {
        Vec::new()
    } else {
        parse_aux(aux_bytes)?
    };
    let object = if object_bytes.is_empty() {
        None
    } else {
        Some(ns_archive::decode_from_bytes(object_bytes)?)
    };
    Ok((aux, object))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message_bytes() -> Vec<u8> {
        Message::encode(
            3,
            0,
            1,
            true,
            Some(&plist::Value::String("runningProcesses".into())),
            Some(&[AuxValue::I32(9)]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn single_fragment_round_trip() {
        let bytes = sample_message_bytes();
        let mut reader = &bytes[..];
        let message = Message::read_from(&mut reader).await.unwrap();

        assert_eq!(message.header.identifier, 3);
        assert_eq!(message.header.channel_code, 1);
        assert!(message.header.expects_reply);
        assert_eq!(message.aux, vec![AuxValue::I32(9)]);
        assert_eq!(
            message.object,
            Some(plist::Value::String("runningProcesses".into()))
        );
    }

    /// Splits an encoded message into a header-only fragment 0 plus body
    /// fragments, the way the server fragments large replies.
    fn fragment(bytes: &[u8], pieces: u16) -> Vec<u8> {
        let body = &bytes[32..];
        let chunk = body.len().div_ceil(pieces as usize);
        let count = pieces + 1;

        let mut out = Vec::new();
        let mut head = MessageHeader::parse(bytes[0..32].try_into().unwrap()).unwrap();
        head.fragment_id = 0;
        head.fragment_count = count;
        out.extend_from_slice(&head.serialize());

        for (i, part) in body.chunks(chunk).enumerate() {
            let mut header = head.clone();
            header.fragment_id = i as u16 + 1;
            header.length = part.len() as u32;
            out.extend_from_slice(&header.serialize());
            out.extend_from_slice(part);
        }
        out
    }

    #[tokio::test]
    async fn fragments_reassemble_to_the_original_body() {
        let bytes = sample_message_bytes();
        let fragmented = fragment(&bytes, 3);

        let mut reader = &fragmented[..];
        let message = Message::read_from(&mut reader).await.unwrap();
        assert_eq!(message.aux, vec![AuxValue::I32(9)]);
        assert_eq!(
            message.object,
            Some(plist::Value::String("runningProcesses".into()))
        );
    }

    #[tokio::test]
    async fn missing_final_fragment_yields_no_message() {
        let bytes = sample_message_bytes();
        let fragmented = fragment(&bytes, 3);
        // Drop the last fragment (header + body chunk).
        let truncated = &fragmented[..fragmented.len() - 32 - (bytes.len() - 32).div_ceil(3)];

        let mut reader = truncated;
        let err = Message::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn interleaved_identifiers_are_rejected() {
        let bytes = sample_message_bytes();
        let mut fragmented = fragment(&bytes, 2);
        // Corrupt the identifier of the second body fragment.
        let second_header = 32 + 32 + (bytes.len() - 32).div_ceil(2);
        fragmented[second_header + 16] ^= 0xff;

        let mut reader = &fragmented[..];
        assert!(matches!(
            Message::read_from(&mut reader).await,
            Err(Error::DtxFragmentOutOfOrder)
        ));
    }

    #[tokio::test]
    async fn wrong_magic_is_rejected() {
        let mut bytes = sample_message_bytes();
        bytes[0] = 0;
        let mut reader = &bytes[..];
        assert!(matches!(
            Message::read_from(&mut reader).await,
            Err(Error::DtxBadMagic(_))
        ));
    }

    #[tokio::test]
    async fn compressed_payloads_are_rejected() {
        let bytes = sample_message_bytes();
        let mut with_compression = bytes.clone();
        // Compression nibble lives above bit 12 of the payload flags.
        with_compression[32 + 2] |= 0x2;

        let mut reader = &with_compression[..];
        assert!(matches!(
            Message::read_from(&mut reader).await,
            Err(Error::DtxCompressionUnsupported(_))
        ));
    }
}
