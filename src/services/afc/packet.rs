//! AFC packet framing.
//!
//! Every packet starts with a 40-byte header: the 8-byte magic, then four
//! little-endian u64 fields. `header_payload` (operation arguments) follows
//! to `this_len`, bulk `payload` to `entire_len`.

use log::debug;

use crate::connection::DeviceConnection;
use crate::Error;

use super::opcode::AfcOpcode;

#[derive(Clone, Debug, PartialEq)]
pub struct AfcPacketHeader {
    pub magic: u64,
    pub entire_len: u64,
    pub this_len: u64,
    pub packet_num: u64,
    pub operation: AfcOpcode,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacketHeader {
    pub const LEN: u64 = 40;

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(Self::LEN as usize);
        res.extend_from_slice(&self.magic.to_le_bytes());
        res.extend_from_slice(&self.entire_len.to_le_bytes());
        res.extend_from_slice(&self.this_len.to_le_bytes());
        res.extend_from_slice(&self.packet_num.to_le_bytes());
        res.extend_from_slice(&(self.operation as u64).to_le_bytes());
        res
    }

    pub async fn read(conn: &mut DeviceConnection) -> Result<Self, Error> {
        let bytes = conn.read_raw(Self::LEN as usize).await?;
        let mut chunks = bytes.chunks_exact(8);
        let magic = u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap());
        let entire_len = u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap());
        let this_len = u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap());
        let packet_num = u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap());
        let operation = u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap());

        if magic != super::MAGIC {
            return Err(Error::InvalidAfcMagic);
        }
        if this_len < Self::LEN || entire_len < this_len {
            return Err(Error::UnexpectedResponse);
        }
        let operation =
            AfcOpcode::try_from(operation).map_err(|_| Error::UnknownAfcOpcode(operation))?;

        Ok(Self {
            magic,
            entire_len,
            this_len,
            packet_num,
            operation,
        })
    }
}

impl AfcPacket {
    /// Builds a request packet with the length fields derived from the two
    /// body parts.
    pub fn new(
        operation: AfcOpcode,
        packet_num: u64,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Self {
        let this_len = AfcPacketHeader::LEN + header_payload.len() as u64;
        Self {
            header: AfcPacketHeader {
                magic: super::MAGIC,
                entire_len: this_len + payload.len() as u64,
                this_len,
                packet_num,
                operation,
            },
            header_payload,
            payload,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = self.header.serialize();
        res.extend_from_slice(&self.header_payload);
        res.extend_from_slice(&self.payload);
        res
    }

    pub async fn read(conn: &mut DeviceConnection) -> Result<Self, Error> {
        let header = AfcPacketHeader::read(conn).await?;
        debug!("afc header: {header:?}");

        let header_payload = conn
            .read_raw((header.this_len - AfcPacketHeader::LEN) as usize)
            .await?;
        let payload = if header.entire_len == header.this_len {
            Vec::new()
        } else {
            conn.read_raw((header.entire_len - header.this_len) as usize)
                .await?
        };

        Ok(Self {
            header,
            header_payload,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_fields_cover_both_body_parts() {
        let packet = AfcPacket::new(
            AfcOpcode::Write,
            7,
            vec![1, 2, 3, 4, 5, 6, 7, 8],
            vec![0xaa; 100],
        );
        assert_eq!(packet.header.this_len, 40 + 8);
        assert_eq!(packet.header.entire_len, 40 + 8 + 100);
        assert_eq!(packet.header.packet_num, 7);

        let bytes = packet.serialize();
        assert_eq!(bytes.len() as u64, packet.header.entire_len);
        assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), super::super::MAGIC);
    }

    #[tokio::test]
    async fn serialized_packets_parse_back() {
        use tokio::io::AsyncWriteExt;

        let packet = AfcPacket::new(
            AfcOpcode::ReadDir,
            1,
            b"/Downloads\0".to_vec(),
            Vec::new(),
        );

        let (client, mut remote) = tokio::io::duplex(4096);
        let mut conn = DeviceConnection::new(Box::new(client), "test");
        remote.write_all(&packet.serialize()).await.unwrap();

        let parsed = AfcPacket::read(&mut conn).await.unwrap();
        assert_eq!(parsed, packet);
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        use tokio::io::AsyncWriteExt;

        let mut packet = AfcPacket::new(AfcOpcode::ReadDir, 1, Vec::new(), Vec::new());
        packet.header.magic = 0x1122334455667788;

        let (client, mut remote) = tokio::io::duplex(4096);
        let mut conn = DeviceConnection::new(Box::new(client), "test");
        remote.write_all(&packet.serialize()).await.unwrap();

        assert!(matches!(
            AfcPacket::read(&mut conn).await,
            Err(Error::InvalidAfcMagic)
        ));
    }
}
