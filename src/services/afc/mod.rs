//! AFC, the file-conduit service.
//!
//! A binary, length-prefixed, strictly ordered request/response protocol.
//! One request is outstanding per channel at any time; callers that need
//! parallel transfers open additional AFC channels.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::warn;

use crate::connection::DeviceConnection;
use crate::services::DeviceService;
use crate::Error;

use errors::AfcError;
use file::FileHandle;
use opcode::{AfcFopenMode, AfcOpcode, LinkType};
use packet::AfcPacket;

pub mod errors;
pub mod file;
pub mod opcode;
pub mod packet;

/// "CFA6LPAA", the magic leading every AFC packet.
pub const MAGIC: u64 = 0x4141504c36414643;

/// Client for the AFC service.
pub struct AfcClient {
    conn: DeviceConnection,
    packet_num: u64,
}

impl std::fmt::Debug for AfcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfcClient")
            .field("packet_num", &self.packet_num)
            .finish()
    }
}

/// Information about a file or directory on the device.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// Creation time, when the filesystem reports one.
    pub created: Option<DateTime<Utc>>,
    /// `S_IFDIR`, `S_IFREG`, `S_IFLNK`, ...
    pub st_ifmt: String,
    /// Allocated block count.
    pub blocks: Option<u64>,
    /// Hard link count.
    pub st_nlink: Option<u64>,
    /// Symlink target, for `S_IFLNK` entries.
    pub link_target: Option<String>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.st_ifmt == "S_IFDIR"
    }
}

/// Information about the device filesystem.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub model: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub block_size: u64,
}

impl DeviceService for AfcClient {
    fn service_name() -> &'static str {
        "com.apple.afc"
    }

    async fn from_stream(conn: DeviceConnection) -> Result<Self, Error> {
        Ok(Self::new(conn))
    }
}

impl AfcClient {
    /// Wraps an established AFC channel. House arrest hands its channel
    /// over through here once vending completes.
    pub fn new(conn: DeviceConnection) -> Self {
        Self {
            conn,
            packet_num: 0,
        }
    }

    /// Sends one operation and reads its reply, translating `Status`
    /// packets into errors. The packet number increments before each
    /// request.
    pub(crate) async fn operation(
        &mut self,
        opcode: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<AfcPacket, Error> {
        self.packet_num += 1;
        let packet = AfcPacket::new(opcode, self.packet_num, header_payload, payload);
        self.conn.send_raw(&packet.serialize()).await?;

        let res = AfcPacket::read(&mut self.conn).await?;
        if res.header.operation == AfcOpcode::Status {
            if res.header_payload.len() < 8 {
                warn!("status packet without a code");
                return Err(Error::UnexpectedResponse);
            }
            let code = u64::from_le_bytes(res.header_payload[..8].try_into().unwrap());
            let e = AfcError::from(code);
            if e != AfcError::Success {
                return Err(Error::Afc(e));
            }
        }
        Ok(res)
    }

    /// Lists a directory. The `.` and `..` entries the device leads with
    /// are dropped; `prefix` joins the remaining names onto `path`.
    pub async fn read_dir(
        &mut self,
        path: impl Into<String>,
        prefix: bool,
    ) -> Result<Vec<String>, Error> {
        let path = path.into();
        let res = self
            .operation(AfcOpcode::ReadDir, cstr(&[&path]), Vec::new())
            .await?;

        let entries = res
            .payload
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .filter(|s| s != "." && s != "..");

        if prefix {
            let base = path.trim_end_matches('/');
            Ok(entries.map(|name| format!("{base}/{name}")).collect())
        } else {
            Ok(entries.collect())
        }
    }

    pub async fn mk_dir(&mut self, path: impl Into<String>) -> Result<(), Error> {
        self.operation(AfcOpcode::MakeDir, cstr(&[&path.into()]), Vec::new())
            .await?;
        Ok(())
    }

    /// Removes a file or an empty directory.
    pub async fn remove(&mut self, path: impl Into<String>) -> Result<(), Error> {
        self.operation(AfcOpcode::RemovePath, cstr(&[&path.into()]), Vec::new())
            .await?;
        Ok(())
    }

    /// Recursively removes a directory and its contents.
    pub async fn remove_all(&mut self, path: impl Into<String>) -> Result<(), Error> {
        self.operation(
            AfcOpcode::RemovePathAndContents,
            cstr(&[&path.into()]),
            Vec::new(),
        )
        .await?;
        Ok(())
    }

    pub async fn rename(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<(), Error> {
        self.operation(
            AfcOpcode::RenamePath,
            cstr(&[&source.into(), &target.into()]),
            Vec::new(),
        )
        .await?;
        Ok(())
    }

    /// Creates a hard or symbolic link at `source` pointing to `target`.
    pub async fn link(
        &mut self,
        kind: LinkType,
        target: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<(), Error> {
        let mut header_payload = (kind as u64).to_le_bytes().to_vec();
        header_payload.extend(cstr(&[&target.into(), &source.into()]));
        self.operation(AfcOpcode::MakeLink, header_payload, Vec::new())
            .await?;
        Ok(())
    }

    /// Truncates the file at `path` to `size` bytes.
    pub async fn truncate(&mut self, path: impl Into<String>, size: u64) -> Result<(), Error> {
        let mut header_payload = size.to_le_bytes().to_vec();
        header_payload.extend(cstr(&[&path.into()]));
        self.operation(AfcOpcode::Truncate, header_payload, Vec::new())
            .await?;
        Ok(())
    }

    /// Sets a file's modification time, in nanoseconds since the epoch.
    pub async fn set_file_time(
        &mut self,
        path: impl Into<String>,
        mtime_ns: u64,
    ) -> Result<(), Error> {
        let mut header_payload = mtime_ns.to_le_bytes().to_vec();
        header_payload.extend(cstr(&[&path.into()]));
        self.operation(AfcOpcode::SetFileTime, header_payload, Vec::new())
            .await?;
        Ok(())
    }

    /// SHA-1 over the whole file.
    pub async fn file_hash(&mut self, path: impl Into<String>) -> Result<Vec<u8>, Error> {
        let res = self
            .operation(AfcOpcode::GetFileHash, cstr(&[&path.into()]), Vec::new())
            .await?;
        Ok(res.payload)
    }

    /// SHA-1 over `start..end` of the file.
    pub async fn file_hash_range(
        &mut self,
        path: impl Into<String>,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, Error> {
        let mut header_payload = start.to_le_bytes().to_vec();
        header_payload.extend(end.to_le_bytes());
        header_payload.extend(cstr(&[&path.into()]));
        let res = self
            .operation(AfcOpcode::GetFileHashRange, header_payload, Vec::new())
            .await?;
        Ok(res.payload)
    }

    pub async fn get_file_info(&mut self, path: impl Into<String>) -> Result<FileInfo, Error> {
        let res = self
            .operation(AfcOpcode::GetFileInfo, cstr(&[&path.into()]), Vec::new())
            .await?;
        let mut kvs = parse_kv_payload(&res.payload);

        let size = kvs
            .remove("st_size")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(Error::AfcMissingAttribute("st_size"))?;
        let modified = kvs
            .remove("st_mtime")
            .and_then(|v| v.parse::<i64>().ok())
            .map(DateTime::from_timestamp_nanos)
            .ok_or(Error::AfcMissingAttribute("st_mtime"))?;
        let st_ifmt = kvs
            .remove("st_ifmt")
            .ok_or(Error::AfcMissingAttribute("st_ifmt"))?;
        let created = kvs
            .remove("st_birthtime")
            .and_then(|v| v.parse::<i64>().ok())
            .map(DateTime::from_timestamp_nanos);
        let blocks = kvs.remove("st_blocks").and_then(|v| v.parse::<u64>().ok());
        let st_nlink = kvs.remove("st_nlink").and_then(|v| v.parse::<u64>().ok());
        let link_target = kvs.remove("LinkTarget");

        Ok(FileInfo {
            size,
            modified,
            created,
            st_ifmt,
            blocks,
            st_nlink,
            link_target,
        })
    }

    pub async fn get_device_info(&mut self) -> Result<DeviceInfo, Error> {
        let res = self
            .operation(AfcOpcode::GetDevInfo, Vec::new(), Vec::new())
            .await?;
        let mut kvs = parse_kv_payload(&res.payload);

        let model = kvs
            .remove("Model")
            .ok_or(Error::AfcMissingAttribute("Model"))?;
        let total_bytes = kvs
            .remove("FSTotalBytes")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(Error::AfcMissingAttribute("FSTotalBytes"))?;
        let free_bytes = kvs
            .remove("FSFreeBytes")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(Error::AfcMissingAttribute("FSFreeBytes"))?;
        let block_size = kvs
            .remove("FSBlockSize")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(Error::AfcMissingAttribute("FSBlockSize"))?;

        Ok(DeviceInfo {
            model,
            total_bytes,
            free_bytes,
            block_size,
        })
    }

    /// Opens a file, returning a handle that borrows this channel.
    pub async fn open(
        &mut self,
        path: impl Into<String>,
        mode: AfcFopenMode,
    ) -> Result<FileHandle<'_>, Error> {
        let path = path.into();
        let mut header_payload = (mode as u64).to_le_bytes().to_vec();
        header_payload.extend(cstr(&[&path]));

        let res = self
            .operation(AfcOpcode::FileOpen, header_payload, Vec::new())
            .await?;
        if res.header.operation != AfcOpcode::FileOpenRes || res.header_payload.len() < 8 {
            warn!("file open reply was {:?}", res.header.operation);
            return Err(Error::UnexpectedResponse);
        }
        let fd = u64::from_le_bytes(res.header_payload[..8].try_into().unwrap());
        Ok(FileHandle {
            client: self,
            fd,
            path,
        })
    }
}

/// NUL-terminates each string and concatenates them, the form AFC carries
/// paths in.
fn cstr<S: AsRef<str>>(strings: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for s in strings {
        out.extend_from_slice(s.as_ref().as_bytes());
        out.push(0);
    }
    out
}

/// The NUL-separated key/value sequence used by GetFileInfo and
/// GetDeviceInfo.
fn parse_kv_payload(payload: &[u8]) -> HashMap<String, String> {
    let strings: Vec<String> = payload
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    strings
        .chunks_exact(2)
        .map(|chunk| (chunk[0].clone(), chunk[1].clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Reads one request packet from the fake device side.
    async fn read_request(remote: &mut tokio::io::DuplexStream) -> AfcPacket {
        let mut header = [0u8; 40];
        remote.read_exact(&mut header).await.unwrap();
        let entire_len = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let this_len = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let packet_num = u64::from_le_bytes(header[24..32].try_into().unwrap());
        let operation = u64::from_le_bytes(header[32..40].try_into().unwrap());

        let mut header_payload = vec![0; (this_len - 40) as usize];
        remote.read_exact(&mut header_payload).await.unwrap();
        let mut payload = vec![0; (entire_len - this_len) as usize];
        remote.read_exact(&mut payload).await.unwrap();

        AfcPacket::new(
            AfcOpcode::try_from(operation).unwrap(),
            packet_num,
            header_payload,
            payload,
        )
    }

    async fn write_reply(
        remote: &mut tokio::io::DuplexStream,
        opcode: AfcOpcode,
        packet_num: u64,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) {
        let reply = AfcPacket::new(opcode, packet_num, header_payload, payload);
        remote.write_all(&reply.serialize()).await.unwrap();
    }

    #[tokio::test]
    async fn read_dir_strips_dot_entries_and_prefixes() {
        let (client, mut remote) = tokio::io::duplex(16 * 1024);
        let mut afc = AfcClient::new(DeviceConnection::new(Box::new(client), "test"));

        let device = tokio::spawn(async move {
            let req = read_request(&mut remote).await;
            assert_eq!(req.header.operation, AfcOpcode::ReadDir);
            assert_eq!(req.header.packet_num, 1);
            assert_eq!(req.header_payload, b"/Downloads\0");

            write_reply(
                &mut remote,
                AfcOpcode::Data,
                1,
                Vec::new(),
                b".\0..\0a.txt\0b\0".to_vec(),
            )
            .await;
        });

        let entries = afc.read_dir("/Downloads", true).await.unwrap();
        assert_eq!(entries, vec!["/Downloads/a.txt", "/Downloads/b"]);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn packet_numbers_increase_per_request() {
        let (client, mut remote) = tokio::io::duplex(16 * 1024);
        let mut afc = AfcClient::new(DeviceConnection::new(Box::new(client), "test"));

        let device = tokio::spawn(async move {
            for expected in 1..=2u64 {
                let req = read_request(&mut remote).await;
                assert_eq!(req.header.packet_num, expected);
                write_reply(
                    &mut remote,
                    AfcOpcode::Status,
                    expected,
                    0u64.to_le_bytes().to_vec(),
                    Vec::new(),
                )
                .await;
            }
        });

        afc.mk_dir("/a").await.unwrap();
        afc.mk_dir("/b").await.unwrap();
        device.await.unwrap();
    }

    #[tokio::test]
    async fn status_codes_surface_as_afc_errors() {
        let (client, mut remote) = tokio::io::duplex(16 * 1024);
        let mut afc = AfcClient::new(DeviceConnection::new(Box::new(client), "test"));

        let device = tokio::spawn(async move {
            let req = read_request(&mut remote).await;
            write_reply(
                &mut remote,
                AfcOpcode::Status,
                req.header.packet_num,
                8u64.to_le_bytes().to_vec(),
                Vec::new(),
            )
            .await;
        });

        let err = afc.remove("/missing").await.unwrap_err();
        assert!(matches!(err, Error::Afc(AfcError::ObjectNotFound)));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn open_write_then_tell_reports_the_position() {
        let (client, mut remote) = tokio::io::duplex(16 * 1024);
        let mut afc = AfcClient::new(DeviceConnection::new(Box::new(client), "test"));

        let device = tokio::spawn(async move {
            // FileOpen -> fd 3
            let req = read_request(&mut remote).await;
            assert_eq!(req.header.operation, AfcOpcode::FileOpen);
            assert_eq!(
                u64::from_le_bytes(req.header_payload[..8].try_into().unwrap()),
                opcode::AfcFopenMode::Rw as u64
            );
            assert_eq!(&req.header_payload[8..], b"/tmp/x\0");
            write_reply(
                &mut remote,
                AfcOpcode::FileOpenRes,
                req.header.packet_num,
                3u64.to_le_bytes().to_vec(),
                Vec::new(),
            )
            .await;

            // Write of 4 payload bytes
            let req = read_request(&mut remote).await;
            assert_eq!(req.header.operation, AfcOpcode::Write);
            assert_eq!(req.payload, vec![1, 2, 3, 4]);
            write_reply(
                &mut remote,
                AfcOpcode::Status,
                req.header.packet_num,
                0u64.to_le_bytes().to_vec(),
                Vec::new(),
            )
            .await;

            // Tell -> 4
            let req = read_request(&mut remote).await;
            assert_eq!(req.header.operation, AfcOpcode::FileTell);
            write_reply(
                &mut remote,
                AfcOpcode::FileTellRes,
                req.header.packet_num,
                4u64.to_le_bytes().to_vec(),
                Vec::new(),
            )
            .await;
        });

        let mut file = afc.open("/tmp/x", AfcFopenMode::Rw).await.unwrap();
        file.write(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(file.tell().await.unwrap(), 4);
        device.await.unwrap();
    }
}
