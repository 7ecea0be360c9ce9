//! Handles for open files on the device.

use std::io::SeekFrom;

use crate::Error;

use super::opcode::{AfcLockType, AfcOpcode};

/// Transfer chunk for reads and writes.
const MAX_TRANSFER: u64 = 64 * 1024;

/// An open file descriptor.
///
/// The handle borrows its AFC channel, so operations on it serialize with
/// everything else on that channel. The descriptor stays valid until
/// `close`.
pub struct FileHandle<'a> {
    pub(crate) client: &'a mut super::AfcClient,
    pub(crate) fd: u64,
    pub(crate) path: String,
}

impl std::fmt::Debug for FileHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("fd", &self.fd)
            .field("path", &self.path)
            .finish()
    }
}

impl FileHandle<'_> {
    /// `fd` followed by any extra u64 arguments, the argument form most
    /// file operations take.
    fn fd_args(&self, extra: &[u64]) -> Vec<u8> {
        let mut buf = self.fd.to_le_bytes().to_vec();
        for arg in extra {
            buf.extend_from_slice(&arg.to_le_bytes());
        }
        buf
    }

    /// Reads up to `len` bytes from the current position.
    pub async fn read_chunk(&mut self, len: u64) -> Result<Vec<u8>, Error> {
        let args = self.fd_args(&[len.min(MAX_TRANSFER)]);
        let res = self
            .client
            .operation(AfcOpcode::Read, args, Vec::new())
            .await?;
        Ok(res.payload)
    }

    /// Reads from the current position through the end of the file.
    pub async fn read(&mut self) -> Result<Vec<u8>, Error> {
        let position = self.tell().await?;
        let path = self.path.clone();
        let size = self.client.get_file_info(path).await?.size;
        let mut remaining = size.saturating_sub(position);

        let mut collected = Vec::with_capacity(remaining as usize);
        while remaining > 0 {
            let chunk = self.read_chunk(remaining).await?;
            if chunk.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(chunk.len() as u64);
            collected.extend(chunk);
        }
        Ok(collected)
    }

    /// Writes all of `bytes` at the current position.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        for chunk in bytes.chunks(MAX_TRANSFER as usize) {
            let args = self.fd_args(&[]);
            self.client
                .operation(AfcOpcode::Write, args, chunk.to_vec())
                .await?;
        }
        Ok(())
    }

    /// Reports the current cursor position.
    pub async fn tell(&mut self) -> Result<u64, Error> {
        let args = self.fd_args(&[]);
        let res = self
            .client
            .operation(AfcOpcode::FileTell, args, Vec::new())
            .await?;
        res.header_payload
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or(Error::UnexpectedResponse)
    }

    /// Moves the cursor.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<(), Error> {
        let (whence, offset) = match pos {
            SeekFrom::Start(off) => (0u64, off as i64),
            SeekFrom::Current(off) => (1, off),
            SeekFrom::End(off) => (2, off),
        };
        let args = self.fd_args(&[whence, offset as u64]);
        self.client
            .operation(AfcOpcode::FileSeek, args, Vec::new())
            .await?;
        Ok(())
    }

    /// Truncates or extends the file to `size` bytes.
    pub async fn set_size(&mut self, size: u64) -> Result<(), Error> {
        let args = self.fd_args(&[size]);
        self.client
            .operation(AfcOpcode::FileSetSize, args, Vec::new())
            .await?;
        Ok(())
    }

    /// Takes or upgrades an advisory lock on the descriptor.
    pub async fn lock(&mut self, kind: AfcLockType) -> Result<(), Error> {
        let args = self.fd_args(&[kind as u64]);
        self.client
            .operation(AfcOpcode::FileLock, args, Vec::new())
            .await?;
        Ok(())
    }

    pub async fn unlock(&mut self) -> Result<(), Error> {
        self.lock(AfcLockType::Unlock).await
    }

    /// Closes the descriptor.
    pub async fn close(self) -> Result<(), Error> {
        let args = self.fd.to_le_bytes().to_vec();
        self.client
            .operation(AfcOpcode::FileClose, args, Vec::new())
            .await?;
        Ok(())
    }
}
