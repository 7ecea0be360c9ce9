//! AFC operation codes and the small enums requests embed.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcOpcode {
    Status = 0x01,
    Data = 0x02,
    ReadDir = 0x03,
    ReadFile = 0x04,
    WriteFile = 0x05,
    WritePart = 0x06,
    Truncate = 0x07,
    RemovePath = 0x08,
    MakeDir = 0x09,
    GetFileInfo = 0x0a,
    GetDevInfo = 0x0b,
    WriteFileAtom = 0x0c,
    FileOpen = 0x0d,
    FileOpenRes = 0x0e,
    Read = 0x0f,
    Write = 0x10,
    FileSeek = 0x11,
    FileTell = 0x12,
    FileTellRes = 0x13,
    FileClose = 0x14,
    FileSetSize = 0x15,
    GetConInfo = 0x16,
    SetConOptions = 0x17,
    RenamePath = 0x18,
    SetFsBs = 0x19,
    SetSocketBs = 0x1a,
    FileLock = 0x1b,
    MakeLink = 0x1c,
    GetFileHash = 0x1d,
    SetFileTime = 0x1e,
    GetFileHashRange = 0x1f,
    RemovePathAndContents = 0x22,
}

/// Open modes for `FileOpen`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcFopenMode {
    /// r, `O_RDONLY`
    RdOnly = 0x01,
    /// r+, `O_RDWR | O_CREAT`
    Rw = 0x02,
    /// w, `O_WRONLY | O_CREAT | O_TRUNC`
    WrOnly = 0x03,
    /// w+, `O_RDWR | O_CREAT | O_TRUNC`
    Wr = 0x04,
    /// a, `O_WRONLY | O_APPEND | O_CREAT`
    Append = 0x05,
    /// a+, `O_RDWR | O_APPEND | O_CREAT`
    RdAppend = 0x06,
}

/// Lock operations for `FileLock`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcLockType {
    Shared = 1 | 4,
    Exclusive = 2 | 4,
    Unlock = 8 | 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum LinkType {
    Hardlink = 1,
    Symlink = 2,
}

impl TryFrom<u64> for AfcOpcode {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Status),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::ReadDir),
            0x04 => Ok(Self::ReadFile),
            0x05 => Ok(Self::WriteFile),
            0x06 => Ok(Self::WritePart),
            0x07 => Ok(Self::Truncate),
            0x08 => Ok(Self::RemovePath),
            0x09 => Ok(Self::MakeDir),
            0x0a => Ok(Self::GetFileInfo),
            0x0b => Ok(Self::GetDevInfo),
            0x0c => Ok(Self::WriteFileAtom),
            0x0d => Ok(Self::FileOpen),
            0x0e => Ok(Self::FileOpenRes),
            0x0f => Ok(Self::Read),
            0x10 => Ok(Self::Write),
            0x11 => Ok(Self::FileSeek),
            0x12 => Ok(Self::FileTell),
            0x13 => Ok(Self::FileTellRes),
            0x14 => Ok(Self::FileClose),
            0x15 => Ok(Self::FileSetSize),
            0x16 => Ok(Self::GetConInfo),
            0x17 => Ok(Self::SetConOptions),
            0x18 => Ok(Self::RenamePath),
            0x19 => Ok(Self::SetFsBs),
            0x1a => Ok(Self::SetSocketBs),
            0x1b => Ok(Self::FileLock),
            0x1c => Ok(Self::MakeLink),
            0x1d => Ok(Self::GetFileHash),
            0x1e => Ok(Self::SetFileTime),
            0x1f => Ok(Self::GetFileHashRange),
            0x22 => Ok(Self::RemovePathAndContents),
            _ => Err(()),
        }
    }
}
