//! # TsFile block format
//!
//! A tsfile is a sequence of device blocks closed by a footer:
//!
//! ```text
//! +------------+--------------+----------------+------+--------+-------+
//! | 0: 4 bytes | 4: 4 bytes   | 8: 4 bytes     | name | points | crc32 |
//! +------------+--------------+----------------+------+--------+-------+
//! |  b"TSBK"   | name length  | point count    |      | 16 B/p |       |
//! +------------+--------------+----------------+------+--------+-------+
//! ```
//!
//! Points are `(timestamp: i64, value: f64)` big-endian; the crc covers
//! name and points. The footer is the 4 bytes `b"TSFE"`. A file that does
//! not end with the footer has crashed: it may be truncated back to a
//! device-block boundary and appended to.

use std::path::{Path, PathBuf};

use models::TimeValuePair;
use snafu::ResultExt;
use tokio::io::AsyncWriteExt;

use crate::error::{CrcMismatchSnafu, InvalidBlockSnafu, IoSnafu, Result};

const BLOCK_MAGIC: [u8; 4] = *b"TSBK";
const FOOTER_MAGIC: [u8; 4] = *b"TSFE";
const BLOCK_HEADER_LEN: usize = 12;
const POINT_LEN: usize = 16;

/// Appends device blocks to a tsfile. Devices must be written in one pass;
/// the writer tracks the file offset after each completed block so a merge
/// can record resumable boundaries.
pub struct TsFileWriter {
    path: PathBuf,
    file: tokio::fs::File,
    offset: u64,
    sealed: bool,
}

impl TsFileWriter {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::create(&path)
            .await
            .context(IoSnafu { path: &path })?;
        Ok(Self {
            path,
            file,
            offset: 0,
            sealed: false,
        })
    }

    /// Reopens a crashed file that has been truncated back to a block
    /// boundary at `offset`, to append the remaining devices.
    pub async fn open_at(path: impl AsRef<Path>, offset: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .context(IoSnafu { path: &path })?;
        Ok(Self {
            path,
            file,
            offset,
            sealed: false,
        })
    }

    /// Writes one device block and returns the file offset after it.
    pub async fn write_device(&mut self, device: &str, points: &[TimeValuePair]) -> Result<u64> {
        let name = device.as_bytes();
        let mut body = Vec::with_capacity(name.len() + points.len() * POINT_LEN);
        body.extend_from_slice(name);
        for p in points {
            body.extend_from_slice(&p.timestamp.to_be_bytes());
            body.extend_from_slice(&p.value.to_bits().to_be_bytes());
        }
        let crc = crc32fast::hash(&body);

        let mut block = Vec::with_capacity(BLOCK_HEADER_LEN + body.len() + 4);
        block.extend_from_slice(&BLOCK_MAGIC);
        block.extend_from_slice(&(name.len() as u32).to_be_bytes());
        block.extend_from_slice(&(points.len() as u32).to_be_bytes());
        block.extend_from_slice(&body);
        block.extend_from_slice(&crc.to_be_bytes());

        self.file
            .write_all(&block)
            .await
            .context(IoSnafu { path: &self.path })?;
        self.offset += block.len() as u64;
        Ok(self.offset)
    }

    /// Writes the footer and syncs the file. After sealing the file is
    /// complete and no longer counts as crashed.
    pub async fn seal(&mut self) -> Result<()> {
        self.file
            .write_all(&FOOTER_MAGIC)
            .await
            .context(IoSnafu { path: &self.path })?;
        self.file
            .sync_all()
            .await
            .context(IoSnafu { path: &self.path })?;
        self.offset += FOOTER_MAGIC.len() as u64;
        self.sealed = true;
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .await
            .context(IoSnafu { path: &self.path })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether the file at `path` is missing its footer.
pub async fn has_crashed(path: &Path) -> Result<bool> {
    let data = tokio::fs::read(path).await.context(IoSnafu { path })?;
    Ok(data.len() < FOOTER_MAGIC.len() || data[data.len() - FOOTER_MAGIC.len()..] != FOOTER_MAGIC)
}

/// Truncates the file at `path` to `offset` bytes.
pub async fn truncate(path: &Path, offset: u64) -> Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .context(IoSnafu { path })?;
    file.set_len(offset).await.context(IoSnafu { path })?;
    file.sync_all().await.context(IoSnafu { path })
}

/// Reads the device blocks of a sealed tsfile.
pub struct TsFileReader {
    path: PathBuf,
    blocks: Vec<(String, Vec<TimeValuePair>)>,
}

impl TsFileReader {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = tokio::fs::read(&path).await.context(IoSnafu { path: &path })?;
        let blocks = parse_blocks(&path, &data)?;
        Ok(Self { path, blocks })
    }

    /// Devices in file order, deduplicated.
    pub fn devices(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for (device, _) in &self.blocks {
            if !seen.contains(device) {
                seen.push(device.clone());
            }
        }
        seen
    }

    /// All points of `device`, concatenated over its blocks in file order.
    pub fn read_device(&self, device: &str) -> Vec<TimeValuePair> {
        let mut points = Vec::new();
        for (name, block) in &self.blocks {
            if name == device {
                points.extend_from_slice(block);
            }
        }
        points
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_blocks(path: &Path, data: &[u8]) -> Result<Vec<(String, Vec<TimeValuePair>)>> {
    let mut blocks = Vec::new();
    let mut pos = 0usize;
    loop {
        if data.len() - pos == FOOTER_MAGIC.len() && data[pos..] == FOOTER_MAGIC {
            break;
        }
        if data.len() == pos {
            // crashed file with a clean block boundary
            break;
        }
        let offset = pos as u64;
        if data.len() - pos < BLOCK_HEADER_LEN || data[pos..pos + 4] != BLOCK_MAGIC {
            return InvalidBlockSnafu { path, offset }.fail();
        }
        let name_len = u32::from_be_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let point_count = u32::from_be_bytes(data[pos + 8..pos + 12].try_into().unwrap()) as usize;
        pos += BLOCK_HEADER_LEN;

        let body_len = name_len + point_count * POINT_LEN;
        if data.len() - pos < body_len + 4 {
            return InvalidBlockSnafu { path, offset }.fail();
        }
        let body = &data[pos..pos + body_len];
        let crc = u32::from_be_bytes(data[pos + body_len..pos + body_len + 4].try_into().unwrap());
        if crc32fast::hash(body) != crc {
            return CrcMismatchSnafu { path, offset }.fail();
        }
        let name = String::from_utf8_lossy(&body[..name_len]).into_owned();
        let mut points = Vec::with_capacity(point_count);
        for chunk in body[name_len..].chunks_exact(POINT_LEN) {
            let ts = i64::from_be_bytes(chunk[..8].try_into().unwrap());
            let value = f64::from_bits(u64::from_be_bytes(chunk[8..].try_into().unwrap()));
            points.push(TimeValuePair::new(ts, value));
        }
        blocks.push((name, points));
        pos += body_len + 4;
    }
    Ok(blocks)
}
