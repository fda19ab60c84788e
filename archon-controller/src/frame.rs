// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame buffer metadata and fetched pixel arrays.

use std::collections::HashMap;

use crate::device::parse_keywords;
use crate::error::ArchonError;

/// Which of the three frame buffers a fetch should read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSelection {
    /// The most recently completed buffer.
    Latest,
    /// A specific buffer, 1 to 3.
    Buffer(u8),
}

/// Decoded snapshot of the `FRAME` report.
///
/// All values are integers; keywords whose name contains `TIME` are
/// transmitted in hexadecimal, everything else in decimal. Accessors
/// look keywords up lazily so a partial report only fails for the
/// fields that are actually read.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    values: HashMap<String, i64>,
}

impl FrameInfo {
    pub(crate) fn from_reply(reply: &str) -> Result<Self, ArchonError> {
        let mut values = HashMap::new();
        for (key, value) in parse_keywords(reply)? {
            let parsed = if key.to_uppercase().contains("TIME") {
                u64::from_str_radix(&value, 16).map(|value| value as i64)
            } else {
                value.parse::<i64>()
            }
            .map_err(|_| {
                ArchonError::InvalidReply(format!("bad frame value {key}={value}"))
            })?;
            values.insert(key.to_lowercase(), parsed);
        }
        Ok(Self { values })
    }

    /// Raw keyword map, keys lower-cased.
    pub fn values(&self) -> &HashMap<String, i64> {
        &self.values
    }

    pub fn get(&self, key: &str) -> Result<i64, ArchonError> {
        self.values
            .get(key)
            .copied()
            .ok_or_else(|| ArchonError::MissingKey(key.to_string()))
    }

    /// The buffer the controller is currently writing to.
    pub fn wbuf(&self) -> Result<i64, ArchonError> {
        self.get("wbuf")
    }

    pub fn buffer_complete(&self, buffer: i64) -> Result<bool, ArchonError> {
        Ok(self.get(&format!("buf{buffer}complete"))? == 1)
    }

    pub fn buffer_width(&self, buffer: i64) -> Result<i64, ArchonError> {
        self.get(&format!("buf{buffer}width"))
    }

    pub fn buffer_height(&self, buffer: i64) -> Result<i64, ArchonError> {
        self.get(&format!("buf{buffer}height"))
    }

    pub fn buffer_sample(&self, buffer: i64) -> Result<i64, ArchonError> {
        self.get(&format!("buf{buffer}sample"))
    }

    pub fn buffer_base(&self, buffer: i64) -> Result<i64, ArchonError> {
        self.get(&format!("buf{buffer}base"))
    }

    pub fn buffer_timestamp(&self, buffer: i64) -> Result<i64, ArchonError> {
        self.get(&format!("buf{buffer}timestamp"))
    }

    /// Bytes per pixel in the given buffer, 2 or 4 depending on the
    /// sample flag.
    pub fn buffer_bytes_per_pixel(&self, buffer: i64) -> Result<i64, ArchonError> {
        Ok(if self.buffer_sample(buffer)? == 0 { 2 } else { 4 })
    }

    /// The completed buffer with the highest timestamp, or `None` when
    /// no buffer is complete.
    pub fn latest_complete(&self) -> Result<Option<i64>, ArchonError> {
        let mut latest: Option<(i64, i64)> = None;
        for buffer in 1..=3 {
            if !self.buffer_complete(buffer)? {
                continue;
            }
            let timestamp = self.buffer_timestamp(buffer)?;
            if latest.is_none_or(|(_, best)| timestamp > best) {
                latest = Some((buffer, timestamp));
            }
        }
        Ok(latest.map(|(buffer, _)| buffer))
    }
}

/// Pixel samples of a fetched buffer, 2 or 4 bytes per pixel on the
/// wire, little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl PixelData {
    pub fn len(&self) -> usize {
        match self {
            PixelData::U16(data) => data.len(),
            PixelData::U32(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelData::U16(_) => 2,
            PixelData::U32(_) => 4,
        }
    }
}

/// A fetched frame buffer as a row-major two-dimensional array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameImage {
    width: usize,
    height: usize,
    data: PixelData,
}

impl FrameImage {
    /// Reinterprets raw buffer bytes as little-endian pixels and
    /// reshapes them to `(height, width)`.
    pub(crate) fn from_le_bytes(
        raw: &[u8],
        width: usize,
        height: usize,
        bytes_per_pixel: usize,
    ) -> Result<Self, ArchonError> {
        if raw.len() != width * height * bytes_per_pixel {
            return Err(ArchonError::InvalidReply(format!(
                "frame buffer has {} bytes, expected {}x{}x{}",
                raw.len(),
                height,
                width,
                bytes_per_pixel
            )));
        }
        let data = match bytes_per_pixel {
            2 => PixelData::U16(
                raw.chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect(),
            ),
            4 => PixelData::U32(
                raw.chunks_exact(4)
                    .map(|quad| u32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
                    .collect(),
            ),
            other => {
                return Err(ArchonError::InvalidReply(format!(
                    "unsupported sample width {other}"
                )))
            }
        };
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Array shape as `(rows, columns)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn data(&self) -> &PixelData {
        &self.data
    }

    /// The sample at `(row, column)`, widened to `u32`.
    pub fn pixel(&self, row: usize, column: usize) -> Option<u32> {
        if row >= self.height || column >= self.width {
            return None;
        }
        let index = row * self.width + column;
        Some(match &self.data {
            PixelData::U16(data) => u32::from(data[index]),
            PixelData::U32(data) => data[index],
        })
    }
}
