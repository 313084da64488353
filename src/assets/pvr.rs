//! PVR v3 container parsing.
//!
//! Only what the loader needs: the 52 byte header, the metadata blocks that
//! change how the data is interpreted, and the mip-level layout.

use super::{AssetError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// Little-endian "PVR\x03".
pub const PVR_VERSION: u32 = 0x0352_5650;
/// The same tag read with the wrong byte order.
const PVR_VERSION_SWAPPED: u32 = 0x5056_5203;
pub const HEADER_SIZE: usize = 52;

const META_BORDER: u32 = 4;
const META_CHANNEL_TYPES: u32 = 6;

/// Compressed pixel formats the loader knows the block layout of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedFormat {
    Pvrtc2bppRgb,
    Pvrtc2bppRgba,
    Pvrtc4bppRgb,
    Pvrtc4bppRgba,
    Pvrtc2_2bpp,
    Pvrtc2_4bpp,
    Etc1,
    Dxt1,
    Dxt3,
    Dxt5,
}

impl CompressedFormat {
    fn from_pixel_format(format: u64) -> Option<Self> {
        Some(match format {
            0 => CompressedFormat::Pvrtc2bppRgb,
            1 => CompressedFormat::Pvrtc2bppRgba,
            2 => CompressedFormat::Pvrtc4bppRgb,
            3 => CompressedFormat::Pvrtc4bppRgba,
            4 => CompressedFormat::Pvrtc2_2bpp,
            5 => CompressedFormat::Pvrtc2_4bpp,
            6 => CompressedFormat::Etc1,
            7 => CompressedFormat::Dxt1,
            9 => CompressedFormat::Dxt3,
            11 => CompressedFormat::Dxt5,
            _ => return None,
        })
    }

    /// Bytes used by one mip level of `width` x `height` texels. `None` if
    /// the size does not fit in `usize`.
    fn level_size(self, width: u32, height: u32) -> Option<usize> {
        let (w, h) = (width as usize, height as usize);
        match self {
            CompressedFormat::Pvrtc2bppRgb
            | CompressedFormat::Pvrtc2bppRgba
            | CompressedFormat::Pvrtc2_2bpp => Some(w.max(16).checked_mul(h.max(8))? / 4),
            CompressedFormat::Pvrtc4bppRgb
            | CompressedFormat::Pvrtc4bppRgba
            | CompressedFormat::Pvrtc2_4bpp => Some(w.max(8).checked_mul(h.max(8))? / 2),
            CompressedFormat::Etc1 | CompressedFormat::Dxt1 => {
                w.div_ceil(4).checked_mul(h.div_ceil(4))?.checked_mul(8)
            }
            CompressedFormat::Dxt3 | CompressedFormat::Dxt5 => {
                w.div_ceil(4).checked_mul(h.div_ceil(4))?.checked_mul(16)
            }
        }
    }
}

/// Pixel layout of an uncompressed texture, as the uploader needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Red,
    Green,
    Blue,
    Alpha,
    Rgb,
    Rgba,
    Bgr,
    Bgra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PvrHeader {
    pub flags: u32,
    pub pixel_format: u64,
    pub color_space: u32,
    /// `None` when the metadata gave the channels different types.
    pub channel_type: Option<u32>,
    pub height: u32,
    pub width: u32,
    pub depth: u32,
    pub num_surfaces: u32,
    pub num_faces: u32,
    pub mip_map_count: u32,
    pub metadata_size: u32,
    pub border: [u32; 3],
}

/// Placement of one mip level inside the texture data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipLevel {
    pub level: u32,
    pub width: u32,
    pub height: u32,
    pub offset: usize,
    pub size: usize,
}

impl PvrHeader {
    /// Parses the header and metadata. Returns the header and the offset of
    /// the texture data.
    pub fn parse(bytes: &[u8]) -> Result<(PvrHeader, usize)> {
        let mut cursor = Cursor::new(bytes);
        let short = AssetError::truncated("PVR header");

        let version = cursor.read_u32::<LittleEndian>().map_err(short)?;
        if version != PVR_VERSION {
            let detail = if version == PVR_VERSION_SWAPPED {
                "PVR header has the wrong endianness".to_string()
            } else {
                format!("{version:#010x} is not a PVR v3 header")
            };
            return Err(AssetError::BadMagic(detail));
        }

        let mut header = PvrHeader::default();
        header.flags = read_u32(&mut cursor)?;
        header.pixel_format = cursor
            .read_u64::<LittleEndian>()
            .map_err(AssetError::truncated("PVR header"))?;
        header.color_space = read_u32(&mut cursor)?;
        header.channel_type = Some(read_u32(&mut cursor)?);
        header.height = read_u32(&mut cursor)?;
        header.width = read_u32(&mut cursor)?;
        if !header.height.is_power_of_two() || !header.width.is_power_of_two() {
            return Err(AssetError::UnsupportedFormat(format!(
                "texture size {}x{} is not a power of 2",
                header.width, header.height
            )));
        }
        header.depth = read_u32(&mut cursor)?;
        header.num_surfaces = read_u32(&mut cursor)?;
        header.num_faces = read_u32(&mut cursor)?;
        header.mip_map_count = read_u32(&mut cursor)?;
        header.metadata_size = read_u32(&mut cursor)?;

        let data_offset = HEADER_SIZE + header.metadata_size as usize;
        if bytes.len() < data_offset {
            return Err(AssetError::Truncated {
                what: "PVR metadata",
            });
        }
        header.read_metadata(&bytes[HEADER_SIZE..data_offset])?;
        Ok((header, data_offset))
    }

    fn read_metadata(&mut self, mut block: &[u8]) -> Result<()> {
        while !block.is_empty() {
            let mut cursor = Cursor::new(block);
            let mut four_cc = [0u8; 4];
            cursor
                .read_exact(&mut four_cc)
                .map_err(AssetError::truncated("PVR metadata"))?;
            let key = read_u32(&mut cursor)?;
            let size = read_u32(&mut cursor)? as usize;
            let start = cursor.position() as usize;
            let Some(data) = block.get(start..start + size) else {
                return Err(AssetError::Truncated {
                    what: "PVR metadata",
                });
            };

            if four_cc == *b"PVR\x03" {
                let mut data = Cursor::new(data);
                match key {
                    META_BORDER => {
                        for side in &mut self.border {
                            *side = read_u32(&mut data)?;
                        }
                    }
                    META_CHANNEL_TYPES => {
                        let mut types = [0u8; 4];
                        data.read_exact(&mut types)
                            .map_err(AssetError::truncated("PVR metadata"))?;
                        self.channel_type = types
                            .iter()
                            .all(|&t| t == types[0])
                            .then_some(u32::from(types[0]));
                    }
                    other => {
                        return Err(AssetError::UnsupportedFormat(format!(
                            "PVR metadata block type {other}"
                        )));
                    }
                }
            }
            block = &block[start + size..];
        }
        Ok(())
    }

    /// Channel order (`b'r'`, `b'g'`, ... or 0 for a missing channel) and
    /// bits per channel, for uncompressed formats only.
    pub fn channel_order(&self) -> Option<([u8; 4], [u8; 4])> {
        let rates = (self.pixel_format >> 32) as u32;
        if rates == 0 {
            return None;
        }
        let order = (self.pixel_format as u32).to_le_bytes();
        Some((order, rates.to_le_bytes()))
    }

    pub fn is_compressed(&self) -> bool {
        self.channel_order().is_none()
    }

    pub fn compressed_format(&self) -> Option<CompressedFormat> {
        if self.is_compressed() {
            CompressedFormat::from_pixel_format(self.pixel_format)
        } else {
            None
        }
    }

    /// Sum of the per-channel bit rates; 0 for compressed data.
    pub fn bits_per_pixel(&self) -> u32 {
        self.channel_order()
            .map(|(_, rate)| rate.iter().map(|&r| u32::from(r)).sum())
            .unwrap_or(0)
    }

    pub fn channel_layout(&self) -> Option<ChannelLayout> {
        let (order, _) = self.channel_order()?;
        match order {
            [b'r', 0, 0, 0] => Some(ChannelLayout::Red),
            [b'g', 0, 0, 0] => Some(ChannelLayout::Green),
            [b'b', 0, 0, 0] => Some(ChannelLayout::Blue),
            [b'a', 0, 0, 0] => Some(ChannelLayout::Alpha),
            [b'r', b'g', b'b', 0] => Some(ChannelLayout::Rgb),
            [b'r', b'g', b'b', b'a'] => Some(ChannelLayout::Rgba),
            [b'b', b'g', b'r', 0] => Some(ChannelLayout::Bgr),
            [b'b', b'g', b'r', b'a'] => Some(ChannelLayout::Bgra),
            _ => None,
        }
    }

    fn level_size(&self, width: u32, height: u32) -> Result<usize> {
        let size = match self.compressed_format() {
            Some(format) => format.level_size(width, height),
            None if self.is_compressed() => {
                return Err(AssetError::UnsupportedFormat(format!(
                    "PVR pixel format {:#x}",
                    self.pixel_format
                )));
            }
            None => (width as usize)
                .checked_mul(height as usize)
                .and_then(|texels| texels.checked_mul(self.bits_per_pixel() as usize / 8)),
        };
        size.ok_or_else(|| too_large(width, height))
    }

    /// Layout of every mip level. Arrays, cube maps and 3D textures are not
    /// supported.
    pub fn mip_levels(&self) -> Result<Vec<MipLevel>> {
        if self.num_surfaces > 1 || self.num_faces > 1 || self.depth > 1 {
            return Err(AssetError::UnsupportedFormat(
                "texture arrays, cube maps and 3D textures".into(),
            ));
        }
        let mut offset = 0usize;
        (0..self.mip_map_count.max(1))
            .map(|level| {
                let width = (self.width >> level).max(1);
                let height = (self.height >> level).max(1);
                let size = self.level_size(width, height)?;
                let mip = MipLevel {
                    level,
                    width,
                    height,
                    offset,
                    size,
                };
                offset = offset
                    .checked_add(size)
                    .ok_or_else(|| too_large(self.width, self.height))?;
                Ok(mip)
            })
            .collect()
    }
}

fn too_large(width: u32, height: u32) -> AssetError {
    AssetError::UnsupportedFormat(format!("{width}x{height} texture is too large to address"))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(AssetError::truncated("PVR header"))
}
