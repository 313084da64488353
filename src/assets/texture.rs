//! Texture loading.
//!
//! [`Texture::submit_load_job`] reads and decodes the image on a worker. After
//! the producer joined that job, [`Texture::upload`] hands the decoded levels
//! to the render backend on the calling thread.

use super::file_cache::FileCache;
use super::pvr::{ChannelLayout, CompressedFormat, MipLevel, PvrHeader};
use super::{AssetError, Result};
use crate::job::{JobHandle, WorkTask};
use crate::job_system::JobSystem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

/// Container type, decided from the first bytes of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Pvr,
    Png,
    /// Anything that is neither PVR nor PNG.
    Jpeg,
}

pub fn sniff(bytes: &[u8]) -> ImageKind {
    if bytes.starts_with(b"PVR") {
        ImageKind::Pvr
    } else if bytes.starts_with(&PNG_SIGNATURE) {
        ImageKind::Png
    } else {
        ImageKind::Jpeg
    }
}

/// How the texel data of a level is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexelFormat {
    Uncompressed { layout: ChannelLayout, bits_per_pixel: u32 },
    Compressed(CompressedFormat),
}

/// A decoded image, ready for upload.
#[derive(Debug, Clone)]
pub struct Image {
    pub header: PvrHeader,
    pub format: TexelFormat,
    pub levels: Vec<MipLevel>,
    pub data: Vec<u8>,
}

impl Image {
    pub fn decode(bytes: &[u8]) -> Result<Image> {
        match sniff(bytes) {
            ImageKind::Pvr => {}
            ImageKind::Png => return Err(AssetError::UnsupportedFormat("PNG image".into())),
            ImageKind::Jpeg => return Err(AssetError::UnsupportedFormat("JPEG image".into())),
        }

        let (header, offset) = PvrHeader::parse(bytes)?;
        let format = match (header.channel_layout(), header.compressed_format()) {
            (Some(layout), _) => TexelFormat::Uncompressed {
                layout,
                bits_per_pixel: header.bits_per_pixel(),
            },
            (None, Some(format)) => TexelFormat::Compressed(format),
            (None, None) => {
                return Err(AssetError::UnsupportedFormat(format!(
                    "PVR pixel format {:#x}",
                    header.pixel_format
                )));
            }
        };
        let levels = header.mip_levels()?;

        let data = bytes[offset..].to_vec();
        let needed = levels.last().map_or(0, |mip| mip.offset + mip.size);
        if data.len() < needed {
            return Err(AssetError::Truncated {
                what: "PVR texture data",
            });
        }

        Ok(Image {
            header,
            format,
            levels,
            data,
        })
    }

    /// Bytes of one mip level.
    pub fn level_data(&self, mip: &MipLevel) -> &[u8] {
        &self.data[mip.offset..mip.offset + mip.size]
    }
}

/// Render backend side of a texture upload. Only called on the thread that
/// owns the render context.
pub trait TextureUploader {
    /// Creates (or recreates) a texture object and returns its id.
    fn create(&mut self, previous: Option<u32>, has_mipmap: bool) -> u32;

    fn upload_level(&mut self, id: u32, format: TexelFormat, mip: &MipLevel, bytes: &[u8]);
}

/// One texture file and the result of loading it.
///
/// Shared between the owning [`Texture`] and the load job.
#[derive(Debug)]
pub struct TextureResource {
    path: PathBuf,
    has_mipmap: bool,
    files: Arc<FileCache>,
    loaded: Mutex<Option<Result<Image>>>,
}

impl TextureResource {
    pub fn new(path: impl Into<PathBuf>, has_mipmap: bool, files: Arc<FileCache>) -> Self {
        TextureResource {
            path: path.into(),
            has_mipmap,
            files,
            loaded: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and decodes the file. Runs inside the image-load job.
    pub fn load_data(&self) {
        let result = self
            .files
            .read(&self.path)
            .and_then(|bytes| Image::decode(&bytes));
        if let Err(err) = &result {
            log::warn!("failed to load texture {}: {err}", self.path.display());
        }
        *self.loaded.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
    }

    /// Takes the decoded image out of the resource.
    pub fn take(&self) -> Result<Image> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| Err(AssetError::NotLoaded(self.path.clone())))
    }
}

/// A texture owned by the game: a resource plus the backend id once uploaded.
#[derive(Debug, Default)]
pub struct Texture {
    resource: Option<Arc<TextureResource>>,
    id: Option<u32>,
    size: (u32, u32),
}

impl Texture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits an image-load job for `path`. Join the handle before
    /// [`upload`](Self::upload).
    pub fn submit_load_job(
        &mut self,
        jobs: &JobSystem,
        path: impl Into<PathBuf>,
        has_mipmap: bool,
        files: Arc<FileCache>,
    ) -> JobHandle {
        let resource = Arc::new(TextureResource::new(path, has_mipmap, files));
        self.resource = Some(Arc::clone(&resource));
        jobs.submit_task(WorkTask::LoadImage(resource))
    }

    /// Loads on the calling thread and uploads right away.
    pub fn load(
        &mut self,
        path: impl Into<PathBuf>,
        has_mipmap: bool,
        files: Arc<FileCache>,
        uploader: &mut dyn TextureUploader,
    ) -> Result<u32> {
        let resource = Arc::new(TextureResource::new(path, has_mipmap, files));
        resource.load_data();
        self.resource = Some(resource);
        self.upload(uploader)
    }

    /// Uploads the loaded image. Must run after the load job was joined.
    pub fn upload(&mut self, uploader: &mut dyn TextureUploader) -> Result<u32> {
        let Some(resource) = &self.resource else {
            return Err(AssetError::NotLoaded(PathBuf::new()));
        };
        let image = resource.take()?;

        let id = uploader.create(self.id, resource.has_mipmap);
        let levels = if resource.has_mipmap {
            &image.levels[..]
        } else {
            &image.levels[..image.levels.len().min(1)]
        };
        for mip in levels {
            uploader.upload_level(id, image.format, mip, image.level_data(mip));
        }

        self.id = Some(id);
        self.size = (image.header.width, image.header.height);
        Ok(id)
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }
}
