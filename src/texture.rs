//! Textures bound to `sampler2D` uniforms and the loaders that fill them.

use crate::render::GpuContext;
use anyhow::{anyhow, bail, Context, Result};
use image::RgbaImage;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, warn};
use url::Url;

/// Format of every uniform texture.
pub const IMAGE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// A GPU texture together with a view over all of its mip levels.
pub struct GpuImage {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

impl GpuImage {
    /// Creates a texture and uploads every level of `levels`, largest first.
    pub fn from_levels(gpu: &GpuContext, levels: &[RgbaImage], label: &str) -> Result<Self> {
        let base = levels.first().ok_or_else(|| anyhow!("image has no levels"))?;
        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: base.width(),
                height: base.height(),
                depth_or_array_layers: 1,
            },
            mip_level_count: levels.len() as u32,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: IMAGE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        for (mip_level, level) in levels.iter().enumerate() {
            gpu.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture,
                    mip_level: mip_level as u32,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                level.as_raw(),
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(level.width() * 4),
                    rows_per_image: Some(level.height()),
                },
                wgpu::Extent3d {
                    width: level.width(),
                    height: level.height(),
                    depth_or_array_layers: 1,
                },
            );
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(Self { texture, view })
    }

    /// A transparent 1x1 texture.
    pub fn placeholder(gpu: &GpuContext) -> Self {
        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Placeholder Texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: IMAGE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &[0u8; 4],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }
}

/// Shared, swappable texture of one `sampler2D` uniform.
///
/// Starts out as a placeholder; a loader swaps the decoded image in whenever
/// it is ready. Draws bind whatever the handle holds at that moment.
#[derive(Clone)]
pub struct TextureHandle(Arc<Mutex<GpuImage>>);

impl TextureHandle {
    pub fn new(image: GpuImage) -> Self {
        Self(Arc::new(Mutex::new(image)))
    }

    pub fn placeholder(gpu: &GpuContext) -> Self {
        Self::new(GpuImage::placeholder(gpu))
    }

    fn lock(&self) -> MutexGuard<'_, GpuImage> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swaps in a new image.
    pub fn replace(&self, image: GpuImage) {
        *self.lock() = image;
    }

    /// The current view, for binding.
    pub fn view(&self) -> wgpu::TextureView {
        self.lock().view.clone()
    }

    pub fn size(&self) -> (u32, u32) {
        let image = self.lock();
        (image.texture.width(), image.texture.height())
    }
}

impl fmt::Debug for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (width, height) = self.size();
        f.debug_struct("TextureHandle")
            .field("width", &width)
            .field("height", &height)
            .finish()
    }
}

/// Fills texture handles from urls.
///
/// `load` is called at most once per `sampler2D` uniform and must not block
/// the render thread; implementations populate `texture` when ready and
/// report their own failures.
pub trait TextureLoader: Send + Sync {
    fn load(&self, url: &str, texture: TextureHandle, gpu: &GpuContext);
}

/// Loads local image files on a worker thread.
///
/// Urls are either `file://` urls or paths relative to `base_dir`.
#[derive(Debug, Clone)]
pub struct ImageTextureLoader {
    base_dir: PathBuf,
}

impl ImageTextureLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Maps a uniform url to a file on disk.
    pub fn resolve(&self, url: &str) -> Result<PathBuf> {
        match Url::parse(url) {
            Ok(parsed) if parsed.scheme() == "file" => parsed
                .to_file_path()
                .map_err(|_| anyhow!("'{url}' is not a local file url")),
            Ok(parsed) if parsed.scheme().len() > 1 => {
                bail!("unsupported texture url scheme '{}'", parsed.scheme())
            }
            _ => Ok(self.base_dir.join(url)),
        }
    }
}

impl TextureLoader for ImageTextureLoader {
    fn load(&self, url: &str, texture: TextureHandle, gpu: &GpuContext) {
        let path = match self.resolve(url) {
            Ok(path) => path,
            Err(err) => {
                warn!(url, "texture not loaded: {err:#}");
                return;
            }
        };
        let gpu = gpu.clone();
        let url = url.to_string();
        let spawned = thread::Builder::new()
            .name("texture-loader".into())
            .spawn(move || match decode(&path).and_then(|levels| GpuImage::from_levels(&gpu, &levels, &url)) {
                Ok(image) => {
                    debug!(url = %url, levels = image.texture.mip_level_count(), "texture loaded");
                    texture.replace(image);
                }
                Err(err) => warn!(url = %url, "failed to load texture: {err:#}"),
            });
        if let Err(err) = spawned {
            warn!("failed to spawn texture loader thread: {err}");
        }
    }
}

/// Decodes an image file into a flipped RGBA mip chain.
fn decode(path: &Path) -> Result<Vec<RgbaImage>> {
    let image = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgba8();
    // Rows are stored bottom-up so that `gUV.y == 0` samples the bottom edge.
    Ok(mip_chain(image::imageops::flip_vertical(&image)))
}

/// Halves the image until it is 1x1. The first entry is the input.
pub fn mip_chain(image: RgbaImage) -> Vec<RgbaImage> {
    let mut levels = vec![image];
    loop {
        let last = &levels[levels.len() - 1];
        let (width, height) = last.dimensions();
        if width <= 1 && height <= 1 {
            break;
        }
        let next = image::imageops::resize(
            last,
            (width / 2).max(1),
            (height / 2).max(1),
            image::imageops::FilterType::Triangle,
        );
        levels.push(next);
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_chain_halves_to_one_pixel() {
        let levels = mip_chain(RgbaImage::new(8, 2));
        let sizes: Vec<_> = levels.iter().map(|level| level.dimensions()).collect();
        assert_eq!(sizes, [(8, 2), (4, 1), (2, 1), (1, 1)]);
        assert_eq!(mip_chain(RgbaImage::new(1, 1)).len(), 1);
    }

    #[test]
    fn test_resolve_relative_paths() {
        let loader = ImageTextureLoader::new("/assets");
        assert_eq!(loader.resolve("noise.png").unwrap(), PathBuf::from("/assets/noise.png"));
        assert_eq!(
            loader.resolve("textures/grid.png").unwrap(),
            PathBuf::from("/assets/textures/grid.png")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_file_urls() {
        let loader = ImageTextureLoader::new("/assets");
        assert_eq!(loader.resolve("file:///tmp/a.png").unwrap(), PathBuf::from("/tmp/a.png"));
    }

    #[test]
    fn test_remote_urls_are_unsupported() {
        let loader = ImageTextureLoader::new(".");
        let err = loader.resolve("https://example.com/a.png").unwrap_err();
        assert!(err.to_string().contains("https"));
    }

    #[test]
    fn test_decode_flips_rows() {
        let dir = std::env::temp_dir().join(format!("layerstack-decode-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("two_rows.png");
        let mut rows = RgbaImage::new(1, 2);
        rows.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
        rows.put_pixel(0, 1, image::Rgba([0, 0, 255, 255]));
        rows.save(&path).unwrap();

        let levels = decode(&path).unwrap();
        assert_eq!(levels[0].get_pixel(0, 0).0, [0, 0, 255, 255]);
        assert_eq!(levels[0].get_pixel(0, 1).0, [255, 0, 0, 255]);
        assert_eq!(levels.len(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
