use std::{
    fs::{self, File},
    io::{BufWriter, Seek, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use image::DynamicImage;
use tiff::{
    TiffResult,
    encoder::{
        TiffEncoder, TiffValue,
        colortype::{self, ColorType},
    },
    tags::Tag,
};
use tracing::debug;

/// provenance stored alongside every image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub run_uid: String,
    pub run_date: DateTime<Local>,
    pub cycle: u32,
    pub captured_at: DateTime<Local>,
    pub device: String,
}

impl ImageMetadata {
    pub fn description(&self) -> String {
        format!(
            "Run Date: {}; Run UID: {}",
            self.run_date.format("%Y-%m-%d"),
            self.run_uid
        )
    }

    fn sidecar(&self) -> String {
        format!(
            "{}\nCycle: {}\nCaptured: {}\nDevice: {}\n",
            self.description(),
            self.cycle,
            self.captured_at.format("%Y-%m-%dT%H:%M:%S"),
            self.device
        )
    }
}

/// where captured frames end up
pub trait ImageSink {
    /// store `image` under `stem` (no extension), returns the image path
    fn save(&mut self, image: &DynamicImage, stem: &str, metadata: &ImageMetadata) -> Result<PathBuf>;
}

/// writes TIFF files into a directory, with a `.txt` provenance sidecar
///
/// The run date and UID also go into the TIFF ImageDescription tag so they
/// travel with the image.
#[derive(Debug, Clone)]
pub struct TiffSink {
    dir: PathBuf,
}

impl TiffSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        TiffSink { dir: dir.into() }
    }
}

fn encode<C, W>(
    encoder: &mut TiffEncoder<W>,
    width: u32,
    height: u32,
    data: &[C::Inner],
    description: &str,
) -> TiffResult<()>
where
    C: ColorType,
    W: Write + Seek,
    [C::Inner]: TiffValue,
{
    let mut image = encoder.new_image::<C>(width, height)?;
    image.encoder().write_tag(Tag::ImageDescription, description)?;
    image.write_data(data)
}

/// encode `image` with its native sample layout, RGBA16 for anything exotic
fn write_tiff<W: Write + Seek>(out: W, image: &DynamicImage, description: &str) -> TiffResult<()> {
    let mut encoder = TiffEncoder::new(out)?;
    let (width, height) = (image.width(), image.height());
    match image {
        DynamicImage::ImageLuma8(buf) => {
            encode::<colortype::Gray8, _>(&mut encoder, width, height, buf.as_raw(), description)
        }
        DynamicImage::ImageLuma16(buf) => {
            encode::<colortype::Gray16, _>(&mut encoder, width, height, buf.as_raw(), description)
        }
        DynamicImage::ImageRgb8(buf) => {
            encode::<colortype::RGB8, _>(&mut encoder, width, height, buf.as_raw(), description)
        }
        DynamicImage::ImageRgb16(buf) => {
            encode::<colortype::RGB16, _>(&mut encoder, width, height, buf.as_raw(), description)
        }
        DynamicImage::ImageRgba8(buf) => {
            encode::<colortype::RGBA8, _>(&mut encoder, width, height, buf.as_raw(), description)
        }
        DynamicImage::ImageRgba16(buf) => {
            encode::<colortype::RGBA16, _>(&mut encoder, width, height, buf.as_raw(), description)
        }
        other => {
            let converted = other.to_rgba16();
            encode::<colortype::RGBA16, _>(&mut encoder, width, height, converted.as_raw(), description)
        }
    }
}

impl ImageSink for TiffSink {
    fn save(&mut self, image: &DynamicImage, stem: &str, metadata: &ImageMetadata) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}.tiff", stem));
        let file = File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        write_tiff(&mut out, image, &metadata.description())
            .with_context(|| format!("failed to encode {}", path.display()))?;
        out.flush()
            .with_context(|| format!("failed to write {}", path.display()))?;
        let sidecar = path.with_extension("txt");
        fs::write(&sidecar, metadata.sidecar())
            .with_context(|| format!("failed to write {}", sidecar.display()))?;
        debug!(
            "saved {}x{} image to {}",
            image.width(),
            image.height(),
            path.display()
        );
        Ok(path)
    }
}
