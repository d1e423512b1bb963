//! Metric sinks, image grids and running averages.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use burn::tensor::{Tensor, backend::Backend};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use serde::Serialize;

use crate::errors::FlowError;
use crate::layers::host;

/// Receives named scalars and images during training.
pub trait MetricSink {
    fn record_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<(), FlowError>;

    fn record_image(&mut self, name: &str, image: &ImageGrid, step: usize)
    -> Result<(), FlowError>;
}

/// A `[C, H, W]` image with values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageGrid {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub pixels: Vec<f32>,
}

impl ImageGrid {
    fn byte(&self, channel: usize, row: u32, col: u32) -> u8 {
        let index = (channel * self.height + row as usize) * self.width + col as usize;
        (self.pixels[index].clamp(0.0, 1.0) * 255.0).round() as u8
    }

    /// 8-bit image: RGB for 3 channels, otherwise greyscale from the first
    /// channel.
    pub fn to_image(&self) -> DynamicImage {
        let (width, height) = (self.width as u32, self.height as u32);
        if self.channels == 3 {
            let img = RgbImage::from_fn(width, height, |x, y| {
                Rgb([self.byte(0, y, x), self.byte(1, y, x), self.byte(2, y, x)])
            });
            DynamicImage::ImageRgb8(img)
        } else {
            let img = GrayImage::from_fn(width, height, |x, y| Luma([self.byte(0, y, x)]));
            DynamicImage::ImageLuma8(img)
        }
    }

    /// Writes the grid as a PNG.
    pub fn save(&self, path: &Path) -> Result<(), FlowError> {
        self.to_image().save_with_format(path, ImageFormat::Png)?;
        Ok(())
    }
}

/// Tiles a batch `[N, C, H, W]` into one image, `nrow` images per row,
/// separated and framed by `padding` pixels of `pad_value`.
pub fn make_grid<B: Backend>(
    images: Tensor<B, 4>,
    nrow: usize,
    padding: usize,
    pad_value: f32,
) -> Result<ImageGrid, FlowError> {
    let [n, c, h, w] = images.dims();
    if n == 0 || nrow == 0 {
        return Err(FlowError::shape("make_grid needs at least one image and one column"));
    }
    let values = host::to_host(images)?;

    let cols = nrow.min(n);
    let rows = n.div_ceil(cols);
    let cell_h = h + padding;
    let cell_w = w + padding;
    let grid_h = rows * cell_h + padding;
    let grid_w = cols * cell_w + padding;

    let mut pixels = vec![pad_value; c * grid_h * grid_w];
    for index in 0..n {
        let top = (index / cols) * cell_h + padding;
        let left = (index % cols) * cell_w + padding;
        for ch in 0..c {
            for r in 0..h {
                for col in 0..w {
                    let src = ((index * c + ch) * h + r) * w + col;
                    let dst = (ch * grid_h + top + r) * grid_w + left + col;
                    pixels[dst] = values[src] as f32;
                }
            }
        }
    }

    Ok(ImageGrid {
        channels: c,
        height: grid_h,
        width: grid_w,
        pixels,
    })
}

/// Running weighted average.
#[derive(Debug, Clone, Copy, Default)]
pub struct AverageMeter {
    pub sum: f64,
    pub count: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n as f64;
    }

    /// Zero before the first update.
    pub fn avg(&self) -> f64 {
        if self.count > 0.0 { self.sum / self.count } else { 0.0 }
    }
}

/// Writes every metric through the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl MetricSink for LogSink {
    fn record_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<(), FlowError> {
        log::info!("[{step}] {name} = {value:.6}");
        Ok(())
    }

    fn record_image(&mut self, name: &str, image: &ImageGrid, step: usize) -> Result<(), FlowError> {
        log::debug!(
            "[{step}] {name}: {}x{}x{} image",
            image.channels,
            image.height,
            image.width
        );
        Ok(())
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub scalars: Vec<(String, f64, usize)>,
    pub images: Vec<(String, ImageGrid, usize)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent value recorded under `name`.
    pub fn last_scalar(&self, name: &str) -> Option<f64> {
        self.scalars
            .iter()
            .rev()
            .find(|(n, _, _)| n == name)
            .map(|(_, v, _)| *v)
    }

    pub fn scalar_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scalars.iter().map(|(n, _, _)| n.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.images.iter().any(|(n, _, _)| n == name)
    }
}

impl MetricSink for MemorySink {
    fn record_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<(), FlowError> {
        self.scalars.push((name.to_string(), value, step));
        Ok(())
    }

    fn record_image(&mut self, name: &str, image: &ImageGrid, step: usize) -> Result<(), FlowError> {
        self.images.push((name.to_string(), image.clone(), step));
        Ok(())
    }
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    name: &'a str,
    value: f64,
    step: usize,
}

/// Appends scalars to `metrics.jsonl` and writes images as PNG files
/// under `images/` in the log directory.
#[derive(Debug)]
pub struct JsonLinesSink {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, FlowError> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("images"))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))?;
        Ok(Self {
            dir,
            writer: BufWriter::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MetricSink for JsonLinesSink {
    fn record_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<(), FlowError> {
        serde_json::to_writer(&mut self.writer, &ScalarRecord { name, value, step })?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn record_image(&mut self, name: &str, image: &ImageGrid, step: usize) -> Result<(), FlowError> {
        let file = format!("{}_{step}.png", name.replace('/', "_"));
        image.save(&self.dir.join("images").join(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_average_meter_weights_by_count() {
        let mut meter = AverageMeter::new();
        assert_eq!(meter.avg(), 0.0);
        meter.update(1.0, 1);
        meter.update(4.0, 3);
        assert!((meter.avg() - 3.25).abs() < 1e-12);
    }

    #[test]
    fn test_make_grid_layout() {
        let device = <TestBackend as Backend>::Device::default();
        let images = Tensor::<TestBackend, 4>::ones([3, 1, 2, 2], &device);
        let grid = make_grid(images, 2, 1, 0.5).unwrap();

        // 2 columns x 2 rows of 2x2 images with 1px padding
        assert_eq!((grid.channels, grid.height, grid.width), (1, 7, 7));
        assert_eq!(grid.pixels[0], 0.5);
        assert_eq!(grid.pixels[7 + 1], 1.0);
        assert_eq!(grid.pixels[4 * 7 + 4], 0.5);
        let filled = grid.pixels.iter().filter(|v| **v == 1.0).count();
        assert_eq!(filled, 12);
    }

    #[test]
    fn test_image_conversion_and_png_output() {
        let grid = ImageGrid {
            channels: 3,
            height: 1,
            width: 2,
            pixels: vec![1.0, 0.0, 0.0, 1.0, 0.5, 0.5],
        };
        let rgb = grid.to_image().to_rgb8();
        assert_eq!(rgb.dimensions(), (2, 1));
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 0, 128]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([0, 255, 128]));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.png");
        grid.save(&path).unwrap();
        let loaded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(loaded, rgb);
    }

    #[test]
    fn test_single_channel_is_greyscale() {
        let grid = ImageGrid {
            channels: 1,
            height: 2,
            width: 1,
            pixels: vec![0.0, 2.0],
        };
        let grey = grid.to_image().to_luma8();
        assert_eq!(grey.get_pixel(0, 0), &Luma([0]));
        assert_eq!(grey.get_pixel(0, 1), &Luma([255]));
    }

    #[test]
    fn test_memory_sink() {
        let mut sink = MemorySink::new();
        sink.record_scalar("train/loss", 2.0, 0).unwrap();
        sink.record_scalar("train/loss", 1.5, 1).unwrap();
        sink.record_scalar("train/acc", 0.5, 1).unwrap();

        assert_eq!(sink.last_scalar("train/loss"), Some(1.5));
        assert_eq!(sink.scalar_names(), vec!["train/acc", "train/loss"]);
        assert_eq!(sink.last_scalar("test/acc"), None);
    }

    #[test]
    fn test_json_lines_sink_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonLinesSink::new(dir.path()).unwrap();
        sink.record_scalar("train/loss", 1.25, 3).unwrap();
        let image = ImageGrid {
            channels: 1,
            height: 1,
            width: 1,
            pixels: vec![1.0],
        };
        sink.record_image("samples/class_0", &image, 3).unwrap();

        let log = fs::read_to_string(dir.path().join("metrics.jsonl")).unwrap();
        let record: serde_json::Value = serde_json::from_str(log.trim()).unwrap();
        assert_eq!(record["name"], "train/loss");
        assert_eq!(record["step"], 3);
        assert!(dir.path().join("images/samples_class_0_3.png").exists());
    }
}
