//! Captcha vision pipeline: glyph detection over the big challenge image
//! and siamese similarity matching against the four query glyphs.
//!
//! The two models are opaque pre-trained artifacts reached through the
//! `DetectionModel` / `SimilarityModel` traits, so any engine honoring the
//! tensor contract documented on those traits can be swapped in.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::{imageops, imageops::FilterType, RgbImage};

use crate::error::QueryError;

pub const DETECT_INPUT_WIDTH: u32 = 512;
pub const DETECT_INPUT_HEIGHT: u32 = 192;
pub const GLYPH_INPUT_SIZE: u32 = 105;
pub const CONFIDENCE_THRESHOLD: f32 = 0.7;
pub const IOU_THRESHOLD: f32 = 0.7;
pub const SIMILARITY_THRESHOLD: f32 = 0.7;
/// The challenge always contains exactly this many glyphs; any other
/// detection count is a failed inference pass, not a partial success.
pub const EXPECTED_BOXES: usize = 5;

/// Fixed x offsets of the four query glyphs in the small image.
const QUERY_OFFSETS: [u32; 4] = [165, 200, 231, 265];
const QUERY_TOP: u32 = 11;
const QUERY_HEIGHT: u32 = 28;
const QUERY_WIDTH: u32 = 26;

/// A detected glyph region in source-image pixel space.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: f32,
}

/// Top-left coordinate of the box matched to one query glyph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchPoint {
    pub x: i32,
    pub y: i32,
}

/// CHW-ordered float tensor, values scaled to 0..1, single image (the
/// batch dimension is implied).
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub height: usize,
    pub width: usize,
}

impl ImageTensor {
    pub fn from_rgb(img: &RgbImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let mut data = vec![0.0f32; 3 * h * w];
        for (x, y, pixel) in img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                data[c * h * w + y * w + x] = pixel.0[c] as f32 / 255.0;
            }
        }
        Self { data, height: h, width: w }
    }
}

/// Object-detection model over the normalized 512x192 challenge image.
///
/// Output is one row per candidate prediction laid out as
/// `[cx, cy, w, h, class scores...]` in model input space.
pub trait DetectionModel: Send + Sync {
    fn predict(&self, input: &ImageTensor) -> Result<Vec<Vec<f32>>, QueryError>;
}

/// Pairwise similarity model over two 105x105 glyph crops, returning the
/// raw logit (sigmoid applied by the caller).
pub trait SimilarityModel: Send + Sync {
    fn compare(&self, candidate: &ImageTensor, query: &ImageTensor) -> Result<f32, QueryError>;
}

pub struct Solver {
    detector: Box<dyn DetectionModel>,
    matcher: Box<dyn SimilarityModel>,
}

impl Solver {
    pub fn new(detector: Box<dyn DetectionModel>, matcher: Box<dyn SimilarityModel>) -> Self {
        Self { detector, matcher }
    }

    /// Detects glyph boxes in the big challenge image. Returns the boxes
    /// only when exactly [`EXPECTED_BOXES`] survive filtering and NMS.
    pub fn detect(&self, big: &RgbImage) -> Result<Option<[BoundingBox; EXPECTED_BOXES]>, QueryError> {
        let resized = imageops::resize(big, DETECT_INPUT_WIDTH, DETECT_INPUT_HEIGHT, FilterType::Triangle);
        let input = ImageTensor::from_rgb(&resized);
        let rows = self.detector.predict(&input)?;

        let x_factor = big.width() as f32 / DETECT_INPUT_WIDTH as f32;
        let y_factor = big.height() as f32 / DETECT_INPUT_HEIGHT as f32;

        let mut candidates = Vec::new();
        for row in &rows {
            if row.len() < 5 {
                continue;
            }
            let score = row[4..].iter().cloned().fold(f32::MIN, f32::max);
            if score < CONFIDENCE_THRESHOLD {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            candidates.push(BoundingBox {
                left: ((cx - w / 2.0) * x_factor) as i32,
                top: ((cy - h / 2.0) * y_factor) as i32,
                width: (w * x_factor) as i32,
                height: (h * y_factor) as i32,
                confidence: score,
            });
        }

        let kept = nms(candidates, IOU_THRESHOLD);
        if kept.len() != EXPECTED_BOXES {
            log::debug!("detection kept {} boxes, expected {}", kept.len(), EXPECTED_BOXES);
            return Ok(None);
        }
        let array: [BoundingBox; EXPECTED_BOXES] = match kept.try_into() {
            Ok(a) => a,
            Err(_) => unreachable!("length checked above"),
        };
        Ok(Some(array))
    }

    /// Matches the four query glyphs of the small image against the
    /// detected boxes, in query order. Returns at most 4 points; a box is
    /// not excluded once matched and may satisfy more than one glyph,
    /// mirroring the upstream verifier's tolerance.
    pub fn match_points(
        &self,
        big: &RgbImage,
        small: &RgbImage,
        boxes: &[BoundingBox; EXPECTED_BOXES],
    ) -> Result<Vec<MatchPoint>, QueryError> {
        let mut points = Vec::new();
        for &offset in QUERY_OFFSETS.iter() {
            if points.len() == QUERY_OFFSETS.len() {
                break;
            }
            let query_crop = crop_region(small, offset as i32, QUERY_TOP as i32, QUERY_WIDTH as i32, QUERY_HEIGHT as i32);
            let query = glyph_tensor(&query_crop);

            for bbox in boxes.iter() {
                // crop with the same 2px slack the verifier expects
                let candidate_crop = crop_region(big, bbox.left, bbox.top, bbox.width + 2, bbox.height + 2);
                let candidate = glyph_tensor(&candidate_crop);
                let logit = self.matcher.compare(&candidate, &query)?;
                if sigmoid(logit) >= SIMILARITY_THRESHOLD {
                    points.push(MatchPoint { x: bbox.left, y: bbox.top });
                    break;
                }
            }
        }
        Ok(points)
    }
}

/// Decodes a base64-encoded challenge image into RGB.
pub fn decode_base64_image(encoded: &str) -> Result<RgbImage, QueryError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| QueryError::Recognition(format!("image base64 decode failed: {}", e)))?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| QueryError::Recognition(format!("image decode failed: {}", e)))?;
    Ok(img.to_rgb8())
}

fn glyph_tensor(crop: &RgbImage) -> ImageTensor {
    let resized = imageops::resize(crop, GLYPH_INPUT_SIZE, GLYPH_INPUT_SIZE, FilterType::Triangle);
    ImageTensor::from_rgb(&resized)
}

/// Crop clamped to the image bounds; degenerate requests yield a 1x1 crop.
fn crop_region(img: &RgbImage, left: i32, top: i32, width: i32, height: i32) -> RgbImage {
    let x = left.clamp(0, img.width() as i32 - 1) as u32;
    let y = top.clamp(0, img.height() as i32 - 1) as u32;
    let w = (width.max(1) as u32).min(img.width() - x).max(1);
    let h = (height.max(1) as u32).min(img.height() - y).max(1);
    imageops::crop_imm(img, x, y, w, h).to_image()
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.left.max(b.left);
    let y1 = a.top.max(b.top);
    let x2 = (a.left + a.width).min(b.left + b.width);
    let y2 = (a.top + a.height).min(b.top + b.height);
    let inter = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
    let union = (a.width * a.height + b.width * b.height) as f32 - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Class-agnostic greedy non-max suppression, highest confidence first.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
