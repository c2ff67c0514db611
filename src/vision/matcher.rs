use super::{BoundingBox, ControlKind, ControlLocator, Match, TemplateSet};
use crate::config::VisionConfig;
use crate::device::Frame;
use image::imageops::{self, FilterType};
use image::GrayImage;

/// Smallest template side, in working-resolution pixels, worth correlating.
const MIN_TEMPLATE_SIDE: u32 = 4;

/// Multi-scale template matcher using zero-mean normalized cross-correlation.
///
/// Frames wider than `match_width` are downsampled first; templates are
/// assumed to be cut from full-resolution captures and are scaled by the same
/// factor times each configured scale. Scores are in [-1, 1].
pub struct VisionMatcher {
    templates: TemplateSet,
    scales: Vec<f32>,
    match_width: u32,
}

impl VisionMatcher {
    pub fn new(templates: TemplateSet, config: &VisionConfig) -> Self {
        Self {
            templates,
            scales: config.scales.clone(),
            match_width: config.match_width,
        }
    }

    /// Best match over all scales, regardless of threshold.
    pub fn best_match(&self, frame: &Frame, kind: ControlKind) -> Option<Match> {
        let template = self.templates.get(kind)?;
        if frame.width() == 0 || frame.height() == 0 {
            return None;
        }

        let base = if frame.width() > self.match_width {
            self.match_width as f32 / frame.width() as f32
        } else {
            1.0
        };
        let working = if base < 1.0 {
            let h = ((frame.height() as f32 * base).round() as u32).max(1);
            imageops::resize(&frame.image, self.match_width, h, FilterType::Triangle)
        } else {
            frame.image.clone()
        };
        let integral = Integral::new(&working);

        let mut best: Option<(f32, u32, u32, u32, u32, f32)> = None;
        for &scale in &self.scales {
            let factor = base * scale;
            let tw = (template.width() as f32 * factor).round() as u32;
            let th = (template.height() as f32 * factor).round() as u32;
            if tw < MIN_TEMPLATE_SIDE
                || th < MIN_TEMPLATE_SIDE
                || tw > working.width()
                || th > working.height()
            {
                continue;
            }
            let scaled = if tw == template.width() && th == template.height() {
                template.clone()
            } else {
                imageops::resize(template, tw, th, FilterType::Triangle)
            };
            if let Some((score, x, y)) = correlate(&working, &integral, &scaled) {
                // Strictly greater keeps the earlier scale on ties.
                if best.map_or(true, |b| score > b.0) {
                    best = Some((score, x, y, tw, th, scale));
                }
            }
        }

        let (score, x, y, tw, th, scale) = best?;
        let to_full = |v: u32| (v as f32 / base).round() as i32;
        Some(Match {
            bbox: BoundingBox {
                x: to_full(x),
                y: to_full(y),
                width: to_full(tw).max(1) as u32,
                height: to_full(th).max(1) as u32,
            },
            confidence: score,
            scale,
        })
    }
}

impl ControlLocator for VisionMatcher {
    fn locate(&self, frame: &Frame, kind: ControlKind, min_confidence: f32) -> Option<Match> {
        let found = self.best_match(frame, kind)?;
        if found.confidence >= min_confidence {
            Some(found)
        } else {
            tracing::trace!(control = %kind, confidence = found.confidence, "below threshold");
            None
        }
    }
}

/// Summed-area tables of pixel values and squared pixel values.
struct Integral {
    width: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let w = img.width() as usize + 1;
        let h = img.height() as usize + 1;
        let mut sum = vec![0.0; w * h];
        let mut sq = vec![0.0; w * h];
        for y in 1..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 1..w {
                let v = img.get_pixel(x as u32 - 1, y as u32 - 1).0[0] as f64;
                row_sum += v;
                row_sq += v * v;
                sum[y * w + x] = sum[(y - 1) * w + x] + row_sum;
                sq[y * w + x] = sq[(y - 1) * w + x] + row_sq;
            }
        }
        Self { width: w, sum, sq }
    }

    fn window(table: &[f64], w: usize, x: usize, y: usize, tw: usize, th: usize) -> f64 {
        table[(y + th) * w + x + tw] - table[y * w + x + tw] - table[(y + th) * w + x]
            + table[y * w + x]
    }

    fn sums(&self, x: usize, y: usize, tw: usize, th: usize) -> (f64, f64) {
        (
            Self::window(&self.sum, self.width, x, y, tw, th),
            Self::window(&self.sq, self.width, x, y, tw, th),
        )
    }
}

/// Highest ZNCC score and its top-left corner, first in row-major order on ties.
/// `None` for a flat template, which correlates with nothing.
fn correlate(frame: &GrayImage, integral: &Integral, template: &GrayImage) -> Option<(f32, u32, u32)> {
    let tw = template.width() as usize;
    let th = template.height() as usize;
    let n = (tw * th) as f64;

    let raw: Vec<f64> = template.pixels().map(|p| p.0[0] as f64).collect();
    let mean = raw.iter().sum::<f64>() / n;
    let centered: Vec<f64> = raw.iter().map(|v| v - mean).collect();
    let t_norm = centered.iter().map(|v| v * v).sum::<f64>().sqrt();
    if t_norm < 1e-6 {
        return None;
    }

    let fw = frame.width() as usize;
    let pixels = frame.as_raw();
    let mut best: Option<(f64, usize, usize)> = None;
    for y in 0..=(frame.height() as usize - th) {
        for x in 0..=(fw - tw) {
            let (s, sq) = integral.sums(x, y, tw, th);
            let variance = sq - s * s / n;
            if variance <= 1e-6 {
                continue;
            }
            // Template is zero-mean, so the frame mean drops out of the numerator.
            let mut num = 0.0;
            for j in 0..th {
                let row = (y + j) * fw + x;
                let trow = j * tw;
                for i in 0..tw {
                    num += centered[trow + i] * pixels[row + i] as f64;
                }
            }
            let score = num / (t_norm * variance.sqrt());
            if best.map_or(true, |b| score > b.0) {
                best = Some((score, x, y));
            }
        }
    }
    best.map(|(score, x, y)| (score.clamp(-1.0, 1.0) as f32, x as u32, y as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn noise(x: u32, y: u32) -> Luma<u8> {
        let h = x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663);
        Luma([(h % 251) as u8])
    }

    /// A ring with a bar through it, drawn in flat shades.
    fn glyph(size: u32) -> GrayImage {
        let c = size as f32 / 2.0;
        GrayImage::from_fn(size, size, |x, y| {
            let dx = x as f32 + 0.5 - c;
            let dy = y as f32 + 0.5 - c;
            let r = (dx * dx + dy * dy).sqrt();
            if r > c * 0.55 && r < c * 0.85 {
                Luma([20])
            } else if dy.abs() < c * 0.15 && dx > -c * 0.4 {
                Luma([60])
            } else {
                Luma([235])
            }
        })
    }

    fn paste(canvas: &mut GrayImage, patch: &GrayImage, at: (u32, u32)) {
        imageops::replace(canvas, patch, at.0 as i64, at.1 as i64);
    }

    fn config(width: u32, scales: Vec<f32>) -> VisionConfig {
        VisionConfig {
            match_width: width,
            scales,
            ..VisionConfig::default()
        }
    }

    fn matcher_for(template: GrayImage, cfg: &VisionConfig) -> VisionMatcher {
        let mut set = TemplateSet::default();
        set.insert(ControlKind::FollowButton, template);
        VisionMatcher::new(set, cfg)
    }

    #[test]
    fn test_exact_location_on_noisy_frame() {
        let mut canvas = GrayImage::from_fn(200, 160, noise);
        let icon = glyph(24);
        paste(&mut canvas, &icon, (120, 80));
        let frame = Frame::new(canvas, chrono::Utc::now());

        let m = matcher_for(icon, &config(360, vec![0.9, 1.0, 1.1]));
        let found = m.locate(&frame, ControlKind::FollowButton, 0.8).unwrap();
        assert_eq!(found.bbox, BoundingBox { x: 120, y: 80, width: 24, height: 24 });
        assert!(found.confidence > 0.99);
        assert_eq!(found.scale, 1.0);
        assert_eq!(found.center(), (132, 92));
    }

    #[test]
    fn test_absent_control_is_none() {
        let frame = Frame::new(GrayImage::from_fn(200, 160, noise), chrono::Utc::now());
        let m = matcher_for(glyph(24), &config(360, vec![0.9, 1.0, 1.1]));
        assert!(m.locate(&frame, ControlKind::FollowButton, 0.8).is_none());
        // Unknown template kinds are simply absent.
        assert!(m.locate(&frame, ControlKind::HomeTab, 0.1).is_none());
    }

    #[test]
    fn test_tolerates_scale_drift() {
        let mut canvas = GrayImage::from_pixel(160, 160, Luma([235]));
        paste(&mut canvas, &glyph(32), (60, 40));
        // Same screen rendered 10% larger than the template was cut from.
        let drifted = imageops::resize(&canvas, 176, 176, FilterType::Triangle);
        let frame = Frame::new(drifted, chrono::Utc::now());

        let m = matcher_for(glyph(32), &config(600, vec![0.9, 1.0, 1.1]));
        let found = m.locate(&frame, ControlKind::FollowButton, 0.8).unwrap();
        assert_eq!(found.scale, 1.1);
        let (cx, cy) = found.center();
        assert!((cx - 84).abs() <= 3, "cx = {}", cx);
        assert!((cy - 62).abs() <= 3, "cy = {}", cy);
    }

    #[test]
    fn test_downsampled_match_maps_back_to_full_resolution() {
        let mut canvas = GrayImage::from_pixel(720, 480, Luma([235]));
        paste(&mut canvas, &glyph(48), (400, 200));
        let frame = Frame::new(canvas, chrono::Utc::now());

        let m = matcher_for(glyph(48), &config(360, vec![1.0]));
        let found = m.locate(&frame, ControlKind::FollowButton, 0.8).unwrap();
        let (cx, cy) = found.center();
        assert!((cx - 424).abs() <= 2, "cx = {}", cx);
        assert!((cy - 224).abs() <= 2, "cy = {}", cy);
    }

    #[test]
    fn test_repeated_calls_are_identical() {
        let mut canvas = GrayImage::from_fn(200, 160, noise);
        paste(&mut canvas, &glyph(24), (30, 100));
        paste(&mut canvas, &glyph(24), (150, 20));
        let frame = Frame::new(canvas, chrono::Utc::now());
        let m = matcher_for(glyph(24), &config(360, vec![0.95, 1.0, 1.05]));

        let first = m.locate(&frame, ControlKind::FollowButton, 0.8).unwrap();
        for _ in 0..3 {
            assert_eq!(m.locate(&frame, ControlKind::FollowButton, 0.8), Some(first));
        }
        // Two identical candidates: row-major order picks the upper one.
        assert_eq!((first.bbox.x, first.bbox.y), (150, 20));
    }

    #[test]
    fn test_flat_template_never_matches() {
        let frame = Frame::new(GrayImage::from_fn(64, 64, noise), chrono::Utc::now());
        let m = matcher_for(GrayImage::from_pixel(8, 8, Luma([128])), &config(360, vec![1.0]));
        assert!(m.best_match(&frame, ControlKind::FollowButton).is_none());
    }
}
