//! Template search within a captured region.
//!
//! [`TemplateMatcher`] owns the policy (confidence threshold, containment,
//! first-found ordering, once-per-path asset diagnostics). The raw
//! correlation is delegated to a [`MatchBackend`].

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashSet;
use image::imageops::FilterType;
use image::{GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image, sum_image_pixels};
use imageproc::template_matching::{MatchTemplateMethod, match_template};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::region::{BoundingBox, Point};
use super::template::TemplateAsset;
use crate::error::{AssetError, MatchError};
use crate::observability::events::{ErrorKind, Event, EventBus};
use crate::observability::metrics;
use crate::platform::Frame;

// ============================================================================
// Backend seam
// ============================================================================

/// Best location of a template inside a haystack, in haystack pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawMatch {
    /// Left edge of the best placement.
    pub x: u32,
    /// Top edge of the best placement.
    pub y: u32,
    /// Match quality in `[0, 1]`.
    pub confidence: f32,
}

/// The correlation capability: "where does `template` fit best in `haystack`".
///
/// Implementations may assume `template` is no larger than `haystack`.
pub trait MatchBackend: Send + Sync {
    /// Returns the best placement, or `None` if nothing could be scored.
    ///
    /// # Errors
    ///
    /// Returns a message if the backend failed for this pair; the caller
    /// skips the pair for the current tick.
    fn best_match(
        &self,
        haystack: &GrayImage,
        template: &GrayImage,
    ) -> Result<Option<RawMatch>, String>;
}

/// Zero-mean normalised cross-correlation matcher built on `imageproc`.
///
/// Confidence is the correlation coefficient clamped to `[0, 1]`: an exact
/// pixel match scores 1.0 and unrelated texture scores near 0. A flat
/// template, or a flat window of the haystack, carries no pattern and
/// scores 0. With `pyramid > 1` the search runs on images downscaled by
/// that factor and is then refined at full resolution around the coarse hit.
#[derive(Debug, Clone, Copy)]
pub struct NccBackend {
    pyramid: u32,
}

impl Default for NccBackend {
    fn default() -> Self {
        Self { pyramid: 1 }
    }
}

/// Smallest template side, after downscaling, worth a coarse pass.
const MIN_COARSE_SIDE: u32 = 4;

impl NccBackend {
    /// Creates a backend with the given coarse-search factor (1 disables it).
    #[must_use]
    pub fn new(pyramid: u32) -> Self {
        Self {
            pyramid: pyramid.max(1),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn exhaustive(haystack: &GrayImage, template: &GrayImage) -> Option<RawMatch> {
        let pattern = Pattern::new(template);
        if pattern.is_flat() {
            return Some(RawMatch {
                x: 0,
                y: 0,
                confidence: 0.0,
            });
        }

        let cross = match_template(haystack, template, MatchTemplateMethod::CrossCorrelation);
        let sums: Image<Luma<u64>> = integral_image(haystack);
        let squares: Image<Luma<u64>> = integral_squared_image(haystack);
        let (tw, th) = template.dimensions();

        let mut best: Option<RawMatch> = None;
        for (x, y, px) in cross.enumerate_pixels() {
            let (right, bottom) = (x + tw - 1, y + th - 1);
            let sum = sum_image_pixels(&sums, x, y, right, bottom)[0] as f64;
            let sum_sq = sum_image_pixels(&squares, x, y, right, bottom)[0] as f64;
            let Some(confidence) = pattern.correlate(f64::from(px[0]), sum, sum_sq) else {
                continue;
            };
            if best.is_none_or(|b| confidence > b.confidence) {
                best = Some(RawMatch { x, y, confidence });
            }
        }
        best
    }

    fn coarse_to_fine(&self, haystack: &GrayImage, template: &GrayImage) -> Option<RawMatch> {
        let p = self.pyramid;
        let (hw, hh) = haystack.dimensions();
        let (tw, th) = template.dimensions();
        let small_hay = image::imageops::resize(haystack, hw / p, hh / p, FilterType::Triangle);
        let small_tpl = image::imageops::resize(template, tw / p, th / p, FilterType::Triangle);
        let coarse = Self::exhaustive(&small_hay, &small_tpl)?;

        let margin = 2 * p;
        let x0 = (coarse.x * p).saturating_sub(margin);
        let y0 = (coarse.y * p).saturating_sub(margin);
        let ww = (tw + 2 * margin).min(hw - x0);
        let wh = (th + 2 * margin).min(hh - y0);
        if ww < tw || wh < th {
            return Self::exhaustive(haystack, template);
        }
        let window = image::imageops::crop_imm(haystack, x0, y0, ww, wh).to_image();
        Self::exhaustive(&window, template).map(|m| RawMatch {
            x: m.x + x0,
            y: m.y + y0,
            confidence: m.confidence,
        })
    }
}

impl MatchBackend for NccBackend {
    fn best_match(
        &self,
        haystack: &GrayImage,
        template: &GrayImage,
    ) -> Result<Option<RawMatch>, String> {
        let (tw, th) = template.dimensions();
        if tw == 0 || th == 0 {
            return Err("template has no pixels".to_string());
        }
        let coarse_fits =
            tw / self.pyramid >= MIN_COARSE_SIDE && th / self.pyramid >= MIN_COARSE_SIDE;
        if self.pyramid > 1 && coarse_fits {
            return Ok(self.coarse_to_fine(haystack, template));
        }
        Ok(Self::exhaustive(haystack, template))
    }
}

/// Sum of squared deviations below which an area counts as flat.
const FLAT_VARIANCE: f64 = 0.5;

/// Template statistics shared by every window of one search.
struct Pattern {
    n: f64,
    sum: f64,
    deviation: f64,
}

impl Pattern {
    #[allow(clippy::cast_precision_loss)]
    fn new(template: &GrayImage) -> Self {
        let (mut sum, mut sum_sq) = (0.0, 0.0);
        for p in template.pixels() {
            let v = f64::from(p[0]);
            sum += v;
            sum_sq += v * v;
        }
        let n = f64::from(template.width()) * f64::from(template.height());
        Self {
            n,
            sum,
            deviation: sum_sq - sum * sum / n,
        }
    }

    fn is_flat(&self) -> bool {
        self.deviation < FLAT_VARIANCE
    }

    /// Correlation coefficient of one window given its raw cross term and
    /// pixel sums. Flat windows score 0; non-finite results are skipped.
    #[allow(clippy::cast_possible_truncation)]
    fn correlate(&self, cross: f64, sum: f64, sum_sq: f64) -> Option<f32> {
        let window = sum_sq - sum * sum / self.n;
        if window < FLAT_VARIANCE {
            return Some(0.0);
        }
        let r = (cross - sum * self.sum / self.n) / (self.deviation * window).sqrt();
        r.is_finite().then(|| r.clamp(0.0, 1.0) as f32)
    }
}

// ============================================================================
// Matcher
// ============================================================================

/// An accepted match in absolute screen coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Matched area, fully inside the searched region.
    pub bbox: BoundingBox,
    /// Match quality in `[0, 1]`.
    pub confidence: f32,
    /// Label of the template that matched.
    pub template: String,
    /// Scale of the winning variant.
    pub scale: f32,
    /// Rotation of the winning variant in degrees.
    pub angle: f32,
}

impl MatchResult {
    /// Click target for this match.
    #[must_use]
    pub const fn center(&self) -> Point {
        self.bbox.center()
    }
}

/// Searches frames for templates.
pub struct TemplateMatcher {
    backend: Arc<dyn MatchBackend>,
    confidence: f32,
    reported: DashSet<PathBuf>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for TemplateMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateMatcher")
            .field("confidence", &self.confidence)
            .field("reported", &self.reported.len())
            .finish_non_exhaustive()
    }
}

impl TemplateMatcher {
    /// Creates a matcher with an explicit backend.
    #[must_use]
    pub fn new(backend: Arc<dyn MatchBackend>, confidence: f32, events: Arc<EventBus>) -> Self {
        Self {
            backend,
            confidence: confidence.clamp(0.0, 1.0),
            reported: DashSet::new(),
            events,
        }
    }

    /// Creates a matcher using [`NccBackend`].
    #[must_use]
    pub fn with_default_backend(confidence: f32, pyramid: u32, events: Arc<EventBus>) -> Self {
        Self::new(Arc::new(NccBackend::new(pyramid)), confidence, events)
    }

    /// Default confidence threshold.
    #[must_use]
    pub const fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Finds `template` in `frame` at the default threshold.
    #[must_use]
    pub fn locate(&self, template: &TemplateAsset, frame: &Frame) -> Option<MatchResult> {
        self.locate_with(template, frame, self.confidence)
    }

    /// Returns the first template in `templates` that matches, trying them
    /// in order and stopping at the first hit.
    pub fn locate_any<'a, I>(&self, templates: I, frame: &Frame) -> Option<MatchResult>
    where
        I: IntoIterator<Item = &'a Arc<TemplateAsset>>,
    {
        templates
            .into_iter()
            .find_map(|t| self.locate_with(t, frame, self.confidence))
    }

    /// Finds the best variant of `template` in `frame` whose confidence is
    /// at least `threshold` and whose box lies entirely inside the frame's
    /// region.
    ///
    /// Never fails: unreadable or oversized assets are reported once and
    /// then treated as absent; a backend failure skips that variant.
    #[must_use]
    pub fn locate_with(
        &self,
        template: &TemplateAsset,
        frame: &Frame,
        threshold: f32,
    ) -> Option<MatchResult> {
        let variants = match template.variants() {
            Ok(v) => v,
            Err(e) => {
                self.report_once(e);
                return None;
            }
        };

        let haystack = frame.luma();
        let region = frame.region();
        let mut fitted = false;
        let mut best: Option<MatchResult> = None;

        for variant in variants {
            let (tw, th) = variant.image.dimensions();
            if tw > haystack.width() || th > haystack.height() {
                continue;
            }
            fitted = true;

            let raw = match self.backend.best_match(haystack, &variant.image) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(reason) => {
                    let err = MatchError {
                        template: template.label().to_string(),
                        scale: variant.scale,
                        angle: variant.angle,
                        reason,
                    };
                    debug!(error = %err, "variant skipped this tick");
                    metrics::record_error(ErrorKind::Match);
                    continue;
                }
            };

            if raw.confidence < threshold {
                continue;
            }
            let bbox = region.to_screen(raw.x, raw.y, tw, th);
            if !region.contains(&bbox) {
                trace!(template = template.label(), ?bbox, "match straddles region edge, rejected");
                continue;
            }
            if best.as_ref().is_none_or(|b| raw.confidence > b.confidence) {
                best = Some(MatchResult {
                    bbox,
                    confidence: raw.confidence,
                    template: template.label().to_string(),
                    scale: variant.scale,
                    angle: variant.angle,
                });
            }
        }

        if !fitted {
            let (template_width, template_height) = template.size().unwrap_or_default();
            self.report_once(&AssetError::Oversized {
                path: template.path().to_path_buf(),
                template_width,
                template_height,
                region_width: region.width(),
                region_height: region.height(),
            });
        }

        if let Some(m) = &best {
            trace!(template = %m.template, confidence = m.confidence, "template matched");
            metrics::record_match();
        }
        best
    }

    fn report_once(&self, err: &AssetError) {
        let path = match err {
            AssetError::Unreadable { path, .. } | AssetError::Oversized { path, .. } => path,
        };
        if self.reported.insert(path.clone()) {
            warn!(error = %err, "template will be treated as not found");
            metrics::record_error(ErrorKind::Asset);
            self.events.emit(Event::error(ErrorKind::Asset, err.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Frame;
    use crate::vision::region::Region;
    use crate::vision::template::{Invariance, StepRange};
    use image::{Rgba, RgbaImage};
    use imageproc::geometric_transformations::{Interpolation, rotate_about_center};

    /// Deterministic textured background, never zero.
    fn background(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            let v = u8::try_from((x * 7 + y * 3) % 60 + 100).unwrap();
            Rgba([v, v, v, 255])
        })
    }

    /// Vertical 0/255 stripes, 2 pixels wide.
    fn stripes(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, _| Luma([if (x / 2) % 2 == 0 { 255 } else { 0 }]))
    }

    fn paint(screen: &mut RgbaImage, tpl: &GrayImage, at: (u32, u32)) {
        for (x, y, p) in tpl.enumerate_pixels() {
            let v = p[0];
            screen.put_pixel(at.0 + x, at.1 + y, Rgba([v, v, v, 255]));
        }
    }

    fn frame(region: Region, screen: &RgbaImage) -> Frame {
        let x = u32::try_from(region.x1()).unwrap();
        let y = u32::try_from(region.y1()).unwrap();
        let pixels =
            image::imageops::crop_imm(screen, x, y, region.width(), region.height()).to_image();
        Frame::new(region, pixels).unwrap()
    }

    fn matcher(events: Arc<EventBus>) -> TemplateMatcher {
        TemplateMatcher::with_default_backend(0.8, 1, events)
    }

    #[test]
    fn finds_painted_template_with_absolute_coordinates() {
        let tpl = stripes(12, 10);
        let mut screen = background(120, 100);
        paint(&mut screen, &tpl, (40, 30));
        let region = Region::new(10, 10, 110, 90).unwrap();
        let asset = TemplateAsset::from_image("stripes", &tpl, None);

        let m = matcher(Arc::new(EventBus::new()))
            .locate(&asset, &frame(region, &screen))
            .unwrap();
        assert_eq!(m.bbox, BoundingBox { left: 40, top: 30, right: 52, bottom: 40 });
        assert!(m.confidence > 0.99);
        assert_eq!(m.center(), Point { x: 46, y: 35 });
    }

    #[test]
    fn absent_template_is_none() {
        let tpl = stripes(12, 10);
        let screen = background(120, 100);
        let region = Region::new(0, 0, 120, 100).unwrap();
        let asset = TemplateAsset::from_image("stripes", &tpl, None);
        assert!(matcher(Arc::new(EventBus::new())).locate(&asset, &frame(region, &screen)).is_none());
    }

    /// Uniform-ish noise in `[80, 200)` from a seeded LCG.
    fn noise(seed: u32, w: u32, h: u32) -> GrayImage {
        let mut state = seed;
        GrayImage::from_fn(w, h, |_, _| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            Luma([u8::try_from(80 + (state >> 24) % 120).unwrap()])
        })
    }

    fn gray_screen(img: &GrayImage) -> RgbaImage {
        RgbaImage::from_fn(img.width(), img.height(), |x, y| {
            let v = img.get_pixel(x, y)[0];
            Rgba([v, v, v, 255])
        })
    }

    #[test]
    fn unrelated_texture_does_not_match() {
        let screen = gray_screen(&noise(7, 200, 200));
        let region = Region::new(0, 0, 200, 200).unwrap();
        let asset = TemplateAsset::from_image("noise", &noise(99, 24, 24), None);
        let m = matcher(Arc::new(EventBus::new()));
        assert!(m.locate(&asset, &frame(region, &screen)).is_none());
        // and the same noise is found where it was cut from
        let cut = image::imageops::crop_imm(&noise(7, 200, 200), 120, 33, 24, 24).to_image();
        let found = m
            .locate(&TemplateAsset::from_image("cut", &cut, None), &frame(region, &screen))
            .unwrap();
        assert_eq!((found.bbox.left, found.bbox.top), (120, 33));
    }

    #[test]
    fn invariance_finds_scaled_and_rotated_copies() {
        let tpl = noise(3, 20, 20);
        let region = Region::new(0, 0, 120, 100).unwrap();
        let m = matcher(Arc::new(EventBus::new()));
        let fixed = StepRange { min: 1.0, max: 1.0, step: 0.0 };
        let upright = StepRange { min: 0.0, max: 0.0, step: 0.0 };

        let bigger = image::imageops::resize(&tpl, 30, 30, FilterType::Triangle);
        let mut screen = background(120, 100);
        paint(&mut screen, &bigger, (70, 40));
        let scales = Invariance {
            scales: StepRange { min: 1.0, max: 1.5, step: 0.5 },
            angles: upright,
        };
        let found = m
            .locate(&TemplateAsset::from_image("grown", &tpl, Some(&scales)), &frame(region, &screen))
            .unwrap();
        assert_eq!((found.bbox.left, found.bbox.top), (70, 40));
        assert_eq!(found.bbox.right - found.bbox.left, 30);
        assert!((found.scale - 1.5).abs() < 1e-6);
        assert!(
            m.locate(&TemplateAsset::from_image("plain", &tpl, None), &frame(region, &screen))
                .is_none()
        );

        let turned = rotate_about_center(&tpl, 15f32.to_radians(), Interpolation::Bilinear, Luma([0]));
        let mut screen = background(120, 100);
        paint(&mut screen, &turned, (30, 50));
        let angles = Invariance {
            scales: fixed,
            angles: StepRange { min: 0.0, max: 15.0, step: 15.0 },
        };
        let found = m
            .locate(&TemplateAsset::from_image("tilted", &tpl, Some(&angles)), &frame(region, &screen))
            .unwrap();
        assert_eq!((found.bbox.left, found.bbox.top), (30, 50));
        assert!((found.angle - 15.0).abs() < 1e-6);
    }

    #[test]
    fn flat_template_never_matches() {
        let region = Region::new(0, 0, 120, 100).unwrap();
        let flat = GrayImage::from_pixel(16, 16, Luma([150]));
        let asset = TemplateAsset::from_image("flat", &flat, None);
        let m = matcher(Arc::new(EventBus::new()));
        assert!(m.locate(&asset, &frame(region, &background(120, 100))).is_none());

        let solid = RgbaImage::from_pixel(120, 100, Rgba([150, 150, 150, 255]));
        assert!(m.locate(&asset, &frame(region, &solid)).is_none());
    }

    #[test]
    fn flat_window_scores_zero() {
        let haystack = GrayImage::from_pixel(40, 30, Luma([90]));
        let raw = NccBackend::default()
            .best_match(&haystack, &stripes(12, 10))
            .unwrap()
            .unwrap();
        assert!(raw.confidence.abs() < f32::EPSILON);
    }

    /// Backend that always reports a fixed placement.
    struct FixedBackend(RawMatch);

    impl MatchBackend for FixedBackend {
        fn best_match(&self, _: &GrayImage, _: &GrayImage) -> Result<Option<RawMatch>, String> {
            Ok(Some(self.0))
        }
    }

    #[test]
    fn straddling_match_is_rejected_not_clamped() {
        let region = Region::new(0, 0, 200, 200).unwrap();
        let screen = background(200, 200);
        let tpl = GrayImage::from_pixel(20, 20, Luma([9]));
        let asset = TemplateAsset::from_image("edge", &tpl, None);
        let backend = FixedBackend(RawMatch { x: 190, y: 50, confidence: 0.95 });
        let m = TemplateMatcher::new(Arc::new(backend), 0.8, Arc::new(EventBus::new()));
        assert!(m.locate(&asset, &frame(region, &screen)).is_none());
    }

    #[test]
    fn below_threshold_is_rejected() {
        let region = Region::new(0, 0, 200, 200).unwrap();
        let screen = background(200, 200);
        let tpl = GrayImage::from_pixel(20, 20, Luma([9]));
        let asset = TemplateAsset::from_image("faint", &tpl, None);
        let backend = FixedBackend(RawMatch { x: 10, y: 10, confidence: 0.79 });
        let m = TemplateMatcher::new(Arc::new(backend), 0.8, Arc::new(EventBus::new()));
        assert!(m.locate(&asset, &frame(region, &screen)).is_none());
        assert!(m.locate_with(&asset, &frame(region, &screen), 0.7).is_some());
    }

    /// Backend that fails for every call.
    struct BrokenBackend;

    impl MatchBackend for BrokenBackend {
        fn best_match(&self, _: &GrayImage, _: &GrayImage) -> Result<Option<RawMatch>, String> {
            Err("boom".to_string())
        }
    }

    #[test]
    fn backend_failure_is_absorbed() {
        let region = Region::new(0, 0, 50, 50).unwrap();
        let screen = background(50, 50);
        let asset = TemplateAsset::from_image("x", &GrayImage::new(5, 5), None);
        let m = TemplateMatcher::new(Arc::new(BrokenBackend), 0.8, Arc::new(EventBus::new()));
        assert!(m.locate(&asset, &frame(region, &screen)).is_none());
    }

    #[test]
    fn first_found_template_wins_in_order() {
        let a = stripes(12, 10);
        let b = GrayImage::from_fn(12, 10, |_, y| Luma([if (y / 2) % 2 == 0 { 255 } else { 0 }]));
        let mut screen = background(120, 100);
        paint(&mut screen, &a, (10, 10));
        paint(&mut screen, &b, (60, 60));
        let region = Region::new(0, 0, 120, 100).unwrap();
        let templates = vec![
            Arc::new(TemplateAsset::from_image("b", &b, None)),
            Arc::new(TemplateAsset::from_image("a", &a, None)),
        ];
        let m = matcher(Arc::new(EventBus::new()))
            .locate_any(&templates, &frame(region, &screen))
            .unwrap();
        assert_eq!(m.template, "b");
    }

    #[test]
    fn oversized_and_unreadable_are_reported_once() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let m = matcher(Arc::clone(&events));
        let region = Region::new(0, 0, 30, 30).unwrap();
        let screen = background(30, 30);
        let f = frame(region, &screen);

        let big = TemplateAsset::from_image("big", &GrayImage::new(40, 10), None);
        let missing = TemplateAsset::load(std::path::Path::new("/nonexistent/gone.png"), None);
        for _ in 0..3 {
            assert!(m.locate(&big, &f).is_none());
            assert!(m.locate(&missing, &f).is_none());
        }

        let mut errors = Vec::new();
        while let Ok(event) = rx.try_recv() {
            errors.push(event);
        }
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.name() == "ErrorOccurred"));
    }

    #[test]
    fn coarse_to_fine_finds_same_location() {
        let tpl = GrayImage::from_fn(24, 24, |x, y| {
            Luma([if ((x / 4) + (y / 4)) % 2 == 0 { 255 } else { 0 }])
        });
        let mut screen = background(200, 160);
        paint(&mut screen, &tpl, (101, 57));
        let region = Region::new(0, 0, 200, 160).unwrap();
        let asset = TemplateAsset::from_image("checker", &tpl, None);
        let m = TemplateMatcher::with_default_backend(0.8, 2, Arc::new(EventBus::new()))
            .locate(&asset, &frame(region, &screen))
            .unwrap();
        assert_eq!((m.bbox.left, m.bbox.top), (101, 57));
    }
}
