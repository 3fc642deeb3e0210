//! Template assets and their scale/rotation variants.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::FilterType;
use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AssetError;

// ============================================================================
// Invariance
// ============================================================================

/// Inclusive `min..=max` range walked in `step` increments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepRange {
    /// First value.
    pub min: f32,
    /// Last value (inclusive).
    pub max: f32,
    /// Increment; a non-positive step yields only `min`.
    pub step: f32,
}

impl StepRange {
    /// Number of values the range expands to, without allocating them.
    /// Saturates instead of overflowing for absurdly fine steps.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn count(&self) -> usize {
        if self.step <= 0.0 || self.max <= self.min {
            return 1;
        }
        let steps = ((self.max - self.min) / self.step + 1e-4).floor();
        (steps as usize).saturating_add(1)
    }

    /// Expands the range into its values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn values(&self) -> Vec<f32> {
        if self.step <= 0.0 || self.max <= self.min {
            return vec![self.min];
        }
        (0..self.count())
            .map(|i| {
                let v = self.min + self.step * i as f32;
                (v * 10_000.0).round() / 10_000.0
            })
            .collect()
    }
}

/// Scale and rotation variants to try for every template.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Invariance {
    /// Scale factors.
    pub scales: StepRange,
    /// Rotation angles in degrees.
    pub angles: StepRange,
}

impl Invariance {
    /// Variants generated per template, counting the identity.
    #[must_use]
    pub fn variant_count(&self) -> usize {
        self.scales.count().saturating_mul(self.angles.count())
    }
}

impl Default for Invariance {
    fn default() -> Self {
        Self {
            scales: StepRange {
                min: 0.5,
                max: 2.0,
                step: 0.05,
            },
            angles: StepRange {
                min: -45.0,
                max: 45.0,
                step: 15.0,
            },
        }
    }
}

// ============================================================================
// Assets
// ============================================================================

/// One concrete image to correlate against a frame.
#[derive(Debug, Clone)]
pub struct TemplateVariant {
    /// Grayscale pixels.
    pub image: GrayImage,
    /// Scale relative to the source asset.
    pub scale: f32,
    /// Rotation in degrees.
    pub angle: f32,
}

/// A template image loaded once at configuration time.
///
/// An unreadable asset is kept (not dropped) so the matcher can report it
/// the first time it is searched for and then keep treating it as absent.
#[derive(Debug)]
pub struct TemplateAsset {
    path: PathBuf,
    label: String,
    variants: Result<Vec<TemplateVariant>, AssetError>,
}

impl TemplateAsset {
    /// Loads and decodes `path`, expanding variants when `invariance` is set.
    #[must_use]
    pub fn load(path: &Path, invariance: Option<&Invariance>) -> Self {
        let label = label_for(path);
        let variants = image::open(path)
            .map(|img| build_variants(&img.to_luma8(), invariance))
            .map_err(|e| AssetError::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        match &variants {
            Ok(v) => debug!(template = %label, variants = v.len(), "template loaded"),
            Err(e) => debug!(template = %label, error = %e, "template failed to load"),
        }
        Self {
            path: path.to_path_buf(),
            label,
            variants,
        }
    }

    /// Builds an asset from pixels already in memory.
    #[must_use]
    pub fn from_image(label: &str, image: &GrayImage, invariance: Option<&Invariance>) -> Self {
        Self {
            path: PathBuf::from(label),
            label: label.to_string(),
            variants: Ok(build_variants(image, invariance)),
        }
    }

    /// Source path (or label for in-memory assets).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Short name used in logs, events and match results.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The variants, or the reason this asset can never match.
    ///
    /// # Errors
    ///
    /// Returns the [`AssetError`] recorded at load time.
    pub fn variants(&self) -> Result<&[TemplateVariant], &AssetError> {
        self.variants.as_deref()
    }

    /// Size of the unscaled, unrotated image.
    #[must_use]
    pub fn size(&self) -> Option<(u32, u32)> {
        self.variants
            .as_ref()
            .ok()
            .and_then(|v| v.first())
            .map(|v| v.image.dimensions())
    }
}

fn label_for(path: &Path) -> String {
    path.file_stem()
        .map_or_else(|| path.display().to_string(), |s| s.to_string_lossy().into_owned())
}

/// Expands a source image into its variants. The identity variant is always
/// first.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn build_variants(source: &GrayImage, invariance: Option<&Invariance>) -> Vec<TemplateVariant> {
    let mut variants = vec![TemplateVariant {
        image: source.clone(),
        scale: 1.0,
        angle: 0.0,
    }];
    let Some(inv) = invariance else {
        return variants;
    };

    let (w, h) = source.dimensions();
    for scale in inv.scales.values() {
        let sw = ((w as f32) * scale).round().max(1.0) as u32;
        let sh = ((h as f32) * scale).round().max(1.0) as u32;
        let scaled = if (sw, sh) == (w, h) {
            source.clone()
        } else {
            image::imageops::resize(source, sw, sh, FilterType::Triangle)
        };
        for angle in inv.angles.values() {
            if (sw, sh) == (w, h) && angle == 0.0 {
                continue;
            }
            let image = if angle == 0.0 {
                scaled.clone()
            } else {
                rotate_about_center(
                    &scaled,
                    angle.to_radians(),
                    Interpolation::Bilinear,
                    Luma([0]),
                )
            };
            variants.push(TemplateVariant {
                image,
                scale,
                angle,
            });
        }
    }
    variants
}

// ============================================================================
// Library
// ============================================================================

/// Loads each template path once and shares it between phases.
#[derive(Debug, Default)]
pub struct TemplateLibrary {
    invariance: Option<Invariance>,
    assets: HashMap<PathBuf, Arc<TemplateAsset>>,
}

impl TemplateLibrary {
    /// Creates a library; `invariance` applies to every asset it loads.
    #[must_use]
    pub fn new(invariance: Option<Invariance>) -> Self {
        Self {
            invariance,
            assets: HashMap::new(),
        }
    }

    /// Returns the shared asset for `path`, loading it on first use.
    pub fn get(&mut self, path: &Path) -> Arc<TemplateAsset> {
        let invariance = self.invariance;
        Arc::clone(
            self.assets
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(TemplateAsset::load(path, invariance.as_ref()))),
        )
    }

    /// Number of distinct assets loaded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// Returns `true` if nothing has been loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}
