//! Image-side building blocks: regions, templates, matching and colour
//! counting.

pub mod color;
pub mod matcher;
pub mod region;
pub mod template;

pub use color::ColorBand;
pub use matcher::{MatchBackend, MatchResult, NccBackend, RawMatch, TemplateMatcher};
pub use region::{BoundingBox, Point, Region};
pub use template::{Invariance, StepRange, TemplateAsset, TemplateLibrary, TemplateVariant};
