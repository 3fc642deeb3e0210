//! Screen capture and input injection seams.
//!
//! Engines only talk to the desktop through [`ScreenCapture`] and
//! [`InputInjector`]. The [`stub`] module provides in-memory versions for
//! dry runs and tests; the `desktop` feature adds real backends.

#[cfg(feature = "desktop")]
pub mod desktop;
pub mod stub;

use std::str::FromStr;
use std::sync::OnceLock;

use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, InputError};
use crate::vision::region::{Point, Region};

// ============================================================================
// Frame
// ============================================================================

/// Pixels grabbed from one region during one tick.
///
/// The grayscale view used by template matching is computed lazily and
/// at most once per frame.
pub struct Frame {
    region: Region,
    pixels: RgbaImage,
    luma: OnceLock<GrayImage>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// Wraps a capture of `region`.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::SizeMismatch`] if the buffer size differs
    /// from the region size.
    pub fn new(region: Region, pixels: RgbaImage) -> Result<Self, CaptureError> {
        if pixels.width() != region.width() || pixels.height() != region.height() {
            return Err(CaptureError::SizeMismatch {
                width: region.width(),
                height: region.height(),
                actual_width: pixels.width(),
                actual_height: pixels.height(),
            });
        }
        Ok(Self {
            region,
            pixels,
            luma: OnceLock::new(),
        })
    }

    /// Region this frame was captured from.
    #[must_use]
    pub const fn region(&self) -> &Region {
        &self.region
    }

    /// Raw RGBA pixels.
    #[must_use]
    pub const fn rgba(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Grayscale view of the frame.
    #[must_use]
    pub fn luma(&self) -> &GrayImage {
        self.luma
            .get_or_init(|| image::imageops::grayscale(&self.pixels))
    }

    /// Encodes the frame as PNG, e.g. for a notification snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut out = std::io::Cursor::new(Vec::new());
        self.pixels.write_to(&mut out, image::ImageFormat::Png)?;
        Ok(out.into_inner())
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Grabs the pixels of a screen rectangle.
pub trait ScreenCapture: Send {
    /// Captures `region`.
    ///
    /// # Errors
    ///
    /// Returns a [`CaptureError`] on a transient backend failure.
    fn grab(&mut self, region: &Region) -> Result<Frame, CaptureError>;
}

/// Mouse and keyboard injection.
pub trait InputInjector: Send {
    /// Moves the pointer to absolute screen coordinates.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] if the backend rejects the move.
    fn move_to(&mut self, point: Point) -> Result<(), InputError>;

    /// Clicks the left button once.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] if the backend rejects the click.
    fn click(&mut self) -> Result<(), InputError>;

    /// Clicks the left button twice in quick succession.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] if the backend rejects the click.
    fn double_click(&mut self) -> Result<(), InputError>;

    /// Presses and releases a key.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] if the backend rejects the key.
    fn tap_key(&mut self, key: Key) -> Result<(), InputError>;

    /// Moves to `point` and clicks with the given click type.
    ///
    /// # Errors
    ///
    /// Returns the first [`InputError`] from the move or the click.
    fn click_at(&mut self, point: Point, click: ClickType) -> Result<(), InputError> {
        self.move_to(point)?;
        match click {
            ClickType::Single => self.click(),
            ClickType::Double => self.double_click(),
        }
    }
}

/// Hands out capture and input handles, one per engine.
///
/// Every engine owns its handles exclusively; a backend decides whether
/// they share an underlying device.
pub trait Backend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Opens a screen capture handle.
    ///
    /// # Errors
    ///
    /// Returns a [`CaptureError`] if the display cannot be opened.
    fn capture(&self) -> Result<Box<dyn ScreenCapture>, CaptureError>;

    /// Opens an input handle.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] if the input device cannot be opened.
    fn input(&self) -> Result<Box<dyn InputInjector>, InputError>;
}

/// Click style for a phase or trigger action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickType {
    /// One left click.
    #[default]
    Single,
    /// Two left clicks.
    Double,
}

impl std::fmt::Display for ClickType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => f.write_str("single"),
            Self::Double => f.write_str("double"),
        }
    }
}

// ============================================================================
// Keys
// ============================================================================

/// A key the presser can tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Key {
    /// Space bar.
    Space,
    /// Enter / Return.
    Enter,
    /// Tab.
    Tab,
    /// Escape.
    Escape,
    /// Backspace.
    Backspace,
    /// Delete.
    Delete,
    /// Arrow up.
    Up,
    /// Arrow down.
    Down,
    /// Arrow left.
    Left,
    /// Arrow right.
    Right,
    /// Shift.
    Shift,
    /// Control.
    Control,
    /// Alt.
    Alt,
    /// A printable character.
    Char(char),
}

impl FromStr for Key {
    type Err = String;

    /// Named keys are matched case-insensitively; anything else maps to
    /// its first character.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let key = match lower.as_str() {
            "space" => Self::Space,
            "enter" | "return" => Self::Enter,
            "tab" => Self::Tab,
            "esc" | "escape" => Self::Escape,
            "backspace" => Self::Backspace,
            "delete" | "del" => Self::Delete,
            "up" => Self::Up,
            "down" => Self::Down,
            "left" => Self::Left,
            "right" => Self::Right,
            "shift" => Self::Shift,
            "ctrl" | "control" => Self::Control,
            "alt" => Self::Alt,
            _ => Self::Char(
                lower
                    .chars()
                    .next()
                    .ok_or_else(|| "key name cannot be empty".to_string())?,
            ),
        };
        Ok(key)
    }
}

impl TryFrom<String> for Key {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.to_string()
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Space => "space",
            Self::Enter => "enter",
            Self::Tab => "tab",
            Self::Escape => "esc",
            Self::Backspace => "backspace",
            Self::Delete => "delete",
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
            Self::Shift => "shift",
            Self::Control => "ctrl",
            Self::Alt => "alt",
            Self::Char(c) => return write!(f, "{c}"),
        };
        f.write_str(name)
    }
}
