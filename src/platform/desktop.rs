//! Real desktop backends: `xcap` for capture and `enigo` for input.

use enigo::{Button, Coordinate, Direction, Enigo, Keyboard, Mouse, Settings};
use tracing::debug;
use xcap::Monitor;

use super::{Backend, Frame, InputInjector, Key, ScreenCapture};
use crate::error::{CaptureError, InputError};
use crate::vision::region::{Point, Region};

/// Captures from the primary monitor (or the first one reported).
pub struct DesktopCapture {
    monitor: Monitor,
    origin: (i32, i32),
    size: (u32, u32),
}

impl std::fmt::Debug for DesktopCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesktopCapture")
            .field("origin", &self.origin)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

fn backend_err(e: impl std::fmt::Display) -> CaptureError {
    CaptureError::Backend(e.to_string())
}

impl DesktopCapture {
    /// Opens the primary monitor.
    ///
    /// # Errors
    ///
    /// Returns a [`CaptureError`] if no monitor can be enumerated.
    pub fn primary() -> Result<Self, CaptureError> {
        let monitors = Monitor::all().map_err(backend_err)?;
        let index = monitors
            .iter()
            .position(|m| m.is_primary().unwrap_or(false))
            .unwrap_or(0);
        let monitor = monitors
            .into_iter()
            .nth(index)
            .ok_or_else(|| CaptureError::Backend("no monitors found".to_string()))?;
        let origin = (
            monitor.x().map_err(backend_err)?,
            monitor.y().map_err(backend_err)?,
        );
        let size = (
            monitor.width().map_err(backend_err)?,
            monitor.height().map_err(backend_err)?,
        );
        debug!(?origin, ?size, "capture monitor opened");
        Ok(Self {
            monitor,
            origin,
            size,
        })
    }
}

/// Translates a screen region into monitor-relative coordinates, rejecting
/// regions that do not lie entirely on the monitor.
fn monitor_offset(
    region: &Region,
    origin: (i32, i32),
    size: (u32, u32),
) -> Result<(u32, u32), CaptureError> {
    let (Ok(x), Ok(y)) = (
        u32::try_from(region.x1() - origin.0),
        u32::try_from(region.y1() - origin.1),
    ) else {
        return Err(CaptureError::Backend(format!(
            "region {region} is outside the monitor"
        )));
    };
    let fits = x
        .checked_add(region.width())
        .is_some_and(|right| right <= size.0)
        && y.checked_add(region.height())
            .is_some_and(|bottom| bottom <= size.1);
    if !fits {
        return Err(CaptureError::Backend(format!(
            "region {region} exceeds monitor {}x{}",
            size.0, size.1
        )));
    }
    Ok((x, y))
}

impl ScreenCapture for DesktopCapture {
    fn grab(&mut self, region: &Region) -> Result<Frame, CaptureError> {
        let (x, y) = monitor_offset(region, self.origin, self.size)?;
        let pixels = self
            .monitor
            .capture_region(x, y, region.width(), region.height())
            .map_err(backend_err)?;
        Frame::new(*region, pixels)
    }
}

/// Mouse and keyboard through `enigo`.
pub struct DesktopInput {
    enigo: Enigo,
}

impl std::fmt::Debug for DesktopInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesktopInput").finish_non_exhaustive()
    }
}

impl DesktopInput {
    /// Connects to the input backend.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] if the backend cannot be opened.
    pub fn new() -> Result<Self, InputError> {
        let enigo =
            Enigo::new(&Settings::default()).map_err(|e| InputError(e.to_string()))?;
        Ok(Self { enigo })
    }
}

fn enigo_key(key: Key) -> enigo::Key {
    match key {
        Key::Space => enigo::Key::Space,
        Key::Enter => enigo::Key::Return,
        Key::Tab => enigo::Key::Tab,
        Key::Escape => enigo::Key::Escape,
        Key::Backspace => enigo::Key::Backspace,
        Key::Delete => enigo::Key::Delete,
        Key::Up => enigo::Key::UpArrow,
        Key::Down => enigo::Key::DownArrow,
        Key::Left => enigo::Key::LeftArrow,
        Key::Right => enigo::Key::RightArrow,
        Key::Shift => enigo::Key::Shift,
        Key::Control => enigo::Key::Control,
        Key::Alt => enigo::Key::Alt,
        Key::Char(c) => enigo::Key::Unicode(c),
    }
}

impl InputInjector for DesktopInput {
    fn move_to(&mut self, point: Point) -> Result<(), InputError> {
        debug!(x = point.x, y = point.y, "move pointer");
        self.enigo
            .move_mouse(point.x, point.y, Coordinate::Abs)
            .map_err(|e| InputError(e.to_string()))
    }

    fn click(&mut self) -> Result<(), InputError> {
        self.enigo
            .button(Button::Left, Direction::Click)
            .map_err(|e| InputError(e.to_string()))
    }

    fn double_click(&mut self) -> Result<(), InputError> {
        self.click()?;
        self.click()
    }

    fn tap_key(&mut self, key: Key) -> Result<(), InputError> {
        self.enigo
            .key(enigo_key(key), Direction::Click)
            .map_err(|e| InputError(e.to_string()))
    }
}

/// Opens a fresh monitor and input connection per engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DesktopBackend;

impl Backend for DesktopBackend {
    fn name(&self) -> &'static str {
        "desktop"
    }

    fn capture(&self) -> Result<Box<dyn ScreenCapture>, CaptureError> {
        Ok(Box::new(DesktopCapture::primary()?))
    }

    fn input(&self) -> Result<Box<dyn InputInjector>, InputError> {
        Ok(Box::new(DesktopInput::new()?))
    }
}
