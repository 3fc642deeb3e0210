//! In-memory platform: a virtual screen and a recording input injector.
//!
//! Used by `pixeljack run --stub` for dry runs and by tests, where the
//! screen contents are swapped between ticks.

use std::sync::{Arc, Mutex, MutexGuard};

use image::{Rgba, RgbaImage};
use tracing::{debug, info};

use super::{Backend, ClickType, Frame, InputInjector, Key, ScreenCapture};
use crate::error::{CaptureError, InputError};
use crate::vision::region::{Point, Region};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ============================================================================
// Virtual screen
// ============================================================================

#[derive(Debug)]
struct ScreenState {
    image: RgbaImage,
    pending_failures: u32,
    grabs: u64,
}

/// A shared, swappable screen image.
///
/// Clones share the same pixels, so a test can keep one handle and give
/// another to an engine.
#[derive(Debug, Clone)]
pub struct VirtualScreen {
    state: Arc<Mutex<ScreenState>>,
}

impl VirtualScreen {
    /// Creates a screen filled with one colour.
    #[must_use]
    pub fn solid(width: u32, height: u32, color: Rgba<u8>) -> Self {
        Self::from_image(RgbaImage::from_pixel(width, height, color))
    }

    /// Creates a screen showing `image`.
    #[must_use]
    pub fn from_image(image: RgbaImage) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScreenState {
                image,
                pending_failures: 0,
                grabs: 0,
            })),
        }
    }

    /// Replaces the whole screen.
    pub fn set(&self, image: RgbaImage) {
        lock(&self.state).image = image;
    }

    /// Mutates the screen in place.
    pub fn update(&self, f: impl FnOnce(&mut RgbaImage)) {
        f(&mut lock(&self.state).image);
    }

    /// Makes the next `count` grabs fail.
    pub fn fail_next(&self, count: u32) {
        lock(&self.state).pending_failures = count;
    }

    /// Number of successful grabs so far.
    #[must_use]
    pub fn grabs(&self) -> u64 {
        lock(&self.state).grabs
    }
}

impl ScreenCapture for VirtualScreen {
    fn grab(&mut self, region: &Region) -> Result<Frame, CaptureError> {
        let mut state = lock(&self.state);
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(CaptureError::Backend("injected capture failure".to_string()));
        }

        let (w, h) = state.image.dimensions();
        let (Ok(x), Ok(y)) = (u32::try_from(region.x1()), u32::try_from(region.y1())) else {
            return Err(CaptureError::Backend(format!(
                "region {region} starts off screen"
            )));
        };
        if x + region.width() > w || y + region.height() > h {
            return Err(CaptureError::Backend(format!(
                "region {region} exceeds screen {w}x{h}"
            )));
        }

        let pixels =
            image::imageops::crop_imm(&state.image, x, y, region.width(), region.height())
                .to_image();
        state.grabs += 1;
        drop(state);
        Frame::new(*region, pixels)
    }
}

// ============================================================================
// Recording input
// ============================================================================

/// One injected input action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    /// Pointer moved.
    MoveTo(Point),
    /// Single click.
    Click,
    /// Double click.
    DoubleClick,
    /// Key tapped.
    Key(Key),
}

#[derive(Debug, Default)]
struct InputLog {
    actions: Vec<InputAction>,
    pending_failures: u32,
}

/// Input injector that records actions instead of performing them.
#[derive(Debug, Clone, Default)]
pub struct RecordingInput {
    log: Arc<Mutex<InputLog>>,
    announce: bool,
}

impl RecordingInput {
    /// Creates a silent recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recorder that logs every action at `info` (dry-run mode).
    #[must_use]
    pub fn announcing() -> Self {
        Self {
            announce: true,
            ..Self::default()
        }
    }

    /// Makes the next `count` actions fail.
    pub fn fail_next(&self, count: u32) {
        lock(&self.log).pending_failures = count;
    }

    /// Snapshot of recorded actions.
    #[must_use]
    pub fn actions(&self) -> Vec<InputAction> {
        lock(&self.log).actions.clone()
    }

    /// Click positions paired with their click type.
    #[must_use]
    pub fn clicks(&self) -> Vec<(Point, ClickType)> {
        let log = lock(&self.log);
        let mut out = Vec::new();
        let mut at = None;
        for action in &log.actions {
            match action {
                InputAction::MoveTo(p) => at = Some(*p),
                InputAction::Click => out.extend(at.map(|p| (p, ClickType::Single))),
                InputAction::DoubleClick => out.extend(at.map(|p| (p, ClickType::Double))),
                InputAction::Key(_) => {}
            }
        }
        out
    }

    /// Keys tapped so far.
    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        lock(&self.log)
            .actions
            .iter()
            .filter_map(|a| match a {
                InputAction::Key(k) => Some(*k),
                _ => None,
            })
            .collect()
    }

    fn record(&self, action: InputAction) -> Result<(), InputError> {
        let mut log = lock(&self.log);
        if log.pending_failures > 0 {
            log.pending_failures -= 1;
            return Err(InputError(format!("injected failure for {action:?}")));
        }
        if self.announce {
            info!(?action, "dry-run input");
        } else {
            debug!(?action, "recorded input");
        }
        log.actions.push(action);
        Ok(())
    }
}

impl InputInjector for RecordingInput {
    fn move_to(&mut self, point: Point) -> Result<(), InputError> {
        self.record(InputAction::MoveTo(point))
    }

    fn click(&mut self) -> Result<(), InputError> {
        self.record(InputAction::Click)
    }

    fn double_click(&mut self) -> Result<(), InputError> {
        self.record(InputAction::DoubleClick)
    }

    fn tap_key(&mut self, key: Key) -> Result<(), InputError> {
        self.record(InputAction::Key(key))
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Backend handing out clones of one virtual screen and one recorder.
#[derive(Debug, Clone)]
pub struct StubBackend {
    screen: VirtualScreen,
    input: RecordingInput,
}

impl StubBackend {
    /// Creates a backend over `screen` and `input`.
    #[must_use]
    pub const fn new(screen: VirtualScreen, input: RecordingInput) -> Self {
        Self { screen, input }
    }

    /// Blank screen with an announcing recorder, for dry runs.
    #[must_use]
    pub fn dry_run(width: u32, height: u32) -> Self {
        Self::new(
            VirtualScreen::solid(width, height, Rgba([0, 0, 0, 255])),
            RecordingInput::announcing(),
        )
    }

    /// The shared screen.
    #[must_use]
    pub const fn screen(&self) -> &VirtualScreen {
        &self.screen
    }

    /// The shared recorder.
    #[must_use]
    pub const fn recorder(&self) -> &RecordingInput {
        &self.input
    }
}

impl Backend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn capture(&self) -> Result<Box<dyn ScreenCapture>, CaptureError> {
        Ok(Box::new(self.screen.clone()))
    }

    fn input(&self) -> Result<Box<dyn InputInjector>, InputError> {
        Ok(Box::new(self.input.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grab_crops_the_requested_region() {
        let mut screen = VirtualScreen::solid(50, 40, Rgba([10, 20, 30, 255]));
        screen.update(|img| img.put_pixel(12, 7, Rgba([255, 0, 0, 255])));
        let region = Region::new(10, 5, 20, 15).unwrap();
        let frame = screen.grab(&region).unwrap();
        assert_eq!(frame.rgba().dimensions(), (10, 10));
        assert_eq!(frame.rgba().get_pixel(2, 2), &Rgba([255, 0, 0, 255]));
        assert_eq!(screen.grabs(), 1);
    }

    #[test]
    fn grab_outside_screen_is_a_capture_error() {
        let mut screen = VirtualScreen::solid(50, 40, Rgba([0, 0, 0, 255]));
        let region = Region::new(40, 0, 60, 10).unwrap();
        assert!(screen.grab(&region).is_err());
        let negative = Region::new(-5, 0, 10, 10).unwrap();
        assert!(screen.grab(&negative).is_err());
    }

    #[test]
    fn injected_capture_failures_are_consumed() {
        let mut screen = VirtualScreen::solid(10, 10, Rgba([0, 0, 0, 255]));
        let region = Region::new(0, 0, 5, 5).unwrap();
        screen.fail_next(1);
        assert!(screen.grab(&region).is_err());
        assert!(screen.grab(&region).is_ok());
    }

    #[test]
    fn recording_input_pairs_moves_with_clicks() {
        let mut input = RecordingInput::new();
        input
            .click_at(Point { x: 3, y: 4 }, ClickType::Double)
            .unwrap();
        input.click_at(Point { x: 5, y: 6 }, ClickType::Single).unwrap();
        input.tap_key(Key::Space).unwrap();
        assert_eq!(
            input.clicks(),
            vec![
                (Point { x: 3, y: 4 }, ClickType::Double),
                (Point { x: 5, y: 6 }, ClickType::Single),
            ]
        );
        assert_eq!(input.keys(), vec![Key::Space]);
    }

    #[test]
    fn stub_backend_handles_share_state() {
        let backend = StubBackend::new(
            VirtualScreen::solid(10, 10, Rgba([0, 0, 0, 255])),
            RecordingInput::new(),
        );
        let mut capture = backend.capture().unwrap();
        let mut input = backend.input().unwrap();
        capture.grab(&Region::new(0, 0, 5, 5).unwrap()).unwrap();
        input.tap_key(Key::Tab).unwrap();
        assert_eq!(backend.screen().grabs(), 1);
        assert_eq!(backend.recorder().keys(), vec![Key::Tab]);
    }

    #[test]
    fn recording_input_failure_is_not_recorded() {
        let mut input = RecordingInput::new();
        input.fail_next(1);
        assert!(input.click().is_err());
        assert!(input.actions().is_empty());
    }
}
