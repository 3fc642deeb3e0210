//! Shared integration-test harness: synthetic screens, fixture files and
//! helpers for running the `pixeljack` binary.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use image::{GrayImage, Luma, Rgba, RgbaImage};
use pixeljack::observability::Event;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Virtual time allowed for an expected event to show up.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(600);

// ============================================================================
// Process helpers
// ============================================================================

/// Runs `pixeljack` with `args` to completion.
#[allow(clippy::missing_panics_doc)]
pub fn spawn_command(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pixeljack"))
        .args(args)
        .env_remove("PIXELJACK_CONFIG")
        .env_remove("PIXELJACK_EVENTS_FILE")
        .output()
        .expect("failed to run pixeljack")
}

/// Stdout of a finished process as a string.
pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Stderr of a finished process as a string.
pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

// ============================================================================
// Fixture directory
// ============================================================================

/// Temporary directory holding configs and template images.
pub struct Fixture {
    dir: TempDir,
}

impl Fixture {
    /// Creates an empty fixture directory.
    #[allow(clippy::missing_panics_doc)]
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create temp dir"),
        }
    }

    /// Root of the directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes a text file and returns its path.
    #[allow(clippy::missing_panics_doc)]
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).expect("failed to write fixture");
        path
    }

    /// Saves `image` as a PNG and returns its path.
    #[allow(clippy::missing_panics_doc)]
    pub fn write_png(&self, name: &str, image: &GrayImage) -> PathBuf {
        let path = self.dir.path().join(name);
        image.save(&path).expect("failed to save png");
        path
    }
}

// ============================================================================
// Synthetic images
// ============================================================================

/// A high-contrast pseudo-random pattern. Different seeds give patterns
/// that do not match each other.
pub fn glyph(seed: u32, width: u32, height: u32) -> GrayImage {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    GrayImage::from_fn(width, height, |_, _| {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        Luma([if (state >> 16) & 1 == 0 { 0 } else { 255 }])
    })
}

/// A smooth mid-grey gradient that matches no glyph.
#[allow(clippy::missing_panics_doc)]
pub fn background(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        let v = u8::try_from((x * 7 + y * 3) % 60 + 100).expect("fits in u8");
        Rgba([v, v, v, 255])
    })
}

/// Copies `glyph` onto `screen` with its top-left corner at `(x, y)`.
pub fn paste(screen: &mut RgbaImage, glyph: &GrayImage, x: u32, y: u32) {
    for (gx, gy, p) in glyph.enumerate_pixels() {
        screen.put_pixel(x + gx, y + gy, Rgba([p[0], p[0], p[0], 255]));
    }
}

/// Fills a `width` x `height` block of pure red at `(x, y)`.
pub fn red_block(screen: &mut RgbaImage, x: u32, y: u32, width: u32, height: u32) {
    for yy in y..y + height {
        for xx in x..x + width {
            screen.put_pixel(xx, yy, Rgba([255, 0, 0, 255]));
        }
    }
}

// ============================================================================
// Event helpers
// ============================================================================

/// Waits for the first event accepted by `pred`, collecting everything
/// received on the way (the accepted event last).
///
/// # Panics
///
/// Panics if no such event arrives within [`EVENT_TIMEOUT`] or the bus is
/// closed.
pub async fn collect_until<F>(rx: &mut broadcast::Receiver<Event>, mut pred: F) -> Vec<Event>
where
    F: FnMut(&Event) -> bool,
{
    let mut seen = Vec::new();
    let found = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = pred(&event);
                    seen.push(event);
                    if done {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    panic!("event receiver lagged by {n}");
                }
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await;
    let names: Vec<_> = seen.iter().map(Event::name).collect();
    assert!(found.is_ok(), "expected event never arrived; saw {names:?}");
    seen
}

/// Waits for the first event accepted by `pred` and returns it.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<Event>, pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    collect_until(rx, pred)
        .await
        .pop()
        .expect("collect_until returns the accepted event")
}

/// Names of `events` in order.
pub fn names(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(Event::name).collect()
}
