//! Random low-level input bursts
//!
//! A burst mixes rotations, key presses, taps and swipes. Coordinates stay
//! inside the bounds of the current screen.

use ape_common::Rect;
use ape_model::FuzzEvent;
use rand::Rng;

const DPAD_KEYS: [u32; 5] = [19, 20, 21, 22, 23];
const SYSTEM_KEYS: [u32; 3] = [4, 82, 84];

/// Screen assumed when no snapshot has been seen yet
pub const DEFAULT_SCREEN: Rect = Rect {
    left: 0,
    top: 0,
    right: 1080,
    bottom: 1920,
};

fn point<R: Rng + ?Sized>(rng: &mut R, bounds: &Rect) -> (i32, i32) {
    let x = if bounds.right > bounds.left {
        rng.gen_range(bounds.left..bounds.right)
    } else {
        bounds.left
    };
    let y = if bounds.bottom > bounds.top {
        rng.gen_range(bounds.top..bounds.bottom)
    } else {
        bounds.top
    };
    (x, y)
}

/// Generate between 5 and 15 event groups within `bounds`
pub fn generate_events<R: Rng + ?Sized>(rng: &mut R, bounds: Rect) -> Vec<FuzzEvent> {
    let mut events = Vec::new();
    for _ in 0..rng.gen_range(5..=15) {
        match rng.gen_range(0..20) {
            0 => {
                events.push(FuzzEvent::Rotate { degrees: 90 });
                events.push(FuzzEvent::Rotate { degrees: 0 });
            }
            1..=5 => {
                for _ in 0..5 {
                    let code = DPAD_KEYS[rng.gen_range(0..DPAD_KEYS.len())];
                    events.push(FuzzEvent::Key { code });
                }
            }
            6..=8 => {
                let code = SYSTEM_KEYS[rng.gen_range(0..SYSTEM_KEYS.len())];
                events.push(FuzzEvent::Key { code });
            }
            9..=13 => {
                let from = point(rng, &bounds);
                let to = point(rng, &bounds);
                events.push(FuzzEvent::Swipe { from, to });
            }
            _ => {
                let (x, y) = point(rng, &bounds);
                events.push(FuzzEvent::Tap { x, y });
            }
        }
    }
    events
}
