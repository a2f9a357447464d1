//! Time-ordered identifiers shared by artifacts, sidecars and events.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use chrono::Utc;
use rand::RngCore;

pub const OBJECT_ID_HEX_LEN: usize = 24;

static COUNTER: OnceLock<AtomicU32> = OnceLock::new();
static PROCESS_UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();

/// Returns a fresh 24-hex-character id: 4 bytes of big-endian Unix seconds,
/// 5 random bytes fixed per process, and a 3-byte rolling counter.
///
/// Ids sort lexicographically in creation order (to one-second resolution,
/// then by counter within a process).
pub fn object_id() -> String {
    let seconds = Utc::now().timestamp().clamp(0, i64::from(u32::MAX)) as u32;
    let unique = PROCESS_UNIQUE.get_or_init(|| {
        let mut bytes = [0u8; 5];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    });
    let counter = COUNTER
        .get_or_init(|| AtomicU32::new(rand::thread_rng().next_u32() & 0x00ff_ffff))
        .fetch_add(1, Ordering::Relaxed)
        & 0x00ff_ffff;

    let mut raw = [0u8; 12];
    raw[..4].copy_from_slice(&seconds.to_be_bytes());
    raw[4..9].copy_from_slice(unique);
    raw[9..].copy_from_slice(&counter.to_be_bytes()[1..]);
    hex::encode(raw)
}
