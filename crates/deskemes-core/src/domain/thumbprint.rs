//! Visual pairing thumbprint ("drunken bishop" random art).
//!
//! While a human approves a pairing, both the phone and the desktop render
//! a small picture derived from both devices' public IDs and public keys.
//! If the pictures match, nobody swapped a key in the middle.
//!
//! # How the drunken bishop walks (for beginners)
//!
//! A bishop starts in the centre of a 17 x 9 board.  Each byte of the
//! SHA-256 digest is split into four 2-bit moves, least-significant pair
//! first.  Bit 0 chooses left/right, bit 1 chooses up/down, so every move is
//! diagonal.  The bishop cannot leave the board: a move that would cross an
//! edge is clamped.  Every square counts how often the bishop landed on it,
//! and the counts become symbols: busier squares get "heavier" characters.

use sha2::{Digest, Sha256};

pub const WIDTH: usize = 17;
pub const HEIGHT: usize = 9;

/// Symbols for visit counts 0, 1, 2, ...; counts past the end use the last one.
const SYMBOLS: &[u8] = b" .o+=*BOX@%&#/^";

/// Visit-count grid of one pairing thumbprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbprint {
    counts: [[u8; WIDTH]; HEIGHT],
    end: (usize, usize),
}

impl Thumbprint {
    /// Computes the thumbprint of a pairing between two devices.
    ///
    /// Argument order matters and is the same on both sides: the *remote*
    /// values as seen from the device doing the rendering come first.
    pub fn compute(
        remote_public_id: &[u8],
        local_public_id: &[u8],
        remote_public_key: &[u8],
        local_public_key: &[u8],
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(remote_public_id);
        hasher.update(local_public_id);
        hasher.update(remote_public_key);
        hasher.update(local_public_key);
        Self::from_digest(&hasher.finalize())
    }

    /// Walks the bishop over an arbitrary digest.
    pub fn from_digest(digest: &[u8]) -> Self {
        let mut counts = [[0u8; WIDTH]; HEIGHT];
        let mut x = WIDTH / 2;
        let mut y = HEIGHT / 2;
        for &byte in digest {
            let mut val = byte;
            for _ in 0..4 {
                x = step(x, val & 0x01 != 0, WIDTH);
                y = step(y, val & 0x02 != 0, HEIGHT);
                counts[y][x] = counts[y][x].saturating_add(1);
                val >>= 2;
            }
        }
        Self {
            counts,
            end: (x, y),
        }
    }

    /// Number of times the bishop landed on `(x, y)`.
    pub fn visits(&self, x: usize, y: usize) -> u8 {
        self.counts[y][x]
    }

    /// Renders the grid as framed ASCII art; `S` marks the start, `E` the end.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity((WIDTH + 3) * (HEIGHT + 2));
        let border = format!("+{}+\n", "-".repeat(WIDTH));
        out.push_str(&border);
        for (y, row) in self.counts.iter().enumerate() {
            out.push('|');
            for (x, &count) in row.iter().enumerate() {
                let symbol = if (x, y) == self.end {
                    'E'
                } else if (x, y) == (WIDTH / 2, HEIGHT / 2) {
                    'S'
                } else {
                    SYMBOLS[usize::from(count).min(SYMBOLS.len() - 1)] as char
                };
                out.push(symbol);
            }
            out.push_str("|\n");
        }
        out.push_str(&border);
        out
    }
}

/// Moves one square towards `forward` (increasing) or back, clamped to `0..limit`.
fn step(pos: usize, forward: bool, limit: usize) -> usize {
    if forward {
        (pos + 1).min(limit - 1)
    } else {
        pos.saturating_sub(1)
    }
}
