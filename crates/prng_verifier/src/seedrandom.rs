//! ARC4-keyed deterministic double generator, compatible with the
//! keystream the upstream derives its trajectories from: the seed string
//! is smeared into a 256-byte key, the first 256 keystream bytes are
//! discarded (RC4-drop[256]), and each draw expands 48 keystream bits to
//! a uniform double with full 53-bit significance.

const WIDTH: usize = 256;
const MASK: usize = 255;
/// Bytes consumed per base draw (48 bits).
const CHUNKS: usize = 6;
const START_DENOM: f64 = 281_474_976_710_656.0; // 256^6
const SIGNIFICANCE: f64 = 4_503_599_627_370_496.0; // 2^52
const OVERFLOW: f64 = 9_007_199_254_740_992.0; // 2^53

pub struct SeedRandom {
    i: usize,
    j: usize,
    s: [u8; WIDTH],
}

impl SeedRandom {
    pub fn new(seed: &str) -> Self {
        let key = mix_key(seed);
        let mut s = [0u8; WIDTH];
        for (i, slot) in s.iter_mut().enumerate() {
            *slot = i as u8;
        }
        let mut j = 0usize;
        for i in 0..WIDTH {
            let t = s[i];
            j = (j + key[i % key.len()] as usize + t as usize) & MASK;
            s[i] = s[j];
            s[j] = t;
        }

        let mut rng = Self { i: 0, j: 0, s };
        // RC4-drop[256]: discard the first keystream batch.
        rng.g(WIDTH);
        rng
    }

    /// Draws `count` keystream bytes folded big-endian into one
    /// integer. The output byte is `s[j]` read before the swap, exactly
    /// as in the upstream generator.
    fn g(&mut self, count: usize) -> u64 {
        let mut r: u64 = 0;
        for _ in 0..count {
            self.i = (self.i + 1) & MASK;
            let t = self.s[self.i];
            self.j = (self.j + t as usize) & MASK;
            r = r.wrapping_mul(WIDTH as u64).wrapping_add(self.s[self.j] as u64);
            self.s[self.i] = self.s[self.j];
            self.s[self.j] = t;
        }
        r
    }

    /// Next uniform double in `[0, 1)` with 53 significant bits.
    pub fn next_f64(&mut self) -> f64 {
        let mut n = self.g(CHUNKS) as f64;
        let mut d = START_DENOM;
        let mut x: u64 = 0;
        while n < SIGNIFICANCE {
            n = (n + x as f64) * WIDTH as f64;
            d *= WIDTH as f64;
            x = self.g(1);
        }
        while n >= OVERFLOW {
            n /= 2.0;
            d /= 2.0;
            x >>= 1;
        }
        (n + x as f64) / d
    }
}

/// Smears the seed string into the ARC4 key the way the upstream's
/// generator does: xor-multiply accumulation over UTF-16 code units,
/// byte slots indexed modulo 256.
fn mix_key(seed: &str) -> Vec<u8> {
    let mut key: Vec<u8> = Vec::new();
    let mut smear: u32 = 0;
    for (j, unit) in seed.encode_utf16().enumerate() {
        let idx = j & MASK;
        if idx >= key.len() {
            key.push(0);
        }
        smear ^= (key[idx] as u32).wrapping_mul(19);
        key[idx] = (smear.wrapping_add(unit as u32) & 255) as u8;
    }
    if key.is_empty() {
        key.push(0);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_output_vectors() {
        // First five doubles of the reference generator for these
        // seeds; any drift in mixkey, the KSA, the drop[256], or g()
        // shows up here immediately.
        let cases: [(&str, [f64; 5]); 2] = [
            (
                "abc-123",
                [
                    0.4690069936862356,
                    0.5291322952500437,
                    0.051193955674221206,
                    0.3156213723659714,
                    0.6168147036989672,
                ],
            ),
            (
                "seed-G1-game-G1",
                [
                    0.17186346087499152,
                    0.9081222409987894,
                    0.1251584353306651,
                    0.3430140825536851,
                    0.2982048255078487,
                ],
            ),
        ];
        for (seed, expected) in cases {
            let mut rng = SeedRandom::new(seed);
            for (k, want) in expected.iter().enumerate() {
                let got = rng.next_f64();
                assert_eq!(got, *want, "seed {seed} draw {k}");
            }
        }
    }

    #[test]
    fn same_seed_same_stream() {
        let mut a = SeedRandom::new("abc-123");
        let mut b = SeedRandom::new("abc-123");
        for _ in 0..64 {
            assert_eq!(a.next_f64(), b.next_f64());
        }
    }

    #[test]
    fn different_seeds_differ() {
        let mut a = SeedRandom::new("abc-123");
        let mut b = SeedRandom::new("abc-124");
        let va: Vec<f64> = (0..8).map(|_| a.next_f64()).collect();
        let vb: Vec<f64> = (0..8).map(|_| b.next_f64()).collect();
        assert_ne!(va, vb);
    }

    #[test]
    fn draws_stay_in_unit_interval() {
        let mut rng = SeedRandom::new("range-check");
        for _ in 0..10_000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v), "draw out of range: {v}");
        }
    }

    #[test]
    fn draws_are_not_degenerate() {
        let mut rng = SeedRandom::new("spread-check");
        let draws: Vec<f64> = (0..1_000).map(|_| rng.next_f64()).collect();
        let below: usize = draws.iter().filter(|v| **v < 0.5).count();
        // A uniform stream should not collapse onto one half.
        assert!(below > 300 && below < 700, "skewed stream: {below}/1000");
    }

    #[test]
    fn empty_seed_is_valid() {
        let mut rng = SeedRandom::new("");
        let v = rng.next_f64();
        assert!((0.0..1.0).contains(&v));
    }
}
