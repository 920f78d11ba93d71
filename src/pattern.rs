use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use thiserror::Error;

pub const DEFAULT_MIXED_RUN: usize = 1024;

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("entropy source failed: {0}")]
    Entropy(String),
    #[error("pattern worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Fills buffers with one byte pattern.
///
/// A single instance is shared by every worker of a run, so implementations
/// with a cursor keep it behind a lock.
pub trait PatternGenerator: Send + Sync {
    fn generate(&self, buf: &mut [u8]) -> Result<(), GenerateError>;

    fn name(&self) -> &'static str;
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pattern {
    Random,
    Sequential,
    Zero,
    Mixed,
}

impl Pattern {
    pub const ALL: [Pattern; 4] = [
        Pattern::Random,
        Pattern::Sequential,
        Pattern::Zero,
        Pattern::Mixed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::Random => "random",
            Pattern::Sequential => "sequential",
            Pattern::Zero => "zero",
            Pattern::Mixed => "mixed",
        }
    }

    /// `mixed_run` is only used by [`Pattern::Mixed`].
    pub fn build(&self, mixed_run: usize) -> Arc<dyn PatternGenerator> {
        match self {
            Pattern::Random => Arc::new(RandomPattern),
            Pattern::Sequential => Arc::new(SequentialPattern::default()),
            Pattern::Zero => Arc::new(ZeroPattern),
            Pattern::Mixed => Arc::new(MixedPattern::new(mixed_run)),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown pattern '{0}' (available: random, sequential, zero, mixed)")]
pub struct UnknownPattern(String);

impl FromStr for Pattern {
    type Err = UnknownPattern;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pattern::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPattern(s.to_owned()))
    }
}

fn seeded_rng() -> Result<StdRng, GenerateError> {
    StdRng::try_from_os_rng().map_err(|e| GenerateError::Entropy(e.to_string()))
}

/// Cryptographically strong random bytes. Each call seeds a fresh ChaCha
/// stream from the OS, so failures only come from the entropy source.
#[derive(Debug, Default)]
pub struct RandomPattern;

impl PatternGenerator for RandomPattern {
    fn generate(&self, buf: &mut [u8]) -> Result<(), GenerateError> {
        seeded_rng()?.fill_bytes(buf);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// `(cursor + i) mod 256`, continuing the cursor across calls.
///
/// With several workers the cursor is claimed per call in whatever order the
/// workers get to it, so the file is one continuous counter only when chunks
/// are generated in dispatch order (e.g. a single worker).
#[derive(Debug, Default)]
pub struct SequentialPattern {
    cursor: Mutex<u8>,
}

impl SequentialPattern {
    pub fn with_cursor(start: u8) -> Self {
        Self {
            cursor: Mutex::new(start),
        }
    }
}

impl PatternGenerator for SequentialPattern {
    fn generate(&self, buf: &mut [u8]) -> Result<(), GenerateError> {
        let start = {
            let mut cursor = self.cursor.lock();
            let start = *cursor;
            *cursor = start.wrapping_add((buf.len() % 256) as u8);
            start
        };

        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = start.wrapping_add(i as u8);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

#[derive(Debug, Default)]
pub struct ZeroPattern;

impl PatternGenerator for ZeroPattern {
    fn generate(&self, buf: &mut [u8]) -> Result<(), GenerateError> {
        buf.fill(0);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "zero"
    }
}

#[derive(Debug)]
struct MixedPhase {
    random: bool,
    pos_in_run: usize,
}

/// Alternating runs of random and zero bytes, `run_len` bytes each, starting
/// with a random run. The phase carries over between calls.
#[derive(Debug)]
pub struct MixedPattern {
    run_len: usize,
    phase: Mutex<MixedPhase>,
}

impl MixedPattern {
    pub fn new(run_len: usize) -> Self {
        let run_len = if run_len == 0 {
            DEFAULT_MIXED_RUN
        } else {
            run_len
        };
        Self {
            run_len,
            phase: Mutex::new(MixedPhase {
                random: true,
                pos_in_run: 0,
            }),
        }
    }
}

impl PatternGenerator for MixedPattern {
    fn generate(&self, buf: &mut [u8]) -> Result<(), GenerateError> {
        let mut rng = seeded_rng()?;
        let mut phase = self.phase.lock();

        let mut offset = 0;
        while offset < buf.len() {
            let take = (self.run_len - phase.pos_in_run).min(buf.len() - offset);
            let run = &mut buf[offset..offset + take];
            if phase.random {
                rng.fill_bytes(run);
            } else {
                run.fill(0);
            }

            offset += take;
            phase.pos_in_run += take;
            if phase.pos_in_run >= self.run_len {
                phase.random = !phase.random;
                phase.pos_in_run = 0;
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mixed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fills_every_length() {
        for len in [0, 1, 7, 4096, 65_537] {
            let mut buf = vec![0xAA; len];
            ZeroPattern.generate(&mut buf).unwrap();
            assert!(buf.iter().all(|b| *b == 0), "len {len}");
        }
    }

    #[test]
    fn sequential_wraps_and_continues() {
        let gen = SequentialPattern::with_cursor(254);
        let mut buf = [0u8; 5];
        gen.generate(&mut buf).unwrap();
        assert_eq!(buf, [254, 255, 0, 1, 2]);

        let mut next = [0u8; 3];
        gen.generate(&mut next).unwrap();
        assert_eq!(next, [3, 4, 5]);
    }

    #[test]
    fn sequential_cursor_survives_large_buffers() {
        let gen = SequentialPattern::default();
        let mut big = vec![0u8; 1000];
        gen.generate(&mut big).unwrap();
        assert_eq!(big[999], (999 % 256) as u8);

        let mut next = [0u8; 1];
        gen.generate(&mut next).unwrap();
        assert_eq!(next[0], (1000 % 256) as u8);
    }

    #[test]
    fn mixed_alternates_runs() {
        let gen = MixedPattern::new(10);
        let mut buf = [0u8; 30];
        gen.generate(&mut buf).unwrap();

        assert!(buf[0..10].iter().any(|b| *b != 0));
        assert!(buf[10..20].iter().all(|b| *b == 0));
        assert!(buf[20..30].iter().any(|b| *b != 0));
    }

    #[test]
    fn mixed_phase_carries_across_calls() {
        let gen = MixedPattern::new(10);
        let mut first = [0u8; 15];
        gen.generate(&mut first).unwrap();
        assert!(first[10..15].iter().all(|b| *b == 0));

        let mut second = [0xFFu8; 15];
        gen.generate(&mut second).unwrap();
        assert!(second[0..5].iter().all(|b| *b == 0));
        assert!(second[5..15].iter().any(|b| *b != 0));
    }

    #[test]
    fn random_fills_buffer() {
        let mut buf = vec![0u8; 256];
        RandomPattern.generate(&mut buf).unwrap();
        assert!(buf.iter().any(|b| *b != 0));
    }

    #[test]
    fn pattern_names_round_trip() {
        for p in Pattern::ALL {
            assert_eq!(p.as_str().parse::<Pattern>().unwrap(), p);
            assert_eq!(p.build(DEFAULT_MIXED_RUN).name(), p.as_str());
        }
        assert!("noise".parse::<Pattern>().is_err());
    }
}
