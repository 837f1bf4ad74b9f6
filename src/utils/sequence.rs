use rand::Rng;
use rand::seq::IndexedRandom;
use rand_distr::{Distribution, Normal};

pub const PHRED_OFFSET: u8 = 33;
const MAX_PHRED: f32 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DNA {
    A,
    C,
    G,
    T,
}

impl DNA {
    /// Convert nucleotide to its byte representation.
    pub fn to_byte(&self) -> u8 {
        match self {
            DNA::A => b'A',
            DNA::C => b'C',
            DNA::G => b'G',
            DNA::T => b'T',
        }
    }

    /// Get all possible nucleotides as a static slice.
    pub fn all() -> &'static [DNA] {
        &[DNA::A, DNA::C, DNA::G, DNA::T]
    }

    /// Generate a random sequence of nucleotides of the given length.
    pub fn random_sequence<R: Rng>(rng: &mut R, length: usize) -> Vec<u8> {
        (0..length)
            .map(|_| {
                DNA::all()
                    .choose(rng)
                    .expect("DNA::all is never empty")
                    .to_byte()
            })
            .collect()
    }
}

/// Probability that a base call with the given phred score is wrong.
pub fn error_prob(phred: u8) -> f64 {
    10f64.powf(-(phred as f64) / 10.0)
}

/// Sum of per-base error probabilities over a phred+33 quality string.
pub fn expected_errors(qual: &[u8]) -> f64 {
    qual.iter()
        .map(|&q| error_prob(q.saturating_sub(PHRED_OFFSET)))
        .sum()
}

/// Reverse complement of a DNA sequence. Ambiguity codes map to `N`.
pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&b| match b.to_ascii_uppercase() {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            _ => b'N',
        })
        .collect()
}

/// True if the sequence contains any base outside A/C/G/T.
pub fn has_ambiguous(seq: &[u8]) -> bool {
    seq.iter()
        .any(|&b| !matches!(b.to_ascii_uppercase(), b'A' | b'C' | b'G' | b'T'))
}

/// Hamming distance between equal-length sequences; `usize::MAX` otherwise.
pub fn hamming(a: &[u8], b: &[u8]) -> usize {
    if a.len() != b.len() {
        return usize::MAX;
    }
    a.iter().zip(b.iter()).filter(|(x, y)| x != y).count()
}

fn phred33(score: u8) -> u8 {
    score + PHRED_OFFSET
}

fn normal_phred_qual<R: Rng>(rng: &mut R, mean: f32, stdev: f32) -> u8 {
    let normal = Normal::new(mean, stdev).expect("stdev must be finite and positive");
    let mut raw_phred = -1.0;

    while raw_phred < 0.0 || raw_phred > MAX_PHRED {
        raw_phred = normal.sample(rng);
    }

    phred33(raw_phred as u8)
}

/// Builds a phred+33 quality string with scores drawn from a clipped normal.
pub fn normal_phred_qual_string<R: Rng>(
    rng: &mut R,
    length: usize,
    mean: f32,
    stdev: f32,
) -> Vec<u8> {
    (0..length)
        .map(|_| normal_phred_qual(rng, mean, stdev))
        .collect()
}
