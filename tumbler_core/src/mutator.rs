use rand::Rng;

/// Length of inputs generated from scratch when the size is fixed and no seed exists.
pub const DEFAULT_INPUT_LEN: usize = 64;
/// Upper bound on the length of generated or grown inputs.
pub const MAX_INPUT_LEN: usize = 4096;

/// A `Mutator` derives a new input from an existing one.
///
/// # Type Parameters
/// * `R`: The type of random number generator used for mutation decisions.
pub trait Mutator<R: Rng + ?Sized> {
    fn mutate(&mut self, input: &[u8], rng: &mut R) -> Vec<u8>;
}

/// Adds a small random value (1-15) to one randomly chosen byte.
///
/// An empty input becomes a single zero byte before mutation.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlipSingleByteMutator;

impl<R: Rng + ?Sized> Mutator<R> for FlipSingleByteMutator {
    fn mutate(&mut self, input: &[u8], rng: &mut R) -> Vec<u8> {
        let mut bytes = input.to_vec();
        if bytes.is_empty() {
            bytes.push(0);
        }
        let random_add_value = rng.random_range(1u8..=15u8);
        let index = rng.random_range(0..bytes.len());
        bytes[index] = bytes[index].wrapping_add(random_add_value);
        bytes
    }
}

/// Stacks a random number of byte-level mutations.
///
/// With `fixed_size` set only length-preserving mutations are used, so the output is
/// exactly as long as the input.
#[derive(Debug, Clone)]
pub struct HavocMutator {
    fixed_size: bool,
    max_stack: u32,
    max_len: usize,
}

impl HavocMutator {
    pub fn new(fixed_size: bool) -> Self {
        Self {
            fixed_size,
            max_stack: 8,
            max_len: MAX_INPUT_LEN,
        }
    }

    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size
    }
}

impl<R: Rng + ?Sized> Mutator<R> for HavocMutator {
    fn mutate(&mut self, input: &[u8], rng: &mut R) -> Vec<u8> {
        let mut bytes = input.to_vec();
        if bytes.is_empty() {
            if self.fixed_size {
                return bytes;
            }
            bytes.push(rng.random());
        }

        let rounds = rng.random_range(1..=self.max_stack);
        // Length-changing operations are only drawn when the size may change.
        let ops = if self.fixed_size { 3 } else { 6 };
        for _ in 0..rounds {
            match rng.random_range(0..ops) {
                0 => bytes = FlipSingleByteMutator.mutate(&bytes, rng),
                1 => {
                    let index = rng.random_range(0..bytes.len());
                    bytes[index] ^= 1u8 << rng.random_range(0..8u32);
                }
                2 => {
                    let index = rng.random_range(0..bytes.len());
                    bytes[index] = rng.random();
                }
                3 if bytes.len() < self.max_len => {
                    let index = rng.random_range(0..=bytes.len());
                    bytes.insert(index, rng.random());
                }
                4 if bytes.len() > 1 => {
                    let index = rng.random_range(0..bytes.len());
                    bytes.remove(index);
                }
                5 if bytes.len() < self.max_len => {
                    let start = rng.random_range(0..bytes.len());
                    let len = rng.random_range(1..=(bytes.len() - start).min(16));
                    let chunk = bytes[start..start + len].to_vec();
                    let at = rng.random_range(0..=bytes.len());
                    bytes.splice(at..at, chunk);
                    bytes.truncate(self.max_len);
                }
                _ => {}
            }
        }
        bytes
    }
}

/// Generates a fresh input of exactly `len` random bytes.
pub fn generate_input<R: Rng + ?Sized>(rng: &mut R, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes[..]);
    bytes
}
