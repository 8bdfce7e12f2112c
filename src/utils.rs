//! Utility modules for the LWE conventions, seeded sampling, and the
//! bit-level record format used by the packed database.

/// Constants and helpers tied to the ciphertext modulus `q = 2^32`.
pub mod lwe {
  pub const LOG_Q: usize = 32;
  pub const MODULUS: u64 = u32::MAX as u64 + 1;

  /// Number of columns in the secret challenge matrix; the statistical
  /// soundness parameter of both verification phases.
  pub const STAT_SEC_PARAM: usize = 40;

  /// Regev scaling factor `Delta = q / p`. The preprocessing instance has
  /// the same factor: `q·kappa / (p·kappa)`.
  pub fn delta(p: u64) -> u64 {
    MODULUS / p
  }

  /// Modular inverse by extended Euclid; `m` must be odd when `a` is a
  /// power of two, which is the only way this is called.
  pub fn mod_inverse(a: u64, m: u64) -> u64 {
    let (mut r0, mut r1) = (m as i128, (a % m) as i128);
    let (mut t0, mut t1) = (0i128, 1i128);
    while r1 != 0 {
      let q = r0 / r1;
      let r2 = r0 - q * r1;
      r0 = r1;
      r1 = r2;
      let t2 = t0 - q * t1;
      t0 = t1;
      t1 = t2;
    }
    assert!(r0 == 1, "moduli are not coprime");
    t0.rem_euclid(m as i128) as u64
  }

  /// Recombines residues `(lo mod 2^32, hi mod kappa)` into the unique
  /// value below `2^32 · kappa`. `q_inv` is `(2^32)^-1 mod kappa`.
  pub fn crt_combine(lo: u32, hi: u32, kappa: u64, q_inv: u64) -> u64 {
    let diff = (hi as u64 + kappa - lo as u64 % kappa) % kappa;
    let t = (diff as u128 * q_inv as u128 % kappa as u128) as u64;
    (lo as u128 + (MODULUS as u128) * t as u128) as u64
  }
}

/// Seeded and fresh randomness: uniform matrices, binary challenges, and
/// the discrete Gaussian error distribution.
pub mod sampling {
  use rand_chacha::ChaCha20Rng;
  use rand_core::{OsRng, RngCore, SeedableRng};

  use crate::matrix::{BinaryMatrix, Matrix, MultiLimbMatrix};

  /// Returns 32 bytes of fresh system entropy.
  pub fn generate_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    seed
  }

  /// Derives a domain-separated sub-seed; each public matrix is expanded
  /// from its own tag so the epoch seed can be shared.
  pub fn derive_sub_seed(seed: [u8; 32], tag: u8) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update([tag]);
    hasher.update(seed);
    hasher.finalize().into()
  }

  /// The deterministic expansion generator. ChaCha20 keyed by the seed,
  /// so the same seed yields the same byte stream on every platform.
  fn seeded_rng(seed: [u8; 32]) -> ChaCha20Rng {
    ChaCha20Rng::from_seed(seed)
  }

  fn uniform_below(rng: &mut impl RngCore, modulus: u64) -> u32 {
    if modulus == 0 {
      return rng.next_u32();
    }
    // rejection sampling: values at or above the largest multiple of the
    // modulus would bias the low residues
    let limit = (1u64 << 32) / modulus * modulus;
    loop {
      let v = rng.next_u32() as u64;
      if v < limit {
        return (v % modulus) as u32;
      }
    }
  }

  fn fill_matrix(rng: &mut impl RngCore, rows: usize, cols: usize, modulus: u64) -> Matrix {
    let data = (0..rows * cols).map(|_| uniform_below(rng, modulus)).collect();
    Matrix::from_data(rows, cols, data)
  }

  /// Uniform entries in `[0, modulus)`, or the full 32-bit range when
  /// `modulus` is zero. Fresh entropy.
  pub fn random_matrix(rows: usize, cols: usize, modulus: u64) -> Matrix {
    fill_matrix(&mut OsRng, rows, cols, modulus)
  }

  /// Deterministic, byte-exact expansion of a matrix from a 32-byte seed.
  pub fn expand_matrix(seed: [u8; 32], rows: usize, cols: usize, modulus: u64) -> Matrix {
    fill_matrix(&mut seeded_rng(seed), rows, cols, modulus)
  }

  /// Deterministic expansion of a multi-limb matrix: the `q` limb is drawn
  /// first, then the `kappa` limb, from one keystream.
  pub fn expand_matrix_ml(
    seed: [u8; 32],
    rows: usize,
    cols: usize,
    kappa: u64,
  ) -> MultiLimbMatrix {
    let mut rng = seeded_rng(seed);
    let q_data = fill_matrix(&mut rng, rows, cols, 0);
    let kappa_data = fill_matrix(&mut rng, rows, cols, kappa);
    MultiLimbMatrix { q_data, kappa_data }
  }

  fn fill_binary(rng: &mut impl RngCore, rows: usize, cols: usize) -> BinaryMatrix {
    let row_bytes = (cols + 7) / 8;
    let mut data = vec![0u8; rows * row_bytes];
    rng.fill_bytes(&mut data);
    BinaryMatrix::from_row_bytes(rows, cols, data)
  }

  /// Uniform binary matrix from fresh entropy; the client-secret
  /// challenge is drawn here.
  pub fn random_binary(rows: usize, cols: usize) -> BinaryMatrix {
    fill_binary(&mut OsRng, rows, cols)
  }

  /// Deterministic binary expansion; the server-side Fiat-Shamir
  /// challenge is drawn here.
  pub fn expand_binary(seed: [u8; 32], rows: usize, cols: usize) -> BinaryMatrix {
    fill_binary(&mut seeded_rng(seed), rows, cols)
  }

  /// Discrete Gaussian sampler over the integers, centered at zero, with
  /// support cut at `tau = ceil(6·sigma)`.
  ///
  /// Every rejection iteration draws the candidate and the acceptance
  /// word and performs the same table lookup, so the work done never
  /// depends on the magnitude that ends up accepted.
  pub struct GaussianSampler {
    tau: i64,
    accept: Vec<u64>,
  }

  impl GaussianSampler {
    pub fn new(sigma: f64) -> Self {
      let tau = (6.0 * sigma).ceil() as i64;
      let accept = (0..=tau)
        .map(|x| {
          let rho = (-((x * x) as f64) / (2.0 * sigma * sigma)).exp();
          (rho * (1u64 << 63) as f64) as u64
        })
        .collect();
      Self { tau, accept }
    }

    pub fn tau(&self) -> i64 {
      self.tau
    }

    fn sample(&self, rng: &mut impl RngCore) -> i64 {
      let width = (2 * self.tau + 1) as u64;
      loop {
        let x = uniform_below(rng, width) as i64 - self.tau;
        let r = rng.next_u64() >> 1;
        if r < self.accept[x.unsigned_abs() as usize] {
          return x;
        }
      }
    }

    /// Fresh error matrix reduced mod `q`.
    pub fn error_matrix(&self, rows: usize, cols: usize) -> Matrix {
      let data = (0..rows * cols)
        .map(|_| self.sample(&mut OsRng) as i32 as u32)
        .collect();
      Matrix::from_data(rows, cols, data)
    }

    /// Fresh error matrix as residues mod `q` and mod `kappa`; both limbs
    /// come from the same underlying integers.
    pub fn error_matrix_ml(&self, rows: usize, cols: usize, kappa: u64) -> MultiLimbMatrix {
      let mut q_data = Matrix::zeros(rows, cols);
      let mut kappa_data = Matrix::zeros(rows, cols);
      for r in 0..rows {
        for c in 0..cols {
          let e = self.sample(&mut OsRng);
          q_data.set(r, c, e as i32 as u32);
          kappa_data.set(r, c, e.rem_euclid(kappa as i64) as u32);
        }
      }
      MultiLimbMatrix { q_data, kappa_data }
    }
  }
}

/// Bit-level helpers for the record stream. Records are little-endian bit
/// strings; bit `0` of a byte is its least significant bit.
pub mod format {
  /// Reads `nbits` (at most 64) starting at absolute bit offset `start`.
  pub fn read_bits_le(bytes: &[u8], start: usize, nbits: usize) -> u64 {
    let mut out = 0u64;
    for i in 0..nbits {
      let idx = start + i;
      let bit = (bytes[idx / 8] >> (idx % 8)) & 1;
      out |= (bit as u64) << i;
    }
    out
  }

  /// Writes `nbits` (at most 64) of `value` starting at bit offset `start`.
  pub fn write_bits_le(bytes: &mut [u8], start: usize, nbits: usize, value: u64) {
    for i in 0..nbits {
      let idx = start + i;
      let mask = 1u8 << (idx % 8);
      if (value >> i) & 1 == 1 {
        bytes[idx / 8] |= mask;
      } else {
        bytes[idx / 8] &= !mask;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::lwe;
  use super::sampling::{self, GaussianSampler};
  use super::format;

  #[test]
  fn expansion_is_deterministic() {
    let seed = [7u8; 32];
    let a = sampling::expand_matrix(seed, 9, 5, 0);
    let b = sampling::expand_matrix(seed, 9, 5, 0);
    assert_eq!(a, b);
    let c = sampling::expand_matrix([8u8; 32], 9, 5, 0);
    assert_ne!(a, c);
    assert_eq!(
      sampling::expand_binary(seed, 4, 17),
      sampling::expand_binary(seed, 4, 17)
    );
    assert_eq!(
      sampling::expand_matrix_ml(seed, 3, 3, 101),
      sampling::expand_matrix_ml(seed, 3, 3, 101)
    );
  }

  #[test]
  fn bounded_expansion_respects_modulus() {
    let m = sampling::expand_matrix([3u8; 32], 16, 16, 1000);
    assert!(m.data().iter().all(|v| *v < 1000));
  }

  #[test]
  fn gaussian_samples_stay_in_tail_cut() {
    let sampler = GaussianSampler::new(6.4);
    let tau = sampler.tau() as i64;
    let m = sampler.error_matrix(8, 8);
    for v in m.data() {
      let centered = *v as i32 as i64;
      assert!(centered.abs() <= tau, "sample {} beyond tail cut", centered);
    }
    // consecutive draws must not repeat the error pattern
    assert_ne!(sampler.error_matrix(4, 4), sampler.error_matrix(4, 4));
  }

  #[test]
  fn gaussian_limbs_agree() {
    let kappa = 257u64;
    let sampler = GaussianSampler::new(6.4);
    let e = sampler.error_matrix_ml(6, 6, kappa);
    for r in 0..6 {
      for c in 0..6 {
        let signed = e.q_data.get(r, c) as i32 as i64;
        assert_eq!(
          e.kappa_data.get(r, c) as i64,
          signed.rem_euclid(kappa as i64)
        );
      }
    }
  }

  #[test]
  fn crt_combine_recovers_wide_values() {
    let kappa = 999u64;
    let q_inv = lwe::mod_inverse(lwe::MODULUS % kappa, kappa);
    for v in [0u64, 1, 12345, lwe::MODULUS - 1, lwe::MODULUS * 998 + 17] {
      let lo = (v % lwe::MODULUS) as u32;
      let hi = (v % kappa) as u32;
      assert_eq!(lwe::crt_combine(lo, hi, kappa, q_inv), v);
    }
  }

  #[test]
  fn bit_io_round_trips() {
    let mut buf = vec![0u8; 8];
    format::write_bits_le(&mut buf, 3, 11, 0b101_1100_1101);
    assert_eq!(format::read_bits_le(&buf, 3, 11), 0b101_1100_1101);
    format::write_bits_le(&mut buf, 3, 11, 0);
    assert_eq!(buf, vec![0u8; 8]);
  }
}
