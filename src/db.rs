//! Database packing and parameter derivation.
//!
//! The database is an `N·d`-bit stream packed into an `ell x m` matrix of
//! `log2(p)`-bit coefficients, laid out column-major so that every record
//! lives inside a single column. The server keeps two views: the packed
//! matrix `D` for the online phase and the plain transpose `D_T` (mod `p`)
//! for preprocessing.

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{PirError, PirResult};
use crate::matrix::{Matrix, PackedMatrix};
use crate::utils::format;
use crate::utils::lwe;

/// A recovered record; records are at most 64 bits wide.
pub type Entry = u64;

/// Derived database and LWE geometry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbParams {
  pub n_records: u64,
  pub d_bits: usize,
  /// Rows of the plaintext matrix; the online download length.
  pub ell: usize,
  /// Columns of the plaintext matrix; the online upload length.
  pub m: usize,
  /// Plaintext modulus, a power of two.
  pub p: u64,
  pub log_p: usize,
  /// LWE secret dimension.
  pub n: usize,
  /// Error standard deviation.
  pub sigma: f64,
  /// Auxiliary limb modulus for preprocessing; `1` when disabled. Odd
  /// otherwise, and at least `ell`, so `D_T·c` fits below `p·kappa`.
  pub kappa: u64,
  /// Columns of the secret challenge matrix.
  pub stat_sec: usize,
}

/// Flags steering the parameter search.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamFlags {
  pub allow_trivial: bool,
  pub verbose: bool,
  pub simple_pir: bool,
  pub preproc: bool,
  pub honest_hint: bool,
}

impl DbParams {
  /// Searches the largest plaintext modulus whose worst-case accumulated
  /// error still decrypts correctly, then shapes the matrix to minimize
  /// `ell + m` under the capacity constraint with `m >= n`.
  pub fn derive(
    n_records: u64,
    d_bits: usize,
    n: usize,
    sigma: f64,
    stat_sec: usize,
    flags: &ParamFlags,
  ) -> PirResult<Self> {
    if d_bits == 0 || d_bits > 64 {
      return Err(PirError::ParameterInfeasible(format!(
        "record width {} outside supported range",
        d_bits
      )));
    }
    let tau = (6.0 * sigma).ceil() as u64;
    for log_p in (1..=16).rev() {
      let p = 1u64 << log_p;
      let (ell, m) = match shape(n_records, d_bits, log_p, n) {
        Some(s) => s,
        None => continue,
      };
      let dim = ell.max(m) as u64;
      // worst-case accumulated error in a decrypted entry; under the
      // honest-hint assumption the average-case tail bound suffices
      let err_bound: u128 = if flags.honest_hint {
        (8.0 * sigma * (dim as f64).sqrt()).ceil() as u128 * (p - 1) as u128
      } else {
        dim as u128 * (p - 1) as u128 * tau as u128
      };
      if 2 * err_bound >= (lwe::MODULUS / p) as u128 {
        if flags.verbose {
          debug!(log_p, ell, m, "error bound exceeds Delta/2, shrinking p");
        }
        continue;
      }
      let kappa = if flags.preproc {
        // offline proof entries are exact integers below p·m
        if p.checked_mul(m as u64).map_or(true, |v| v >= lwe::MODULUS) {
          continue;
        }
        let k = preproc_kappa(ell, m);
        // kappa·q must fit 64-bit intermediates, and p·kappa must stay
        // a representable coefficient
        if k >= 1u64 << 31 || p * k >= lwe::MODULUS {
          continue;
        }
        k
      } else {
        // without preprocessing, the per-query proof of the verifiable
        // variant carries exact entries below p·ell; plain SimplePIR
        // sends no proof and needs no such bound
        if !flags.simple_pir
          && p.checked_mul(ell as u64).map_or(true, |v| v >= lwe::MODULUS)
        {
          continue;
        }
        1
      };
      let hint_bits = ell as u64 * n as u64 * lwe::LOG_Q as u64;
      if !flags.allow_trivial && hint_bits > n_records * d_bits as u64 {
        if flags.verbose {
          debug!(log_p, hint_bits, "hint exceeds database size, shrinking p");
        }
        continue;
      }
      let params = Self {
        n_records,
        d_bits,
        ell,
        m,
        p,
        log_p,
        n,
        sigma,
        kappa,
        stat_sec,
      };
      if flags.verbose {
        debug!(?params, "derived database parameters");
      }
      return Ok(params);
    }
    Err(PirError::ParameterInfeasible(format!(
      "no plaintext modulus satisfies correctness for N=2^{:.1}, d={}",
      (n_records as f64).log2(),
      d_bits
    )))
  }

  /// Number of coefficients a record occupies (`1` when several records
  /// share one coefficient).
  pub fn coeffs_per_record(&self) -> usize {
    if self.d_bits <= self.log_p {
      1
    } else {
      (self.d_bits + self.log_p - 1) / self.log_p
    }
  }

  /// Number of records sharing one coefficient cell.
  pub fn records_per_coeff(&self) -> usize {
    if self.d_bits <= self.log_p {
      self.log_p / self.d_bits
    } else {
      1
    }
  }

  /// Records held by one column of the matrix.
  pub fn records_per_column(&self) -> usize {
    let w = self.coeffs_per_record();
    if w == 1 {
      self.ell * self.records_per_coeff()
    } else {
      self.ell / w
    }
  }

  /// Deterministic coordinate of record `i`: first matrix row, column,
  /// and the bit offset inside the row's coefficient.
  pub fn row_for_index(&self, i: u64) -> (usize, usize, usize) {
    let rpc = self.records_per_column() as u64;
    let col = (i / rpc) as usize;
    let slot = (i % rpc) as usize;
    let w = self.coeffs_per_record();
    if w == 1 {
      let r = self.records_per_coeff();
      (slot / r, col, (slot % r) * self.d_bits)
    } else {
      (slot * w, col, 0)
    }
  }
}

fn preproc_kappa(ell: usize, m: usize) -> u64 {
  let ratio = (ell as f64 / m as f64).sqrt().ceil() as u64;
  let k = ell as u64 * ratio.max(1);
  // keep kappa coprime to q = 2^32
  if k % 2 == 0 {
    k + 1
  } else {
    k
  }
}

/// Minimizes `ell + m` subject to `ell·m` coefficients covering the bit
/// stream and `m >= n`. The unconstrained optimum is the balanced square;
/// when that falls below `n` the sum is increasing in `m`, so `m = n` is
/// optimal.
fn shape(n_records: u64, d_bits: usize, log_p: usize, n: usize) -> Option<(usize, usize)> {
  if d_bits <= log_p {
    let r = (log_p / d_bits) as u64;
    let coeffs = (n_records + r - 1) / r;
    let m = (n as u64).max((coeffs as f64).sqrt().ceil() as u64);
    let ell = ((coeffs + m - 1) / m).max(1);
    Some((ell as usize, m as usize))
  } else {
    let w = ((d_bits + log_p - 1) / log_p) as u64;
    let coeffs = n_records.checked_mul(w)?;
    let m = (n as u64).max((coeffs as f64).sqrt().ceil() as u64);
    // whole records per column: ell is a multiple of w
    let rpc = (n_records + m - 1) / m;
    let ell = rpc * w;
    Some((ell as usize, m as usize))
  }
}

/// The server-owned record stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawDatabase {
  n_records: u64,
  d_bits: usize,
  bits: Vec<u8>,
}

impl RawDatabase {
  /// Wraps an existing little-endian bit stream of `N·d` bits.
  pub fn from_bits(bits: Vec<u8>, n_records: u64, d_bits: usize) -> PirResult<Self> {
    let need = ((n_records * d_bits as u64 + 7) / 8) as usize;
    if bits.len() < need {
      return Err(PirError::ParameterInfeasible(format!(
        "bit stream holds {} bytes, need {}",
        bits.len(),
        need
      )));
    }
    Ok(Self {
      n_records,
      d_bits,
      bits,
    })
  }

  /// Uniformly random records; the benchmarking path.
  pub fn random(n_records: u64, d_bits: usize) -> Self {
    let len = ((n_records * d_bits as u64 + 7) / 8) as usize;
    let mut bits = vec![0u8; len];
    OsRng.fill_bytes(&mut bits);
    Self {
      n_records,
      d_bits,
      bits,
    }
  }

  pub fn n_records(&self) -> u64 {
    self.n_records
  }

  pub fn d_bits(&self) -> usize {
    self.d_bits
  }

  /// Record `i` as its `d`-bit little-endian value.
  pub fn record(&self, i: u64) -> Entry {
    format::read_bits_le(&self.bits, (i * self.d_bits as u64) as usize, self.d_bits)
  }

  /// Packs the stream into the `ell x m` coefficient grid, several
  /// coefficients per 32-bit cell.
  pub fn pack(&self, params: &DbParams) -> PackedMatrix {
    let mut out = PackedMatrix::zeros(params.ell, params.m, params.log_p);
    self.for_each_coeff(params, |row, col, v| out.set(row, col, v));
    out
  }

  /// The plain transpose `D_T : m x ell` over `Z_p`, the server's view
  /// during preprocessing.
  pub fn transpose_plain(&self, params: &DbParams) -> Matrix {
    let mut out = Matrix::zeros(params.m, params.ell);
    self.for_each_coeff(params, |row, col, v| out.set(col, row, v));
    out
  }

  fn for_each_coeff<F: FnMut(usize, usize, u32)>(&self, params: &DbParams, mut f: F) {
    let w = params.coeffs_per_record();
    if w == 1 {
      // records sharing a coefficient are merged before the cell is
      // emitted; cells never straddle columns
      let r = params.records_per_coeff() as u64;
      let mut i = 0u64;
      while i < self.n_records {
        let (row, col, _) = params.row_for_index(i);
        let in_cell = r.min(self.n_records - i);
        let mut cell = 0u64;
        for s in 0..in_cell {
          cell |= self.record(i + s) << (s as usize * params.d_bits);
        }
        f(row, col, cell as u32);
        i += in_cell;
      }
    } else {
      for i in 0..self.n_records {
        let (row, col, _) = params.row_for_index(i);
        let rec = self.record(i);
        for t in 0..w {
          let chunk = (rec >> (t * params.log_p)) & ((1u64 << params.log_p) - 1);
          f(row + t, col, chunk as u32);
        }
      }
    }
  }
}

/// Reads record `i` back out of a decrypted column of the plaintext
/// matrix; the inverse of the packing layout.
pub fn extract_record(column: &Matrix, params: &DbParams, i: u64) -> Entry {
  let (row, _col, off) = params.row_for_index(i);
  let w = params.coeffs_per_record();
  if w == 1 {
    let cell = column.get(row, 0) as u64;
    (cell >> off) & mask(params.d_bits)
  } else {
    let mut rec = 0u64;
    for t in 0..w {
      let chunk = column.get(row + t, 0) as u64 & mask(params.log_p);
      rec |= chunk << (t * params.log_p);
    }
    rec & mask(params.d_bits)
  }
}

fn mask(bits: usize) -> u64 {
  if bits >= 64 {
    u64::MAX
  } else {
    (1u64 << bits) - 1
  }
}
