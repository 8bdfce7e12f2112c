//! Matrix types and modular arithmetic for the LWE layer.
//!
//! All single-limb arithmetic is over `Z_q` with `q = 2^32`, using the
//! natural wraparound of `u32`. Multi-limb values live in `Z_{q·kappa}` and
//! are carried as independent residues mod `q` and mod `kappa`; `kappa` is
//! always odd so the residues recombine uniquely.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Dimension mismatches are programmer errors and abort immediately.
pub fn shape_check(cond: bool, what: &str) {
  if !cond {
    panic!("InvalidShape: {}", what);
  }
}

/// A rectangular array of `u32` entries in row-major order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matrix {
  pub rows: usize,
  pub cols: usize,
  data: Vec<u32>,
}

impl Matrix {
  pub fn zeros(rows: usize, cols: usize) -> Self {
    Self {
      rows,
      cols,
      data: vec![0u32; rows * cols],
    }
  }

  pub fn from_data(rows: usize, cols: usize, data: Vec<u32>) -> Self {
    shape_check(data.len() == rows * cols, "matrix data length");
    Self { rows, cols, data }
  }

  pub fn data(&self) -> &[u32] {
    &self.data
  }

  pub fn row(&self, r: usize) -> &[u32] {
    &self.data[r * self.cols..(r + 1) * self.cols]
  }

  pub fn get(&self, r: usize, c: usize) -> u32 {
    self.data[r * self.cols + c]
  }

  pub fn set(&mut self, r: usize, c: usize, v: u32) {
    self.data[r * self.cols + c] = v;
  }

  /// Wire encoding: 8-byte little-endian `rows` and `cols`, then the
  /// entries as little-endian `u32` in row-major order.
  pub fn to_wire_bytes(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + 4 * self.data.len());
    out.extend_from_slice(&(self.rows as u64).to_le_bytes());
    out.extend_from_slice(&(self.cols as u64).to_le_bytes());
    for v in &self.data {
      out.extend_from_slice(&v.to_le_bytes());
    }
    out
  }
}

/// An element of `Z_{q·kappa}` split into its residues mod `q` and mod
/// `kappa`. Products are evaluated limb-wise; the limbs only meet again at
/// decryption, where they are recombined by CRT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiLimbMatrix {
  pub q_data: Matrix,
  pub kappa_data: Matrix,
}

impl MultiLimbMatrix {
  pub fn zeros(rows: usize, cols: usize) -> Self {
    Self {
      q_data: Matrix::zeros(rows, cols),
      kappa_data: Matrix::zeros(rows, cols),
    }
  }

  pub fn rows(&self) -> usize {
    self.q_data.rows
  }

  pub fn cols(&self) -> usize {
    self.q_data.cols
  }

  /// Wire encoding: the two limb matrices back-to-back.
  pub fn to_wire_bytes(&self) -> Vec<u8> {
    let mut out = self.q_data.to_wire_bytes();
    out.extend_from_slice(&self.kappa_data.to_wire_bytes());
    out
  }
}

/// A `{0,1}` matrix stored bit-packed, row-major, each row padded to a
/// whole number of bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryMatrix {
  pub rows: usize,
  pub cols: usize,
  row_bytes: usize,
  data: Vec<u8>,
}

impl BinaryMatrix {
  pub fn zeros(rows: usize, cols: usize) -> Self {
    let row_bytes = (cols + 7) / 8;
    Self {
      rows,
      cols,
      row_bytes,
      data: vec![0u8; rows * row_bytes],
    }
  }

  /// Builds from raw row-padded bytes; trailing bits of each row must be
  /// zero (enforced by masking).
  pub fn from_row_bytes(rows: usize, cols: usize, mut data: Vec<u8>) -> Self {
    let row_bytes = (cols + 7) / 8;
    shape_check(data.len() == rows * row_bytes, "binary matrix data length");
    if cols % 8 != 0 {
      let mask = (1u8 << (cols % 8)) - 1;
      for r in 0..rows {
        data[r * row_bytes + row_bytes - 1] &= mask;
      }
    }
    Self {
      rows,
      cols,
      row_bytes,
      data,
    }
  }

  pub fn bit(&self, r: usize, c: usize) -> u32 {
    ((self.data[r * self.row_bytes + c / 8] >> (c % 8)) & 1) as u32
  }

  pub fn set_bit(&mut self, r: usize, c: usize, v: u32) {
    let byte = &mut self.data[r * self.row_bytes + c / 8];
    let mask = 1u8 << (c % 8);
    if v & 1 == 1 {
      *byte |= mask;
    } else {
      *byte &= !mask;
    }
  }

  /// Row `r` as a column vector over `Z_q`.
  pub fn row_as_column(&self, r: usize) -> Matrix {
    let data = (0..self.cols).map(|c| self.bit(r, c)).collect();
    Matrix::from_data(self.cols, 1, data)
  }

  /// Wire encoding: 8-byte little-endian `rows` and `cols` header, then
  /// the bit-packed body.
  pub fn to_wire_bytes(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + self.data.len());
    out.extend_from_slice(&(self.rows as u64).to_le_bytes());
    out.extend_from_slice(&(self.cols as u64).to_le_bytes());
    out.extend_from_slice(&self.data);
    out
  }
}

/// A plaintext matrix over `Z_p` with several coefficients packed into each
/// 32-bit cell. Logical shape is `rows x cols`; storage is
/// `packed_rows x cols` where each cell holds `coeffs_per_cell` vertically
/// adjacent coefficients of one column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedMatrix {
  pub rows: usize,
  pub cols: usize,
  pub log_p: usize,
  coeffs_per_cell: usize,
  packed_rows: usize,
  data: Vec<u32>,
}

impl PackedMatrix {
  pub fn zeros(rows: usize, cols: usize, log_p: usize) -> Self {
    shape_check(log_p >= 1 && log_p <= 32, "plaintext bits per coefficient");
    let coeffs_per_cell = 32 / log_p;
    let packed_rows = (rows + coeffs_per_cell - 1) / coeffs_per_cell;
    Self {
      rows,
      cols,
      log_p,
      coeffs_per_cell,
      packed_rows,
      data: vec![0u32; packed_rows * cols],
    }
  }

  pub fn coeffs_per_cell(&self) -> usize {
    self.coeffs_per_cell
  }

  pub fn get(&self, r: usize, c: usize) -> u32 {
    let cell = self.data[(r / self.coeffs_per_cell) * self.cols + c];
    let shift = (r % self.coeffs_per_cell) * self.log_p;
    let mask = mask_u32(self.log_p);
    (cell >> shift) & mask
  }

  pub fn set(&mut self, r: usize, c: usize, v: u32) {
    let idx = (r / self.coeffs_per_cell) * self.cols + c;
    let shift = (r % self.coeffs_per_cell) * self.log_p;
    let mask = mask_u32(self.log_p);
    self.data[idx] = (self.data[idx] & !(mask << shift)) | ((v & mask) << shift);
  }
}

fn mask_u32(bits: usize) -> u32 {
  if bits >= 32 {
    u32::MAX
  } else {
    (1u32 << bits) - 1
  }
}

/// `A · B mod q`, i-k-j loop order so the inner loop streams over rows of
/// `B`. Output rows are independent and computed in parallel.
pub fn matmul(a: &Matrix, b: &Matrix) -> Matrix {
  shape_check(a.cols == b.rows, "matmul inner dimensions");
  let mut out = Matrix::zeros(a.rows, b.cols);
  let b_cols = b.cols;
  out
    .data
    .par_chunks_mut(b_cols)
    .enumerate()
    .for_each(|(i, out_row)| {
      let a_row = a.row(i);
      for k in 0..a.cols {
        let aik = a_row[k];
        let b_row = b.row(k);
        for j in 0..b_cols {
          out_row[j] = out_row[j].wrapping_add(aik.wrapping_mul(b_row[j]));
        }
      }
    });
  out
}

/// `A · x mod q` for a column vector `x`.
pub fn matmul_vec(a: &Matrix, x: &Matrix) -> Matrix {
  shape_check(x.cols == 1, "matmul_vec expects a column vector");
  shape_check(a.cols == x.rows, "matmul_vec inner dimensions");
  let xs = x.data();
  let data = (0..a.rows)
    .map(|i| {
      let mut acc = 0u32;
      for (av, xv) in a.row(i).iter().zip(xs) {
        acc = acc.wrapping_add(av.wrapping_mul(*xv));
      }
      acc
    })
    .collect();
  Matrix::from_data(a.rows, 1, data)
}

/// `A · B mod modulus` for an odd auxiliary modulus below `2^32`.
pub fn matmul_mod(a: &Matrix, b: &Matrix, modulus: u64) -> Matrix {
  shape_check(a.cols == b.rows, "matmul_mod inner dimensions");
  let mut out = Matrix::zeros(a.rows, b.cols);
  let b_cols = b.cols;
  out
    .data
    .par_chunks_mut(b_cols)
    .enumerate()
    .for_each(|(i, out_row)| {
      let a_row = a.row(i);
      for k in 0..a.cols {
        let aik = a_row[k] as u64;
        let b_row = b.row(k);
        for j in 0..b_cols {
          let acc = out_row[j] as u64 + aik * b_row[j] as u64;
          out_row[j] = (acc % modulus) as u32;
        }
      }
    });
  out
}

/// `A^T · B mod q` without materializing the transpose: one streaming pass
/// over the rows of `A` and `B`.
pub fn matmul_transposed(a: &Matrix, b: &Matrix) -> Matrix {
  shape_check(a.rows == b.rows, "matmul_transposed outer dimensions");
  let mut out = Matrix::zeros(a.cols, b.cols);
  for k in 0..a.rows {
    let a_row = a.row(k);
    let b_row = b.row(k);
    for i in 0..a.cols {
      let aki = a_row[i];
      let out_row = &mut out.data[i * b.cols..(i + 1) * b.cols];
      for j in 0..b.cols {
        out_row[j] = out_row[j].wrapping_add(aki.wrapping_mul(b_row[j]));
      }
    }
  }
  out
}

/// `A^T · x mod q` for a column vector `x`; used by the online verifier
/// where `A` is the tall recovered proof matrix.
pub fn matmul_vec_transposed(a: &Matrix, x: &Matrix) -> Matrix {
  shape_check(x.cols == 1, "matmul_vec_transposed expects a column vector");
  shape_check(a.rows == x.rows, "matmul_vec_transposed outer dimensions");
  let mut acc = vec![0u32; a.cols];
  for (k, xv) in x.data().iter().enumerate() {
    for (a_entry, slot) in a.row(k).iter().zip(acc.iter_mut()) {
      *slot = slot.wrapping_add(a_entry.wrapping_mul(*xv));
    }
  }
  Matrix::from_data(a.cols, 1, acc)
}

/// `C · B mod q` for a bit-packed left operand; bits act as branchless
/// `{0,1}` multipliers.
pub fn matmul_binary(c: &BinaryMatrix, b: &Matrix) -> Matrix {
  shape_check(c.cols == b.rows, "matmul_binary inner dimensions");
  let mut out = Matrix::zeros(c.rows, b.cols);
  for i in 0..c.rows {
    let out_row = &mut out.data[i * b.cols..(i + 1) * b.cols];
    for k in 0..c.cols {
      let bit = c.bit(i, k);
      let b_row = b.row(k);
      for j in 0..b.cols {
        out_row[j] = out_row[j].wrapping_add(bit.wrapping_mul(b_row[j]));
      }
    }
  }
  out
}

/// `C · B mod modulus` for a bit-packed left operand.
pub fn matmul_binary_mod(c: &BinaryMatrix, b: &Matrix, modulus: u64) -> Matrix {
  shape_check(c.cols == b.rows, "matmul_binary_mod inner dimensions");
  let mut out = Matrix::zeros(c.rows, b.cols);
  for i in 0..c.rows {
    let out_row = &mut out.data[i * b.cols..(i + 1) * b.cols];
    for k in 0..c.cols {
      let bit = c.bit(i, k) as u64;
      let b_row = b.row(k);
      for j in 0..b.cols {
        out_row[j] = ((out_row[j] as u64 + bit * b_row[j] as u64) % modulus) as u32;
      }
    }
  }
  out
}

/// Limb-wise `A · B` where `A` carries small exact integers (below both
/// moduli's combined range) and `B` is multi-limb.
pub fn matmul_ml(a: &Matrix, b: &MultiLimbMatrix, kappa: u64) -> MultiLimbMatrix {
  MultiLimbMatrix {
    q_data: matmul(a, &b.q_data),
    kappa_data: matmul_mod(&reduce_mod(a, kappa), &b.kappa_data, kappa),
  }
}

/// Limb-wise `A · x` for a multi-limb column vector `x`.
pub fn matmul_vec_ml(a: &Matrix, x: &MultiLimbMatrix, kappa: u64) -> MultiLimbMatrix {
  MultiLimbMatrix {
    q_data: matmul_vec(a, &x.q_data),
    kappa_data: matmul_vec_mod(&reduce_mod(a, kappa), &x.kappa_data, kappa),
  }
}

/// Limb-wise `C · B` for a binary left operand.
pub fn matmul_binary_ml(
  c: &BinaryMatrix,
  b: &MultiLimbMatrix,
  kappa: u64,
) -> MultiLimbMatrix {
  MultiLimbMatrix {
    q_data: matmul_binary(c, &b.q_data),
    kappa_data: matmul_binary_mod(c, &b.kappa_data, kappa),
  }
}

/// `A · x mod modulus` for a column vector `x`.
pub fn matmul_vec_mod(a: &Matrix, x: &Matrix, modulus: u64) -> Matrix {
  shape_check(x.cols == 1, "matmul_vec_mod expects a column vector");
  shape_check(a.cols == x.rows, "matmul_vec_mod inner dimensions");
  let xs = x.data();
  let data = (0..a.rows)
    .map(|i| {
      let mut acc = 0u64;
      for (av, xv) in a.row(i).iter().zip(xs) {
        acc = (acc + *av as u64 * *xv as u64) % modulus;
      }
      acc as u32
    })
    .collect();
  Matrix::from_data(a.rows, 1, data)
}

/// Entry-wise reduction mod an auxiliary modulus.
pub fn reduce_mod(a: &Matrix, modulus: u64) -> Matrix {
  let data = a.data().iter().map(|v| (*v as u64 % modulus) as u32).collect();
  Matrix::from_data(a.rows, a.cols, data)
}

/// `D · B mod q` where `D` is a packed plaintext matrix; coefficients are
/// unpacked on the fly. The hot path of both the hint generation and the
/// online answer.
pub fn matmul_packed(d: &PackedMatrix, b: &Matrix) -> Matrix {
  shape_check(d.cols == b.rows, "matmul_packed inner dimensions");
  let z = d.coeffs_per_cell;
  let log_p = d.log_p;
  let mask = mask_u32(log_p);
  let b_cols = b.cols;
  let mut out = Matrix::zeros(d.rows, b_cols);
  // each chunk is the band of output rows fed by one packed row
  out
    .data
    .par_chunks_mut(z * b_cols)
    .enumerate()
    .for_each(|(pr, band)| {
      let cells = &d.data[pr * d.cols..(pr + 1) * d.cols];
      let band_rows = band.len() / b_cols;
      for (k, cell) in cells.iter().enumerate() {
        let b_row = b.row(k);
        let mut c = *cell;
        for t in 0..band_rows {
          let coeff = c & mask;
          c >>= log_p;
          let out_row = &mut band[t * b_cols..(t + 1) * b_cols];
          for j in 0..b_cols {
            out_row[j] = out_row[j].wrapping_add(coeff.wrapping_mul(b_row[j]));
          }
        }
      }
    });
  out
}

pub fn mat_add_in_place(a: &mut Matrix, b: &Matrix) {
  shape_check(a.rows == b.rows && a.cols == b.cols, "mat_add_in_place shape");
  for (av, bv) in a.data.iter_mut().zip(b.data.iter()) {
    *av = av.wrapping_add(*bv);
  }
}

pub fn mat_sub(a: &Matrix, b: &Matrix) -> Matrix {
  shape_check(a.rows == b.rows && a.cols == b.cols, "mat_sub shape");
  let data = a
    .data
    .iter()
    .zip(b.data.iter())
    .map(|(av, bv)| av.wrapping_sub(*bv))
    .collect();
  Matrix::from_data(a.rows, a.cols, data)
}

pub fn mat_mul_scalar(a: &Matrix, s: u32) -> Matrix {
  let data = a.data.iter().map(|v| v.wrapping_mul(s)).collect();
  Matrix::from_data(a.rows, a.cols, data)
}

/// Entry-wise division rounding to the nearest integer.
pub fn mat_div_scalar(a: &Matrix, s: u32) -> Matrix {
  let half = (s / 2) as u64;
  let data = a
    .data
    .iter()
    .map(|v| ((*v as u64 + half) / s as u64) as u32)
    .collect();
  Matrix::from_data(a.rows, a.cols, data)
}
