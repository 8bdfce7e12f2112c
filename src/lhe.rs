//! Regev-style linearly homomorphic encryption over `Z_q`, plus the
//! enlarged multi-limb instance over `Z_{q·kappa}` used by the offline
//! preprocessing phase. One parameter bundle covers both: `kappa = 1`
//! marks the single-limb instance.

use serde::{Deserialize, Serialize};

use crate::errors::{PirError, PirResult};
use crate::matrix::{
  mat_add_in_place, mat_mul_scalar, mat_sub, matmul_vec, matmul_vec_mod,
  Matrix, MultiLimbMatrix,
};
use crate::utils::lwe;
use crate::utils::sampling::{self, GaussianSampler};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lhe {
  /// LWE secret dimension.
  pub n: usize,
  /// Plaintext modulus of the base scheme.
  pub p: u64,
  /// Auxiliary limb modulus; `1` for the online instance. Always odd
  /// otherwise, so residues mod `2^32` and mod `kappa` recombine.
  pub kappa: u64,
  /// Error standard deviation.
  pub sigma: f64,
}

impl Lhe {
  pub fn online(n: usize, p: u64, sigma: f64) -> Self {
    Self { n, p, kappa: 1, sigma }
  }

  pub fn preproc(n: usize, p: u64, kappa: u64, sigma: f64) -> Self {
    Self { n, p, kappa, sigma }
  }

  /// Scaling factor; identical for both instances since
  /// `q·kappa / (p·kappa) = q/p`.
  pub fn delta(&self) -> u64 {
    lwe::delta(self.p)
  }

  /// Message modulus: `p` online, `p·kappa` for preprocessing.
  pub fn plaintext_modulus(&self) -> u64 {
    self.p * self.kappa
  }

  /// Expands the public matrix (`rows x n`) from the published seed.
  pub fn gen_public_a(&self, seed: [u8; 32], rows: usize) -> Matrix {
    sampling::expand_matrix(seed, rows, self.n, 0)
  }

  /// Multi-limb public matrix for the preprocessing instance.
  pub fn gen_public_a_ml(&self, seed: [u8; 32], rows: usize) -> MultiLimbMatrix {
    sampling::expand_matrix_ml(seed, rows, self.n, self.kappa)
  }

  /// Uniform secret key, `n x 1`.
  pub fn sample_sk(&self) -> Matrix {
    sampling::random_matrix(self.n, 1, 0)
  }

  /// Uniform multi-limb secret key: independent uniform residues per limb
  /// are exactly a uniform element of `Z_{q·kappa}`.
  pub fn sample_sk_ml(&self) -> MultiLimbMatrix {
    MultiLimbMatrix {
      q_data: sampling::random_matrix(self.n, 1, 0),
      kappa_data: sampling::random_matrix(self.n, 1, self.kappa),
    }
  }

  /// `ct = A·sk + e + Delta·pt mod q`, fresh error per call.
  pub fn encrypt(&self, a: &Matrix, sk: &Matrix, pt: &Matrix) -> Matrix {
    self.encrypt_given_as(&matmul_vec(a, sk), pt)
  }

  /// Encryption against a cached `A·sk` product.
  pub fn encrypt_given_as(&self, a_sk: &Matrix, pt: &Matrix) -> Matrix {
    crate::matrix::shape_check(
      a_sk.rows == pt.rows && pt.cols == 1,
      "plaintext length must match A·sk",
    );
    let sampler = GaussianSampler::new(self.sigma);
    let mut ct = sampler.error_matrix(pt.rows, 1);
    mat_add_in_place(&mut ct, a_sk);
    let pt_scaled = mat_mul_scalar(pt, self.delta() as u32);
    mat_add_in_place(&mut ct, &pt_scaled);
    ct
  }

  /// `round((ct − H·sk)/Delta) mod p`. A rounded value equal to `p` is the
  /// wrap of a small negative error around zero and is clamped to `0`.
  pub fn decrypt(&self, h: &Matrix, sk: &Matrix, ct: &Matrix) -> PirResult<Matrix> {
    self.decrypt_given_hs(&matmul_vec(h, sk), ct)
  }

  /// Decryption against a cached `H·sk` product.
  pub fn decrypt_given_hs(&self, h_sk: &Matrix, ct: &Matrix) -> PirResult<Matrix> {
    crate::matrix::shape_check(
      h_sk.rows == ct.rows && ct.cols == 1,
      "ciphertext length must match H·sk",
    );
    let scaled = mat_sub(ct, h_sk);
    let mut pt = crate::matrix::mat_div_scalar(&scaled, self.delta() as u32);
    for i in 0..pt.rows {
      let v = pt.get(i, 0) as u64;
      if v == self.p {
        pt.set(i, 0, 0);
      } else if v > self.p {
        return Err(PirError::DecryptionOutOfRange);
      }
    }
    Ok(pt)
  }

  /// Multi-limb encryption: both limbs share the same integer error and
  /// plaintext, reduced into their respective residues.
  pub fn encrypt_ml(
    &self,
    a: &MultiLimbMatrix,
    sk: &MultiLimbMatrix,
    pt: &Matrix,
  ) -> MultiLimbMatrix {
    let a_sk = MultiLimbMatrix {
      q_data: matmul_vec(&a.q_data, &sk.q_data),
      kappa_data: matmul_vec_mod(&a.kappa_data, &sk.kappa_data, self.kappa),
    };
    self.encrypt_given_as_ml(&a_sk, pt)
  }

  pub fn encrypt_given_as_ml(&self, a_sk: &MultiLimbMatrix, pt: &Matrix) -> MultiLimbMatrix {
    crate::matrix::shape_check(
      a_sk.rows() == pt.rows && pt.cols == 1,
      "plaintext length must match A·sk",
    );
    let rows = pt.rows;
    let sampler = GaussianSampler::new(self.sigma);
    let e = sampler.error_matrix_ml(rows, 1, self.kappa);
    let delta = self.delta();
    let delta_kappa = delta % self.kappa;
    let mut out = MultiLimbMatrix::zeros(rows, 1);
    for i in 0..rows {
      let q_limb = a_sk
        .q_data
        .get(i, 0)
        .wrapping_add(e.q_data.get(i, 0))
        .wrapping_add((delta as u32).wrapping_mul(pt.get(i, 0)));
      out.q_data.set(i, 0, q_limb);
      let k_limb = (a_sk.kappa_data.get(i, 0) as u64
        + e.kappa_data.get(i, 0) as u64
        + delta_kappa * (pt.get(i, 0) as u64 % self.kappa))
        % self.kappa;
      out.kappa_data.set(i, 0, k_limb as u32);
    }
    out
  }

  /// Multi-limb decryption: subtract `H·sk` limb-wise, recombine by CRT,
  /// then scale down. Exact for messages below `p·kappa` within the error
  /// envelope.
  pub fn decrypt_ml(
    &self,
    h: &MultiLimbMatrix,
    sk: &MultiLimbMatrix,
    ct: &MultiLimbMatrix,
  ) -> PirResult<Matrix> {
    let h_sk = MultiLimbMatrix {
      q_data: matmul_vec(&h.q_data, &sk.q_data),
      kappa_data: matmul_vec_mod(&h.kappa_data, &sk.kappa_data, self.kappa),
    };
    self.decrypt_given_hs_ml(&h_sk, ct)
  }

  pub fn decrypt_given_hs_ml(
    &self,
    h_sk: &MultiLimbMatrix,
    ct: &MultiLimbMatrix,
  ) -> PirResult<Matrix> {
    crate::matrix::shape_check(
      h_sk.rows() == ct.rows() && ct.cols() == 1,
      "ciphertext length must match H·sk",
    );
    let rows = ct.rows();
    let delta = self.delta();
    let pt_mod = self.plaintext_modulus();
    let q_inv = lwe::mod_inverse(lwe::MODULUS % self.kappa, self.kappa);
    let mut pt = Matrix::zeros(rows, 1);
    for i in 0..rows {
      let lo = ct.q_data.get(i, 0).wrapping_sub(h_sk.q_data.get(i, 0));
      let hi = ((ct.kappa_data.get(i, 0) as u64 + self.kappa
        - h_sk.kappa_data.get(i, 0) as u64)
        % self.kappa) as u32;
      let v = lwe::crt_combine(lo, hi, self.kappa, q_inv);
      let rounded = (v + delta / 2) / delta;
      let msg = if rounded == pt_mod { 0 } else { rounded };
      if msg > pt_mod || msg > u32::MAX as u64 {
        return Err(PirError::DecryptionOutOfRange);
      }
      pt.set(i, 0, msg as u32);
    }
    Ok(pt)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::matrix::{matmul, matmul_mod, reduce_mod};

  #[test]
  fn online_round_trip() {
    let lhe = Lhe::online(32, 256, 6.4);
    let m = 64;
    let a = lhe.gen_public_a([1u8; 32], m);
    let sk = lhe.sample_sk();
    let pt = sampling::random_matrix(m, 1, lhe.p);
    let ct = lhe.encrypt(&a, &sk, &pt);
    // decrypting against H = A cancels the mask exactly
    let got = lhe.decrypt(&a, &sk, &ct).unwrap();
    assert_eq!(got, pt);
  }

  #[test]
  fn preproc_round_trip_uses_full_message_space() {
    let kappa = 257u64;
    let lhe = Lhe::preproc(32, 256, kappa, 6.4);
    let rows = 48;
    let a = lhe.gen_public_a_ml([2u8; 32], rows);
    let sk = lhe.sample_sk_ml();
    // messages beyond p exercise the kappa limb
    let pt = sampling::random_matrix(rows, 1, lhe.plaintext_modulus() / 2);
    let ct = lhe.encrypt_ml(&a, &sk, &pt);
    let got = lhe.decrypt_ml(&a, &sk, &ct).unwrap();
    assert_eq!(got, pt);
  }

  #[test]
  fn negative_error_wraps_to_zero() {
    let lhe = Lhe::online(16, 256, 6.4);
    // a zero plaintext whose ciphertext sits just below the modulus
    let h_sk = Matrix::zeros(4, 1);
    let ct = Matrix::from_data(4, 1, vec![u32::MAX, u32::MAX - 7, 0, 3]);
    let got = lhe.decrypt_given_hs(&h_sk, &ct).unwrap();
    assert_eq!(got, Matrix::zeros(4, 1));
  }

  #[test]
  fn hint_identity_moves_server_work_offline() {
    // (D·A)·sk = D·(A·sk) mod q: the identity that lets the client cache
    // H·sk instead of receiving A·sk from the server
    let d = sampling::random_matrix(24, 40, 256);
    let a = sampling::random_matrix(40, 16, 0);
    let sk = sampling::random_matrix(16, 1, 0);
    let h = matmul(&d, &a);
    assert_eq!(matmul_vec(&h, &sk), matmul_vec(&d, &matmul_vec(&a, &sk)));
  }

  #[test]
  fn multi_limb_hint_identity() {
    let kappa = 101u64;
    let d = sampling::random_matrix(20, 30, 16);
    let a = sampling::expand_matrix_ml([5u8; 32], 30, 8, kappa);
    let sk_k = sampling::random_matrix(8, 1, kappa);
    let h_k = matmul_mod(&reduce_mod(&d, kappa), &a.kappa_data, kappa);
    assert_eq!(
      matmul_vec_mod(&h_k, &sk_k, kappa),
      matmul_vec_mod(
        &reduce_mod(&d, kappa),
        &matmul_vec_mod(&a.kappa_data, &sk_k, kappa),
        kappa
      )
    );
  }
}
