//! Public entry point: construction, the online query protocol, and the
//! per-query client session.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::{extract_record, DbParams, Entry, ParamFlags};
use crate::errors::{PirError, PirResult};
use crate::lhe::Lhe;
use crate::matrix::{
  matmul_binary, matmul_packed, matmul_vec, matmul_vec_transposed, shape_check,
  BinaryMatrix, Matrix, PackedMatrix,
};
use crate::utils::lwe::STAT_SEC_PARAM;
use crate::utils::sampling;

/// Default LWE secret dimension.
pub const DEFAULT_LWE_DIM: usize = 1408;
/// Default error standard deviation.
pub const DEFAULT_SIGMA: f64 = 6.4;

/// Constructor inputs. The seed is the per-epoch public randomness from
/// which both public matrices are expanded; it is configuration, not
/// state, and is threaded through explicitly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PirConfig {
  pub n_records: u64,
  pub d_bits: usize,
  pub allow_trivial: bool,
  pub verbose: bool,
  pub simple_pir: bool,
  /// Reserved; must be `false`.
  pub random_data: bool,
  /// Reserved; must be `1`.
  pub batch_size: usize,
  pub preproc: bool,
  pub honest_hint: bool,
  pub lwe_dim: usize,
  pub sigma: f64,
  pub stat_sec: usize,
  pub seed: [u8; 32],
}

impl PirConfig {
  pub fn new(n_records: u64, d_bits: usize) -> Self {
    Self {
      n_records,
      d_bits,
      allow_trivial: false,
      verbose: false,
      simple_pir: false,
      random_data: false,
      batch_size: 1,
      preproc: true,
      honest_hint: false,
      lwe_dim: DEFAULT_LWE_DIM,
      sigma: DEFAULT_SIGMA,
      stat_sec: STAT_SEC_PARAM,
      seed: sampling::generate_seed(),
    }
  }
}

/// Builds a PIR instance from the flag list of the reference surface.
#[allow(clippy::too_many_arguments)]
pub fn new_pir(
  n_records: u64,
  d_bits: usize,
  allow_trivial: bool,
  verbose: bool,
  simple_pir: bool,
  random_data: bool,
  batch_size: usize,
  preproc: bool,
  honest_hint: bool,
) -> PirResult<VeriSimplePir> {
  let mut cfg = PirConfig::new(n_records, d_bits);
  cfg.allow_trivial = allow_trivial;
  cfg.verbose = verbose;
  cfg.simple_pir = simple_pir;
  cfg.random_data = random_data;
  cfg.batch_size = batch_size;
  cfg.preproc = preproc;
  cfg.honest_hint = honest_hint;
  VeriSimplePir::new(cfg)
}

/// A PIR instance: derived parameters plus the two LHE instances. Holds
/// no per-client or per-query state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VeriSimplePir {
  pub db_params: DbParams,
  lhe: Lhe,
  preproc_lhe: Option<Lhe>,
  seed: [u8; 32],
}

impl VeriSimplePir {
  pub fn new(cfg: PirConfig) -> PirResult<Self> {
    if cfg.random_data {
      return Err(PirError::ParameterInfeasible(
        "random_data is reserved and must be false".into(),
      ));
    }
    if cfg.batch_size != 1 {
      return Err(PirError::ParameterInfeasible(
        "batch_size is reserved and must be 1".into(),
      ));
    }
    if cfg.simple_pir && cfg.preproc {
      return Err(PirError::ParameterInfeasible(
        "simple_pir and preproc are mutually exclusive".into(),
      ));
    }
    let flags = ParamFlags {
      allow_trivial: cfg.allow_trivial,
      verbose: cfg.verbose,
      simple_pir: cfg.simple_pir,
      preproc: cfg.preproc,
      honest_hint: cfg.honest_hint,
    };
    let db_params = DbParams::derive(
      cfg.n_records,
      cfg.d_bits,
      cfg.lwe_dim,
      cfg.sigma,
      cfg.stat_sec,
      &flags,
    )?;
    let lhe = Lhe::online(db_params.n, db_params.p, db_params.sigma);
    let preproc_lhe = if cfg.preproc {
      Some(Lhe::preproc(
        db_params.n,
        db_params.p,
        db_params.kappa,
        db_params.sigma,
      ))
    } else {
      None
    };
    debug!(
      ell = db_params.ell,
      m = db_params.m,
      p = db_params.p,
      kappa = db_params.kappa,
      "constructed PIR instance"
    );
    Ok(Self {
      db_params,
      lhe,
      preproc_lhe,
      seed: cfg.seed,
    })
  }

  pub fn lhe(&self) -> &Lhe {
    &self.lhe
  }

  /// The preprocessing LHE instance; calling any offline operation on an
  /// instance built without `preproc` is a programmer error.
  pub(crate) fn preproc_lhe(&self) -> &Lhe {
    match &self.preproc_lhe {
      Some(l) => l,
      None => panic!("preprocessing is not enabled for this instance"),
    }
  }

  pub fn seed(&self) -> [u8; 32] {
    self.seed
  }

  /// Expands the online public matrix `A1 : m x n` from the seed.
  /// Deterministic: the same seed yields byte-identical output.
  pub fn init(&self) -> Matrix {
    self
      .lhe
      .gen_public_a(sampling::derive_sub_seed(self.seed, crate::preproc::DOMAIN_A1), self.db_params.m)
  }

  /// Server precomputation of the online hint `H1 = D·A1 : ell x n`.
  pub fn generate_hint(&self, a1: &Matrix, d_packed: &PackedMatrix) -> Matrix {
    shape_check(
      d_packed.rows == self.db_params.ell && d_packed.cols == self.db_params.m,
      "database shape does not match parameters",
    );
    matmul_packed(d_packed, a1)
  }

  /// Fresh per-query secret key.
  pub fn get_sk(&self) -> Matrix {
    self.lhe.sample_sk()
  }

  /// Encrypts the one-hot selector for `index` against a cached `A1·sk`.
  pub fn query_given_as(&self, a_sk: &Matrix, index: u64) -> Matrix {
    shape_check(index < self.db_params.n_records, "record index out of range");
    let (_, col, _) = self.db_params.row_for_index(index);
    let mut selector = Matrix::zeros(self.db_params.m, 1);
    selector.set(col, 0, 1);
    self.lhe.encrypt_given_as(a_sk, &selector)
  }

  /// Server answer `ans = D·ct : ell x 1`.
  pub fn answer(&self, ct: &Matrix, d_packed: &PackedMatrix) -> Matrix {
    matmul_packed(d_packed, ct)
  }

  /// Checks the answer against the offline-established proof state:
  /// `C·ans = Z^T·ct mod q`. Exact equality; any deviation in `ans`
  /// survives only if the corresponding column of the secret `C` is
  /// all-zero, which happens with probability `2^-STAT_SEC_PARAM`.
  pub fn pre_verify(
    &self,
    ct: &Matrix,
    ans: &Matrix,
    z: &Matrix,
    c: &BinaryMatrix,
  ) -> bool {
    shape_check(
      ans.rows == self.db_params.ell && ct.rows == self.db_params.m,
      "answer or query length does not match parameters",
    );
    let lhs = matmul_binary(c, ans);
    let rhs = matmul_vec_transposed(z, ct);
    let ok = lhs == rhs;
    if !ok {
      warn!("online answer failed verification");
    }
    ok
  }

  /// Decrypts the verified answer and projects out record `index`.
  pub fn recover_given_hs(
    &self,
    h_sk: &Matrix,
    ans: &Matrix,
    sk: &Matrix,
    index: u64,
  ) -> PirResult<Entry> {
    shape_check(
      sk.rows == self.db_params.n && sk.cols == 1,
      "secret key must be an n-length column",
    );
    let pt = self.lhe.decrypt_given_hs(h_sk, ans).map_err(|e| match e {
      // beyond-wrap values mean the answer was not a valid encryption
      PirError::DecryptionOutOfRange => PirError::VerificationFailed,
      other => other,
    })?;
    Ok(extract_record(&pt, &self.db_params, index))
  }
}

/// Client-side state for a single query: the ephemeral secret key and the
/// cached `A1·sk` / `H1·sk` products, so the heavy matrix-vector work
/// stays off the query critical path.
pub struct QuerySession {
  sk: Matrix,
  a_sk: Matrix,
  h_sk: Matrix,
}

impl QuerySession {
  pub fn new(pir: &VeriSimplePir, a1: &Matrix, h1: &Matrix) -> Self {
    let sk = pir.get_sk();
    let a_sk = matmul_vec(a1, &sk);
    let h_sk = matmul_vec(h1, &sk);
    Self { sk, a_sk, h_sk }
  }

  /// Produces the query ciphertext. Consumes the session: the key is
  /// strictly per-query, and rotating it invalidates both cached
  /// products, so they are moved into the pending state together.
  pub fn query(self, pir: &VeriSimplePir, index: u64) -> (Matrix, PendingQuery) {
    let ct = pir.query_given_as(&self.a_sk, index);
    let pending = PendingQuery {
      sk: self.sk,
      h_sk: self.h_sk,
      ct: ct.clone(),
      index,
    };
    (ct, pending)
  }
}

/// Awaits the server's answer for one issued query.
pub struct PendingQuery {
  sk: Matrix,
  h_sk: Matrix,
  ct: Matrix,
  index: u64,
}

impl PendingQuery {
  pub fn index(&self) -> u64 {
    self.index
  }

  /// Verifies the answer against the offline proof state and, only on
  /// success, decrypts and extracts the record. Consumes the pending
  /// state either way; a rejected answer leaves nothing reusable.
  pub fn verify_and_recover(
    self,
    pir: &VeriSimplePir,
    ans: &Matrix,
    z: &Matrix,
    c: &BinaryMatrix,
  ) -> PirResult<Entry> {
    if !pir.pre_verify(&self.ct, ans, z, c) {
      return Err(PirError::VerificationFailed);
    }
    pir.recover_given_hs(&self.h_sk, ans, &self.sk, self.index)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::RawDatabase;
  use crate::utils::format;

  fn test_config(n_records: u64, d_bits: usize) -> PirConfig {
    let mut cfg = PirConfig::new(n_records, d_bits);
    cfg.allow_trivial = true;
    cfg.lwe_dim = 128;
    cfg
  }

  struct Deployment {
    pir: VeriSimplePir,
    db: RawDatabase,
    d_packed: PackedMatrix,
    a1: Matrix,
    h1: Matrix,
    z: Matrix,
    c: BinaryMatrix,
  }

  /// Runs the full offline phase against an honest server and returns
  /// everything the online phase needs.
  fn deploy(cfg: PirConfig, db: RawDatabase) -> Deployment {
    let pir = VeriSimplePir::new(cfg).unwrap();
    let d_packed = db.pack(&pir.db_params);
    let d_t = db.transpose_plain(&pir.db_params);
    let a1 = pir.init();
    let a2 = pir.preproc_init();
    let h1 = pir.generate_hint(&a1, &d_packed);
    let h2 = pir.preproc_generate_hint(&a2, &d_t);
    let c = pir.preproc_sample_c();
    let (cts, sks) = pir.preproc_client_message(&a2, &c);
    let ansts = pir.preproc_answer(&cts, &d_t);
    let hash = pir.preproc_hash(&a2, &h2);
    let proof = pir.preproc_prove(&hash, &cts, &ansts, &d_t);
    assert!(pir.preproc_verify(&a2, &h2, &hash, &cts, &ansts, &proof));
    let z = pir.preproc_recover_z(&h2, &sks, &ansts).unwrap();
    assert!(pir.verify_preproc_z(&z, &a1, &c, &h1));
    Deployment {
      pir,
      db,
      d_packed,
      a1,
      h1,
      z,
      c,
    }
  }

  fn query_once(dep: &Deployment, index: u64) -> PirResult<Entry> {
    let session = QuerySession::new(&dep.pir, &dep.a1, &dep.h1);
    let (ct, pending) = session.query(&dep.pir, index);
    let ans = dep.pir.answer(&ct, &dep.d_packed);
    pending.verify_and_recover(&dep.pir, &ans, &dep.z, &dep.c)
  }

  #[test]
  fn full_protocol_recovers_known_record() {
    let n_records = 1u64 << 16;
    let d_bits = 8;
    let mut bits = vec![0u8; (n_records as usize * d_bits) / 8];
    format::write_bits_le(&mut bits, 42 * d_bits, d_bits, 0xAB);
    let db = RawDatabase::from_bits(bits, n_records, d_bits).unwrap();
    let dep = deploy(test_config(n_records, d_bits), db);
    assert_eq!(query_once(&dep, 42).unwrap(), 0xAB);
    assert_eq!(query_once(&dep, 41).unwrap(), 0x00);
  }

  #[test]
  fn tampered_answer_is_rejected_before_recovery() {
    let n_records = 1u64 << 12;
    let db = RawDatabase::random(n_records, 8);
    let dep = deploy(test_config(n_records, 8), db);
    let session = QuerySession::new(&dep.pir, &dep.a1, &dep.h1);
    let (ct, pending) = session.query(&dep.pir, 42);
    let mut ans = dep.pir.answer(&ct, &dep.d_packed);
    ans.set(0, 0, ans.get(0, 0) ^ 1);
    assert!(!dep.pir.pre_verify(&ct, &ans, &dep.z, &dep.c));
    assert_eq!(
      pending.verify_and_recover(&dep.pir, &ans, &dep.z, &dep.c),
      Err(PirError::VerificationFailed)
    );
  }

  #[test]
  fn single_bit_records_round_trip() {
    let n_records = 1u64 << 20;
    let db = RawDatabase::random(n_records, 1);
    let expected = db.record(0);
    let dep = deploy(test_config(n_records, 1), db);
    assert_eq!(query_once(&dep, 0).unwrap(), expected);
    assert_eq!(dep.db.record(0), expected);
  }

  #[test]
  fn random_queries_match_database() {
    use rand::Rng;
    let n_records = 1u64 << 12;
    let db = RawDatabase::random(n_records, 12);
    let dep = deploy(test_config(n_records, 12), db);
    let mut rng = rand::thread_rng();
    for _ in 0..5 {
      let index = rng.gen_range(0..n_records);
      assert_eq!(query_once(&dep, index).unwrap(), dep.db.record(index));
    }
  }

  #[test]
  fn public_matrices_are_deterministic_per_seed() {
    let cfg = test_config(1 << 12, 8);
    let pir_a = VeriSimplePir::new(cfg.clone()).unwrap();
    let pir_b = VeriSimplePir::new(cfg).unwrap();
    assert_eq!(pir_a.init(), pir_b.init());
    assert_eq!(
      pir_a.preproc_init().to_wire_bytes(),
      pir_b.preproc_init().to_wire_bytes()
    );
    let mut other = test_config(1 << 12, 8);
    other.seed = [0x55; 32];
    let pir_c = VeriSimplePir::new(other).unwrap();
    assert_ne!(pir_a.init(), pir_c.init());
  }

  #[test]
  fn reserved_constructor_fields_are_rejected() {
    let mut cfg = test_config(1 << 10, 8);
    cfg.random_data = true;
    assert!(matches!(
      VeriSimplePir::new(cfg),
      Err(PirError::ParameterInfeasible(_))
    ));
    let mut cfg = test_config(1 << 10, 8);
    cfg.batch_size = 2;
    assert!(matches!(
      VeriSimplePir::new(cfg),
      Err(PirError::ParameterInfeasible(_))
    ));
    let mut cfg = test_config(1 << 10, 8);
    cfg.simple_pir = true;
    assert!(matches!(
      VeriSimplePir::new(cfg),
      Err(PirError::ParameterInfeasible(_))
    ));
  }

  #[test]
  fn simple_pir_instance_answers_without_proof_state() {
    let mut cfg = test_config(1 << 10, 8);
    cfg.simple_pir = true;
    cfg.preproc = false;
    let pir = VeriSimplePir::new(cfg).unwrap();
    let db = RawDatabase::random(1 << 10, 8);
    let d_packed = db.pack(&pir.db_params);
    let a1 = pir.init();
    let h1 = pir.generate_hint(&a1, &d_packed);
    let session = QuerySession::new(&pir, &a1, &h1);
    let (ct, pending) = session.query(&pir, 7);
    let ans = pir.answer(&ct, &d_packed);
    let rec = pir
      .recover_given_hs(&pending.h_sk, &ans, &pending.sk, 7)
      .unwrap();
    assert_eq!(rec, db.record(7));
  }
}
