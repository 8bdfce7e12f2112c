//! The offline preprocessing protocol.
//!
//! The client ships encryptions of a secret binary challenge `C`; the
//! server answers with encryptions of `D_T·c_j` and a proof that every
//! answer is consistent with the hinted database. The proof is a
//! Freivalds argument made non-interactive: a binary challenge `T` is
//! expanded from the transcript digest, and the server reveals
//! `T·D_T`, whose entries are small exact integers. Binding `T·D_T` to
//! the hint (`proof·A2 = T·H2`) while keeping its entries below `p·m`
//! means forging any other opening is a short-solution lattice problem.
//!
//! The client ends up with `Z = D_T·C^T`, recovered by decryption and
//! certified against the online hint, which then certifies every online
//! answer at the cost of two short products.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::api::VeriSimplePir;
use crate::errors::{PirError, PirResult};
use crate::matrix::{
  matmul_binary, matmul_binary_ml, matmul_ml, matmul_transposed, matmul_vec_ml,
  shape_check, BinaryMatrix, Matrix, MultiLimbMatrix,
};
use crate::utils::sampling;

// transcript domain-separation tags
pub(crate) const DOMAIN_PREPROC_HASH: u8 = 0x01;
pub(crate) const DOMAIN_CHALLENGE: u8 = 0x02;
pub(crate) const DOMAIN_A1: u8 = 0x03;
pub(crate) const DOMAIN_A2: u8 = 0x04;

/// The client's offline upload: one ciphertext per challenge row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreprocClientMsg {
  pub cts: Vec<MultiLimbMatrix>,
}

/// The server's offline response: answer ciphertexts plus the proof.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreprocServerMsg {
  pub ansts: Vec<MultiLimbMatrix>,
  pub proof: Matrix,
}

impl PreprocClientMsg {
  pub fn to_bytes(&self) -> PirResult<Vec<u8>> {
    bincode::serialize(self).map_err(|_| PirError::ProofInvalid)
  }

  pub fn from_bytes(bytes: &[u8]) -> PirResult<Self> {
    bincode::deserialize(bytes).map_err(|_| PirError::ProofInvalid)
  }
}

impl PreprocServerMsg {
  pub fn to_bytes(&self) -> PirResult<Vec<u8>> {
    bincode::serialize(self).map_err(|_| PirError::ProofInvalid)
  }

  pub fn from_bytes(bytes: &[u8]) -> PirResult<Self> {
    bincode::deserialize(bytes).map_err(|_| PirError::ProofInvalid)
  }
}

impl VeriSimplePir {
  /// Expands the preprocessing public matrix `A2 : ell x n` from the
  /// seed; deterministic, like `init`.
  pub fn preproc_init(&self) -> MultiLimbMatrix {
    self.preproc_lhe().gen_public_a_ml(
      sampling::derive_sub_seed(self.seed(), DOMAIN_A2),
      self.db_params.ell,
    )
  }

  /// Server precomputation of the preprocessing hint
  /// `H2 = D_T·A2 : m x n`.
  pub fn preproc_generate_hint(
    &self,
    a2: &MultiLimbMatrix,
    d_t: &Matrix,
  ) -> MultiLimbMatrix {
    shape_check(
      d_t.rows == self.db_params.m && d_t.cols == self.db_params.ell,
      "transposed database shape does not match parameters",
    );
    matmul_ml(d_t, a2, self.db_params.kappa)
  }

  /// Samples the client-secret binary challenge
  /// `C : STAT_SEC_PARAM x ell`.
  pub fn preproc_sample_c(&self) -> BinaryMatrix {
    sampling::random_binary(self.db_params.stat_sec, self.db_params.ell)
  }

  /// Encrypts each row of `C` under a fresh multi-limb key. Returns the
  /// ciphertexts to send and the keys to hold.
  pub fn preproc_client_message(
    &self,
    a2: &MultiLimbMatrix,
    c: &BinaryMatrix,
  ) -> (Vec<MultiLimbMatrix>, Vec<MultiLimbMatrix>) {
    shape_check(
      c.rows == self.db_params.stat_sec && c.cols == self.db_params.ell,
      "challenge shape does not match parameters",
    );
    let lhe = self.preproc_lhe();
    let mut cts = Vec::with_capacity(c.rows);
    let mut sks = Vec::with_capacity(c.rows);
    for j in 0..c.rows {
      let sk = lhe.sample_sk_ml();
      let pt = c.row_as_column(j);
      cts.push(lhe.encrypt_ml(a2, &sk, &pt));
      sks.push(sk);
    }
    (cts, sks)
  }

  /// Server answers: `ansts_j = D_T·ct_j`, an encryption of `D_T·c_j`
  /// in the enlarged message space.
  pub fn preproc_answer(
    &self,
    cts: &[MultiLimbMatrix],
    d_t: &Matrix,
  ) -> Vec<MultiLimbMatrix> {
    cts
      .iter()
      .map(|ct| matmul_vec_ml(d_t, ct, self.db_params.kappa))
      .collect()
  }

  /// Digest binding the public preprocessing transcript:
  /// `SHA-256(0x01 || wire(A2) || wire(H2))`.
  pub fn preproc_hash(&self, a2: &MultiLimbMatrix, h2: &MultiLimbMatrix) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([DOMAIN_PREPROC_HASH]);
    hasher.update(a2.to_wire_bytes());
    hasher.update(h2.to_wire_bytes());
    hasher.finalize().into()
  }

  /// Expands the Fiat-Shamir challenge `T : STAT_SEC_PARAM x m`. The
  /// seed covers the answer ciphertexts as well; a challenge fixed
  /// before the answers would let the server hide perturbations in its
  /// kernel.
  fn preproc_challenge(
    &self,
    hash: &[u8; 32],
    cts: &[MultiLimbMatrix],
    ansts: &[MultiLimbMatrix],
  ) -> BinaryMatrix {
    let mut hasher = Sha256::new();
    hasher.update([DOMAIN_CHALLENGE]);
    hasher.update(hash);
    for ct in cts {
      hasher.update(ct.to_wire_bytes());
    }
    for anst in ansts {
      hasher.update(anst.to_wire_bytes());
    }
    let seed: [u8; 32] = hasher.finalize().into();
    sampling::expand_binary(seed, self.db_params.stat_sec, self.db_params.m)
  }

  /// Server proof: `T·D_T : STAT_SEC_PARAM x ell`, exact integers below
  /// `p·m`.
  pub fn preproc_prove(
    &self,
    hash: &[u8; 32],
    cts: &[MultiLimbMatrix],
    ansts: &[MultiLimbMatrix],
    d_t: &Matrix,
  ) -> Matrix {
    let t = self.preproc_challenge(hash, cts, ansts);
    matmul_binary(&t, d_t)
  }

  /// Client-side verification of the server's offline response. Needs
  /// no secret keys: both checks are exact limb-wise equalities.
  pub fn preproc_verify(
    &self,
    a2: &MultiLimbMatrix,
    h2: &MultiLimbMatrix,
    hash: &[u8; 32],
    cts: &[MultiLimbMatrix],
    ansts: &[MultiLimbMatrix],
    proof: &Matrix,
  ) -> bool {
    let params = &self.db_params;
    if proof.rows != params.stat_sec || proof.cols != params.ell {
      warn!("offline proof has wrong shape");
      return false;
    }
    if ansts.len() != cts.len() || cts.len() != params.stat_sec {
      warn!("offline transcript has wrong length");
      return false;
    }
    // entries must be openings of T·D_T, hence below p·m; without the
    // range check any preimage of T·H2 under A2 would pass
    let bound = (params.p * params.m as u64) as u32;
    if proof.data().iter().any(|v| *v >= bound) {
      warn!("offline proof entry exceeds plaintext bound");
      return false;
    }
    let t = self.preproc_challenge(hash, cts, ansts);
    let kappa = params.kappa;
    if matmul_ml(proof, a2, kappa) != matmul_binary_ml(&t, h2, kappa) {
      warn!("offline proof is not bound to the hint");
      return false;
    }
    for (j, (ct, anst)) in cts.iter().zip(ansts.iter()).enumerate() {
      if matmul_vec_ml(proof, ct, kappa) != matmul_binary_ml(&t, anst, kappa) {
        warn!(row = j, "offline answer inconsistent with proof");
        return false;
      }
    }
    true
  }

  /// Decrypts the verified answers into `Z = D_T·C^T : m x STAT_SEC_PARAM`.
  /// Entries are exact integers below `ell·p`; they stay unreduced so the
  /// online checks hold over `Z_q`.
  pub fn preproc_recover_z(
    &self,
    h2: &MultiLimbMatrix,
    sks: &[MultiLimbMatrix],
    ansts: &[MultiLimbMatrix],
  ) -> PirResult<Matrix> {
    shape_check(
      sks.len() == ansts.len() && sks.len() == self.db_params.stat_sec,
      "key and answer counts must match the challenge",
    );
    let lhe = self.preproc_lhe();
    let mut z = Matrix::zeros(self.db_params.m, self.db_params.stat_sec);
    for (j, (sk, anst)) in sks.iter().zip(ansts.iter()).enumerate() {
      let col = lhe.decrypt_ml(h2, sk, anst)?;
      for i in 0..self.db_params.m {
        z.set(i, j, col.get(i, 0));
      }
    }
    Ok(z)
  }

  /// The final offline check: `Z^T·A1 = C·H1 mod q`, exact. Ties the
  /// recovered proof state to the online hint without trusting the
  /// server for either.
  pub fn verify_preproc_z(
    &self,
    z: &Matrix,
    a1: &Matrix,
    c: &BinaryMatrix,
    h1: &Matrix,
  ) -> bool {
    shape_check(
      z.rows == self.db_params.m && z.cols == self.db_params.stat_sec,
      "recovered proof state has wrong shape",
    );
    let ok = matmul_transposed(z, a1) == matmul_binary(c, h1);
    if !ok {
      warn!("recovered proof state inconsistent with online hint");
    }
    ok
  }
}

/// Client-side state machine for one offline run. Any rejection discards
/// everything gathered for this database version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OfflinePhase {
  AwaitHint,
  AwaitProof,
  Ready,
  Rejected,
}

pub struct OfflineSession<'a> {
  pir: &'a VeriSimplePir,
  phase: OfflinePhase,
  a1: Matrix,
  a2: MultiLimbMatrix,
  h1: Option<Matrix>,
  h2: Option<MultiLimbMatrix>,
  c: Option<BinaryMatrix>,
  cts: Vec<MultiLimbMatrix>,
  sks: Vec<MultiLimbMatrix>,
  z: Option<Matrix>,
}

impl<'a> OfflineSession<'a> {
  pub fn new(pir: &'a VeriSimplePir) -> Self {
    Self {
      pir,
      phase: OfflinePhase::AwaitHint,
      a1: pir.init(),
      a2: pir.preproc_init(),
      h1: None,
      h2: None,
      c: None,
      cts: Vec::new(),
      sks: Vec::new(),
      z: None,
    }
  }

  pub fn phase(&self) -> &OfflinePhase {
    &self.phase
  }

  /// Absorbs the hints from first contact and produces the challenge
  /// upload. The session keeps its own copy of the transcript.
  pub fn receive_hint(
    &mut self,
    h1: Matrix,
    h2: MultiLimbMatrix,
  ) -> PirResult<PreprocClientMsg> {
    assert!(
      self.phase == OfflinePhase::AwaitHint,
      "offline session used out of order"
    );
    let params = &self.pir.db_params;
    shape_check(
      h1.rows == params.ell && h1.cols == params.n,
      "online hint has wrong shape",
    );
    shape_check(
      h2.rows() == params.m && h2.cols() == params.n,
      "preprocessing hint has wrong shape",
    );
    let c = self.pir.preproc_sample_c();
    let (cts, sks) = self.pir.preproc_client_message(&self.a2, &c);
    self.h1 = Some(h1);
    self.h2 = Some(h2);
    self.c = Some(c);
    self.cts = cts.clone();
    self.sks = sks;
    self.phase = OfflinePhase::AwaitProof;
    Ok(PreprocClientMsg { cts })
  }

  /// Absorbs the server response: verifies the proof, recovers `Z`, and
  /// certifies it against the online hint.
  pub fn receive_proof(&mut self, msg: &PreprocServerMsg) -> PirResult<()> {
    assert!(
      self.phase == OfflinePhase::AwaitProof,
      "offline session used out of order"
    );
    let (h1, h2, c) = match (&self.h1, &self.h2, &self.c) {
      (Some(h1), Some(h2), Some(c)) => (h1, h2, c),
      _ => unreachable!("hints are present once the challenge is sent"),
    };
    let hash = self.pir.preproc_hash(&self.a2, h2);
    if !self
      .pir
      .preproc_verify(&self.a2, h2, &hash, &self.cts, &msg.ansts, &msg.proof)
    {
      return self.reject();
    }
    let z = match self.pir.preproc_recover_z(h2, &self.sks, &msg.ansts) {
      Ok(z) => z,
      Err(_) => return self.reject(),
    };
    if !self.pir.verify_preproc_z(&z, &self.a1, c, h1) {
      return self.reject();
    }
    debug!("offline proof state established");
    self.z = Some(z);
    self.cts.clear();
    self.sks.clear();
    self.phase = OfflinePhase::Ready;
    Ok(())
  }

  fn reject(&mut self) -> PirResult<()> {
    self.phase = OfflinePhase::Rejected;
    self.c = None;
    self.cts.clear();
    self.sks.clear();
    self.z = None;
    Err(PirError::ProofInvalid)
  }

  /// Hands over the per-database proof state `(C, Z)` for online use.
  pub fn into_proof_state(self) -> PirResult<(BinaryMatrix, Matrix)> {
    match (self.phase, self.c, self.z) {
      (OfflinePhase::Ready, Some(c), Some(z)) => Ok((c, z)),
      _ => Err(PirError::ProofInvalid),
    }
  }
}
