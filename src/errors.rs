use thiserror::Error;

/// Result alias used across the crate.
pub type PirResult<T> = Result<T, PirError>;

/// Failure modes of the PIR protocols.
///
/// Dimension mismatches in the arithmetic layer are programmer errors and
/// panic instead of surfacing here; see `matrix::shape_check`.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PirError {
  /// The parameter search could not satisfy the correctness and security
  /// constraints for the requested database geometry.
  #[error("parameter derivation infeasible: {0}")]
  ParameterInfeasible(String),

  /// The offline preprocessing proof was rejected. All client state for
  /// this database version must be discarded.
  #[error("preprocessing proof rejected")]
  ProofInvalid,

  /// An online answer failed verification against the offline proof state.
  #[error("online answer failed verification")]
  VerificationFailed,

  /// A decrypted coefficient exceeded the plaintext modulus. Values equal
  /// to the modulus are clamped to zero before this is raised, so this
  /// only occurs with corrupted ciphertexts or broken parameters.
  #[error("decrypted value out of plaintext range")]
  DecryptionOutOfRange,
}
