//! Verifiable single-server private information retrieval over LWE.
//!
//! A client fetches one record of a large public database without
//! revealing which, and rejects any answer that is inconsistent with the
//! database the server committed to. A one-time interactive offline phase
//! establishes a compact proof state `(C, Z)` per database version; every
//! online answer is then certified by two short matrix products before it
//! is decrypted.
//!
//! The crate exposes the cryptographic core: modular matrix arithmetic
//! ([`matrix`]), the Regev-style linearly homomorphic layer ([`lhe`]),
//! database packing and parameter derivation ([`db`]), the offline
//! protocol ([`preproc`]), and the online protocol with its constructor
//! surface ([`api`]). Transports, persistence, and benchmarking harnesses
//! live with the callers.

pub mod api;
pub mod db;
pub mod errors;
pub mod lhe;
pub mod matrix;
pub mod preproc;
pub mod utils;

pub use crate::api::{new_pir, PendingQuery, PirConfig, QuerySession, VeriSimplePir};
pub use crate::db::{DbParams, Entry, RawDatabase};
pub use crate::errors::{PirError, PirResult};
pub use crate::matrix::{BinaryMatrix, Matrix, MultiLimbMatrix, PackedMatrix};
pub use crate::preproc::{OfflineSession, PreprocClientMsg, PreprocServerMsg};
pub use crate::utils::lwe::STAT_SEC_PARAM;
