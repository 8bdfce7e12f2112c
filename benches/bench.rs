use criterion::{criterion_group, criterion_main, BenchmarkGroup, Criterion};
use veri_simple_pir::{
  BinaryMatrix, Matrix, MultiLimbMatrix, PackedMatrix, PirConfig, QuerySession,
  RawDatabase, VeriSimplePir,
};

const BENCH_ONLINE: bool = true;
const BENCH_OFFLINE: bool = true;

/// `N_VALUE` is the log2 of the record count, `D_VALUE` the record width
/// in bits; both overridable from the environment.
fn params_from_env() -> (u64, usize) {
  let log_n = std::env::var("N_VALUE")
    .ok()
    .and_then(|v| v.parse::<u32>().ok())
    .unwrap_or(16);
  let d = std::env::var("D_VALUE")
    .ok()
    .and_then(|v| v.parse::<usize>().ok())
    .unwrap_or(8);
  (1u64 << log_n, d)
}

fn criterion_benchmark(c: &mut Criterion) {
  let _ = tracing_subscriber::fmt::try_init();
  let (n_records, d_bits) = params_from_env();
  let mut group = c.benchmark_group("pir");

  println!("Setting up DB for benchmarking. This might take a while...");
  let mut cfg = PirConfig::new(n_records, d_bits);
  cfg.allow_trivial = true;
  let pir = VeriSimplePir::new(cfg).unwrap();
  let db = RawDatabase::random(n_records, d_bits);
  let d_packed = db.pack(&pir.db_params);
  let d_t = db.transpose_plain(&pir.db_params);
  println!("Setup complete, starting benchmarks");

  if BENCH_OFFLINE {
    _bench_offline(&mut group, &pir, &d_packed, &d_t);
  }
  if BENCH_ONLINE {
    _bench_online(&mut group, &pir, &d_packed, &d_t);
  }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

fn _bench_offline(
  c: &mut BenchmarkGroup<criterion::measurement::WallTime>,
  pir: &VeriSimplePir,
  d_packed: &PackedMatrix,
  d_t: &Matrix,
) {
  let params = &pir.db_params;
  let a1 = pir.init();
  let a2 = pir.preproc_init();
  let h1 = pir.generate_hint(&a1, d_packed);
  let h2 = pir.preproc_generate_hint(&a2, d_t);
  let hash = pir.preproc_hash(&a2, &h2);
  let ch = pir.preproc_sample_c();
  let (cts, sks) = pir.preproc_client_message(&a2, &ch);
  let ansts = pir.preproc_answer(&cts, d_t);
  let proof = pir.preproc_prove(&hash, &cts, &ansts, d_t);

  c.bench_function(
    format!("expand A2, ell: {}, n: {}", params.ell, params.n),
    |b| b.iter(|| pir.preproc_init()),
  );
  c.bench_function(format!("offline client message, ell: {}", params.ell), |b| {
    b.iter(|| pir.preproc_client_message(&a2, &ch))
  });
  c.bench_function(format!("offline answer, m: {}", params.m), |b| {
    b.iter(|| pir.preproc_answer(&cts, d_t))
  });
  c.bench_function(format!("offline prove, m: {}", params.m), |b| {
    b.iter(|| pir.preproc_prove(&hash, &cts, &ansts, d_t))
  });
  c.bench_function(format!("offline verify, ell: {}", params.ell), |b| {
    b.iter(|| pir.preproc_verify(&a2, &h2, &hash, &cts, &ansts, &proof))
  });
  c.bench_function(format!("offline recover Z, m: {}", params.m), |b| {
    b.iter(|| pir.preproc_recover_z(&h2, &sks, &ansts).unwrap())
  });
  let z = pir.preproc_recover_z(&h2, &sks, &ansts).unwrap();
  c.bench_function(format!("offline certify Z, m: {}", params.m), |b| {
    b.iter(|| pir.verify_preproc_z(&z, &a1, &ch, &h1))
  });
}

fn _bench_online(
  c: &mut BenchmarkGroup<criterion::measurement::WallTime>,
  pir: &VeriSimplePir,
  d_packed: &PackedMatrix,
  d_t: &Matrix,
) {
  let params = &pir.db_params;
  let a1 = pir.init();
  let a2 = pir.preproc_init();
  let h1 = pir.generate_hint(&a1, d_packed);
  let h2 = pir.preproc_generate_hint(&a2, d_t);
  let (ch, z) = offline_state(pir, &a1, &a2, &h1, &h2, d_t);

  c.bench_function(
    format!("expand A1, m: {}, n: {}", params.m, params.n),
    |b| b.iter(|| pir.init()),
  );
  c.bench_function(format!("generate hint, ell: {}", params.ell), |b| {
    b.iter(|| pir.generate_hint(&a1, d_packed))
  });
  c.bench_function(format!("prepare session, n: {}", params.n), |b| {
    b.iter(|| QuerySession::new(pir, &a1, &h1))
  });

  let session = QuerySession::new(pir, &a1, &h1);
  let (ct, pending) = session.query(pir, 1);
  c.bench_function(format!("query, m: {}", params.m), |b| {
    b.iter(|| {
      let s = QuerySession::new(pir, &a1, &h1);
      s.query(pir, 1)
    })
  });
  let ans = pir.answer(&ct, d_packed);
  c.bench_function(
    format!("answer, ell: {}, m: {}", params.ell, params.m),
    |b| b.iter(|| pir.answer(&ct, d_packed)),
  );
  c.bench_function(format!("pre-verify, ell: {}", params.ell), |b| {
    b.iter(|| pir.pre_verify(&ct, &ans, &z, &ch))
  });
  let rec = pending.verify_and_recover(pir, &ans, &z, &ch).unwrap();
  println!("recovered entry {}", rec);
}

fn offline_state(
  pir: &VeriSimplePir,
  a1: &Matrix,
  a2: &MultiLimbMatrix,
  h1: &Matrix,
  h2: &MultiLimbMatrix,
  d_t: &Matrix,
) -> (BinaryMatrix, Matrix) {
  let ch = pir.preproc_sample_c();
  let (cts, sks) = pir.preproc_client_message(a2, &ch);
  let ansts = pir.preproc_answer(&cts, d_t);
  let hash = pir.preproc_hash(a2, h2);
  let proof = pir.preproc_prove(&hash, &cts, &ansts, d_t);
  assert!(pir.preproc_verify(a2, h2, &hash, &cts, &ansts, &proof));
  let z = pir.preproc_recover_z(h2, &sks, &ansts).unwrap();
  assert!(pir.verify_preproc_z(&z, a1, &ch, h1));
  (ch, z)
}
