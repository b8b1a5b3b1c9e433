use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand_chacha::ChaChaRng;
use rand_core::SeedableRng;

use cosig::{multisig, CommitPoint, CommitSecret, PrivKey, PubKey, Response};

fn bench_sign_verify(c: &mut Criterion) {
    let mut rng = ChaChaRng::seed_from_u64(1);
    let key = PrivKey::new(&mut rng);
    let pub_key = key.pub_key();
    let msg = [0xabu8; 256];

    c.bench_function("sign", |b| {
        b.iter(|| multisig::sign(&mut rng, &msg, &key, &pub_key))
    });

    let sig = multisig::sign(&mut rng, &msg, &key, &pub_key);
    c.bench_function("verify", |b| b.iter(|| multisig::verify(&msg, &sig, &pub_key)));
}

fn bench_aggregation(c: &mut Criterion) {
    let mut rng = ChaChaRng::seed_from_u64(2);
    let msg = [0xcdu8; 256];

    for committee_size in [64usize, 256] {
        let keys: Vec<PrivKey> = (0..committee_size).map(|_| PrivKey::new(&mut rng)).collect();
        let pub_keys: Vec<PubKey> = keys.iter().map(PrivKey::pub_key).collect();
        let secrets: Vec<CommitSecret> = (0..committee_size)
            .map(|_| CommitSecret::new(&mut rng))
            .collect();
        let commits: Vec<CommitPoint> = secrets.iter().map(CommitSecret::commit_point).collect();

        c.bench_function(&format!("aggregate_pub_keys/{committee_size}"), |b| {
            b.iter(|| multisig::aggregate_pub_keys(&pub_keys).unwrap())
        });

        let agg_commit = multisig::aggregate_commits(&commits).unwrap();
        let agg_key = multisig::aggregate_pub_keys(&pub_keys).unwrap();
        let challenge = multisig::build_challenge(&agg_commit, &agg_key, &msg);

        let responses: Vec<Response> = secrets
            .iter()
            .zip(&keys)
            .map(|(secret, key)| multisig::generate_response(secret, &challenge, key))
            .collect();

        c.bench_function(&format!("verify_responses/{committee_size}"), |b| {
            b.iter_batched(
                || responses.clone(),
                |responses| {
                    for ((response, pub_key), commit) in
                        responses.iter().zip(&pub_keys).zip(&commits)
                    {
                        assert!(multisig::verify_response(
                            response, &challenge, pub_key, commit
                        ));
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group!(benches, bench_sign_verify, bench_aggregation);
criterion_main!(benches);
