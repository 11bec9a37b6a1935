use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use credcore::{
    CoreConfig, CredentialType, EncryptionConfig, Encryptor, HsmSettings, KeyProviderRegistry,
    PasswordSettings, ProviderConfig, SecretPath, SecretVersion, SoftHsm,
};

fn password_encryptor() -> Encryptor {
    let config = CoreConfig::new(EncryptionConfig::new(
        "password",
        vec![ProviderConfig::password(
            "password",
            PasswordSettings::new("correct-horse-battery-staple", "0123456789abcdef"),
        )],
    ));
    Encryptor::new(Arc::new(KeyProviderRegistry::new(&config).unwrap()))
}

fn hardware_encryptor() -> Encryptor {
    let config = CoreConfig::new(EncryptionConfig::new(
        "hsm",
        vec![ProviderConfig::hsm(
            "hsm",
            HsmSettings {
                partition: "bench".into(),
                key_label: "wrap".into(),
                create_key_if_missing: true,
            },
        )],
    ));
    let registry = KeyProviderRegistry::new(&config)
        .unwrap()
        .with_hsm_connector(Arc::new(SoftHsm::new()));
    Encryptor::new(Arc::new(registry))
}

fn benchmark_assign_reveal(c: &mut Criterion) {
    let sizes = [("100B", 100), ("1KB", 1024), ("10KB", 10 * 1024)];

    for (backend, encryptor) in [
        ("password", password_encryptor()),
        ("soft-hsm", hardware_encryptor()),
    ] {
        // Construction (PBKDF2, key creation) happens here, outside the timed loop.
        encryptor.registry().active().unwrap();

        let mut group = c.benchmark_group(format!("assign/{backend}"));
        for (name, size) in sizes {
            let payload = vec![0x5au8; size];
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::from_parameter(name), &payload, |b, payload| {
                let path = SecretPath::parse("/bench/value").unwrap();
                b.iter(|| {
                    let mut version = SecretVersion::new(path.clone(), CredentialType::Value);
                    encryptor.assign(&mut version, Some(payload.as_slice())).unwrap();
                    black_box(version)
                })
            });
        }
        group.finish();

        let mut group = c.benchmark_group(format!("reveal/{backend}"));
        for (name, size) in sizes {
            let mut version =
                SecretVersion::new(SecretPath::parse("/bench/value").unwrap(), CredentialType::Value);
            encryptor.assign(&mut version, Some(vec![0x5au8; size].as_slice())).unwrap();

            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::from_parameter(name), &version, |b, version| {
                b.iter(|| black_box(encryptor.reveal(version).unwrap()))
            });
        }
        group.finish();
    }
}

criterion_group!(benches, benchmark_assign_reveal);
criterion_main!(benches);
