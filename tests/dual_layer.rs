use attachment_crypto::format::IV_LEN;
use attachment_crypto::{
    AttachmentDecryptor, AttachmentEncryptor, AttachmentError, AttachmentKeys, IntegrityCheck,
    Layering, Source, StreamConfig, wrap_outer_layer,
};

struct Wrapped {
    inner_keys: AttachmentKeys,
    outer_keys: AttachmentKeys,
    plaintext: Vec<u8>,
    inner_digest: [u8; 32],
    outer_blob: Vec<u8>,
}

fn wrapped(len: usize) -> Wrapped {
    let inner_keys = AttachmentKeys::generate();
    let outer_keys = AttachmentKeys::generate();
    let plaintext: Vec<u8> = (0..len).map(|i| (i % 199) as u8).collect();

    let mut inner_blob = Vec::new();
    let inner = AttachmentEncryptor::new(inner_keys.material())
        .encrypt(Source::Bytes(&plaintext), &mut inner_blob)
        .expect("encrypt inner layer");

    let mut outer_blob = Vec::new();
    wrap_outer_layer(
        Source::Bytes(&inner_blob),
        outer_keys.material(),
        &mut outer_blob,
        &StreamConfig::default(),
    )
    .expect("wrap outer layer");

    Wrapped {
        inner_keys,
        outer_keys,
        plaintext,
        inner_digest: inner.digest,
        outer_blob,
    }
}

fn decrypt(wrapped: &Wrapped, blob: &[u8], layering: Layering<'_>) -> Result<Vec<u8>, AttachmentError> {
    let mut plaintext = Vec::new();
    AttachmentDecryptor::new(
        wrapped.inner_keys.material(),
        wrapped.plaintext.len() as u64,
        IntegrityCheck::Digest(wrapped.inner_digest),
    )
    .with_layering(layering)
    .with_config(StreamConfig::default().with_chunk_size(32))
    .decrypt(Source::Bytes(blob), &mut plaintext)?;
    Ok(plaintext)
}

#[test]
fn dual_layer_round_trip() {
    let wrapped = wrapped(4000);
    let layering = Layering::DualLayer {
        outer: wrapped.outer_keys.material(),
    };

    let plaintext = decrypt(&wrapped, &wrapped.outer_blob, layering).expect("decrypt both layers");
    assert_eq!(plaintext, wrapped.plaintext);
}

#[test]
fn tampered_outer_bytes_fail_the_outer_mac() {
    let wrapped = wrapped(1000);
    let layering = Layering::DualLayer {
        outer: wrapped.outer_keys.material(),
    };

    // 外层 IV 第一个字节、中间某字节、外层 MAC 最后一个字节。
    for index in [0, wrapped.outer_blob.len() / 2, wrapped.outer_blob.len() - 1] {
        let mut tampered = wrapped.outer_blob.clone();
        tampered[index] ^= 0x01;

        let result = decrypt(&wrapped, &tampered, layering);
        assert!(
            matches!(result, Err(AttachmentError::BadOuterMac)),
            "byte {index}: {result:?}"
        );
    }
}

#[test]
fn wrong_outer_keys_fail_the_outer_mac() {
    let wrapped = wrapped(10);
    let other = AttachmentKeys::generate();
    let layering = Layering::DualLayer {
        outer: other.material(),
    };

    let result = decrypt(&wrapped, &wrapped.outer_blob, layering);
    assert!(matches!(result, Err(AttachmentError::BadOuterMac)));
}

#[test]
fn skipping_the_outer_layer_fails_the_inner_mac() {
    let wrapped = wrapped(10);

    let result = decrypt(&wrapped, &wrapped.outer_blob, Layering::SingleLayer);
    assert!(matches!(result, Err(AttachmentError::BadMac)));
}

#[test]
fn wrong_inner_keys_fail_the_inner_mac() {
    let wrapped = wrapped(10);
    let other = AttachmentKeys::generate();

    let mut plaintext = Vec::new();
    let result = AttachmentDecryptor::new(
        other.material(),
        10,
        IntegrityCheck::Digest(wrapped.inner_digest),
    )
    .with_outer_layer(wrapped.outer_keys.material())
    .decrypt(Source::Bytes(&wrapped.outer_blob), &mut plaintext);

    assert!(matches!(result, Err(AttachmentError::BadMac)));
}

#[test]
fn outer_envelope_keeps_a_fresh_iv() {
    let first = wrapped(10);
    assert!(first.outer_blob.len() > IV_LEN);

    let mut again = Vec::new();
    let inner_blob = {
        let mut blob = Vec::new();
        AttachmentEncryptor::new(first.inner_keys.material())
            .encrypt(Source::Bytes(&first.plaintext), &mut blob)
            .expect("encrypt inner layer");
        blob
    };
    wrap_outer_layer(
        Source::Bytes(&inner_blob),
        first.outer_keys.material(),
        &mut again,
        &StreamConfig::default(),
    )
    .expect("wrap outer layer");

    assert_ne!(&again[..IV_LEN], &first.outer_blob[..IV_LEN]);
}
