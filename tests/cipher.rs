use sealsearch::crypto::{
    destroy_key, get_or_create_key, load_key, MemoryStorage, SearchCipher, SearchKey,
};
use sealsearch::errors::EngineError;
use sealsearch::types::{DecryptedMessageContent, Participant};

fn sample() -> DecryptedMessageContent {
    DecryptedMessageContent {
        subject: "Quarterly report".into(),
        sender: Participant::new("Alice", "alice@example.com"),
        to_list: vec![Participant::new("Bob", "bob@example.com")],
        cc_list: vec![Participant::new("Carol", "carol@example.com")],
        bcc_list: Vec::new(),
        body: "Numbers attached. Ünïcödé ✓".into(),
    }
}

#[test]
fn decrypt_returns_what_was_encrypted() {
    let cipher = SearchCipher::new(&SearchKey::generate());
    for content in [sample(), DecryptedMessageContent::default()] {
        let payload = cipher.encrypt(&content).unwrap();
        assert_eq!(payload.size as usize, base64_len(&payload.ciphertext));
        assert_eq!(cipher.decrypt(&payload.ciphertext, &payload.iv).unwrap(), content);
    }
}

#[test]
fn every_encryption_uses_a_fresh_nonce() {
    let cipher = SearchCipher::new(&SearchKey::generate());
    let a = cipher.encrypt(&sample()).unwrap();
    let b = cipher.encrypt(&sample()).unwrap();
    assert_ne!(a.iv, b.iv);
    assert_ne!(a.ciphertext, b.ciphertext);
}

#[test]
fn wrong_key_is_a_decryption_error() {
    let payload = SearchCipher::new(&SearchKey::generate())
        .encrypt(&sample())
        .unwrap();
    let other = SearchCipher::new(&SearchKey::generate());
    let err = other.decrypt(&payload.ciphertext, &payload.iv).unwrap_err();
    assert!(matches!(err, EngineError::Decryption(_)));
    assert!(err.is_per_message());
}

#[test]
fn malformed_input_is_a_decryption_error() {
    let cipher = SearchCipher::new(&SearchKey::generate());
    let payload = cipher.encrypt(&sample()).unwrap();
    assert!(matches!(
        cipher.decrypt("not base64!", &payload.iv),
        Err(EngineError::Decryption(_))
    ));
    assert!(matches!(
        cipher.decrypt(&payload.ciphertext, "AAAA"),
        Err(EngineError::Decryption(_))
    ));
}

#[test]
fn key_is_created_once_and_reused() {
    let storage = MemoryStorage::new();
    assert!(load_key(&storage, "alice").unwrap().is_none());

    let first = get_or_create_key(&storage, "alice").unwrap();
    let again = get_or_create_key(&storage, "alice").unwrap();
    assert_eq!(first, again);

    let bob = get_or_create_key(&storage, "bob").unwrap();
    assert_ne!(first, bob);
}

#[test]
fn destroyed_key_is_replaced_by_a_new_one() {
    let storage = MemoryStorage::new();
    let first = get_or_create_key(&storage, "alice").unwrap();
    destroy_key(&storage, "alice").unwrap();
    destroy_key(&storage, "alice").unwrap();
    assert!(load_key(&storage, "alice").unwrap().is_none());
    assert_ne!(get_or_create_key(&storage, "alice").unwrap(), first);
}

#[test]
fn key_debug_output_is_redacted() {
    let key = SearchKey::from_bytes(&[7u8; 32]).unwrap();
    assert_eq!(format!("{key:?}"), "SearchKey(<redacted>)");
    assert!(SearchKey::from_bytes(&[1u8; 16]).is_err());
}

fn base64_len(encoded: &str) -> usize {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .unwrap()
        .len()
}
