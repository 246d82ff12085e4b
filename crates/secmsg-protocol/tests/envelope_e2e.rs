//! End-to-end envelope tests: encrypt → proof-of-work → validate →
//! decrypt, across both payload forms and the serialization boundary.

use std::sync::atomic::AtomicBool;

use secmsg_crypto::ecdh::generate_ephemeral_keypair;
use secmsg_crypto::hash::pubkey_key_id;
use secmsg_crypto::{PublicKey, SecretKey};
use secmsg_protocol::encrypt::{decrypt, encrypt, Sender};
use secmsg_protocol::pow::{set_hash, validate};
use secmsg_protocol::{SecureMessage, SMSG_HDR_LEN};
use secmsg_types::{Address, Result, SmsgError};

fn recipient() -> (SecretKey, PublicKey) {
    generate_ephemeral_keypair()
}

fn keyed_sender() -> (Sender, String) {
    let (secret, public) = generate_ephemeral_keypair();
    let address = Address::from_key_id(pubkey_key_id(&public));
    let rendered = address.to_string();
    (Sender::Keyed { address, secret }, rendered)
}

#[test]
fn anonymous_envelope_full_cycle() -> Result<()> {
    let (sk, pk) = recipient();
    let now = secmsg_types::unix_time();

    let mut message = encrypt(&Sender::Anonymous, &pk, b"hello", now)?;
    assert_eq!(message.header.version, 1);

    let running = AtomicBool::new(true);
    set_hash(&mut message.header, &message.payload, &running)?;
    validate(&message.header, &message.payload)?;

    // Across the wire: serialize, reparse, decrypt.
    let bytes = message.to_bytes();
    assert_eq!(bytes.len(), SMSG_HDR_LEN + message.payload.len());
    let parsed = SecureMessage::from_bytes(&bytes)?;

    let opened = decrypt(false, &sk, &parsed.header, &parsed.payload)?
        .expect("decrypt returns message data");
    assert_eq!(opened.plaintext, b"hello");
    assert_eq!(opened.from_address, "anon");
    Ok(())
}

#[test]
fn signed_envelope_full_cycle() -> Result<()> {
    let (sk, pk) = recipient();
    let (sender, from_str) = keyed_sender();
    let now = secmsg_types::unix_time();

    let mut message = encrypt(&sender, &pk, b"signed end to end", now)?;
    let running = AtomicBool::new(true);
    set_hash(&mut message.header, &message.payload, &running)?;
    validate(&message.header, &message.payload)?;

    let opened = decrypt(false, &sk, &message.header, &message.payload)?
        .expect("decrypt returns message data");
    assert_eq!(opened.plaintext, b"signed end to end");
    assert_eq!(opened.from_address, from_str);

    // The recovered sender key must hash back to the from-address.
    let (key_id, pubkey) = opened.sender_pubkey.expect("signed form carries the key");
    assert_eq!(pubkey_key_id(&pubkey), key_id);
    assert_eq!(Address::from_key_id(key_id).to_string(), from_str);
    Ok(())
}

#[test]
fn pow_validates_and_detects_checksum_damage() -> Result<()> {
    let (_, pk) = recipient();
    let now = secmsg_types::unix_time();

    // A ~300-byte envelope finds its nonce within bounded time.
    let mut message = encrypt(&Sender::Anonymous, &pk, &[0x77; 250], now)?;
    let running = AtomicBool::new(true);
    set_hash(&mut message.header, &message.payload, &running)?;
    validate(&message.header, &message.payload)?;

    message.header.hash[0] ^= 0x01;
    match validate(&message.header, &message.payload) {
        Err(SmsgError::ChecksumMismatch) => Ok(()),
        other => panic!("expected ChecksumMismatch, got {other:?}"),
    }
}

#[test]
fn validate_rejects_tampered_envelope_fields() -> Result<()> {
    let (_, pk) = recipient();
    let now = secmsg_types::unix_time();

    let mut message = encrypt(&Sender::Anonymous, &pk, b"bind all the header bytes", now)?;
    let running = AtomicBool::new(true);
    set_hash(&mut message.header, &message.payload, &running)?;

    // The admission hash covers every header byte past the checksum,
    // so a timestamp edit invalidates the stored checksum.
    let mut tampered = message.clone();
    tampered.header.timestamp += 1;
    assert!(validate(&tampered.header, &tampered.payload).is_err());

    let mut tampered = message.clone();
    tampered.header.iv[3] ^= 0x80;
    assert!(validate(&tampered.header, &tampered.payload).is_err());

    validate(&message.header, &message.payload)?;
    Ok(())
}
