use meshsync_types::{Error, Identity, IdentityCodec, NamespaceCodec, DEFAULT_NAMESPACE};
use proptest::prelude::*;

#[test]
fn default_namespace() {
    let codec = NamespaceCodec::default();
    assert_eq!(codec.namespace(), DEFAULT_NAMESPACE);
}

#[test]
fn encode_is_namespaced_hex() {
    let codec = NamespaceCodec::new("game");
    let id = Identity::new("alice").unwrap();
    assert_eq!(codec.encode(&id), "game-616c696365");
}

#[test]
fn encoded_id_is_transport_legal() {
    let codec = NamespaceCodec::default();
    let id = Identity::new("Zoë / table #3").unwrap();
    let encoded = codec.encode(&id);
    assert!(encoded.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    assert_eq!(codec.decode(&encoded).unwrap(), id);
}

#[test]
fn decode_rejects_foreign_namespace() {
    let ours = NamespaceCodec::new("game");
    let theirs = NamespaceCodec::new("chat");
    let encoded = theirs.encode(&Identity::new("alice").unwrap());
    assert!(matches!(
        ours.decode(&encoded),
        Err(Error::InvalidTransportId(_))
    ));
}

#[test]
fn decode_rejects_namespace_prefix_without_separator() {
    let codec = NamespaceCodec::new("game");
    assert!(codec.decode("gamer-616c696365").is_err());
}

#[test]
fn decode_rejects_bad_hex() {
    let codec = NamespaceCodec::new("game");
    assert!(matches!(
        codec.decode("game-zz"),
        Err(Error::InvalidTransportId(_))
    ));
}

#[test]
fn decode_rejects_invalid_utf8() {
    let codec = NamespaceCodec::new("game");
    assert!(codec.decode("game-ff").is_err());
}

#[test]
fn decode_rejects_empty_identity() {
    let codec = NamespaceCodec::new("game");
    assert!(matches!(
        codec.decode("game-"),
        Err(Error::InvalidIdentity(_))
    ));
}

proptest! {
    #[test]
    fn decode_inverts_encode(name in "[a-zA-Z0-9 _.-]{1,32}") {
        prop_assume!(!name.trim().is_empty());
        let codec = NamespaceCodec::default();
        let id = Identity::new(name).unwrap();
        prop_assert_eq!(codec.decode(&codec.encode(&id)).unwrap(), id);
    }
}
