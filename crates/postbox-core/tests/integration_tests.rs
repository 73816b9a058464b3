//! Integration tests for postbox-core.
//!
//! These tests drive the MessageExchange end to end: postbox management,
//! sending and updating messages, webreference caching through a mock
//! remote source, receipts, and the reqwest-backed source against a raw
//! TCP responder.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use postbox_core::{
    CoreError, EnvelopeHeader, ExchangeConfig, ExchangeConfigBuilder, FetchRequest,
    HashAlgorithm, KeyList, MessageExchange, MessageUpdate, NewReference, PostboxId,
    PostboxOptions, ReceiptState, Recipient, RecipientPrivateKey, ReferenceAccess, ReferenceType,
    RemoteBody, RemoteSource, RequestContext, SendOptions, TrackerTarget,
};
use postbox_crypto::encode_to_vec;
use postbox_protocol::{Attestation, ProtocolError};

const ALGO: HashAlgorithm = HashAlgorithm::Sha512;

// ============================================================================
// Fixtures
// ============================================================================

fn keys() -> &'static [RecipientPrivateKey; 3] {
    static KEYS: OnceLock<[RecipientPrivateKey; 3]> = OnceLock::new();
    KEYS.get_or_init(|| {
        [
            RecipientPrivateKey::generate(2048).unwrap(),
            RecipientPrivateKey::generate(2048).unwrap(),
            RecipientPrivateKey::generate(2048).unwrap(),
        ]
    })
}

fn public_pem(private: &RecipientPrivateKey) -> Vec<u8> {
    private.public_key().unwrap().raw().to_vec()
}

fn fingerprint(private: &RecipientPrivateKey) -> String {
    private.public_key().unwrap().fingerprint(ALGO).unwrap()
}

fn recipient(private: &RecipientPrivateKey) -> Recipient {
    Recipient::new(private.clone(), ALGO).unwrap()
}

#[derive(Default)]
struct MockState {
    body: Vec<u8>,
    declared: Option<u64>,
    failing: bool,
    delay: Duration,
    referers: Vec<String>,
}

/// Remote source serving one body and counting requests.
#[derive(Default)]
struct MockSource {
    state: Mutex<MockState>,
    requests: AtomicUsize,
}

impl MockSource {
    fn serving(body: &[u8]) -> Arc<Self> {
        let source = Self::default();
        source.set(|state| {
            state.body = body.to_vec();
            state.declared = Some(body.len() as u64);
        });
        Arc::new(source)
    }

    fn set(&self, change: impl FnOnce(&mut MockState)) {
        change(&mut self.state.lock().unwrap());
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn referers(&self) -> Vec<String> {
        self.state.lock().unwrap().referers.clone()
    }
}

struct MockBody {
    chunks: Vec<Bytes>,
    declared: Option<u64>,
}

#[async_trait]
impl RemoteBody for MockBody {
    fn content_length(&self) -> Option<u64> {
        self.declared
    }

    async fn next_chunk(&mut self) -> postbox_core::Result<Option<Bytes>> {
        if self.chunks.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.chunks.remove(0)))
        }
    }
}

#[async_trait]
impl RemoteSource for MockSource {
    async fn get(&self, request: &FetchRequest) -> postbox_core::Result<Box<dyn RemoteBody>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let (body, declared, failing, delay) = {
            let mut state = self.state.lock().unwrap();
            state.referers.push(request.referer.clone());
            (state.body.clone(), state.declared, state.failing, state.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(CoreError::RemoteUnavailable("connection refused".into()));
        }
        Ok(Box::new(MockBody {
            chunks: body.chunks(7).map(Bytes::copy_from_slice).collect(),
            declared,
        }))
    }
}

fn test_config() -> ExchangeConfigBuilder {
    ExchangeConfigBuilder::new()
        .with_in_memory_storage()
        .with_fetch_chunk_size(16)
}

fn exchange_with(config: ExchangeConfig, source: &Arc<MockSource>) -> MessageExchange {
    let source: Arc<dyn RemoteSource> = source.clone();
    MessageExchange::with_source(config, source).expect("Failed to open exchange")
}

fn test_exchange() -> MessageExchange {
    exchange_with(test_config().build(), &MockSource::serving(b""))
}

/// Create a postbox holding all `keys`, with signatures from `signers`.
fn signed_postbox(
    exchange: &MessageExchange,
    owner: &str,
    keys: &[&RecipientPrivateKey],
    signers: &[&RecipientPrivateKey],
) -> PostboxId {
    let postbox = exchange
        .create_postbox(owner, PostboxOptions::default())
        .unwrap();
    for key in keys {
        exchange.add_key(postbox.id, &public_pem(key)).unwrap();
    }
    let info = exchange.postbox_info(postbox.id).unwrap();
    let attestation = Attestation::from_b64(info.attestation.as_deref().unwrap()).unwrap();
    for signer in signers {
        let signature = signer.sign_attestation(attestation.as_bytes(), ALGO).unwrap();
        exchange
            .set_signature(postbox.id, &fingerprint(signer), Some(&signature))
            .unwrap();
    }
    postbox.id
}

/// Envelope plus key list for `recipients`, as a sender would publish it.
fn published(plaintext: &[u8], recipients: &[&RecipientPrivateKey]) -> (Vec<u8>, KeyList) {
    let (key, envelope) = encode_to_vec(plaintext, &EnvelopeHeader::default()).unwrap();
    let mut key_list = KeyList::new();
    for private in recipients {
        let public = private.public_key().unwrap();
        key_list
            .insert(
                public.fingerprint(ALGO).unwrap(),
                public.wrap_key(&key, ALGO).unwrap(),
            )
            .unwrap();
    }
    (envelope, key_list)
}

fn message_reference(key_list: KeyList) -> NewReference {
    NewReference {
        url: "https://files.example/envelope".into(),
        rtype: ReferenceType::Message,
        key_list,
        hash_algorithm: "SHA512".into(),
        persistent_sender: false,
    }
}

fn context() -> RequestContext {
    RequestContext::new("https://box.example", "/references/1")
}

// ============================================================================
// Postbox Management
// ============================================================================

mod postboxes {
    use super::*;

    #[test]
    fn test_one_postbox_per_owner() {
        let exchange = test_exchange();
        exchange
            .create_postbox("alice", PostboxOptions::default())
            .unwrap();
        let result = exchange.create_postbox("alice", PostboxOptions::default());
        assert_eq!(result.unwrap_err().status().code(), 409);
    }

    #[test]
    fn test_attestation_follows_key_set() {
        let [a, b, _] = keys();
        let exchange = test_exchange();
        let postbox = exchange
            .create_postbox("alice", PostboxOptions::default())
            .unwrap();
        assert!(exchange.postbox_info(postbox.id).unwrap().attestation.is_none());

        exchange.add_key(postbox.id, &public_pem(a)).unwrap();
        let one = exchange.postbox_info(postbox.id).unwrap().attestation;

        exchange.add_key(postbox.id, &public_pem(b)).unwrap();
        let two = exchange.postbox_info(postbox.id).unwrap().attestation;
        assert_ne!(one, two);
        assert_eq!(
            two.as_deref(),
            Some(
                Attestation::compute(ALGO, [fingerprint(a), fingerprint(b)])
                    .unwrap()
                    .to_b64()
                    .as_str()
            )
        );

        exchange.remove_key(postbox.id, &fingerprint(b)).unwrap();
        assert_eq!(exchange.postbox_info(postbox.id).unwrap().attestation, one);

        exchange.remove_key(postbox.id, &fingerprint(a)).unwrap();
        assert!(exchange.postbox_info(postbox.id).unwrap().attestation.is_none());
    }

    #[test]
    fn test_add_key_idempotent() {
        let [a, _, _] = keys();
        let exchange = test_exchange();
        let postbox = exchange
            .create_postbox("alice", PostboxOptions::default())
            .unwrap();
        let first = exchange.add_key(postbox.id, &public_pem(a)).unwrap();
        let second = exchange.add_key(postbox.id, &public_pem(a)).unwrap();
        assert_eq!(first, second);
        assert_eq!(exchange.postbox_info(postbox.id).unwrap().keys.len(), 1);
    }

    #[test]
    fn test_add_invalid_key() {
        let exchange = test_exchange();
        let postbox = exchange
            .create_postbox("alice", PostboxOptions::default())
            .unwrap();
        let err = exchange.add_key(postbox.id, b"not a key").unwrap_err();
        assert_eq!(err.status().code(), 400);
    }

    #[test]
    fn test_signatures_go_stale_on_key_change() {
        let [a, b, _] = keys();
        let exchange = test_exchange();
        let postbox = signed_postbox(&exchange, "alice", &[a], &[a]);
        let info = exchange.postbox_info(postbox).unwrap();
        assert!(info.keys[0].signature_valid);

        exchange.add_key(postbox, &public_pem(b)).unwrap();
        let info = exchange.postbox_info(postbox).unwrap();
        assert!(info.keys.iter().all(|k| !k.signature_valid));
    }

    #[test]
    fn test_rejects_bad_signature() {
        let [a, b, _] = keys();
        let exchange = test_exchange();
        let postbox = signed_postbox(&exchange, "alice", &[a], &[]);
        let attestation = exchange.postbox_info(postbox).unwrap().attestation.unwrap();
        let attestation = Attestation::from_b64(&attestation).unwrap();
        let forged = b.sign_attestation(attestation.as_bytes(), ALGO).unwrap();

        let err = exchange
            .set_signature(postbox, &fingerprint(a), Some(&forged))
            .unwrap_err();
        assert_eq!(err.status().code(), 400);
        assert!(exchange.postbox_info(postbox).unwrap().keys[0].signature.is_none());
    }
}

// ============================================================================
// Sending and Receiving Messages
// ============================================================================

mod messages {
    use super::*;

    #[tokio::test]
    async fn test_hello_to_two_recipients() {
        let [a, b, _] = keys();
        let exchange = test_exchange();
        exchange
            .create_postbox("sender", PostboxOptions::default())
            .unwrap();

        let report = exchange
            .send(
                "sender",
                &b"hello"[..],
                &[public_pem(a), public_pem(b)],
                SendOptions::default(),
            )
            .unwrap();
        assert_eq!(report.key_list.len(), 2);
        assert!(report.is_complete());
        assert_eq!(report.tokens.len(), 1);

        let view = exchange
            .view_message(report.message_id, &[fingerprint(a)])
            .unwrap();
        assert!(!view.all_received);
        let (header, plaintext) = recipient(a)
            .open(view.body, &view.message.key_list)
            .unwrap()
            .read_to_vec()
            .unwrap();
        assert_eq!(plaintext, b"hello");
        assert_eq!(header.get("Type"), Some("message"));

        let target = TrackerTarget::Message(report.message_id);
        assert!(exchange.mark_received(target, &fingerprint(a)).await.unwrap());
        assert!(!exchange.mark_received(target, &fingerprint(a)).await.unwrap());

        let tracker = exchange.tracker(target).unwrap();
        assert_eq!(tracker.state(&fingerprint(a)), Some(ReceiptState::Received));
        assert_eq!(tracker.state(&fingerprint(b)), Some(ReceiptState::Unread));

        let view = exchange
            .view_message(report.message_id, &[fingerprint(a)])
            .unwrap();
        assert!(view.all_received);
        let view = exchange
            .view_message(report.message_id, &[fingerprint(a), fingerprint(b)])
            .unwrap();
        assert!(!view.all_received);
    }

    #[test]
    fn test_owner_id_with_space() {
        let [a, _, _] = keys();
        let exchange = test_exchange();
        exchange
            .create_postbox("alice smith", PostboxOptions::default())
            .unwrap();

        let report = exchange
            .send("alice smith", &b"hello"[..], &[public_pem(a)], SendOptions::default())
            .unwrap();
        assert_eq!(exchange.db().used_space("alice smith").unwrap(), report.size);

        let view = exchange
            .view_message(report.message_id, &[fingerprint(a)])
            .unwrap();
        let (_, plaintext) = recipient(a)
            .open(view.body, &view.message.key_list)
            .unwrap()
            .read_to_vec()
            .unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_send_without_postbox() {
        let [a, _, _] = keys();
        let exchange = test_exchange();
        let err = exchange
            .send("nobody", &b"x"[..], &[public_pem(a)], SendOptions::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::NoPostbox(_)));
        assert_eq!(err.status().code(), 404);
    }

    #[test]
    fn test_partial_recipients_reported() {
        let [a, _, _] = keys();
        let exchange = test_exchange();
        exchange
            .create_postbox("sender", PostboxOptions::default())
            .unwrap();

        let recipients = vec![b"garbage".to_vec(), public_pem(a)];
        let report = exchange
            .send("sender", &b"x"[..], &recipients, SendOptions::default())
            .unwrap();
        assert_eq!(report.key_list.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 0);
        assert!(report.key_list.contains(&fingerprint(a)));
    }

    #[test]
    fn test_require_all_recipients() {
        let [a, _, _] = keys();
        let exchange = exchange_with(
            test_config().require_all_recipients().build(),
            &MockSource::serving(b""),
        );
        exchange
            .create_postbox("sender", PostboxOptions::default())
            .unwrap();

        let recipients = vec![public_pem(a), b"garbage".to_vec()];
        let err = exchange
            .send("sender", &b"x"[..], &recipients, SendOptions::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::PartialKeyList { failed: 1 }));
        assert_eq!(exchange.db().used_space("sender").unwrap(), 0);
    }

    #[test]
    fn test_no_usable_recipient() {
        let exchange = test_exchange();
        exchange
            .create_postbox("sender", PostboxOptions::default())
            .unwrap();
        let err = exchange
            .send("sender", &b"x"[..], &[b"garbage".to_vec()], SendOptions::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::Protocol(ProtocolError::EmptyKeyList)));
    }

    #[test]
    fn test_send_payload_limit() {
        let [a, _, _] = keys();
        let exchange = exchange_with(
            test_config().with_max_payload_size(256).build(),
            &MockSource::serving(b""),
        );
        exchange
            .create_postbox("sender", PostboxOptions::default())
            .unwrap();
        let err = exchange
            .send("sender", &[0u8; 1024][..], &[public_pem(a)], SendOptions::default())
            .unwrap_err();
        assert_eq!(err.status().code(), 413);
        assert_eq!(exchange.db().used_space("sender").unwrap(), 0);
    }

    #[test]
    fn test_send_charges_quota() {
        let [a, _, _] = keys();
        let exchange = test_exchange();
        exchange
            .create_postbox("sender", PostboxOptions::default())
            .unwrap();
        let report = exchange
            .send("sender", &b"hello"[..], &[public_pem(a)], SendOptions::default())
            .unwrap();
        assert_eq!(exchange.db().used_space("sender").unwrap(), report.size);
    }

    #[tokio::test]
    async fn test_receiver_tokens() {
        let [a, _, _] = keys();
        let exchange = test_exchange();
        exchange
            .create_postbox("sender", PostboxOptions::default())
            .unwrap();
        let report = exchange
            .send(
                "sender",
                &b"hello"[..],
                &[public_pem(a)],
                SendOptions {
                    amount_tokens: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(report.tokens.len(), 2);
        assert_ne!(report.tokens[0], report.tokens[1]);

        let id = report.message_id;
        assert!(exchange.mark_token_received(id, &report.tokens[0]).await.unwrap());
        assert!(!exchange.mark_token_received(id, &report.tokens[0]).await.unwrap());
        let err = exchange.mark_token_received(id, "unknown").await.unwrap_err();
        assert_eq!(err.status().code(), 403);

        let err = exchange
            .update(id, MessageUpdate::KeyList(report.key_list.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ImmutableAfterReceipt(_)));
    }

    #[tokio::test]
    async fn test_mark_unknown_recipient() {
        let [a, b, _] = keys();
        let exchange = test_exchange();
        exchange
            .create_postbox("sender", PostboxOptions::default())
            .unwrap();
        let report = exchange
            .send("sender", &b"hello"[..], &[public_pem(a)], SendOptions::default())
            .unwrap();
        let err = exchange
            .mark_received(TrackerTarget::Message(report.message_id), &fingerprint(b))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Protocol(ProtocolError::UnknownRecipient(_))
        ));

        let err = exchange
            .mark_received(TrackerTarget::Message(9999), &fingerprint(a))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::MessageNotFound(9999)));
    }

    #[tokio::test]
    async fn test_delete_message_refunds_quota() {
        let [a, _, _] = keys();
        let exchange = test_exchange();
        exchange
            .create_postbox("sender", PostboxOptions::default())
            .unwrap();
        let report = exchange
            .send("sender", &b"hello"[..], &[public_pem(a)], SendOptions::default())
            .unwrap();

        exchange.delete_message(report.message_id).await.unwrap();
        assert_eq!(exchange.db().used_space("sender").unwrap(), 0);
        assert!(matches!(
            exchange.view_message(report.message_id, &[fingerprint(a)]),
            Err(CoreError::MessageNotFound(_))
        ));
        assert!(matches!(
            exchange.delete_message(report.message_id).await,
            Err(CoreError::MessageNotFound(_))
        ));
    }
}

// ============================================================================
// Updates
// ============================================================================

mod updates {
    use super::*;

    fn sent(exchange: &MessageExchange, own_hash: Option<String>) -> postbox_core::SendReport {
        let [a, b, _] = keys();
        exchange
            .create_postbox("sender", PostboxOptions::default())
            .unwrap();
        exchange
            .send(
                "sender",
                &b"first"[..],
                &[public_pem(a), public_pem(b)],
                SendOptions {
                    own_hash,
                    ..Default::default()
                },
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_content_update_reencrypts() {
        let [a, b, _] = keys();
        let exchange = test_exchange();
        let report = sent(&exchange, None);

        let updated = exchange
            .update(
                report.message_id,
                MessageUpdate::Content {
                    plaintext: b"second".to_vec(),
                    recipients: vec![public_pem(a), public_pem(b)],
                    header: EnvelopeHeader::default(),
                },
            )
            .await
            .unwrap();
        assert_ne!(updated.key_list, report.key_list);
        assert!(updated.tokens.is_empty());
        assert_eq!(exchange.db().used_space("sender").unwrap(), updated.size);

        let view = exchange.view_message(report.message_id, &[fingerprint(a)]).unwrap();
        let (_, plaintext) = recipient(b)
            .open(view.body, &view.message.key_list)
            .unwrap()
            .read_to_vec()
            .unwrap();
        assert_eq!(plaintext, b"second");

        // The old wrapped key no longer opens the new envelope.
        let view = exchange.view_message(report.message_id, &[fingerprint(a)]).unwrap();
        assert!(recipient(a).open(view.body, &report.key_list).is_err());
    }

    fn content(plaintext: &[u8]) -> MessageUpdate {
        let [a, _, _] = keys();
        MessageUpdate::Content {
            plaintext: plaintext.to_vec(),
            recipients: vec![public_pem(a)],
            header: EnvelopeHeader::default(),
        }
    }

    #[tokio::test]
    async fn test_content_update_at_quota_limit() {
        let [a, _, _] = keys();
        let size = sent(&test_exchange(), None).size;
        let exchange = exchange_with(
            test_config().with_max_used_space(size).build(),
            &MockSource::serving(b""),
        );
        let report = sent(&exchange, None);
        assert_eq!(exchange.db().used_space("sender").unwrap(), size);

        let updated = exchange
            .update(report.message_id, content(b"again"))
            .await
            .unwrap();
        assert_eq!(updated.size, size);
        assert_eq!(exchange.db().used_space("sender").unwrap(), size);

        let err = exchange
            .update(report.message_id, content(b"longer than the limit allows"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded { .. }));
        assert_eq!(exchange.db().used_space("sender").unwrap(), size);

        let view = exchange.view_message(report.message_id, &[fingerprint(a)]).unwrap();
        let (_, plaintext) = recipient(a)
            .open(view.body, &view.message.key_list)
            .unwrap()
            .read_to_vec()
            .unwrap();
        assert_eq!(plaintext, b"again");
    }

    #[tokio::test]
    async fn test_key_list_update_resets_tracker() {
        let [a, _, _] = keys();
        let exchange = test_exchange();
        let report = sent(&exchange, None);

        let mut narrowed = KeyList::new();
        let fp = fingerprint(a);
        narrowed
            .insert(fp.clone(), report.key_list.get(&fp).unwrap())
            .unwrap();
        exchange
            .update(report.message_id, MessageUpdate::KeyList(narrowed))
            .await
            .unwrap();

        let tracker = exchange.tracker(TrackerTarget::Message(report.message_id)).unwrap();
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.state(&fp), Some(ReceiptState::Unread));
    }

    #[tokio::test]
    async fn test_immutable_after_receipt() {
        let [a, b, _] = keys();
        let exchange = test_exchange();
        let report = sent(&exchange, None);
        exchange
            .mark_received(TrackerTarget::Message(report.message_id), &fingerprint(b))
            .await
            .unwrap();

        let err = exchange
            .update(report.message_id, MessageUpdate::KeyList(report.key_list.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ImmutableAfterReceipt(_)));
        assert_eq!(err.status().code(), 409);

        let err = exchange
            .update(
                report.message_id,
                MessageUpdate::Content {
                    plaintext: b"changed".to_vec(),
                    recipients: vec![public_pem(a)],
                    header: EnvelopeHeader::default(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ImmutableAfterReceipt(_)));

        let view = exchange.view_message(report.message_id, &[fingerprint(a)]).unwrap();
        let (_, plaintext) = recipient(a)
            .open(view.body, &view.message.key_list)
            .unwrap()
            .read_to_vec()
            .unwrap();
        assert_eq!(plaintext, b"first");
    }

    #[tokio::test]
    async fn test_sender_echo_does_not_freeze() {
        let [a, _, _] = keys();
        let exchange = test_exchange();
        let report = sent(&exchange, Some(fingerprint(a)));

        let tracker = exchange.tracker(TrackerTarget::Message(report.message_id)).unwrap();
        assert_eq!(tracker.state(&fingerprint(a)), Some(ReceiptState::Received));
        assert!(!tracker.was_retrieved());

        exchange
            .update(report.message_id, MessageUpdate::KeyList(report.key_list.clone()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unshared_postbox_rejects_updates() {
        let [a, _, _] = keys();
        let exchange = test_exchange();
        exchange
            .create_postbox(
                "sender",
                PostboxOptions {
                    shared: false,
                    ..Default::default()
                },
            )
            .unwrap();
        let report = exchange
            .send("sender", &b"x"[..], &[public_pem(a)], SendOptions::default())
            .unwrap();
        let err = exchange
            .update(report.message_id, MessageUpdate::KeyList(report.key_list))
            .await
            .unwrap_err();
        assert_eq!(err.status().code(), 403);
    }
}

// ============================================================================
// Webreferences
// ============================================================================

mod references {
    use super::*;

    #[test]
    fn test_push_with_signed_keys() {
        let [a, b, _] = keys();
        let exchange = test_exchange();
        let postbox = signed_postbox(&exchange, "alice", &[a, b], &[a, b]);
        let (_, key_list) = published(b"hi", &[a, b]);

        let record = exchange
            .push_reference(postbox, message_reference(key_list))
            .unwrap();
        assert!(record.cached_size.is_none());

        let tracker = exchange.tracker(TrackerTarget::Reference(record.id)).unwrap();
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.received_count(), 0);
    }

    #[test]
    fn test_push_rejects_unsigned_entry() {
        let [a, b, _] = keys();
        let exchange = test_exchange();
        let postbox = signed_postbox(&exchange, "alice", &[a, b], &[a]);
        let (_, key_list) = published(b"hi", &[a, b]);

        let err = exchange
            .push_reference(postbox, message_reference(key_list))
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Protocol(ProtocolError::KeyListMismatch {
                expected: 2,
                actual: 1
            })
        ));
        assert_eq!(err.status().code(), 422);
    }

    #[test]
    fn test_push_rejects_foreign_key() {
        let [a, _, c] = keys();
        let exchange = test_exchange();
        let postbox = signed_postbox(&exchange, "alice", &[a], &[a]);
        let (_, key_list) = published(b"hi", &[a, c]);

        let err = exchange
            .push_reference(postbox, message_reference(key_list))
            .unwrap_err();
        assert_eq!(err.status().code(), 422);
    }

    #[test]
    fn test_push_rejects_empty_key_list() {
        let [a, _, _] = keys();
        let exchange = test_exchange();
        let postbox = signed_postbox(&exchange, "alice", &[a], &[a]);
        let err = exchange
            .push_reference(postbox, message_reference(KeyList::new()))
            .unwrap_err();
        assert!(matches!(err, CoreError::Protocol(ProtocolError::EmptyKeyList)));
    }

    #[test]
    fn test_push_policy_and_algorithm() {
        let [a, _, _] = keys();
        let exchange = test_exchange();
        let postbox = exchange
            .create_postbox(
                "alice",
                PostboxOptions {
                    only_persistent: true,
                    ..Default::default()
                },
            )
            .unwrap();
        exchange.add_key(postbox.id, &public_pem(a)).unwrap();
        let (_, key_list) = published(b"hi", &[a]);

        let err = exchange
            .push_reference(postbox.id, message_reference(key_list.clone()))
            .unwrap_err();
        assert_eq!(err.status().code(), 403);

        let mut bad_algo = message_reference(key_list);
        bad_algo.persistent_sender = true;
        bad_algo.hash_algorithm = "MD5".into();
        let err = exchange.push_reference(postbox.id, bad_algo).unwrap_err();
        assert_eq!(err.status().code(), 400);
    }

    #[tokio::test]
    async fn test_redirect_and_content_types() {
        let [a, _, _] = keys();
        let source = MockSource::serving(b"unused");
        let exchange = exchange_with(test_config().build(), &source);
        let postbox = signed_postbox(&exchange, "alice", &[a], &[a]);
        let (_, key_list) = published(b"hi", &[a]);

        let mut redirect = message_reference(key_list.clone());
        redirect.rtype = ReferenceType::Redirect;
        let redirect = exchange.push_reference(postbox, redirect).unwrap();
        match exchange.access_reference(redirect.id, &context()).await.unwrap() {
            ReferenceAccess::Redirect { url, key_list: served } => {
                assert_eq!(url, "https://files.example/envelope");
                assert_eq!(served, key_list);
            }
            other => panic!("expected redirect, got {:?}", other),
        }

        let mut content = message_reference(key_list);
        content.rtype = ReferenceType::Content;
        let content = exchange.push_reference(postbox, content).unwrap();
        let err = exchange
            .access_reference(content.id, &context())
            .await
            .unwrap_err();
        assert_eq!(err.status().code(), 501);

        assert_eq!(source.requests(), 0);
    }

    #[tokio::test]
    async fn test_unknown_reference_is_gone() {
        let exchange = test_exchange();
        let err = exchange.access_reference(42, &context()).await.unwrap_err();
        assert!(matches!(err, CoreError::ReferenceGone(42)));
        assert_eq!(err.status().code(), 410);
    }
}

// ============================================================================
// Content Cache
// ============================================================================

mod cache {
    use super::*;

    /// Exchange with a signed postbox and a message reference to `envelope`.
    fn cached_setup(
        config: ExchangeConfig,
        envelope: &[u8],
        key_list: KeyList,
    ) -> (MessageExchange, Arc<MockSource>, u64) {
        let [a, b, _] = keys();
        let source = MockSource::serving(envelope);
        let exchange = exchange_with(config, &source);
        let postbox = signed_postbox(&exchange, "alice", &[a, b], &[a, b]);
        let reference = exchange
            .push_reference(postbox, message_reference(key_list))
            .unwrap();
        (exchange, source, reference.id)
    }

    #[tokio::test]
    async fn test_fetch_then_serve_from_cache() {
        let [a, b, _] = keys();
        let (envelope, key_list) = published(b"hello reference", &[a, b]);
        let (exchange, source, id) = cached_setup(test_config().build(), &envelope, key_list.clone());

        let content = exchange.fetch(id, &context()).await.unwrap();
        assert_eq!(content.size, envelope.len() as u64);
        let (name, value) = content.keylist_header().unwrap();
        assert_eq!(name, "X-KEYLIST");
        assert_eq!(KeyList::from_json(&value).unwrap(), key_list);

        let (_, plaintext) = recipient(a)
            .open(content.body, &key_list)
            .unwrap()
            .read_to_vec()
            .unwrap();
        assert_eq!(plaintext, b"hello reference");

        let again = exchange.fetch(id, &context()).await.unwrap();
        assert_eq!(again.size, envelope.len() as u64);
        assert_eq!(source.requests(), 1);
        assert_eq!(source.referers(), vec!["https://box.example/references/1"]);
        assert_eq!(exchange.db().used_space("alice").unwrap(), envelope.len() as u64);

        let target = TrackerTarget::Reference(id);
        assert!(exchange.mark_received(target, &fingerprint(b)).await.unwrap());
        assert_eq!(
            exchange.tracker(target).unwrap().state(&fingerprint(a)),
            Some(ReceiptState::Unread)
        );
    }

    #[tokio::test]
    async fn test_fetch_for_owner_id_with_space() {
        let [a, b, _] = keys();
        let (envelope, key_list) = published(b"spaced owner", &[a, b]);
        let source = MockSource::serving(&envelope);
        let exchange = exchange_with(test_config().build(), &source);
        let postbox = signed_postbox(&exchange, "alice smith", &[a, b], &[a, b]);
        let reference = exchange
            .push_reference(postbox, message_reference(key_list.clone()))
            .unwrap();

        let content = exchange.fetch(reference.id, &context()).await.unwrap();
        let (_, plaintext) = recipient(b)
            .open(content.body, &key_list)
            .unwrap()
            .read_to_vec()
            .unwrap();
        assert_eq!(plaintext, b"spaced owner");
        assert_eq!(
            exchange.db().used_space("alice smith").unwrap(),
            envelope.len() as u64
        );

        exchange.revoke_reference(reference.id).await.unwrap();
        assert_eq!(exchange.db().used_space("alice smith").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_single_request() {
        let [a, b, _] = keys();
        let (envelope, key_list) = published(b"only once", &[a, b]);
        let (exchange, source, id) = cached_setup(test_config().build(), &envelope, key_list);
        source.set(|state| state.delay = Duration::from_millis(50));

        let ctx = context();
        let (first, second) = tokio::join!(exchange.fetch(id, &ctx), exchange.fetch(id, &ctx));
        let first = first.unwrap();
        let second = second.unwrap();

        assert_eq!(source.requests(), 1);
        assert_eq!(first.size, second.size);
        assert_eq!(exchange.db().used_space("alice").unwrap(), envelope.len() as u64);
    }

    #[tokio::test]
    async fn test_declared_too_large_caches_nothing() {
        let [a, b, _] = keys();
        let (envelope, key_list) = published(b"big", &[a, b]);
        let (exchange, source, id) = cached_setup(test_config().build(), &envelope, key_list);
        source.set(|state| state.declared = Some(u64::MAX));

        let err = exchange.fetch(id, &context()).await.unwrap_err();
        assert!(matches!(err, CoreError::PayloadTooLarge { .. }));
        assert_eq!(err.status().code(), 413);
        assert_eq!(exchange.db().used_space("alice").unwrap(), 0);
        let record = exchange.db().get_reference(id).unwrap().unwrap();
        assert!(record.cached_size.is_none());
        assert!(record.cached_content.is_none());
    }

    #[tokio::test]
    async fn test_missing_length_rejected() {
        let [a, b, _] = keys();
        let (envelope, key_list) = published(b"no length", &[a, b]);
        let (exchange, source, id) = cached_setup(test_config().build(), &envelope, key_list);
        source.set(|state| state.declared = None);

        let err = exchange.fetch(id, &context()).await.unwrap_err();
        assert!(matches!(err, CoreError::PayloadTooLarge { size: None, .. }));
    }

    #[tokio::test]
    async fn test_body_longer_than_declared() {
        let [a, b, _] = keys();
        let (envelope, key_list) = published(b"overrun", &[a, b]);
        let (exchange, source, id) = cached_setup(test_config().build(), &envelope, key_list);
        let declared = envelope.len() as u64 - 10;
        source.set(|state| state.declared = Some(declared));

        let err = exchange.fetch(id, &context()).await.unwrap_err();
        assert_eq!(err.status().code(), 413);
        assert_eq!(exchange.db().used_space("alice").unwrap(), 0);
        assert!(exchange.db().get_reference(id).unwrap().unwrap().cached_size.is_none());
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let [a, b, _] = keys();
        let (envelope, key_list) = published(&[7u8; 600], &[a, b]);
        let config = test_config()
            .with_max_payload_size(1024)
            .with_max_used_space(1024)
            .build();
        let (exchange, _source, first) = cached_setup(config, &envelope, key_list.clone());
        let postbox = exchange.db().get_reference(first).unwrap().unwrap().postbox_id;
        let second = exchange
            .push_reference(postbox, message_reference(key_list))
            .unwrap()
            .id;

        exchange.fetch(first, &context()).await.unwrap();
        let err = exchange.fetch(second, &context()).await.unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded { .. }));
        assert_eq!(err.status().code(), 413);
        assert_eq!(exchange.db().used_space("alice").unwrap(), envelope.len() as u64);
        assert!(exchange.db().get_reference(second).unwrap().unwrap().cached_size.is_none());
    }

    #[tokio::test]
    async fn test_remote_failure_is_retryable() {
        let [a, b, _] = keys();
        let (envelope, key_list) = published(b"flaky", &[a, b]);
        let (exchange, source, id) = cached_setup(test_config().build(), &envelope, key_list);
        source.set(|state| state.failing = true);

        let err = exchange.fetch(id, &context()).await.unwrap_err();
        assert_eq!(err.status().code(), 502);
        assert!(exchange.db().get_reference(id).unwrap().unwrap().cached_size.is_none());

        source.set(|state| state.failing = false);
        exchange.fetch(id, &context()).await.unwrap();
        assert_eq!(source.requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout() {
        let [a, b, _] = keys();
        let (envelope, key_list) = published(b"slow", &[a, b]);
        let config = test_config()
            .with_fetch_timeout(Duration::from_secs(1))
            .build();
        let (exchange, source, id) = cached_setup(config, &envelope, key_list);
        source.set(|state| state.delay = Duration::from_secs(60));

        let err = exchange.fetch(id, &context()).await.unwrap_err();
        assert!(matches!(err, CoreError::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn test_revoke_refunds_quota() {
        let [a, b, _] = keys();
        let (envelope, key_list) = published(b"revoked", &[a, b]);
        let (exchange, _source, id) = cached_setup(test_config().build(), &envelope, key_list);

        let content = exchange.fetch(id, &context()).await.unwrap();
        let token = content.reference.cached_content.clone().unwrap();
        let path = exchange
            .blobs()
            .slot_path(postbox_store::BlobArea::Cached, "alice", &token)
            .unwrap();
        assert!(path.exists());

        exchange.revoke_reference(id).await.unwrap();
        assert!(!path.exists());
        assert_eq!(exchange.db().used_space("alice").unwrap(), 0);
        let err = exchange.access_reference(id, &context()).await.unwrap_err();
        assert_eq!(err.status().code(), 410);
    }

    #[tokio::test]
    async fn test_delete_postbox_cascades() {
        let [a, b, _] = keys();
        let (envelope, key_list) = published(b"cascade", &[a, b]);
        let (exchange, _source, id) = cached_setup(test_config().build(), &envelope, key_list);
        exchange.fetch(id, &context()).await.unwrap();
        let report = exchange
            .send("alice", &b"outgoing"[..], &[public_pem(a)], SendOptions::default())
            .unwrap();
        assert!(exchange.db().used_space("alice").unwrap() > 0);

        let postbox = exchange.db().get_reference(id).unwrap().unwrap().postbox_id;
        exchange.delete_postbox(postbox).await.unwrap();

        assert_eq!(exchange.db().used_space("alice").unwrap(), 0);
        assert!(exchange.db().get_reference(id).unwrap().is_none());
        assert!(matches!(
            exchange.view_message(report.message_id, &[fingerprint(a)]),
            Err(CoreError::MessageNotFound(_))
        ));
        exchange
            .create_postbox("alice", PostboxOptions::default())
            .unwrap();
    }
}

// ============================================================================
// HTTP Source
// ============================================================================

mod http {
    use super::*;
    use postbox_core::HttpSource;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response and hand back the raw request.
    async fn respond_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{}/envelope", addr), handle)
    }

    #[tokio::test]
    async fn test_streams_body_with_referer() {
        let (url, server) = respond_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        let source = HttpSource::new(Duration::from_secs(5)).unwrap();
        let mut body = source
            .get(&FetchRequest {
                url,
                referer: "https://box.example/references/1".into(),
            })
            .await
            .unwrap();
        assert_eq!(body.content_length(), Some(5));

        let mut received = Vec::new();
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"hello");

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /envelope"));
        assert!(request.contains("referer: https://box.example/references/1"));
    }

    #[tokio::test]
    async fn test_error_status_unavailable() {
        let (url, _server) = respond_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let source = HttpSource::new(Duration::from_secs(5)).unwrap();
        let err = source
            .get(&FetchRequest {
                url,
                referer: "https://box.example/".into(),
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::RemoteUnavailable(_)));
        assert_eq!(err.status().code(), 502);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let source = HttpSource::new(Duration::from_secs(5)).unwrap();
        let result = source
            .get(&FetchRequest {
                url: format!("http://{}/gone", addr),
                referer: String::new(),
            })
            .await;
        assert!(matches!(result, Err(CoreError::RemoteUnavailable(_))));
    }
}

#[test]
fn test_recipient_over_cursor() {
    let [a, _, _] = keys();
    let (envelope, key_list) = published(b"cursor", &[a]);
    let (_, plaintext) = recipient(a)
        .open(Cursor::new(envelope), &key_list)
        .unwrap()
        .read_to_vec()
        .unwrap();
    assert_eq!(plaintext, b"cursor");
}
