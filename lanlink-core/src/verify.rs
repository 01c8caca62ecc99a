//! Address-verification handshake: answer a VerifyNode challenge, check a ReplyVerifyNode.

use std::net::SocketAddrV4;

use crate::identity::{open_detached, random_nonce, seal_detached, CryptoError, NodeId, PublicKey};
use crate::packet::{
    decode_verify_plaintext, encode_verify_plaintext, ReplyVerifyNode, VerifyNode,
};
use crate::tick;

/// A peer that proved it owns `public_key` and is reachable at the address it replied from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub public_key: PublicKey,
    pub node_id: NodeId,
    pub address: SocketAddrV4,
    /// Round trip in ticks between our challenge and its answer.
    pub delay: u32,
}

/// Encrypt the challenge's tick and claimed address back to the challenger.
/// `key` is the shared key with `challenge.sender_key`.
pub fn answer_challenge(
    key: &[u8; 32],
    challenge: &VerifyNode,
    local_public: &PublicKey,
) -> Result<ReplyVerifyNode, CryptoError> {
    let nonce = random_nonce();
    let mut ciphertext = encode_verify_plaintext(challenge.tick, challenge.claimed);
    let tag = seal_detached(key, &nonce, &mut ciphertext)?;
    Ok(ReplyVerifyNode {
        target: challenge.sender_key.node_id(),
        nonce,
        tag,
        ciphertext,
        sender_key: *local_public,
    })
}

/// Check an answer to one of our challenges.
///
/// `key` is the shared key with `reply.sender_key`, `from` the address the
/// reply actually arrived from, and `window` the largest accepted round trip.
pub fn check_reply(
    key: &[u8; 32],
    local_id: &NodeId,
    reply: &ReplyVerifyNode,
    from: SocketAddrV4,
    now: u32,
    window: u32,
) -> Result<Verified, VerifyError> {
    if reply.target != *local_id {
        return Err(VerifyError::NotForUs);
    }
    let node_id = reply.sender_key.node_id();
    if node_id == *local_id {
        return Err(VerifyError::SelfOrigin);
    }
    let mut plain = reply.ciphertext;
    open_detached(key, &reply.nonce, &mut plain, &reply.tag)
        .map_err(|_| VerifyError::Authentication)?;
    let (sent_tick, address) = decode_verify_plaintext(&plain);
    if address != from {
        return Err(VerifyError::AddressMismatch { claimed: address, actual: from });
    }
    if !tick::check_delay(sent_tick, now, window) {
        return Err(VerifyError::Expired);
    }
    Ok(Verified {
        public_key: reply.sender_key,
        node_id,
        address,
        delay: tick::elapsed(sent_tick, now),
    })
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("reply addressed to another node")]
    NotForUs,
    #[error("reply carries our own key")]
    SelfOrigin,
    #[error("authentication failed")]
    Authentication,
    #[error("claimed address {claimed} differs from sender {actual}")]
    AddressMismatch {
        claimed: SocketAddrV4,
        actual: SocketAddrV4,
    },
    #[error("challenge tick outside the accepted window")]
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;
    use std::net::Ipv4Addr;

    const WINDOW: u32 = 10_000;

    struct Pair {
        requester: KeyPair,
        responder: KeyPair,
        responder_addr: SocketAddrV4,
    }

    fn pair() -> Pair {
        Pair {
            requester: KeyPair::generate(),
            responder: KeyPair::generate(),
            responder_addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 39004),
        }
    }

    fn challenge(p: &Pair, tick: u32) -> VerifyNode {
        VerifyNode {
            target: p.responder.node_id(),
            tick,
            claimed: p.responder_addr,
            sender_key: *p.requester.public_key(),
        }
    }

    fn answer(p: &Pair, tick: u32) -> ReplyVerifyNode {
        let key = p.responder.derive_shared_key(p.requester.public_key());
        answer_challenge(&key, &challenge(p, tick), p.responder.public_key()).unwrap()
    }

    fn check(p: &Pair, reply: &ReplyVerifyNode, now: u32) -> Result<Verified, VerifyError> {
        let key = p.requester.derive_shared_key(&reply.sender_key);
        check_reply(
            &key,
            &p.requester.node_id(),
            reply,
            p.responder_addr,
            now,
            WINDOW,
        )
    }

    #[test]
    fn verify_exchange_succeeds() {
        let p = pair();
        let reply = answer(&p, 1_000);
        assert_eq!(reply.target, p.requester.node_id());
        let verified = check(&p, &reply, 1_250).unwrap();
        assert_eq!(verified.node_id, p.responder.node_id());
        assert_eq!(verified.delay, 250);
        assert_eq!(verified.address, p.responder_addr);
    }

    #[test]
    fn tampered_tag_fails_authentication() {
        let p = pair();
        let mut reply = answer(&p, 1_000);
        reply.tag[0] ^= 0xff;
        assert_eq!(check(&p, &reply, 1_010), Err(VerifyError::Authentication));
    }

    #[test]
    fn tick_delta_at_window_rejected() {
        let p = pair();
        let reply = answer(&p, 1_000);
        assert_eq!(check(&p, &reply, 1_000 + WINDOW), Err(VerifyError::Expired));
        assert!(check(&p, &reply, 1_000 + WINDOW - 1).is_ok());
    }

    #[test]
    fn reply_from_other_address_rejected() {
        let p = pair();
        let reply = answer(&p, 5);
        let key = p.requester.derive_shared_key(&reply.sender_key);
        let other = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 8), 39004);
        assert!(matches!(
            check_reply(&key, &p.requester.node_id(), &reply, other, 6, WINDOW),
            Err(VerifyError::AddressMismatch { .. })
        ));
    }

    #[test]
    fn reply_for_someone_else_rejected() {
        let p = pair();
        let reply = answer(&p, 5);
        let key = p.requester.derive_shared_key(&reply.sender_key);
        let stranger = KeyPair::generate().node_id();
        assert_eq!(
            check_reply(&key, &stranger, &reply, p.responder_addr, 6, WINDOW),
            Err(VerifyError::NotForUs)
        );
    }
}
