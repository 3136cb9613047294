//! Fuzz target for sync message decoding.
//!
//! This target tests that arbitrary bytes cannot crash the message decoder,
//! whatever kind the transport declared for them.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary input
//! - A successful decode always matches the declared kind
//! - Decoded messages re-encode to the exact input bytes

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use lockstep_resync::network::codec::{decode_message, encode_message};
use lockstep_resync::MessageKind;

#[derive(Debug, Arbitrary)]
enum DeclaredKind {
    SyncCheckBroadcast,
    SyncCheckAck,
    RequestSync,
    SyncData,
    UnlockGame,
}

impl From<DeclaredKind> for MessageKind {
    fn from(kind: DeclaredKind) -> Self {
        match kind {
            DeclaredKind::SyncCheckBroadcast => MessageKind::SyncCheckBroadcast,
            DeclaredKind::SyncCheckAck => MessageKind::SyncCheckAck,
            DeclaredKind::RequestSync => MessageKind::RequestSync,
            DeclaredKind::SyncData => MessageKind::SyncData,
            DeclaredKind::UnlockGame => MessageKind::UnlockGame,
        }
    }
}

fuzz_target!(|input: (DeclaredKind, Vec<u8>)| {
    let (declared, data) = input;
    let declared = MessageKind::from(declared);

    // Malformed data must return Err, not panic
    if let Ok(msg) = decode_message(declared, &data) {
        assert_eq!(msg.kind(), declared);
        let encoded = encode_message(&msg).expect("decoded message must re-encode");
        assert_eq!(encoded, data, "trailing bytes must have been rejected");
    }
});
