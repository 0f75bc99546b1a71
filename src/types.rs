//! Identifiers and signaling records shared by the coordinator, the stream
//! adapter and the tracker client.

use std::fmt;

use rand::Rng;

use crate::error::Error;

/// Length in bytes of every swarm-level identifier.
pub const ID_LEN: usize = 20;

macro_rules! byte_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; ID_LEN]);

        impl $name {
            pub fn new(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Builds an id from a slice, rejecting anything but exactly 20 bytes.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
                let arr: [u8; ID_LEN] = bytes.try_into().map_err(|_| {
                    Error::BadMessage(format!(
                        concat!(stringify!($name), " must be {} bytes, got {}"),
                        ID_LEN,
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl From<[u8; ID_LEN]> for $name {
            fn from(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }
        }
    };
}

byte_id! {
    /// Correlator chosen by the offering side and echoed back by the
    /// responder so answers can be matched to offers.
    OfferId
}

byte_id! {
    /// BitTorrent peer identifier.
    PeerId
}

byte_id! {
    /// SHA-1 of a torrent's metadata, identifying a swarm.
    InfoHash
}

impl OfferId {
    /// Draws 20 uniformly random bytes.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }
}

impl PeerId {
    /// Mints a peer id with an Azureus-style client fingerprint prefix and a
    /// random tail.
    pub fn generate(prefix: &str) -> Self {
        let mut bytes = [0u8; ID_LEN];
        let prefix = prefix.as_bytes();
        let n = prefix.len().min(ID_LEN);
        bytes[..n].copy_from_slice(&prefix[..n]);
        rand::thread_rng().fill(&mut bytes[n..]);
        Self(bytes)
    }
}

/// Continuation invoked when the local answer to a remote offer is ready.
/// The first argument is the freshly minted local peer id the remote side
/// should address.
pub type AnswerSink = Box<dyn FnOnce(PeerId, RtcAnswer) + Send>;

/// One half of an SDP exchange. Local offers carry no answer sink; remote
/// offers routed in from a tracker carry the continuation that sends the
/// answer back out.
pub struct RtcOffer {
    pub id: OfferId,
    pub pid: PeerId,
    pub sdp: String,
    pub answer_sink: Option<AnswerSink>,
}

impl fmt::Debug for RtcOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcOffer")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("sdp", &self.sdp)
            .field("answer_sink", &self.answer_sink.is_some())
            .finish()
    }
}

/// Reply to a previously emitted offer, referring to it by offer id.
#[derive(Debug, Clone)]
pub struct RtcAnswer {
    pub offer_id: OfferId,
    pub pid: PeerId,
    pub sdp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_lowercase_hex() {
        let id = InfoHash::new([
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ]);
        assert_eq!(id.to_string(), "0123456789abcdef0123456789abcdef01234567");
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(OfferId::from_bytes(&[0u8; 19]).is_err());
        assert!(OfferId::from_bytes(&[0u8; 21]).is_err());
        assert!(OfferId::from_bytes(&[0u8; 20]).is_ok());
    }

    #[test]
    fn generated_peer_id_keeps_prefix() {
        let pid = PeerId::generate("-WT0001-");
        assert_eq!(&pid.as_bytes()[..8], b"-WT0001-");
    }

    #[test]
    fn long_prefix_is_truncated() {
        let pid = PeerId::generate("-THIS-PREFIX-IS-FAR-TOO-LONG-");
        assert_eq!(pid.as_bytes(), b"-THIS-PREFIX-IS-FAR-");
    }

    #[test]
    fn random_offer_ids_differ() {
        assert_ne!(OfferId::random(), OfferId::random());
    }
}
