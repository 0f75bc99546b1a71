//! WebTorrent JSON wire format.
//!
//! One JSON object per WebSocket frame, both directions. All 20-byte
//! binary fields travel as Latin-1-as-UTF-8 strings (see
//! [`crate::latin1`]); the announce key is eight uppercase hex digits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AnnounceRequest, TrackerAnswer, TrackerMessage, TrackerResponse};
use crate::error::Error;
use crate::latin1::{from_latin1, to_latin1};
use crate::types::{InfoHash, OfferId, PeerId, RtcAnswer};

pub(crate) fn encode(message: &TrackerMessage) -> Result<String, Error> {
    match message {
        TrackerMessage::Announce(request) => encode_announce(request),
        TrackerMessage::Answer(answer) => encode_answer(answer),
    }
}

#[derive(Serialize)]
struct AnnouncePayload<'a> {
    action: &'static str,
    info_hash: String,
    peer_id: String,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    corrupt: u64,
    numwant: u32,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'static str>,
    offers: Vec<OfferPayload<'a>>,
}

#[derive(Serialize)]
struct OfferPayload<'a> {
    offer_id: String,
    offer: Description<'a>,
}

#[derive(Serialize)]
struct Description<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    sdp: &'a str,
}

#[derive(Serialize)]
struct AnswerPayload<'a> {
    action: &'static str,
    info_hash: String,
    offer_id: String,
    to_peer_id: String,
    peer_id: String,
    answer: Description<'a>,
}

fn encode_announce(request: &AnnounceRequest) -> Result<String, Error> {
    let payload = AnnouncePayload {
        action: "announce",
        info_hash: from_latin1(request.info_hash.as_bytes()),
        peer_id: from_latin1(request.peer_id.as_bytes()),
        uploaded: request.uploaded,
        downloaded: request.downloaded,
        left: request.left,
        corrupt: request.corrupt,
        numwant: request.num_want,
        key: format!("{:08X}", request.key),
        event: request.event.map(|event| event.as_str()),
        offers: request
            .offers
            .iter()
            .map(|offer| OfferPayload {
                offer_id: from_latin1(offer.id.as_bytes()),
                offer: Description {
                    kind: "offer",
                    sdp: &offer.sdp,
                },
            })
            .collect(),
    };
    serde_json::to_string(&payload).map_err(|err| Error::BadMessage(err.to_string()))
}

fn encode_answer(answer: &TrackerAnswer) -> Result<String, Error> {
    let payload = AnswerPayload {
        action: "announce",
        info_hash: from_latin1(answer.info_hash.as_bytes()),
        offer_id: from_latin1(answer.answer.offer_id.as_bytes()),
        to_peer_id: from_latin1(answer.answer.pid.as_bytes()),
        peer_id: from_latin1(answer.peer_id.as_bytes()),
        answer: Description {
            kind: "answer",
            sdp: &answer.answer.sdp,
        },
    };
    serde_json::to_string(&payload).map_err(|err| Error::BadMessage(err.to_string()))
}

/// Remote offer carried by an inbound frame.
#[derive(Debug)]
pub(crate) struct InboundOffer {
    pub offer_id: OfferId,
    pub peer_id: PeerId,
    pub sdp: String,
}

/// Decoded inbound frame. Any combination of the three parts may be
/// present on a single message.
#[derive(Debug)]
pub(crate) struct InboundMessage {
    pub info_hash: InfoHash,
    pub offer: Option<InboundOffer>,
    pub answer: Option<RtcAnswer>,
    pub response: Option<TrackerResponse>,
}

#[derive(Deserialize)]
struct RawFrame {
    info_hash: Option<String>,
    offer: Option<RawDescription>,
    answer: Option<RawDescription>,
    offer_id: Option<String>,
    peer_id: Option<String>,
    interval: Option<u64>,
    min_interval: Option<u64>,
    complete: Option<i64>,
    incomplete: Option<i64>,
    downloaded: Option<i64>,
}

#[derive(Deserialize)]
struct RawDescription {
    sdp: String,
}

/// Parses one inbound frame. `min_interval` is the floor applied to the
/// announce interval reported by the tracker.
pub(crate) fn decode(text: &str, min_interval: Duration) -> Result<InboundMessage, Error> {
    let frame: RawFrame =
        serde_json::from_str(text).map_err(|err| Error::BadMessage(err.to_string()))?;

    let info_hash = frame
        .info_hash
        .as_deref()
        .ok_or_else(|| Error::BadMessage("missing info_hash".into()))?;
    let info_hash = decode_id(info_hash).map(InfoHash::new)?;

    let offer = frame
        .offer
        .map(|description| {
            Ok::<_, Error>(InboundOffer {
                offer_id: decode_field(frame.offer_id.as_deref(), "offer_id").map(OfferId::new)?,
                peer_id: decode_field(frame.peer_id.as_deref(), "peer_id").map(PeerId::new)?,
                sdp: description.sdp,
            })
        })
        .transpose()?;

    let answer = frame
        .answer
        .map(|description| {
            Ok::<_, Error>(RtcAnswer {
                offer_id: decode_field(frame.offer_id.as_deref(), "offer_id").map(OfferId::new)?,
                pid: decode_field(frame.peer_id.as_deref(), "peer_id").map(PeerId::new)?,
                sdp: description.sdp,
            })
        })
        .transpose()?;

    let response = frame.interval.map(|interval| TrackerResponse {
        interval: Duration::from_secs(interval).max(min_interval),
        min_interval: Duration::from_secs(frame.min_interval.unwrap_or(60)),
        complete: frame.complete.unwrap_or(-1),
        incomplete: frame.incomplete.unwrap_or(-1),
        downloaded: frame.downloaded.unwrap_or(-1),
    });

    Ok(InboundMessage {
        info_hash,
        offer,
        answer,
        response,
    })
}

fn decode_field(value: Option<&str>, name: &str) -> Result<[u8; 20], Error> {
    let value = value.ok_or_else(|| Error::BadMessage(format!("missing {name}")))?;
    decode_id(value)
}

fn decode_id(value: &str) -> Result<[u8; 20], Error> {
    let bytes = to_latin1(value.as_bytes())?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::BadMessage(format!("expected 20 bytes, got {}", bytes.len())))
}
