//! Signaling coordinator scenarios against the in-memory engine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use webtorrent_transport::rtc::mock::MockEngine;
use webtorrent_transport::rtc::signaling::IncomingPeer;
use webtorrent_transport::rtc::SdpKind;
use webtorrent_transport::{OfferId, PeerId, RtcAnswer, RtcOffer, RtcSignaling, SignalingConfig};

struct Swarm {
    engine: Arc<MockEngine>,
    signaling: RtcSignaling,
    peers: mpsc::UnboundedReceiver<IncomingPeer>,
}

fn swarm() -> Swarm {
    let engine = MockEngine::new();
    let (peer_tx, peers) = mpsc::unbounded_channel();
    let signaling = RtcSignaling::spawn(engine.clone(), SignalingConfig::default(), peer_tx);
    Swarm {
        engine,
        signaling,
        peers,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Lets queued commands and events drain through the actor.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn offer_batch_resolves_once_with_all_descriptions() {
    let mut swarm = swarm();
    let signaling = swarm.signaling.clone();
    let batch = tokio::spawn(async move { signaling.generate_offers(3).await });

    wait_until(|| swarm.engine.connection_count() == 3).await;
    for i in 0..3 {
        assert_eq!(swarm.engine.connection(i).channel_count(), 1);
        swarm.engine.connection(i).complete_gathering(&format!("s{i}"));
    }

    let offers = batch.await.unwrap().unwrap();
    assert_eq!(offers.len(), 3);

    let ids: HashSet<OfferId> = offers.iter().map(|offer| offer.id).collect();
    assert_eq!(ids.len(), 3, "offer ids are distinct");

    let sdps: HashSet<&str> = offers.iter().map(|offer| offer.sdp.as_str()).collect();
    assert_eq!(sdps, HashSet::from(["s0", "s1", "s2"]));

    for offer in &offers {
        assert!(offer.answer_sink.is_none());
        assert_eq!(&offer.pid.as_bytes()[..8], b"-WT0001-");
    }
    assert!(swarm.peers.try_recv().is_err());
}

#[tokio::test]
async fn zero_offers_resolve_immediately() {
    let swarm = swarm();
    let offers = swarm.signaling.generate_offers(0).await.unwrap();
    assert!(offers.is_empty());
    assert_eq!(swarm.engine.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn answers_are_applied_once_and_duplicates_dropped() {
    let mut swarm = swarm();
    let signaling = swarm.signaling.clone();
    let batch = tokio::spawn(async move { signaling.generate_offers(1).await });

    wait_until(|| swarm.engine.connection_count() == 1).await;
    swarm.engine.connection(0).complete_gathering("local offer");
    let offers = batch.await.unwrap().unwrap();
    let offer_id = offers[0].id;

    let remote = PeerId::new([0x42; 20]);
    swarm.signaling.process_answer(RtcAnswer {
        offer_id,
        pid: remote,
        sdp: "remote answer".to_string(),
    });
    wait_until(|| !swarm.engine.connection(0).remote_descriptions().is_empty()).await;
    assert_eq!(
        swarm.engine.connection(0).remote_descriptions(),
        vec![(SdpKind::Answer, "remote answer".to_string())]
    );

    // A second answer for the same offer is silently ignored.
    swarm.signaling.process_answer(RtcAnswer {
        offer_id,
        pid: PeerId::new([0x43; 20]),
        sdp: "second answer".to_string(),
    });
    settle().await;
    assert_eq!(swarm.engine.connection(0).remote_descriptions().len(), 1);

    // The data channel opening now hands the peer off and erases the
    // connection, so a duplicate open signal finds nothing.
    swarm.engine.connection(0).open_channel();
    let peer = timeout(Duration::from_secs(5), swarm.peers.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(peer.peer_id, remote);
    assert_eq!(peer.init.channel.channel.label(), "webtorrent");

    swarm.engine.connection(0).open_channel();
    settle().await;
    assert!(swarm.peers.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn answers_for_unknown_offers_are_ignored() {
    let mut swarm = swarm();
    let signaling = swarm.signaling.clone();
    let batch = tokio::spawn(async move { signaling.generate_offers(1).await });
    wait_until(|| swarm.engine.connection_count() == 1).await;
    swarm.engine.connection(0).complete_gathering("local offer");
    batch.await.unwrap().unwrap();

    swarm.signaling.process_answer(RtcAnswer {
        offer_id: OfferId::new([0x7F; 20]),
        pid: PeerId::new([0x42; 20]),
        sdp: "stale".to_string(),
    });
    settle().await;
    assert!(swarm.engine.connection(0).remote_descriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn channel_open_without_a_peer_id_is_dropped() {
    let mut swarm = swarm();
    let signaling = swarm.signaling.clone();
    let batch = tokio::spawn(async move { signaling.generate_offers(1).await });
    wait_until(|| swarm.engine.connection_count() == 1).await;
    swarm.engine.connection(0).complete_gathering("local offer");
    batch.await.unwrap().unwrap();

    // No answer was processed, so the open signal has no peer to hand off.
    swarm.engine.connection(0).open_channel();
    settle().await;
    assert!(swarm.peers.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn remote_offers_produce_answers_through_the_sink() {
    let mut swarm = swarm();
    let offer_id = OfferId::new([0x11; 20]);
    let remote = PeerId::new([0x22; 20]);

    let (answer_tx, answer_rx) = oneshot::channel();
    swarm.signaling.process_offer(RtcOffer {
        id: offer_id,
        pid: remote,
        sdp: "remote offer".to_string(),
        answer_sink: Some(Box::new(move |local_pid, answer| {
            let _ = answer_tx.send((local_pid, answer));
        })),
    });

    wait_until(|| swarm.engine.connection_count() == 1).await;
    wait_until(|| !swarm.engine.connection(0).remote_descriptions().is_empty()).await;
    assert_eq!(
        swarm.engine.connection(0).remote_descriptions(),
        vec![(SdpKind::Offer, "remote offer".to_string())]
    );

    swarm.engine.connection(0).complete_gathering("local answer");
    let (local_pid, answer) = timeout(Duration::from_secs(5), answer_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&local_pid.as_bytes()[..8], b"-WT0001-");
    assert_eq!(answer.offer_id, offer_id);
    assert_eq!(answer.pid, remote);
    assert_eq!(answer.sdp, "local answer");

    // The responder side gets the channel from the remote peer.
    let _handle = swarm.engine.connection(0).open_remote_channel("webtorrent");
    let peer = timeout(Duration::from_secs(5), swarm.peers.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(peer.peer_id, remote);
}

#[tokio::test(start_paused = true)]
async fn failed_connections_do_not_stall_the_batch() {
    let mut swarm = swarm();
    let signaling = swarm.signaling.clone();
    let batch = tokio::spawn(async move { signaling.generate_offers(2).await });

    wait_until(|| swarm.engine.connection_count() == 2).await;
    swarm.engine.connection(0).complete_gathering("s0");
    swarm.engine.connection(1).fail();

    let offers = batch.await.unwrap().unwrap();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].sdp, "s0");
    wait_until(|| swarm.engine.connection(1).is_closed()).await;
}

#[tokio::test(start_paused = true)]
async fn deadline_expiry_completes_the_batch_without_the_offer() {
    let mut swarm = swarm();
    let signaling = swarm.signaling.clone();
    let batch = tokio::spawn(async move { signaling.generate_offers(1).await });

    wait_until(|| swarm.engine.connection_count() == 1).await;
    // Never complete gathering: the connection deadline has to reap it.
    let offers = timeout(Duration::from_secs(60), batch)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(offers.is_empty());
    wait_until(|| swarm.engine.connection(0).is_closed()).await;
}

#[tokio::test(start_paused = true)]
async fn batches_resolve_in_request_order() {
    let mut swarm = swarm();
    let first = {
        let signaling = swarm.signaling.clone();
        tokio::spawn(async move { signaling.generate_offers(1).await })
    };
    wait_until(|| swarm.engine.connection_count() == 1).await;
    let second = {
        let signaling = swarm.signaling.clone();
        tokio::spawn(async move { signaling.generate_offers(1).await })
    };
    wait_until(|| swarm.engine.connection_count() == 2).await;

    // The second batch finishes first but must wait its turn.
    swarm.engine.connection(1).complete_gathering("s1");
    settle().await;
    assert!(!first.is_finished());
    assert!(!second.is_finished());

    swarm.engine.connection(0).complete_gathering("s0");
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first[0].sdp, "s0");
    assert_eq!(second[0].sdp, "s1");
}

#[tokio::test(start_paused = true)]
async fn remote_offer_reusing_a_live_offer_id_is_dropped() {
    let mut swarm = swarm();
    let signaling = swarm.signaling.clone();
    let batch = tokio::spawn(async move { signaling.generate_offers(1).await });
    wait_until(|| swarm.engine.connection_count() == 1).await;
    swarm.engine.connection(0).complete_gathering("local offer");
    let offers = batch.await.unwrap().unwrap();

    swarm.signaling.process_offer(RtcOffer {
        id: offers[0].id,
        pid: PeerId::new([0x22; 20]),
        sdp: "colliding offer".to_string(),
        answer_sink: None,
    });
    settle().await;
    // No second engine connection was created for the collision.
    assert_eq!(swarm.engine.connection_count(), 1);
}
