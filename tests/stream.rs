//! Stream adapter scenarios against the in-memory channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use webtorrent_transport::rtc::mock::{mock_channel, MockChannelHandle, MockConnection, MockEngine};
use webtorrent_transport::rtc::RtcEngine;
use webtorrent_transport::{Error, RtcStream, RtcStreamInit};

async fn fixture() -> (Arc<RtcStream>, MockChannelHandle, Arc<MockConnection>) {
    let engine = MockEngine::new();
    let (connection, _events) = engine.connect().await.unwrap();
    let (pair, handle) = mock_channel("webtorrent");
    let stream = RtcStream::new(RtcStreamInit {
        connection,
        channel: pair,
    });
    (Arc::new(stream), handle, engine.connection(0))
}

/// Lets a freshly spawned task reach its first await point.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn reads_deliver_buffered_messages() {
    let (stream, handle, _) = fixture().await;
    handle.inject(b"hello");

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), stream.read_some(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"hello");
}

#[tokio::test]
async fn partial_read_carries_the_rest_over() {
    let (stream, handle, _) = fixture().await;
    handle.inject(b"abcdef");

    let mut buf = [0u8; 3];
    let n = stream.read_some(&mut buf).await.unwrap();
    assert_eq!(n, 3);
    assert_eq!(&buf, b"abc");
    assert_eq!(stream.available(), 3);

    let n = stream.read_some(&mut buf).await.unwrap();
    assert_eq!(n, 3);
    assert_eq!(&buf, b"def");
    assert_eq!(stream.available(), 0);
}

#[tokio::test]
async fn reads_coalesce_across_messages() {
    let (stream, handle, _) = fixture().await;
    handle.inject(b"ab");
    handle.inject(b"cd");

    // Wait until both messages are buffered so one read sees them.
    timeout(Duration::from_secs(5), async {
        while stream.available() < 4 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let mut buf = [0u8; 8];
    let n = stream.read_some(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"abcd");
}

#[tokio::test]
async fn blocked_read_wakes_on_arrival() {
    let (stream, handle, _) = fixture().await;

    let reader = {
        let stream = stream.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let n = stream.read_some(&mut buf).await?;
            Ok::<_, Error>(buf[..n].to_vec())
        })
    };
    settle().await;

    handle.inject(b"late");
    let data = timeout(Duration::from_secs(5), reader)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(data, b"late");
}

#[tokio::test]
async fn second_concurrent_read_is_rejected() {
    let (stream, _handle, _) = fixture().await;

    let blocked = {
        let stream = stream.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            stream.read_some(&mut buf).await.map(|_| ())
        })
    };
    settle().await;

    let mut buf = [0u8; 8];
    assert!(matches!(
        stream.read_some(&mut buf).await,
        Err(Error::OperationNotSupported)
    ));

    stream.cancel();
    let _ = blocked.await;
}

#[tokio::test]
async fn zero_length_operations_complete_immediately() {
    let (stream, _handle, _) = fixture().await;
    assert_eq!(stream.read_some(&mut []).await.unwrap(), 0);
    assert_eq!(stream.write_some(&[]).await.unwrap(), 0);
}

#[tokio::test]
async fn writes_hand_the_whole_buffer_to_the_channel() {
    let (stream, handle, _) = fixture().await;
    let n = stream.write_some(b"interested").await.unwrap();
    assert_eq!(n, 10);

    let sent = handle.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0][..], b"interested");
}

#[tokio::test]
async fn cancel_aborts_pending_read_but_keeps_the_stream() {
    let (stream, handle, _) = fixture().await;

    let blocked = {
        let stream = stream.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            stream.read_some(&mut buf).await.map(|_| ())
        })
    };
    settle().await;

    stream.cancel();
    let result = timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::OperationAborted)));

    // The stream is still usable after a cancel.
    assert!(stream.is_open());
    handle.inject(b"more");
    let mut buf = [0u8; 8];
    let n = stream.read_some(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"more");
}

#[tokio::test]
async fn cancel_aborts_a_stalled_write() {
    let (stream, handle, _) = fixture().await;
    handle.channel.stall_sends();

    let blocked = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write_some(b"slow").await })
    };
    settle().await;
    assert!(!blocked.is_finished());

    stream.cancel();
    let result = timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::OperationAborted)));

    // Once the channel drains, later writes go through.
    handle.channel.release_sends();
    assert_eq!(stream.write_some(b"next").await.unwrap(), 4);
    assert_eq!(&handle.sent().pop().unwrap()[..], b"next");
}

#[tokio::test]
async fn close_aborts_a_stalled_write() {
    let (stream, handle, _) = fixture().await;
    handle.channel.stall_sends();

    let blocked = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write_some(b"slow").await })
    };
    settle().await;

    stream.close().await;
    let result = timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::OperationAborted)));
    assert!(matches!(
        stream.write_some(b"x").await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn close_aborts_pending_read_and_rejects_new_ones() {
    let (stream, handle, connection) = fixture().await;

    let blocked = {
        let stream = stream.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            stream.read_some(&mut buf).await.map(|_| ())
        })
    };
    settle().await;

    stream.close().await;
    let result = timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::OperationAborted)));

    assert!(!stream.is_open());
    assert!(handle.channel.is_closed());
    assert!(connection.is_closed());

    let mut buf = [0u8; 8];
    assert!(matches!(
        stream.read_some(&mut buf).await,
        Err(Error::NotConnected)
    ));
    assert!(matches!(
        stream.write_some(b"x").await,
        Err(Error::NotConnected)
    ));

    // Closing again is harmless.
    stream.close().await;
}

#[tokio::test]
async fn remote_close_drains_buffered_data_first() {
    let (stream, handle, _) = fixture().await;
    handle.inject(b"tail");
    handle.close_remote();

    let mut buf = [0u8; 8];
    let n = stream.read_some(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"tail");

    assert!(matches!(
        stream.read_some(&mut buf).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn remote_close_wakes_a_blocked_reader() {
    let (stream, handle, _) = fixture().await;

    let blocked = {
        let stream = stream.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            stream.read_some(&mut buf).await.map(|_| ())
        })
    };
    settle().await;

    handle.close_remote();
    let result = timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::NotConnected)));
}

#[tokio::test]
async fn endpoints_follow_the_engine_report() {
    let (stream, _handle, connection) = fixture().await;

    connection.set_addresses(Some("10.1.2.3:6881"), Some("192.0.2.9:51413"));
    assert_eq!(
        stream.local_endpoint().await.unwrap(),
        "10.1.2.3:6881".parse().unwrap()
    );
    assert_eq!(
        stream.remote_endpoint().await.unwrap(),
        "192.0.2.9:51413".parse().unwrap()
    );

    connection.set_addresses(None, Some("not an endpoint"));
    assert!(matches!(
        stream.local_endpoint().await,
        Err(Error::OperationNotSupported)
    ));
    assert!(matches!(
        stream.remote_endpoint().await,
        Err(Error::AddressFamilyNotSupported)
    ));

    stream.close().await;
    assert!(matches!(
        stream.local_endpoint().await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn available_tracks_buffered_bytes() {
    let (stream, handle, _) = fixture().await;
    assert_eq!(stream.available(), 0);

    handle.inject(b"abc");
    handle.inject(b"de");
    timeout(Duration::from_secs(5), async {
        while stream.available() < 5 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(stream.available(), 5);
}
