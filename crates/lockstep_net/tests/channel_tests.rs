//! Channel tests over in-memory duplex streams.

use std::collections::BTreeMap;
use std::sync::Arc;

use lockstep_core::command::{Command, CommandBatch, PlayerId};
use lockstep_core::grid::GridPos;
use lockstep_net::channel::DEFAULT_MAX_PACKET_LEN;
use lockstep_net::{AsyncChannel, Channel, Message, NetError, NetworkKey, Packet};
use tokio::io::{duplex, AsyncWriteExt};

const BUFFER: usize = 64 * 1024;
const PRODUCERS: PlayerId = 4;
const PER_PRODUCER: u64 = 200;

fn batch_packet(tick: u64) -> Packet {
    Message::Commands(CommandBatch::new(
        tick,
        0,
        vec![Command::DestroyBuilding {
            pos: GridPos::new(1, 1),
        }],
    ))
    .to_packet()
    .unwrap()
}

/// A batch whose player and tick identify who sent it and in which order.
fn tagged_packet(producer: PlayerId, seq: u64) -> Packet {
    Message::Commands(CommandBatch::new(seq, producer, Vec::new()))
        .to_packet()
        .unwrap()
}

#[tokio::test]
async fn test_sync_channel_round_trip() {
    let (a, b) = duplex(BUFFER);
    let mut left = Channel::new(a, DEFAULT_MAX_PACKET_LEN);
    let mut right = Channel::new(b, DEFAULT_MAX_PACKET_LEN);

    let packet = batch_packet(3);
    left.send(&packet).await.unwrap();
    assert_eq!(right.recv().await.unwrap(), Some(packet));

    left.close().await.unwrap();
    assert_eq!(right.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_async_sends_arrive_in_call_order() {
    let (a, b) = duplex(BUFFER);
    let channel = AsyncChannel::new(Channel::new(a, DEFAULT_MAX_PACKET_LEN));
    let _receiver = channel.start().unwrap();
    let mut remote = Channel::new(b, DEFAULT_MAX_PACKET_LEN);

    let first = batch_packet(1);
    let second = batch_packet(2);
    channel.send_async(first.clone());
    channel.send_async(second.clone());

    assert_eq!(remote.recv().await.unwrap(), Some(first));
    assert_eq!(remote.recv().await.unwrap(), Some(second));
}

#[tokio::test]
async fn test_finish_drains_queue() {
    let (a, b) = duplex(BUFFER);
    let channel = AsyncChannel::new(Channel::new(a, DEFAULT_MAX_PACKET_LEN));
    let receiver = channel.start().unwrap();
    let mut remote = Channel::new(b, DEFAULT_MAX_PACKET_LEN);

    for tick in 0..50 {
        channel.send_async(batch_packet(tick));
    }
    channel.finish().await.unwrap();
    drop(receiver);

    for tick in 0..50 {
        assert_eq!(remote.recv().await.unwrap(), Some(batch_packet(tick)));
    }
    assert_eq!(remote.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let (a, _b) = duplex(BUFFER);
    let channel = AsyncChannel::new(Channel::new(a, DEFAULT_MAX_PACKET_LEN));
    let _receiver = channel.start().unwrap();
    assert!(matches!(channel.start(), Err(NetError::AlreadyStarted)));
}

#[tokio::test]
async fn test_close_before_start_delivers_nothing() {
    let (a, b) = duplex(BUFFER);
    let channel = AsyncChannel::new(Channel::new(a, DEFAULT_MAX_PACKET_LEN));
    let mut remote = Channel::new(b, DEFAULT_MAX_PACKET_LEN);

    channel.send_async(batch_packet(1));
    channel.close();
    assert!(channel.is_closed());
    assert_eq!(channel.queued(), 0);
    assert!(matches!(channel.start(), Err(NetError::Closed)));

    assert_eq!(remote.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_close_is_idempotent_and_drops_later_sends() {
    let (a, _b) = duplex(BUFFER);
    let channel = AsyncChannel::new(Channel::new(a, DEFAULT_MAX_PACKET_LEN));
    let mut receiver = channel.start().unwrap();

    channel.close();
    channel.close();
    channel.send_async(batch_packet(9));
    assert_eq!(channel.queued(), 0);
    channel.join().await.unwrap();
    assert_eq!(receiver.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_unknown_key_is_protocol_error() {
    let (a, mut b) = duplex(BUFFER);
    let channel = AsyncChannel::new(Channel::new(a, DEFAULT_MAX_PACKET_LEN));
    let mut receiver = channel.start().unwrap();

    b.write_all(&[1, 0, 0, 0, 99]).await.unwrap();
    assert!(matches!(receiver.recv().await, Err(NetError::Protocol(_))));
}

#[tokio::test]
async fn test_oversized_frame_is_protocol_error() {
    let (a, mut b) = duplex(BUFFER);
    let mut channel = Channel::new(a, 8);

    let len = 100u32.to_le_bytes();
    b.write_all(&len).await.unwrap();
    b.write_all(&[NetworkKey::Hello as u8]).await.unwrap();
    assert!(matches!(channel.recv().await, Err(NetError::Protocol(_))));
}

#[tokio::test]
async fn test_peer_vanishing_mid_frame_is_transport_error() {
    let (a, mut b) = duplex(BUFFER);
    let mut channel = Channel::new(a, DEFAULT_MAX_PACKET_LEN);

    b.write_all(&[10, 0, 0, 0, NetworkKey::Commands as u8, 1, 2])
        .await
        .unwrap();
    drop(b);
    assert!(matches!(channel.recv().await, Err(NetError::Transport(_))));
}

#[tokio::test]
async fn test_close_with_queue_delivers_a_prefix() {
    let (a, b) = duplex(BUFFER);
    let channel = AsyncChannel::new(Channel::new(a, DEFAULT_MAX_PACKET_LEN));
    let _receiver = channel.start().unwrap();
    let mut remote = Channel::new(b, DEFAULT_MAX_PACKET_LEN);

    for tick in 0..100 {
        channel.send_async(batch_packet(tick));
    }
    channel.close();
    channel.join().await.unwrap();

    let mut delivered = 0;
    while let Some(packet) = remote.recv().await.unwrap() {
        assert_eq!(packet, batch_packet(delivered));
        delivered += 1;
    }
    assert!(delivered <= 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_keep_their_own_order() {
    let (a, b) = duplex(BUFFER);
    let channel = Arc::new(AsyncChannel::new(Channel::new(a, DEFAULT_MAX_PACKET_LEN)));
    let receiver = channel.start().unwrap();

    let reader = tokio::spawn(async move {
        let mut remote = Channel::new(b, DEFAULT_MAX_PACKET_LEN);
        let mut arrived = Vec::new();
        while let Some(packet) = remote.recv().await.unwrap() {
            match Message::from_packet(&packet).unwrap() {
                Message::Commands(batch) => arrived.push((batch.player, batch.tick)),
                other => panic!("unexpected message {other:?}"),
            }
        }
        arrived
    });

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                for seq in 0..PER_PRODUCER {
                    channel.send_async(tagged_packet(producer, seq));
                    if seq % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let channel = Arc::try_unwrap(channel).unwrap();
    channel.finish().await.unwrap();
    drop(receiver);
    let arrived = reader.await.unwrap();

    assert_eq!(arrived.len(), usize::from(PRODUCERS) * PER_PRODUCER as usize);
    let mut next: BTreeMap<PlayerId, u64> = BTreeMap::new();
    for (producer, seq) in arrived {
        let expected = next.entry(producer).or_insert(0);
        assert_eq!(seq, *expected, "producer {producer} out of order");
        *expected += 1;
    }
    assert_eq!(next.len(), usize::from(PRODUCERS));
    assert!(next.values().all(|count| *count == PER_PRODUCER));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_depth_settles_at_zero_when_closed_under_load() {
    let (a, _b) = duplex(BUFFER);
    let channel = Arc::new(AsyncChannel::new(Channel::new(a, DEFAULT_MAX_PACKET_LEN)));
    let _receiver = channel.start().unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                for seq in 0..PER_PRODUCER {
                    channel.send_async(tagged_packet(producer, seq));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    tokio::task::yield_now().await;
    channel.close();
    for producer in producers {
        producer.await.unwrap();
    }
    channel.join().await.unwrap();

    assert!(channel.is_closed());
    assert_eq!(channel.queued(), 0);
}
