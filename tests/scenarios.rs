use std::time::Duration;

use slap::config::SlapConfig;
use slap::error::SlapError;
use slap::link_control::LinkParameters;
use slap::loopback::LoopbackPair;
use slap::raw_link::memory_link::LinkImpairment;
use slap::slap_stream::{SlapStream, StreamState};
use tokio::time::sleep;
use tracing::Level;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

async fn push_all(stream: &SlapStream, data: &[u8]) {
    let mut offs = 0;
    while offs < data.len() {
        stream.wait_writable(Duration::from_secs(60)).await.unwrap();
        offs += stream.push(&data[offs..]).unwrap();
    }
}

async fn pull_exact(stream: &SlapStream, len: usize, timeout: Duration) -> Vec<u8> {
    let mut result = Vec::with_capacity(len);
    let mut buf = vec![0u8; len];
    while result.len() < len {
        let n = stream.pull(&mut buf[..len - result.len()], timeout).await.unwrap();
        result.extend_from_slice(&buf[..n]);
    }
    result
}

async fn negotiated(pair: &LoopbackPair) -> LinkParameters {
    let a = pair.a.wait_negotiated(NEGOTIATION_TIMEOUT).await.unwrap();
    let b = pair.b.wait_negotiated(NEGOTIATION_TIMEOUT).await.unwrap();
    assert_eq!(a, b);
    a
}

#[tokio::test(start_paused = true)]
async fn test_transfer_multiple_windows() {
    let pair = LoopbackPair::symmetric(SlapConfig::default()).unwrap();
    let params = negotiated(&pair).await;
    assert_eq!(params, LinkParameters { packet_size: 100, window_size: 4, baud_rate: 115200 });

    let data = test_data(400);
    let (_, received) = tokio::join!(
        push_all(&pair.a, &data),
        pull_exact(&pair.b, data.len(), Duration::from_secs(5)),
    );
    assert_eq!(received, data);

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pull_across_push_boundaries() {
    let pair = LoopbackPair::symmetric(SlapConfig::default()).unwrap();
    negotiated(&pair).await;

    for chunk in [b"AAAAA", b"BBBBB", b"CCCCC", b"DDDDD"] {
        assert_eq!(pair.a.push(chunk).unwrap(), 5);
    }
    for _ in 0..1000 {
        if pair.b.available() == 20 {
            break;
        }
        sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(pair.b.available(), 20);

    let mut buf = [0u8; 12];
    assert_eq!(pair.b.pull(&mut buf, Duration::ZERO).await, Ok(12));
    assert_eq!(&buf, b"AAAAABBBBBCC");

    let mut buf = [0u8; 8];
    assert_eq!(pair.b.pull(&mut buf, Duration::ZERO).await, Ok(8));
    assert_eq!(&buf, b"CCCDDDDD");

    assert_eq!(pair.b.pull(&mut buf, Duration::ZERO).await, Err(SlapError::TimedOut));

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_bidirectional() {
    let pair = LoopbackPair::symmetric(SlapConfig::default()).unwrap();
    negotiated(&pair).await;

    let a_to_b = test_data(1000);
    let b_to_a: Vec<u8> = test_data(777).into_iter().rev().collect();

    let (_, _, at_b, at_a) = tokio::join!(
        push_all(&pair.a, &a_to_b),
        push_all(&pair.b, &b_to_a),
        pull_exact(&pair.b, a_to_b.len(), Duration::from_secs(5)),
        pull_exact(&pair.a, b_to_a.len(), Duration::from_secs(5)),
    );
    assert_eq!(at_b, a_to_b);
    assert_eq!(at_a, b_to_a);

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_close_unblocks_peer_pull() {
    let pair = LoopbackPair::symmetric(SlapConfig::default()).unwrap();
    negotiated(&pair).await;

    let b = pair.b.clone();
    let pending = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        b.pull(&mut buf, Duration::from_secs(10)).await
    });
    sleep(Duration::from_millis(10)).await;
    assert!(!pending.is_finished());

    pair.a.close();
    assert_eq!(pending.await.unwrap(), Err(SlapError::Closed));
    assert_eq!(pair.b.state(), StreamState::Closed);
    assert_eq!(pair.b.push(b"x"), Err(SlapError::Closed));

    // idempotent
    pair.a.close();
    assert_eq!(pair.a.state(), StreamState::Closed);

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lost_closing_frame_is_resent() {
    let pair = LoopbackPair::symmetric(SlapConfig::default()).unwrap();
    negotiated(&pair).await;

    let b = pair.b.clone();
    let pending = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        b.pull(&mut buf, Duration::from_secs(30)).await
    });
    sleep(Duration::from_millis(10)).await;

    pair.link_a.set_impairment(LinkImpairment { drop_probability: 1.0, ..LinkImpairment::none() });
    pair.a.close();
    pair.link_a.set_impairment(LinkImpairment::none());

    assert_eq!(pending.await.unwrap(), Err(SlapError::Closed));
    assert_eq!(pair.b.state(), StreamState::Closed);

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_close_reaches_sending_peer_on_lossy_link() {
    let config = SlapConfig {
        max_retries: 50,
        ..SlapConfig::default()
    };
    let impairment = LinkImpairment {
        drop_probability: 0.3,
        seed: 11,
        ..LinkImpairment::none()
    };
    let pair = LoopbackPair::new(config.clone(), config, 4096, impairment).unwrap();
    negotiated(&pair).await;

    // b keeps sending while a closes
    pair.b.push(&test_data(400)).unwrap();
    pair.a.close();

    let mut buf = [0u8; 16];
    assert_eq!(pair.b.wait_writable(Duration::from_secs(30)).await, Err(SlapError::Closed));
    assert_eq!(pair.b.pull(&mut buf, Duration::ZERO).await, Err(SlapError::Closed));

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_data_received_before_close_can_be_pulled() {
    let pair = LoopbackPair::symmetric(SlapConfig::default()).unwrap();
    negotiated(&pair).await;

    pair.a.push(b"last words").unwrap();
    for _ in 0..1000 {
        if pair.b.available() == 10 {
            break;
        }
        sleep(Duration::from_millis(1)).await;
    }
    pair.a.close();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(pair.b.state(), StreamState::Closed);

    let mut buf = [0u8; 32];
    assert_eq!(pair.b.pull(&mut buf, Duration::from_secs(1)).await, Ok(10));
    assert_eq!(&buf[..10], b"last words");
    assert_eq!(pair.b.pull(&mut buf, Duration::from_secs(1)).await, Err(SlapError::Closed));

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_negotiates_minimum_parameters() {
    let config_a = SlapConfig {
        packet_size: 100,
        window_size: 4,
        baud_rate: 115200,
        ..SlapConfig::default()
    };
    let config_b = SlapConfig {
        packet_size: 64,
        window_size: 8,
        baud_rate: 57600,
        ..SlapConfig::default()
    };
    let pair = LoopbackPair::new(config_a, config_b, 4096, LinkImpairment::none()).unwrap();

    let params = negotiated(&pair).await;
    assert_eq!(params, LinkParameters { packet_size: 64, window_size: 4, baud_rate: 57600 });

    // renegotiation requests do not change frozen parameters
    for _ in 0..5 {
        pair.a.schedule_link_control_packet();
        pair.b.schedule_link_control_packet();
    }
    sleep(Duration::from_millis(100)).await;
    assert_eq!(pair.a.link_parameters(), Some(params));
    assert_eq!(pair.b.link_parameters(), Some(params));

    let data = test_data(1000);
    let (_, received) = tokio::join!(
        push_all(&pair.b, &data),
        pull_exact(&pair.a, data.len(), Duration::from_secs(5)),
    );
    assert_eq!(received, data);

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_push_is_bounded_by_window() {
    let pair = LoopbackPair::symmetric(SlapConfig::default()).unwrap();
    negotiated(&pair).await;

    // acknowledgements from b are lost
    pair.link_b.set_impairment(LinkImpairment { drop_probability: 1.0, ..LinkImpairment::none() });

    let data = test_data(1000);
    assert_eq!(pair.a.push(&data).unwrap(), 400);
    assert_eq!(pair.a.push(&data[400..]).unwrap(), 0);

    pair.link_b.set_impairment(LinkImpairment::none());
    push_all(&pair.a, &data[400..]).await;
    let received = pull_exact(&pair.b, data.len(), Duration::from_secs(10)).await;
    assert_eq!(received, data);

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retransmissions_deliver_exactly_once() {
    let pair = LoopbackPair::symmetric(SlapConfig::default()).unwrap();
    negotiated(&pair).await;

    pair.link_b.set_impairment(LinkImpairment { drop_probability: 1.0, ..LinkImpairment::none() });
    let data = test_data(300);
    assert_eq!(pair.a.push(&data).unwrap(), 300);

    // several rounds of retransmission, b sees duplicates
    sleep(Duration::from_millis(1000)).await;
    assert_eq!(pair.a.state(), StreamState::Open);

    pair.link_b.set_impairment(LinkImpairment::none());
    let received = pull_exact(&pair.b, data.len(), Duration::from_secs(10)).await;
    assert_eq!(received, data);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(pair.b.available(), 0);

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_slow_reader_keeps_link_alive() {
    let config = SlapConfig {
        max_buffered_receive_bytes: 100,
        ..SlapConfig::default()
    };
    let pair = LoopbackPair::symmetric(config).unwrap();
    negotiated(&pair).await;

    let data = test_data(200);
    assert_eq!(pair.a.push(&data).unwrap(), 200);

    // much longer than max_retries retransmissions at the maximum timeout
    sleep(Duration::from_secs(60)).await;
    assert_eq!(pair.a.state(), StreamState::Open);
    assert_eq!(pair.b.state(), StreamState::Open);
    assert_eq!(pair.b.available(), 100);

    let received = pull_exact(&pair.b, data.len(), Duration::from_secs(1)).await;
    assert_eq!(received, data);

    // the link is fully usable afterwards
    let more = test_data(300);
    let (_, received) = tokio::join!(
        push_all(&pair.a, &more),
        pull_exact(&pair.b, more.len(), Duration::from_secs(5)),
    );
    assert_eq!(received, more);

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_wait_writable() {
    let pair = LoopbackPair::symmetric(SlapConfig::default()).unwrap();
    negotiated(&pair).await;
    assert_eq!(pair.a.wait_writable(Duration::ZERO).await, Ok(400));

    pair.link_b.set_impairment(LinkImpairment { drop_probability: 1.0, ..LinkImpairment::none() });
    assert_eq!(pair.a.push(&test_data(1000)).unwrap(), 400);
    assert_eq!(pair.a.wait_writable(Duration::ZERO).await, Err(SlapError::TimedOut));
    assert_eq!(pair.a.wait_writable(Duration::from_millis(50)).await, Err(SlapError::TimedOut));

    let a = pair.a.clone();
    let waiting = tokio::spawn(async move { a.wait_writable(Duration::from_secs(10)).await });
    sleep(Duration::from_millis(10)).await;
    assert!(!waiting.is_finished());

    // acks get through again, retransmissions are acknowledged
    pair.link_b.set_impairment(LinkImpairment::none());
    let capacity = waiting.await.unwrap().unwrap();
    assert!(capacity > 0 && capacity <= 400, "{}", capacity);

    pair.a.close();
    assert_eq!(pair.a.wait_writable(Duration::from_secs(1)).await, Err(SlapError::Closed));

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_duplicating_reordering_link() {
    let config = SlapConfig {
        max_retries: 50,
        ..SlapConfig::default()
    };
    let impairment = LinkImpairment {
        drop_probability: 0.05,
        duplicate_probability: 0.2,
        reorder_probability: 0.2,
        seed: 7,
        ..LinkImpairment::none()
    };
    let pair = LoopbackPair::new(config.clone(), config, 4096, impairment).unwrap();
    negotiated(&pair).await;

    let a_to_b = test_data(3000);
    let b_to_a: Vec<u8> = test_data(2000).into_iter().rev().collect();
    let (_, _, at_b, at_a) = tokio::join!(
        push_all(&pair.a, &a_to_b),
        push_all(&pair.b, &b_to_a),
        pull_exact(&pair.b, a_to_b.len(), Duration::from_secs(60)),
        pull_exact(&pair.a, b_to_a.len(), Duration::from_secs(60)),
    );
    assert_eq!(at_b, a_to_b);
    assert_eq!(at_a, b_to_a);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(pair.a.available(), 0);
    assert_eq!(pair.b.available(), 0);

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lossy_link() {
    let config = SlapConfig {
        max_retries: 50,
        ..SlapConfig::default()
    };
    let impairment = LinkImpairment {
        drop_probability: 0.1,
        corrupt_probability: 0.1,
        seed: 42,
        ..LinkImpairment::none()
    };
    let pair = LoopbackPair::new(config.clone(), config, 4096, impairment).unwrap();
    negotiated(&pair).await;

    let data = test_data(3000);
    let (_, received) = tokio::join!(
        push_all(&pair.a, &data),
        pull_exact(&pair.b, data.len(), Duration::from_secs(60)),
    );
    assert_eq!(received, data);

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_link_dead_after_max_retries() {
    let pair = LoopbackPair::symmetric(SlapConfig::default()).unwrap();
    negotiated(&pair).await;

    pair.link_a.set_impairment(LinkImpairment { drop_probability: 1.0, ..LinkImpairment::none() });
    assert_eq!(pair.a.push(b"into the void").unwrap(), 13);

    let mut buf = [0u8; 16];
    let result = pair.a.pull(&mut buf, Duration::from_secs(120)).await;
    assert!(matches!(result, Err(SlapError::LinkDead(_))), "{:?}", result);
    assert_eq!(pair.a.state(), StreamState::Dead);
    assert!(matches!(pair.a.push(b"more"), Err(SlapError::LinkDead(_))));

    pair.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_data_pushed_before_negotiation() {
    let pair = LoopbackPair::symmetric(SlapConfig::default()).unwrap();

    assert_eq!(pair.a.push(b"early bird").unwrap(), 10);
    let received = pull_exact(&pair.b, 10, Duration::from_secs(5)).await;
    assert_eq!(received, b"early bird");

    pair.shutdown().await.unwrap();
}
