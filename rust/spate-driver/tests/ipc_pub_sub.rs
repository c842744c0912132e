//! End-to-end IPC: publisher and subscriber through one driver, no
//! sockets involved.

use std::time::{Duration, Instant};

use spate_driver::client::{Offer, SpateClient, SubscriptionImage};
use spate_driver::{DriverConfig, MediaDriver, ThreadingMode};

fn test_config(dir: &std::path::Path) -> DriverConfig {
    let mut config = DriverConfig::default();
    config.dir = dir.join("driver");
    config.term_buffer_length = 64 * 1024;
    config.ipc_term_buffer_length = 64 * 1024;
    config.initial_window_length = 32 * 1024;
    config.threading_mode = ThreadingMode::Shared;
    config.publication_linger_timeout_ns = 200_000_000;
    config
}

fn await_image(
    client: &mut SpateClient,
    subscription: &spate_driver::client::Subscription,
) -> SubscriptionImage {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(image) = client.try_next_image(subscription).unwrap() {
            return image;
        }
        assert!(Instant::now() < deadline, "image never became available");
        std::thread::yield_now();
    }
}

#[test]
fn one_thousand_messages_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = MediaDriver::launch(test_config(dir.path())).unwrap();

    let mut client = SpateClient::connect(&driver.config().dir).unwrap();
    let subscription = client.add_subscription("spate:ipc", 1001).unwrap();
    let mut publication = client.add_publication("spate:ipc", 1001).unwrap();
    let mut image = await_image(&mut client, &subscription);

    const MESSAGES: usize = 1000;
    const LENGTH: usize = 200;
    // 200-byte payload + 32-byte header aligned to 32 = 256 per message.
    const ALIGNED_FRAME: i64 = 256;

    let mut received = 0usize;
    let mut sent = 0usize;
    let mut iterations = 0u64;
    let deadline = Instant::now() + Duration::from_secs(10);

    while received < MESSAGES {
        assert!(Instant::now() < deadline, "stalled at {received}/{MESSAGES}");
        iterations += 1;
        if iterations % 1024 == 0 {
            client.send_keepalive().unwrap();
        }

        if sent < MESSAGES {
            let mut payload = [0u8; LENGTH];
            payload[..8].copy_from_slice(&(sent as u64).to_le_bytes());
            match publication.offer(&payload) {
                Offer::Ok(_) => sent += 1,
                Offer::BackPressured | Offer::NotConnected => {}
                other => panic!("offer failed: {other:?}"),
            }
        }

        received += image.poll(
            |payload| {
                assert_eq!(payload.len(), LENGTH);
                let sequence = u64::from_le_bytes(payload[..8].try_into().unwrap());
                assert_eq!(sequence as usize, received, "out of order delivery");
            },
            16,
        );
    }

    assert_eq!(received, MESSAGES);
    assert_eq!(image.position(), MESSAGES as i64 * ALIGNED_FRAME);
    assert_eq!(publication.position(), image.position());

    driver.close();
}

#[test]
fn subscriber_position_gates_the_publisher() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = MediaDriver::launch(test_config(dir.path())).unwrap();

    let mut client = SpateClient::connect(&driver.config().dir).unwrap();
    let subscription = client.add_subscription("spate:ipc", 7).unwrap();
    let mut publication = client.add_publication("spate:ipc", 7).unwrap();
    let _image = await_image(&mut client, &subscription);

    // Never polling the image: the producer must hit back-pressure once
    // the term window (half the term) is ahead of the consumer.
    let payload = [0u8; 992]; // 1024-byte frames
    let mut offered = 0i64;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match publication.offer(&payload) {
            Offer::Ok(_) => offered += 1,
            Offer::BackPressured => break,
            other => panic!("unexpected: {other:?}"),
        }
        assert!(Instant::now() < deadline, "never back-pressured");
        assert!(offered < 64, "wrote past the term window");
    }
    assert!(offered >= 31, "back-pressured too early after {offered} frames");

    driver.close();
}

#[test]
fn end_of_stream_reaches_the_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = MediaDriver::launch(test_config(dir.path())).unwrap();

    let mut client = SpateClient::connect(&driver.config().dir).unwrap();
    let subscription = client.add_subscription("spate:ipc", 9).unwrap();
    let mut publication = client.add_publication("spate:ipc", 9).unwrap();
    let mut image = await_image(&mut client, &subscription);

    while publication.offer(b"last words") == Offer::NotConnected {}
    client.remove_publication(&publication).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut got = 0;
    while !(got == 1 && image.is_end_of_stream()) {
        assert!(Instant::now() < deadline, "end of stream never observed");
        got += image.poll(|payload| assert_eq!(payload, b"last words"), 4);
        client.send_keepalive().unwrap();
    }

    driver.close();
}
