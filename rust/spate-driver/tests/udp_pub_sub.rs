//! End-to-end UDP over loopback: setup handshake, flow control, loss
//! repair via NAK, and heartbeat keepalive.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use spate_driver::client::{Offer, SpateClient, SubscriptionImage};
use spate_driver::system_counters::SystemCounterId;
use spate_driver::{DriverConfig, MediaDriver, ThreadingMode};

fn test_config(dir: &std::path::Path) -> DriverConfig {
    let mut config = DriverConfig::default();
    config.dir = dir.join("driver");
    config.term_buffer_length = 64 * 1024;
    config.initial_window_length = 32 * 1024;
    config.threading_mode = ThreadingMode::Dedicated;
    config.status_message_timeout_ns = 20_000_000; // 20ms
    config.heartbeat_interval_ns = 20_000_000;
    config.nak_unicast_delay_ns = 5_000_000; // 5ms
    config.retransmit_unicast_delay_ns = 0;
    config
}

fn free_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
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
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn loopback_delivery_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = MediaDriver::launch(test_config(dir.path())).unwrap();

    let port = free_port();
    let channel = format!("spate:udp?endpoint=127.0.0.1:{port}");

    let mut client = SpateClient::connect(&driver.config().dir).unwrap();
    let subscription = client.add_subscription(&channel, 1001).unwrap();
    let mut publication = client.add_publication(&channel, 1001).unwrap();
    let mut image = await_image(&mut client, &subscription);

    const MESSAGES: usize = 100;
    let mut sent = 0usize;
    let mut received = 0usize;
    let deadline = Instant::now() + Duration::from_secs(10);

    let mut iterations = 0u64;
    while received < MESSAGES {
        assert!(Instant::now() < deadline, "stalled at {received}/{MESSAGES}");
        iterations += 1;
        if iterations % 256 == 0 {
            client.send_keepalive().unwrap();
        }

        if sent < MESSAGES {
            let mut payload = [0u8; 64];
            payload[..8].copy_from_slice(&(sent as u64).to_le_bytes());
            match publication.offer(&payload) {
                Offer::Ok(_) => sent += 1,
                Offer::BackPressured | Offer::NotConnected => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => panic!("offer failed: {other:?}"),
            }
        }

        received += image.poll(
            |payload| {
                let sequence = u64::from_le_bytes(payload[..8].try_into().unwrap());
                assert_eq!(sequence as usize, received, "out of order delivery");
            },
            16,
        );
    }

    assert!(client.counter_value(SystemCounterId::BytesSent as i32) > 0);
    assert!(client.counter_value(SystemCounterId::BytesReceived as i32) > 0);
    driver.close();
}

/// Forwarding proxy between publisher and subscriber that drops exactly
/// one DATA frame, forcing a NAK round trip.
struct DropOnceProxy {
    port: u16,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl DropOnceProxy {
    fn start(receiver_port: u16, drop_nth_data: usize) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            let receiver_addr: std::net::SocketAddr =
                format!("127.0.0.1:{receiver_port}").parse().unwrap();
            let mut sender_addr = None;
            let mut data_frames = 0usize;
            let mut dropped = false;
            let mut buf = [0u8; 64 * 1024];

            while !thread_stop.load(Ordering::Acquire) {
                let Ok((length, src)) = socket.recv_from(&mut buf) else { continue };

                if src == receiver_addr {
                    // Control traffic (SM/NAK/RTTM) back to the sender.
                    if let Some(sender) = sender_addr {
                        let _ = socket.send_to(&buf[..length], sender);
                    }
                    continue;
                }

                sender_addr = Some(src);
                // DATA frame with a payload (frame_length > 0, type 0x01).
                let is_data = length >= 8
                    && buf[6] == 0x01
                    && buf[7] == 0x00
                    && i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) > 0;
                if is_data {
                    data_frames += 1;
                    if !dropped && data_frames == drop_nth_data {
                        dropped = true;
                        eprintln!("proxy: dropping data frame #{data_frames}");
                        continue;
                    }
                }
                let _ = socket.send_to(&buf[..length], receiver_addr);
            }
        });

        Self { port, stop, handle: Some(handle) }
    }
}

impl Drop for DropOnceProxy {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn single_loss_is_repaired_by_nak() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = MediaDriver::launch(test_config(dir.path())).unwrap();

    // The sender batches frames per datagram, so drop an early datagram to
    // be sure the stream is still in flight when it happens.
    let receiver_port = free_port();
    let proxy = DropOnceProxy::start(receiver_port, 10);

    let mut client = SpateClient::connect(&driver.config().dir).unwrap();
    let subscription = client
        .add_subscription(&format!("spate:udp?endpoint=127.0.0.1:{receiver_port}"), 5)
        .unwrap();
    let mut publication = client
        .add_publication(&format!("spate:udp?endpoint=127.0.0.1:{}", proxy.port), 5)
        .unwrap();
    let mut image = await_image(&mut client, &subscription);

    const MESSAGES: usize = 100;
    let mut sent = 0usize;
    let mut received = 0usize;
    let deadline = Instant::now() + Duration::from_secs(15);

    let mut iterations = 0u64;
    while received < MESSAGES {
        assert!(
            Instant::now() < deadline,
            "stalled at {received}/{MESSAGES}; loss not repaired"
        );
        iterations += 1;
        if iterations % 256 == 0 {
            client.send_keepalive().unwrap();
        }

        if sent < MESSAGES {
            let mut payload = [0u8; 64];
            payload[..8].copy_from_slice(&(sent as u64).to_le_bytes());
            match publication.offer(&payload) {
                Offer::Ok(_) => sent += 1,
                Offer::BackPressured | Offer::NotConnected => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => panic!("offer failed: {other:?}"),
            }
        }

        received += image.poll(
            |payload| {
                let sequence = u64::from_le_bytes(payload[..8].try_into().unwrap());
                assert_eq!(sequence as usize, received, "out of order delivery");
            },
            16,
        );
    }

    assert!(
        client.counter_value(SystemCounterId::NaksSent as i32) >= 1,
        "loss should have produced a NAK"
    );
    assert!(
        client.counter_value(SystemCounterId::RetransmitsSent as i32) >= 1,
        "NAK should have produced a retransmit"
    );
    driver.close();
}

#[test]
fn heartbeats_keep_an_idle_image_alive() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.image_liveness_timeout_ns = 500_000_000; // 500ms
    let mut driver = MediaDriver::launch(config).unwrap();

    let port = free_port();
    let channel = format!("spate:udp?endpoint=127.0.0.1:{port}");

    let mut client = SpateClient::connect(&driver.config().dir).unwrap();
    let subscription = client.add_subscription(&channel, 3).unwrap();
    let mut publication = client.add_publication(&channel, 3).unwrap();
    let mut image = await_image(&mut client, &subscription);

    while publication.offer(b"warmup") == Offer::NotConnected {
        std::thread::sleep(Duration::from_millis(1));
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while image.poll(|_| {}, 4) == 0 {
        assert!(Instant::now() < deadline);
    }

    // Publish nothing for several liveness windows; heartbeats must keep
    // the image alive the whole time.
    let quiet_until = Instant::now() + Duration::from_millis(1500);
    while Instant::now() < quiet_until {
        client.send_keepalive().unwrap();
        assert!(
            !client.image_unavailable(&subscription),
            "idle image went unavailable despite heartbeats"
        );
        std::thread::sleep(Duration::from_millis(50));
    }

    assert!(client.counter_value(SystemCounterId::HeartbeatsSent as i32) > 0);
    assert!(client.counter_value(SystemCounterId::HeartbeatsReceived as i32) > 0);
    driver.close();
}
