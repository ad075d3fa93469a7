//! UDP channels against a loopback peer
//!
//! Run with: cargo test -p fieldlink-tests --test udp_e2e_test

use std::sync::Arc;

use fieldlink::config::UdpConfig;
use fieldlink::transport::udp::UdpTransport;
use fieldlink::{Channel, Device, DeviceOptions, OutboundMessage, SignedProtocol, TransportKind};
use fieldlink_tests::UdpPeer;
use serial_test::serial;
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[serial]
async fn test_request_over_udp() {
    let peer = UdpPeer::echo().await;
    let transport = Arc::new(UdpTransport::new(&UdpConfig {
        local: "127.0.0.1:0".to_string(),
        remote: peer.addr().to_string(),
    }));
    let channel = Channel::new("udp", transport.clone());
    assert_eq!(channel.kind(), TransportKind::Datagram);

    let dev = Device::new(
        "sensor",
        Arc::new(SignedProtocol::default()),
        DeviceOptions::default(),
    );
    dev.attach(&channel, None).unwrap();
    let cancel = CancellationToken::new();

    for payload in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
        let reply = dev
            .send_then_return(&OutboundMessage::new(payload.clone()), &cancel)
            .await
            .unwrap();
        assert_eq!(reply.payload.to_vec(), payload);
    }
    assert!(transport.local_addr().is_some());

    dev.dispose().await;
    assert!(transport.local_addr().is_none());
}
