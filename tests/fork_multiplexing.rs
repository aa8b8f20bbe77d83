//! End-to-end tests for fork demultiplexing and orphan request
//! termination across two connected channels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fork_channel::testing::RecordingHandler;
use fork_channel::{
    Channel, ChannelFactory, CorrelationHeader, CorrelationType, Error, Flags, ForkHeader,
    InMemorySocketRegistry, Message, ProtocolConfig, ProtocolStackConfiguration, SocketBinding,
    TransportConfig,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// Window after which we consider "no message" settled.
const QUIET_PERIOD: Duration = Duration::from_millis(300);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn connected_channel(node_name: &str) -> Channel {
    let registry = Arc::new(InMemorySocketRegistry::new());
    let config = ProtocolStackConfiguration::new(node_name, registry)
        .with_transport(TransportConfig::new(SocketBinding::new(
            format!("{node_name}-udp"),
            loopback(),
        )))
        .with_protocol(ProtocolConfig::new("FD_ALL"));
    let channel = ChannelFactory::new(config)
        .create_channel("ee")
        .expect("stack assembly failed");
    channel.connect().await.expect("connect failed");
    channel
}

async fn recv_one(handler: &RecordingHandler) -> Message {
    tokio::time::timeout(RECV_TIMEOUT, handler.received().recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("handler queue closed")
}

#[tokio::test]
async fn registered_fork_receives_multiplexed_messages() {
    let a = connected_channel("node-a").await;
    let b = connected_channel("node-b").await;

    let handler = Arc::new(RecordingHandler::new());
    b.register_fork("session-registry", handler.clone()).unwrap();

    a.send(
        Message::new()
            .with_src(a.address())
            .with_dest(b.address())
            .with_fork(ForkHeader::new("web", "session-registry"))
            .with_payload(Bytes::from_static(b"hello")),
    )
    .unwrap();

    let delivered = recv_one(&handler).await;
    assert_eq!(delivered.payload, Bytes::from_static(b"hello"));
    assert_eq!(
        delivered.fork.as_ref().unwrap().channel_id,
        "session-registry"
    );
    assert_eq!(delivered.src.as_ref().unwrap().addr(), a.address().addr());
}

#[tokio::test]
async fn orphaned_request_gets_exactly_one_empty_response() {
    let a = connected_channel("node-a").await;
    let b = connected_channel("node-b").await;

    // The requester still has its fork endpoint; only the target lost it
    // (undeploy raced with the in-flight call).
    let requester = Arc::new(RecordingHandler::new());
    a.register_fork("session-registry", requester.clone()).unwrap();

    a.send(
        Message::new()
            .with_src(a.address())
            .with_dest(b.address())
            .with_flags(Flags::RSVP.with(Flags::OOB))
            .with_fork(ForkHeader::new("web", "session-registry"))
            .with_correlation(CorrelationHeader::request(77, 2, true))
            .with_payload(Bytes::from_static(b"invoke")),
    )
    .unwrap();

    let response = recv_one(&requester).await;
    assert!(!response.has_payload());
    assert!(ChannelFactory::is_unknown_fork_response(&response));
    assert_eq!(response.dest.as_ref().unwrap().addr(), a.address().addr());
    assert_eq!(response.src.as_ref().unwrap().addr(), b.address().addr());

    let header = response.correlation.unwrap();
    assert_eq!(header.kind, CorrelationType::Response);
    assert_eq!(header.request_id, 77);
    assert_eq!(header.correlation_id, 2);

    // The delivery-guarantee flag is cleared, the rest carried over.
    assert!(!response.flags.contains(Flags::RSVP));
    assert!(response.flags.contains(Flags::OOB));

    // Exactly one response: nothing else shows up afterwards.
    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(requester.pending(), 0);
}

#[tokio::test]
async fn one_way_message_to_unknown_fork_is_silently_dropped() {
    let a = connected_channel("node-a").await;
    let b = connected_channel("node-b").await;

    let requester = Arc::new(RecordingHandler::new());
    a.register_fork("session-registry", requester.clone()).unwrap();

    // No correlation header: nobody waits, so no response may be sent.
    a.send(
        Message::new()
            .with_src(a.address())
            .with_dest(b.address())
            .with_fork(ForkHeader::new("web", "session-registry"))
            .with_payload(Bytes::from_static(b"fire-and-forget")),
    )
    .unwrap();

    // A request not expecting a response must not be answered either.
    a.send(
        Message::new()
            .with_src(a.address())
            .with_dest(b.address())
            .with_fork(ForkHeader::new("web", "session-registry"))
            .with_correlation(CorrelationHeader::request(78, 2, false))
            .with_payload(Bytes::from_static(b"notify")),
    )
    .unwrap();

    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(requester.pending(), 0);
}

#[tokio::test]
async fn application_responses_are_not_mistaken_for_orphan_responses() {
    let response = Message::new()
        .with_correlation(CorrelationHeader::response(5, 1))
        .with_payload(Bytes::from_static(b"result"));
    assert!(!ChannelFactory::is_unknown_fork_response(&response));

    let synthetic = Message::new().with_correlation(CorrelationHeader::response(5, 1));
    assert!(ChannelFactory::is_unknown_fork_response(&synthetic));
}

#[tokio::test]
async fn duplicate_fork_registration_is_rejected() {
    let a = connected_channel("node-a").await;
    a.register_fork("web", Arc::new(RecordingHandler::new()))
        .unwrap();
    let err = a
        .register_fork("web", Arc::new(RecordingHandler::new()))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateFork(id) if id == "web"));

    // After deregistration the id is free again.
    assert!(a.deregister_fork("web"));
    a.register_fork("web", Arc::new(RecordingHandler::new()))
        .unwrap();
}

#[tokio::test]
async fn deregistered_fork_turns_pending_calls_into_orphans() {
    let a = connected_channel("node-a").await;
    let b = connected_channel("node-b").await;

    let requester = Arc::new(RecordingHandler::new());
    a.register_fork("jobs", requester.clone()).unwrap();

    let target = Arc::new(RecordingHandler::new());
    b.register_fork("jobs", target.clone()).unwrap();
    assert!(b.deregister_fork("jobs"));

    a.send(
        Message::new()
            .with_src(a.address())
            .with_dest(b.address())
            .with_fork(ForkHeader::new("batch", "jobs"))
            .with_correlation(CorrelationHeader::request(1, 9, true))
            .with_payload(Bytes::from_static(b"run")),
    )
    .unwrap();

    let response = recv_one(&requester).await;
    assert!(ChannelFactory::is_unknown_fork_response(&response));
    assert_eq!(target.pending(), 0);
}

#[tokio::test]
async fn failed_bind_leaves_the_channel_reconnectable() {
    // Occupy the port so the first bind fails with AddrInUse.
    let blocker = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = blocker.local_addr().unwrap();

    let registry = Arc::new(InMemorySocketRegistry::new());
    let config = ProtocolStackConfiguration::new("node-a", registry.clone())
        .with_transport(TransportConfig::new(SocketBinding::new("node-a-udp", addr)));
    let channel = ChannelFactory::new(config).create_channel("ee").unwrap();

    let err = channel.connect().await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "unexpected error: {err}");
    assert!(!channel.is_open());
    assert!(!registry.is_bound("node-a-udp"));

    // Retry after the port frees up must attempt the bind again, not
    // report the channel as already connected.
    drop(blocker);
    channel.connect().await.expect("retry after a failed bind");
    assert!(channel.is_open());
    assert!(registry.is_bound("node-a-udp"));
}

#[tokio::test]
async fn close_releases_the_managed_binding() {
    let registry = Arc::new(InMemorySocketRegistry::new());
    let config = ProtocolStackConfiguration::new("node-a", registry.clone()).with_transport(
        TransportConfig::new(SocketBinding::new("node-a-udp", loopback())),
    );
    let channel = ChannelFactory::new(config).create_channel("ee").unwrap();
    channel.connect().await.unwrap();
    assert!(registry.is_bound("node-a-udp"));

    channel.close();
    assert!(!registry.is_bound("node-a-udp"));
    assert!(!channel.is_open());
}
