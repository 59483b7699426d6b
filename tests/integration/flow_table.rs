//! Flow table integration tests against a real loopback SOCKS5 forwarder

use std::net::SocketAddrV4;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt};

use disguise_tunnel::flow::{FlowKey, FlowTable, InterfaceWriter, Socks5Dialer};
use disguise_tunnel::packet::{parse, IpProtocol};
use disguise_tunnel::protect::default_protector;

use super::support::{tcp_frame, wait_until, EchoForwarder};

const WAIT: Duration = Duration::from_secs(5);

fn table_for(forwarder: &EchoForwarder) -> Arc<FlowTable> {
    let dialer = Socks5Dialer::fixed(forwarder.port, default_protector(), Duration::from_secs(2));
    Arc::new(FlowTable::new(Arc::new(dialer), 1460))
}

#[tokio::test]
async fn test_burst_before_dial_opens_one_proxy_connection() {
    let forwarder = EchoForwarder::spawn(0).await.unwrap();
    let table = table_for(&forwarder);
    let (device, mut observer) = duplex(1 << 20);
    let writer = InterfaceWriter::new(device);

    let src: SocketAddrV4 = "10.0.0.2:41000".parse().unwrap();
    let dst: SocketAddrV4 = "1.2.3.4:80".parse().unwrap();

    let mut tasks = Vec::new();
    for i in 0..16u8 {
        let table = Arc::clone(&table);
        let writer = writer.clone();
        let frame = tcp_frame(src, dst, &[b'a' + i]);
        tasks.push(tokio::spawn(async move {
            let packet = parse(&frame, frame.len()).unwrap();
            table.handle(packet, &writer).unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(table.len(), 1);

    // All sixteen payload bytes come back, in some number of frames
    let mut echoed = Vec::new();
    let mut buffer = vec![0u8; 65535];
    while echoed.len() < 16 {
        let n = tokio::time::timeout(WAIT, observer.read(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        let mut offset = 0;
        while offset < n {
            let reply = parse(&buffer[offset..n], n - offset).unwrap();
            let total = usize::from(u16::from_be_bytes([buffer[offset + 2], buffer[offset + 3]]));
            echoed.extend_from_slice(reply.payload());
            offset += total;
        }
    }
    echoed.sort_unstable();
    assert_eq!(echoed, (0..16u8).map(|i| b'a' + i).collect::<Vec<_>>());

    assert_eq!(forwarder.connections.load(Ordering::SeqCst), 1);
    table.shutdown();
}

#[tokio::test]
async fn test_distinct_flows_get_distinct_connections() {
    let forwarder = EchoForwarder::spawn(0).await.unwrap();
    let table = table_for(&forwarder);
    let (device, _observer) = duplex(1 << 20);
    let writer = InterfaceWriter::new(device);
    let dst: SocketAddrV4 = "1.2.3.4:80".parse().unwrap();

    for port in 42000..42004u16 {
        let src = SocketAddrV4::new("10.0.0.2".parse().unwrap(), port);
        let frame = tcp_frame(src, dst, b"x");
        table.handle(parse(&frame, frame.len()).unwrap(), &writer).unwrap();
    }

    assert_eq!(table.len(), 4);
    assert!(wait_until(|| forwarder.connections.load(Ordering::SeqCst) == 4, WAIT).await);

    let key = FlowKey::new(IpProtocol::Tcp, "10.0.0.2:42000".parse().unwrap(), dst);
    assert!(table.remove(&key));
    assert!(!table.remove(&key));
    assert_eq!(table.len(), 3);

    table.shutdown();
    assert!(table.is_empty());
}

#[tokio::test]
async fn test_forwarder_loss_tears_sessions_down() {
    let forwarder = EchoForwarder::spawn(0).await.unwrap();
    let table = table_for(&forwarder);
    let (device, _observer) = duplex(1 << 20);
    let writer = InterfaceWriter::new(device);

    let frame = tcp_frame("10.0.0.2:43000".parse().unwrap(), "1.2.3.4:80".parse().unwrap(), b"x");
    table.handle(parse(&frame, frame.len()).unwrap(), &writer).unwrap();
    assert!(wait_until(|| forwarder.connections.load(Ordering::SeqCst) == 1, WAIT).await);

    forwarder.close();
    assert!(wait_until(|| table.is_empty(), WAIT).await);
}
