use std::{net::SocketAddr, sync::Arc, time::Duration};

use primary_kv::{
    envelope::{Envelope, Get, Response},
    net::{self, WireError},
    task::Supervisor,
    ClusterTopology, Replica,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

fn serve_single() -> (SocketAddr, Supervisor) {
    let listener = net::bind(([127, 0, 0, 1], 0).into()).unwrap();
    let addr = listener.local_addr().unwrap();
    let topology = ClusterTopology::new(addr, vec![addr]).unwrap();
    let replica = Arc::new(Replica::new(addr, topology.into()).unwrap());
    let supervisor = Supervisor::default();
    supervisor.spawner().spawn("replica", replica.serve(listener));
    (addr, supervisor)
}

async fn assert_dropped(mut stream: TcpStream) {
    let mut buf = Vec::new();
    let read = timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("connection closed");
    // either a clean close or a reset, but never an answer
    if read.is_ok() {
        assert!(buf.is_empty())
    }
}

async fn assert_serving(addr: SocketAddr) {
    let get = Get {
        key: "a".into(),
        client_timestamp: 0,
        client_addr: None,
    };
    assert_eq!(
        net::call(addr, &Envelope::from(get)).await.unwrap(),
        Envelope::Response(Response::NotFound)
    );
}

#[tokio::test]
async fn garbage_frame_drops_only_that_connection() {
    let (addr, _supervisor) = serve_single();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_u32(3).await.unwrap();
    stream.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
    assert_dropped(stream).await;
    assert_serving(addr).await;
}

#[tokio::test]
async fn oversized_frame_drops_only_that_connection() {
    let (addr, _supervisor) = serve_single();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_u32(u32::MAX).await.unwrap();
    assert_dropped(stream).await;
    assert_serving(addr).await;
}

#[tokio::test]
async fn response_sent_as_request_is_refused() {
    let (addr, _supervisor) = serve_single();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    net::write_envelope(&mut stream, &Envelope::Response(Response::ReplicationOk))
        .await
        .unwrap();
    assert_dropped(stream).await;
    assert_serving(addr).await;
}

#[tokio::test]
async fn half_sent_frame_drops_only_that_connection() {
    let (addr, _supervisor) = serve_single();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_u32(100).await.unwrap();
    stream.write_all(&[0; 10]).await.unwrap();
    stream.shutdown().await.unwrap();
    assert_dropped(stream).await;
    assert_serving(addr).await;
}

#[tokio::test]
async fn call_reports_decode_failure() {
    let listener = net::bind(([127, 0, 0, 1], 0).into()).unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = net::read_envelope(&mut stream).await;
        stream.write_u32(2).await.unwrap();
        stream.write_all(&[0xfe, 0xfe]).await.unwrap();
    });
    let err = net::call(addr, &Envelope::Response(Response::NotFound))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WireError>(),
        Some(WireError::Decode(_))
    ));
}
