//! Internal stress tests for the cluster client over real TCP pools.
//!
//! A fake single-node cluster answers `CLUSTER SLOTS` with its own address and
//! serves GET/SET from a shared map. Many tasks hit it concurrently while the
//! topology is refreshed underneath them.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::cluster::ClusterClient;
use crate::proto::codec::{Decoder, Encoder};
use crate::proto::frame::Frame;

type Store = Arc<Mutex<HashMap<Bytes, Bytes>>>;

fn slots_reply(port: u16) -> Frame {
    Frame::Array(vec![Frame::Array(vec![
        Frame::Integer(0),
        Frame::Integer(16383),
        Frame::Array(vec![
            Frame::bulk("127.0.0.1"),
            Frame::Integer(i64::from(port)),
            Frame::bulk("stress-node"),
        ]),
    ])])
}

fn respond(frame: Frame, port: u16, store: &Store) -> Frame {
    let Frame::Array(args) = frame else {
        return Frame::error("ERR format");
    };
    let word = |i: usize| match args.get(i) {
        Some(Frame::BulkString(Some(b))) => Some(b.clone()),
        _ => None,
    };
    let Some(cmd) = word(0) else {
        return Frame::error("ERR unknown command");
    };

    match cmd.to_ascii_uppercase().as_slice() {
        b"PING" => Frame::simple("PONG"),
        b"CLUSTER" => slots_reply(port),
        b"GET" => match word(1) {
            Some(key) => Frame::BulkString(store.lock().get(&key).cloned()),
            None => Frame::error("ERR wrong number of arguments for 'get' command"),
        },
        b"SET" => match (word(1), word(2)) {
            (Some(key), Some(value)) => {
                store.lock().insert(key, value);
                Frame::simple("OK")
            }
            _ => Frame::error("ERR wrong number of arguments for 'set' command"),
        },
        _ => Frame::simple("OK"),
    }
}

async fn serve(mut socket: TcpStream, port: u16, store: Store) {
    let mut decoder = Decoder::new();
    let mut encoder = Encoder::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.append(&buf[..n]);

        while let Ok(Some(frame)) = decoder.decode() {
            encoder.encode(&respond(frame, port, &store));
            let data = encoder.take();
            if socket.write_all(&data).await.is_err() {
                return;
            }
        }
    }
}

async fn fake_node() -> (String, Store) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let store = Store::default();

    let shared = store.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve(socket, addr.port(), shared.clone()));
        }
    });

    (format!("redis://{addr}"), store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_during_refresh() {
    let (addr, store) = fake_node().await;

    let client = ClusterClient::builder()
        .seeds(addr)
        .max_connections_per_node(16)
        .build()
        .await
        .expect("Failed to connect");
    assert!(client.is_fully_covered());

    let mut handles = Vec::new();
    for i in 0..500 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("key:{i}");
            client.set(key.clone(), format!("value:{i}")).await.unwrap();
            let value = client.get(key).await.unwrap();
            assert_eq!(value, Some(Bytes::from(format!("value:{i}"))));
        }));
    }

    let refresher = {
        let client = client.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                client.refresh_topology().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    for handle in handles {
        handle.await.unwrap();
    }
    refresher.await.unwrap();

    assert_eq!(store.lock().len(), 500);
    assert_eq!(client.node_count(), 1);
    client.ping_all().await.unwrap();
    client.close();
}
