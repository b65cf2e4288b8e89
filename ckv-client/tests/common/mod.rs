#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use ckv_client::{NodeAddress, Value};
use ckv_common::parse_value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// What a fake node does with one command.
pub enum Response {
    Reply(Vec<u8>),
    Delayed(Duration, Vec<u8>),
    /// Read the command, never answer.
    Silent,
    /// Drop the connection.
    Close,
}

pub type Handler = Arc<dyn Fn(&[Vec<u8>]) -> Response + Send + Sync>;

struct State {
    handler: Mutex<Handler>,
    received: AtomicUsize,
    accepted: AtomicUsize,
    log: Mutex<Vec<Vec<String>>>,
}

/// In-process RESP node on 127.0.0.1 with an ephemeral port.
pub struct FakeNode {
    pub addr: NodeAddress,
    state: Arc<State>,
}

impl FakeNode {
    pub async fn start(handler: Handler) -> FakeNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let state = Arc::new(State {
            handler: Mutex::new(handler),
            received: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        FakeNode {
            addr: NodeAddress::new("127.0.0.1", port),
            state,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port
    }

    pub fn set_handler(&self, handler: Handler) {
        *self.state.handler.lock().unwrap() = handler;
    }

    pub fn bytes_received(&self) -> usize {
        self.state.received.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Every command received so far, tokens upper-cased for the name only.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.log.lock().unwrap().clone()
    }

    /// How many received commands start with `name` (`"GET"`, `"CLUSTER SLOTS"`).
    pub fn count(&self, name: &str) -> usize {
        let wanted: Vec<String> = name.split(' ').map(|s| s.to_ascii_uppercase()).collect();
        self.commands()
            .iter()
            .filter(|tokens| {
                tokens.len() >= wanted.len()
                    && tokens
                        .iter()
                        .zip(&wanted)
                        .all(|(token, want)| token.eq_ignore_ascii_case(want))
            })
            .count()
    }
}

async fn serve(mut stream: TcpStream, state: Arc<State>) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let n = match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        state.received.fetch_add(n, Ordering::SeqCst);

        while let Ok(Some((value, used))) = parse_value(&buf) {
            buf.advance(used);
            let args = tokens(value);
            state.log.lock().unwrap().push(
                args.iter()
                    .map(|a| String::from_utf8_lossy(a).into_owned())
                    .collect(),
            );

            let handler = state.handler.lock().unwrap().clone();
            match handler(&args) {
                Response::Reply(bytes) => {
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Response::Delayed(delay, bytes) => {
                    tokio::time::sleep(delay).await;
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Response::Silent => {}
                Response::Close => return,
            }
        }
    }
}

fn tokens(value: Value) -> Vec<Vec<u8>> {
    value
        .into_sequence()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| v.as_bytes().map(|b| b.to_vec()))
        .collect()
}

pub fn name(args: &[Vec<u8>]) -> String {
    args.first()
        .map(|n| String::from_utf8_lossy(n).to_ascii_uppercase())
        .unwrap_or_default()
}

pub fn simple(text: &str) -> Vec<u8> {
    format!("+{}\r\n", text).into_bytes()
}

pub fn error(text: &str) -> Vec<u8> {
    format!("-{}\r\n", text).into_bytes()
}

pub fn int(value: i64) -> Vec<u8> {
    format!(":{}\r\n", value).into_bytes()
}

pub fn bulk(data: &str) -> Vec<u8> {
    format!("${}\r\n{}\r\n", data.len(), data).into_bytes()
}

pub fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn array(items: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend(item);
    }
    out
}

/// `CLUSTER SLOTS` reply. Each range lists its primary port first, then
/// replica ports; every node is on 127.0.0.1.
pub fn cluster_slots(ranges: &[(u16, u16, Vec<u16>)]) -> Vec<u8> {
    array(
        ranges
            .iter()
            .map(|(start, end, ports)| {
                let mut entry = vec![int(*start as i64), int(*end as i64)];
                for port in ports {
                    entry.push(array(vec![bulk("127.0.0.1"), int(*port as i64)]));
                }
                array(entry)
            })
            .collect(),
    )
}
