mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ckv_client::{Client, ClientConfig, ClientError, Command, ConfigurationError, ProtocolVersion, Value};
use common::{array, bulk, error, int, name, nil, simple, FakeNode, Response};
use tokio::net::TcpListener;

/// Single node backed by an in-memory map.
async fn spawn_store() -> FakeNode {
    let store: Mutex<HashMap<Vec<u8>, Vec<u8>>> = Mutex::new(HashMap::new());
    FakeNode::start(Arc::new(move |args: &[Vec<u8>]| {
        let mut store = store.lock().unwrap();
        Response::Reply(match name(args).as_str() {
            "PING" => simple("PONG"),
            "SET" => {
                store.insert(args[1].clone(), args[2].clone());
                simple("OK")
            }
            "GET" => match store.get(&args[1]) {
                Some(value) => bulk(&String::from_utf8_lossy(value)),
                None => nil(),
            },
            "DEL" => int(args[1..].iter().filter(|key| store.remove(*key).is_some()).count() as i64),
            "INFO" => bulk("# Server\r\nrole:master\r\n"),
            _ => error("ERR unknown command"),
        })
    }))
    .await
}

fn config(node: &FakeNode) -> ClientConfig {
    let mut config = ClientConfig::standalone(node.addr.clone());
    config.request_timeout = Duration::from_millis(500);
    config.reconnect.num_of_retries = 0;
    config
}

#[tokio::test]
async fn set_get_and_delete() {
    let node = spawn_store().await;
    let client = Client::connect(config(&node)).await.unwrap();

    client.set("alpha", "1").await.unwrap();
    client.set("beta", "2").await.unwrap();
    assert_eq!(client.get("alpha").await.unwrap(), Some(Bytes::from_static(b"1")));
    assert_eq!(client.get("missing").await.unwrap(), None);

    // Standalone mode does not care which slots the keys hash to.
    assert_eq!(client.del(["alpha", "beta", "missing"]).await.unwrap(), 2);
    assert_eq!(client.get("beta").await.unwrap(), None);
    assert_eq!(client.ping().await.unwrap(), Bytes::from_static(b"PONG"));

    let info = client.info().await.unwrap();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].0, node.addr.to_string());
    assert_eq!(node.connections(), 1);
}

#[tokio::test]
async fn clones_share_one_connection() {
    let node = spawn_store().await;
    let client = Client::connect(config(&node)).await.unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let key = format!("k{}", i);
                client.set(key.clone(), format!("v{}", i)).await.unwrap();
                client.get(key).await.unwrap()
            })
        })
        .collect();
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), Some(Bytes::from(format!("v{}", i))));
    }
    assert_eq!(node.connections(), 1);
}

#[tokio::test]
async fn handshake_sends_hello_name_and_database() {
    let node = FakeNode::start(Arc::new(|args: &[Vec<u8>]| {
        Response::Reply(match name(args).as_str() {
            "HELLO" => b"%1\r\n+server\r\n+fake\r\n".to_vec(),
            "GET" => bulk("v"),
            _ => simple("OK"),
        })
    }))
    .await;
    let mut config = config(&node);
    config.protocol = ProtocolVersion::Resp3;
    config.client_name = Some("reporting".to_string());
    config.database_id = 2;

    let client = Client::connect(config).await.unwrap();
    assert_eq!(client.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));

    let log = node.commands();
    assert_eq!(log[0], ["HELLO", "3"]);
    assert_eq!(log[1], ["CLIENT", "SETNAME", "reporting"]);
    assert_eq!(log[2], ["SELECT", "2"]);
    assert_eq!(log[3], ["GET", "k"]);
}

#[tokio::test]
async fn rejected_handshake_fails_connect() {
    let node = FakeNode::start(Arc::new(|args: &[Vec<u8>]| match name(args).as_str() {
        "SELECT" => Response::Reply(error("ERR DB index is out of range")),
        _ => Response::Reply(simple("OK")),
    }))
    .await;
    let mut config = config(&node);
    config.database_id = 99;

    match Client::connect(config).await {
        Err(ClientError::Request(req)) => {
            assert_eq!(req.command, "SELECT");
            assert!(req.message.contains("out of range"));
        }
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn unreachable_node_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = ClientConfig::standalone(ckv_client::NodeAddress::new("127.0.0.1", port));
    config.reconnect.num_of_retries = 0;
    let err = Client::connect(config).await.err().expect("connect should fail");
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn timed_out_request_keeps_the_connection() {
    let node = FakeNode::start(Arc::new(|args: &[Vec<u8>]| match args.get(1).map(Vec::as_slice) {
        Some(b"slow") => Response::Delayed(Duration::from_millis(300), bulk("late")),
        _ => Response::Reply(bulk("fresh")),
    }))
    .await;
    let mut config = config(&node);
    config.request_timeout = Duration::from_millis(100);
    let client = Client::connect(config).await.unwrap();

    match client.get("slow").await {
        Err(ClientError::Timeout { command, .. }) => assert_eq!(command, "GET"),
        other => panic!("unexpected {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    // The late reply to "slow" is dropped, not handed to the next caller.
    assert_eq!(client.get("fast").await.unwrap(), Some(Bytes::from_static(b"fresh")));
    assert_eq!(node.connections(), 1);
}

#[tokio::test]
async fn blocking_commands_extend_the_deadline() {
    let node = FakeNode::start(Arc::new(|args: &[Vec<u8>]| match name(args).as_str() {
        "BLPOP" => Response::Delayed(
            Duration::from_millis(300),
            array(vec![bulk("queue"), bulk("job")]),
        ),
        _ => Response::Reply(simple("OK")),
    }))
    .await;
    let mut config = config(&node);
    config.request_timeout = Duration::from_millis(100);
    let client = Client::connect(config).await.unwrap();

    let reply = client
        .custom_command(["BLPOP", "queue", "1"], None)
        .await
        .unwrap()
        .into_single()
        .unwrap();
    assert_eq!(
        reply,
        Value::Array(vec![
            Value::BulkString(Bytes::from_static(b"queue")),
            Value::BulkString(Bytes::from_static(b"job")),
        ])
    );
}

#[tokio::test]
async fn transaction_in_standalone_mode() {
    let node = FakeNode::start(Arc::new(|args: &[Vec<u8>]| {
        Response::Reply(match name(args).as_str() {
            "MULTI" => simple("OK"),
            "EXEC" => array(vec![simple("OK"), simple("OK")]),
            _ => simple("QUEUED"),
        })
    }))
    .await;
    let client = Client::connect(config(&node)).await.unwrap();

    let mut tx = client.transaction();
    tx.add(Command::new("SET").arg("foo").arg("1")).unwrap();
    tx.add(Command::new("SET").arg("bar").arg("2")).unwrap();
    let replies = client.exec(&tx, None).await.unwrap().expect("committed");

    assert_eq!(replies.len(), 2);
    let names: Vec<String> = node.commands().into_iter().map(|cmd| cmd[0].clone()).collect();
    assert_eq!(names, ["MULTI", "SET", "SET", "EXEC"]);
}

#[tokio::test]
async fn rejects_invalid_requests_before_io() {
    let node = spawn_store().await;
    let client = Client::connect(config(&node)).await.unwrap();
    let before = node.bytes_received();

    let err = client.custom_command(Vec::<Bytes>::new(), None).await.unwrap_err();
    assert!(matches!(err, ClientError::Configuration(ConfigurationError::Invalid(_))));

    let err = client.refresh_topology().await.unwrap_err();
    assert!(matches!(err, ClientError::Configuration(ConfigurationError::Invalid(_))));
    assert!(client.slot_map().is_none());

    let cluster_tx = ckv_client::Transaction::new(true);
    assert!(client.exec(&cluster_tx, None).await.is_err());

    assert_eq!(node.bytes_received(), before);
}

#[tokio::test]
async fn server_errors_are_typed() {
    let node = spawn_store().await;
    let client = Client::connect(config(&node)).await.unwrap();

    match client.custom_command(["HGETALL", "k"], None).await {
        Err(ClientError::Request(req)) => {
            assert_eq!(req.command, "HGETALL");
            assert_eq!(req.node, Some(node.addr.to_string()));
        }
        other => panic!("unexpected {:?}", other),
    }
    // The connection survives a server error.
    client.set("k", "v").await.unwrap();
}

#[tokio::test]
async fn close_is_final() {
    let node = spawn_store().await;
    let client = Client::connect(config(&node)).await.unwrap();
    client.close();
    client.close();

    let before = node.bytes_received();
    assert!(matches!(client.get("k").await, Err(ClientError::Closing)));
    assert_eq!(node.bytes_received(), before);
}
