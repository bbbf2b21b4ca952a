//! End-to-end scenarios: real servers and clients over loopback TCP.

use scp_client::{Client, ClientError};
use scp_routing::{Executor, Next, RoutingError};
use scp_server::{Server, ServerHandle};
use scp_session::{
    connect_tcp, Conductor, Connection, ConnectionConfig, Coordinator, IncomingExchange, IoStream,
    OutgoingExchange, RemoteError, SessionError,
};
use scp_wire::{Mode, Parameters, Tags, CID, SID, STATUS, STATUS_OK};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type Trace = Arc<Mutex<Vec<String>>>;

fn tracer(trace: &Trace, name: &'static str) -> impl scp_routing::Handler {
    let trace = Arc::clone(trace);
    move |incoming: IncomingExchange, outgoing: OutgoingExchange, next: Next| {
        let trace = Arc::clone(&trace);
        async move {
            trace
                .lock()
                .unwrap()
                .push(format!("{}:{}", name, incoming.operation()));
            next.proceed(incoming, outgoing).await?;
            Ok::<(), RoutingError>(())
        }
    }
}

async fn start(identifier: &str, trace: &Trace) -> ServerHandle {
    let mut billing = Executor::new();
    billing.reply("charge", |(amount,): (u64,)| async move {
        Ok::<_, RemoteError>(json!({ "charged": amount }))
    });

    let mut server = Server::new(identifier);
    server
        .omni("*", tracer(trace, "audit"))
        .reply("echo", |(value,): (Value,)| async move {
            Ok::<_, RemoteError>(value)
        })
        .reply("count", |args: Vec<Value>| async move {
            Ok::<_, RemoteError>(args.len())
        })
        .reply("ping", |(): ()| async move { Ok::<_, RemoteError>("pong") })
        .reply("boom", |_: Vec<Value>| async move {
            Err::<(), _>(RemoteError::new("boom").with_field("code", 500))
        })
        .attach("Billing", billing)
        .conductor("txn", |(node,): (String,), mut conductor: Conductor| async move {
            let prepare = conductor.next_signal().await?;
            assert_eq!(prepare.event, "prepare");
            conductor
                .signal("prepared", Tags::new().with("node", node.clone()))
                .await?;
            let decision = conductor.next_signal().await?;
            let outcome = if decision.event == "commit" {
                "committed"
            } else {
                "aborted"
            };
            conductor
                .signal(outcome, Tags::new().with("node", node))
                .await?;
            conductor.close().await?;
            Ok::<(), SessionError>(())
        });
    server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
}

async fn raw_connection(server: &ServerHandle) -> Connection {
    let stream = connect_tcp(server.local_addr()).await.unwrap();
    Connection::from_io(IoStream::Plain(stream), ConnectionConfig::default())
}

#[tokio::test]
async fn echo_reply_carries_server_identifier() {
    let trace = Trace::default();
    let server = start("alpha", &trace).await;
    let mut connection = raw_connection(&server).await;

    let mut call = connection.open_outgoing().unwrap();
    call.set_rfi(Mode::Reply, "echo", Parameters::new().with(CID, "raw"))
        .unwrap();
    call.write(&b"[\"hello\"]"[..]).await.unwrap();
    call.end().await.unwrap();

    let mut reply = connection.accept().await.unwrap();
    assert_eq!(reply.mode(), Mode::Reply);
    assert_eq!(reply.operation(), "echo");
    assert_eq!(reply.get(SID), Some("alpha"));
    assert_eq!(reply.get(STATUS), Some(STATUS_OK));
    let body = reply.read_to_end().await.unwrap();
    assert_eq!(&body[..], b"\"hello\"");

    assert_eq!(*trace.lock().unwrap(), vec!["audit:echo".to_string()]);
}

#[tokio::test]
async fn client_calls_run_through_omni_chain_and_segments() {
    let trace = Trace::default();
    let server = start("beta", &trace).await;
    let client = Client::new("shop");
    client.connect(server.local_addr()).await.unwrap();

    let echoed = client.message("echo", &(json!({"k": [1, 2]}),)).await.unwrap();
    assert_eq!(echoed, json!({"k": [1, 2]}));

    let charged = client.message("Billing.charge", &(12,)).await.unwrap();
    assert_eq!(charged, json!({"charged": 12}));

    // omni "*" sits outside the segment, so segment calls bypass it
    assert_eq!(*trace.lock().unwrap(), vec!["audit:echo".to_string()]);
}

#[tokio::test]
async fn remote_errors_reach_the_caller() {
    let server = start("gamma", &Trace::default()).await;
    let client = Client::new("caller");
    client.connect(server.local_addr()).await.unwrap();

    match client.message("boom", &()).await {
        Err(ClientError::Remote(error)) => {
            assert_eq!(error.message, "boom");
            assert_eq!(error.field("code"), Some(&json!(500)));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn zero_argument_calls_send_an_empty_list() {
    let server = start("iota", &Trace::default()).await;
    let client = Client::new("bare");
    client.connect(server.local_addr()).await.unwrap();

    assert_eq!(client.message("count", &()).await.unwrap(), json!(0));
    assert_eq!(client.message("ping", &()).await.unwrap(), json!("pong"));
    assert_eq!(client.message("count", &(Value::Null,)).await.unwrap(), json!(1));

    let mut connection = raw_connection(&server).await;
    let mut call = connection.open_outgoing().unwrap();
    call.set_rfi(Mode::Reply, "ping", Parameters::new()).unwrap();
    call.write(&b"[]"[..]).await.unwrap();
    call.end().await.unwrap();
    let mut reply = connection.accept().await.unwrap();
    assert_eq!(reply.get(STATUS), Some(STATUS_OK));
    assert_eq!(&reply.read_to_end().await.unwrap()[..], b"\"pong\"");
}

#[tokio::test]
async fn unmatched_call_never_answers() {
    let server = start("delta", &Trace::default()).await;
    let client = Client::new("lost");
    client.connect(server.local_addr()).await.unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        client.message("Shipping.track", &("parcel",)),
    )
    .await;
    assert!(outcome.is_err());

    // the server keeps serving other calls
    assert_eq!(client.message("echo", &(1,)).await.unwrap(), json!(1));
}

#[tokio::test]
async fn broadcasts_reach_subscribed_listeners() {
    let server = start("epsilon", &Trace::default()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut clients = Vec::new();
    for name in ["north", "south"] {
        let client = Client::new(name);
        let tx = tx.clone();
        client.on("price", move |args| {
            let _ = tx.send((name, args));
        });
        client.connect(server.local_addr()).await.unwrap();
        clients.push(client);
    }
    let mut subscribers = server.subscribers();
    subscribers.sort();
    assert_eq!(subscribers, vec!["north".to_string(), "south".to_string()]);

    let mut delivered = server.broadcast("price", &("ACME", 42.5)).await.unwrap();
    delivered.sort();
    assert_eq!(delivered, vec!["north".to_string(), "south".to_string()]);

    let mut received = Vec::new();
    for _ in 0..2 {
        let (name, args) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(args, vec![json!("ACME"), json!(42.5)]);
        received.push(name);
    }
    received.sort();
    assert_eq!(received, vec!["north", "south"]);

    clients[0].disconnect();
    tokio::time::timeout(Duration::from_secs(2), async {
        while server.subscribers().len() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        server.broadcast("price", &("ACME", 43)).await.unwrap(),
        vec!["south".to_string()]
    );
}

#[tokio::test]
async fn coordinator_drives_two_phase_commit_across_servers() {
    let trace = Trace::default();
    let first = start("node-a", &trace).await;
    let second = start("node-b", &trace).await;

    let mut coordinator = Coordinator::new();
    for (server, name) in [(&first, "a"), (&second, "b")] {
        let client = Client::new(format!("coordinator-{}", name));
        client.connect(server.local_addr()).await.unwrap();
        coordinator.add(client.conduct("txn", &(name,)).await.unwrap());
    }
    assert_eq!(coordinator.len(), 2);

    let prepared = coordinator.signal("prepare", &Tags::new()).await.unwrap();
    assert_eq!(prepared.len(), 2);
    assert!(prepared.iter().all(|s| s.event == "prepared"));
    assert_eq!(prepared[0].get("node"), Some("a"));
    assert_eq!(prepared[1].get("node"), Some("b"));

    let committed = coordinator.signal("commit", &Tags::new()).await.unwrap();
    assert!(committed.iter().all(|s| s.event == "committed"));

    for mut conductor in coordinator.into_inner() {
        assert!(conductor.next().await.unwrap().is_none());
        conductor.finish().await.unwrap();
    }
}

#[tokio::test]
async fn shutdown_disconnects_clients() {
    let server = start("zeta", &Trace::default()).await;
    let client = Client::new("watcher");
    client.connect(server.local_addr()).await.unwrap();

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(2), async {
        while client.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        client.message("echo", &(1,)).await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn wildcard_chain_pipes_body_back() {
    let trace = Trace::default();
    let mut server = Server::new("pipe");
    server.omni("nex*3", tracer(&trace, "h1")).omni(
        "*",
        |mut incoming: IncomingExchange, outgoing: OutgoingExchange, _next: Next| async move {
            outgoing.pipe_from(&mut incoming).await?;
            Ok::<(), RoutingError>(())
        },
    );
    let server = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let mut connection = raw_connection(&server).await;

    for operation in ["nexus2", "nexus123"] {
        let mut call = connection.open_outgoing().unwrap();
        call.set_rfi(Mode::Reply, operation, Parameters::new()).unwrap();
        call.write("hello").await.unwrap();
        call.end().await.unwrap();

        let mut reply = connection.accept().await.unwrap();
        assert_eq!(reply.operation(), operation);
        assert_eq!(reply.get(SID), Some("pipe"));
        assert_eq!(&reply.read_to_end().await.unwrap()[..], b"hello");
    }

    assert_eq!(*trace.lock().unwrap(), vec!["h1:nexus123".to_string()]);
}
