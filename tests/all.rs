#[macro_use]
extern crate log;
extern crate bytes;
extern crate env_logger;
extern crate futures;
extern crate natrix;
extern crate parking_lot;
extern crate tokio;
extern crate tokio_codec;
extern crate tokio_tcp;

use bytes::Bytes;
use futures::{
    future::{self, Either},
    prelude::*,
    sync::{mpsc, oneshot},
};
use natrix::protocol::headers::{HeaderMap, InlineStatus};
use natrix::{
    codec::OpCodec, commands::*, ConnectionState, NatsClient, NatsClientOptions, NatsError, Op,
    RequestOptions, StatusEvent, SubscribeOptions,
};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::io as tio;
use tokio_codec::Decoder;
use tokio_tcp::{TcpListener, TcpStream};

macro_rules! elog {
    () => {
        let _ = env_logger::try_init();
    };
}

#[derive(Debug, Default)]
struct MockLog {
    connections: usize,
    connects: usize,
    pongs: usize,
    subs: Vec<SubCommand>,
    unsubs: Vec<UnsubCommand>,
    pubs: Vec<PubCommand>,
}

#[derive(Clone, Default)]
struct MockBehavior {
    /// Advertise header support in INFO.
    headers: bool,
    /// Deliver PUBs back to the best matching subscription.
    echo: bool,
    /// Answer PUBs carrying a reply subject with an HMSG 503.
    no_responders: bool,
    /// Close the first connection once this many SUBs arrived.
    drop_after_subs: usize,
    /// Send an unsolicited PING right after INFO.
    ping_after_connect: bool,
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    if pattern == subject {
        return true;
    }
    if pattern.ends_with(".*") {
        let prefix = &pattern[..pattern.len() - 1];
        return subject.starts_with(prefix) && !subject[prefix.len()..].contains('.');
    }
    false
}

fn find_sid(log: &Arc<RwLock<MockLog>>, subject: &str) -> Option<u64> {
    log.read()
        .subs
        .iter()
        .rev()
        .find(|sub| subject_matches(&sub.subject, subject))
        .map(|sub| sub.sid)
}

fn handle_connection(
    socket: TcpStream,
    behavior: MockBehavior,
    log: Arc<RwLock<MockLog>>,
) -> impl Future<Item = (), Error = ()> + Send {
    let conn_index = {
        let mut l = log.write();
        l.connections += 1;
        l.connections
    };
    debug!(target: "natrix", "TCP mock accepted connection #{}", conn_index);

    let info = ServerInfo::builder()
        .server_id("natrix-mock")
        .host("127.0.0.1")
        .headers(behavior.headers)
        .build()
        .unwrap();

    OpCodec::default()
        .framed(socket)
        .send(Op::INFO(info))
        .map_err(|_| ())
        .and_then(move |socket| {
            let (sink, stream) = socket.split();
            let (tx, rx) = mpsc::unbounded();
            tokio::spawn(
                sink.send_all(rx.map_err(|_| NatsError::InnerBrokenChain))
                    .map(|_| ())
                    .map_err(|_| ()),
            );

            if behavior.ping_after_connect {
                let _ = tx.unbounded_send(Op::PING);
            }

            let subs_seen = AtomicUsize::new(0);
            stream.map_err(|_| ()).for_each(move |op| {
                debug!(target: "natrix", "TCP mock got OP {:?}", op);
                match op {
                    Op::CONNECT(_) => {
                        log.write().connects += 1;
                    }
                    Op::PING => {
                        let _ = tx.unbounded_send(Op::PONG);
                    }
                    Op::PONG => {
                        log.write().pongs += 1;
                    }
                    Op::SUB(cmd) => {
                        log.write().subs.push(cmd);
                        let seen = subs_seen.fetch_add(1, Ordering::SeqCst) + 1;
                        if behavior.drop_after_subs > 0
                            && conn_index == 1
                            && seen == behavior.drop_after_subs
                        {
                            // Kill the socket mid-session.
                            return Err(());
                        }
                    }
                    Op::UNSUB(cmd) => {
                        log.write().unsubs.push(cmd);
                    }
                    Op::PUB(cmd) => {
                        log.write().pubs.push(cmd.clone());
                        if behavior.no_responders {
                            if let Some(ref reply_to) = cmd.reply_to {
                                if let Some(sid) = find_sid(&log, reply_to) {
                                    let msg = Message::builder()
                                        .subject(reply_to.clone())
                                        .sid(sid)
                                        .status(Some(InlineStatus {
                                            code: 503,
                                            description: Some("No Responders".into()),
                                        }))
                                        .build()
                                        .unwrap();
                                    let _ = tx.unbounded_send(Op::MSG(msg));
                                }
                            }
                        } else if behavior.echo {
                            let target = cmd
                                .reply_to
                                .clone()
                                .unwrap_or_else(|| cmd.subject.clone());
                            if let Some(sid) = find_sid(&log, &target) {
                                let msg = Message::builder()
                                    .subject(target)
                                    .sid(sid)
                                    .payload(cmd.payload.clone())
                                    .build()
                                    .unwrap();
                                let _ = tx.unbounded_send(Op::MSG(msg));
                            }
                        }
                    }
                    _ => {}
                }

                Ok(())
            })
        })
}

fn spawn_mock(
    runtime: &mut tokio::runtime::Runtime,
    port: u16,
    behavior: MockBehavior,
    log: Arc<RwLock<MockLog>>,
) -> Result<(), NatsError> {
    let listener = TcpListener::bind(&format!("127.0.0.1:{}", port).parse().unwrap())?;
    debug!(target: "natrix", "TCP mock NATS server started on port {}", port);

    runtime.spawn(listener.incoming().map_err(|_| ()).for_each(move |socket| {
        tokio::spawn(handle_connection(socket, behavior.clone(), Arc::clone(&log)));
        Ok(())
    }));

    Ok(())
}

fn options_for(port: u16) -> NatsClientOptions {
    NatsClientOptions::builder()
        .servers(vec![format!("nats://127.0.0.1:{}", port)])
        .reconnect_time_wait(Duration::from_millis(20))
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

fn run<F, T>(runtime: &mut tokio::runtime::Runtime, fut: F) -> Result<T, NatsError>
where
    F: Future<Item = T, Error = NatsError> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    runtime.spawn(fut.then(|r| tx.send(r).map_err(|_| ())));
    rx.wait().expect("Cannot wait for a result")
}

#[test]
fn can_connect() {
    elog!();
    let mut runtime = tokio::runtime::Runtime::new().unwrap();
    let log = Arc::new(RwLock::new(MockLog::default()));
    spawn_mock(&mut runtime, 1440, MockBehavior::default(), Arc::clone(&log)).unwrap();

    let fut = NatsClient::from_options(options_for(1440))
        .and_then(|client| client.connect())
        .and_then(|client| {
            assert_eq!(client.state(), ConnectionState::Connected);

            // The mock did not advertise header support, so publishing
            // with headers must fail fast.
            let mut headers = HeaderMap::new();
            headers.insert("X-Try", "1").unwrap();
            client
                .publish(PubCommand {
                    subject: "greet".into(),
                    reply_to: None,
                    headers: Some(headers),
                    payload: "hi".into(),
                })
                .then(move |res| match res {
                    Err(NatsError::ServerOptionNA(_)) => future::ok(()),
                    other => future::err(NatsError::GenericError(format!(
                        "expected ServerOptionNA, got {:?}",
                        other
                    ))),
                })
        });

    let result = run(&mut runtime, fut);
    let _ = runtime.shutdown_now().wait();
    assert!(result.is_ok());
    assert_eq!(log.read().connects, 1);
}

#[test]
fn it_rejects_missing_header_support() {
    elog!();
    let mut runtime = tokio::runtime::Runtime::new().unwrap();
    let log = Arc::new(RwLock::new(MockLog::default()));
    spawn_mock(&mut runtime, 1441, MockBehavior::default(), Arc::clone(&log)).unwrap();

    let mut options = options_for(1441);
    options.headers = true;
    options.reconnect = false;

    let fut = NatsClient::from_options(options).and_then(|client| {
        let closed = client.closed();
        client.connect().then(move |res| match res {
            Ok(_) => Either::A(future::err(NatsError::GenericError(
                "connect unexpectedly succeeded".into(),
            ))),
            Err(connect_err) => Either::B(closed.map(move |closed_err| (connect_err, closed_err))),
        })
    });

    let (connect_err, closed_err) = run(&mut runtime, fut).unwrap();
    let _ = runtime.shutdown_now().wait();

    assert_eq!(connect_err, NatsError::ServerOptionNA("headers".into()));
    assert_eq!(closed_err, Some(NatsError::ServerOptionNA("headers".into())));
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A byte-level mock: answers the handshake, then captures everything up
/// to the next PING verbatim.
fn spawn_raw_capture_mock(
    runtime: &mut tokio::runtime::Runtime,
    port: u16,
    captured: Arc<RwLock<Vec<u8>>>,
) {
    let listener = TcpListener::bind(&format!("127.0.0.1:{}", port).parse().unwrap()).unwrap();

    runtime.spawn(listener.incoming().map_err(|_| ()).for_each(move |socket| {
        let captured = Arc::clone(&captured);
        let info = b"INFO {\"server_id\":\"raw\",\"host\":\"127.0.0.1\",\"port\":4222,\"max_payload\":1048576}\r\n";

        let work = tio::write_all(socket, &info[..])
            .map_err(|_| ())
            .and_then(move |(socket, _)| {
                future::loop_fn(
                    (socket, Vec::new(), false),
                    move |(socket, mut buf, handshaken)| {
                        let captured = Arc::clone(&captured);
                        tio::read(socket, vec![0u8; 512]).map_err(|_| ()).and_then(
                            move |(socket, chunk, n)| {
                                if n == 0 {
                                    return Either::A(future::ok(future::Loop::Break(())));
                                }
                                buf.extend_from_slice(&chunk[..n]);

                                match find_bytes(&buf, b"PING\r\n") {
                                    Some(pos) => {
                                        let rest = buf.split_off(pos + 6);
                                        if handshaken {
                                            *captured.write() = buf;
                                        }
                                        Either::B(
                                            tio::write_all(socket, b"PONG\r\n".to_vec())
                                                .map_err(|_| ())
                                                .map(move |(socket, _)| {
                                                    future::Loop::Continue((socket, rest, true))
                                                }),
                                        )
                                    }
                                    None => Either::A(future::ok(future::Loop::Continue((
                                        socket, buf, handshaken,
                                    )))),
                                }
                            },
                        )
                    },
                )
            });

        tokio::spawn(work.map(|_| ()));
        Ok(())
    }));
}

#[test]
fn it_writes_the_exact_publish_and_flush_bytes() {
    elog!();
    let mut runtime = tokio::runtime::Runtime::new().unwrap();
    let captured = Arc::new(RwLock::new(Vec::new()));
    spawn_raw_capture_mock(&mut runtime, 1442, Arc::clone(&captured));

    let fut = NatsClient::from_options(options_for(1442))
        .and_then(|client| client.connect())
        .and_then(|client| {
            client
                .publish(
                    PubCommand::builder()
                        .subject("greet")
                        .payload("hello")
                        .build()
                        .unwrap(),
                )
                .and_then(move |_| client.flush())
        });

    let result = run(&mut runtime, fut);
    let _ = runtime.shutdown_now().wait();
    assert!(result.is_ok());
    assert_eq!(&captured.read()[..], b"PUB greet 5\r\nhello\r\nPING\r\n" as &[u8]);
}

#[test]
fn it_auto_unsubscribes_after_max() {
    elog!();
    let mut runtime = tokio::runtime::Runtime::new().unwrap();
    let log = Arc::new(RwLock::new(MockLog::default()));
    let behavior = MockBehavior {
        echo: true,
        ..MockBehavior::default()
    };
    spawn_mock(&mut runtime, 1443, behavior, Arc::clone(&log)).unwrap();

    let fut = NatsClient::from_options(options_for(1443))
        .and_then(|client| client.connect())
        .and_then(|client| {
            let sub_cmd = SubCommand::builder().subject("a.*").build().unwrap();
            let sub_opts = SubscribeOptions::builder().max(Some(2u64)).build().unwrap();

            client
                .subscribe_with(sub_cmd, sub_opts)
                .and_then(move |stream| {
                    let publishes = future::join_all(
                        ["a.x", "a.y", "a.z"]
                            .iter()
                            .map(|subject| {
                                client.publish(
                                    PubCommand::builder()
                                        .subject(*subject)
                                        .payload("ping")
                                        .build()
                                        .unwrap(),
                                )
                            })
                            .collect::<Vec<_>>(),
                    );

                    publishes.and_then(move |_| stream.collect())
                })
        });

    let messages = run(&mut runtime, fut).unwrap();
    let _ = runtime.shutdown_now().wait();

    // The sink yields exactly two messages, then closes.
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].subject, "a.x");
    assert_eq!(messages[1].subject, "a.y");

    let log = log.read();
    assert_eq!(log.subs[0].subject, "a.*");
    assert_eq!(log.unsubs.len(), 1);
    assert_eq!(log.unsubs[0].sid, log.subs[0].sid);
    assert_eq!(log.unsubs[0].max_msgs, Some(2));
}

#[test]
fn it_round_trips_requests() {
    elog!();
    let mut runtime = tokio::runtime::Runtime::new().unwrap();
    let log = Arc::new(RwLock::new(MockLog::default()));
    let behavior = MockBehavior {
        echo: true,
        ..MockBehavior::default()
    };
    spawn_mock(&mut runtime, 1444, behavior, Arc::clone(&log)).unwrap();

    let fut = NatsClient::from_options(options_for(1444))
        .and_then(|client| client.connect())
        .and_then(|client| client.request("svc.echo".into(), Bytes::from("forty-two")));

    let msg = run(&mut runtime, fut).unwrap();
    let _ = runtime.shutdown_now().wait();

    assert_eq!(msg.payload, "forty-two");
    // The reply rode the muxed inbox subscription.
    assert_eq!(log.read().subs.len(), 1);
    assert!(log.read().subs[0].subject.ends_with(".*"));
}

#[test]
fn it_round_trips_requests_without_the_mux() {
    elog!();
    let mut runtime = tokio::runtime::Runtime::new().unwrap();
    let log = Arc::new(RwLock::new(MockLog::default()));
    let behavior = MockBehavior {
        echo: true,
        ..MockBehavior::default()
    };
    spawn_mock(&mut runtime, 1445, behavior, Arc::clone(&log)).unwrap();

    let fut = NatsClient::from_options(options_for(1445))
        .and_then(|client| client.connect())
        .and_then(|client| {
            let opts = RequestOptions::builder().no_mux(true).build().unwrap();
            client.request_with("svc.echo".into(), Bytes::from("solo"), opts)
        });

    let msg = run(&mut runtime, fut).unwrap();
    let _ = runtime.shutdown_now().wait();

    assert_eq!(msg.payload, "solo");
    let log = log.read();
    // A disposable single-shot subscription, capped right away.
    assert_eq!(log.subs.len(), 1);
    assert!(!log.subs[0].subject.ends_with(".*"));
    assert_eq!(log.unsubs[0].max_msgs, Some(1));
}

#[test]
fn it_rejects_requests_without_responders() {
    elog!();
    let mut runtime = tokio::runtime::Runtime::new().unwrap();
    let log = Arc::new(RwLock::new(MockLog::default()));
    let behavior = MockBehavior {
        headers: true,
        no_responders: true,
        ..MockBehavior::default()
    };
    spawn_mock(&mut runtime, 1446, behavior, Arc::clone(&log)).unwrap();

    let mut options = options_for(1446);
    options.headers = true;

    let fut = NatsClient::from_options(options)
        .and_then(|client| client.connect())
        .and_then(|client| {
            let opts = RequestOptions::builder()
                .timeout(Duration::from_millis(500))
                .build()
                .unwrap();
            client.request_with("svc".into(), Bytes::from("ping"), opts)
        });

    let result = run(&mut runtime, fut);
    let _ = runtime.shutdown_now().wait();
    assert_eq!(result.unwrap_err(), NatsError::NoResponders);
}

#[test]
fn it_times_out_requests() {
    elog!();
    let mut runtime = tokio::runtime::Runtime::new().unwrap();
    let log = Arc::new(RwLock::new(MockLog::default()));
    // No echo: nobody ever answers.
    spawn_mock(&mut runtime, 1447, MockBehavior::default(), Arc::clone(&log)).unwrap();

    let fut = NatsClient::from_options(options_for(1447))
        .and_then(|client| client.connect())
        .and_then(|client| {
            let opts = RequestOptions::builder()
                .timeout(Duration::from_millis(50))
                .build()
                .unwrap();
            client.request_with("svc".into(), Bytes::from("ping"), opts)
        });

    let result = run(&mut runtime, fut);
    let _ = runtime.shutdown_now().wait();
    assert_eq!(result.unwrap_err(), NatsError::Timeout);
}

#[test]
fn it_reconnects_and_replays_subscriptions() {
    elog!();
    let mut runtime = tokio::runtime::Runtime::new().unwrap();
    let log = Arc::new(RwLock::new(MockLog::default()));
    let behavior = MockBehavior {
        drop_after_subs: 2,
        ..MockBehavior::default()
    };
    spawn_mock(&mut runtime, 1448, behavior, Arc::clone(&log)).unwrap();

    let fut = NatsClient::from_options(options_for(1448))
        .and_then(|client| client.connect())
        .and_then(|client| {
            let status = client.status();
            let flusher = client.clone();

            client
                .subscribe(SubCommand::builder().subject("events.created").build().unwrap())
                .join(client.subscribe(SubCommand::builder().subject("events.deleted").build().unwrap()))
                .and_then(move |guards| {
                    status
                        .filter(|event| match *event {
                            StatusEvent::Disconnect(_) | StatusEvent::Reconnect(_) => true,
                            _ => false,
                        })
                        .take(2)
                        .collect()
                        .and_then(move |events| {
                            drop(guards);
                            flusher.flush().map(move |_| events)
                        })
                })
        });

    let events = run(&mut runtime, fut).unwrap();
    let _ = runtime.shutdown_now().wait();

    assert_eq!(events[0], StatusEvent::Disconnect("127.0.0.1:1448".into()));
    assert_eq!(events[1], StatusEvent::Reconnect("127.0.0.1:1448".into()));

    let log = log.read();
    assert_eq!(log.connections, 2);
    // Both subscriptions reappear on the new socket, in registration order.
    let subjects: Vec<&str> = log.subs.iter().map(|sub| sub.subject.as_str()).collect();
    assert_eq!(
        subjects,
        vec![
            "events.created",
            "events.deleted",
            "events.created",
            "events.deleted",
        ]
    );
    assert_eq!(log.subs[0].sid, log.subs[2].sid);
    assert_eq!(log.subs[1].sid, log.subs[3].sid);
}

#[test]
fn it_answers_server_pings() {
    elog!();
    let mut runtime = tokio::runtime::Runtime::new().unwrap();
    let log = Arc::new(RwLock::new(MockLog::default()));
    let behavior = MockBehavior {
        ping_after_connect: true,
        ..MockBehavior::default()
    };
    spawn_mock(&mut runtime, 1449, behavior, Arc::clone(&log)).unwrap();

    let fut = NatsClient::from_options(options_for(1449))
        .and_then(|client| client.connect())
        .and_then(|client| client.flush());

    let result = run(&mut runtime, fut);
    let _ = runtime.shutdown_now().wait();
    assert!(result.is_ok());
    assert!(log.read().pongs >= 1);
}

#[test]
fn it_drains_cleanly() {
    elog!();
    let mut runtime = tokio::runtime::Runtime::new().unwrap();
    let log = Arc::new(RwLock::new(MockLog::default()));
    spawn_mock(&mut runtime, 1450, MockBehavior::default(), Arc::clone(&log)).unwrap();

    let fut = NatsClient::from_options(options_for(1450))
        .and_then(|client| client.connect())
        .and_then(|client| {
            client
                .subscribe(SubCommand::builder().subject("tasks").build().unwrap())
                .and_then(move |_stream| {
                    let closed = client.closed();
                    client.drain().and_then(move |_| closed)
                })
        });

    let closed_err = run(&mut runtime, fut).unwrap();
    let _ = runtime.shutdown_now().wait();

    assert_eq!(closed_err, None);
    let log = log.read();
    assert_eq!(log.unsubs.len(), 1);
    assert_eq!(log.unsubs[0].sid, log.subs[0].sid);
}

#[test]
fn it_fails_bad_subjects_synchronously() {
    elog!();
    let mut runtime = tokio::runtime::Runtime::new().unwrap();

    let fut = NatsClient::from_options(NatsClientOptions::default()).and_then(|client| {
        client
            .publish(PubCommand {
                subject: "front door".into(),
                reply_to: None,
                headers: None,
                payload: "x".into(),
            })
            .then(|res| match res {
                Err(NatsError::BadSubject(_)) => future::ok(()),
                other => future::err(NatsError::GenericError(format!(
                    "expected BadSubject, got {:?}",
                    other
                ))),
            })
    });

    let result = run(&mut runtime, fut);
    let _ = runtime.shutdown_now().wait();
    assert!(result.is_ok());
}
