//! End-to-end tests for session pairs
//!
//! Two sessions are wired back-to-back over in-memory duplex pipes standing
//! in for the TLS-appearance connections, and exercised through the public
//! API only: open/accept, echo traffic, close semantics, rate shaping.

use rand::{Rng, RngCore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use veilmux::{
    make_obfuscator, EncryptionMethod, MuxError, Session, SessionConfig, Stream, Valve,
};

const TEST_SESSION_KEY: [u8; 32] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25,
    26, 27, 28, 29, 30, 31,
];

fn pair_config(method: EncryptionMethod) -> SessionConfig {
    SessionConfig::new(make_obfuscator(method, TEST_SESSION_KEY).unwrap())
}

fn wire_up(client: &Session, server: &Session, num_conns: usize) {
    for _ in 0..num_conns {
        let (client_end, server_end) = tokio::io::duplex(1 << 16);
        client.add_connection(client_end);
        server.add_connection(server_end);
    }
}

fn make_session_pair(num_conns: usize, method: EncryptionMethod) -> (Session, Session) {
    let client = Session::new(1, pair_config(method));
    let server = Session::new(1, pair_config(method));
    wire_up(&client, &server, num_conns);
    (client, server)
}

/// Accepts every incoming stream and echoes its bytes back
fn serve_echo(session: Session) {
    tokio::spawn(async move {
        while let Ok(stream) = session.accept_stream().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 32 * 1024];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(n) => n,
                        Err(_) => break,
                    };
                    if stream.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

async fn read_full(stream: &Stream, buf: &mut [u8]) -> Result<(), MuxError> {
    let mut filled = 0;
    while filled < buf.len() {
        filled += stream.read(&mut buf[filled..]).await?;
    }
    Ok(())
}

async fn assert_eventually(mut cond: impl FnMut() -> bool, msg: &str) {
    let give_up = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < give_up, "{}", msg);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn run_echo_test(streams: &[Stream], max_msg_len: usize) {
    let mut tasks = Vec::with_capacity(streams.len());
    for stream in streams {
        let stream = stream.clone();
        tasks.push(tokio::spawn(async move {
            let len = rand::thread_rng().gen_range(1..=max_msg_len);
            let mut data = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut data);

            assert_eq!(stream.write(&data).await.unwrap(), len);

            let mut echoed = vec![0u8; len];
            read_full(&stream, &mut echoed).await.unwrap();
            assert_eq!(data, echoed, "echoed data not correct");
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_multiplex() {
    const NUM_STREAMS: usize = 2000;
    const NUM_CONNS: usize = 4;
    const MAX_MSG_LEN: usize = 16384;

    let (client, server) = make_session_pair(NUM_CONNS, EncryptionMethod::ChaCha20Poly1305);
    serve_echo(server.clone());

    let mut streams = Vec::with_capacity(NUM_STREAMS);
    for _ in 0..NUM_STREAMS {
        streams.push(client.open_stream().await.unwrap());
    }

    run_echo_test(&streams, MAX_MSG_LEN).await;

    assert_eventually(
        || client.stream_count() == NUM_STREAMS,
        "client stream count is wrong",
    )
    .await;
    assert_eventually(
        || server.stream_count() == NUM_STREAMS,
        "server stream count is wrong",
    )
    .await;

    // close one stream
    let closing = streams.remove(0);
    closing.close().await.unwrap();
    assert!(matches!(
        closing.write(&[0]).await.unwrap_err(),
        MuxError::BrokenStream
    ));
    let mut one = [0u8; 1];
    assert!(matches!(
        closing.read(&mut one).await.unwrap_err(),
        MuxError::BrokenStream
    ));
}

#[tokio::test]
async fn test_stream_closing() {
    let (client, server) = make_session_pair(1, EncryptionMethod::ChaCha20Poly1305);
    serve_echo(server.clone());

    let mut test_data = vec![0u8; 128];
    rand::thread_rng().fill_bytes(&mut test_data);
    let mut recv_buf = vec![0u8; 128];

    let to_be_closed = client.open_stream().await.unwrap();
    to_be_closed.write(&test_data).await.unwrap(); // echoed back

    read_full(&to_be_closed, &mut recv_buf[..1])
        .await
        .expect("can't read anything before stream closed");
    to_be_closed.close().await.unwrap();
    to_be_closed.close().await.unwrap(); // idempotent
    read_full(&to_be_closed, &mut recv_buf[1..])
        .await
        .expect("can't read residual data on stream");
    assert_eq!(test_data, recv_buf, "incorrect data read back");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_all_ciphers() {
    for method in [
        EncryptionMethod::Plain,
        EncryptionMethod::Aes256Gcm,
        EncryptionMethod::ChaCha20Poly1305,
    ] {
        let (client, server) = make_session_pair(2, method);
        serve_echo(server.clone());

        let mut streams = Vec::new();
        for _ in 0..8 {
            streams.push(client.open_stream().await.unwrap());
        }
        run_echo_test(&streams, 16384).await;
    }
}

#[tokio::test]
async fn test_ordered_delivery_across_writes() {
    let (client, server) = make_session_pair(2, EncryptionMethod::Plain);
    serve_echo(server.clone());

    // Many small writes must come back as one ordered byte sequence.
    let stream = client.open_stream().await.unwrap();
    let mut expected = Vec::new();
    for i in 0..100u32 {
        let chunk = i.to_be_bytes();
        expected.extend_from_slice(&chunk);
        stream.write(&chunk).await.unwrap();
    }

    let mut echoed = vec![0u8; expected.len()];
    read_full(&stream, &mut echoed).await.unwrap();
    assert_eq!(expected, echoed);
}

#[tokio::test]
async fn test_unordered_mode_delivers_messages() {
    let client = Session::new(
        1,
        pair_config(EncryptionMethod::ChaCha20Poly1305).with_unordered(true),
    );
    let server = Session::new(
        1,
        pair_config(EncryptionMethod::ChaCha20Poly1305).with_unordered(true),
    );
    wire_up(&client, &server, 1);

    let stream = client.open_stream().await.unwrap();
    stream.write(b"one message").await.unwrap();

    let peer = server.accept_stream().await.unwrap();
    let mut buf = vec![0u8; 16384];
    let n = peer.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"one message");
}

#[tokio::test]
async fn test_session_close_propagates() {
    let (client, server) = make_session_pair(2, EncryptionMethod::Aes256Gcm);
    serve_echo(server.clone());

    let stream = client.open_stream().await.unwrap();
    stream.write(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    read_full(&stream, &mut buf).await.unwrap();

    client.close().await;
    client.close().await; // idempotent
    assert!(client.is_closed());
    assert!(matches!(
        client.open_stream().await.unwrap_err(),
        MuxError::SessionClosed
    ));
    assert!(stream.write(b"x").await.is_err());

    assert_eventually(|| server.is_closed(), "session close never reached the peer").await;
}

#[tokio::test]
async fn test_read_deadline_over_live_session() {
    let (client, server) = make_session_pair(1, EncryptionMethod::Plain);
    serve_echo(server.clone());

    let stream = client.open_stream().await.unwrap();
    stream.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));

    let start = Instant::now();
    let mut buf = [0u8; 1];
    let err = stream.read(&mut buf).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, MuxError::Timeout));
    assert!(elapsed >= Duration::from_millis(90), "fired early: {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(400), "fired late: {:?}", elapsed);

    // The deadline leaves the stream usable: clear it and the echo works.
    stream.set_read_deadline(None);
    stream.write(b"still alive").await.unwrap();
    let mut echoed = [0u8; 11];
    read_full(&stream, &mut echoed).await.unwrap();
    assert_eq!(&echoed, b"still alive");
}

#[tokio::test]
async fn test_valve_paces_throughput() {
    const LIMIT: u64 = 10_000; // bytes per second
    const PAYLOAD: usize = 30_000;

    let valve = Arc::new(Valve::new(Some(LIMIT), None));
    let client = Session::new(
        1,
        pair_config(EncryptionMethod::Plain).with_valve(valve),
    );
    let server = Session::new(1, pair_config(EncryptionMethod::Plain));
    wire_up(&client, &server, 1);
    serve_echo(server.clone());

    let stream = client.open_stream().await.unwrap();
    let data = vec![0xA5u8; PAYLOAD];

    // The first bucket absorbs LIMIT bytes; the second half has to wait
    // for the refill, so the echo cannot complete in much under a second.
    let start = Instant::now();
    stream.write(&data).await.unwrap();
    let mut echoed = vec![0u8; PAYLOAD];
    read_full(&stream, &mut echoed).await.unwrap();

    assert_eq!(data, echoed);
    assert!(
        start.elapsed() >= Duration::from_millis(800),
        "valve did not pace sends: {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn test_traffic_resets_inactivity_timer() {
    let client = Session::new(
        1,
        pair_config(EncryptionMethod::Plain)
            .with_inactivity_timeout(Duration::from_millis(200)),
    );
    let server = Session::new(1, pair_config(EncryptionMethod::Plain));
    wire_up(&client, &server, 1);
    serve_echo(server.clone());

    let stream = client.open_stream().await.unwrap();
    let mut buf = [0u8; 4];
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(80)).await;
        stream.write(b"tick").await.unwrap();
        read_full(&stream, &mut buf).await.unwrap();
    }
    assert!(!client.is_closed(), "active session closed by the timer");

    assert_eventually(|| client.is_closed(), "idle session never timed out").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_loss_leaves_session_alive() {
    let (client, server) = make_session_pair(2, EncryptionMethod::ChaCha20Poly1305);
    serve_echo(server.clone());

    // One extra pipe that gets torn down mid-session.
    let (client_end, server_end) = tokio::io::duplex(1 << 16);
    client.add_connection(client_end);
    drop(server_end);

    assert_eventually(|| client.connection_count() == 2, "dead connection not removed").await;

    let mut streams = Vec::new();
    for _ in 0..16 {
        streams.push(client.open_stream().await.unwrap());
    }
    run_echo_test(&streams, 8192).await;
    assert!(!client.is_closed());
}
