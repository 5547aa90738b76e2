mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use support::server;

fn client() -> creq::Client {
    creq::Client::new()
}

#[tokio::test]
async fn basic_get() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;

        let request = io.read_request().await;
        assert_eq!(request.stream_id, 1);
        assert_eq!(request.method(), "GET");
        assert_eq!(request.path(), "/path");
        assert_eq!(request.field(":scheme"), Some("http"));
        assert!(request.field(":authority").is_some());
        assert!(request.end_stream);

        io.send_response(1, 200, b"ABCDE").await;
    })
    .await;

    let response = client().get(server.uri("/path")).send().await.unwrap();
    assert_eq!(response.status(), creq::StatusCode::OK);
    assert_eq!(response.version(), creq::Version::HTTP_2);
    assert_eq!(response.text().await.unwrap(), "ABCDE");
}

#[tokio::test]
async fn post_body_round_trip() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;

        let request = io.read_request().await;
        assert_eq!(request.method(), "POST");
        assert!(!request.end_stream);
        assert_eq!(request.field("content-length"), Some("11"));

        let body = io.read_body(request.stream_id).await;
        assert_eq!(body, b"hello world");

        io.send_response(request.stream_id, 201, b"done").await;
    })
    .await;

    let response = client()
        .post(server.uri("/submit"))
        .body("hello world")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.text().await.unwrap(), "done");
}

#[tokio::test]
async fn pseudo_headers_precede_and_stream_ids_grow() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;

        let first = io.read_request().await;
        assert_eq!(first.stream_id, 1);
        // Pseudo-header fields come before every regular field.
        let first_regular = first
            .fields
            .iter()
            .position(|(name, _)| !name.starts_with(':'))
            .unwrap_or(first.fields.len());
        assert!(first
            .fields
            .iter()
            .skip(first_regular)
            .all(|(name, _)| !name.starts_with(':')));
        io.send_response(1, 200, b"one").await;

        let second = io.read_request().await;
        assert_eq!(second.stream_id, 3);
        io.send_response(3, 200, b"two").await;
    })
    .await;

    let client = client();
    let one = client.get(server.uri("/1")).send().await.unwrap();
    assert_eq!(one.text().await.unwrap(), "one");
    let two = client.get(server.uri("/2")).send().await.unwrap();
    assert_eq!(two.text().await.unwrap(), "two");

    // Both exchanges shared one connection.
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn refused_stream_is_retried_on_the_same_connection() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;

        let first = io.read_request().await;
        assert_eq!(first.stream_id, 1);
        io.send_rst(1, server::REFUSED_STREAM).await;

        // The retry arrives on this same connection with the next odd id.
        let retry = io.read_request().await;
        assert_eq!(retry.stream_id, 3);
        io.send_response(3, 200, b"second try").await;
    })
    .await;

    let response = client().get(server.uri("/flaky")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "second try");
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn goaway_fails_unprocessed_stream_retryably() {
    let connection_count = Arc::new(AtomicUsize::new(0));
    let counter = connection_count.clone();

    let server = server::spawn(move |mut io| {
        let nth = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            io.handshake(&[]).await;

            if nth == 0 {
                let request = io.read_request().await;
                assert_eq!(request.stream_id, 1);
                // The server quits without processing stream 1.
                io.send_goaway(0, server::NO_ERROR).await;
            } else {
                let request = io.read_request().await;
                io.send_response(request.stream_id, 200, b"recovered").await;
            }
        }
    })
    .await;

    // The first attempt is refused by GOAWAY and transparently replayed
    // on a fresh connection.
    let response = client().get(server.uri("/")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "recovered");
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn goaway_race_completes_older_stream() {
    let connection_count = Arc::new(AtomicUsize::new(0));
    let counter = connection_count.clone();

    let server = server::spawn(move |mut io| {
        let nth = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            io.handshake(&[]).await;

            if nth == 0 {
                let first = io.read_request().await;
                assert_eq!(first.stream_id, 1);
                let second = io.read_request().await;
                assert_eq!(second.stream_id, 3);

                // Stream 3 was never processed; stream 1 still completes.
                io.send_goaway(1, server::NO_ERROR).await;
                io.send_response(1, 200, b"call one").await;
            } else {
                let retry = io.read_request().await;
                io.send_response(retry.stream_id, 200, b"call two retried")
                    .await;
            }
        }
    })
    .await;

    let client = client();
    let first = client.call(creq::Request::new(
        creq::Method::GET,
        server.uri("/one").parse().unwrap(),
    ));
    let second = client.call(creq::Request::new(
        creq::Method::GET,
        server.uri("/two").parse().unwrap(),
    ));

    let first_task = {
        let first = first.clone();
        tokio::spawn(async move { first.execute().await })
    };
    // Stream 1 belongs to the first call before the second starts.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second_task = {
        let second = second.clone();
        tokio::spawn(async move { second.execute().await })
    };

    let one = first_task.await.unwrap().unwrap();
    let two = second_task.await.unwrap().unwrap();

    assert_eq!(one.text().await.unwrap(), "call one");
    // The second call was retried on a new connection.
    assert_eq!(two.text().await.unwrap(), "call two retried");
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn flow_control_backpressure_waits_for_window_update() {
    let server = server::spawn(|mut io| async move {
        // Constrain every stream to a 5-byte send window.
        io.handshake(&[(server::SETTING_INITIAL_WINDOW_SIZE, 5)]).await;

        let request = io.read_request().await;

        // Exactly the window arrives, then the client blocks.
        let first = io.read_data_frame(request.stream_id).await;
        assert_eq!(first.payload, b"12345");
        assert!(!first.is_end_stream());

        // Releasing 4 bytes lets the rest through.
        io.send_window_update(request.stream_id, 4).await;
        let rest = io.read_body(request.stream_id).await;
        assert_eq!(rest, b"6789");

        io.send_response(request.stream_id, 200, b"ok").await;
    })
    .await;

    let response = client()
        .post(server.uri("/upload"))
        .body("123456789")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn stalled_window_times_out_the_write() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[(server::SETTING_INITIAL_WINDOW_SIZE, 5)]).await;

        let request = io.read_request().await;
        let first = io.read_data_frame(request.stream_id).await;
        assert_eq!(first.payload.len(), 5);

        // Never release more window; the client must give up on its own.
        let code = io.expect_rst(request.stream_id).await;
        assert_eq!(code, server::CANCEL);
    })
    .await;

    let mut config = creq::ClientConfig::default();
    config.write_timeout = Some(Duration::from_millis(500));
    let client = creq::Client::with_config(config);

    let err = client
        .post(server.uri("/upload"))
        .body("123456789")
        .send()
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn cancel_during_read_resets_stream_and_keeps_connection() {
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

    let server = server::spawn(move |mut io| {
        let release_rx = release_rx.clone();
        async move {
            io.handshake(&[]).await;

            let first = io.read_request().await;
            io.send_response_headers(first.stream_id, 200, &[], false)
                .await;
            io.send_data(first.stream_id, b"partial", false).await;

            // The caller cancels; the stream dies with CANCEL.
            let code = io.expect_rst(first.stream_id).await;
            assert_eq!(code, server::CANCEL);

            if let Some(rx) = release_rx.lock().await.take() {
                let _ = rx.await;
            }

            // The connection is still usable for the next call.
            let second = io.read_request().await;
            assert_eq!(second.stream_id, 3);
            io.send_response(second.stream_id, 200, b"still alive").await;
        }
    })
    .await;

    let client = client();
    let call = client.call(creq::Request::new(
        creq::Method::GET,
        server.uri("/slow").parse().unwrap(),
    ));

    let mut response = call.execute().await.unwrap();
    let chunk = response.chunk().await.unwrap().unwrap();
    assert_eq!(chunk.as_ref(), b"partial");

    call.cancel();
    let err = response.chunk().await.unwrap_err();
    assert!(err.is_canceled());
    drop(response);
    let _ = release_tx.send(());

    let next = client.get(server.uri("/next")).send().await.unwrap();
    assert_eq!(next.text().await.unwrap(), "still alive");
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn trailers_after_body() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;

        let request = io.read_request().await;
        io.send_response_headers(request.stream_id, 200, &[], false)
            .await;
        io.send_data(request.stream_id, b"payload", false).await;
        io.send_trailers(request.stream_id, &[("grpc-status", "0")])
            .await;
    })
    .await;

    let mut response = client().get(server.uri("/")).send().await.unwrap();
    while response.chunk().await.unwrap().is_some() {}

    let trailers = response.trailers().await.unwrap().expect("trailers");
    assert_eq!(trailers["grpc-status"], "0");
}

#[tokio::test]
async fn trailers_before_body_exhausted_is_illegal() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;
        let request = io.read_request().await;
        io.send_response_headers(request.stream_id, 200, &[], false)
            .await;
        io.send_data(request.stream_id, b"unread", true).await;
    })
    .await;

    let mut response = client().get(server.uri("/")).send().await.unwrap();
    let err = response.trailers().await.unwrap_err();
    assert!(err.is_illegal_state());
}

#[tokio::test]
async fn informational_headers_are_skipped() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;

        let request = io.read_request().await;
        io.send_response_headers(request.stream_id, 100, &[], false)
            .await;
        io.send_response(request.stream_id, 200, b"after continue").await;
    })
    .await;

    let response = client().get(server.uri("/")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "after continue");
}

#[tokio::test]
async fn max_concurrent_streams_overflow_spills_to_second_connection() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));

    let server = {
        let gate = gate.clone();
        server::spawn(move |mut io| {
            let gate = gate.clone();
            async move {
                io.handshake(&[(server::SETTING_MAX_CONCURRENT_STREAMS, 1)]).await;

                let request = io.read_request().await;
                // Hold the stream open until both calls are in flight.
                let _permit = gate.acquire().await.unwrap();
                io.send_response(request.stream_id, 200, b"ok").await;

                // A second exchange may follow on this connection.
                if let Some(frame) = io.read_frame().await {
                    if frame.kind == server::HEADERS {
                        io.send_response(frame.stream_id, 200, b"ok").await;
                    }
                }
            }
        })
        .await
    };

    let client = client();
    let first = client.call(creq::Request::new(
        creq::Method::GET,
        server.uri("/a").parse().unwrap(),
    ));
    let second = client.call(creq::Request::new(
        creq::Method::GET,
        server.uri("/b").parse().unwrap(),
    ));

    let first_task = {
        let first = first.clone();
        tokio::spawn(async move { first.execute().await })
    };
    // Let the first call occupy the only stream slot.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second_task = {
        let second = second.clone();
        tokio::spawn(async move { second.execute().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Unblock the held streams.
    gate.add_permits(2);

    let one = first_task.await.unwrap().unwrap();
    let two = second_task.await.unwrap().unwrap();
    assert_eq!(one.status(), 200);
    assert_eq!(two.status(), 200);

    // The saturated connection forced a second one.
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn consumed_body_returns_stream_window_credit() {
    let server = server::spawn(|mut io| async move {
        // A small stream window makes the client's update threshold easy
        // to cross.
        io.handshake(&[]).await;

        let request = io.read_request().await;
        io.send_response_headers(request.stream_id, 200, &[], false)
            .await;
        io.send_data(request.stream_id, b"0123456789", false).await;

        // Consuming ten bytes of a sixteen-byte window crosses the
        // half-window threshold, so credit comes back.
        loop {
            let frame = io.read_frame().await.expect("window update");
            if frame.kind == server::WINDOW_UPDATE && frame.stream_id == request.stream_id {
                let increment =
                    u32::from_be_bytes(frame.payload[..4].try_into().unwrap());
                assert!(increment >= 8, "increment was {increment}");
                break;
            }
        }

        io.send_data(request.stream_id, b"abcdef", true).await;
    })
    .await;

    let mut config = creq::ClientConfig::default();
    config.initial_stream_window = Some(16);
    let client = creq::Client::with_config(config);

    let body = client
        .get(server.uri("/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "0123456789abcdef");
}

#[tokio::test]
async fn eager_strategy_credits_every_chunk() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;

        let request = io.read_request().await;
        io.send_response_headers(request.stream_id, 200, &[], false)
            .await;
        io.send_data(request.stream_id, b"abc", false).await;

        // The eager strategy returns credit for the chunk on both
        // scopes as soon as it is consumed.
        let mut saw_stream = false;
        let mut saw_connection = false;
        while !(saw_stream && saw_connection) {
            let frame = io.read_frame().await.expect("window update");
            if frame.kind != server::WINDOW_UPDATE {
                continue;
            }
            let increment = u32::from_be_bytes(frame.payload[..4].try_into().unwrap());
            assert_eq!(increment, 3);
            if frame.stream_id == request.stream_id {
                saw_stream = true;
            } else if frame.stream_id == 0 {
                saw_connection = true;
            }
        }

        io.send_data(request.stream_id, b"", true).await;
    })
    .await;

    let mut config = creq::ClientConfig::default();
    config.window_update_strategy = std::sync::Arc::new(creq::EagerWindowUpdates);
    let client = creq::Client::with_config(config);

    let body = client
        .get(server.uri("/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "abc");
}

#[tokio::test]
async fn request_timeout_expires() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;
        let request = io.read_request().await;
        // Never respond; wait for the client to give up.
        let _ = io.expect_rst(request.stream_id).await;
    })
    .await;

    let err = client()
        .get(server.uri("/slow"))
        .timeout(Duration::from_millis(100))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn get_with_body_is_rejected_before_the_wire() {
    let client = client();
    let mut request = creq::Request::new(creq::Method::GET, "http://h/".parse().unwrap());
    *request.body_mut() = Some(creq::Body::from("nope"));

    let err = client.execute(request).await.unwrap_err();
    assert!(err.is_builder());
}

#[tokio::test]
async fn keepalive_ping_is_answered() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;

        let request = io.read_request().await;
        io.send_response(request.stream_id, 200, b"ok").await;

        // The keepalive ticker should probe within a few intervals.
        loop {
            match io.read_frame().await {
                Some(frame) if frame.kind == server::PING => {
                    let payload = frame.payload.clone();
                    io.write_frame(server::PING, server::FLAG_ACK, 0, &payload)
                        .await;
                    return;
                }
                Some(_) => continue,
                None => return,
            }
        }
    })
    .await;

    let mut config = creq::ClientConfig::default();
    config.ping_interval = Some(Duration::from_millis(50));
    let client = creq::Client::with_config(config);

    let response = client.get(server.uri("/")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    // Leave time for at least one keepalive probe round trip.
    tokio::time::sleep(Duration::from_millis(200)).await;
}
