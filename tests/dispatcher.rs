mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use support::server;

fn client_with(config: creq::ClientConfig) -> creq::Client {
    creq::Client::with_config(config)
}

async fn recv<T>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a callback")
        .expect("callback channel closed")
}

/// A server that answers `count` requests in arrival order, stamping
/// each response body with its serving sequence.
async fn sequential_server(count: usize, delay: Duration) -> server::H2Server {
    server::spawn(move |mut io| async move {
        io.handshake(&[]).await;
        for n in 0..count {
            let request = io.read_request().await;
            tokio::time::sleep(delay).await;
            io.send_response(request.stream_id, 200, n.to_string().as_bytes())
                .await;
        }
    })
    .await
}

#[tokio::test]
async fn per_host_cap_admits_fifo() {
    let server = sequential_server(3, Duration::from_millis(50)).await;

    let mut config = creq::ClientConfig::default();
    config.max_requests_per_host = 1;
    let client = client_with(config);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for n in 0..3 {
        let call = client.call(creq::Request::new(
            creq::Method::GET,
            server.uri(&format!("/{n}")).parse().unwrap(),
        ));
        let tx = tx.clone();
        call.enqueue(move |result| {
            tx.send((n, result)).unwrap();
        })
        .unwrap();
    }

    // With the host capped at one, the other two wait in the ready queue.
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(client.dispatcher().running_calls_count(), 1);
    assert_eq!(client.dispatcher().queued_calls_count(), 2);

    // Completion respects enqueue order.
    let mut order = Vec::new();
    for _ in 0..3 {
        let (n, result) = recv(&mut rx).await;
        let body = result.unwrap().text().await.unwrap();
        order.push((n, body));
    }
    assert_eq!(
        order,
        vec![
            (0, "0".to_owned()),
            (1, "1".to_owned()),
            (2, "2".to_owned()),
        ]
    );

    assert_eq!(client.dispatcher().running_calls_count(), 0);
}

#[tokio::test]
async fn global_limit_bounds_running_calls() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));

    let make_server = |gate: Arc<tokio::sync::Semaphore>| async move {
        server::spawn(move |mut io| {
            let gate = gate.clone();
            async move {
                io.handshake(&[]).await;
                for _ in 0..2 {
                    let request = io.read_request().await;
                    let _permit = gate.acquire().await.unwrap();
                    io.send_response(request.stream_id, 200, b"ok").await;
                }
            }
        })
        .await
    };

    let server_a = make_server(gate.clone()).await;
    let server_b = make_server(gate.clone()).await;

    let mut config = creq::ClientConfig::default();
    config.max_requests = 2;
    let client = client_with(config);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for uri in [
        server_a.uri("/1"),
        server_a.uri("/2"),
        server_b.uri("/1"),
        server_b.uri("/2"),
    ] {
        let call = client.call(creq::Request::new(creq::Method::GET, uri.parse().unwrap()));
        let tx = tx.clone();
        call.enqueue(move |result| {
            tx.send(result.map(|r| r.status())).unwrap();
        })
        .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.dispatcher().running_calls_count(), 2);
    assert_eq!(client.dispatcher().queued_calls_count(), 2);

    gate.add_permits(4);
    for _ in 0..4 {
        let status = recv(&mut rx).await.unwrap();
        assert_eq!(status, 200);
    }
    assert_eq!(client.dispatcher().running_calls_count(), 0);
}

#[tokio::test]
async fn web_socket_calls_bypass_the_per_host_limit() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));

    let server = {
        let gate = gate.clone();
        server::spawn(move |mut io| {
            let gate = gate.clone();
            async move {
                io.handshake(&[]).await;
                let mut pending = Vec::new();
                for _ in 0..2 {
                    pending.push(io.read_request().await.stream_id);
                }
                let _permits = gate.acquire_many(2).await.unwrap();
                for id in pending {
                    io.send_response(id, 200, b"ok").await;
                }
            }
        })
        .await
    };

    let mut config = creq::ClientConfig::default();
    config.max_requests_per_host = 1;
    let client = client_with(config);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let plain = client.call(creq::Request::new(
        creq::Method::GET,
        server.uri("/plain").parse().unwrap(),
    ));
    let mut upgrade_request =
        creq::Request::new(creq::Method::GET, server.uri("/ws").parse().unwrap());
    upgrade_request.set_web_socket(true);
    let upgrade = client.call(upgrade_request);

    for call in [plain, upgrade] {
        let tx = tx.clone();
        call.enqueue(move |result| {
            tx.send(result.map(|r| r.status())).unwrap();
        })
        .unwrap();
    }

    // Both run despite the per-host cap of one: the upgrade is exempt.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.dispatcher().running_calls_count(), 2);
    assert_eq!(client.dispatcher().queued_calls_count(), 0);

    gate.add_permits(2);
    for _ in 0..2 {
        assert_eq!(recv(&mut rx).await.unwrap(), 200);
    }
}

#[tokio::test]
async fn idle_callback_fires_once_per_transition() {
    let server = sequential_server(2, Duration::ZERO).await;

    let client = client_with(creq::ClientConfig::default());
    let idle_count = Arc::new(AtomicUsize::new(0));
    {
        let idle_count = idle_count.clone();
        client.dispatcher().set_idle_callback(move || {
            idle_count.fetch_add(1, Ordering::SeqCst);
        });
    }

    let run_one = |n: u32| {
        let client = client.clone();
        let server_uri = server.uri(&format!("/{n}"));
        async move {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let call = client.call(creq::Request::new(
                creq::Method::GET,
                server_uri.parse().unwrap(),
            ));
            call.enqueue(move |result| {
                tx.send(result.map(drop)).unwrap();
            })
            .unwrap();
            rx.await.unwrap().unwrap();
        }
    };

    run_one(0).await;
    // Allow the dispatcher's completion bookkeeping to finish.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(idle_count.load(Ordering::SeqCst), 1);

    run_one(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(idle_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancel_all_reaches_queued_and_running_calls() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;
        let request = io.read_request().await;
        // Hold the stream open; the client will cancel.
        let _ = io.expect_rst(request.stream_id).await;
    })
    .await;

    let mut config = creq::ClientConfig::default();
    config.max_requests_per_host = 1;
    let client = client_with(config);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for n in 0..2 {
        let call = client.call(creq::Request::new(
            creq::Method::GET,
            server.uri(&format!("/{n}")).parse().unwrap(),
        ));
        let tx = tx.clone();
        call.enqueue(move |result| {
            tx.send(result.map(drop)).unwrap();
        })
        .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    client.dispatcher().cancel_all();

    for _ in 0..2 {
        let result = recv(&mut rx).await;
        assert!(result.unwrap_err().is_canceled());
    }
}

#[tokio::test]
async fn shutdown_rejects_ready_calls() {
    let client = client_with(creq::ClientConfig::default());
    client.dispatcher().shutdown();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let call = client.call(creq::Request::new(
        creq::Method::GET,
        "http://localhost:1/".parse().unwrap(),
    ));
    call.enqueue(move |result| {
        tx.send(result.map(drop)).unwrap();
    })
    .unwrap();

    let result = recv(&mut rx).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn snapshots_expose_queued_and_running() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;
        let request = io.read_request().await;
        let _ = io.expect_rst(request.stream_id).await;
    })
    .await;

    let mut config = creq::ClientConfig::default();
    config.max_requests_per_host = 1;
    let client = client_with(config);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for n in 0..2 {
        let call = client.call(creq::Request::new(
            creq::Method::GET,
            server.uri(&format!("/{n}")).parse().unwrap(),
        ));
        let tx = tx.clone();
        call.enqueue(move |result| {
            tx.send(result.map(drop)).unwrap();
        })
        .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let queued = client.dispatcher().queued_calls();
    let running = client.dispatcher().running_calls();
    assert_eq!(queued.len(), 1);
    assert_eq!(running.len(), 1);
    assert!(queued[0].uri().path().starts_with('/'));

    client.dispatcher().cancel_all();
    for _ in 0..2 {
        let _ = recv(&mut rx).await;
    }
}
