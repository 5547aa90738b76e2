mod support;

use std::net::SocketAddr;
use std::time::Duration;

use support::server;

/// Poll until the pool drains or the deadline passes.
async fn wait_for_empty_pool(client: &creq::Client) {
    for _ in 0..100 {
        if client.connection_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "pool never drained; {} connections remain",
        client.connection_count()
    );
}

#[tokio::test]
async fn sequential_calls_share_a_connection() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;
        for _ in 0..2 {
            let request = io.read_request().await;
            io.send_response(request.stream_id, 200, b"ok").await;
        }
    })
    .await;

    let client = creq::Client::new();

    let first = client.get(server.uri("/1")).send().await.unwrap();
    first.bytes().await.unwrap();

    // The released connection is idle in the pool.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.connection_count(), 1);
    assert_eq!(client.idle_connection_count(), 1);

    let second = client.get(server.uri("/2")).send().await.unwrap();
    second.bytes().await.unwrap();

    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn keep_alive_expiry_evicts_idle_connections() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;
        let request = io.read_request().await;
        io.send_response(request.stream_id, 200, b"ok").await;
        // Drain until the client goes away.
        while io.read_frame().await.is_some() {}
    })
    .await;

    let mut config = creq::ClientConfig::default();
    config.keep_alive = Duration::from_millis(100);
    let client = creq::Client::with_config(config);

    let response = client.get(server.uri("/")).send().await.unwrap();
    response.bytes().await.unwrap();

    wait_for_empty_pool(&client).await;
}

#[tokio::test]
async fn excess_idle_connections_are_evicted() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;
        let request = io.read_request().await;
        io.send_response(request.stream_id, 200, b"ok").await;
        while io.read_frame().await.is_some() {}
    })
    .await;

    let mut config = creq::ClientConfig::default();
    // No idle connections are retained at all.
    config.max_idle_connections = 0;
    config.keep_alive = Duration::from_secs(300);
    let client = creq::Client::with_config(config);

    let response = client.get(server.uri("/")).send().await.unwrap();
    response.bytes().await.unwrap();

    wait_for_empty_pool(&client).await;
}

#[tokio::test]
async fn two_refusals_poison_the_connection() {
    let nth = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let server = {
        let nth = nth.clone();
        server::spawn(move |mut io| {
            let n = nth.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                io.handshake(&[]).await;

                if n == 0 {
                    // Refuse twice over this connection's lifetime: once
                    // for the stream, once for the retry. That poisons
                    // the connection.
                    let request = io.read_request().await;
                    io.send_rst(request.stream_id, server::REFUSED_STREAM).await;
                    let retry = io.read_request().await;
                    assert_eq!(retry.stream_id, 3);
                    io.send_rst(retry.stream_id, server::REFUSED_STREAM).await;
                } else {
                    let request = io.read_request().await;
                    io.send_response(request.stream_id, 200, b"fresh").await;
                }
            }
        })
        .await
    };

    let client = creq::Client::new();
    let response = client.get(server.uri("/")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "fresh");

    // The poisoned connection was abandoned for a fresh one.
    assert_eq!(server.connections(), 2);
}

struct MapResolver {
    target: SocketAddr,
}

impl creq::Resolve for MapResolver {
    fn resolve(&self, _host: &str, _port: u16) -> creq::Resolving {
        let target = self.target;
        Box::pin(async move { Ok(vec![target]) })
    }
}

/// Coalesce any two destinations that share a port, standing in for the
/// certificate-coverage check a TLS deployment would make.
struct SamePortCoalescing;

impl creq::CoalescingPolicy for SamePortCoalescing {
    fn permits(&self, existing: &creq::Address, target: &creq::Address) -> bool {
        existing.port() == target.port() && existing.scheme() == target.scheme()
    }
}

#[tokio::test]
async fn coalescing_policy_shares_a_connection_across_hosts() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;

        let first = io.read_request().await;
        assert!(first.field(":authority").unwrap().starts_with("alpha:"));
        io.send_response(first.stream_id, 200, b"alpha").await;

        let second = io.read_request().await;
        assert_eq!(second.stream_id, 3);
        assert!(second.field(":authority").unwrap().starts_with("beta:"));
        io.send_response(second.stream_id, 200, b"beta").await;
    })
    .await;

    let port = server.addr().port();

    let mut config = creq::ClientConfig::default();
    config.resolver = std::sync::Arc::new(MapResolver {
        target: server.addr(),
    });
    config.coalescing = std::sync::Arc::new(SamePortCoalescing);
    let client = creq::Client::with_config(config);

    let alpha = client
        .get(format!("http://alpha:{port}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(alpha.text().await.unwrap(), "alpha");

    let beta = client
        .get(format!("http://beta:{port}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(beta.text().await.unwrap(), "beta");

    // Both authorities traveled over one coalesced connection.
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn concurrent_calls_build_at_most_one_connection() {
    let server = server::spawn(|mut io| async move {
        io.handshake(&[]).await;

        let mut pending = Vec::new();
        for _ in 0..5 {
            pending.push(io.read_request().await.stream_id);
        }
        for id in pending {
            io.send_response(id, 200, b"ok").await;
        }
    })
    .await;

    let client = creq::Client::new();

    let mut tasks = Vec::new();
    for n in 0..5 {
        let client = client.clone();
        let uri = server.uri(&format!("/{n}"));
        tasks.push(tokio::spawn(async move {
            client.get(uri).send().await.unwrap().status()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), 200);
    }

    // Five racing calls, one destination: exactly one connection built.
    assert_eq!(server.connections(), 1);
}
