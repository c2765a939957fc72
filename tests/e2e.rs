use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use vsmux::{BlockingTransport, Config, ConnectionGroup, Mux, VirtualSocket};

/// Helper macro to add timeout to tests
macro_rules! test_with_timeout {
    ($test_name:ident, $timeout_secs:expr, $test_body:block) => {
        #[tokio::test]
        async fn $test_name() {
            let result = tokio::time::timeout(
                Duration::from_secs($timeout_secs),
                async move $test_body
            ).await;

            match result {
                Ok(Ok(())) => {},
                Ok(Err(e)) => panic!("Test failed: {:?}", e),
                Err(_) => panic!("Test timed out after {} seconds", $timeout_secs),
            }
        }
    };
}

fn test_config() -> Config {
    Config {
        shutdown_request_timeout: Duration::from_millis(500),
        shutdown_monitor_period: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Waits until the peer has announced an acceptor on `group`.
async fn wait_for_acceptor(group: &ConnectionGroup) {
    while !group.has_remote_acceptor() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Accepts one TCP connection and echoes every virtual socket opened on it,
/// prefixing replies with `echo: `.
fn spawn_echo_server(
    listener: TcpListener,
    sockets: usize,
) -> tokio::task::JoinHandle<Result<(), vsmux::MuxError>> {
    tokio::spawn(async move {
        let mux = Mux::new(test_config())?;
        let (stream, _) = listener.accept().await?;
        let group = mux.attach(stream, false)?;
        let acceptor = group.register_acceptor().await?;

        let mut tasks = Vec::new();
        for _ in 0..sockets {
            let mut socket = acceptor.accept().await?;
            tasks.push(tokio::spawn(async move {
                let mut request = Vec::new();
                socket.read_to_end(&mut request).await?;
                socket.write_all(b"echo: ").await?;
                socket.write_all(&request).await?;
                socket.close()?;
                Ok::<(), vsmux::MuxError>(())
            }));
        }
        for task in tasks {
            task.await.map_err(|e| std::io::Error::other(e.to_string()))??;
        }

        acceptor.close().await?;
        group.release()?;
        group.closed().await;
        Ok(())
    })
}

test_with_timeout!(test_e2e_basic_tcp_communication, 30, {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = spawn_echo_server(listener, 1);

    let mux = Mux::new(test_config())?;
    let group = mux.connect_to_peer(addr, None, Duration::from_secs(5)).await?;
    assert_eq!(group.peer_addr(), Some(addr));
    assert_eq!(mux.groups_by_remote(&addr).len(), 1);
    wait_for_acceptor(&group).await;

    let mut socket = VirtualSocket::connect(&group, Duration::from_secs(5)).await?;
    socket.write_all(b"hello").await?;
    socket.shutdown().await?;

    let mut reply = Vec::new();
    socket.read_to_end(&mut reply).await?;
    assert_eq!(reply, b"echo: hello");
    socket.close()?;

    // Both ends agree to shut the connection down once idle
    group.release()?;
    tokio::time::timeout(Duration::from_secs(10), group.closed()).await?;
    server.await??;
    assert!(mux.groups_by_remote(&addr).is_empty());

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_e2e_multiple_sockets_share_connection, 30, {
    const NUM_SOCKETS: usize = 3;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = spawn_echo_server(listener, NUM_SOCKETS);

    let mux = Mux::new(test_config())?;
    let group = mux.connect_to_peer(addr, None, Duration::from_secs(5)).await?;
    wait_for_acceptor(&group).await;

    let mut client_tasks = Vec::new();
    for i in 0..NUM_SOCKETS {
        // Every caller gets the same shared connection
        let shared = mux.connect_to_peer(addr, None, Duration::from_secs(5)).await?;
        assert_eq!(shared.id(), group.id());

        client_tasks.push(tokio::spawn(async move {
            let mut socket = VirtualSocket::connect(&shared, Duration::from_secs(5)).await?;
            let data = format!("socket {i}");
            socket.write_all(data.as_bytes()).await?;
            socket.shutdown().await?;

            let mut reply = Vec::new();
            socket.read_to_end(&mut reply).await?;
            assert_eq!(reply, format!("echo: {data}").as_bytes());
            socket.close()?;
            shared.release()
        }));
    }

    for task in client_tasks {
        task.await??;
    }
    assert_eq!(mux.groups().len(), 1);

    group.release()?;
    tokio::time::timeout(Duration::from_secs(10), group.closed()).await?;
    server.await??;

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_e2e_large_data_transfer, 30, {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = spawn_echo_server(listener, 1);

    // Large enough to span many chunks and several fairness slices
    let test_data: Vec<u8> = (0..256 * 1024).map(|i| (i % 256) as u8).collect();

    let mux = Mux::new(test_config())?;
    let group = mux.connect_to_peer(addr, None, Duration::from_secs(5)).await?;
    wait_for_acceptor(&group).await;

    let mut socket = VirtualSocket::connect(&group, Duration::from_secs(5)).await?;
    socket.write_all(&test_data).await?;
    socket.shutdown().await?;

    let mut reply = Vec::new();
    socket.read_to_end(&mut reply).await?;
    assert_eq!(&reply[..6], b"echo: ");
    assert_eq!(&reply[6..], &test_data[..]);
    socket.close()?;

    group.release()?;
    server.await??;

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_e2e_peer_connection_lost, 30, {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mux = Mux::new(test_config())?;
        let group = mux.attach(stream, false)?;
        let acceptor = group.register_acceptor().await?;
        let socket = acceptor.accept().await?;
        // Tear the real connection down under the live socket
        group.close();
        drop(socket);
        Ok::<(), vsmux::MuxError>(())
    });

    let mux = Mux::new(test_config())?;
    let group = mux.connect_to_peer(addr, None, Duration::from_secs(5)).await?;
    wait_for_acceptor(&group).await;
    let mut socket = VirtualSocket::connect(&group, Duration::from_secs(5)).await?;
    server.await??;

    // The connection ending reads as end of stream on every socket
    let mut rest = Vec::new();
    socket.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());

    // With the peer gone, shutdown does not wait for its agreement
    drop(socket);
    group.release()?;
    tokio::time::timeout(Duration::from_secs(10), group.closed()).await?;

    Ok::<(), Box<dyn std::error::Error>>(())
});

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_e2e_blocking_transport() {
    let result = tokio::time::timeout(Duration::from_secs(30), async move {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = spawn_echo_server(listener, 1);

        let stream = tokio::task::spawn_blocking(move || std::net::TcpStream::connect(addr)).await??;
        let transport = BlockingTransport::from_std_tcp(stream)?;

        let mux = Mux::new(test_config())?;
        let group = mux.attach(transport, true)?;
        assert_eq!(group.peer_addr(), Some(addr));
        wait_for_acceptor(&group).await;

        let mut socket = VirtualSocket::connect(&group, Duration::from_secs(5)).await?;
        socket.write_all(b"over a blocking stream").await?;
        socket.shutdown().await?;

        let mut reply = Vec::new();
        socket.read_to_end(&mut reply).await?;
        assert_eq!(reply, b"echo: over a blocking stream");
        socket.close()?;

        group.release()?;
        tokio::time::timeout(Duration::from_secs(10), group.closed()).await?;
        server.await??;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => panic!("Test failed: {:?}", e),
        Err(_) => panic!("Test timed out after 30 seconds"),
    }
}
