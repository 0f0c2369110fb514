use std::net::SocketAddr;
use std::sync::Arc;

use cinder_app::HttpStreamingEndpoint;
use cinder_events::ListenerBus;
use cinder_test_support::fixtures;
use cinder_torrent_core::{SessionSettings, StreamingEndpoint, TransferEngine};
use cinder_torrent_loopback::LoopbackEngine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn get(addr: SocketAddr, path: &str) -> anyhow::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

#[tokio::test]
async fn serves_task_files_by_index() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = Arc::new(LoopbackEngine::in_memory());
    engine.attach(ListenerBus::new());
    engine.start(SessionSettings::default()).await?;

    let hash = fixtures::info_hash(1);
    engine
        .add_task(fixtures::add_params(&hash, "movie", dir.path()), false)
        .await?;
    let file = engine
        .task(&hash)
        .and_then(|task| task.file_path(0))
        .ok_or_else(|| anyhow::anyhow!("fixture task has a file"))?;
    std::fs::create_dir_all(file.parent().unwrap_or(dir.path()))?;
    std::fs::write(&file, b"frame-data")?;

    let endpoint = HttpStreamingEndpoint::new(engine.clone());
    endpoint.start("127.0.0.1", 0).await?;
    let addr = endpoint
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("endpoint is listening"))?;

    let ok = get(addr, &format!("/stream/{hash}/0")).await?;
    assert!(ok.starts_with("HTTP/1.1 200"), "{ok}");
    assert!(ok.ends_with("frame-data"));

    let missing_index = get(addr, &format!("/stream/{hash}/7")).await?;
    assert!(missing_index.starts_with("HTTP/1.1 404"));

    let unknown = get(addr, &format!("/stream/{}/0", fixtures::info_hash(2))).await?;
    assert!(unknown.starts_with("HTTP/1.1 404"));

    let malformed = get(addr, "/stream/not-a-hash/0").await?;
    assert!(malformed.starts_with("HTTP/1.1 400"));

    endpoint.stop().await;
    assert!(endpoint.local_addr().is_none());
    assert!(TcpStream::connect(addr).await.is_err());
    Ok(())
}
