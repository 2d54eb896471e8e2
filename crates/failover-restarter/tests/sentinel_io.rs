//! `SentinelWatcher` against local RESP endpoints

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use failover_restarter::config::SentinelConfig;
use failover_restarter::sentinel::{DiscoveryError, PrimaryWatcher, SentinelWatcher};

type CommandLog = Arc<Mutex<Vec<Vec<String>>>>;

fn sentinel_config(addr: SocketAddr, password: Option<&str>, timeout: Duration) -> SentinelConfig {
    SentinelConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        password: password.map(str::to_string),
        master_set: "mymaster".to_string(),
        timeout,
    }
}

/// Read one RESP array of bulk strings; `None` at end of stream
async fn read_command<R: AsyncBufRead + Unpin>(reader: &mut R) -> Option<Vec<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await.ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;

        let mut buf = vec![0u8; len + 2];
        reader.read_exact(&mut buf).await.ok()?;
        buf.truncate(len);
        args.push(String::from_utf8(buf).ok()?);
    }
    Some(args)
}

fn bulk_array(items: &[&str]) -> String {
    let mut out = format!("*{}\r\n", items.len());
    for item in items {
        out.push_str(&format!("${}\r\n{}\r\n", item.len(), item));
    }
    out
}

/// Sentinel answering `SENTINEL MASTER` with `reply` and `+OK` to anything else
async fn start_fake_sentinel(reply: &'static [&'static str]) -> (SocketAddr, CommandLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = CommandLog::default();

    let seen = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);

                while let Some(command) = read_command(&mut reader).await {
                    let response = if command[0].eq_ignore_ascii_case("SENTINEL") {
                        bulk_array(reply)
                    } else {
                        "+OK\r\n".to_string()
                    };
                    seen.lock().unwrap().push(command);
                    if write.write_all(response.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, log)
}

#[tokio::test]
async fn authenticates_then_reads_master_address() {
    let (addr, log) = start_fake_sentinel(&[
        "name", "mymaster", "ip", "10.0.0.7", "port", "6379", "flags", "master",
    ])
    .await;

    let watcher =
        SentinelWatcher::new(sentinel_config(addr, Some("s3cret"), Duration::from_secs(5)))
            .unwrap();
    assert_eq!(watcher.current_primary().await.unwrap(), "10.0.0.7");

    let commands = log.lock().unwrap().clone();
    let auth = commands
        .iter()
        .position(|c| c[0].eq_ignore_ascii_case("AUTH"))
        .expect("AUTH sent");
    let query = commands
        .iter()
        .position(|c| c[0].eq_ignore_ascii_case("SENTINEL"))
        .expect("SENTINEL sent");

    assert_eq!(commands[auth], vec!["AUTH", "s3cret"]);
    assert_eq!(commands[query], vec!["SENTINEL", "MASTER", "mymaster"]);
    assert!(auth < query);
}

#[tokio::test]
async fn no_password_skips_auth() {
    let (addr, log) = start_fake_sentinel(&["ip", "10.0.0.8", "flags", "master"]).await;

    let watcher = SentinelWatcher::new(sentinel_config(addr, None, Duration::from_secs(5))).unwrap();
    assert_eq!(watcher.current_primary().await.unwrap(), "10.0.0.8");

    let commands = log.lock().unwrap().clone();
    assert!(!commands.iter().any(|c| c[0].eq_ignore_ascii_case("AUTH")));
}

#[tokio::test]
async fn master_marked_down_is_unavailable() {
    let (addr, _log) = start_fake_sentinel(&["ip", "10.0.0.7", "flags", "master,o_down"]).await;

    let watcher = SentinelWatcher::new(sentinel_config(addr, None, Duration::from_secs(5))).unwrap();
    assert!(matches!(
        watcher.current_primary().await,
        Err(DiscoveryError::Unavailable { .. })
    ));
}

#[tokio::test]
async fn silent_sentinel_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Accept and hold connections without ever answering
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let timeout = Duration::from_millis(200);
    let watcher = SentinelWatcher::new(sentinel_config(addr, None, timeout)).unwrap();

    match watcher.current_primary().await {
        Err(DiscoveryError::Timeout(after)) => assert_eq!(after, timeout),
        other => panic!("expected timeout, got {other:?}"),
    }
}
