// apiserver.rs

use std::{future::Future, net::SocketAddr};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpSocket, TcpStream},
    task::JoinSet,
    time::timeout,
};

use crate::*;

const LISTEN_BACKLOG: u32 = 5;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// Upper bound on the lifetime of one connection handler.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LINE_LEN: u64 = 1024;
const MAX_HEAD_LINES: usize = 32;
const FILE_CHUNK: usize = 1024;
const REBOOT_FLUSH_DELAY: Duration = Duration::from_millis(500);

pub async fn run_api_server(
    state: Arc<Pin<Box<MyState>>>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    state.wait_for_wifi().await;

    let listen = format!("{}:{}", state.config.listen, state.config.port);
    let addr = listen.parse::<net::SocketAddr>()?;
    let listener = bind_listener(addr)?;
    info!("API server listening to {listen} ({})", state.identity().await);
    serve(state, listener, shutdown).await
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Accept loop. Every connection gets its own handler task; the set of
/// running handlers is the set of open client sockets. When `shutdown`
/// completes, all of them are aborted, which closes their sockets.
pub async fn serve(
    state: Arc<Pin<Box<MyState>>>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let mut open = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Closing {} open connections", open.len());
                open.shutdown().await;
                return Ok(());
            }

            res = listener.accept() => match res {
                Ok((sock, peer)) => {
                    info!("Connection from {peer}");
                    open.spawn(handle_connection(state.clone(), sock, peer));
                }
                Err(e) => {
                    error!("Accept failed: {e}");
                    sleep(ACCEPT_BACKOFF).await;
                }
            },

            Some(done) = open.join_next(), if !open.is_empty() => {
                if let Err(e) = done {
                    if e.is_panic() {
                        bail!("Connection handler crashed: {e}");
                    }
                }
                debug!("{} connections open", open.len());
            }
        }
    }
}

async fn handle_connection(state: Arc<Pin<Box<MyState>>>, mut sock: TcpStream, peer: SocketAddr) {
    let cnt = state.api_cnt.fetch_add(1, Ordering::Relaxed);

    match timeout(CONNECTION_TIMEOUT, process_request(&state, &mut sock, cnt)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("#{cnt} {peer}: {e:#}"),
        Err(_) => warn!("#{cnt} {peer}: timed out"),
    }

    if let Err(e) = sock.shutdown().await {
        debug!("#{cnt} {peer}: shutdown: {e}");
    }
    debug!("#{cnt} Disconnecting {peer}");
}

async fn process_request(state: &MyState, sock: &mut TcpStream, cnt: u32) -> anyhow::Result<()> {
    let (reader, mut writer) = sock.split();
    let head = read_head(&mut BufReader::new(reader)).await?;
    // a malformed head just drops the connection
    let req = http::parse_request_head(&head)?;
    info!(
        "#{cnt} Request {} {}",
        req.method,
        String::from_utf8_lossy(&req.uri)
    );

    match http::route(&req.uri, &state.files) {
        Route::Api(cmd) => {
            apply_command(state, cmd).await;
            let resp = http::json_response(&state.status().await)?;
            writer.write_all(&resp).await?;
        }
        Route::Reboot => reboot(state, &mut writer).await?,
        Route::File(path) => send_file(state, &mut writer, &path).await?,
        Route::NotFound => writer.write_all(&http::error_response(404)).await?,
    }
    writer.flush().await?;
    Ok(())
}

/// Header lines up to the blank line. End of stream also ends the head.
async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut lines = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = AsyncReadExt::take(&mut *reader, MAX_LINE_LEN)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 || line.trim_ascii().is_empty() {
            break;
        }
        if !line.ends_with(b"\n") && n as u64 == MAX_LINE_LEN {
            bail!(HttpError::HeadTooLarge);
        }
        if lines.len() == MAX_HEAD_LINES {
            bail!(HttpError::HeadTooLarge);
        }
        lines.push(line);
    }
    Ok(lines)
}

pub async fn apply_command(state: &MyState, cmd: ApiCommand) {
    let mut relay = state.relay.write().await;
    match cmd {
        ApiCommand::Status => {}
        ApiCommand::On => relay.force(true),
        ApiCommand::Off => relay.force(false),
        ApiCommand::Auto => relay.release(),
    }
}

async fn send_file<W: AsyncWrite + Unpin>(
    state: &MyState,
    writer: &mut W,
    path: &str,
) -> anyhow::Result<()> {
    let Some(fpath) = state.files.path_of(path) else {
        writer.write_all(&http::error_response(404)).await?;
        return Ok(());
    };
    let mime = fpath.extension().and_then(|e| e.to_str()).unwrap_or_default();
    debug!("send_file: {path} mime_type: {mime}");

    let mut fd = match std::fs::File::open(&fpath) {
        Ok(fd) => fd,
        Err(e) => {
            debug!("send file error: {e} {path}");
            writer.write_all(&http::error_response(404)).await?;
            return Ok(());
        }
    };
    let len = fd.metadata().ok().map(|m| m.len() as usize);
    let head = http::build_headers(200, Some(mime), None, len, Some(&CacheControl::Immutable))?;
    writer.write_all(&head).await?;

    // small chunks, so the other tasks get to run in between
    let mut buf = [0u8; FILE_CHUNK];
    loop {
        let n = std::io::Read::read(&mut fd, &mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
    }
    Ok(())
}

async fn reboot<W: AsyncWrite + Unpin>(state: &MyState, writer: &mut W) -> anyhow::Result<()> {
    let resp = http::json_response(&serde_json::json!({ "status": "reboot" }))?;
    writer.write_all(&resp).await?;
    writer.flush().await?;
    sleep(REBOOT_FLUSH_DELAY).await;

    warn!("Reboot requested over API.");
    *state.reset.write().await = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assets::tests::temp_assets, state::test_state};
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    async fn start(state: Arc<Pin<Box<MyState>>>) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(state, listener, async move {
            let _ = rx.await;
        }));
        (addr, tx, server)
    }

    async fn request(addr: SocketAddr, raw: &str) -> String {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        sock.write_all(raw.as_bytes()).await.unwrap();
        sock.shutdown().await.unwrap();
        let mut resp = Vec::new();
        // a reset after an aborted request just ends the reply
        let _ = sock.read_to_end(&mut resp).await;
        String::from_utf8_lossy(&resp).into_owned()
    }

    fn get(path: &str) -> String {
        format!("GET {path} HTTP/1.1\r\nHost: relay\r\nAccept: */*\r\n\r\n")
    }

    fn body(resp: &str) -> &str {
        resp.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or_default()
    }

    #[tokio::test]
    async fn status_and_commands() {
        let (state, output) = test_state(ScheduleTable::default(), SensorReading::new(20.0));
        let (addr, _stop, _server) = start(state.clone()).await;

        let resp = request(addr, &get("/api/v1/status")).await;
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.contains("Content-Type: application/json\r\n"));
        let json: serde_json::Value = serde_json::from_str(body(&resp)).unwrap();
        assert_eq!(json["forced"], false);
        assert_eq!(json["switch"], 0);
        assert_eq!(json["temp"], 20.0);

        let resp = request(addr, &get("/api/v1/on")).await;
        let json: serde_json::Value = serde_json::from_str(body(&resp)).unwrap();
        assert_eq!(json["forced"], true);
        assert_eq!(json["switch"], 1);
        assert!(output.is_on());

        let resp = request(addr, &get("/api/v1/auto")).await;
        let json: serde_json::Value = serde_json::from_str(body(&resp)).unwrap();
        assert_eq!(json["forced"], false);
        assert_eq!(state.relay.read().await.state().forced, false);
    }

    #[tokio::test]
    async fn last_command_wins() {
        let (state, output) = test_state(ScheduleTable::default(), SensorReading::new(20.0));
        let (addr, _stop, _server) = start(state.clone()).await;

        let (on, off) = (get("/api/v1/on"), get("/api/v1/off"));
        tokio::join!(request(addr, &on), request(addr, &off));
        let device = state.relay.read().await.state();
        assert!(device.forced);
        assert_eq!(device.relay_on, output.is_on());

        request(addr, &get("/api/v1/on")).await;
        request(addr, &get("/api/v1/off")).await;
        assert_eq!(
            state.relay.read().await.state(),
            DeviceState { relay_on: false, forced: true }
        );

        request(addr, &get("/api/v1/off")).await;
        request(addr, &get("/api/v1/on")).await;
        assert_eq!(
            state.relay.read().await.state(),
            DeviceState { relay_on: true, forced: true }
        );
        assert!(output.is_on());
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (state, _) = test_state(ScheduleTable::default(), SensorReading::default());
        let (addr, _stop, _server) = start(state).await;

        let resp = request(addr, &get("/foo/bar")).await;
        assert!(resp.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(body(&resp).contains("Not Found"));
        assert!(resp.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn malformed_request_drops_connection() {
        let (state, _) = test_state(ScheduleTable::default(), SensorReading::default());
        let (addr, _stop, _server) = start(state.clone()).await;

        assert_eq!(request(addr, "HELLO\r\n\r\n").await, "");
        assert_eq!(request(addr, "").await, "");

        // still serving afterwards
        let resp = request(addr, &get("/api/v1/status")).await;
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(state.api_cnt.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn oversized_head_is_dropped() {
        let (state, _) = test_state(ScheduleTable::default(), SensorReading::default());
        let (addr, _stop, _server) = start(state).await;

        let mut raw = String::from("GET /api/v1/status HTTP/1.1\r\n");
        for i in 0..(MAX_HEAD_LINES + 1) {
            raw.push_str(&format!("X-Pad-{i}: x\r\n"));
        }
        raw.push_str("\r\n");
        assert_eq!(request(addr, &raw).await, "");
    }

    #[tokio::test]
    async fn serves_whitelisted_files() {
        let dir = temp_assets(
            "serve",
            &[("index.html", b"<html>relay</html>"), ("style.css", b"body{}")],
        );
        let state = Arc::new(Box::pin(MyState::new(
            MyConfig::default(),
            ScheduleTable::default(),
            KnownFileSet::scan(&dir),
            Relay::new(Box::new(VirtualOutput::default())),
            SensorChannel::fixed(SensorReading::default()),
        )));
        let (addr, _stop, _server) = start(state).await;

        let resp = request(addr, &get("/")).await;
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.contains("Content-Type: text/html\r\n"));
        assert!(resp.contains("Cache-Control: public, max-age=604800, immutable\r\n"));
        assert_eq!(body(&resp), "<html>relay</html>");

        let resp = request(addr, &get("/style.css")).await;
        assert!(resp.contains("Content-Type: text/css\r\n"));
        assert!(resp.contains("Content-Length: 6\r\n"));
        assert_eq!(body(&resp), "body{}");

        let resp = request(addr, &get("/../Cargo.toml")).await;
        assert!(resp.starts_with("HTTP/1.1 404"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn reboot_acks_then_raises_reset() {
        let (state, _) = test_state(ScheduleTable::default(), SensorReading::default());
        let (addr, _stop, _server) = start(state.clone()).await;

        let resp = request(addr, &get("/api/v1/reboot")).await;
        assert_eq!(body(&resp), r#"{"status":"reboot"}"#);
        assert!(*state.reset.read().await);
    }

    #[tokio::test]
    async fn shutdown_closes_open_connections() {
        let (state, _) = test_state(ScheduleTable::default(), SensorReading::default());
        let (addr, stop, server) = start(state).await;

        // connected but never sends a complete head
        let mut idle = TcpStream::connect(addr).await.unwrap();
        idle.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();

        let mut buf = Vec::new();
        let n = timeout(Duration::from_secs(2), idle.read_to_end(&mut buf)).await;
        assert!(matches!(n, Ok(Ok(0)) | Ok(Err(_))));
    }
}

// EOF
