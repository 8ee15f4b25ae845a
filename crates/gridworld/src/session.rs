//! One connected terminal: login prompt, read task, render task.

use std::sync::Arc;

use bytes::Bytes;
use gridio::line::{LineBuf, trim_ascii_ws};
use gridio::telnet::{IacParser, OPT_NAWS, WindowSize, request_naws};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::arbiter::{Event, EventKind};
use crate::command::Command;
use crate::registry::Registry;
use crate::screen::Screen;
use crate::viewport::Viewport;

pub const BANNER: &[u8] = b"gridmud\r\n";
pub const NAME_PROMPT: &[u8] = b"name: ";

pub const DEFAULT_SIZE: WindowSize = WindowSize {
    width: 80,
    height: 40,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u128);

impl SessionId {
    pub fn from_be_bytes(b: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(b))
    }

    pub fn short(self) -> u64 {
        (self.0 as u64) ^ ((self.0 >> 64) as u64)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.short())
    }
}

pub fn new_session_id() -> SessionId {
    static FALLBACK: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
    let mut b = [0u8; 16];
    if getrandom::getrandom(&mut b).is_err() {
        let n = FALLBACK.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        b[8..].copy_from_slice(&n.to_be_bytes());
    }
    SessionId::from_be_bytes(b)
}

/// Arbiter-side handles for one session.
#[derive(Debug)]
pub struct Outbox {
    replies: watch::Sender<Option<Viewport>>,
    disconnect: watch::Sender<bool>,
}

/// Session-side ends of an [`Outbox`].
#[derive(Debug)]
pub struct Inbox {
    pub replies: watch::Receiver<Option<Viewport>>,
    pub disconnect: watch::Receiver<bool>,
}

impl Outbox {
    pub fn new() -> (Outbox, Inbox) {
        let (replies, replies_rx) = watch::channel(None);
        let (disconnect, disconnect_rx) = watch::channel(false);
        (
            Outbox {
                replies,
                disconnect,
            },
            Inbox {
                replies: replies_rx,
                disconnect: disconnect_rx,
            },
        )
    }

    /// Replace any unread reply; never waits.
    pub fn deliver(&self, v: Viewport) {
        self.replies.send_replace(Some(v));
    }

    pub fn close(&self) {
        self.disconnect.send_replace(true);
    }
}

/// Shared state every connection needs.
#[derive(Clone)]
pub struct SessionCtx {
    pub registry: Arc<Registry>,
    pub events: mpsc::Sender<Event>,
}

struct LineReader<R> {
    rd: R,
    iac: IacParser,
    lines: LineBuf,
    buf: Vec<u8>,
    size: watch::Sender<WindowSize>,
    write_tx: mpsc::Sender<Bytes>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(rd: R, size: watch::Sender<WindowSize>, write_tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            rd,
            iac: IacParser::new().accept(OPT_NAWS),
            lines: LineBuf::new(),
            buf: vec![0u8; 4096],
            size,
            write_tx,
        }
    }

    /// Next non-blank line, trimmed. `None` at EOF.
    async fn next_line(&mut self) -> anyhow::Result<Option<String>> {
        loop {
            while let Some(l) = self.lines.pop_line() {
                let l = trim_ascii_ws(&l);
                if !l.is_empty() {
                    return Ok(Some(String::from_utf8_lossy(l).into_owned()));
                }
            }

            let n = self.rd.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            let parsed = self.iac.parse(&self.buf[..n]);
            if !parsed.replies.is_empty() {
                let _ = self.write_tx.send(Bytes::from(parsed.replies)).await;
            }
            if let Some(ws) = parsed.window {
                debug!(width = ws.width, height = ws.height, "window size");
                self.size.send_replace(ws);
            }
            self.lines.extend(&parsed.data)?;
        }
    }
}

/// Drive one connection from banner to close.
pub async fn handle_conn<S>(
    stream: S,
    peer: String,
    ctx: SessionCtx,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let session = new_session_id();
    let (rd, mut wr) = tokio::io::split(stream);

    let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(128);
    let writer = tokio::spawn(async move {
        while let Some(b) = write_rx.recv().await {
            if wr.write_all(&b[..]).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    info!(session = %session, peer = %peer, "connected");

    let (size_tx, size_rx) = watch::channel(DEFAULT_SIZE);
    let mut reader = LineReader::new(rd, size_tx, write_tx.clone());

    let mut hello = request_naws().to_vec();
    hello.extend_from_slice(BANNER);
    hello.extend_from_slice(NAME_PROMPT);
    let _ = write_tx.send(Bytes::from(hello)).await;

    let name = tokio::select! {
        r = reader.next_line() => r,
        _ = shutdown.changed() => Ok(None),
    };
    let name = match name {
        Ok(Some(n)) => n,
        Ok(None) => {
            info!(session = %session, "gone before login");
            drop(reader);
            return finish(write_tx, writer).await;
        }
        Err(e) => {
            warn!(session = %session, err = %format!("{e:#}"), "read failed before login");
            drop(reader);
            let _ = finish(write_tx, writer).await;
            return Err(e);
        }
    };

    let player = match ctx.registry.login(session, &name) {
        Ok(p) => p,
        Err(e) => {
            info!(session = %session, nick = %name, err = %e, "login refused");
            let _ = write_tx.send(Bytes::from(format!("{e}\r\n"))).await;
            drop(reader);
            return finish(write_tx, writer).await;
        }
    };
    let nickname = player.nickname.clone();
    info!(
        session = %session,
        nick = %nickname,
        online = ctx.registry.online().len(),
        "logged in"
    );

    let (outbox, inbox) = Outbox::new();
    let join = Event {
        session,
        kind: EventKind::Join { player, outbox },
    };
    if ctx.events.send(join).await.is_err() {
        warn!(session = %session, "arbiter gone; dropping session");
        ctx.registry.release(session, &nickname);
        drop(reader);
        return finish(write_tx, writer).await;
    }

    let mut disconnect = inbox.disconnect.clone();
    let render = tokio::spawn(render_loop(
        inbox,
        size_rx,
        write_tx.clone(),
        shutdown.clone(),
    ));

    let res = read_loop(
        &mut reader,
        session,
        &ctx.events,
        &mut disconnect,
        &mut shutdown,
    )
    .await;

    let _ = render.await;
    drop(reader);
    let _ = finish(write_tx, writer).await;
    info!(session = %session, nick = %nickname, "disconnected");
    res
}

// Every other write_tx clone must be gone, or the writer never sees the channel close.
async fn finish(
    write_tx: mpsc::Sender<Bytes>,
    writer: tokio::task::JoinHandle<()>,
) -> anyhow::Result<()> {
    drop(write_tx);
    let _ = writer.await;
    Ok(())
}

// Forward commands until quit, EOF, error, or the arbiter closes us. Sends exactly one
// quit unless the arbiter already closed the session.
async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
    session: SessionId,
    events: &mpsc::Sender<Event>,
    disconnect: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let res = loop {
        if *disconnect.borrow() {
            return Ok(());
        }
        let line = tokio::select! {
            r = reader.next_line() => r,
            r = disconnect.changed() => {
                if r.is_err() || *disconnect.borrow() {
                    return Ok(());
                }
                continue;
            }
            _ = shutdown.changed() => return Ok(()),
        };
        let line = match line {
            Ok(Some(l)) => l,
            Ok(None) => break Ok(()),
            Err(e) => {
                warn!(session = %session, err = %format!("{e:#}"), "transport error");
                break Err(e);
            }
        };
        let Some(cmd) = Command::parse(&line) else {
            continue;
        };
        debug!(session = %session, cmd = cmd.as_str(), "command");
        if events.send(Event::command(session, cmd)).await.is_err() {
            return Ok(());
        }
        if cmd == Command::Quit {
            return Ok(());
        }
    };
    let _ = events.send(Event::command(session, Command::Quit)).await;
    res
}

async fn render_loop(
    inbox: Inbox,
    mut size: watch::Receiver<WindowSize>,
    write_tx: mpsc::Sender<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Inbox {
        mut replies,
        mut disconnect,
    } = inbox;
    let ws = *size.borrow_and_update();
    let mut screen = Screen::new(ws.width, ws.height);
    let mut last: Option<Viewport> = None;
    let mut size_open = true;

    loop {
        tokio::select! {
            biased;
            r = replies.changed() => {
                if r.is_err() {
                    break;
                }
                last = replies.borrow_and_update().clone();
            }
            r = size.changed(), if size_open => {
                if r.is_err() {
                    size_open = false;
                    continue;
                }
                let ws = *size.borrow_and_update();
                screen.resize(ws.width, ws.height);
            }
            r = disconnect.changed() => {
                if r.is_err() || *disconnect.borrow() {
                    break;
                }
                continue;
            }
            _ = shutdown.changed() => break,
        }

        let Some(v) = &last else {
            continue;
        };
        let out = screen.render(v);
        if !out.is_empty() && write_tx.send(Bytes::from(out)).await.is_err() {
            break;
        }
    }

    // A reply delivered just before the close is still worth painting.
    if replies.has_changed().unwrap_or(false) {
        let pending = replies.borrow_and_update().clone();
        if let Some(v) = pending {
            let _ = write_tx.send(Bytes::from(screen.render(&v))).await;
        }
    }
    let _ = write_tx.send(Bytes::from(screen.goodbye())).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::DuplexStream;

    use super::*;
    use crate::arbiter::{Arbiter, EVENT_QUEUE_CAP};
    use crate::player::PlayerStore;
    use crate::viewport::Composer;
    use crate::world::Location;
    use crate::world::tests::city;

    struct Server {
        ctx: SessionCtx,
        quit: watch::Sender<bool>,
        arbiter: tokio::task::JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    fn server() -> Server {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new(
            PlayerStore::new(dir.path()),
            Location::new("City", "Inn", "1"),
        ));
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAP);
        let (quit, quit_rx) = watch::channel(false);
        let arb = Arbiter::new(Arc::new(city()), registry.clone(), Composer::default());
        let arbiter = tokio::spawn(arb.run(rx, quit_rx));
        Server {
            ctx: SessionCtx {
                registry,
                events: tx,
            },
            quit,
            arbiter,
            _dir: dir,
        }
    }

    fn connect(s: &Server) -> (DuplexStream, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let (client, srv) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(handle_conn(
            srv,
            "test".to_string(),
            s.ctx.clone(),
            s.quit.subscribe(),
        ));
        (client, task)
    }

    // Read until `needle` shows up in the accumulated output.
    async fn read_until(c: &mut DuplexStream, acc: &mut Vec<u8>, needle: &str) {
        let fut = async {
            let mut buf = [0u8; 4096];
            while !String::from_utf8_lossy(acc).contains(needle) {
                let n = c.read(&mut buf).await.unwrap();
                assert!(n > 0, "eof while waiting for {needle:?}");
                acc.extend_from_slice(&buf[..n]);
            }
        };
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"));
    }

    async fn read_to_end(c: &mut DuplexStream, acc: &mut Vec<u8>) {
        tokio::time::timeout(Duration::from_secs(5), c.read_to_end(acc))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn session_id_display_is_short_hex() {
        let sid = SessionId(0x1_0000_0000_0000_0002);
        assert_eq!(sid.to_string(), "0000000000000003");
        assert_ne!(new_session_id(), new_session_id());
    }

    #[tokio::test]
    async fn login_look_and_quit() {
        let s = server();
        let (mut c, task) = connect(&s);
        let mut out = Vec::new();

        read_until(&mut c, &mut out, "name: ").await;
        assert_eq!(&out[..3], &request_naws());
        c.write_all(b"Alice\r\n").await.unwrap();
        read_until(&mut c, &mut out, "The Inn").await;
        assert!(s.ctx.registry.is_online("Alice"));

        c.write_all(b"xyzzy\r\n").await.unwrap();
        read_until(&mut c, &mut out, "Huh?").await;

        c.write_all(b"quit\r\n").await.unwrap();
        read_to_end(&mut c, &mut out).await;
        task.await.unwrap().unwrap();
        assert!(!s.ctx.registry.is_online("Alice"));

        let saved = s.ctx.registry.store().load("Alice").unwrap().unwrap();
        assert_eq!(saved.location(), Location::new("City", "Inn", "1"));
    }

    #[tokio::test]
    async fn invalid_nickname_closes_with_message() {
        let s = server();
        let (mut c, task) = connect(&s);
        let mut out = Vec::new();
        read_until(&mut c, &mut out, "name: ").await;
        c.write_all(b"not valid!\n").await.unwrap();
        read_to_end(&mut c, &mut out).await;
        assert!(String::from_utf8_lossy(&out).contains("invalid nickname"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn duplicate_nickname_is_rejected() {
        let s = server();
        let (mut a, _ta) = connect(&s);
        let mut out_a = Vec::new();
        read_until(&mut a, &mut out_a, "name: ").await;
        a.write_all(b"Alice\n").await.unwrap();
        read_until(&mut a, &mut out_a, "The Inn").await;

        let (mut b, tb) = connect(&s);
        let mut out_b = Vec::new();
        read_until(&mut b, &mut out_b, "name: ").await;
        b.write_all(b"alice\n").await.unwrap();
        read_to_end(&mut b, &mut out_b).await;
        assert!(String::from_utf8_lossy(&out_b).contains("nickname already in use"));
        tb.await.unwrap().unwrap();
        assert!(s.ctx.registry.is_online("Alice"));
    }

    #[tokio::test]
    async fn eof_counts_as_quit() {
        let s = server();
        let (mut c, task) = connect(&s);
        let mut out = Vec::new();
        read_until(&mut c, &mut out, "name: ").await;
        c.write_all(b"Bob\r\ne\r\n").await.unwrap();
        read_until(&mut c, &mut out, "The Inn").await;
        drop(c);
        task.await.unwrap().unwrap();
        assert!(!s.ctx.registry.is_online("Bob"));
    }

    #[tokio::test]
    async fn naws_resize_below_minimum_shows_notice() {
        let s = server();
        let (mut c, _task) = connect(&s);
        let mut out = Vec::new();
        read_until(&mut c, &mut out, "name: ").await;
        c.write_all(b"Carol\r\n").await.unwrap();
        read_until(&mut c, &mut out, "The Inn").await;
        // IAC SB NAWS 0 20 0 10 IAC SE
        c.write_all(&[255, 250, 31, 0, 20, 0, 10, 255, 240])
            .await
            .unwrap();
        read_until(&mut c, &mut out, "too small").await;
    }

    #[tokio::test]
    async fn huge_window_report_keeps_rendering() {
        let s = server();
        let (mut c, _task) = connect(&s);
        let mut out = Vec::new();
        read_until(&mut c, &mut out, "name: ").await;
        c.write_all(b"Eve\r\n").await.unwrap();
        read_until(&mut c, &mut out, "The Inn").await;
        // IAC SB NAWS 0xfefe 0xfefe IAC SE
        c.write_all(&[255, 250, 31, 254, 254, 254, 254, 255, 240])
            .await
            .unwrap();
        c.write_all(b"xyzzy\r\n").await.unwrap();
        read_until(&mut c, &mut out, "Huh?").await;
        assert!(s.ctx.registry.is_online("Eve"));
    }

    #[tokio::test]
    async fn overlong_line_ends_session_and_saves() {
        let s = server();
        let (mut c, task) = connect(&s);
        let mut out = Vec::new();
        read_until(&mut c, &mut out, "name: ").await;
        c.write_all(b"Frank\r\n").await.unwrap();
        read_until(&mut c, &mut out, "The Inn").await;

        c.write_all(&[b'a'; 9000]).await.unwrap();
        read_to_end(&mut c, &mut out).await;
        assert!(task.await.unwrap().is_err());
        assert!(!s.ctx.registry.is_online("Frank"));
        let saved = s.ctx.registry.store().load("Frank").unwrap().unwrap();
        assert_eq!(saved.location(), Location::new("City", "Inn", "1"));
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_and_saves() {
        let s = server();
        let (mut c, task) = connect(&s);
        let mut out = Vec::new();
        read_until(&mut c, &mut out, "name: ").await;
        c.write_all(b"Dave\r\n").await.unwrap();
        read_until(&mut c, &mut out, "The Inn").await;

        s.quit.send_replace(true);
        read_to_end(&mut c, &mut out).await;
        task.await.unwrap().unwrap();
        s.arbiter.await.unwrap();
        assert!(s.ctx.registry.store().load("Dave").unwrap().is_some());
    }
}
