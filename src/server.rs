//! Connection manager
//!
//! Owns the shared frame buffer, the listening socket and the live session
//! table. Each accepted connection gets its own task that alternates between
//! socket reads and queued outbound events.

use crate::config::Config;
use crate::error::{SessionEnd, StartupError};
use crate::protocol::{Event, Handshake};
use crate::session::{Dispatched, Session, SessionClock, SessionId};
use crate::shm::{Geometry, SharedFrameBuffer};
use crate::state::DisplayState;
use crate::window::WindowId;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What the server keeps about a live session outside its task.
struct SessionHandle {
    clock: SessionClock,
    events: mpsc::Sender<Bytes>,
}

struct Shared {
    frame_buffer: SharedFrameBuffer,
    display: Mutex<DisplayState>,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    next_session: AtomicU32,
    event_queue: usize,
}

impl Shared {
    fn handshake(&self) -> Handshake {
        let g = self.frame_buffer.geometry();
        Handshake {
            width: g.width,
            height: g.height,
            bits_per_pixel: g.bits_per_pixel,
            shm_handle: self.frame_buffer.handle(),
        }
    }

    fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    async fn end_session(&self, id: SessionId, end: SessionEnd) {
        self.sessions.lock().await.remove(&id);
        let gone = self.display.lock().await.destroy_all_for_session(id);
        match end {
            SessionEnd::Closed => {
                info!(session = %id, windows = gone.len(), "session closed")
            }
            SessionEnd::Shutdown => {
                info!(session = %id, windows = gone.len(), "session ended by shutdown")
            }
            SessionEnd::Protocol(e) => {
                warn!(session = %id, windows = gone.len(), "session dropped: {}", e)
            }
        }
    }
}

/// Cheap clonable access to a running server, for the presenter and for
/// anything that injects input.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub fn frame_buffer(&self) -> &SharedFrameBuffer {
        &self.shared.frame_buffer
    }

    pub async fn display(&self) -> MutexGuard<'_, DisplayState> {
        self.shared.display.lock().await
    }

    pub async fn session_count(&self) -> usize {
        self.shared.sessions.lock().await.len()
    }

    /// Queues a pointer event for every live session, each stamped with that
    /// session's own connect-relative time. Sessions that are gone or whose
    /// queue is full are skipped. Returns how many sessions it was queued for.
    pub async fn broadcast_pointer_event(&self, x: i32, y: i32, buttons: u32) -> usize {
        let sessions = self.shared.sessions.lock().await;
        let mut delivered = 0;
        for (id, handle) in sessions.iter() {
            let event = Event::Pointer {
                window: WindowId::NONE,
                x,
                y,
                state: buttons,
                time_ms: handle.clock.elapsed_ms(),
            };
            match handle.events.try_send(event.to_bytes()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(session = %id, "pointer event skipped: {}", e),
            }
        }
        delivered
    }
}

pub struct Server {
    shared: Arc<Shared>,
    listener: TcpListener,
}

impl Server {
    /// Creates the frame buffer, then binds. Either failure is fatal.
    pub async fn start(config: &Config) -> Result<Self, StartupError> {
        let geometry = Geometry::new(
            config.display.width,
            config.display.height,
            config.display.bits_per_pixel,
        )?;
        let frame_buffer = SharedFrameBuffer::create_with_mode(geometry, config.display.shm_mode)
            .map_err(|source| StartupError::SharedMemory {
                size: geometry.size(),
                source,
            })?;

        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| StartupError::Bind {
                addr: addr.clone(),
                source,
            })?;

        info!(
            "frame buffer {}x{}x{} (shmid {}), listening on {}",
            geometry.width,
            geometry.height,
            geometry.bits_per_pixel,
            frame_buffer.handle(),
            addr
        );

        Ok(Self {
            shared: Arc::new(Shared {
                frame_buffer,
                display: Mutex::new(DisplayState::new()),
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU32::new(1),
                event_queue: config.server.event_queue.max(1),
            }),
            listener,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accepts connections until `shutdown` resolves, then ends every live
    /// session and waits for their tasks. Once the last [`ServerHandle`] is
    /// gone too, the frame buffer segment is released.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(());
        let mut tasks = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(sessions = tasks.len(), "shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = self.shared.next_session_id();
                        info!(session = %id, %peer, "client connected");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(session = %id, "set_nodelay failed: {}", e);
                        }
                        tasks.spawn(handle_client(
                            stream,
                            Arc::clone(&self.shared),
                            id,
                            stop_rx.clone(),
                        ));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = done {
                        warn!("session task failed: {}", e);
                    }
                }
            }
        }

        drop(self.listener);
        // no receivers left just means no sessions
        let _ = stop_tx.send(());
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                warn!("session task failed: {}", e);
            }
        }
        info!("all sessions ended");
    }
}

async fn handle_client<S>(
    stream: S,
    shared: Arc<Shared>,
    id: SessionId,
    mut stop: watch::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut session = Session::new(id);

    let mut hello = BytesMut::new();
    shared.handshake().encode(&mut hello);
    if let Err(e) = writer.write_all(&hello).await {
        warn!(session = %id, "handshake failed: {}", e);
        return;
    }

    let clock = session.activate();
    let (tx, mut rx) = mpsc::channel(shared.event_queue);
    shared
        .sessions
        .lock()
        .await
        .insert(id, SessionHandle { clock, events: tx });
    debug!(session = %id, "session active");

    let end = loop {
        tokio::select! {
            read = reader.read_buf(session.inbound_mut()) => {
                match read {
                    Ok(0) => break session.finish(),
                    Ok(_) => {}
                    Err(e) => {
                        debug!(session = %id, "read failed: {}", e);
                        session.close();
                        break SessionEnd::Closed;
                    }
                }
                if let Err(end) = drain(&mut session, &shared, &mut writer).await {
                    break end;
                }
            }
            _ = stop.changed() => {
                session.close();
                break SessionEnd::Shutdown;
            }
            Some(frame) = rx.recv() => {
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(session = %id, "write failed: {}", e);
                    session.close();
                    break SessionEnd::Closed;
                }
            }
        }
    };

    shared.end_session(id, end).await;
}

/// Dispatches every complete command currently buffered.
async fn drain<W>(session: &mut Session, shared: &Shared, writer: &mut W) -> Result<(), SessionEnd>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let step = {
            let mut display = shared.display.lock().await;
            session.dispatch_one(&mut display)?
        };
        match step {
            Dispatched::Pending => return Ok(()),
            Dispatched::Applied { reply: None } => {}
            Dispatched::Applied { reply: Some(event) } => {
                if let Err(e) = writer.write_all(&event.to_bytes()).await {
                    debug!(session = %session.id(), "write failed: {}", e);
                    session.close();
                    return Err(SessionEnd::Closed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::error::CommandError;
    use crate::property::PropertyMode;
    use crate::protocol::{opcodes, Request, MAX_PROPERTY_LEN, MAX_REGION_RECTS};
    use crate::shm::FrameBufferAttachment;
    use crate::window::{Rect, Region};
    use bytes::BufMut;
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct TestServer {
        addr: SocketAddr,
        handle: ServerHandle,
        _stop: oneshot::Sender<()>,
    }

    async fn start_test_server() -> TestServer {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = 0;
        let server = Server::start(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(server.run(async move {
            let _ = stopped.await;
        }));
        TestServer {
            addr,
            handle,
            _stop: stop,
        }
    }

    async fn wait_for_sessions(handle: &ServerHandle, n: usize) {
        for _ in 0..200 {
            if handle.session_count().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} sessions, have {}", n, handle.session_count().await);
    }

    async fn next_pointer(client: &mut Client) -> Event {
        let ev = tokio::time::timeout(Duration::from_secs(2), client.next_event())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(ev, Event::Pointer { .. }), "got {:?}", ev);
        ev
    }

    /// The server must have dropped the connection: EOF or a reset.
    async fn assert_hung_up(client: &mut Client) {
        let next = tokio::time::timeout(Duration::from_secs(2), client.next_event())
            .await
            .unwrap();
        assert!(!matches!(next, Ok(Some(_))), "still connected: {:?}", next);
    }

    fn command_failed(request: u8, err: CommandError) -> Event {
        Event::CommandFailed {
            request,
            code: err.code(),
            window: err.window(),
        }
    }

    #[tokio::test]
    async fn end_to_end_scenario() {
        let srv = start_test_server().await;

        let mut c1 = Client::connect(srv.addr).await.unwrap();
        let hs = c1.handshake();
        assert_eq!((hs.width, hs.height, hs.bits_per_pixel), (640, 480, 32));
        assert_eq!(hs.shm_handle, srv.handle.frame_buffer().handle());

        let w = c1.create_window(0).await.unwrap();
        assert_eq!(w, WindowId(1));
        c1.add_property(w, 7).await.unwrap();
        c1.set_property(w, 7, PropertyMode::Replace, b"hello").await.unwrap();
        assert_eq!(&c1.get_property(w, 7).await.unwrap()[..], b"hello");

        // zero-copy: pixels the client writes show up in the server's buffer
        let mut fb = c1.attach_frame_buffer().unwrap();
        fb.fill_rect(Rect::new(10, 10, 2, 2), 0x00aa_bbcc).unwrap();
        assert_eq!(srv.handle.frame_buffer().read_pixel(11, 11), Some(0x00aa_bbcc));

        let mut c2 = Client::connect(srv.addr).await.unwrap();
        assert_eq!(c2.handshake().shm_handle, hs.shm_handle);
        wait_for_sessions(&srv.handle, 2).await;

        assert_eq!(srv.handle.broadcast_pointer_event(5, 6, 1).await, 2);
        for client in [&mut c1, &mut c2] {
            match next_pointer(client).await {
                Event::Pointer {
                    window, x, y, state, ..
                } => {
                    assert_eq!(window, WindowId::NONE);
                    assert_eq!((x, y, state), (5, 6, 1));
                }
                _ => unreachable!(),
            }
        }
    }

    #[tokio::test]
    async fn window_ids_unique_across_sessions() {
        let srv = start_test_server().await;
        let mut a = Client::connect(srv.addr).await.unwrap();
        let mut b = Client::connect(srv.addr).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..6 {
            let client = if i % 2 == 0 { &mut a } else { &mut b };
            ids.push(client.create_window(0).await.unwrap());
        }
        assert!(ids.windows(2).all(|p| p[0] < p[1]), "{:?}", ids);
    }

    #[tokio::test]
    async fn malformed_frame_only_kills_sender() {
        let srv = start_test_server().await;
        let mut bad = Client::connect(srv.addr).await.unwrap();
        let mut good = Client::connect(srv.addr).await.unwrap();
        let w = good.create_window(0).await.unwrap();
        wait_for_sessions(&srv.handle, 2).await;

        bad.send_raw(&[0xEE]).await.unwrap();
        let eof = tokio::time::timeout(Duration::from_secs(2), bad.next_event())
            .await
            .unwrap()
            .unwrap();
        assert!(eof.is_none());
        wait_for_sessions(&srv.handle, 1).await;

        good.add_property(w, 1).await.unwrap();
        good.set_property(w, 1, PropertyMode::Append, b"still here").await.unwrap();
        assert_eq!(&good.get_property(w, 1).await.unwrap()[..], b"still here");

        assert_eq!(srv.handle.broadcast_pointer_event(1, 1, 0).await, 1);
        next_pointer(&mut good).await;
    }

    #[tokio::test]
    async fn disconnect_destroys_windows() {
        let srv = start_test_server().await;
        let mut owner = Client::connect(srv.addr).await.unwrap();
        let a = owner.create_window(0).await.unwrap();
        let b = owner.create_window(0).await.unwrap();

        let mut other = Client::connect(srv.addr).await.unwrap();
        other.create_window(0).await.unwrap();
        drop(owner);
        wait_for_sessions(&srv.handle, 1).await;

        for w in [a, b] {
            other.add_property(w, 1).await.unwrap();
            let ev = other.expect_reply().await.unwrap();
            assert_eq!(
                ev,
                Event::CommandFailed {
                    request: opcodes::ADD_PROPERTY,
                    code: CommandError::UnknownWindow(w).code(),
                    window: w,
                }
            );
        }
        assert_eq!(srv.handle.display().await.windows().len(), 1);
    }

    #[tokio::test]
    async fn set_region_on_foreign_window_fails() {
        let srv = start_test_server().await;
        let mut s1 = Client::connect(srv.addr).await.unwrap();
        let mut s2 = Client::connect(srv.addr).await.unwrap();
        let w = s1.create_window(0).await.unwrap();
        let mine = Region::new(vec![Rect::new(0, 0, 100, 100)]);
        s1.set_region(w, mine.clone()).await.unwrap();
        // round trip so the region is applied before we look
        s1.create_window(0).await.unwrap();

        s2.set_region(w, Region::new(vec![Rect::new(1, 2, 3, 4)]))
            .await
            .unwrap();
        let ev = s2.expect_reply().await.unwrap();
        assert_eq!(
            ev,
            Event::CommandFailed {
                request: opcodes::SET_REGION,
                code: CommandError::NotOwner(w).code(),
                window: w,
            }
        );
        assert_eq!(srv.handle.display().await.windows().get(w).unwrap().region, mine);
    }

    #[tokio::test]
    async fn broadcast_times_are_per_session() {
        let srv = start_test_server().await;
        let mut early = Client::connect(srv.addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut late = Client::connect(srv.addr).await.unwrap();
        wait_for_sessions(&srv.handle, 2).await;

        srv.handle.broadcast_pointer_event(0, 0, 0).await;
        let t_early = match next_pointer(&mut early).await {
            Event::Pointer { time_ms, .. } => time_ms,
            _ => unreachable!(),
        };
        let t_late = match next_pointer(&mut late).await {
            Event::Pointer { time_ms, .. } => time_ms,
            _ => unreachable!(),
        };
        assert!(t_early > t_late, "early {} late {}", t_early, t_late);
        assert!(t_early - t_late >= 100);
    }

    #[tokio::test]
    async fn truncated_frame_ends_session() {
        let srv = start_test_server().await;
        let mut c = Client::connect(srv.addr).await.unwrap();
        c.create_window(0).await.unwrap();
        c.send_raw(&[opcodes::SET_PROPERTY, 1, 0]).await.unwrap();
        c.close_write().await.unwrap();
        wait_for_sessions(&srv.handle, 0).await;
        assert!(srv.handle.display().await.windows().is_empty());
    }

    #[tokio::test]
    async fn invalid_fields_only_kill_sender() {
        let srv = start_test_server().await;
        let mut good = Client::connect(srv.addr).await.unwrap();
        let w = good.create_window(0).await.unwrap();
        good.add_property(w, 1).await.unwrap();
        good.set_property(w, 1, PropertyMode::Replace, b"ok").await.unwrap();

        let mut bad_mode = BytesMut::new();
        bad_mode.put_u8(opcodes::SET_PROPERTY);
        bad_mode.put_u32_le(w.0);
        bad_mode.put_u32_le(1);
        bad_mode.put_u8(9);

        let mut too_long = BytesMut::new();
        too_long.put_u8(opcodes::SET_PROPERTY);
        too_long.put_u32_le(w.0);
        too_long.put_u32_le(1);
        too_long.put_u8(PropertyMode::Append.to_wire());
        too_long.put_u32_le(MAX_PROPERTY_LEN + 1);

        let mut too_many_rects = BytesMut::new();
        too_many_rects.put_u8(opcodes::SET_REGION);
        too_many_rects.put_u32_le(w.0);
        too_many_rects.put_u32_le(MAX_REGION_RECTS + 1);

        for frame in [bad_mode, too_long, too_many_rects] {
            let mut bad = Client::connect(srv.addr).await.unwrap();
            wait_for_sessions(&srv.handle, 2).await;
            bad.send_raw(&frame).await.unwrap();
            assert_hung_up(&mut bad).await;
            wait_for_sessions(&srv.handle, 1).await;

            assert_eq!(&good.get_property(w, 1).await.unwrap()[..], b"ok");
        }

        assert_eq!(srv.handle.broadcast_pointer_event(2, 3, 0).await, 1);
        next_pointer(&mut good).await;
    }

    #[tokio::test]
    async fn destroyed_window_cannot_be_reused() {
        let srv = start_test_server().await;
        let mut owner = Client::connect(srv.addr).await.unwrap();
        let mut other = Client::connect(srv.addr).await.unwrap();
        let w = owner.create_window(0).await.unwrap();
        let keep = owner.create_window(0).await.unwrap();
        owner.add_property(w, 5).await.unwrap();

        other.destroy_window(w).await.unwrap();
        assert_eq!(
            other.expect_reply().await.unwrap(),
            command_failed(opcodes::DESTROY_WINDOW, CommandError::NotOwner(w))
        );

        owner.destroy_window(w).await.unwrap();
        owner.add_property(w, 5).await.unwrap();
        assert_eq!(
            owner.expect_reply().await.unwrap(),
            command_failed(opcodes::ADD_PROPERTY, CommandError::UnknownWindow(w))
        );
        owner.destroy_window(w).await.unwrap();
        assert_eq!(
            owner.expect_reply().await.unwrap(),
            command_failed(opcodes::DESTROY_WINDOW, CommandError::UnknownWindow(w))
        );

        let display = srv.handle.display().await;
        assert!(display.windows().get(w).is_err());
        assert!(display.windows().get(keep).is_ok());
        assert!(display.property_keys(w).is_empty());
    }

    #[tokio::test]
    async fn failed_get_property_replies_and_session_survives() {
        let srv = start_test_server().await;
        let mut owner = Client::connect(srv.addr).await.unwrap();
        let mut other = Client::connect(srv.addr).await.unwrap();
        let w = owner.create_window(0).await.unwrap();

        owner.send(&Request::GetProperty { window: w, key: 3 }).await.unwrap();
        assert_eq!(
            owner.expect_reply().await.unwrap(),
            command_failed(
                opcodes::GET_PROPERTY,
                CommandError::UnknownProperty { window: w, key: 3 }
            )
        );

        owner.add_property(w, 3).await.unwrap();
        owner.remove_property(w, 3).await.unwrap();
        assert!(owner.get_property(w, 3).await.is_err());

        other.send(&Request::GetProperty { window: w, key: 3 }).await.unwrap();
        assert_eq!(
            other.expect_reply().await.unwrap(),
            command_failed(opcodes::GET_PROPERTY, CommandError::NotOwner(w))
        );

        assert_eq!(owner.create_window(0).await.unwrap(), WindowId(2));
        assert_eq!(srv.handle.session_count().await, 2);
    }

    #[tokio::test]
    async fn shutdown_ends_sessions_and_releases_segment() {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = 0;
        let server = Server::start(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(server.run(async move {
            let _ = stopped.await;
        }));

        let mut client = Client::connect(addr).await.unwrap();
        client.create_window(0).await.unwrap();
        let geometry = client.geometry().unwrap();
        let shm_handle = client.handshake().shm_handle;

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handle.session_count().await, 0);
        assert!(handle.display().await.windows().is_empty());
        assert_hung_up(&mut client).await;
        assert!(Client::connect(addr).await.is_err());

        drop(handle);
        assert!(FrameBufferAttachment::attach(shm_handle, geometry).is_err());
    }

    #[tokio::test]
    async fn startup_failures() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = Config::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = taken.local_addr().unwrap().port();
        assert!(matches!(
            Server::start(&config).await,
            Err(StartupError::Bind { .. })
        ));

        let mut config = Config::default();
        config.display.bits_per_pixel = 7;
        assert!(matches!(
            Server::start(&config).await,
            Err(StartupError::Geometry(_))
        ));
    }
}
