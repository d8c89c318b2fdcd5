//! TCP channel server.
//!
//! One accept thread plus one writer thread per subscriber. Every subscriber
//! has its own unbounded queue, so a slow subscriber only delays itself.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Sender};

use super::record::NdArrayRecord;
use super::wire::{encode_message, read_message, write_message, Message};
use super::RecordServer;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

type Encoded = Arc<Vec<u8>>;

#[derive(Default)]
struct ChannelState {
    current: Option<Encoded>,
    subscribers: Vec<Sender<Encoded>>,
}

#[derive(Default)]
struct Shared {
    channels: Mutex<HashMap<String, ChannelState>>,
    connections: Mutex<Vec<(TcpStream, JoinHandle<()>)>>,
}

/// Serves named channels to TCP subscribers.
pub struct ChannelServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelServer {
    /// Bind the listener and start accepting subscribers.
    pub fn bind(addr: &str) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind channel server on {}", addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shared = Arc::new(Shared::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let shared_thread = shared.clone();
        let shutdown_thread = shutdown.clone();
        let accept = std::thread::Builder::new()
            .name("channel-accept".into())
            .spawn(move || {
                if let Err(err) = run_accept(listener, shared_thread, shutdown_thread) {
                    log::error!("channel server stopped: {}", err);
                }
            })?;

        log::info!("channel server listening on {}", addr);
        Ok(Self {
            addr,
            shared,
            shutdown,
            accept: Mutex::new(Some(accept)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .channels
            .lock()
            .map(|channels| channels.get(channel).map_or(0, |c| c.subscribers.len()))
            .unwrap_or(0)
    }

    /// Stop accepting, disconnect every subscriber and join all threads. Idempotent.
    pub fn stop(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(join) = self
            .accept
            .lock()
            .map_err(|_| anyhow!("channel server lock poisoned"))?
            .take()
        {
            join.join()
                .map_err(|_| anyhow!("channel accept thread panicked"))?;
        }
        if let Ok(mut channels) = self.shared.channels.lock() {
            channels.clear();
        }
        let connections = match self.shared.connections.lock() {
            Ok(mut connections) => std::mem::take(&mut *connections),
            Err(_) => Vec::new(),
        };
        for (stream, join) in connections {
            let _ = stream.shutdown(Shutdown::Both);
            let _ = join.join();
        }
        log::info!("channel server on {} stopped", self.addr);
        Ok(())
    }

    fn publish(&self, channel: &str, record: NdArrayRecord, create: bool) -> Result<()> {
        let encoded: Encoded = Arc::new(encode_message(&Message::Record {
            channel: channel.to_string(),
            record,
        })?);
        let mut channels = self
            .shared
            .channels
            .lock()
            .map_err(|_| anyhow!("channel server lock poisoned"))?;
        if create {
            let state = channels.entry(channel.to_string()).or_default();
            if state.current.is_some() {
                return Err(anyhow!("channel '{}' already exists", channel));
            }
        }
        let state = channels
            .get_mut(channel)
            .filter(|state| create || state.current.is_some())
            .ok_or_else(|| anyhow!("channel '{}' does not exist", channel))?;
        state.current = Some(encoded.clone());
        state
            .subscribers
            .retain(|subscriber| subscriber.send(encoded.clone()).is_ok());
        Ok(())
    }
}

impl RecordServer for ChannelServer {
    fn add_record(&self, channel: &str, record: NdArrayRecord) -> Result<()> {
        self.publish(channel, record, true)
    }

    fn update(&self, channel: &str, record: NdArrayRecord) -> Result<()> {
        self.publish(channel, record, false)
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("channel server shutdown failed: {}", err);
        }
    }
}

fn run_accept(listener: TcpListener, shared: Arc<Shared>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let control = match stream.try_clone() {
                    Ok(control) => control,
                    Err(err) => {
                        log::warn!("channel subscriber {} rejected: {}", peer, err);
                        continue;
                    }
                };
                let shared_conn = shared.clone();
                let join = std::thread::Builder::new()
                    .name(format!("channel-sub-{}", peer))
                    .spawn(move || {
                        if let Err(err) = serve_subscriber(stream, &shared_conn) {
                            log::warn!("channel subscriber {} dropped: {}", peer, err);
                        }
                    })?;
                if let Ok(mut connections) = shared.connections.lock() {
                    connections.push((control, join));
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn serve_subscriber(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(SUBSCRIBE_TIMEOUT))?;
    let channel = match read_message(&mut stream)? {
        Some(Message::Subscribe { channel }) => channel,
        Some(other) => {
            write_message(
                &mut stream,
                &Message::Error {
                    message: "expected a subscribe message".into(),
                },
            )?;
            return Err(anyhow!("unexpected first message {:?}", other));
        }
        None => return Ok(()),
    };
    stream.set_read_timeout(None)?;

    let (tx, rx) = unbounded::<Encoded>();
    {
        let mut channels = shared
            .channels
            .lock()
            .map_err(|_| anyhow!("channel server lock poisoned"))?;
        let state = channels.entry(channel.clone()).or_default();
        if let Some(current) = &state.current {
            tx.send(current.clone())?;
        }
        state.subscribers.push(tx);
    }
    log::info!(
        "subscriber {} attached to channel '{}'",
        stream.peer_addr()?,
        channel
    );

    for encoded in rx.iter() {
        if let Err(err) = std::io::Write::write_all(&mut stream, encoded.as_slice()) {
            log::debug!("subscriber on '{}' went away: {}", channel, err);
            break;
        }
    }
    Ok(())
}
