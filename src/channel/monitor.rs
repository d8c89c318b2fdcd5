//! Channel subscriber client.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::record::NdArrayRecord;
use super::wire::{decode_message, read_body, write_message, Message};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Subscription to one channel. Records are delivered to a callback on a reader thread.
pub struct ChannelMonitor {
    channel: String,
    stream: TcpStream,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<u64>>,
}

impl ChannelMonitor {
    /// Connect to a channel server and subscribe to `channel`.
    pub fn connect(addr: &str, channel: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)
            .with_context(|| format!("failed to connect to channel server {}", addr))?;
        stream.set_nodelay(true)?;
        write_message(
            &mut stream,
            &Message::Subscribe {
                channel: channel.to_string(),
            },
        )?;
        log::info!("subscribed to channel '{}' on {}", channel, addr);
        Ok(Self {
            channel: channel.to_string(),
            stream,
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
        })
    }

    /// Like `connect`, retrying until the server accepts or `timeout` elapses.
    pub fn connect_with_retry(addr: &str, channel: &str, timeout: Duration) -> Result<Self> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match Self::connect(addr, channel) {
                Ok(monitor) => return Ok(monitor),
                Err(err) if std::time::Instant::now() >= deadline => return Err(err),
                Err(err) => {
                    log::debug!("channel server not reachable yet: {}", err);
                    std::thread::sleep(CONNECT_RETRY_INTERVAL);
                }
            }
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Start delivering records to `callback` on a dedicated thread.
    pub fn start<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(NdArrayRecord) + Send + 'static,
    {
        if self.reader.is_some() {
            return Err(anyhow!("monitor on '{}' already started", self.channel));
        }
        let mut stream = self.stream.try_clone()?;
        let running = self.running.clone();
        let channel = self.channel.clone();
        running.store(true, Ordering::SeqCst);
        let reader = std::thread::Builder::new()
            .name(format!("monitor-{}", channel))
            .spawn(move || {
                let mut delivered = 0u64;
                while running.load(Ordering::SeqCst) {
                    let body = match read_body(&mut stream) {
                        Ok(Some(body)) => body,
                        Ok(None) => {
                            log::info!("channel '{}' closed by server", channel);
                            break;
                        }
                        Err(err) => {
                            if running.load(Ordering::SeqCst) {
                                log::warn!("channel '{}' read failed: {}", channel, err);
                            }
                            break;
                        }
                    };
                    // The body was read in full, so the stream is still aligned.
                    match decode_message(&body) {
                        Ok(Message::Record { record, .. }) => {
                            delivered += 1;
                            callback(record);
                        }
                        Ok(Message::Error { message }) => {
                            log::warn!("channel '{}' error from server: {}", channel, message);
                        }
                        Ok(other) => {
                            log::warn!("channel '{}' unexpected message {:?}", channel, other);
                        }
                        Err(err) => {
                            log::warn!(
                                "channel '{}' skipped a malformed message of {} bytes: {:#}",
                                channel,
                                body.len(),
                                err
                            );
                        }
                    }
                }
                delivered
            })?;
        self.reader = Some(reader);
        Ok(())
    }

    /// Close the subscription and join the reader. Returns the number of records delivered.
    pub fn stop(&mut self) -> Result<u64> {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        match self.reader.take() {
            Some(reader) => reader
                .join()
                .map_err(|_| anyhow!("monitor thread for '{}' panicked", self.channel)),
            None => Ok(0),
        }
    }
}

impl Drop for ChannelMonitor {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
