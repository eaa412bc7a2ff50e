//! Moves bytes between local stdio-like streams and an open data channel.
//!
//! Fill reads the local source in bounded chunks and writes them to the
//! channel, holding off while the channel's buffered amount is above the
//! low-water mark. Drain copies whatever arrives from the peer into the local
//! sink. Each side ends its Fill with an end-of-stream marker so the peer's
//! Drain can finish. Teardown waits for the send buffer to empty before the
//! channel is closed, and closes the connection last.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 32 << 10;
pub const DEFAULT_LOW_WATER_MARK: usize = 512 << 10;
pub const DEFAULT_DRAIN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("channel write failed: {0}")]
    Write(String),
    #[error("short write: {written} of {expected} bytes accepted")]
    ShortWrite { expected: usize, written: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct PumpConfig {
    pub chunk_size: usize,
    pub low_water_mark: usize,
    pub drain_poll: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            drain_poll: DEFAULT_DRAIN_POLL,
        }
    }
}

/// One unit received from the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    End,
}

/// Send half of an open data channel.
#[async_trait]
pub trait PipeChannel: Send + Sync {
    /// Queues `chunk` and reports how many bytes were accepted.
    async fn write(&self, chunk: Bytes) -> Result<usize, PumpError>;

    /// Tells the peer that no more data follows.
    async fn finish(&self) -> Result<(), PumpError>;

    async fn buffered_amount(&self) -> usize;

    async fn close_channel(&self) -> Result<(), PumpError>;

    async fn close_connection(&self) -> Result<(), PumpError>;
}

#[derive(Debug, Default)]
pub struct PumpReport {
    pub sent: u64,
    pub received: u64,
    pub fill_error: Option<PumpError>,
    pub drain_error: Option<PumpError>,
}

pub struct Pipe<C> {
    channel: C,
    inbound: mpsc::UnboundedReceiver<Frame>,
    low_water: Arc<Notify>,
    config: PumpConfig,
}

impl<C: PipeChannel> Pipe<C> {
    /// `low_water` must be notified whenever the channel's buffered amount
    /// falls to or below `config.low_water_mark`.
    pub fn new(
        channel: C,
        inbound: mpsc::UnboundedReceiver<Frame>,
        low_water: Arc<Notify>,
        config: PumpConfig,
    ) -> Self {
        Self {
            channel,
            inbound,
            low_water,
            config,
        }
    }

    /// Runs both directions to completion, then tears the channel down.
    ///
    /// A failure in one direction is logged and recorded in the report; the
    /// other direction keeps going. Only a teardown failure is returned as an
    /// error.
    pub async fn run<R, W>(mut self, source: &mut R, sink: &mut W) -> Result<PumpReport, PumpError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let (fill, drain) = tokio::join!(
            fill(&self.channel, &self.low_water, &self.config, source),
            drain(&mut self.inbound, sink),
        );

        let mut report = PumpReport::default();
        match fill {
            Ok(sent) => report.sent = sent,
            Err((sent, err)) => {
                warn!(target = "wormhole::pump", error = %err, sent, "fill stopped");
                report.sent = sent;
                report.fill_error = Some(err);
            }
        }
        match drain {
            Ok(received) => report.received = received,
            Err((received, err)) => {
                warn!(target = "wormhole::pump", error = %err, received, "drain stopped");
                report.received = received;
                report.drain_error = Some(err);
            }
        }
        debug!(
            target = "wormhole::pump",
            sent = report.sent,
            received = report.received,
            "both directions finished"
        );

        self.flush().await;
        self.channel.close_channel().await?;
        self.channel.close_connection().await?;
        Ok(report)
    }

    async fn flush(&self) {
        loop {
            let buffered = self.channel.buffered_amount().await;
            if buffered == 0 {
                return;
            }
            trace!(target = "wormhole::pump", buffered, "waiting for send buffer to drain");
            tokio::time::sleep(self.config.drain_poll).await;
        }
    }
}

async fn wait_for_low_water<C: PipeChannel>(channel: &C, low_water: &Notify, mark: usize) {
    loop {
        let notified = low_water.notified();
        tokio::pin!(notified);
        // Register before checking so a crossing between the check and the
        // await is not lost.
        notified.as_mut().enable();
        let buffered = channel.buffered_amount().await;
        if buffered <= mark {
            return;
        }
        trace!(target = "wormhole::pump", buffered, mark, "above low-water mark");
        notified.await;
    }
}

async fn fill<C, R>(
    channel: &C,
    low_water: &Notify,
    config: &PumpConfig,
    source: &mut R,
) -> Result<u64, (u64, PumpError)>
where
    C: PipeChannel,
    R: AsyncRead + Unpin + Send,
{
    let mut sent = 0u64;
    let result = fill_chunks(channel, low_water, config, source, &mut sent).await;
    // The peer's Drain only finishes on the marker, so send it even when this
    // direction failed part way.
    let finished = channel.finish().await;
    match (result, finished) {
        (Ok(()), Ok(())) => Ok(sent),
        (Err(err), _) | (Ok(()), Err(err)) => Err((sent, err)),
    }
}

async fn fill_chunks<C, R>(
    channel: &C,
    low_water: &Notify,
    config: &PumpConfig,
    source: &mut R,
    sent: &mut u64,
) -> Result<(), PumpError>
where
    C: PipeChannel,
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; config.chunk_size];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        wait_for_low_water(channel, low_water, config.low_water_mark).await;
        let written = channel.write(Bytes::copy_from_slice(&buf[..n])).await?;
        if written != n {
            return Err(PumpError::ShortWrite {
                expected: n,
                written,
            });
        }
        *sent += n as u64;
    }
}

async fn drain<W>(
    inbound: &mut mpsc::UnboundedReceiver<Frame>,
    sink: &mut W,
) -> Result<u64, (u64, PumpError)>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut received = 0u64;
    while let Some(frame) = inbound.recv().await {
        match frame {
            Frame::Data(bytes) => {
                if let Err(err) = sink.write_all(&bytes).await {
                    return Err((received, err.into()));
                }
                received += bytes.len() as u64;
            }
            Frame::End => break,
        }
    }
    sink.flush().await.map_err(|err| (received, err.into()))?;
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tokio::time::timeout;

    /// In-memory stand-in for one end of a data channel. Writes sit in the
    /// buffered amount until the link task forwards them to the peer.
    struct MemoryChannel {
        buffered: Arc<AtomicUsize>,
        wire: mpsc::UnboundedSender<Frame>,
        probe: Probe,
    }

    #[derive(Clone, Default)]
    struct Probe {
        max_buffered_at_write: Arc<AtomicUsize>,
        writes: Arc<AtomicUsize>,
        closes: Arc<Mutex<Vec<(&'static str, usize)>>>,
    }

    #[async_trait]
    impl PipeChannel for MemoryChannel {
        async fn write(&self, chunk: Bytes) -> Result<usize, PumpError> {
            let before = self.buffered.fetch_add(chunk.len(), Ordering::SeqCst);
            self.probe
                .max_buffered_at_write
                .fetch_max(before, Ordering::SeqCst);
            self.probe.writes.fetch_add(1, Ordering::SeqCst);
            let len = chunk.len();
            self.wire
                .send(Frame::Data(chunk))
                .map_err(|_| PumpError::Write("peer gone".into()))?;
            Ok(len)
        }

        async fn finish(&self) -> Result<(), PumpError> {
            self.wire.send(Frame::End).map_err(|_| PumpError::Write("peer gone".into()))
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn close_channel(&self) -> Result<(), PumpError> {
            self.probe
                .closes
                .lock()
                .push(("channel", self.buffered.load(Ordering::SeqCst)));
            Ok(())
        }

        async fn close_connection(&self) -> Result<(), PumpError> {
            self.probe
                .closes
                .lock()
                .push(("connection", self.buffered.load(Ordering::SeqCst)));
            Ok(())
        }
    }

    /// Forwards frames to the peer, releasing buffered bytes as it goes and
    /// signalling when the amount drops across the mark.
    fn link(
        buffered: Arc<AtomicUsize>,
        mark: usize,
        low_water: Arc<Notify>,
        mut wire: mpsc::UnboundedReceiver<Frame>,
        peer: mpsc::UnboundedSender<Frame>,
    ) {
        tokio::spawn(async move {
            while let Some(frame) = wire.recv().await {
                tokio::task::yield_now().await;
                if let Frame::Data(bytes) = &frame {
                    let before = buffered.fetch_sub(bytes.len(), Ordering::SeqCst);
                    if before > mark && before - bytes.len() <= mark {
                        low_water.notify_one();
                    }
                }
                let _ = peer.send(frame);
            }
        });
    }

    fn endpoint(
        config: &PumpConfig,
        peer: mpsc::UnboundedSender<Frame>,
        inbound: mpsc::UnboundedReceiver<Frame>,
    ) -> (Pipe<MemoryChannel>, Probe) {
        let buffered = Arc::new(AtomicUsize::new(0));
        let low_water = Arc::new(Notify::new());
        let (wire, wire_rx) = mpsc::unbounded_channel();
        link(
            buffered.clone(),
            config.low_water_mark,
            low_water.clone(),
            wire_rx,
            peer,
        );
        let probe = Probe::default();
        let channel = MemoryChannel {
            buffered,
            wire,
            probe: probe.clone(),
        };
        (Pipe::new(channel, inbound, low_water, config.clone()), probe)
    }

    fn test_config() -> PumpConfig {
        PumpConfig {
            drain_poll: Duration::from_millis(1),
            ..PumpConfig::default()
        }
    }

    #[tokio::test]
    async fn ten_mebibytes_arrive_intact_without_overrunning_the_buffer() {
        let config = test_config();
        let (to_a, inbound_a) = mpsc::unbounded_channel();
        let (to_b, inbound_b) = mpsc::unbounded_channel();
        let (a, probe_a) = endpoint(&config, to_b, inbound_a);
        let (b, _probe_b) = endpoint(&config, to_a, inbound_b);

        let payload: Vec<u8> = (0..10 * 1024 * 1024u32)
            .map(|i| (i.wrapping_mul(31) % 251) as u8)
            .collect();
        let mut source_a: &[u8] = &payload;
        let mut source_b: &[u8] = &[];
        let mut sink_a = Vec::new();
        let mut sink_b = Vec::new();

        let (report_a, report_b) = timeout(Duration::from_secs(30), async {
            tokio::join!(
                a.run(&mut source_a, &mut sink_a),
                b.run(&mut source_b, &mut sink_b)
            )
        })
        .await
        .expect("pumps finished");

        let report_a = report_a.expect("teardown a");
        let report_b = report_b.expect("teardown b");
        assert_eq!(report_a.sent, payload.len() as u64);
        assert_eq!(report_b.received, payload.len() as u64);
        assert!(report_a.fill_error.is_none());
        assert!(report_b.drain_error.is_none());
        assert!(sink_a.is_empty());
        assert!(sink_b == payload, "payload corrupted in transit");
        assert!(
            probe_a.max_buffered_at_write.load(Ordering::SeqCst) <= config.low_water_mark,
            "wrote while above the low-water mark"
        );
        assert_eq!(
            probe_a.writes.load(Ordering::SeqCst),
            payload.len().div_ceil(config.chunk_size)
        );
    }

    /// Channel whose buffered amount only changes when the test says so.
    struct StuckChannel {
        buffered: Arc<AtomicUsize>,
        probe: Probe,
    }

    #[async_trait]
    impl PipeChannel for StuckChannel {
        async fn write(&self, chunk: Bytes) -> Result<usize, PumpError> {
            self.probe.writes.fetch_add(1, Ordering::SeqCst);
            Ok(chunk.len())
        }

        async fn finish(&self) -> Result<(), PumpError> {
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn close_channel(&self) -> Result<(), PumpError> {
            self.probe
                .closes
                .lock()
                .push(("channel", self.buffered.load(Ordering::SeqCst)));
            Ok(())
        }

        async fn close_connection(&self) -> Result<(), PumpError> {
            self.probe.closes.lock().push(("connection", 0));
            Ok(())
        }
    }

    #[tokio::test]
    async fn fill_waits_for_the_low_water_notification() {
        let config = test_config();
        let buffered = Arc::new(AtomicUsize::new(config.low_water_mark + 1));
        let low_water = Arc::new(Notify::new());
        let probe = Probe::default();
        let channel = StuckChannel {
            buffered: buffered.clone(),
            probe: probe.clone(),
        };

        let task = tokio::spawn({
            let low_water = low_water.clone();
            let config = config.clone();
            async move {
                let mut source: &[u8] = b"hello";
                fill(&channel, &low_water, &config, &mut source).await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.writes.load(Ordering::SeqCst), 0);

        // Dropping below the mark without a notification is not enough.
        buffered.store(0, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(probe.writes.load(Ordering::SeqCst), 0);

        low_water.notify_one();
        let sent = timeout(Duration::from_secs(5), task)
            .await
            .expect("fill finished")
            .expect("join");
        assert_eq!(sent.expect("fill ok"), 5);
        assert_eq!(probe.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn teardown_waits_for_empty_buffer_then_closes_channel_before_connection() {
        let config = test_config();
        let buffered = Arc::new(AtomicUsize::new(3));
        let probe = Probe::default();
        let channel = StuckChannel {
            buffered: buffered.clone(),
            probe: probe.clone(),
        };
        let (peer, inbound) = mpsc::unbounded_channel();
        peer.send(Frame::Data(Bytes::from_static(b"hi"))).expect("send");
        peer.send(Frame::End).expect("send");
        let pipe = Pipe::new(channel, inbound, Arc::new(Notify::new()), config);

        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                buffered.fetch_sub(1, Ordering::SeqCst);
            }
        });

        let mut source: &[u8] = &[];
        let mut sink = Vec::new();
        let report = timeout(Duration::from_secs(5), pipe.run(&mut source, &mut sink))
            .await
            .expect("pump finished")
            .expect("teardown");
        assert_eq!(report.received, 2);
        assert_eq!(sink, b"hi");
        assert_eq!(
            *probe.closes.lock(),
            vec![("channel", 0), ("connection", 0)]
        );
    }

    struct ShortChannel;

    #[async_trait]
    impl PipeChannel for ShortChannel {
        async fn write(&self, chunk: Bytes) -> Result<usize, PumpError> {
            Ok(chunk.len() / 2)
        }

        async fn finish(&self) -> Result<(), PumpError> {
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            0
        }

        async fn close_channel(&self) -> Result<(), PumpError> {
            Ok(())
        }

        async fn close_connection(&self) -> Result<(), PumpError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn short_write_stops_fill_but_not_drain() {
        let (peer, inbound) = mpsc::unbounded_channel();
        peer.send(Frame::Data(Bytes::from_static(b"still arriving")))
            .expect("send");
        drop(peer);
        let pipe = Pipe::new(ShortChannel, inbound, Arc::new(Notify::new()), test_config());

        let mut source: &[u8] = b"outbound bytes";
        let mut sink = Vec::new();
        let report = pipe.run(&mut source, &mut sink).await.expect("teardown");
        assert!(matches!(
            report.fill_error,
            Some(PumpError::ShortWrite { expected: 14, written: 7 })
        ));
        assert_eq!(report.sent, 0);
        assert_eq!(sink, b"still arriving");
    }
}
