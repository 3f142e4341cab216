use crate::config::LinkConfig;
use crate::frame::{Frame, SupervisoryKind, FLAG};
use crate::record_sink::RecordSink;
use crate::ring_buffer::ByteRing;
use crate::send_pipeline::{SendPipeline, StreamWireSocket};
use crate::seq::SeqNum;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// Connection lifecycle of a link session. `Closed` is terminal; a session is
///  never restarted - reconnection, if desired, is the caller's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Established,
    Closed,
}

/// Gate evaluated by the sender task before every transmission.
#[derive(Debug, Clone, Copy)]
struct SendGate {
    handshake_complete: bool,
    peer_ready: bool,
}

impl SendGate {
    const CLOSED: SendGate = SendGate {
        handshake_complete: false,
        peer_ready: false,
    };
    const OPEN: SendGate = SendGate {
        handshake_complete: true,
        peer_ready: true,
    };

    fn open(&self) -> bool {
        self.handshake_complete && self.peer_ready
    }
}

#[derive(Debug)]
enum Outbound {
    Frame(Frame),
    /// verbatim replay of a previously encoded frame (window retransmission)
    Raw(Bytes),
}

struct LinkSessionInner {
    state: LinkState,
    /// sequence the next originated Information frame will carry
    send_seq: SeqNum,
    /// sequence of the last accepted incoming Information frame
    recv_seq: SeqNum,
    /// send sequences currently flagged as lost, awaiting retransmission
    rej_seqs: FxHashSet<SeqNum>,
    /// encoded Information frames by the sequence they were sent under.
    /// Keys are modulo 128, so the window holds at most 128 entries.
    send_window: FxHashMap<SeqNum, Bytes>,
    /// first missing sequence of the most recently detected gap
    pending_reject: Option<SeqNum>,
    /// delimiter bytes buffered in the receive ring but not yet consumed
    flag_count: usize,
    handshake_handle: Option<JoinHandle<()>>,
}

/// The link session: turns the transport's unreliable byte stream into an
///  ordered, loss-aware sequence of typed frames, and drives the sink and the
///  outbound side of the protocol.
///
/// One logical worker per connection: the receiver path runs inside the read
///  loop and never suspends on protocol state, while the suspending sends are
///  owned by dedicated tasks (sender, acknowledgment emitter, reject emitter,
///  handshake probe) that the receiver path signals.
pub struct LinkSession {
    config: Arc<LinkConfig>,
    sink: Arc<dyn RecordSink>,
    inner: Arc<RwLock<LinkSessionInner>>,
    /// receive ring; exclusively owned, no other component touches it
    recv_buf: ByteRing,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    /// taken by `start_with`; a session runs at most once
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    gate_tx: watch::Sender<SendGate>,
    ack_ready: Arc<Notify>,
    rej_ready: Arc<Notify>,
}

impl LinkSession {
    /// The sink reference is explicit and held for the session's lifetime.
    pub fn new(config: Arc<LinkConfig>, sink: Arc<dyn RecordSink>) -> anyhow::Result<LinkSession> {
        config.validate()?;
        let recv_buf = ByteRing::with_capacity(config.recv_buffer_capacity)?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (gate_tx, _) = watch::channel(SendGate::CLOSED);

        Ok(LinkSession {
            config,
            sink,
            inner: Arc::new(RwLock::new(LinkSessionInner {
                state: LinkState::Connecting,
                send_seq: SeqNum::from_raw(1),
                recv_seq: SeqNum::ZERO,
                rej_seqs: FxHashSet::default(),
                send_window: FxHashMap::default(),
                pending_reject: None,
                flag_count: 0,
                handshake_handle: None,
            })),
            recv_buf,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            gate_tx,
            ack_ready: Arc::new(Notify::new()),
            rej_ready: Arc::new(Notify::new()),
        })
    }

    pub async fn state(&self) -> LinkState {
        self.inner.read().await.state
    }

    /// Queue a frame for transmission. Frames leave strictly in submission
    ///  order once the handshake is complete and the peer is ready. An
    ///  Information frame's sequence number is assigned at transmission time;
    ///  whatever sequence the submitted value carries is ignored.
    pub fn submit(&self, frame: Frame) -> anyhow::Result<()> {
        if self.outbound_tx.send(Outbound::Frame(frame)).is_err() {
            bail!("link session is closed");
        }
        Ok(())
    }

    /// Run the session over a duplex byte-stream transport until the transport
    ///  closes. The transport is typically a serial port device opened by the
    ///  host at a fixed baud rate.
    pub async fn start<T>(&self, transport: T) -> anyhow::Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(transport);
        let pipeline = Arc::new(SendPipeline::new(Arc::new(StreamWireSocket::new(writer))));
        self.start_with(reader, pipeline).await
    }

    /// `start` with an externally provided outbound pipeline.
    pub async fn start_with<R>(&self, mut reader: R, pipeline: Arc<SendPipeline>) -> anyhow::Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let Some(outbound_rx) = self.outbound_rx.lock().await.take() else {
            bail!("link session already started");
        };

        info!("starting link session");

        let sender_handle = tokio::spawn(Self::sender_loop(
            self.inner.clone(),
            outbound_rx,
            self.gate_tx.subscribe(),
            pipeline.clone(),
        ));
        let ack_handle = tokio::spawn(Self::ack_loop(
            self.inner.clone(),
            self.ack_ready.clone(),
            self.outbound_tx.clone(),
        ));
        let rej_handle = tokio::spawn(Self::reject_loop(
            self.inner.clone(),
            self.rej_ready.clone(),
            self.outbound_tx.clone(),
        ));
        let handshake_handle = tokio::spawn(Self::handshake_loop(
            self.inner.clone(),
            self.config.handshake_interval,
            pipeline.clone(),
        ));
        self.inner.write().await.handshake_handle = Some(handshake_handle);

        let mut chunk = [0u8; 512];
        let result = loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break Ok(()),
                Ok(n) => self.on_data(&chunk[..n]).await,
                Err(e) => break Err(e.into()),
            }
        };

        info!("transport closed, shutting down link session");
        let mut inner = self.inner.write().await;
        inner.state = LinkState::Closed;
        if let Some(handle) = inner.handshake_handle.take() {
            handle.abort();
        }
        drop(inner);
        // releases every suspended waiter: the sender blocked on the queue or
        //  the gate, and the emitter tasks blocked on their signals
        sender_handle.abort();
        ack_handle.abort();
        rej_handle.abort();

        result
    }

    /// Receiver path: runs per arriving transport chunk. Accumulates into the
    ///  ring and processes every complete frame buffered so far.
    async fn on_data(&self, data: &[u8]) {
        self.recv_buf.write(data).await;

        let mut inner = self.inner.write().await;
        inner.flag_count += data.iter().filter(|&&b| b == FLAG).count();

        while inner.flag_count >= 2 {
            // with two delimiters buffered the scan cannot suspend
            let span_bytes = self.recv_buf.read_until(FLAG, true).await;
            inner.flag_count -= span_bytes.iter().filter(|&&b| b == FLAG).count();

            let correlation_id = Uuid::new_v4();
            let frame_span = span!(Level::TRACE, "frame_received", ?correlation_id);
            let frame = {
                let _entered = frame_span.enter();
                trace!("extracted span of {} bytes", span_bytes.len());
                match Frame::decode(&span_bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("dropping malformed span of {} bytes: {}", span_bytes.len(), e);
                        continue;
                    }
                }
            };
            self.on_frame(&mut inner, frame).instrument(frame_span).await;
        }
    }

    /// Per-frame state transition. Mutates session state, appends to the sink
    ///  and signals the emitter tasks; supervisory replies are never written
    ///  from here - the emitter tasks own the suspending sends.
    async fn on_frame(&self, inner: &mut LinkSessionInner, frame: Frame) {
        match frame {
            Frame::Handshake { seq } => self.on_handshake(inner, seq),
            Frame::Information { seq, payload } => self.on_information(inner, seq, &payload).await,
            Frame::Supervisory { kind, seq } => self.on_supervisory(inner, kind, seq),
        }
    }

    fn on_handshake(&self, inner: &mut LinkSessionInner, seq: SeqNum) {
        if inner.state == LinkState::Connecting && seq == inner.send_seq {
            info!("handshake echo for #{} received, link established", seq);
            inner.state = LinkState::Established;
            if let Some(handle) = inner.handshake_handle.take() {
                handle.abort();
            }
            self.gate_tx.send_replace(SendGate::OPEN);
        } else {
            debug!(
                "ignoring handshake frame #{} (state {:?}, probing with #{})",
                seq, inner.state, inner.send_seq
            );
        }
    }

    async fn on_information(&self, inner: &mut LinkSessionInner, seq: SeqNum, payload: &[u8]) {
        if inner.rej_seqs.remove(&seq) {
            // retransmission of a frame previously flagged as lost: the flag is
            //  healed, the record is not delivered a second time
            debug!("retransmitted frame #{} consumed without re-delivery", seq);
            return;
        }

        if seq == inner.recv_seq.next() {
            trace!("in-order frame #{}, delivering {} byte record", seq, payload.len());
            inner.recv_seq = seq;
            self.sink.append(payload).await;
            self.ack_ready.notify_one();
        } else {
            // one or more frames were lost: adopt the sender's count, flag the
            //  skipped range, and keep the record this frame carries
            let first_missing = inner.recv_seq.next();
            let missing: Vec<SeqNum> = first_missing.walk_to(seq).collect();
            warn!("frame(s) {:?} missing, adopting sender sequence #{}", missing, seq);
            inner.rej_seqs.extend(missing);
            inner.recv_seq = seq;
            self.sink.append(payload).await;

            if self.config.reject_on_gap {
                inner.pending_reject = Some(first_missing);
                self.rej_ready.notify_one();
            }
        }

        // every 32nd record makes the sink durable, bounding loss on abrupt
        //  failure to at most 32 records
        if seq.to_raw() & 0x1f == 0 {
            self.sink.flush().await;
        }
    }

    fn on_supervisory(&self, inner: &mut LinkSessionInner, kind: SupervisoryKind, seq: SeqNum) {
        match kind {
            SupervisoryKind::Ready => {
                debug!("peer ready, acknowledged below #{}", seq);
                self.gate_tx.send_modify(|gate| gate.peer_ready = true);
                Self::prune_window(inner, seq);
            }
            SupervisoryKind::NotReady => {
                debug!("peer not ready, suspending sends");
                self.gate_tx.send_modify(|gate| gate.peer_ready = false);
                Self::prune_window(inner, seq);
            }
            SupervisoryKind::Reject => {
                debug!("peer rejected from #{}, replaying the send window", seq);
                for replay_seq in seq.walk_to(inner.send_seq) {
                    match inner.send_window.get(&replay_seq) {
                        Some(buf) => {
                            if self.outbound_tx.send(Outbound::Raw(buf.clone())).is_err() {
                                warn!("outbound queue closed during replay");
                                break;
                            }
                        }
                        None => debug!("rejected frame #{} is no longer in the send window", replay_seq),
                    }
                }
            }
        }
    }

    /// Remove window entries below the acknowledged sequence. With wrap-around
    ///  keys this walks backwards over the contiguous run of retained frames.
    fn prune_window(inner: &mut LinkSessionInner, acked: SeqNum) {
        let mut seq = acked;
        loop {
            seq = seq.prev();
            if inner.send_window.remove(&seq).is_none() {
                break;
            }
        }
    }

    /// Single sender task: drains the outbound queue strictly FIFO, holding
    ///  each frame until the handshake is complete and the peer is ready.
    async fn sender_loop(
        inner: Arc<RwLock<LinkSessionInner>>,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        mut gate_rx: watch::Receiver<SendGate>,
        pipeline: Arc<SendPipeline>,
    ) {
        while let Some(item) = outbound_rx.recv().await {
            if gate_rx.wait_for(SendGate::open).await.is_err() {
                return;
            }
            match item {
                Outbound::Frame(Frame::Information { payload, .. }) => {
                    let buf = {
                        let mut inner = inner.write().await;
                        let seq = inner.send_seq;
                        trace!("sending information frame #{}", seq);
                        let buf = Frame::Information { seq, payload }.encode().freeze();
                        inner.send_window.insert(seq, buf.clone());
                        inner.send_seq = seq.next();
                        buf
                    };
                    pipeline.do_send_frame(&buf).await;
                }
                Outbound::Frame(frame) => {
                    trace!("sending frame {:?}", frame);
                    pipeline.do_send_frame(&frame.encode()).await;
                }
                Outbound::Raw(buf) => {
                    trace!("replaying a {} byte frame", buf.len());
                    pipeline.do_send_frame(&buf).await;
                }
            }
        }
    }

    /// Bridge task for acknowledgments: the receiver path may not perform a
    ///  suspending send, so it signals this task instead. N(R) = recv_seq + 1
    ///  acknowledges everything below it and names the next expected frame;
    ///  coalesced signals are safe because the acknowledgment is cumulative.
    async fn ack_loop(
        inner: Arc<RwLock<LinkSessionInner>>,
        ack_ready: Arc<Notify>,
        outbound_tx: mpsc::UnboundedSender<Outbound>,
    ) {
        loop {
            ack_ready.notified().await;
            let ack_seq = inner.read().await.recv_seq.next();
            let frame = Frame::Supervisory {
                kind: SupervisoryKind::Ready,
                seq: ack_seq,
            };
            if outbound_tx.send(Outbound::Frame(frame)).is_err() {
                return;
            }
        }
    }

    /// Bridge task for retransmission requests, signalled on gap detection
    ///  when the recovery policy is enabled.
    async fn reject_loop(
        inner: Arc<RwLock<LinkSessionInner>>,
        rej_ready: Arc<Notify>,
        outbound_tx: mpsc::UnboundedSender<Outbound>,
    ) {
        loop {
            rej_ready.notified().await;
            let Some(reject_seq) = inner.write().await.pending_reject.take() else {
                continue;
            };
            debug!("requesting retransmission from #{}", reject_seq);
            let frame = Frame::Supervisory {
                kind: SupervisoryKind::Reject,
                seq: reject_seq,
            };
            if outbound_tx.send(Outbound::Frame(frame)).is_err() {
                return;
            }
        }
    }

    /// Sends a handshake probe on a fixed interval until the first matching
    ///  echo cancels this task. Probes bypass the gated queue: nothing else may
    ///  be transmitted before the handshake completes.
    async fn handshake_loop(
        inner: Arc<RwLock<LinkSessionInner>>,
        probe_interval: Duration,
        pipeline: Arc<SendPipeline>,
    ) {
        let mut ticker = interval(probe_interval);
        loop {
            ticker.tick().await;
            let seq = inner.read().await.send_seq;
            debug!("sending handshake probe #{}", seq);
            pipeline.do_send_frame(&Frame::Handshake { seq }.encode()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_sink::MockRecordSink;
    use crate::send_pipeline::MockWireSocket;
    use mockall::Sequence;
    use tokio::io::AsyncWriteExt;
    use tokio::runtime::Builder;
    use tokio::time::sleep;

    fn test_config(reject_on_gap: bool) -> Arc<LinkConfig> {
        let mut config = LinkConfig::default_serial();
        config.reject_on_gap = reject_on_gap;
        Arc::new(config)
    }

    /// session with the emitter bridge tasks running, the outbound queue's
    ///  receiving end handed back for inspection
    fn harness_session(
        reject_on_gap: bool,
        sink: MockRecordSink,
    ) -> (Arc<LinkSession>, mpsc::UnboundedReceiver<Outbound>) {
        let session = Arc::new(LinkSession::new(test_config(reject_on_gap), Arc::new(sink)).unwrap());
        let outbound_rx = session.outbound_rx.try_lock().unwrap().take().unwrap();
        tokio::spawn(LinkSession::ack_loop(
            session.inner.clone(),
            session.ack_ready.clone(),
            session.outbound_tx.clone(),
        ));
        tokio::spawn(LinkSession::reject_loop(
            session.inner.clone(),
            session.rej_ready.clone(),
            session.outbound_tx.clone(),
        ));
        (session, outbound_rx)
    }

    async fn feed(session: &LinkSession, frame: Frame) {
        let mut inner = session.inner.write().await;
        session.on_frame(&mut inner, frame).await;
        drop(inner);
        // let the emitter tasks drain their signals
        sleep(Duration::from_millis(1)).await;
    }

    fn next_queued(outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Frame {
        match outbound_rx.try_recv() {
            Ok(Outbound::Frame(frame)) => frame,
            Ok(Outbound::Raw(buf)) => panic!("expected a typed frame, got raw bytes {:?}", buf),
            Err(e) => panic!("expected a queued frame: {}", e),
        }
    }

    fn next_queued_raw(outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Bytes {
        match outbound_rx.try_recv() {
            Ok(Outbound::Raw(buf)) => buf,
            Ok(Outbound::Frame(frame)) => panic!("expected raw bytes, got {:?}", frame),
            Err(e) => panic!("expected queued raw bytes: {}", e),
        }
    }

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_handshake_establishes_on_matching_echo_only() {
        let rt = paused_rt();
        rt.block_on(async {
            let (session, _outbound_rx) = harness_session(false, MockRecordSink::new());

            let probe_task = tokio::spawn(async {
                sleep(Duration::from_secs(3600)).await;
            });
            session.inner.write().await.handshake_handle = Some(probe_task);

            // echo for a sequence that was never probed
            feed(&session, Frame::Handshake { seq: SeqNum::from_raw(5) }).await;
            assert_eq!(session.state().await, LinkState::Connecting);
            assert!(session.inner.read().await.handshake_handle.is_some());
            assert!(!session.gate_tx.borrow().open());

            // matching echo: established, probe cancelled exactly once
            feed(&session, Frame::Handshake { seq: SeqNum::from_raw(1) }).await;
            assert_eq!(session.state().await, LinkState::Established);
            assert!(session.inner.read().await.handshake_handle.is_none());
            assert!(session.gate_tx.borrow().open());

            // duplicate keepalive once established: ignored
            feed(&session, Frame::Handshake { seq: SeqNum::from_raw(1) }).await;
            assert_eq!(session.state().await, LinkState::Established);
        });
    }

    #[test]
    fn test_in_order_information_is_delivered_and_acked() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut sink = MockRecordSink::new();
            let mut call_order = Sequence::new();
            sink.expect_append()
                .once()
                .in_sequence(&mut call_order)
                .withf(|payload| payload == [1, 0])
                .return_const(());
            sink.expect_append()
                .once()
                .in_sequence(&mut call_order)
                .withf(|payload| payload == [2, 0])
                .return_const(());

            let (session, mut outbound_rx) = harness_session(false, sink);

            feed(&session, Frame::Information { seq: SeqNum::from_raw(1), payload: vec![1, 0] }).await;
            feed(&session, Frame::Information { seq: SeqNum::from_raw(2), payload: vec![2, 0] }).await;

            assert_eq!(session.inner.read().await.recv_seq, SeqNum::from_raw(2));
            assert_eq!(
                next_queued(&mut outbound_rx),
                Frame::Supervisory { kind: SupervisoryKind::Ready, seq: SeqNum::from_raw(2) }
            );
            assert_eq!(
                next_queued(&mut outbound_rx),
                Frame::Supervisory { kind: SupervisoryKind::Ready, seq: SeqNum::from_raw(3) }
            );
            assert!(outbound_rx.try_recv().is_err());
        });
    }

    #[test]
    fn test_gap_is_flagged_and_later_retransmission_not_redelivered() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut sink = MockRecordSink::new();
            let mut call_order = Sequence::new();
            for expected in [vec![1u8, 0], vec![2, 0], vec![4, 0]] {
                sink.expect_append()
                    .once()
                    .in_sequence(&mut call_order)
                    .withf(move |payload| payload == expected)
                    .return_const(());
            }

            let (session, mut outbound_rx) = harness_session(false, sink);

            for seq in [1u8, 2] {
                feed(&session, Frame::Information { seq: SeqNum::from_raw(seq), payload: vec![seq, 0] }).await;
            }
            feed(&session, Frame::Information { seq: SeqNum::from_raw(4), payload: vec![4, 0] }).await;

            {
                let inner = session.inner.read().await;
                assert_eq!(inner.recv_seq, SeqNum::from_raw(4));
                assert_eq!(inner.rej_seqs, [SeqNum::from_raw(3)].into_iter().collect());
            }

            // acknowledgments for the two in-order frames, no recovery request
            assert_eq!(
                next_queued(&mut outbound_rx),
                Frame::Supervisory { kind: SupervisoryKind::Ready, seq: SeqNum::from_raw(2) }
            );
            assert_eq!(
                next_queued(&mut outbound_rx),
                Frame::Supervisory { kind: SupervisoryKind::Ready, seq: SeqNum::from_raw(3) }
            );
            assert!(outbound_rx.try_recv().is_err());

            // the retransmission of #3 arrives eventually: consumed silently
            feed(&session, Frame::Information { seq: SeqNum::from_raw(3), payload: vec![3, 0] }).await;
            {
                let inner = session.inner.read().await;
                assert_eq!(inner.recv_seq, SeqNum::from_raw(4));
                assert!(inner.rej_seqs.is_empty());
            }
            assert!(outbound_rx.try_recv().is_err());
        });
    }

    #[test]
    fn test_gap_requests_retransmission_when_recovery_enabled() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut sink = MockRecordSink::new();
            sink.expect_append().times(2).return_const(());

            let (session, mut outbound_rx) = harness_session(true, sink);

            feed(&session, Frame::Information { seq: SeqNum::from_raw(1), payload: vec![1, 0] }).await;
            feed(&session, Frame::Information { seq: SeqNum::from_raw(4), payload: vec![4, 0] }).await;

            assert_eq!(
                next_queued(&mut outbound_rx),
                Frame::Supervisory { kind: SupervisoryKind::Ready, seq: SeqNum::from_raw(2) }
            );
            assert_eq!(
                next_queued(&mut outbound_rx),
                Frame::Supervisory { kind: SupervisoryKind::Reject, seq: SeqNum::from_raw(2) }
            );
            assert!(outbound_rx.try_recv().is_err());

            let inner = session.inner.read().await;
            assert_eq!(
                inner.rej_seqs,
                [SeqNum::from_raw(2), SeqNum::from_raw(3)].into_iter().collect()
            );
            assert_eq!(inner.pending_reject, None);
        });
    }

    #[test]
    fn test_every_32nd_record_flushes_the_sink() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut sink = MockRecordSink::new();
            sink.expect_append().times(40).return_const(());
            sink.expect_flush().times(1).return_const(());

            let (session, _outbound_rx) = harness_session(false, sink);

            for seq in 1u8..=40 {
                feed(&session, Frame::Information { seq: SeqNum::from_raw(seq), payload: vec![seq, 0] }).await;
            }

            assert_eq!(session.inner.read().await.recv_seq, SeqNum::from_raw(40));
        });
    }

    #[test]
    fn test_ready_prunes_acknowledged_window_entries() {
        let rt = paused_rt();
        rt.block_on(async {
            let (session, _outbound_rx) = harness_session(false, MockRecordSink::new());
            {
                let mut inner = session.inner.write().await;
                for seq in 1u8..=3 {
                    inner.send_window.insert(SeqNum::from_raw(seq), Bytes::from(vec![seq]));
                }
                inner.send_seq = SeqNum::from_raw(4);
            }

            feed(&session, Frame::Supervisory { kind: SupervisoryKind::Ready, seq: SeqNum::from_raw(3) }).await;

            let inner = session.inner.read().await;
            assert!(session.gate_tx.borrow().peer_ready);
            assert_eq!(inner.send_window.len(), 1);
            assert!(inner.send_window.contains_key(&SeqNum::from_raw(3)));
        });
    }

    #[test]
    fn test_not_ready_clears_peer_readiness() {
        let rt = paused_rt();
        rt.block_on(async {
            let (session, _outbound_rx) = harness_session(false, MockRecordSink::new());
            session.gate_tx.send_replace(SendGate::OPEN);

            feed(&session, Frame::Supervisory { kind: SupervisoryKind::NotReady, seq: SeqNum::from_raw(1) }).await;

            let gate = *session.gate_tx.borrow();
            assert!(!gate.peer_ready);
            assert!(gate.handshake_complete);
        });
    }

    #[test]
    fn test_reject_replays_window_in_sequence_order() {
        let rt = paused_rt();
        rt.block_on(async {
            let (session, mut outbound_rx) = harness_session(false, MockRecordSink::new());
            {
                let mut inner = session.inner.write().await;
                inner.send_window.insert(SeqNum::from_raw(1), Bytes::from_static(b"one"));
                inner.send_window.insert(SeqNum::from_raw(2), Bytes::from_static(b"two"));
                inner.send_window.insert(SeqNum::from_raw(3), Bytes::from_static(b"three"));
                inner.send_seq = SeqNum::from_raw(4);
            }

            feed(&session, Frame::Supervisory { kind: SupervisoryKind::Reject, seq: SeqNum::from_raw(2) }).await;

            assert_eq!(next_queued_raw(&mut outbound_rx), Bytes::from_static(b"two"));
            assert_eq!(next_queued_raw(&mut outbound_rx), Bytes::from_static(b"three"));
            assert!(outbound_rx.try_recv().is_err());
            // replay does not advance the send sequence
            assert_eq!(session.inner.read().await.send_seq, SeqNum::from_raw(4));
        });
    }

    #[test]
    fn test_sender_is_gated_and_preserves_submission_order() {
        let rt = paused_rt();
        rt.block_on(async {
            let (session, outbound_rx) = harness_session(false, MockRecordSink::new());

            let mut socket = MockWireSocket::new();
            let mut call_order = Sequence::new();
            for (seq, payload) in [(1u8, vec![1u8, 0]), (2, vec![2, 0])] {
                let expected = Frame::Information { seq: SeqNum::from_raw(seq), payload }.encode();
                socket
                    .expect_do_send_bytes()
                    .once()
                    .in_sequence(&mut call_order)
                    .withf(move |buf| buf == expected.as_ref())
                    .return_const(());
            }
            let pipeline = Arc::new(SendPipeline::new(Arc::new(socket)));

            let sender = tokio::spawn(LinkSession::sender_loop(
                session.inner.clone(),
                outbound_rx,
                session.gate_tx.subscribe(),
                pipeline,
            ));

            session.submit(Frame::Information { seq: SeqNum::ZERO, payload: vec![1, 0] }).unwrap();
            session.submit(Frame::Information { seq: SeqNum::ZERO, payload: vec![2, 0] }).unwrap();

            // gate closed: nothing is transmitted, nothing is window-recorded
            sleep(Duration::from_millis(10)).await;
            assert!(session.inner.read().await.send_window.is_empty());
            assert!(!sender.is_finished());

            session.gate_tx.send_replace(SendGate::OPEN);
            sleep(Duration::from_millis(10)).await;

            let inner = session.inner.read().await;
            assert_eq!(inner.send_seq, SeqNum::from_raw(3));
            assert_eq!(inner.send_window.len(), 2);
            assert!(inner.send_window.contains_key(&SeqNum::from_raw(1)));
            assert!(inner.send_window.contains_key(&SeqNum::from_raw(2)));
            assert!(!sender.is_finished());
        });
    }

    #[test]
    fn test_handshake_probe_schedule() {
        let rt = paused_rt();
        rt.block_on(async {
            let (session, _outbound_rx) = harness_session(false, MockRecordSink::new());

            let expected = Frame::Handshake { seq: SeqNum::from_raw(1) }.encode();
            let mut socket = MockWireSocket::new();
            socket
                .expect_do_send_bytes()
                .times(3)
                .withf(move |buf| buf == expected.as_ref())
                .return_const(());
            let pipeline = Arc::new(SendPipeline::new(Arc::new(socket)));

            let probing = tokio::spawn(LinkSession::handshake_loop(
                session.inner.clone(),
                Duration::from_secs(2),
                pipeline,
            ));

            // probes go out at 0s, 2s and 4s
            sleep(Duration::from_millis(4100)).await;
            assert!(!probing.is_finished());
            probing.abort();
        });
    }

    #[test]
    fn test_malformed_span_is_dropped_and_scanning_continues() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut sink = MockRecordSink::new();
            sink.expect_append().once().withf(|payload| payload == [5, 0]).return_const(());

            let (session, mut outbound_rx) = harness_session(false, sink);

            let mut corrupted = Frame::Information { seq: SeqNum::from_raw(1), payload: vec![9, 9] }
                .encode()
                .to_vec();
            corrupted[3] ^= 0x01;

            let mut stream = corrupted;
            stream.extend_from_slice(&Frame::Information { seq: SeqNum::from_raw(1), payload: vec![5, 0] }.encode());

            session.on_data(&stream).await;
            sleep(Duration::from_millis(1)).await;

            // the corrupted span changed no state; the following frame was in order
            assert_eq!(session.inner.read().await.recv_seq, SeqNum::from_raw(1));
            assert_eq!(
                next_queued(&mut outbound_rx),
                Frame::Supervisory { kind: SupervisoryKind::Ready, seq: SeqNum::from_raw(2) }
            );
            assert!(outbound_rx.try_recv().is_err());
        });
    }

    #[test]
    fn test_frames_split_across_chunks_are_reassembled() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut sink = MockRecordSink::new();
            sink.expect_append().once().withf(|payload| payload == [7, 0]).return_const(());

            let (session, _outbound_rx) = harness_session(false, sink);

            let encoded = Frame::Information { seq: SeqNum::from_raw(1), payload: vec![7, 0] }.encode();
            let (first, second) = encoded.split_at(3);

            session.on_data(first).await;
            assert_eq!(session.inner.read().await.recv_seq, SeqNum::ZERO);

            session.on_data(second).await;
            assert_eq!(session.inner.read().await.recv_seq, SeqNum::from_raw(1));
        });
    }

    #[test]
    fn test_session_runs_until_transport_closes() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut sink = MockRecordSink::new();
            let mut call_order = Sequence::new();
            sink.expect_append()
                .once()
                .in_sequence(&mut call_order)
                .withf(|payload| payload == [10, 0])
                .return_const(());
            sink.expect_append()
                .once()
                .in_sequence(&mut call_order)
                .withf(|payload| payload == [20, 0])
                .return_const(());

            let session =
                Arc::new(LinkSession::new(test_config(false), Arc::new(sink)).unwrap());

            let (host_io, mut device_io) = tokio::io::duplex(4096);
            let running = {
                let session = session.clone();
                tokio::spawn(async move { session.start(host_io).await })
            };

            // the emulated device echoes the probe, then streams two records
            device_io.write_all(&Frame::Handshake { seq: SeqNum::from_raw(1) }.encode()).await.unwrap();
            device_io
                .write_all(&Frame::Information { seq: SeqNum::from_raw(1), payload: vec![10, 0] }.encode())
                .await
                .unwrap();
            device_io
                .write_all(&Frame::Information { seq: SeqNum::from_raw(2), payload: vec![20, 0] }.encode())
                .await
                .unwrap();

            sleep(Duration::from_millis(50)).await;
            assert_eq!(session.state().await, LinkState::Established);

            drop(device_io);
            running.await.unwrap().unwrap();

            assert_eq!(session.state().await, LinkState::Closed);
            sleep(Duration::from_millis(1)).await;
            assert!(session.submit(Frame::Handshake { seq: SeqNum::ZERO }).is_err());
        });
    }

    #[test]
    fn test_session_cannot_be_started_twice() {
        let rt = paused_rt();
        rt.block_on(async {
            let session = Arc::new(
                LinkSession::new(test_config(false), Arc::new(MockRecordSink::new())).unwrap(),
            );

            let (host_io, _device_io) = tokio::io::duplex(64);
            let running = {
                let session = session.clone();
                tokio::spawn(async move { session.start(host_io).await })
            };
            sleep(Duration::from_millis(1)).await;

            let (second_io, _other) = tokio::io::duplex(64);
            assert!(session.start(second_io).await.is_err());

            running.abort();
        });
    }
}
