//! Request/response dispatcher. Owns the transport and enforces the protocol
//! discipline: at most one command is in flight, responses are matched
//! strictly to the head of the FIFO queue, notifications bypass the queue,
//! and every caller gets a deferred result that resolves on response,
//! timeout or notification.

use crate::error::Error;
use crate::protocol::codec::{encode_frame, next_seq, FrameDecoder, InboundFrame};
use crate::protocol::{Command, StopNotification};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    /// Deadline for steady-state commands.
    pub default_timeout: Duration,
    /// Deadline for Init/Close. Host-side scheduling jitter is tolerated more
    /// generously at session start and end.
    pub init_timeout: Duration,
    /// Window within which a partial frame must complete.
    pub chunk_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            default_timeout: Duration::from_secs(3),
            init_timeout: Duration::from_secs(10),
            chunk_timeout: Duration::from_secs(2),
        }
    }
}

enum Done {
    Response(oneshot::Sender<Result<Bytes, Error>>),
    Notification(oneshot::Sender<Result<StopNotification, Error>>),
}

impl Done {
    fn fail(self, err: Error) {
        match self {
            Done::Response(tx) => drop(tx.send(Err(err))),
            Done::Notification(tx) => drop(tx.send(Err(err))),
        }
    }
}

/// A command waiting in the queue. Owned exclusively by the worker; at most
/// one of these is "in flight" at a time.
struct PendingCommand {
    command: Command,
    payload: Bytes,
    /// `None` for the continuation command: a program may run forever.
    timeout: Option<Duration>,
    done: Done,
}

struct Inflight {
    seq: u8,
    command: Command,
    deadline: Option<Instant>,
    done: Done,
}

enum Op {
    Send(PendingCommand),
    /// Immediate transmit bypassing the queue (pause). The response, if any,
    /// is absorbed by the out-of-band sequence table.
    Oob { command: Command, payload: Bytes },
}

/// Session-terminating conditions. Kept as a copyable kind so the same error
/// can be surfaced to every pending caller.
#[derive(Clone, Copy, Debug)]
enum FatalKind {
    Closed,
    ChunkTimeout,
    Malformed(&'static str),
    SequenceMismatch { expected: u8, got: u8 },
    Io(io::ErrorKind),
}

impl FatalKind {
    fn to_error(self) -> Error {
        match self {
            FatalKind::Closed => Error::ConnectionClosed,
            FatalKind::ChunkTimeout => Error::ChunkTimeout,
            FatalKind::Malformed(what) => Error::MalformedFrame(what),
            FatalKind::SequenceMismatch { expected, got } => {
                Error::SequenceMismatch { expected, got }
            }
            FatalKind::Io(kind) => Error::Io(io::Error::from(kind)),
        }
    }
}

/// Handle to the dispatcher task. Cheap to clone; all operations are
/// serialized through the worker's op channel.
#[derive(Clone)]
pub struct Dispatcher {
    ops: mpsc::UnboundedSender<Op>,
}

impl Dispatcher {
    /// Spawn the worker task owning `transport`.
    pub fn start<T>(transport: T, config: DispatcherConfig) -> Dispatcher
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (reader, writer) = tokio::io::split(transport);
        let worker = Worker {
            reader,
            writer,
            ops: ops_rx,
            decoder: FrameDecoder::new(),
            queue: VecDeque::new(),
            inflight: None,
            parked: None,
            oob: HashMap::new(),
            last_seq: 0,
            chunk_timeout: config.chunk_timeout,
            chunk_deadline: None,
        };
        tokio::spawn(worker.run());
        Dispatcher { ops: ops_tx }
    }

    /// Issue a synchronous request/response command.
    pub async fn send(
        &self,
        command: Command,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, Error> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(Op::Send(PendingCommand {
                command,
                payload,
                timeout: Some(timeout),
                done: Done::Response(tx),
            }))
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Issue the long-running run command. The deferred result resolves when
    /// the asynchronous stop notification arrives.
    pub async fn send_continuation(
        &self,
        command: Command,
        payload: Bytes,
    ) -> Result<StopNotification, Error> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(Op::Send(PendingCommand {
                command,
                payload,
                timeout: None,
                done: Done::Notification(tx),
            }))
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Transmit immediately, bypassing the queue. Used for pause, which must
    /// unblock a running continuation even while other commands are pending.
    pub fn send_oob(&self, command: Command, payload: Bytes) -> Result<(), Error> {
        self.ops
            .send(Op::Oob { command, payload })
            .map_err(|_| Error::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.ops.is_closed()
    }
}

struct Worker<T> {
    reader: ReadHalf<T>,
    writer: WriteHalf<T>,
    ops: mpsc::UnboundedReceiver<Op>,
    decoder: FrameDecoder,
    queue: VecDeque<PendingCommand>,
    inflight: Option<Inflight>,
    /// An acknowledged continuation waiting for its stop notification. Once
    /// the run command is acked the program executes freely and the queue
    /// keeps moving, so commands stay usable while the remote runs.
    parked: Option<(Command, oneshot::Sender<Result<StopNotification, Error>>)>,
    /// Out-of-band sequence numbers whose responses must not touch the queue.
    oob: HashMap<u8, Command>,
    last_seq: u8,
    chunk_timeout: Duration,
    chunk_deadline: Option<Instant>,
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Worker<T> {
    async fn run(mut self) {
        enum Event {
            Op(Option<Op>),
            Read(io::Result<usize>),
            CommandTimeout,
            ChunkTimeout,
        }

        let mut rdbuf = [0u8; 4096];

        let fatal = loop {
            if self.inflight.is_none() {
                if let Some(pend) = self.queue.pop_front() {
                    if let Err(e) = self.transmit(pend).await {
                        break FatalKind::Io(e.kind());
                    }
                }
            }

            let cmd_deadline = self.inflight.as_ref().and_then(|f| f.deadline);
            let chunk_deadline = self.chunk_deadline;

            let event = tokio::select! {
                biased;
                op = self.ops.recv() => Event::Op(op),
                read = self.reader.read(&mut rdbuf) => Event::Read(read),
                _ = sleep_until(cmd_deadline.unwrap_or_else(far_future)), if cmd_deadline.is_some() => Event::CommandTimeout,
                _ = sleep_until(chunk_deadline.unwrap_or_else(far_future)), if chunk_deadline.is_some() => Event::ChunkTimeout,
            };

            match event {
                Event::Op(Some(Op::Send(pend))) => self.queue.push_back(pend),
                Event::Op(Some(Op::Oob { command, payload })) => {
                    if let Err(e) = self.transmit_oob(command, &payload).await {
                        break FatalKind::Io(e.kind());
                    }
                }
                // every handle dropped: session is over
                Event::Op(None) => break FatalKind::Closed,

                Event::Read(Ok(0)) => break FatalKind::Closed,
                Event::Read(Ok(n)) => {
                    if let Some(kind) = self.consume(&rdbuf[..n]) {
                        break kind;
                    }
                }
                Event::Read(Err(e)) => break FatalKind::Io(e.kind()),

                Event::CommandTimeout => {
                    if let Some(fl) = self.inflight.take() {
                        log::warn!(target: "protocol", "no response for {} (seq {}), continuing with next command", fl.command, fl.seq);
                        fl.done.fail(Error::ProtocolTimeout(fl.command));
                    }
                }

                Event::ChunkTimeout => break FatalKind::ChunkTimeout,
            }
        };

        self.shutdown(fatal);
    }

    async fn transmit(&mut self, pend: PendingCommand) -> io::Result<()> {
        let seq = self.alloc_seq();
        let frame = encode_frame(seq, pend.command, &pend.payload);
        self.writer.write_all(&frame).await?;
        log::debug!(target: "protocol", "-> {} seq {seq} ({} bytes)", pend.command, frame.len());
        self.inflight = Some(Inflight {
            seq,
            command: pend.command,
            deadline: pend.timeout.map(|t| Instant::now() + t),
            done: pend.done,
        });
        Ok(())
    }

    async fn transmit_oob(&mut self, command: Command, payload: &[u8]) -> io::Result<()> {
        let seq = self.alloc_seq();
        self.oob.insert(seq, command);
        let frame = encode_frame(seq, command, payload);
        self.writer.write_all(&frame).await?;
        log::debug!(target: "protocol", "-> {command} seq {seq} (out of band)");
        Ok(())
    }

    /// Sequence numbers wrap 1..=255 and are never reused while a pending
    /// command still references them.
    fn alloc_seq(&mut self) -> u8 {
        loop {
            self.last_seq = next_seq(self.last_seq);
            let seq = self.last_seq;
            let in_use = self.oob.contains_key(&seq)
                || self.inflight.as_ref().map(|f| f.seq) == Some(seq);
            if !in_use {
                return seq;
            }
        }
    }

    fn consume(&mut self, chunk: &[u8]) -> Option<FatalKind> {
        let mut frames = vec![];
        if let Err(e) = self.decoder.feed(chunk, &mut frames) {
            return Some(match e {
                Error::MalformedFrame(what) => FatalKind::Malformed(what),
                _ => FatalKind::Malformed("frame decode failed"),
            });
        }

        // The chunk window opens when a partial frame appears and is not
        // extended by later partial reads of the same frame.
        self.chunk_deadline = if self.decoder.mid_frame() {
            Some(
                self.chunk_deadline
                    .unwrap_or_else(|| Instant::now() + self.chunk_timeout),
            )
        } else {
            None
        };

        for frame in frames {
            if let Some(kind) = self.handle_frame(frame) {
                return Some(kind);
            }
        }
        None
    }

    fn handle_frame(&mut self, frame: InboundFrame) -> Option<FatalKind> {
        if frame.is_notification() {
            return self.handle_notification(frame);
        }

        if let Some(command) = self.oob.remove(&frame.seq) {
            log::debug!(target: "protocol", "<- out-of-band {command} response (seq {})", frame.seq);
            return None;
        }

        match self.inflight.take() {
            Some(Inflight {
                seq, command, done, ..
            }) if seq == frame.seq => {
                match done {
                    Done::Response(tx) => {
                        log::debug!(target: "protocol", "<- {command} response (seq {seq})");
                        let _ = tx.send(Ok(frame.payload));
                    }
                    Done::Notification(tx) => {
                        // acknowledgement of the run command; the real
                        // completion arrives later as a notification, and the
                        // queue keeps moving in the meantime
                        log::debug!(target: "protocol", "<- {command} acknowledged, awaiting stop");
                        if let Some((old, _)) = self.parked.replace((command, tx)) {
                            log::warn!(target: "protocol", "{old} superseded before its stop arrived");
                        }
                    }
                }
                None
            }
            Some(fl) => {
                let expected = fl.seq;
                self.inflight = Some(fl);
                Some(FatalKind::SequenceMismatch {
                    expected,
                    got: frame.seq,
                })
            }
            None => Some(FatalKind::Malformed("response with no command in flight")),
        }
    }

    fn handle_notification(&mut self, frame: InboundFrame) -> Option<FatalKind> {
        // a notification may also arrive before the run command's ack
        let waiting = self.parked.take().or_else(|| match self.inflight.take() {
            Some(Inflight {
                command,
                done: Done::Notification(tx),
                ..
            }) => Some((command, tx)),
            other => {
                self.inflight = other;
                None
            }
        });
        let Some((command, tx)) = waiting else {
            log::warn!(target: "protocol", "notification with no continuation registered, dropped");
            return None;
        };
        match StopNotification::parse(&frame.payload) {
            Ok(notification) => {
                log::debug!(target: "protocol", "<- stop notification for {command}: {}", notification.reason);
                let _ = tx.send(Ok(notification));
                None
            }
            Err(_) => Some(FatalKind::Malformed("unparseable stop notification")),
        }
    }

    fn shutdown(mut self, kind: FatalKind) {
        if !matches!(kind, FatalKind::Closed) {
            log::error!(target: "protocol", "session terminated: {}", kind.to_error());
        }
        if let Some(fl) = self.inflight.take() {
            fl.done.fail(kind.to_error());
        }
        if let Some((_, tx)) = self.parked.take() {
            let _ = tx.send(Err(kind.to_error()));
        }
        for pend in self.queue.drain(..) {
            pend.done.fail(kind.to_error());
        }
        self.ops.close();
    }
}
