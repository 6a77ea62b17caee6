use std::cmp::min;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::channel::{mpsc as body_mpsc, oneshot as body_oneshot};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{MultipartDecoder, MultipartPart, PayloadEncoder, RequestHeadDecoder, ResponseHeadEncoder, decode_text};
use crate::connection::strategy::BodyStrategy;
use crate::connection::{Command, ConnectionLink, Reply, State};
use crate::protocol::headers::CONNECTION;
use crate::protocol::{
    DoneCallback, FormUpload, HttpError, ParseError, PayloadItem, PayloadSize, Request, RequestBuffer, RequestHead, Response,
    ResponseHead, Transaction, TxSignals, UploadedFile,
};
use crate::server::{Dispatcher, ServerShared};

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Multipart decoding progress of the current request
struct MultipartBody {
    decoder: MultipartDecoder,
    buffer: BytesMut,
    upload: FormUpload,
    charset: String,
}

/// Everything that lives for exactly one request/response exchange.
///
/// Dropped as a whole when the exchange completes, so a kept-alive
/// connection starts the next request from a clean slate.
struct TxRecord {
    commands: mpsc::UnboundedReceiver<Command>,
    signals: Arc<TxSignals>,
    /// Held until the transaction is handed to the request handler
    pending: Option<Transaction>,
    strategy: BodyStrategy,
    /// Request body bytes not yet read off the socket
    remaining: u64,
    http10: bool,
    is_head: bool,
    keep_alive_requested: bool,
    close_after: bool,
    form_body: BytesMut,
    multipart: Option<MultipartBody>,
    stream_started: bool,
    body_sender: Option<body_mpsc::Sender<RequestBuffer>>,
    /// Completion of the buffer the handler currently holds
    buffer_done: Option<body_oneshot::Receiver<()>>,
    response_started: bool,
    /// The response was generated by the connection, not the handler
    auto_response: bool,
    encoder: PayloadEncoder,
    on_done: Option<DoneCallback>,
    /// Answered once the pending write has reached the socket
    reply: Option<Reply>,
}

/// One accepted socket, driven through [`State`] by its own task.
///
/// Read and write states perform one socket operation; the user-wait states
/// block on the transaction's command channel. Nothing here runs user code:
/// handlers and callbacks are posted to the [`Dispatcher`].
pub(crate) struct HttpConnection<S> {
    id: u64,
    io: S,
    peer: SocketAddr,
    server: Arc<ServerShared>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    state: State,
    state_tx: watch::Sender<State>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    read_buffer_size: usize,
    head_decoder: RequestHeadDecoder,
    tx: Option<TxRecord>,
}

impl<S> HttpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Registers the connection with the server; `None` once the server is disposed.
    pub(crate) fn new(
        io: S,
        peer: SocketAddr,
        server: Arc<ServerShared>,
        dispatcher: Dispatcher,
        shutdown: CancellationToken,
    ) -> Option<Self> {
        let (state_tx, state_rx) = watch::channel(State::RequestHeaders);
        let id = server.register(peer, shutdown.clone(), state_rx)?;
        let config = server.config();
        let read_buffer_size = config.read_buffer_size;
        let head_decoder = RequestHeadDecoder::with_max_size(config.max_header_size);

        Some(Self {
            id,
            io,
            peer,
            server,
            dispatcher,
            shutdown,
            state: State::RequestHeaders,
            state_tx,
            read_buf: BytesMut::with_capacity(read_buffer_size),
            write_buf: BytesMut::new(),
            read_buffer_size,
            head_decoder,
            tx: None,
        })
    }

    pub(crate) async fn run(mut self) {
        debug!(peer = %self.peer, "connection opened");

        while self.state != State::Closed {
            self.state_tx.send_replace(self.state);
            trace!(peer = %self.peer, state = ?self.state, "connection step");

            let step = match self.state {
                State::RequestHeaders => self.read_request_head().await,
                State::Send100ContinueUserWait => self.wait_continue_decision().await,
                State::Send100Continue => self.write_continue().await,
                State::RequestBodyFull | State::RequestBodyMultiPart | State::RequestBodyDump => self.read_body().await,
                State::RequestBodyUserWait => self.wait_body_consumer().await,
                State::RequestBodyUserRead => self.read_body_buffer().await,
                State::ResponseHeadersUserWait => self.wait_response_start().await,
                State::SendResponseHeaders => self.write_response_head().await,
                State::ResponseBodyUserWait => self.wait_response_body().await,
                State::SendResponseBody => self.write_response_body(false).await,
                State::SendResponseBodyLast => self.write_response_body(true).await,
                State::Failure => self.write_failure().await,
                State::Closed => Ok(State::Closed),
            };

            self.state = match step {
                Ok(next) => next,
                Err(e) => {
                    debug!(peer = %self.peer, state = ?self.state, cause = %e, "connection dropped");
                    State::Closed
                }
            };
        }

        self.dispose().await;
    }

    /// Fires pending callbacks, cancels an unfinished exchange and closes the socket.
    async fn dispose(&mut self) {
        if let Some(mut record) = self.tx.take() {
            if let Some(on_done) = record.on_done.take() {
                self.dispatcher.dispatch_fn(on_done);
            }
            record.signals.cancel();
        }

        self.state = State::Closed;
        self.state_tx.send_replace(State::Closed);
        self.server.unregister(self.id);

        if let Err(e) = self.io.shutdown().await {
            trace!(peer = %self.peer, cause = %e, "socket shutdown failed");
        }
        debug!(peer = %self.peer, "connection closed");
    }


    fn tx_token(&self) -> Option<CancellationToken> {
        self.tx.as_ref().map(|record| record.signals.token().clone())
    }

    /// One read into `read_buf`; `0` means the peer closed its side.
    async fn read_more(&mut self) -> io::Result<usize> {
        self.read_buf.reserve(self.read_buffer_size);
        let tx_token = self.tx_token();
        let Self { io, read_buf, shutdown, .. } = self;

        select! {
            biased;
            () = shutdown.cancelled() => Err(aborted("server shutting down")),
            () = canceled(tx_token) => Err(aborted("transaction canceled")),
            read = io.read_buf(read_buf) => read,
        }
    }

    /// Writes and flushes everything in `write_buf`.
    async fn flush_out(&mut self) -> io::Result<()> {
        let tx_token = self.tx_token();
        let Self { io, write_buf, shutdown, .. } = self;
        let write = async {
            io.write_all(write_buf).await?;
            io.flush().await
        };

        select! {
            biased;
            () = shutdown.cancelled() => Err(aborted("server shutting down")),
            () = canceled(tx_token) => Err(aborted("transaction canceled")),
            written = write => written,
        }?;

        self.write_buf.clear();
        Ok(())
    }

    /// Waits for the next command of the current transaction.
    ///
    /// `None` means every handle of the transaction has been dropped.
    async fn next_command(&mut self) -> io::Result<Option<Command>> {
        let Some(record) = self.tx.as_mut() else {
            return Err(aborted("no transaction"));
        };
        let tx_token = record.signals.token().clone();

        select! {
            biased;
            () = self.shutdown.cancelled() => Err(aborted("server shutting down")),
            () = tx_token.cancelled() => Err(aborted("transaction canceled")),
            command = record.commands.recv() => Ok(command),
        }
    }


    async fn read_request_head(&mut self) -> io::Result<State> {
        loop {
            match self.head_decoder.decode(&mut self.read_buf) {
                Ok(Some(head)) => return Ok(self.begin_transaction(head)),
                Ok(None) => {}
                Err(e) => return Ok(self.fail(&e)),
            }

            if self.read_more().await? == 0 {
                if !self.head_decoder.is_idle() {
                    debug!(peer = %self.peer, "peer closed in the middle of a request head");
                }
                return Ok(State::Closed);
            }
        }
    }

    fn begin_transaction(&mut self, head: RequestHead) -> State {
        debug!(peer = %self.peer, method = %head.method, path = %head.raw_path, "request received");

        let headers = &head.headers;
        let content_length = match headers.content_length() {
            Ok(length) => length.unwrap_or(0),
            Err(e) => return self.fail(&ParseError::invalid_content_length(e)),
        };
        if headers.is_chunked_encoding() {
            return self.fail(&ParseError::ChunkedRequestBody);
        }
        let strategy = match BodyStrategy::select(&head, content_length) {
            Ok(strategy) => strategy,
            Err(e) => return self.fail(&e),
        };

        let expect_continue = headers.is_expect_continue() && content_length > 0;
        let keep_alive_requested = headers.is_connection_keep_alive();
        let close_after = headers.is_connection_close() || (head.http10 && !keep_alive_requested);
        let http10 = head.http10;
        let is_head = head.method == Method::HEAD;
        let multipart = match &strategy {
            BodyStrategy::Multipart { boundary, charset } => Some(MultipartBody {
                decoder: MultipartDecoder::new(boundary),
                buffer: BytesMut::new(),
                upload: FormUpload::default(),
                charset: charset.clone(),
            }),
            _ => None,
        };

        let (link, commands) = ConnectionLink::new();
        let signals = Arc::new(TxSignals::new(self.dispatcher.clone()));
        let response = Response::new(&head.method, http10, link.clone());
        let request = Request::new(head, self.peer, strategy.is_stream(), link.clone());
        let tx = Transaction::new(request, response, Arc::clone(&signals));

        self.tx = Some(TxRecord {
            commands,
            signals,
            pending: Some(tx.clone()),
            strategy,
            remaining: content_length,
            http10,
            is_head,
            keep_alive_requested,
            close_after,
            form_body: BytesMut::new(),
            multipart,
            stream_started: false,
            body_sender: None,
            buffer_done: None,
            response_started: false,
            auto_response: false,
            encoder: PayloadEncoder::empty(),
            on_done: None,
            reply: None,
        });

        if !expect_continue {
            return self.enter_body();
        }

        if self.server.dispatch_expect_continue(&self.dispatcher, tx, link) {
            State::Send100ContinueUserWait
        } else {
            self.write_buf.extend_from_slice(CONTINUE_RESPONSE);
            State::Send100Continue
        }
    }

    /// Moves to the body phase chosen for the request.
    fn enter_body(&mut self) -> State {
        let Some(record) = self.tx.as_ref() else {
            return State::Closed;
        };

        match record.strategy {
            BodyStrategy::Empty => self.dispatch_request(State::ResponseHeadersUserWait),
            BodyStrategy::Form => State::RequestBodyFull,
            BodyStrategy::Multipart { .. } => State::RequestBodyMultiPart,
            BodyStrategy::Stream => self.dispatch_request(State::RequestBodyUserWait),
        }
    }

    /// Hands the transaction to the request handler, answering `404` without one.
    fn dispatch_request(&mut self, next: State) -> State {
        let Some(tx) = self.tx.as_mut().and_then(|record| record.pending.take()) else {
            return next;
        };

        if self.server.dispatch_request(&self.dispatcher, tx) {
            next
        } else {
            debug!(peer = %self.peer, "no request handler registered");
            self.auto_respond(StatusCode::NOT_FOUND, next)
        }
    }

    /// Queues a minimal error response; the connection closes once it is written.
    fn fail(&mut self, error: &ParseError) -> State {
        let Some(status) = error.status() else {
            return State::Closed;
        };
        info!(peer = %self.peer, status = status.as_u16(), cause = %error, "rejecting request");

        let mut head = ResponseHead::new(status, false);
        head.headers.set_content_length(Some(0));
        self.write_buf.clear();
        match ResponseHeadEncoder.encode(&head, &mut self.write_buf) {
            Ok(()) => State::Failure,
            Err(_) => State::Closed,
        }
    }

    async fn write_failure(&mut self) -> io::Result<State> {
        self.flush_out().await?;
        Ok(State::Closed)
    }

    async fn wait_continue_decision(&mut self) -> io::Result<State> {
        let current = State::Send100ContinueUserWait;
        let Some(command) = self.next_command().await? else {
            return Ok(State::Closed);
        };

        Ok(match command {
            Command::Send100Continue { reply } => {
                self.write_buf.extend_from_slice(CONTINUE_RESPONSE);
                self.set_reply(reply);
                State::Send100Continue
            }
            Command::ContinueHandled => {
                self.write_buf.extend_from_slice(CONTINUE_RESPONSE);
                State::Send100Continue
            }
            Command::BeginResponse { head, on_done, reply } => self.start_response(head, on_done, Some(reply), current, false),
            Command::Abort => State::Closed,
            command => self.reject(command, current),
        })
    }

    async fn write_continue(&mut self) -> io::Result<State> {
        self.flush_out().await?;
        self.answer(Ok(()));
        trace!(peer = %self.peer, "sent 100 continue");
        Ok(self.enter_body())
    }


    /// Reads the next piece of a form, multipart or discarded body.
    async fn read_body(&mut self) -> io::Result<State> {
        if self.read_buf.is_empty() && self.read_more().await? == 0 {
            debug!(peer = %self.peer, "peer closed in the middle of a request body");
            return Ok(State::Closed);
        }

        let state = self.state;
        let Some(record) = self.tx.as_mut() else {
            return Ok(State::Closed);
        };

        let take = usize::try_from(record.remaining).map_or(self.read_buf.len(), |remaining| min(remaining, self.read_buf.len()));
        let chunk = self.read_buf.split_to(take);
        record.remaining -= take as u64;

        match state {
            State::RequestBodyFull => record.form_body.extend_from_slice(&chunk),
            State::RequestBodyMultiPart => {
                if let Some(multipart) = record.multipart.as_mut() {
                    multipart.buffer.extend_from_slice(&chunk);
                    if let Err(e) = drain_parts(multipart, false) {
                        return Ok(self.fail(&e));
                    }
                }
            }
            _ => {}
        }

        if record.remaining > 0 {
            return Ok(state);
        }

        Ok(match state {
            State::RequestBodyFull => {
                let body = String::from_utf8_lossy(&record.form_body).into_owned();
                if let Some(tx) = &record.pending {
                    tx.request().set_form_body(body);
                }
                self.dispatch_request(State::ResponseHeadersUserWait)
            }
            State::RequestBodyMultiPart => {
                if let Some(mut multipart) = record.multipart.take() {
                    if let Err(e) = drain_parts(&mut multipart, true) {
                        return Ok(self.fail(&e));
                    }
                    if let Some(tx) = &record.pending {
                        tx.request().set_upload(multipart.upload);
                    }
                }
                self.dispatch_request(State::ResponseHeadersUserWait)
            }
            _ => State::SendResponseHeaders,
        })
    }


    async fn wait_body_consumer(&mut self) -> io::Result<State> {
        enum Event {
            BufferDone,
            Command(Option<Command>),
        }

        let current = State::RequestBodyUserWait;
        let Some(record) = self.tx.as_mut() else {
            return Ok(State::Closed);
        };
        let tx_token = record.signals.token().clone();

        let event = select! {
            biased;
            () = self.shutdown.cancelled() => return Err(aborted("server shutting down")),
            () = tx_token.cancelled() => return Err(aborted("transaction canceled")),
            () = buffer_completed(&mut record.buffer_done) => Event::BufferDone,
            command = record.commands.recv() => Event::Command(command),
        };

        Ok(match event {
            Event::BufferDone => {
                record.buffer_done = None;
                if record.remaining > 0 {
                    State::RequestBodyUserRead
                } else {
                    trace!(peer = %self.peer, "request body consumed");
                    State::ResponseHeadersUserWait
                }
            }
            Event::Command(Some(Command::BeginRequestBody { buffers, reply })) => {
                if record.stream_started {
                    let _ = reply.send(Err(HttpError::already_started("request body stream")));
                    current
                } else {
                    record.stream_started = true;
                    record.body_sender = Some(buffers);
                    let _ = reply.send(Ok(()));
                    State::RequestBodyUserRead
                }
            }
            Event::Command(Some(Command::BeginResponse { head, on_done, reply })) => {
                self.start_response(head, on_done, Some(reply), current, false)
            }
            Event::Command(Some(Command::Abort)) => State::Closed,
            Event::Command(Some(Command::ContinueHandled)) => current,
            Event::Command(Some(command)) => self.reject(command, current),
            Event::Command(None) => self.abandoned(current),
        })
    }

    /// Reads one buffer of a streamed body and hands it to the consumer.
    async fn read_body_buffer(&mut self) -> io::Result<State> {
        if self.read_buf.is_empty() && self.read_more().await? == 0 {
            debug!(peer = %self.peer, "peer closed in the middle of a request body");
            return Ok(State::Closed);
        }

        let Some(record) = self.tx.as_mut() else {
            return Ok(State::Closed);
        };

        let take = usize::try_from(record.remaining).map_or(self.read_buf.len(), |remaining| min(remaining, self.read_buf.len()));
        let data = self.read_buf.split_to(take).freeze();
        record.remaining -= take as u64;
        let is_last = record.remaining == 0;

        let (buffer, done) = RequestBuffer::new(data, is_last);
        record.buffer_done = Some(done);
        if let Some(sender) = record.body_sender.as_mut()
            && sender.try_send(buffer).is_err()
        {
            trace!(peer = %self.peer, "body consumer gone, discarding");
        }
        if is_last {
            record.body_sender = None;
        }

        Ok(State::RequestBodyUserWait)
    }


    async fn wait_response_start(&mut self) -> io::Result<State> {
        let current = State::ResponseHeadersUserWait;
        let command = self.next_command().await?;

        Ok(match command {
            Some(Command::BeginResponse { head, on_done, reply }) => self.start_response(head, on_done, Some(reply), current, false),
            Some(Command::BeginRequestBody { reply, .. }) if self.tx.as_ref().is_some_and(|record| record.stream_started) => {
                let _ = reply.send(Err(HttpError::already_started("request body stream")));
                current
            }
            Some(Command::Abort) => State::Closed,
            Some(Command::ContinueHandled) => current,
            Some(command) => self.reject(command, current),
            None => self.abandoned(current),
        })
    }

    /// The handler dropped the transaction without responding.
    fn abandoned(&mut self, current: State) -> State {
        warn!(peer = %self.peer, "transaction dropped without a response");
        self.auto_respond(StatusCode::INTERNAL_SERVER_ERROR, current)
    }

    fn auto_respond(&mut self, status: StatusCode, current: State) -> State {
        let http10 = self.tx.as_ref().is_some_and(|record| record.http10);
        let mut head = ResponseHead::new(status, http10);
        head.headers.set_content_length(Some(0));
        self.start_response(head, None, None, current, true)
    }

    /// Frames and encodes a response head.
    ///
    /// Decides keep-alive and body framing; a request body the handler left
    /// unread is discarded before the head goes out.
    fn start_response(
        &mut self,
        mut head: ResponseHead,
        on_done: Option<DoneCallback>,
        reply: Option<Reply>,
        current: State,
        auto_response: bool,
    ) -> State {
        let Some(record) = self.tx.as_mut() else {
            return State::Closed;
        };

        if record.response_started {
            if let Some(reply) = reply {
                let _ = reply.send(Err(HttpError::already_started("response")));
            }
            return current;
        }

        let length = match head.headers.content_length() {
            Ok(length) => length,
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e.into()));
                }
                return current;
            }
        };

        if current == State::Send100ContinueUserWait {
            // rejected before the body was requested, it is never read
            record.pending = None;
            record.remaining = 0;
            record.close_after = true;
        }

        if record.http10 {
            if record.keep_alive_requested && !record.close_after && length.is_some() {
                head.headers.set_unchecked(CONNECTION, "keep-alive");
            } else {
                record.close_after = true;
            }
        } else if record.close_after {
            head.headers.set_connection_close(true);
        }

        let size = PayloadSize::for_response(length, record.http10);
        match size {
            PayloadSize::UntilClose => record.close_after = true,
            PayloadSize::Chunked => head.headers.set_chunked_encoding(),
            PayloadSize::Length(_) | PayloadSize::Empty => {}
        }
        let size = if record.is_head { PayloadSize::Empty } else { size };
        record.encoder = size.into();

        self.write_buf.clear();
        if let Err(e) = ResponseHeadEncoder.encode(&head, &mut self.write_buf) {
            error!(peer = %self.peer, cause = %e, "can't encode response head");
            return State::Closed;
        }

        debug!(peer = %self.peer, status = head.status.as_u16(), ?size, "response started");
        record.response_started = true;
        record.auto_response = auto_response;
        record.on_done = on_done;
        record.reply = reply;

        if current == State::RequestBodyUserWait && record.remaining > 0 {
            record.body_sender = None;
            record.buffer_done = None;
            trace!(peer = %self.peer, remaining = record.remaining, "discarding unread request body");
            State::RequestBodyDump
        } else {
            State::SendResponseHeaders
        }
    }

    async fn write_response_head(&mut self) -> io::Result<State> {
        self.flush_out().await?;

        if self.tx.as_ref().is_some_and(|record| record.auto_response) {
            return Ok(self.complete());
        }
        self.answer(Ok(()));
        Ok(State::ResponseBodyUserWait)
    }

    async fn wait_response_body(&mut self) -> io::Result<State> {
        let current = State::ResponseBodyUserWait;
        let Some(command) = self.next_command().await? else {
            debug!(peer = %self.peer, "response body abandoned before completion");
            return Ok(State::Closed);
        };

        Ok(match command {
            Command::ResponseBuffer { data, is_last, reply } => self.encode_body(data, is_last, reply),
            Command::BeginResponse { reply, .. } => {
                let _ = reply.send(Err(HttpError::already_started("response")));
                current
            }
            Command::Abort => State::Closed,
            Command::ContinueHandled => current,
            command => self.reject(command, current),
        })
    }

    fn encode_body(&mut self, data: Bytes, is_last: bool, reply: Reply) -> State {
        let Some(record) = self.tx.as_mut() else {
            return State::Closed;
        };

        let mut encoded = record.encoder.encode(PayloadItem::Chunk(data), &mut self.write_buf);
        if encoded.is_ok() && is_last {
            encoded = record.encoder.encode(PayloadItem::<Bytes>::Eof, &mut self.write_buf);
        }

        match encoded {
            Ok(()) => {
                record.reply = Some(reply);
                if is_last { State::SendResponseBodyLast } else { State::SendResponseBody }
            }
            Err(e) => {
                error!(peer = %self.peer, cause = %e, "response body doesn't match its framing");
                let _ = reply.send(Err(e.into()));
                State::Closed
            }
        }
    }

    async fn write_response_body(&mut self, is_last: bool) -> io::Result<State> {
        self.flush_out().await?;
        self.answer(Ok(()));

        Ok(if is_last { self.complete() } else { State::ResponseBodyUserWait })
    }

    /// Ends the exchange after the last write; keeps the connection for the next request unless told to close.
    fn complete(&mut self) -> State {
        let Some(mut record) = self.tx.take() else {
            return State::Closed;
        };

        record.signals.release();
        if let Some(on_done) = record.on_done.take() {
            self.dispatcher.dispatch_fn(on_done);
        }
        debug!(peer = %self.peer, keep_alive = !record.close_after, "transaction completed");

        if record.close_after { State::Closed } else { State::RequestHeaders }
    }


    fn set_reply(&mut self, reply: Reply) {
        if let Some(record) = self.tx.as_mut() {
            record.reply = Some(reply);
        }
    }

    fn answer(&mut self, result: Result<(), HttpError>) {
        if let Some(reply) = self.tx.as_mut().and_then(|record| record.reply.take()) {
            let _ = reply.send(result);
        }
    }

    fn reject(&self, command: Command, current: State) -> State {
        let operation = command.name();
        warn!(peer = %self.peer, operation, state = ?current, "operation not allowed in this state");
        command.reject(HttpError::invalid_state(operation, current));
        current
    }
}

/// Moves decoded parts into the upload; at `eof` the closing boundary must have been seen.
fn drain_parts(multipart: &mut MultipartBody, eof: bool) -> Result<(), ParseError> {
    loop {
        let part = if eof {
            multipart.decoder.decode_eof(&mut multipart.buffer)?
        } else {
            multipart.decoder.decode(&mut multipart.buffer)?
        };
        let Some(part) = part else {
            return Ok(());
        };
        add_part(&mut multipart.upload, part, &multipart.charset);
    }
}

fn add_part(upload: &mut FormUpload, part: MultipartPart, charset: &str) {
    match part.filename {
        Some(file_name) => {
            let file = UploadedFile::new(part.name.clone(), file_name, part.content_type, part.data);
            upload.files.insert(part.name, file);
        }
        None => {
            let value = decode_text(&part.data, charset);
            upload.fields.push((part.name, value));
        }
    }
}

async fn canceled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled_owned().await,
        None => std::future::pending().await,
    }
}

/// Resolves once the handed out buffer is completed or dropped.
async fn buffer_completed(done: &mut Option<body_oneshot::Receiver<()>>) {
    match done {
        Some(done) => {
            let _ = done.await;
        }
        None => std::future::pending().await,
    }
}

fn aborted(reason: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, make_handler};
    use crate::server::{Dispatch, ServerConfig};
    use indoc::indoc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn crlf(text: &str) -> String {
        text.replace('\n', "\r\n")
    }

    struct Harness {
        server: Arc<ServerShared>,
        dispatcher: Dispatcher,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(ServerConfig::default())
        }

        fn with_config(config: ServerConfig) -> Self {
            Self { server: Arc::new(ServerShared::new(config)), dispatcher: Dispatcher::new(Dispatch::ThreadPool) }
        }

        fn on_request<H: Handler>(self, handler: H) -> Self {
            self.server.set_request_handler(Some(Arc::new(handler)));
            self
        }

        fn on_continue<H: Handler>(self, handler: H) -> Self {
            self.server.set_continue_handler(Some(Arc::new(handler)));
            self
        }

        fn connect(&self) -> (DuplexStream, CancellationToken, tokio::task::JoinHandle<()>) {
            let (client, socket) = tokio::io::duplex(64 * 1024);
            let token = CancellationToken::new();
            let connection = HttpConnection::new(
                socket,
                SocketAddr::from(([127, 0, 0, 1], 5000)),
                Arc::clone(&self.server),
                self.dispatcher.clone(),
                token.clone(),
            )
            .unwrap();
            (client, token, tokio::spawn(connection.run()))
        }
    }

    async fn read_exact_str(client: &mut DuplexStream, len: usize) -> String {
        let mut buf = vec![0; len];
        timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
        String::from_utf8(buf).unwrap()
    }

    async fn read_to_close(client: &mut DuplexStream) -> String {
        let mut buf = Vec::new();
        timeout(WAIT, client.read_to_end(&mut buf)).await.unwrap().unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn hello() -> impl Handler {
        make_handler(|tx: Transaction| async move {
            let body = format!("hello {}", tx.request().path());
            tx.response().respond(StatusCode::OK, body).await
        })
    }

    #[tokio::test]
    async fn responds_and_keeps_alive() {
        let harness = Harness::new().on_request(hello());
        let (mut client, _token, _task) = harness.connect();

        for path in ["/a", "/b"] {
            client.write_all(format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes()).await.unwrap();
            let expected = crlf(&format!("HTTP/1.1 200 OK\nContent-Length: 8\n\nhello {path}"));
            assert_eq!(read_exact_str(&mut client, expected.len()).await, expected);
        }
    }

    #[tokio::test]
    async fn empty_body_dispatches_the_handler_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let harness = Harness::new().on_request(make_handler(move |tx: Transaction| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                let request = tx.request();
                let body = format!("{}|{}|{}", request.content_length(), request.is_streaming_body(), request.form_body().is_none());
                tx.response().respond(StatusCode::OK, body).await
            }
        }));
        let (mut client, _token, task) = harness.connect();

        let request = crlf(indoc! {"
            POST /empty HTTP/1.1
            Content-Type: application/x-www-form-urlencoded
            Content-Length: 0
            Connection: close

        "});
        client.write_all(request.as_bytes()).await.unwrap();

        let response = read_to_close(&mut client).await;
        assert!(response.ends_with("\r\n\r\n0|false|true"), "{response}");
        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keep_alive_starts_each_exchange_fresh() {
        let done = Arc::new(AtomicUsize::new(0));
        let canceled = Arc::new(AtomicUsize::new(0));
        let (done_seen, canceled_seen) = (Arc::clone(&done), Arc::clone(&canceled));
        let harness = Harness::new().on_request(make_handler(move |tx: Transaction| {
            let done = Arc::clone(&done_seen);
            let canceled = Arc::clone(&canceled_seen);
            async move {
                let request = tx.request();
                if request.path() == "/first" {
                    tx.on_canceled(move || {
                        canceled.fetch_add(1, Ordering::SeqCst);
                    });
                    tx.response().set_header("X-First", "yes")?;
                    tx.response().set_content_length(Some(5));
                    let mut writer = tx
                        .response()
                        .begin_response_with_done(StatusCode::OK, move || {
                            done.fetch_add(1, Ordering::SeqCst);
                        })
                        .await?;
                    writer.write_last("first").await?;
                } else {
                    let body = format!(
                        "{}|{}|{}",
                        request.headers().get("X-Token").unwrap_or("-"),
                        request.headers().len(),
                        tx.response().header("X-First").unwrap_or_else(|| "-".to_string())
                    );
                    tx.response().respond(StatusCode::OK, body).await?;
                }
                Ok::<_, HttpError>(())
            }
        }));
        let (mut client, _token, task) = harness.connect();

        client.write_all(b"GET /first HTTP/1.1\r\nX-Token: one\r\nCookie: a=1\r\n\r\n").await.unwrap();
        let expected = crlf("HTTP/1.1 200 OK\nX-First: yes\nContent-Length: 5\n\nfirst");
        assert_eq!(read_exact_str(&mut client, expected.len()).await, expected);

        client.write_all(b"GET /second HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let response = read_to_close(&mut client).await;
        assert!(response.ends_with("\r\n\r\n-|1|-"), "{response}");
        assert!(!response.contains("X-First"), "{response}");
        timeout(WAIT, task).await.unwrap().unwrap();

        timeout(WAIT, async {
            while done.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(canceled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let harness = Harness::new().on_request(hello());
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let expected = crlf(indoc! {"
            HTTP/1.1 200 OK
            Content-Length: 8

            hello /1HTTP/1.1 200 OK
            Content-Length: 8
            Connection: close

            hello /2"});
        assert_eq!(read_to_close(&mut client).await, expected);
    }

    #[tokio::test]
    async fn missing_handler_answers_404() {
        let harness = Harness::new();
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        assert_eq!(
            read_to_close(&mut client).await,
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn protocol_errors_fail_and_close() {
        let cases: [(&[u8], &str); 5] = [
            (b"GET /\r\n\r\n", "505 HTTP Version Not Supported"),
            (b"GET / FTP/1.1\r\n\r\n", "505 HTTP Version Not Supported"),
            (b"PATCH / HTTP/1.1\r\n\r\n", "501 Not Implemented"),
            (b"GET / HTTP/1.1\r\nno colon here\r\n\r\n", "400 Bad Request"),
            (b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n", "501 Not Implemented"),
        ];

        for (request, status) in cases {
            let harness = Harness::new().on_request(hello());
            let (mut client, _token, _task) = harness.connect();
            client.write_all(request).await.unwrap();
            assert_eq!(read_to_close(&mut client).await, format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\n\r\n"));
        }
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let config = ServerConfig { max_header_size: 64, ..ServerConfig::default() };
        let harness = Harness::with_config(config).on_request(hello());
        let (mut client, _token, _task) = harness.connect();

        let request = format!("GET / HTTP/1.1\r\nX-Long: {}\r\n\r\n", "a".repeat(100));
        client.write_all(request.as_bytes()).await.unwrap();
        assert!(read_to_close(&mut client).await.starts_with("HTTP/1.1 431 "));
    }

    #[tokio::test]
    async fn urlencoded_form_is_parsed_before_dispatch() {
        let harness = Harness::new().on_request(make_handler(|tx: Transaction| async move {
            let post = tx.request().post_data();
            let body = format!("{}|{}|{}", post.get("a").unwrap_or("-"), post.get("b").unwrap_or("-"), post.get("c").unwrap_or("-"));
            tx.response().respond(StatusCode::OK, body).await
        }));
        let (mut client, _token, _task) = harness.connect();

        let request = crlf(indoc! {"
            POST /form HTTP/1.1
            Content-Type: application/x-www-form-urlencoded
            Content-Length: 17
            Connection: close

        "}) + "a=1&b=x+y&c=a%20b";
        client.write_all(&request.as_bytes()[..30]).await.unwrap();
        client.write_all(&request.as_bytes()[30..]).await.unwrap();

        let response = read_to_close(&mut client).await;
        assert!(response.ends_with("\r\n\r\n1|x y|a b"), "{response}");
    }

    #[tokio::test]
    async fn multipart_upload_is_decoded() {
        let harness = Harness::new().on_request(make_handler(|tx: Transaction| async move {
            let request = tx.request();
            let file = request.file("doc").map(|f| format!("{}:{}", f.name(), String::from_utf8_lossy(f.contents())));
            let body = format!("{}|{}", request.post_data().get("title").unwrap_or("-"), file.unwrap_or_default());
            tx.response().respond(StatusCode::OK, body).await
        }));
        let (mut client, _token, _task) = harness.connect();

        let body = crlf(indoc! {r#"
            --XyZ
            Content-Disposition: form-data; name="title"

            hi there
            --XyZ
            Content-Disposition: form-data; name="doc"; filename="a.txt"
            Content-Type: text/plain

            file body
            --XyZ--
        "#});
        let head = format!(
            "POST /up HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=XyZ\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        client.write_all(head.as_bytes()).await.unwrap();
        for piece in body.as_bytes().chunks(7) {
            client.write_all(piece).await.unwrap();
        }

        let response = read_to_close(&mut client).await;
        assert!(response.ends_with("hi there|a.txt:file body"), "{response}");
    }

    #[tokio::test]
    async fn streamed_body_is_delivered_with_backpressure() {
        let config = ServerConfig { read_buffer_size: 4, ..ServerConfig::default() };
        let harness = Harness::with_config(config).on_request(make_handler(|tx: Transaction| async move {
            assert!(tx.request().is_streaming_body());
            let mut stream = tx.request().begin_streaming_body().await?;
            let mut received = Vec::new();
            let mut last_seen = false;
            while let Some(buffer) = stream.next_buffer().await {
                last_seen = buffer.is_last();
                received.extend_from_slice(buffer.data());
                buffer.complete();
            }
            assert!(last_seen);
            assert!(matches!(tx.request().begin_streaming_body().await, Err(HttpError::AlreadyStarted { .. })));
            tx.response().respond(StatusCode::OK, received).await
        }));
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"PUT /raw HTTP/1.1\r\nContent-Length: 10\r\nConnection: close\r\n\r\n0123456789").await.unwrap();
        let response = read_to_close(&mut client).await;
        assert!(response.ends_with("\r\n\r\n0123456789"), "{response}");
    }

    #[tokio::test]
    async fn unread_body_is_discarded_before_the_next_request() {
        let harness = Harness::new().on_request(hello());
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"PUT /first HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcdeGET /second HTTP/1.1\r\n\r\n").await.unwrap();
        let first = crlf("HTTP/1.1 200 OK\nContent-Length: 12\n\nhello /first");
        let second = crlf("HTTP/1.1 200 OK\nContent-Length: 13\n\nhello /second");
        assert_eq!(read_exact_str(&mut client, first.len() + second.len()).await, first + &second);
    }

    #[tokio::test]
    async fn chunked_response_without_length() {
        let harness = Harness::new().on_request(make_handler(|tx: Transaction| async move {
            let mut writer = tx.response().begin_response(StatusCode::OK).await?;
            writer.write("hello").await?;
            writer.write("").await?;
            writer.write_last("world").await
        }));
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let expected = crlf(indoc! {"
            HTTP/1.1 200 OK
            Connection: close
            Transfer-Encoding: chunked

            5
            hello
            5
            world
            0

        "});
        assert_eq!(read_to_close(&mut client).await, expected);
    }

    #[tokio::test]
    async fn http10_without_length_is_delimited_by_close() {
        let harness = Harness::new().on_request(make_handler(|tx: Transaction| async move {
            let mut writer = tx.response().begin_response(StatusCode::OK).await?;
            writer.write("abc").await?;
            writer.finish().await
        }));
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").await.unwrap();
        assert_eq!(read_to_close(&mut client).await, "HTTP/1.0 200 OK\r\n\r\nabc");
    }

    #[tokio::test]
    async fn http10_keep_alive_with_length() {
        let harness = Harness::new().on_request(hello());
        let (mut client, _token, _task) = harness.connect();

        for _ in 0..2 {
            client.write_all(b"GET /k HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").await.unwrap();
            let expected = crlf("HTTP/1.0 200 OK\nContent-Length: 8\nConnection: keep-alive\n\nhello /k");
            assert_eq!(read_exact_str(&mut client, expected.len()).await, expected);
        }
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let harness = Harness::new().on_request(hello());
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"HEAD /x HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        assert_eq!(read_to_close(&mut client).await, "HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: close\r\n\r\n");
    }

    #[tokio::test]
    async fn head_response_without_length_keeps_chunked_headers_only() {
        let harness = Harness::new().on_request(make_handler(|tx: Transaction| async move {
            tx.response().set_content_length(None);
            let mut writer = tx.response().begin_response(StatusCode::OK).await?;
            writer.write_last("dropped").await
        }));
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"HEAD /x HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let response = read_to_close(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("Transfer-Encoding: chunked\r\n"), "{response}");
        assert!(response.ends_with("\r\n\r\n"), "{response}");
        assert!(!response.contains("dropped") && !response.contains("\r\n0\r\n"), "{response}");
    }

    #[tokio::test]
    async fn content_length_overrun_closes_the_connection() {
        let (result_tx, result_rx) = oneshot::channel();
        let result_tx = std::sync::Mutex::new(Some(result_tx));
        let harness = Harness::new().on_request(make_handler(move |tx: Transaction| {
            let result_tx = result_tx.lock().unwrap().take();
            async move {
                tx.response().set_content_length(Some(3));
                let mut writer = tx.response().begin_response(StatusCode::OK).await?;
                let result = writer.write("too long").await;
                if let Some(result_tx) = result_tx {
                    let _ = result_tx.send(result);
                }
                Ok::<_, HttpError>(())
            }
        }));
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(read_to_close(&mut client).await, "HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n");
        let result = timeout(WAIT, result_rx).await.unwrap().unwrap();
        assert!(matches!(result, Err(HttpError::ResponseError { .. })));
    }

    #[tokio::test]
    async fn dropped_transaction_gets_500() {
        let harness = Harness::new().on_request(make_handler(|_tx: Transaction| async move { Ok::<_, HttpError>(()) }));
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        assert_eq!(
            read_to_close(&mut client).await,
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn expect_continue_without_handler_sends_continue() {
        let harness = Harness::new().on_request(make_handler(|tx: Transaction| async move {
            let body = tx.request().begin_streaming_body().await?.collect_bytes().await?;
            tx.response().respond(StatusCode::OK, body).await
        }));
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"PUT / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 4\r\nConnection: close\r\n\r\n").await.unwrap();
        assert_eq!(read_exact_str(&mut client, CONTINUE_RESPONSE.len()).await.as_bytes(), CONTINUE_RESPONSE);

        client.write_all(b"data").await.unwrap();
        assert!(read_to_close(&mut client).await.ends_with("\r\n\r\ndata"));
    }

    #[tokio::test]
    async fn continue_handler_can_reject() {
        let harness = Harness::new()
            .on_request(hello())
            .on_continue(make_handler(|tx: Transaction| async move { tx.response().respond_empty(StatusCode::EXPECTATION_FAILED).await }));
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"PUT / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n").await.unwrap();
        assert_eq!(
            read_to_close(&mut client).await,
            "HTTP/1.1 417 Expectation Failed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn continue_handler_returning_accepts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let harness = Harness::new()
            .on_request(make_handler(|tx: Transaction| async move {
                let body = tx.request().begin_streaming_body().await?.collect_bytes().await?;
                tx.response().respond(StatusCode::OK, body).await
            }))
            .on_continue(make_handler(move |_tx: Transaction| {
                seen.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, HttpError>(()) }
            }));
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"PUT / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\nConnection: close\r\n\r\n").await.unwrap();
        assert_eq!(read_exact_str(&mut client, CONTINUE_RESPONSE.len()).await.as_bytes(), CONTINUE_RESPONSE);
        client.write_all(b"ok").await.unwrap();
        assert!(read_to_close(&mut client).await.ends_with("\r\n\r\nok"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn done_callback_and_invalid_state() {
        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = std::sync::Mutex::new(Some(done_tx));
        let harness = Harness::new().on_request(make_handler(move |tx: Transaction| {
            let done_tx = done_tx.lock().unwrap().take();
            async move {
                let mut writer = tx
                    .response()
                    .begin_response_with_done(StatusCode::OK, move || {
                        if let Some(done_tx) = done_tx {
                            let _ = done_tx.send(());
                        }
                    })
                    .await?;
                let err = tx.request().send_100_continue().await.unwrap_err();
                assert!(matches!(err, HttpError::InvalidState { state: State::ResponseBodyUserWait, .. }));
                writer.write_last("x").await
            }
        }));
        let (mut client, _token, _task) = harness.connect();

        client.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        assert!(read_to_close(&mut client).await.ends_with("1\r\nx\r\n0\r\n\r\n"));
        timeout(WAIT, done_rx).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_disconnect_cancels_the_transaction() {
        let (canceled_tx, canceled_rx) = oneshot::channel();
        let canceled_tx = std::sync::Mutex::new(Some(canceled_tx));
        let harness = Harness::new().on_request(make_handler(move |tx: Transaction| {
            let canceled_tx = canceled_tx.lock().unwrap().take();
            async move {
                tx.on_canceled(move || {
                    if let Some(canceled_tx) = canceled_tx {
                        let _ = canceled_tx.send(());
                    }
                });
                let mut stream = tx.request().begin_streaming_body().await?;
                while stream.next_buffer().await.is_some() {}
                tx.canceled().await;
                assert!(tx.response().respond_empty(StatusCode::OK).await.is_ok());
                Ok::<_, HttpError>(())
            }
        }));
        let (mut client, _token, task) = harness.connect();

        client.write_all(b"PUT / HTTP/1.1\r\nContent-Length: 100\r\n\r\npartial").await.unwrap();
        drop(client);

        timeout(WAIT, canceled_rx).await.unwrap().unwrap();
        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(harness.server.connection_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_token_closes_idle_connection() {
        let harness = Harness::new().on_request(hello());
        let (mut client, token, task) = harness.connect();

        token.cancel();
        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(read_to_close(&mut client).await, "");
    }
}
