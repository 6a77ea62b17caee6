use bytes::Bytes;
use futures::channel::mpsc as body_mpsc;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{DoneCallback, HttpError, RequestBuffer, ResponseHead};

pub(crate) type Reply<T = ()> = oneshot::Sender<Result<T, HttpError>>;

/// Requests from the application side of a transaction to its connection.
pub(crate) enum Command {
    /// Send the interim `100 Continue`
    Send100Continue { reply: Reply },
    /// The expect-continue handler returned
    ContinueHandled,
    /// Start delivering the streamed request body into `buffers`
    BeginRequestBody { buffers: body_mpsc::Sender<RequestBuffer>, reply: Reply },
    /// Write the status line and headers
    BeginResponse { head: ResponseHead, on_done: Option<DoneCallback>, reply: Reply },
    /// Write a response body buffer
    ResponseBuffer { data: Bytes, is_last: bool, reply: Reply },
    /// Tear the connection down
    Abort,
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::Send100Continue { .. } => "send_100_continue",
            Command::ContinueHandled => "continue_handled",
            Command::BeginRequestBody { .. } => "begin_streaming_body",
            Command::BeginResponse { .. } => "begin_response",
            Command::ResponseBuffer { .. } => "write_response_body",
            Command::Abort => "abort",
        }
    }

    /// Fails the command back to its caller.
    pub(crate) fn reject(self, error: HttpError) {
        let reply = match self {
            Command::Send100Continue { reply }
            | Command::BeginRequestBody { reply, .. }
            | Command::BeginResponse { reply, .. }
            | Command::ResponseBuffer { reply, .. } => reply,
            Command::ContinueHandled | Command::Abort => return,
        };
        let _ = reply.send(Err(error));
    }
}

/// The application's handle on a connection.
///
/// Every request, response and body writer of a transaction holds one. Once
/// all of them are dropped the connection sees its command channel close.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionLink {
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionLink {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        (Self { commands }, receiver)
    }

    /// Sends a command and waits for the connection's answer.
    ///
    /// Returns `None` when the connection is gone, operations are inert then.
    pub(crate) async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Option<Result<T, HttpError>> {
        let (reply, answer) = oneshot::channel();
        self.commands.send(command(reply)).ok()?;
        answer.await.ok()
    }

    pub(crate) fn notify(&self, command: Command) {
        let _ = self.commands.send(command);
    }
}
