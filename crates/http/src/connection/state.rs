use std::fmt;

/// Protocol phase of a connection.
///
/// Read and write states have exactly one socket operation in flight; the
/// `*UserWait` states do no I/O and wait for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Reading the request line and headers
    RequestHeaders,
    /// `Expect: 100-continue` seen, waiting for the expect-continue handler
    Send100ContinueUserWait,
    /// Writing `100 Continue`
    Send100Continue,
    /// Buffering a url-encoded form body
    RequestBodyFull,
    /// Discarding the rest of a body the handler didn't consume
    RequestBodyDump,
    /// Feeding a `multipart/form-data` body to the decoder
    RequestBodyMultiPart,
    /// Waiting for the handler to pull or complete a body buffer
    RequestBodyUserWait,
    /// Reading the next buffer of a streamed body
    RequestBodyUserRead,
    /// Waiting for the handler to start the response
    ResponseHeadersUserWait,
    SendResponseHeaders,
    /// Waiting for the next response buffer
    ResponseBodyUserWait,
    SendResponseBody,
    /// Writing the last buffer, then reset or close
    SendResponseBodyLast,
    /// Writing an error response, then close
    Failure,
    Closed,
}

impl State {
    /// True for the states that wait on the application rather than the socket.
    pub fn is_user_wait(self) -> bool {
        matches!(
            self,
            State::Send100ContinueUserWait
                | State::RequestBodyUserWait
                | State::ResponseHeadersUserWait
                | State::ResponseBodyUserWait
        )
    }

    /// States in which a response may be started.
    pub fn accepts_response(self) -> bool {
        matches!(self, State::Send100ContinueUserWait | State::RequestBodyUserWait | State::ResponseHeadersUserWait)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
