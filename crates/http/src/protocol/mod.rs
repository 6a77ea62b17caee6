//! Request and response model of the server.
//!
//! - **Exchange**: a [`Transaction`] pairs a [`Request`] with its
//!   [`Response`] and carries cancellation
//! - **Bodies** ([`body`]): [`RequestBodyStream`] for streamed request bodies and
//!   [`ResponseBodyWriter`] for incremental responses
//! - **Headers** ([`headers`]): [`HttpHeaders`], an ordered, case-insensitive
//!   header list with typed accessors, plus [`HttpRange`] and [`HttpContentRange`]
//! - **Form data** ([`DataDictionary`]): query strings, url-encoded bodies and
//!   cookies, with `name[]` lists and `name[key]` maps
//! - **Cookies** ([`HttpCookie`]): `Set-Cookie` values
//! - **Errors**: [`HttpError`] wrapping [`ParseError`],
//!   [`SendError`] and [`HeaderError`]

mod message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub(crate) use request::FormUpload;
pub use request::{Request, RequestHead, UploadedFile};

mod response;
pub(crate) use response::DoneCallback;
pub use response::{Response, ResponseHead};

mod transaction;
pub(crate) use transaction::TxSignals;
pub use transaction::Transaction;

mod error;
pub use error::CookieError;
pub use error::HeaderError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;

pub mod headers;
pub use headers::{HttpHeaders, get_attribute};

mod range;
pub use range::{HttpContentRange, HttpRange};

mod data;
pub use data::{DataDictionary, DataValue};

mod cookie;
pub use cookie::{HttpCookie, parse_cookie_header};

pub mod url;

pub mod body;
pub use body::{RequestBodyStream, RequestBuffer, ResponseBodyWriter};
