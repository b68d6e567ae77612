//! Request dispatch: scope resolution, forwarding with deadlines, and the
//! normalized result envelope.

pub mod dispatcher;
pub mod errors;
pub mod types;

pub use dispatcher::Dispatcher;
pub use errors::{DispatchError, ErrorKind};
pub use types::{CallFailure, CallOutcome, CallRequest, ResultEnvelope, Scope};
