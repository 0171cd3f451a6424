//! Domain entities - Objects with identity and lifecycle

mod command_request;
mod response_payload;
mod response_record;

pub use command_request::CommandRequest;
pub use response_payload::{FormatIndicator, ResponsePayload};
pub use response_record::{NewResponseRecord, ResponseRecord};
