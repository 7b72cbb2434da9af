//! hostlink-core: Shared protocol library for the hostlink gateway.
//!
//! Provides the JSON message envelope, the frame codec, request-target
//! parsing for upgrade requests, id generation, and the error taxonomy.

pub mod codec;
pub mod error;
pub mod ids;
pub mod messages;
pub mod target;

// Re-export commonly used items at crate root.
pub use codec::{decode_frame, encode_frame};
pub use error::{LinkError, LinkResult};
pub use ids::{generate_connection_id, generate_request_id};
pub use messages::{msg, Envelope};
pub use target::{parse_request_target, RequestTarget};
