pub mod command;
pub mod directory;
pub mod identity;
pub mod protocol;
pub mod publisher;
pub mod upload;

pub use command::{CommandEnvelope, LifecycleEvent, OutboundCommand};
pub use directory::{Credentials, Directory};
pub use identity::{AccessGrant, IdentityProvider};
pub use protocol::{DecodeError, InboundEnvelope};
pub use publisher::EventPublisher;
pub use upload::{MediaTransfer, UploadError, UploadSaga, UploadTicket};
