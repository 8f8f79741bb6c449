#![doc = include_str!("../README.md")]

pub mod authority;
pub mod context;
pub mod error;
pub mod events;
pub mod handshake;
#[cfg(feature = "middleware")]
pub mod middleware;
pub mod protocol;
pub mod secret;
pub mod token;
pub mod types;

// Re-exports for convenient access
pub use authority::{Authority, AuthorityConfig, HttpAuthority, InMemoryAuthority};
pub use context::SessionContext;
pub use error::{Error, ErrorKind};
pub use events::{EventName, ProcessEventLog, SessionEvent};
pub use handshake::{HandshakeCache, HandshakeInfo, SigningConfig};
pub use protocol::SessionProtocol;
pub use token::{AccessTokenClaims, PublicKey, extract_kid_from_token, parse_public_key_hex};
pub use types::{KeyId, Session, SessionHandle, Token, UserId};
