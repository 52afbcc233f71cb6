//! # Veilmux
//!
//! A censorship-resistant stream-multiplexing engine: many logical byte
//! streams over a pool of interchangeable, obfuscated connections.
//!
//! ## Features
//!
//! - **Stream multiplexing** with in-order reassembly across connections
//! - **Frame obfuscation** under plain, AES-256-GCM or ChaCha20-Poly1305
//! - **Work-stealing dispatch** across a dynamic connection pool
//! - **Rate shaping** with a token-bucket valve
//! - **Deadline-driven** reads and writes with cooperative cancellation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Application Layer                   │
//! │        (open/accept streams, read/write bytes)       │
//! ├─────────────────────────────────────────────────────┤
//! │                    Session Layer                     │
//! │     (stream map, accept queue, lifecycle, timer)     │
//! ├─────────────────────────────────────────────────────┤
//! │                 Obfuscation Layer                    │
//! │        (frame codec, AEAD records, cipher suites)    │
//! ├─────────────────────────────────────────────────────┤
//! │                 Switchboard Layer                    │
//! │    (send/recv workers, record framing, rate valve)   │
//! ├─────────────────────────────────────────────────────┤
//! │               Underlying Connections                 │
//! │      (TLS-appearance wrappers, supplied by host)     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The handshake that establishes the 32-byte session key and the
//! TLS-appearance connection wrapper live outside this crate; a session
//! consumes any `AsyncRead + AsyncWrite` byte stream.

pub mod config;
pub mod crypto;
pub mod mux;
pub mod transport;

pub use config::Settings;
pub use crypto::{make_obfuscator, EncryptionMethod, Obfuscator};
pub use mux::{Closing, Frame, MuxError, Session, SessionConfig, Stream, Valve};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Mux error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Configuration error: {0}")]
    Config(String),
}
