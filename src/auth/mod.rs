//! Request signing for object storage (feature-gated).

pub mod sigv4;

pub use sigv4::{
    SigV4Headers, SigV4PresignedUrl, SigV4Signer, SigV4SigningResult, SigV4Timestamp, SigningError,
};
