//! Object storage backends.

mod s3;

pub use s3::S3Storage;
