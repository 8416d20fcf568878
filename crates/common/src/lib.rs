//! Types shared by every crate in the image gateway workspace

mod error;
mod token;

pub use error::{Error, Result};
pub use token::{BearerToken, SCHEME};
