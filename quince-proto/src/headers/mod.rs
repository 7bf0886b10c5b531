//! Message headers
//!
//! Headers are sent with `HPUB`/`HMSG` as an HTTP-like block starting with
//! the `NATS/1.0` version line.

pub use self::map::HeaderMap;
pub use self::name::HeaderName;
pub use self::value::HeaderValue;

mod map;
mod name;
mod value;

pub mod error {
    pub use super::name::HeaderNameValidateError;
    pub use super::value::HeaderValueValidateError;
}
