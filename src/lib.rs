pub mod archive;
pub mod bridge;
pub mod config;
pub mod dialer;
pub mod encrypt;
pub mod rendezvous;
pub mod socket;
pub mod strategy;
pub mod upnp;

use std::error::Error;
use std::fmt;

pub type AnyError = Box<dyn Error + Send + Sync>;

pub const ID_LEN: usize = 6; // 6 bytes, 8 base64 chars
pub const PSK_LEN: usize = 32; // for ChaCha20-Poly1305

pub const DEFAULT_SERVER: &str = "https://acp.deno.dev";

/// Marker error for a user-initiated abort. A cancelled transfer exits
/// with status 1 but prints no error message.
#[derive(Debug)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl Error for Cancelled {}

pub fn is_cancelled(err: &AnyError) -> bool {
    err.downcast_ref::<Cancelled>().is_some()
}
