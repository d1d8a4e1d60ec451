pub mod dh;
pub mod ecies;
mod encoding;
pub mod ratchet;
pub use encoding::ParseKeyError;

fn redacted_debug<T>(_value: &T, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    formatter.write_str("REDACTED")
}
