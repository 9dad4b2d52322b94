//! Error taxonomy for the codec core.
//!
//! Every fatal condition maps onto one of these kinds; recoverable
//! conditions (truncated tile-parts at end of stream, tier-1 integrity
//! failures) are reported through the event manager instead and the decode
//! continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// A demanded read could not be satisfied.
  #[error("unexpected end of stream")]
  UnexpectedEndOfStream,

  /// Marker id outside 0xFF00..=0xFFFF or encountered outside its allowed
  /// decoder state.
  #[error("invalid marker 0x{0:04x}")]
  InvalidMarker(u32),

  /// Box length < 8, or a box extending beyond its enclosing box.
  #[error("corrupt JP2 box: {0}")]
  CorruptJP2Box(String),

  /// Mandatory marker missing or declared sizes inconsistent.
  #[error("corrupt code-stream: {0}")]
  CorruptCodeStream(String),

  /// Declared tile-part length overruns the stream.
  #[error("corrupt tile-part: {0}")]
  CorruptTilePart(String),

  /// Tier-1 integrity check failed (segmentation symbol or predictable
  /// termination mismatch).
  #[error("corrupt code-block: {0}")]
  CorruptCodeBlock(&'static str),

  /// Tier-2 bit-stream exhausted mid-field.
  #[error("truncated packet header")]
  TruncatedPacketHeader,

  /// User parameters outside supported ranges.
  #[error("invalid configuration: {0}")]
  InvalidConfiguration(String),

  /// A sink or source callback reported failure.
  #[error("I/O callback failure")]
  IoFailure,
}

pub type Result<T> = core::result::Result<T, Error>;
