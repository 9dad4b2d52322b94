//! JPEG 2000 (Part 1) codec core.
//!
//! The crate covers the code-stream both ways: marker layer, tier-2
//! packets, tier-1 block coding over the MQ coder, the 5/3 and 9/7
//! wavelets (whole-tile and windowed), and the JP2 box container. The
//! entry points are [`Compressor`] and [`Decompressor`].

#[macro_use]
mod event;

mod bio;
mod cache;
mod cio;
mod codec;
mod dwt;
mod error;
mod exec;
mod image;
mod index;
mod j2k;
mod jp2;
mod math;
mod mct;
mod mqc;
mod pi;
mod quant;
mod sparse;
mod t1;
mod t2;
mod tcd;
mod tgt;

pub use cache::{DecodedTile, StripSink, TileCache, TileRetention};
pub use codec::{
  CodecFormat, CompressParams, Compressor, DecompressParams, Decompressor, Profile, RateSpec,
};
pub use error::{Error, Result};
pub use event::{EventType, Events};
pub use exec::{CancelFlag, Executor, SingleThread};
pub use image::{ChannelDef, ColorSpace, ComponentParams, Image, ImageComponent, Palette};
pub use jp2::UuidBox;
pub use math::Rect;
pub use pi::ProgressionOrder;
pub use quant::{QuantStyle, StepSize};
pub use t1::CblkSty;
pub use tcd::{MctMode, Poc, RateControl};

/// Magic bytes of a JP2 file (RFC 3745).
pub const JP2_MAGIC: &[u8] = &[
  0x00, 0x00, 0x00, 0x0c, 0x6a, 0x50, 0x20, 0x20, 0x0d, 0x0a, 0x87, 0x0a,
];
/// Magic bytes of a raw code-stream: SOC immediately followed by SIZ.
pub const J2K_MAGIC: &[u8] = &[0xff, 0x4f, 0xff, 0x51];

/// Sniff the container from leading magic bytes.
pub fn detect_format(buf: &[u8]) -> Option<CodecFormat> {
  if jp2::is_jp2(buf) {
    Some(CodecFormat::Jp2)
  } else if buf.starts_with(J2K_MAGIC) {
    Some(CodecFormat::J2k)
  } else {
    None
  }
}

/// Sniff the container from a file extension.
pub fn detect_format_from_extension(ext: &str) -> Option<CodecFormat> {
  match ext.to_ascii_lowercase().as_str() {
    "jp2" => Some(CodecFormat::Jp2),
    "j2k" | "j2c" | "jpc" => Some(CodecFormat::J2k),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn format_detection() {
    assert_eq!(detect_format(JP2_MAGIC), Some(CodecFormat::Jp2));
    assert_eq!(detect_format(&[0xff, 0x4f, 0xff, 0x51, 0x00]), Some(CodecFormat::J2k));
    assert_eq!(detect_format(&[0x89, b'P', b'N', b'G']), None);
    assert_eq!(detect_format_from_extension("JP2"), Some(CodecFormat::Jp2));
    assert_eq!(detect_format_from_extension("j2c"), Some(CodecFormat::J2k));
    assert_eq!(detect_format_from_extension("png"), None);
  }
}
