//! End-to-end codec scenarios through the public API.

use jp2kit::{
  ChannelDef, CodecFormat, ColorSpace, ComponentParams, CompressParams, Compressor,
  DecompressParams, Decompressor, Error, Events, Image, MctMode, Profile, ProgressionOrder,
  RateSpec, StripSink,
};

fn make_image(w: u32, h: u32, numcomps: usize, prec: u32, sgnd: bool) -> Image {
  let params: Vec<ComponentParams> = (0..numcomps)
    .map(|_| ComponentParams {
      dx: 1,
      dy: 1,
      w: 0,
      h: 0,
      x0: 0,
      y0: 0,
      prec,
      sgnd,
    })
    .collect();
  let mut image = Image::new(0, 0, w, h, &params);
  image.alloc_components();
  let max = (1i64 << prec) - 1;
  let bias = if sgnd { 1i64 << (prec - 1) } else { 0 };
  for (c, comp) in image.comps.iter_mut().enumerate() {
    for y in 0..h as usize {
      for x in 0..w as usize {
        // A deterministic mix of gradient and texture.
        let v = (x as i64 * 3 + y as i64 * 7 + c as i64 * 13 + (x * y / 16) as i64) % (max + 1);
        comp.data[y * w as usize + x] = (v - bias) as i32;
      }
    }
  }
  image
}

fn lossless_params() -> CompressParams {
  CompressParams {
    format: CodecFormat::J2k,
    irreversible: false,
    num_resolutions: 5,
    mct: MctMode::Off,
    ..Default::default()
  }
}

fn compress(image: &Image, params: CompressParams) -> Vec<u8> {
  Compressor::new(params, Events::new())
    .unwrap()
    .compress(image)
    .unwrap()
}

fn decompress(data: &[u8]) -> Image {
  Decompressor::new(DecompressParams::default())
    .unwrap()
    .decompress(data)
    .unwrap()
}

#[test]
fn gradient_round_trip_is_bit_exact() {
  // A 32x32 synthetic gradient, one tile, one layer: byte-identical
  // samples after the round trip.
  let image = make_image(32, 32, 1, 8, false);
  let data = compress(&image, lossless_params());
  let decoded = decompress(&data);
  assert_eq!(decoded.comps.len(), 1);
  assert_eq!(decoded.comps[0].data, image.comps[0].data);
}

#[test]
fn lossless_across_depths_and_signs() {
  for &prec in &[8u32, 10, 12, 14, 16] {
    for &sgnd in &[false, true] {
      let image = make_image(41, 27, 1, prec, sgnd);
      let data = compress(&image, lossless_params());
      let decoded = decompress(&data);
      assert_eq!(
        decoded.comps[0].data, image.comps[0].data,
        "prec {} sgnd {}",
        prec, sgnd
      );
    }
  }
}

#[test]
fn lossless_rgb_with_reversible_mct() {
  let image = make_image(50, 40, 3, 8, false);
  let mut params = lossless_params();
  params.mct = MctMode::On;
  let data = compress(&image, params);
  let decoded = decompress(&data);
  for c in 0..3 {
    assert_eq!(decoded.comps[c].data, image.comps[c].data, "component {}", c);
  }
}

#[test]
fn lossless_multi_tile() {
  let image = make_image(100, 80, 3, 8, false);
  let mut params = lossless_params();
  params.tile_size = Some((48, 32));
  params.mct = MctMode::On;
  let data = compress(&image, params);
  let decoded = decompress(&data);
  for c in 0..3 {
    assert_eq!(decoded.comps[c].data, image.comps[c].data, "component {}", c);
  }
}

#[test]
fn lossless_every_progression_order() {
  let image = make_image(64, 48, 2, 8, false);
  for order in [
    ProgressionOrder::Lrcp,
    ProgressionOrder::Rlcp,
    ProgressionOrder::Rpcl,
    ProgressionOrder::Pcrl,
    ProgressionOrder::Cprl,
  ] {
    let mut params = lossless_params();
    params.progression = order;
    params.num_layers = 2;
    let data = compress(&image, params);
    let decoded = decompress(&data);
    for c in 0..2 {
      assert_eq!(
        decoded.comps[c].data, image.comps[c].data,
        "order {:?} component {}",
        order, c
      );
    }
  }
}

#[test]
fn deterministic_output() {
  let image = make_image(60, 60, 3, 8, false);
  let mut params = lossless_params();
  params.mct = MctMode::On;
  params.num_layers = 2;
  let a = compress(&image, params.clone());
  let b = compress(&image, params);
  assert_eq!(a, b);
}

#[test]
fn irreversible_keeps_high_fidelity() {
  let image = make_image(160, 120, 3, 8, false);
  let mut params = lossless_params();
  params.irreversible = true;
  params.mct = MctMode::On;
  let data = compress(&image, params);
  let decoded = decompress(&data);
  for c in 0..3 {
    let mut se = 0f64;
    for (a, b) in decoded.comps[c].data.iter().zip(&image.comps[c].data) {
      let d = f64::from(a - b);
      se += d * d;
    }
    let mse = se / image.comps[c].data.len() as f64;
    let psnr = 10.0 * (255.0f64 * 255.0 / mse.max(1e-12)).log10();
    assert!(psnr >= 40.0, "component {} PSNR {:.2} dB", c, psnr);
  }
}

#[test]
fn region_decode_matches_full_decode() {
  let image = make_image(128, 96, 1, 8, false);
  let mut params = lossless_params();
  params.tile_size = Some((64, 64));
  let data = compress(&image, params);
  let full = decompress(&data);

  for &(x0, y0, x1, y1) in &[(10u32, 10u32, 50u32, 40u32), (60, 30, 128, 96), (0, 0, 5, 5)] {
    let dec = Decompressor::new(DecompressParams {
      area: Some((x0, y0, x1, y1)),
      ..Default::default()
    })
    .unwrap();
    let windowed = dec.decompress(&data).unwrap();
    let comp = &windowed.comps[0];
    assert_eq!((comp.w, comp.h), (x1 - x0, y1 - y0));
    for y in 0..comp.h {
      for x in 0..comp.w {
        let want = full.comps[0].data[((y0 + y) * 128 + x0 + x) as usize];
        let got = comp.data[(y * comp.w + x) as usize];
        assert_eq!(got, want, "window ({},{},{},{}) at ({},{})", x0, y0, x1, y1, x, y);
      }
    }
  }
}

#[test]
fn reduced_resolution_tracks_downsampled_image() {
  // A smooth ramp: the 5/3 low band stays within a few grey levels of an
  // ideal 2:1 down-sampling.
  let w = 64u32;
  let h = 64u32;
  let mut image = make_image(w, h, 1, 8, false);
  for y in 0..h as usize {
    for x in 0..w as usize {
      image.comps[0].data[y * w as usize + x] = ((x + y) * 2) as i32 & 0xff;
    }
  }
  let data = compress(&image, lossless_params());
  let reduced = Decompressor::new(DecompressParams {
    reduce: 1,
    ..Default::default()
  })
  .unwrap()
  .decompress(&data)
  .unwrap();
  assert_eq!((reduced.comps[0].w, reduced.comps[0].h), (32, 32));
  for y in 0..32usize {
    for x in 0..32usize {
      let avg = (image.comps[0].data[2 * y * 64 + 2 * x]
        + image.comps[0].data[2 * y * 64 + 2 * x + 1]
        + image.comps[0].data[(2 * y + 1) * 64 + 2 * x]
        + image.comps[0].data[(2 * y + 1) * 64 + 2 * x + 1])
        / 4;
      let got = reduced.comps[0].data[y * 32 + x];
      assert!(
        (got - avg).abs() <= 4,
        "at ({}, {}): reduced {} vs averaged {}",
        x,
        y,
        got,
        avg
      );
    }
  }
}

#[test]
fn layer_capped_decode_still_works() {
  let image = make_image(64, 64, 1, 8, false);
  let mut params = lossless_params();
  params.num_layers = 4;
  // 0 = uncapped: the last layer completes the stream losslessly.
  params.rate = RateSpec::Ratios(vec![40.0, 20.0, 10.0, 0.0]);
  let data = compress(&image, params);
  let capped = Decompressor::new(DecompressParams {
    layers: 1,
    ..Default::default()
  })
  .unwrap()
  .decompress(&data)
  .unwrap();
  assert_eq!(capped.comps[0].data.len(), image.comps[0].data.len());
  // All layers restore the image exactly (final layer is lossless).
  let all = decompress(&data);
  assert_eq!(all.comps[0].data, image.comps[0].data);
}

#[test]
fn roi_shift_round_trips() {
  let image = make_image(48, 48, 1, 8, false);
  let mut params = lossless_params();
  params.roi_component = Some(0);
  params.roi_shift = 2;
  let data = compress(&image, params);
  let decoded = decompress(&data);
  assert_eq!(decoded.comps[0].data, image.comps[0].data);
}

#[test]
fn sop_eph_markers_round_trip() {
  let image = make_image(40, 40, 1, 8, false);
  let mut params = lossless_params();
  params.use_sop = true;
  params.use_eph = true;
  let data = compress(&image, params);
  assert!(data.windows(2).any(|w| w == [0xff, 0x91]), "stream has SOP");
  assert!(data.windows(2).any(|w| w == [0xff, 0x92]), "stream has EPH");
  let decoded = decompress(&data);
  assert_eq!(decoded.comps[0].data, image.comps[0].data);
}

#[test]
fn mode_switches_round_trip() {
  use jp2kit::CblkSty;
  let image = make_image(64, 48, 1, 8, false);
  for sty in [
    CblkSty::LAZY,
    CblkSty::TERMALL,
    CblkSty::VSC,
    CblkSty::SEGSYM,
    CblkSty::LAZY | CblkSty::TERMALL | CblkSty::SEGSYM,
  ] {
    let mut params = lossless_params();
    params.mode_flags = sty;
    let data = compress(&image, params);
    let decoded = decompress(&data);
    assert_eq!(decoded.comps[0].data, image.comps[0].data, "mode {:?}", sty);
  }
}

#[test]
fn custom_mct_matrix_round_trips() {
  // A permutation matrix is integer-exact both ways, so the reversible
  // path stays lossless through the array-based transform.
  let image = make_image(48, 32, 3, 8, false);
  let mut params = lossless_params();
  params.mct = MctMode::Custom;
  params.mct_matrix = Some(vec![
    0.0, 1.0, 0.0, //
    0.0, 0.0, 1.0, //
    1.0, 0.0, 0.0,
  ]);
  let data = compress(&image, params);
  assert!(data.windows(2).any(|w| w == [0xff, 0x74]), "stream has MCT");
  let decoded = decompress(&data);
  for c in 0..3 {
    assert_eq!(decoded.comps[c].data, image.comps[c].data, "component {}", c);
  }
}

#[test]
fn jp2_rgba_carries_channel_definitions() {
  let mut image = make_image(64, 64, 4, 8, false);
  image.color_space = ColorSpace::Srgb;
  image.channel_defs = vec![
    ChannelDef { channel: 0, typ: 0, assoc: 1 },
    ChannelDef { channel: 1, typ: 0, assoc: 2 },
    ChannelDef { channel: 2, typ: 0, assoc: 3 },
    ChannelDef { channel: 3, typ: 1, assoc: 0 },
  ];
  let mut params = lossless_params();
  params.format = CodecFormat::Jp2;
  params.mct = MctMode::Off;
  let data = compress(&image, params);
  assert_eq!(&data[..12], jp2kit::JP2_MAGIC);

  let decoded = decompress(&data);
  assert_eq!(decoded.comps.len(), 4);
  assert!(decoded.comps[3].alpha, "channel 3 declared as opacity");
  for c in 0..4 {
    assert_eq!(decoded.comps[c].data, image.comps[c].data, "component {}", c);
  }
}

#[test]
fn corrupt_sot_is_fatal_in_strict_mode() {
  let image = make_image(32, 32, 1, 8, false);
  let mut data = compress(&image, lossless_params());
  let sot = data
    .windows(2)
    .position(|w| w == [0xff, 0x90])
    .expect("stream has SOT");
  // Wreck the Psot field.
  data[sot + 6] = 0x7f;
  data[sot + 7] = 0xff;
  data[sot + 8] = 0xff;
  data[sot + 9] = 0xfe;
  let strict = Decompressor::new(DecompressParams {
    strict: true,
    ..Default::default()
  })
  .unwrap();
  match strict.decompress(&data) {
    Err(Error::CorruptTilePart(_)) | Err(Error::CorruptCodeStream(_)) => {}
    other => panic!("expected a fatal tile-part error, got {:?}", other.map(|_| ())),
  }
}

#[test]
fn undeclared_extra_tile_part_decodes_with_warning() {
  use std::cell::RefCell;
  use std::rc::Rc;

  let image = make_image(64, 64, 1, 8, false);
  let mut params = lossless_params();
  params.tp_flag = Some('R');
  let mut data = compress(&image, params);

  // Understate TNsot on every SOT: the decoder keeps reading the
  // undeclared parts and warns instead of failing.
  let mut i = 0;
  while i + 12 <= data.len() {
    if data[i] == 0xff && data[i + 1] == 0x90 {
      if data[i + 11] > 1 {
        data[i + 11] -= 1;
      }
      i += 12;
    } else {
      i += 1;
    }
  }

  let warnings = Rc::new(RefCell::new(Vec::new()));
  let sink = warnings.clone();
  let mut events = Events::new();
  events.set_warning_handler(move |msg| sink.borrow_mut().push(msg.to_string()));
  let dec = Decompressor::with_events(DecompressParams::default(), events).unwrap();
  let decoded = dec.decompress(&data).unwrap();
  assert_eq!(decoded.comps[0].data, image.comps[0].data);
  assert!(
    warnings.borrow().iter().any(|w| w.contains("tile-part")),
    "expected a tile-part warning, got {:?}",
    warnings.borrow()
  );
}

#[test]
fn cinema_profile_emits_cprl_single_tile() {
  let image = make_image(128, 72, 3, 12, false);
  let params = CompressParams {
    format: CodecFormat::J2k,
    profile: Profile::Cinema2k24,
    num_layers: 2,
    ..Default::default()
  };
  let data = compress(&image, params);
  // COD: marker, length, Scod, then the progression byte (CPRL = 4).
  let cod = data
    .windows(2)
    .position(|w| w == [0xff, 0x52])
    .expect("stream has COD");
  assert_eq!(data[cod + 5], 4, "progression is CPRL");
  assert_eq!(u16::from_be_bytes([data[cod + 6], data[cod + 7]]), 2, "two layers");
  // Single tile: exactly one SOT.
  let sots = data.windows(2).filter(|w| *w == [0xff, 0x90]).count();
  assert_eq!(sots, 1);
  let decoded = decompress(&data);
  assert_eq!(decoded.comps.len(), 3);
}

struct CollectingSink {
  rows: Vec<u32>,
  samples: Vec<i32>,
}

impl StripSink for CollectingSink {
  fn write(&mut self, first_row: u32, _num_rows: u32, planes: &[&[i32]]) -> bool {
    self.rows.push(first_row);
    self.samples.extend_from_slice(planes[0]);
    true
  }
}

#[test]
fn strip_sink_receives_rows_in_order() {
  let image = make_image(96, 64, 1, 8, false);
  let mut params = lossless_params();
  params.tile_size = Some((32, 32));
  let data = compress(&image, params);

  let mut sink = CollectingSink {
    rows: Vec::new(),
    samples: Vec::new(),
  };
  let dec = Decompressor::new(DecompressParams::default()).unwrap();
  let decoded = dec
    .decompress_into_sink(&data, &mut sink, 16, None)
    .unwrap();
  assert!(sink.rows.windows(2).all(|w| w[0] < w[1]), "strips in order");
  assert_eq!(sink.samples, image.comps[0].data);
  assert_eq!(decoded.comps[0].data, image.comps[0].data);
}

#[test]
fn truncated_stream_degrades_gracefully() {
  let image = make_image(64, 64, 1, 8, false);
  let data = compress(&image, lossless_params());
  let cut = data.len() * 3 / 4;
  let decoded = decompress(&data[..cut]);
  assert_eq!(decoded.comps[0].data.len(), 64 * 64);
}
