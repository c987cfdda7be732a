//! MPEG-2 video elementary stream framer (C8).
//!
//! Consumes an unframed byte stream (one or more [`Uref`]s carrying a
//! [`Block`] view) and emits one [`Uref`] per coded frame, plus a
//! flow-definition uref whenever the sequence header changes.

use crate::error::ParseError;
use crate::octetstream::OctetStream;
use crate::pipe::{Command, Event, OutputFn, Pipe, ProbeChain, Reply};
use crate::ubuf::{Block, Ubuf};
use crate::udict::{BaseType, Dict};
use crate::uref::Uref;

const EXPECTED_FLOW_DEF: &str = "block.mpeg2video.";

const PIC_START_CODE: u8 = 0x00;
const PIC_LAST_CODE: u8 = 0xAF;
const SEQ_START_CODE: u8 = 0xB3;
const EXT_START_CODE: u8 = 0xB5;
const SEQ_END_CODE: u8 = 0xB7;
const GOP_START_CODE: u8 = 0xB8;

const EXT_ID_SEQ: u8 = 1;
const EXT_ID_SEQ_DISPLAY: u8 = 2;
const EXT_ID_PIC_CODING: u8 = 8;

const CODING_TYPE_I: u8 = 1;

const PICX_TOP_FIELD: u8 = 0b01;
const PICX_BOTTOM_FIELD: u8 = 0b10;
const PICX_FRAME: u8 = 0b11;

const ASPECT_SQUARE: u8 = 1;
const ASPECT_4_3: u8 = 2;
const ASPECT_16_9: u8 = 3;
const ASPECT_2_21: u8 = 4;

const CHROMA_420: u8 = 1;
const CHROMA_422: u8 = 2;
const CHROMA_444: u8 = 3;

const LEVEL_HIGH: u8 = 0b0100;
const LEVEL_HIGH1440: u8 = 0b0110;
const LEVEL_MAIN: u8 = 0b1000;
const LEVEL_LOW: u8 = 0b1010;

const SEQ_HEADER_SIZE: usize = 12;
const SEQ_EXT_HEADER_SIZE: usize = 10;
const SEQ_DISPLAY_HEADER_SIZE: usize = 9;
const SEQ_DISPLAY_COLOR_SIZE: usize = 3;
const PIC_HEADER_SIZE: usize = 8;
const GOP_HEADER_SIZE: usize = 8;
const PIC_EXT_HEADER_SIZE: usize = 9;

/// frame_rate_code (4 bits) -> (numerator, denominator). Index 0 and the
/// last two entries are reserved/unused.
const FRAME_RATE_TABLE: [(u64, u64); 16] = [
    (0, 0),
    (24000, 1001),
    (24, 1),
    (25, 1),
    (30000, 1001),
    (30, 1),
    (50, 1),
    (60000, 1001),
    (60, 1),
    (15000, 1001),
    (5000, 1001),
    (10000, 1001),
    (12000, 1001),
    (15000, 1001),
    (0, 0),
    (0, 0),
];

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a.max(1)
    } else {
        gcd(b, a % b)
    }
}

fn simplify(num: u64, den: u64) -> (u64, u64) {
    let g = gcd(num, den);
    (num / g, den / g)
}

fn aspect(code: u8, horizontal: u16, vertical: u16) -> Result<(i64, i64), ParseError> {
    let (n, d) = match code {
        ASPECT_SQUARE => (1, 1),
        ASPECT_4_3 => simplify(vertical as u64 * 4, horizontal as u64 * 3),
        ASPECT_16_9 => simplify(vertical as u64 * 16, horizontal as u64 * 9),
        ASPECT_2_21 => simplify(vertical as u64 * 221, horizontal as u64 * 100),
        _ => return Err(ParseError::Aspect(code)),
    };
    Ok((n as i64, d as i64))
}

fn max_octetrate(profile_level: u8) -> Result<u64, ParseError> {
    match profile_level & 0x0F {
        LEVEL_LOW => Ok(500_000),
        LEVEL_MAIN => Ok(1_875_000),
        LEVEL_HIGH1440 => Ok(7_500_000),
        LEVEL_HIGH => Ok(10_000_000),
        _ => Err(ParseError::ProfileLevel(profile_level)),
    }
}

/// Reads big-endian bitfields out of a byte slice, MSB first.
struct BitReader<'a> {
    buf: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    fn read_bits(&mut self, n: usize) -> u64 {
        let mut v = 0u64;
        for _ in 0..n {
            let byte = self.buf[self.bit_pos / 8];
            let bit = (byte >> (7 - (self.bit_pos % 8))) & 1;
            v = (v << 1) | bit as u64;
            self.bit_pos += 1;
        }
        v
    }

    fn skip_bits(&mut self, n: usize) {
        self.bit_pos += n;
    }
}

struct SequenceHeader {
    horizontal: u16,
    vertical: u16,
    aspect: u8,
    framerate_code: u8,
    bitrate: u32,
    vbv_buffer: u32,
}

fn parse_sequence_header(bytes: &[u8]) -> SequenceHeader {
    let mut r = BitReader::new(&bytes[4..12]);
    let horizontal = r.read_bits(12) as u16;
    let vertical = r.read_bits(12) as u16;
    let aspect = r.read_bits(4) as u8;
    let framerate_code = r.read_bits(4) as u8;
    let bitrate = r.read_bits(18) as u32;
    r.skip_bits(1); // marker_bit
    let vbv_buffer = r.read_bits(10) as u32;
    SequenceHeader {
        horizontal,
        vertical,
        aspect,
        framerate_code,
        bitrate,
        vbv_buffer,
    }
}

/// Total size of the sequence header starting at `block`'s offset 0,
/// including any quantiser matrices it carries. Mirrors the original's
/// byte-11 flag check, including its quirk of re-reading that byte from a
/// shifted offset when an intra matrix is present.
fn sequence_header_total_size(block: &Block) -> Option<usize> {
    let mut word = [0u8; 1];
    block.extract(11, 1, &mut word).then_some(())?;
    let mut size = SEQ_HEADER_SIZE;
    let mut w = word[0];
    if w & 0x2 != 0 {
        size += 64;
        if !block.extract(11 + 64, 1, &mut word) {
            return None;
        }
        w = word[0];
    }
    if w & 0x1 != 0 {
        size += 64;
    }
    Some(size)
}

struct SequenceExtension {
    profile_level: u8,
    progressive: bool,
    chroma_format: u8,
    horizontal_ext: u8,
    vertical_ext: u8,
    bitrate_ext: u16,
    vbv_buffer_ext: u8,
    low_delay: bool,
    frame_rate_n: u8,
    frame_rate_d: u8,
}

fn parse_sequence_extension(bytes: &[u8]) -> SequenceExtension {
    let mut r = BitReader::new(&bytes[4..10]);
    r.skip_bits(4); // extension_start_code_identifier
    let profile_level = r.read_bits(8) as u8;
    let progressive = r.read_bits(1) == 1;
    let chroma_format = r.read_bits(2) as u8;
    let horizontal_ext = r.read_bits(2) as u8;
    let vertical_ext = r.read_bits(2) as u8;
    let bitrate_ext = r.read_bits(12) as u16;
    r.skip_bits(1); // marker_bit
    let vbv_buffer_ext = r.read_bits(8) as u8;
    let low_delay = r.read_bits(1) == 1;
    let frame_rate_n = r.read_bits(2) as u8;
    let frame_rate_d = r.read_bits(2) as u8;
    SequenceExtension {
        profile_level,
        progressive,
        chroma_format,
        horizontal_ext,
        vertical_ext,
        bitrate_ext,
        vbv_buffer_ext,
        low_delay,
        frame_rate_n,
        frame_rate_d,
    }
}

struct SequenceDisplayExtension {
    horizontal: u16,
    vertical: u16,
}

/// Unlike the quantiser-matrix check above, this reads the colour_description
/// bit at the position the ISO/IEC 13818-2 layout actually puts it (the byte
/// right after the extension's 4-byte start code), not the start code byte
/// itself.
fn sequence_display_total_size(block: &Block, offset: usize) -> Option<usize> {
    let mut byte = [0u8; 1];
    if !block.extract(offset + 4, 1, &mut byte) {
        return None;
    }
    let colour_description = byte[0] & 0x1 != 0;
    Some(SEQ_DISPLAY_HEADER_SIZE + if colour_description { SEQ_DISPLAY_COLOR_SIZE } else { 0 })
}

fn parse_sequence_display(bytes: &[u8], has_color: bool) -> SequenceDisplayExtension {
    let mut r = BitReader::new(&bytes[4..]);
    r.skip_bits(4); // extension_start_code_identifier
    r.skip_bits(3); // video_format
    r.skip_bits(1); // colour_description
    if has_color {
        r.skip_bits(24);
    }
    let horizontal = r.read_bits(14) as u16;
    r.skip_bits(1); // marker_bit
    let vertical = r.read_bits(14) as u16;
    SequenceDisplayExtension { horizontal, vertical }
}

struct PictureHeader {
    temporal_reference: u16,
    coding_type: u8,
    vbv_delay: u16,
}

fn parse_picture_header(bytes: &[u8]) -> PictureHeader {
    let mut r = BitReader::new(&bytes[4..8]);
    let temporal_reference = r.read_bits(10) as u16;
    let coding_type = r.read_bits(3) as u8;
    let vbv_delay = r.read_bits(16) as u16;
    PictureHeader {
        temporal_reference,
        coding_type,
        vbv_delay,
    }
}

/// (closed_gop, broken_link)
fn parse_gop_header(bytes: &[u8]) -> (bool, bool) {
    let mut r = BitReader::new(&bytes[4..8]);
    r.skip_bits(25); // time_code
    let closed_gop = r.read_bits(1) == 1;
    let broken_link = r.read_bits(1) == 1;
    (closed_gop, broken_link)
}

struct PictureCodingExtension {
    intra_dc_precision: u8,
    structure: u8,
    tff: bool,
    rff: bool,
    progressive: bool,
}

fn parse_picture_coding_extension(bytes: &[u8]) -> PictureCodingExtension {
    let mut r = BitReader::new(&bytes[4..9]);
    r.skip_bits(4); // extension_start_code_identifier
    r.skip_bits(16); // f_codes
    let intra_dc_precision = r.read_bits(2) as u8;
    let structure = r.read_bits(2) as u8;
    let tff = r.read_bits(1) == 1;
    r.skip_bits(1); // frame_pred_frame_dct
    r.skip_bits(1); // concealment_motion_vectors
    r.skip_bits(1); // q_scale_type
    r.skip_bits(1); // intra_vlc_format
    r.skip_bits(1); // alternate_scan
    let rff = r.read_bits(1) == 1;
    r.skip_bits(1); // chroma_420_type
    let progressive = r.read_bits(1) == 1;
    PictureCodingExtension {
        intra_dc_precision,
        structure,
        tff,
        rff,
        progressive,
    }
}

/// Finds the next `00 00 01 XX` extension start code from `*offset` onward,
/// leaving `*offset` at its first byte on success, and returns the
/// extension identifier nibble.
fn peek_extension_id(block: &Block, offset: &mut usize) -> Option<u8> {
    let mut off = *offset;
    if !block.find(&mut off, &[0, 0, 1, EXT_START_CODE]) {
        return None;
    }
    let mut byte = [0u8; 1];
    if !block.extract(off + 4, 1, &mut byte) {
        return None;
    }
    *offset = off;
    Some(byte[0] >> 4)
}

fn option_block_eq(a: &Option<Block>, b: &Option<Block>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x.compare(y),
        _ => false,
    }
}

fn set_named_u64(dict: &mut Dict, name: &str, value: u64) {
    dict.set_named(name, BaseType::Unsigned, &value.to_be_bytes())
        .expect("named unsigned attribute fits in 16 bits");
}

fn set_named_small(dict: &mut Dict, name: &str, value: u8) {
    dict.set_named(name, BaseType::SmallUnsigned, &[value])
        .expect("named small-unsigned attribute always fits");
}

fn set_named_void(dict: &mut Dict, name: &str) {
    dict.set_named(name, BaseType::Void, &[]).expect("named void attribute always fits");
}

fn set_named_string(dict: &mut Dict, name: &str, value: &str) {
    dict.set_named(name, BaseType::String, value.as_bytes())
        .expect("named string attribute fits in 16 bits");
}

fn set_named_rational(dict: &mut Dict, name: &str, num: i64, den: i64) {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&num.to_be_bytes());
    buf[8..16].copy_from_slice(&den.to_be_bytes());
    dict.set_named(name, BaseType::Rational, &buf).expect("named rational attribute always fits");
}

fn reset_planes(dict: &mut Dict) {
    set_named_small(dict, "p.planes", 0);
}

fn add_plane(dict: &mut Dict, index: u8, chroma: &str, hsub: u8, vsub: u8, macropixel_size: u8) {
    set_named_small(dict, "p.planes", index + 1);
    set_named_string(dict, &format!("p.{index}.chroma"), chroma);
    set_named_small(dict, &format!("p.{index}.hsub"), hsub);
    set_named_small(dict, &format!("p.{index}.vsub"), vsub);
    set_named_small(dict, &format!("p.{index}.macropixel_size"), macropixel_size);
}

struct Timestamps {
    pts_orig: Option<u64>,
    pts: Option<u64>,
    pts_sys: Option<u64>,
    dts_orig: Option<u64>,
    dts: Option<u64>,
    dts_sys: Option<u64>,
}

impl Timestamps {
    fn from_uref(u: &Uref) -> Self {
        Self {
            pts_orig: u.pts_orig(),
            pts: u.pts(),
            pts_sys: u.pts_sys(),
            dts_orig: u.dts_orig(),
            dts: u.dts(),
            dts_sys: u.dts_sys(),
        }
    }
}

/// The MPEG-2 video framer.
pub struct Mp2vFramer {
    output_fn: Option<OutputFn>,
    probes: ProbeChain,

    flow_def_input: Option<Uref>,
    flow_def: Option<Uref>,
    flow_def_sent: bool,

    octet_stream: OctetStream,

    acquired: bool,
    got_discontinuity: bool,
    insert_sequence: bool,

    sequence_header: Option<Block>,
    sequence_ext: Option<Block>,
    sequence_display: Option<Block>,
    progressive_sequence: bool,
    fps: (u64, u64),

    last_picture_number: i64,
    last_temporal_reference: i64,
    systime_rap: Option<u64>,

    next_frame_size: usize,
    next_frame_sequence: bool,
    next_frame_offset: Option<usize>,
    next_frame_slice: bool,
    next_frame_pts_orig: Option<u64>,
    next_frame_pts: Option<u64>,
    next_frame_pts_sys: Option<u64>,
    next_frame_dts_orig: Option<u64>,
    next_frame_dts: Option<u64>,
    next_frame_dts_sys: Option<u64>,
}

impl Mp2vFramer {
    pub fn new() -> Self {
        Self {
            output_fn: None,
            probes: ProbeChain::new(),
            flow_def_input: None,
            flow_def: None,
            flow_def_sent: true,
            octet_stream: OctetStream::new(),
            acquired: false,
            got_discontinuity: false,
            insert_sequence: false,
            sequence_header: None,
            sequence_ext: None,
            sequence_display: None,
            progressive_sequence: false,
            fps: (0, 0),
            last_picture_number: -1,
            last_temporal_reference: -1,
            systime_rap: None,
            next_frame_size: 0,
            next_frame_sequence: false,
            next_frame_offset: None,
            next_frame_slice: false,
            next_frame_pts_orig: None,
            next_frame_pts: None,
            next_frame_pts_sys: None,
            next_frame_dts_orig: None,
            next_frame_dts: None,
            next_frame_dts_sys: None,
        }
    }

    pub fn set_output(&mut self, f: impl FnMut(Uref) + 'static) {
        self.output_fn = Some(Box::new(f));
    }

    pub fn add_probe(&mut self, probe: impl FnMut(&Event) -> bool + 'static) {
        self.probes.add(probe);
    }

    pub fn sequence_insertion(&self) -> bool {
        self.insert_sequence
    }

    pub fn set_sequence_insertion(&mut self, value: bool) {
        self.insert_sequence = value;
    }

    /// Feeds one uref into the framer: either a flow-definition announcement
    /// (a uref with no `ubuf`) or a chunk of elementary-stream bytes.
    pub fn input(&mut self, uref: Uref) {
        if let Some(def) = uref.flow_def().map(str::to_owned) {
            if !def.starts_with(EXPECTED_FLOW_DEF) {
                self.flow_def_input = None;
                self.store_flow_def(None);
                self.probes.throw(Event::FlowDefError);
                return;
            }
            crate::logging::debug!("flow definition: {}", def);
            let has_sequence = self.sequence_header.is_some();
            self.flow_def_input = Some(uref);
            if has_sequence {
                let _ = self.parse_sequence_flow_def();
            }
            return;
        }

        if self.flow_def_input.is_none() {
            self.probes.throw(Event::FlowDefError);
            return;
        }

        if uref.ubuf.is_none() {
            return;
        }

        if uref.discontinuity() {
            if !self.next_frame_slice {
                self.octet_stream.clean();
                self.next_frame_size = 0;
                self.next_frame_sequence = false;
                self.next_frame_offset = None;
                self.got_discontinuity = true;
            } else if let Some(next) = self.octet_stream.next_uref_mut() {
                next.set_error();
            }
        }

        self.append(uref);
        self.work();
    }

    fn append(&mut self, uref: Uref) {
        let mut promoted = None;
        self.octet_stream.append(uref, |u| promoted = Some(Timestamps::from_uref(u)));
        if let Some(ts) = promoted {
            self.apply_promoted(ts);
        }
    }

    fn consume(&mut self, n: usize) {
        let mut promoted = None;
        self.octet_stream.consume(n, |u| promoted = Some(Timestamps::from_uref(u)));
        if let Some(ts) = promoted {
            self.apply_promoted(ts);
        }
    }

    fn apply_promoted(&mut self, ts: Timestamps) {
        if ts.pts_orig.is_some() {
            self.next_frame_pts_orig = ts.pts_orig;
        }
        if ts.pts.is_some() {
            self.next_frame_pts = ts.pts;
        }
        if ts.pts_sys.is_some() {
            self.next_frame_pts_sys = ts.pts_sys;
        }
        if ts.dts_orig.is_some() {
            self.next_frame_dts_orig = ts.dts_orig;
        }
        if ts.dts.is_some() {
            self.next_frame_dts = ts.dts;
        }
        if ts.dts_sys.is_some() {
            self.next_frame_dts_sys = ts.dts_sys;
        }
    }

    fn flush_pts(&mut self) {
        self.next_frame_pts_orig = None;
        self.next_frame_pts = None;
        self.next_frame_pts_sys = None;
    }

    fn flush_dts(&mut self) {
        self.next_frame_dts_orig = None;
        self.next_frame_dts = None;
        self.next_frame_dts_sys = None;
    }

    fn increment_dts(&mut self, duration: u64) {
        if let Some(v) = self.next_frame_dts_orig {
            self.next_frame_dts_orig = Some(v + duration);
        }
        if let Some(v) = self.next_frame_dts {
            self.next_frame_dts = Some(v + duration);
        }
        if let Some(v) = self.next_frame_dts_sys {
            self.next_frame_dts_sys = Some(v + duration);
        }
    }

    fn sync_acquired(&mut self) {
        if !self.acquired {
            crate::logging::trace!("sync acquired");
            self.acquired = true;
            self.probes.throw(Event::SyncAcquired);
        }
    }

    fn sync_lost(&mut self) {
        if self.acquired {
            crate::logging::trace!("sync lost");
            self.acquired = false;
            self.probes.throw(Event::SyncLost);
        }
    }

    fn find_start(&mut self) -> Option<u8> {
        let block = self.octet_stream.next_uref()?.ubuf.as_ref()?.as_block()?;
        let mut offset = self.next_frame_size;
        if !block.find(&mut offset, &[0, 0, 1]) {
            return None;
        }
        self.next_frame_size = offset;
        let mut byte = [0u8; 1];
        if !block.extract(offset + 3, 1, &mut byte) {
            return None;
        }
        Some(byte[0])
    }

    fn work(&mut self) {
        loop {
            if self.octet_stream.next_uref().is_none() {
                return;
            }
            let start = match self.find_start() {
                Some(s) => s,
                None => return,
            };

            if !self.acquired {
                self.consume(self.next_frame_size);
                self.next_frame_size = 0;
                match start {
                    PIC_START_CODE => {
                        self.flush_pts();
                        self.flush_dts();
                    }
                    SEQ_START_CODE => {
                        self.sync_acquired();
                        self.next_frame_sequence = true;
                    }
                    _ => {}
                }
                self.next_frame_size += 4;
                continue;
            }

            if self.next_frame_offset.is_none() {
                if start == PIC_START_CODE {
                    self.next_frame_offset = Some(self.next_frame_size);
                }
                self.next_frame_size += 4;
                continue;
            }

            if start == EXT_START_CODE {
                self.next_frame_size += 4;
                continue;
            }

            if start > PIC_START_CODE && start <= PIC_LAST_CODE {
                self.next_frame_slice = true;
                self.next_frame_size += 4;
                continue;
            }

            if start == SEQ_END_CODE {
                self.next_frame_size += 4;
            }

            if !self.output_frame() {
                crate::logging::warn!("erroneous frame headers, resynchronizing");
                self.consume(self.next_frame_size);
                self.next_frame_size = 0;
                self.sync_lost();
                self.next_frame_sequence = false;
                self.next_frame_offset = None;
                self.next_frame_slice = false;
                continue;
            }

            self.consume(self.next_frame_size);
            self.next_frame_sequence = false;
            self.next_frame_offset = None;
            self.next_frame_slice = false;
            self.next_frame_size = 4;
            match start {
                SEQ_START_CODE => self.next_frame_sequence = true,
                GOP_START_CODE => {}
                PIC_START_CODE => self.next_frame_offset = Some(0),
                SEQ_END_CODE => {
                    self.next_frame_size = 0;
                    self.sync_lost();
                }
                _ => self.sync_lost(),
            }
        }
    }

    fn output_frame(&mut self) -> bool {
        let src = match self.octet_stream.next_uref() {
            Some(u) => u,
            None => return true,
        };
        let mut uref = src.dup();
        match uref.ubuf.as_mut().and_then(Ubuf::as_block_mut) {
            Some(block) => block.resize(0, self.next_frame_size),
            None => {
                self.probes.throw(Event::AllocError);
                return true;
            }
        }

        if self.next_frame_sequence && !self.handle_sequence(&mut uref) {
            return false;
        }
        if !self.handle_picture(&mut uref) {
            return false;
        }
        if let Some(rap) = self.systime_rap {
            uref.set_systime_rap(rap);
        }
        self.output(uref);
        true
    }

    fn handle_sequence(&mut self, uref: &mut Uref) -> bool {
        let block = uref.ubuf.as_ref().and_then(Ubuf::as_block).expect("frame carries a block view").dup();

        let mut offset = match sequence_header_total_size(&block) {
            Some(s) => s,
            None => {
                self.probes.throw(Event::AllocError);
                return false;
            }
        };
        let mut sequence_header = block.dup();
        sequence_header.resize(0, offset);

        let mut sequence_ext = None;
        let mut sequence_display = None;

        if let Some(ext_id) = peek_extension_id(&block, &mut offset) {
            if ext_id != EXT_ID_SEQ {
                crate::logging::warn!("unexpected header extension {} after sequence header", ext_id);
                return false;
            }
            let mut ext = block.dup();
            ext.resize(offset, SEQ_EXT_HEADER_SIZE);
            offset += SEQ_EXT_HEADER_SIZE;
            sequence_ext = Some(ext);

            if let Some(ext_id2) = peek_extension_id(&block, &mut offset) {
                if ext_id2 == EXT_ID_SEQ_DISPLAY {
                    let size = match sequence_display_total_size(&block, offset) {
                        Some(s) => s,
                        None => {
                            self.probes.throw(Event::AllocError);
                            return false;
                        }
                    };
                    let mut disp = block.dup();
                    disp.resize(offset, size);
                    sequence_display = Some(disp);
                }
            }
        }

        let identical = self.sequence_header.as_ref().is_some_and(|cur| cur.compare(&sequence_header))
            && option_block_eq(&self.sequence_ext, &sequence_ext)
            && option_block_eq(&self.sequence_display, &sequence_display);

        self.sequence_header = Some(sequence_header);
        self.sequence_ext = sequence_ext;
        self.sequence_display = sequence_display;

        if identical {
            return true;
        }

        self.parse_sequence_flow_def()
    }

    fn parse_sequence_flow_def(&mut self) -> bool {
        let seq_bytes = {
            let sh = self.sequence_header.as_ref().expect("sequence header cached before this is called");
            let mut b = [0u8; SEQ_HEADER_SIZE];
            if !sh.extract(0, SEQ_HEADER_SIZE, &mut b) {
                self.probes.throw(Event::AllocError);
                return false;
            }
            b
        };
        let seq = parse_sequence_header(&seq_bytes);
        let (mut rate_n, mut rate_d) = FRAME_RATE_TABLE[seq.framerate_code as usize];
        if rate_n == 0 {
            crate::logging::warn!("invalid frame rate code {}", seq.framerate_code);
            return false;
        }

        let input = match &self.flow_def_input {
            Some(u) => u,
            None => {
                self.probes.throw(Event::AllocError);
                return false;
            }
        };
        let mut flow_def = input.dup();

        let mut horizontal = seq.horizontal as u32;
        let mut vertical = seq.vertical as u32;
        let mut bitrate = seq.bitrate as u64;
        let mut vbv_buffer = seq.vbv_buffer as u64;

        let chroma_format = if let Some(ext_block) = self.sequence_ext.clone() {
            let mut eb = [0u8; SEQ_EXT_HEADER_SIZE];
            if !ext_block.extract(0, SEQ_EXT_HEADER_SIZE, &mut eb) {
                self.probes.throw(Event::AllocError);
                return false;
            }
            let ext = parse_sequence_extension(&eb);

            let octetrate = match max_octetrate(ext.profile_level) {
                Ok(v) => v,
                Err(e) => {
                    crate::logging::warn!("{}", e);
                    return false;
                }
            };
            set_named_small(flow_def.dict_mut(), "mp2v.profilelevel", ext.profile_level);
            set_named_u64(flow_def.dict_mut(), "b.max_octetrate", octetrate);
            if ext.progressive {
                flow_def.set_progressive();
            }
            self.progressive_sequence = ext.progressive;

            horizontal |= (ext.horizontal_ext as u32) << 12;
            vertical |= (ext.vertical_ext as u32) << 12;
            bitrate |= (ext.bitrate_ext as u64) << 18;
            vbv_buffer |= (ext.vbv_buffer_ext as u64) << 10;
            rate_n *= ext.frame_rate_n as u64 + 1;
            rate_d *= ext.frame_rate_d as u64 + 1;
            let (n, d) = simplify(rate_n, rate_d);
            rate_n = n;
            rate_d = d;

            if ext.low_delay {
                set_named_void(flow_def.dict_mut(), "mp2v.lowdelay");
            }

            ext.chroma_format
        } else {
            self.progressive_sequence = false;
            CHROMA_420
        };

        set_named_small(flow_def.dict_mut(), "p.macropixel", 1);
        reset_planes(flow_def.dict_mut());
        add_plane(flow_def.dict_mut(), 0, "y8", 1, 1, 1);
        let suffix = match chroma_format {
            CHROMA_420 => {
                add_plane(flow_def.dict_mut(), 1, "u8", 2, 2, 1);
                add_plane(flow_def.dict_mut(), 2, "v8", 2, 2, 1);
                "pic.planar8_420."
            }
            CHROMA_422 => {
                add_plane(flow_def.dict_mut(), 1, "u8", 2, 1, 1);
                add_plane(flow_def.dict_mut(), 2, "v8", 2, 1, 1);
                "pic.planar8_422."
            }
            CHROMA_444 => {
                add_plane(flow_def.dict_mut(), 1, "u8", 1, 1, 1);
                add_plane(flow_def.dict_mut(), 2, "v8", 1, 1, 1);
                "pic.planar8_444."
            }
            other => {
                crate::logging::warn!("invalid chroma format {}", other);
                return false;
            }
        };
        flow_def.set_flow_def(&format!("{EXPECTED_FLOW_DEF}{suffix}"));

        flow_def.set_hsize(horizontal as u64);
        flow_def.set_vsize(vertical as u64);

        let (sar_n, sar_d) = match aspect(seq.aspect, horizontal as u16, vertical as u16) {
            Ok(v) => v,
            Err(e) => {
                crate::logging::warn!("{}", e);
                return false;
            }
        };
        flow_def.set_aspect(sar_n, sar_d);
        set_named_rational(flow_def.dict_mut(), "p.fps", rate_n as i64, rate_d as i64);
        self.fps = (rate_n, rate_d);
        set_named_u64(flow_def.dict_mut(), "b.octetrate", bitrate * 400 / 8);
        set_named_u64(flow_def.dict_mut(), "b.cpb_buffer", vbv_buffer * 2048);

        if let Some(disp) = self.sequence_display.clone() {
            let size = disp.size();
            let mut db = vec![0u8; size];
            if !disp.extract(0, size, &mut db) {
                self.probes.throw(Event::AllocError);
                return false;
            }
            let has_color = size > SEQ_DISPLAY_HEADER_SIZE;
            let d = parse_sequence_display(&db, has_color);
            flow_def.set_hsize_visible(d.horizontal as u64);
            flow_def.set_vsize_visible(d.vertical as u64);
        }

        self.store_flow_def(Some(flow_def));
        true
    }

    fn handle_picture(&mut self, uref: &mut Uref) -> bool {
        let block = uref.ubuf.as_ref().and_then(Ubuf::as_block).expect("frame carries a block view").dup();

        if let Some(frame_offset) = self.next_frame_offset {
            if frame_offset != 0 {
                let mut gop_offset = 0usize;
                if block.find(&mut gop_offset, &[0, 0, 1, GOP_START_CODE]) {
                    let mut gb = [0u8; GOP_HEADER_SIZE];
                    if !block.extract(gop_offset, GOP_HEADER_SIZE, &mut gb) {
                        self.probes.throw(Event::AllocError);
                        return false;
                    }
                    let (closed_gop, broken_link) = parse_gop_header(&gb);
                    self.last_temporal_reference = -1;
                    if broken_link || (!closed_gop && self.got_discontinuity) {
                        uref.set_discontinuity();
                    }
                }
            }
        }

        let offset = self.next_frame_offset.unwrap_or(0);
        let mut pb = [0u8; PIC_HEADER_SIZE];
        if !block.extract(offset, PIC_HEADER_SIZE, &mut pb) {
            self.probes.throw(Event::AllocError);
            return false;
        }
        let pic = parse_picture_header(&pb);

        let delta = pic.temporal_reference as i64 - self.last_temporal_reference;
        let picture_number = self.last_picture_number + delta;
        if pic.temporal_reference as i64 > self.last_temporal_reference {
            self.last_temporal_reference = pic.temporal_reference as i64;
            self.last_picture_number = picture_number;
        }
        uref.set_picture_number(picture_number as u64);
        set_named_small(uref.dict_mut(), "mp2v.codingtype", pic.coding_type);
        if pic.vbv_delay != 0xFFFF {
            uref.set_vbv_delay(pic.vbv_delay as u64 * 27_000_000 / 90_000);
        } else {
            uref.delete_vbv_delay();
        }

        let mut duration = if self.fps.0 != 0 { 27_000_000u64 * self.fps.1 / self.fps.0 } else { 0 };

        let ext_offset = offset + PIC_HEADER_SIZE;
        let mut ext_search_offset = ext_offset;
        if let Some(ext_id) = peek_extension_id(&block, &mut ext_search_offset) {
            if ext_id != EXT_ID_PIC_CODING {
                crate::logging::warn!("unexpected header extension {} after picture header", ext_id);
                return false;
            }
            let mut eb = [0u8; PIC_EXT_HEADER_SIZE];
            if !block.extract(ext_search_offset, PIC_EXT_HEADER_SIZE, &mut eb) {
                self.probes.throw(Event::AllocError);
                return false;
            }
            let pcx = parse_picture_coding_extension(&eb);
            if pcx.intra_dc_precision != 0 {
                crate::logging::warn!("intra DC precision {} is possibly not supported", pcx.intra_dc_precision as u16 + 8);
            }

            if self.progressive_sequence {
                if pcx.rff {
                    duration *= 1 + pcx.tff as u64;
                }
            } else if pcx.structure == PICX_FRAME {
                if pcx.rff {
                    duration += duration / 2;
                }
            } else {
                duration /= 2;
            }

            if pcx.structure & PICX_TOP_FIELD != 0 {
                uref.set_tf();
            }
            if pcx.structure & PICX_BOTTOM_FIELD != 0 {
                uref.set_bf();
            }
            if pcx.tff {
                uref.set_tff();
            }
            if pcx.progressive {
                uref.set_progressive();
            }
        }
        uref.set_duration(duration);

        macro_rules! propagate {
            ($field:ident, $setter:ident, $deleter:ident) => {
                match self.$field {
                    Some(v) => uref.$setter(v),
                    None => uref.$deleter(),
                }
            };
        }
        propagate!(next_frame_pts_orig, set_pts_orig, delete_pts_orig);
        propagate!(next_frame_pts, set_pts, delete_pts);
        propagate!(next_frame_pts_sys, set_pts_sys, delete_pts_sys);
        propagate!(next_frame_dts_orig, set_dts_orig, delete_dts_orig);
        propagate!(next_frame_dts, set_dts, delete_dts);
        propagate!(next_frame_dts_sys, set_dts_sys, delete_dts_sys);

        self.flush_pts();
        self.increment_dts(duration);

        if pic.coding_type == CODING_TYPE_I {
            let systime_rap = uref.systime();
            if self.next_frame_sequence {
                uref.set_random();
                self.systime_rap = systime_rap;
            } else if self.insert_sequence {
                if let Some(disp) = self.sequence_display.clone() {
                    uref.ubuf.as_mut().and_then(Ubuf::as_block_mut).unwrap().insert(0, disp);
                }
                if let Some(ext) = self.sequence_ext.clone() {
                    uref.ubuf.as_mut().and_then(Ubuf::as_block_mut).unwrap().insert(0, ext);
                }
                if let Some(seq) = self.sequence_header.clone() {
                    uref.ubuf.as_mut().and_then(Ubuf::as_block_mut).unwrap().insert(0, seq);
                }
                uref.set_random();
                self.systime_rap = systime_rap;
            }
        }

        true
    }

    fn store_flow_def(&mut self, flow_def: Option<Uref>) {
        self.flow_def = flow_def;
        self.flow_def_sent = false;
    }

    fn output(&mut self, uref: Uref) {
        if !self.flow_def_sent {
            if let Some(fd) = self.flow_def.as_ref().map(Uref::dup) {
                self.flow_def_sent = true;
                if let Some(out) = &mut self.output_fn {
                    out(fd);
                }
            }
        }
        if let Some(out) = &mut self.output_fn {
            out(uref);
        }
    }
}

impl Default for Mp2vFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe for Mp2vFramer {
    fn input(&mut self, uref: Uref) {
        Mp2vFramer::input(self, uref)
    }

    fn control(&mut self, command: Command) -> Reply {
        match command {
            Command::SetOutput(f) => {
                self.output_fn = Some(f);
                Reply::Unit
            }
            Command::GetSequenceInsertion => Reply::Bool(self.insert_sequence),
            Command::SetSequenceInsertion(v) => {
                self.insert_sequence = v;
                Reply::Unit
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedRegion;
    use crate::umem::Umem;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct BitWriter {
        bytes: Vec<u8>,
        bit_pos: usize,
    }

    impl BitWriter {
        fn new() -> Self {
            Self { bytes: Vec::new(), bit_pos: 0 }
        }

        fn write_bits(&mut self, value: u64, n: usize) {
            for i in (0..n).rev() {
                let bit = ((value >> i) & 1) as u8;
                let byte_index = self.bit_pos / 8;
                if byte_index == self.bytes.len() {
                    self.bytes.push(0);
                }
                if bit == 1 {
                    self.bytes[byte_index] |= 1 << (7 - (self.bit_pos % 8));
                }
                self.bit_pos += 1;
            }
        }

        fn finish(mut self) -> Vec<u8> {
            while self.bit_pos % 8 != 0 {
                self.write_bits(0, 1);
            }
            self.bytes
        }
    }

    fn build_sequence_header(horizontal: u16, vertical: u16, aspect_code: u8, framerate_code: u8, bitrate: u32, vbv_buffer: u16) -> Vec<u8> {
        let mut bytes = vec![0, 0, 1, SEQ_START_CODE];
        let mut w = BitWriter::new();
        w.write_bits(horizontal as u64, 12);
        w.write_bits(vertical as u64, 12);
        w.write_bits(aspect_code as u64, 4);
        w.write_bits(framerate_code as u64, 4);
        w.write_bits(bitrate as u64, 18);
        w.write_bits(1, 1);
        w.write_bits(vbv_buffer as u64, 10);
        w.write_bits(0, 1);
        w.write_bits(0, 1);
        w.write_bits(0, 1);
        bytes.extend(w.finish());
        bytes
    }

    fn build_picture_header(temporal_reference: u16, coding_type: u8, vbv_delay: u16) -> Vec<u8> {
        let mut bytes = vec![0, 0, 1, PIC_START_CODE];
        let mut w = BitWriter::new();
        w.write_bits(temporal_reference as u64, 10);
        w.write_bits(coding_type as u64, 3);
        w.write_bits(vbv_delay as u64, 16);
        w.write_bits(0, 3);
        bytes.extend(w.finish());
        bytes
    }

    fn block_of(bytes: Vec<u8>) -> Block {
        let mut umem = Umem::alloc(bytes.len());
        umem.as_mut_slice().copy_from_slice(&bytes);
        Block::from_region(SharedRegion::from_umem(umem), 0, bytes.len())
    }

    fn flow_def_uref() -> Uref {
        let mut u = Uref::new();
        u.set_flow_def(EXPECTED_FLOW_DEF);
        u
    }

    #[test]
    fn frame_rate_table_boundaries() {
        assert_eq!(FRAME_RATE_TABLE[0], (0, 0));
        assert_eq!(FRAME_RATE_TABLE[3], (25, 1));
        assert_eq!(FRAME_RATE_TABLE.len(), 16);
    }

    #[test]
    fn max_octetrate_table() {
        assert_eq!(max_octetrate(LEVEL_LOW).unwrap(), 500_000);
        assert_eq!(max_octetrate(LEVEL_MAIN).unwrap(), 1_875_000);
        assert_eq!(max_octetrate(LEVEL_HIGH1440).unwrap(), 7_500_000);
        assert_eq!(max_octetrate(LEVEL_HIGH).unwrap(), 10_000_000);
        assert!(max_octetrate(0).is_err());
    }

    #[test]
    fn aspect_4_3_simplifies() {
        let (n, d) = aspect(ASPECT_4_3, 720, 576).unwrap();
        assert_eq!((n, d), (16, 15));
    }

    #[test]
    fn bitreader_roundtrips_bitwriter() {
        let mut w = BitWriter::new();
        w.write_bits(0b1011, 4);
        w.write_bits(0x3FF, 10);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_bits(4), 0b1011);
        assert_eq!(r.read_bits(10), 0x3FF);
    }

    #[test]
    fn minimal_stream_emits_flow_def_then_frame() {
        let mut framer = Mp2vFramer::new();
        let outputs = Rc::new(RefCell::new(Vec::new()));
        let sink = outputs.clone();
        framer.set_output(move |u| sink.borrow_mut().push(u));

        framer.input(flow_def_uref());

        let mut stream = build_sequence_header(704, 576, ASPECT_4_3, 3, 100, 50);
        stream.extend(build_picture_header(0, CODING_TYPE_I, 100));
        stream.extend_from_slice(&[0, 0, 1, SEQ_END_CODE]);
        let data = Uref::from_ubuf(Ubuf::Block(block_of(stream)));
        framer.input(data);

        let outputs = outputs.borrow();
        assert_eq!(outputs.len(), 2, "one flow-def announcement, one frame");
        assert_eq!(outputs[0].flow_def(), Some("block.mpeg2video.pic.planar8_420."));
        assert_eq!(outputs[1].picture_number(), Some(0));
        assert_eq!(outputs[1].vbv_delay(), Some(100 * 27_000_000 / 90_000));
        assert!(outputs[1].duration().unwrap() > 0);
    }

    #[test]
    fn b_frame_reordering_yields_display_order_picture_numbers() {
        let mut framer = Mp2vFramer::new();
        let outputs = Rc::new(RefCell::new(Vec::new()));
        let sink = outputs.clone();
        framer.set_output(move |u| sink.borrow_mut().push(u));

        framer.input(flow_def_uref());

        let mut stream = build_sequence_header(704, 576, ASPECT_4_3, 3, 100, 50);
        stream.extend(build_picture_header(0, CODING_TYPE_I, 100));
        stream.extend(build_picture_header(2, CODING_TYPE_I, 100));
        stream.extend(build_picture_header(3, CODING_TYPE_I, 100));
        stream.extend(build_picture_header(1, CODING_TYPE_I, 100));
        stream.extend_from_slice(&[0, 0, 1, SEQ_END_CODE]);

        let mut data = Uref::from_ubuf(Ubuf::Block(block_of(stream)));
        data.set_dts(0);
        framer.input(data);

        let outputs = outputs.borrow();
        let frames: Vec<_> = outputs.iter().filter(|u| u.picture_number().is_some()).collect();
        assert_eq!(frames.len(), 4);

        let numbers: Vec<u64> = frames.iter().map(|u| u.picture_number().unwrap()).collect();
        assert_eq!(numbers, vec![0, 2, 3, 1], "IBBP with TRs 0,2,3,1 displays in this order");

        let dts: Vec<u64> = frames.iter().map(|u| u.dts().unwrap()).collect();
        let duration = 27_000_000 / 25;
        assert_eq!(dts, vec![0, duration, 2 * duration, 3 * duration]);
    }

    #[test]
    fn garbage_prefix_is_skipped_before_sync() {
        let mut framer = Mp2vFramer::new();
        let outputs = Rc::new(RefCell::new(Vec::new()));
        let sink = outputs.clone();
        framer.set_output(move |u| sink.borrow_mut().push(u));
        framer.input(flow_def_uref());

        let mut garbage = vec![0xFFu8; 8];
        garbage.extend(build_sequence_header(704, 576, ASPECT_4_3, 3, 100, 50));
        garbage.extend(build_picture_header(0, CODING_TYPE_I, 100));
        garbage.extend_from_slice(&[0, 0, 1, SEQ_END_CODE]);

        framer.input(Uref::from_ubuf(Ubuf::Block(block_of(garbage))));

        assert_eq!(outputs.borrow().len(), 2);
    }

    #[test]
    fn rejects_wrong_flow_definition() {
        let mut framer = Mp2vFramer::new();
        let acquired = Rc::new(RefCell::new(false));
        let flag = acquired.clone();
        framer.add_probe(move |event| {
            if *event == Event::FlowDefError {
                *flag.borrow_mut() = true;
            }
            false
        });
        let mut bad = Uref::new();
        bad.set_flow_def("block.h264.");
        framer.input(bad);
        assert!(*acquired.borrow());
    }
}
