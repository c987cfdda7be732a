//! The (dictionary, buffer) transport pair (C5).

use crate::udict::{Dict, Shorthand};
use crate::ubuf::Ubuf;

/// A single unit flowing through the pipeline: an optional attribute
/// dictionary plus an optional buffer. A uref with no `ubuf` carries only
/// attributes (e.g. a flow-definition announcement).
pub struct Uref {
    pub dict: Option<Dict>,
    pub ubuf: Option<Ubuf>,
}

impl Uref {
    pub fn new() -> Self {
        Self { dict: None, ubuf: None }
    }

    pub fn from_ubuf(ubuf: Ubuf) -> Self {
        Self {
            dict: Some(Dict::alloc(128)),
            ubuf: Some(ubuf),
        }
    }

    /// Duplicates both the dictionary and the buffer (the latter cheaply,
    /// by sharing its underlying regions).
    pub fn dup(&self) -> Self {
        Self {
            dict: self.dict.as_ref().map(Dict::dup),
            ubuf: self.ubuf.as_ref().map(Ubuf::dup),
        }
    }

    fn dict(&self) -> Option<&Dict> {
        self.dict.as_ref()
    }

    pub(crate) fn dict_mut(&mut self) -> &mut Dict {
        self.dict.get_or_insert_with(|| Dict::alloc(128))
    }

    // -- flow ----------------------------------------------------------

    pub fn flow_def(&self) -> Option<&str> {
        self.dict().and_then(|d| d.get_string(Shorthand::FDef))
    }

    pub fn set_flow_def(&mut self, def: &str) {
        self.dict_mut().set_string(Shorthand::FDef, def).expect("flow def fits in 16 bits");
    }

    pub fn discontinuity(&self) -> bool {
        self.dict().is_some_and(|d| d.has_shorthand(Shorthand::FDisc))
    }

    pub fn set_discontinuity(&mut self) {
        self.dict_mut().set_void(Shorthand::FDisc).unwrap();
    }

    pub fn set_random(&mut self) {
        self.dict_mut().set_void(Shorthand::FRandom).unwrap();
    }

    pub fn set_error(&mut self) {
        self.dict_mut().set_void(Shorthand::FError).unwrap();
    }

    // -- clock -----------------------------------------------------------

    pub fn systime(&self) -> Option<u64> {
        self.dict().and_then(|d| d.get_u64(Shorthand::KSystime))
    }

    pub fn set_systime_rap(&mut self, value: u64) {
        self.dict_mut().set_u64(Shorthand::KSystimeRap, value).unwrap();
    }

    pub fn duration(&self) -> Option<u64> {
        self.dict().and_then(|d| d.get_u64(Shorthand::KDuration))
    }

    pub fn set_duration(&mut self, value: u64) {
        self.dict_mut().set_u64(Shorthand::KDuration, value).unwrap();
    }

    pub fn vbv_delay(&self) -> Option<u64> {
        self.dict().and_then(|d| d.get_u64(Shorthand::KVbvdelay))
    }

    pub fn set_vbv_delay(&mut self, value: u64) {
        self.dict_mut().set_u64(Shorthand::KVbvdelay, value).unwrap();
    }

    pub fn delete_vbv_delay(&mut self) {
        self.dict_mut().delete_shorthand(Shorthand::KVbvdelay);
    }
}

macro_rules! clock_field {
    ($get:ident, $set:ident, $delete:ident, $sh:ident) => {
        impl Uref {
            pub fn $get(&self) -> Option<u64> {
                self.dict().and_then(|d| d.get_u64(Shorthand::$sh))
            }

            pub fn $set(&mut self, value: u64) {
                self.dict_mut().set_u64(Shorthand::$sh, value).unwrap();
            }

            pub fn $delete(&mut self) {
                self.dict_mut().delete_shorthand(Shorthand::$sh);
            }
        }
    };
}

clock_field!(pts, set_pts, delete_pts, KPts);
clock_field!(pts_orig, set_pts_orig, delete_pts_orig, KPtsOrig);
clock_field!(pts_sys, set_pts_sys, delete_pts_sys, KPtsSys);
clock_field!(dts, set_dts, delete_dts, KDts);
clock_field!(dts_orig, set_dts_orig, delete_dts_orig, KDtsOrig);
clock_field!(dts_sys, set_dts_sys, delete_dts_sys, KDtsSys);

impl Uref {
    // -- picture ---------------------------------------------------------

    pub fn picture_number(&self) -> Option<u64> {
        self.dict().and_then(|d| d.get_u64(Shorthand::PNum))
    }

    pub fn set_picture_number(&mut self, value: u64) {
        self.dict_mut().set_u64(Shorthand::PNum, value).unwrap();
    }

    pub fn set_hsize(&mut self, value: u64) {
        self.dict_mut().set_u64(Shorthand::PHsize, value).unwrap();
    }

    pub fn set_vsize(&mut self, value: u64) {
        self.dict_mut().set_u64(Shorthand::PVsize, value).unwrap();
    }

    pub fn set_hsize_visible(&mut self, value: u64) {
        self.dict_mut().set_u64(Shorthand::PHsizevis, value).unwrap();
    }

    pub fn set_vsize_visible(&mut self, value: u64) {
        self.dict_mut().set_u64(Shorthand::PVsizevis, value).unwrap();
    }

    pub fn aspect(&self) -> Option<(i64, i64)> {
        self.dict().and_then(|d| d.get_rational(Shorthand::PAspect))
    }

    pub fn set_aspect(&mut self, num: i64, den: i64) {
        self.dict_mut().set_rational(Shorthand::PAspect, num, den).unwrap();
    }

    pub fn set_progressive(&mut self) {
        self.dict_mut().set_void(Shorthand::PProgressive).unwrap();
    }

    pub fn set_tf(&mut self) {
        self.dict_mut().set_void(Shorthand::PTf).unwrap();
    }

    pub fn set_bf(&mut self) {
        self.dict_mut().set_void(Shorthand::PBf).unwrap();
    }

    pub fn set_tff(&mut self) {
        self.dict_mut().set_void(Shorthand::PTff).unwrap();
    }
}

impl Default for Uref {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedRegion;
    use crate::ubuf::Block;

    fn empty_block_uref() -> Uref {
        Uref::from_ubuf(Ubuf::Block(Block::from_region(SharedRegion::alloc(4), 0, 4)))
    }

    #[test]
    fn flow_def_roundtrip() {
        let mut uref = empty_block_uref();
        uref.set_flow_def("block.mpeg2video.");
        assert_eq!(uref.flow_def(), Some("block.mpeg2video."));
    }

    #[test]
    fn clock_fields_roundtrip() {
        let mut uref = empty_block_uref();
        uref.set_pts(42);
        assert_eq!(uref.pts(), Some(42));
        uref.delete_pts();
        assert_eq!(uref.pts(), None);
    }

    #[test]
    fn dup_shares_ubuf_but_not_dict() {
        let mut uref = empty_block_uref();
        uref.set_pts(1);
        let mut dup = uref.dup();
        dup.set_pts(2);
        assert_eq!(uref.pts(), Some(1));
        assert_eq!(dup.pts(), Some(2));
    }
}
