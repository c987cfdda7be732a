//! **M**edia-**pipe** buffer substrate and MPEG-2 video framer.
//!
//! Layered bottom-up: [`umem`] is a raw byte buffer, [`shared`] gives it
//! reference counting and copy-on-write, [`udict`] is a typed attribute
//! dictionary stored inline in a buffer, [`ubuf`] is a buffer descriptor
//! (byte-stream or picture-plane view) built on `shared`, [`uref`] pairs a
//! `udict` with a `ubuf` as the unit that actually flows through a pipeline,
//! [`octetstream`] turns a queue of `uref`s into one contiguous byte cursor,
//! and [`pipe`] is the capability interface pipes implement. [`mp2v`] is the
//! one concrete pipe in this crate: an MPEG-2 elementary stream framer built
//! on all of the above.

mod logging;

pub mod error;
pub mod mp2v;
pub mod octetstream;
pub mod pipe;
pub mod shared;
pub mod ubuf;
pub mod udict;
pub mod umem;
pub mod uref;

pub use error::{Error, ParseError, Result};
pub use mp2v::Mp2vFramer;
pub use pipe::{Command, Event, Pipe, ProbeChain, Reply};
pub use shared::SharedRegion;
pub use ubuf::{Block, PlaneDesc, Picture, Ubuf};
pub use udict::{BaseType, Dict, DictManager, Shorthand};
pub use umem::Umem;
pub use uref::Uref;
