//! Pipe runtime: capability interface, event probes, control dispatch (C6).

use crate::uref::Uref;

/// Events a pipe throws at its probe chain. A probe may consume an event
/// (return `true`) to stop it from reaching probes further down the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Synchronization with the elementary stream was (re)established.
    SyncAcquired,
    /// Synchronization was lost; frames up to the next sync point are dropped.
    SyncLost,
    /// An allocation failed; the current operation was abandoned.
    AllocError,
    /// The input flow definition was rejected.
    FlowDefError,
}

/// An ordered list of boxed probe callbacks, the Rust rendering of the
/// pipe's "list of mutable global functions" probe chain: no globals, no
/// `va_list`, just an owned `Vec` of closures held by the pipe itself.
#[derive(Default)]
pub struct ProbeChain {
    probes: Vec<Box<dyn FnMut(&Event) -> bool>>,
}

impl ProbeChain {
    pub fn new() -> Self {
        Self { probes: Vec::new() }
    }

    pub fn add(&mut self, probe: impl FnMut(&Event) -> bool + 'static) {
        self.probes.push(Box::new(probe));
    }

    /// Throws `event` down the chain until a probe consumes it.
    pub fn throw(&mut self, event: Event) {
        for probe in self.probes.iter_mut() {
            if probe(&event) {
                return;
            }
        }
    }
}

/// A sink a pipe forwards its output urefs to.
pub type OutputFn = Box<dyn FnMut(Uref)>;

/// Commands a pipe understands through its generic [`Pipe::control`] entry
/// point — the discriminated-union replacement for the original's
/// `control(command, va_list)`.
pub enum Command {
    SetOutput(OutputFn),
    GetSequenceInsertion,
    SetSequenceInsertion(bool),
}

/// A reply to a [`Command`].
pub enum Reply {
    Unit,
    Bool(bool),
}

/// The capability interface every pipe implements: feed it data (`input`),
/// and query or reconfigure it (`control`). Allocation and teardown are
/// ordinary Rust construction and `Drop`, not separate capability methods —
/// ownership already gives the single-owner release discipline the original
/// "use/release" pair existed to simulate manually.
pub trait Pipe {
    fn input(&mut self, uref: Uref);
    fn control(&mut self, command: Command) -> Reply;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_consuming_probe_stops_the_chain() {
        let mut chain = ProbeChain::new();
        let mut hits = Vec::new();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen1 = seen.clone();
        chain.add(move |_event| {
            seen1.borrow_mut().push(1);
            true
        });
        let seen2 = seen.clone();
        chain.add(move |_event| {
            seen2.borrow_mut().push(2);
            true
        });
        chain.throw(Event::SyncLost);
        hits.extend(seen.borrow().iter().copied());
        assert_eq!(hits, vec![1]);
    }
}
