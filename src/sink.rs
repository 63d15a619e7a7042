//! Datapath verbs and response codes (spec.md §5, §6).
//!
//! Every inter-component interface speaks four verbs — data, flush,
//! reset, end-of-trace — and replies with one of four response codes.
//! Modeled as a plain tagged enum rather than async/await: there is no
//! reentrancy or concurrency at this layer (spec.md §5).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Keep feeding bytes/packets.
    Continue,
    /// Downstream sink applied backpressure; the caller must re-invoke
    /// with the same buffer position after draining the sink.
    Wait,
    FatalInvalidData,
    FatalNotInitialized,
}

impl Response {
    pub fn is_fatal(self) -> bool {
        matches!(self, Response::FatalInvalidData | Response::FatalNotInitialized)
    }
}

/// Consumes generic trace elements emitted by a packet decoder.
pub trait ElementSink {
    fn trace_element_in(
        &mut self,
        index: usize,
        trace_id: u8,
        element: crate::element::ElementKind,
    ) -> Response;
}

/// A sink that simply collects every element in arrival (commit) order;
/// used by tests and as the default sink for small traces.
#[derive(Debug, Default, Clone)]
pub struct VecSink {
    pub elements: Vec<crate::element::TraceElement>,
}

impl ElementSink for VecSink {
    fn trace_element_in(
        &mut self,
        index: usize,
        trace_id: u8,
        kind: crate::element::ElementKind,
    ) -> Response {
        self.elements.push(crate::element::TraceElement {
            index,
            trace_id,
            kind,
        });
        Response::Continue
    }
}
