//! Correlation-ID scope guard (AS.6), grounded on
//! `examples/original_source/core/trace_context.py`: a thread-local stack of
//! context frames, pushed on scope entry and popped on drop (LIFO).

use std::cell::RefCell;

#[derive(Debug, Clone, Default)]
pub struct TraceFrame {
    pub session_id: Option<String>,
    pub decision_id: Option<String>,
    pub order_req_id: Option<String>,
}

thread_local! {
    static STACK: RefCell<Vec<TraceFrame>> = const { RefCell::new(Vec::new()) };
}

/// Installs `frame` into the ambient context for its lifetime. Dropping it
/// pops the frame, regardless of unwind path.
pub struct Trace {
    _private: (),
}

impl Trace {
    pub fn enter(frame: TraceFrame) -> Self {
        STACK.with(|s| s.borrow_mut().push(frame));
        Self { _private: () }
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        STACK.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

/// Merges the stack top-down: an unset field in an inner frame falls back
/// to the nearest enclosing frame that set it.
pub fn current() -> TraceFrame {
    STACK.with(|s| {
        let stack = s.borrow();
        let mut merged = TraceFrame::default();
        for frame in stack.iter() {
            if frame.session_id.is_some() {
                merged.session_id = frame.session_id.clone();
            }
            if frame.decision_id.is_some() {
                merged.decision_id = frame.decision_id.clone();
            }
            if frame.order_req_id.is_some() {
                merged.order_req_id = frame.order_req_id.clone();
            }
        }
        merged
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_scopes_stack_and_unwind_lifo() {
        assert!(current().session_id.is_none());
        let _outer = Trace::enter(TraceFrame {
            session_id: Some("s1".into()),
            ..Default::default()
        });
        assert_eq!(current().session_id.as_deref(), Some("s1"));
        {
            let _inner = Trace::enter(TraceFrame {
                decision_id: Some("d1".into()),
                ..Default::default()
            });
            let ctx = current();
            assert_eq!(ctx.session_id.as_deref(), Some("s1"));
            assert_eq!(ctx.decision_id.as_deref(), Some("d1"));
        }
        let ctx = current();
        assert_eq!(ctx.session_id.as_deref(), Some("s1"));
        assert!(ctx.decision_id.is_none());
    }
}
