// # Request Context Stack
//
// A thread-local stack of per-call parameter frames. Every public entry
// point of the container pushes a frame on entry and pops it on exit, so
// request-scoped settings (object tag, flush ring, transfer mode, ...) reach
// the metadata cache without threading extra arguments through every layer.
//
// Each cached field carries a `(valid, set)` pair: `valid` means the value
// was read from a non-default property list and cached in the frame; `set`
// means the library overwrote it for return to the caller. `pop(true)`
// writes `set` fields back into the property list the frame was pushed
// with; `pop(false)` discards them. Fields whose backing list is the
// process default are served from an immutable default cache with no list
// lookup at all.

use crate::common::{Ring, Tag};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::sync::Arc;

// ============================================================================
// Transfer properties
// ============================================================================

/// How metadata I/O issued under this context behaves in a multi-writer
/// cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Each writer performs its own I/O.
    Independent,
    /// The cohort performs the I/O collectively.
    Collective,
}

/// The request-scoped property record a frame is pushed with. Stands in for
/// the container's validated property-list system; the cache only ever sees
/// these pre-validated fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProps {
    pub xfer_mode: TransferMode,
    pub coll_metadata_read: bool,
    /// Hint for how many requests to batch into one vector I/O call.
    pub vector_io_size: usize,
    /// Verify checksums on metadata loads.
    pub error_detection: bool,
}

impl Default for TransferProps {
    fn default() -> Self {
        Self {
            xfer_mode: TransferMode::Independent,
            coll_metadata_read: false,
            vector_io_size: 16,
            error_detection: true,
        }
    }
}

/// Shared handle to a mutable property record, as handed in by callers.
pub type PropsHandle = Arc<RwLock<TransferProps>>;

/// Process-wide immutable cache of the default property record.
static DEFAULT_PROPS: Lazy<TransferProps> = Lazy::new(TransferProps::default);

// ============================================================================
// Fields
// ============================================================================

/// A context-cached field with its `(valid, set)` state.
#[derive(Debug, Clone)]
struct CtxField<T: Clone> {
    value: Option<T>,
    /// Value was read from the frame's property list and cached here.
    valid: bool,
    /// Value was overwritten by the library and must be written back on
    /// `pop(update: true)`.
    set: bool,
}

impl<T: Clone> Default for CtxField<T> {
    fn default() -> Self {
        Self {
            value: None,
            valid: false,
            set: false,
        }
    }
}

impl<T: Clone> CtxField<T> {
    fn get(&self) -> Option<T> {
        if self.valid || self.set {
            self.value.clone()
        } else {
            None
        }
    }

    fn cache(&mut self, value: T) {
        self.value = Some(value);
        self.valid = true;
    }

    fn set(&mut self, value: T) {
        self.value = Some(value);
        self.set = true;
    }
}

// ============================================================================
// Frames
// ============================================================================

/// One pushed context frame. Inner frames shadow outer frames.
#[derive(Debug, Clone, Default)]
pub struct ContextFrame {
    /// The property record this frame was pushed with; `None` means the
    /// process default, which is never written back.
    props: Option<PropsHandle>,

    tag: CtxField<Tag>,
    ring: CtxField<Ring>,
    xfer_mode: CtxField<TransferMode>,
    coll_metadata_read: CtxField<bool>,
    vector_io_size: CtxField<usize>,
    error_detection: CtxField<bool>,
}

impl ContextFrame {
    fn with_props(props: Option<PropsHandle>) -> Self {
        Self {
            props,
            ..Self::default()
        }
    }

    /// Write `set` fields back into the originating property list.
    fn write_back(&self) {
        let Some(props) = &self.props else { return };
        let mut guard = props.write();
        if self.xfer_mode.set {
            if let Some(v) = self.xfer_mode.value {
                guard.xfer_mode = v;
            }
        }
        if self.coll_metadata_read.set {
            if let Some(v) = self.coll_metadata_read.value {
                guard.coll_metadata_read = v;
            }
        }
        if self.vector_io_size.set {
            if let Some(v) = self.vector_io_size.value {
                guard.vector_io_size = v;
            }
        }
        if self.error_detection.set {
            if let Some(v) = self.error_detection.value {
                guard.error_detection = v;
            }
        }
    }
}

/// A detached snapshot of the active frame, used by virtualizing layers that
/// must re-enter the library with a preserved context.
#[derive(Debug, Clone)]
pub struct ContextState {
    frame: ContextFrame,
}

thread_local! {
    static STACK: RefCell<Vec<ContextFrame>> = const { RefCell::new(Vec::new()) };
}

// ============================================================================
// Stack operations
// ============================================================================

/// Push a frame backed by the process-default property record.
pub fn push() {
    STACK.with(|s| s.borrow_mut().push(ContextFrame::with_props(None)));
}

/// Push a frame backed by a caller property record.
pub fn push_with_props(props: PropsHandle) {
    STACK.with(|s| s.borrow_mut().push(ContextFrame::with_props(Some(props))));
}

/// Pop the innermost frame. With `update_cached_outputs`, fields the library
/// `set` during the call are written back into the frame's property list.
/// Returns false on an unbalanced pop.
pub fn pop(update_cached_outputs: bool) -> bool {
    STACK.with(|s| match s.borrow_mut().pop() {
        Some(frame) => {
            if update_cached_outputs {
                frame.write_back();
            }
            true
        }
        None => false,
    })
}

/// Number of frames on this thread's stack.
pub fn depth() -> usize {
    STACK.with(|s| s.borrow().len())
}

/// Clone the top frame for later reinstatement.
pub fn retrieve_state() -> Option<ContextState> {
    STACK.with(|s| s.borrow().last().cloned().map(|frame| ContextState { frame }))
}

/// Push a previously retrieved frame back as the innermost context.
pub fn restore_state(state: &ContextState) {
    STACK.with(|s| s.borrow_mut().push(state.frame.clone()));
}

/// Release a retrieved state. Present for symmetry with virtualizing
/// callers that treat states as opaque handles.
pub fn free_state(state: ContextState) {
    drop(state);
}

/// RAII guard for a balanced push/pop pair.
pub struct ContextScope {
    update: bool,
}

impl ContextScope {
    pub fn new() -> Self {
        push();
        Self { update: false }
    }

    pub fn with_props(props: PropsHandle) -> Self {
        push_with_props(props);
        Self { update: true }
    }
}

impl Default for ContextScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        pop(self.update);
    }
}

// ============================================================================
// Field accessors
// ============================================================================

fn with_top<R>(f: impl FnOnce(&mut ContextFrame) -> R) -> Option<R> {
    STACK.with(|s| s.borrow_mut().last_mut().map(f))
}

/// The tag applied to entries inserted or loaded under this context.
pub fn get_tag() -> Tag {
    with_top(|frame| frame.tag.get()).flatten().unwrap_or(Tag::INVALID)
}

pub fn set_tag(tag: Tag) {
    with_top(|frame| frame.tag.cache(tag));
}

/// The flush ring applied to entries touched under this context.
pub fn get_ring() -> Ring {
    with_top(|frame| frame.ring.get()).flatten().unwrap_or_default()
}

pub fn set_ring(ring: Ring) {
    with_top(|frame| frame.ring.cache(ring));
}

pub fn get_xfer_mode() -> TransferMode {
    read_field(
        |frame| frame.xfer_mode.get(),
        |props| props.xfer_mode,
        |frame, v| frame.xfer_mode.cache(v),
    )
}

/// Library-side override, written back on `pop(true)`.
pub fn set_xfer_mode(mode: TransferMode) {
    with_top(|frame| frame.xfer_mode.set(mode));
}

pub fn get_coll_metadata_read() -> bool {
    read_field(
        |frame| frame.coll_metadata_read.get(),
        |props| props.coll_metadata_read,
        |frame, v| frame.coll_metadata_read.cache(v),
    )
}

pub fn set_coll_metadata_read(on: bool) {
    with_top(|frame| frame.coll_metadata_read.set(on));
}

pub fn get_vector_io_size() -> usize {
    read_field(
        |frame| frame.vector_io_size.get(),
        |props| props.vector_io_size,
        |frame, v| frame.vector_io_size.cache(v),
    )
}

pub fn set_vector_io_size(size: usize) {
    with_top(|frame| frame.vector_io_size.set(size));
}

pub fn get_error_detection() -> bool {
    read_field(
        |frame| frame.error_detection.get(),
        |props| props.error_detection,
        |frame, v| frame.error_detection.cache(v),
    )
}

pub fn set_error_detection(on: bool) {
    with_top(|frame| frame.error_detection.set(on));
}

/// Shared read path: cached value if valid, else the frame's property list
/// (caching the result), else the process default.
fn read_field<T: Clone>(
    get: impl Fn(&mut ContextFrame) -> Option<T>,
    from_props: impl Fn(&TransferProps) -> T,
    cache: impl Fn(&mut ContextFrame, T),
) -> T {
    STACK.with(|s| {
        let mut stack = s.borrow_mut();
        match stack.last_mut() {
            Some(frame) => {
                if let Some(v) = get(frame) {
                    return v;
                }
                let value = match &frame.props {
                    Some(props) => from_props(&props.read()),
                    None => from_props(&DEFAULT_PROPS),
                };
                cache(frame, value.clone());
                value
            }
            None => from_props(&DEFAULT_PROPS),
        }
    })
}
