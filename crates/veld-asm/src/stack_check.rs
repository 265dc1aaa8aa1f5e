//! Stack-balance validation.
//!
//! Each emitter owns a [`StackChecker`] and reports every stack-pointer
//! movement to it. The checker tracks depth below the current frame base
//! and catches two classes of compiler bug the moment they are emitted:
//! a stack-pointer add that would pop past the frame base, and a function
//! whose pushes and pops do not balance by epilogue time.
//!
//! Violations are internal errors and panic immediately, naming the
//! section so the failing stage is identifiable from the abort message.

/// Tracks push/pop balance within the current frame.
#[derive(Debug, Default)]
pub struct StackChecker {
    /// Bytes currently on the stack below the frame base.
    depth: i64,
    /// Depth at the last `enter_frame`, for nested-frame emission.
    frame_bases: Vec<i64>,
}

impl StackChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A prologue established a new frame of `bytes` total.
    pub fn enter_frame(&mut self, bytes: u32) {
        self.depth += i64::from(bytes);
        self.frame_bases.push(self.depth);
    }

    /// An epilogue tore the current frame down. Panics when pushes and
    /// pops inside the frame did not balance.
    pub fn leave_frame(&mut self, bytes: u32) {
        let base = self
            .frame_bases
            .pop()
            .expect("epilogue without matching prologue");
        if self.depth != base {
            panic!(
                "stack imbalance: {} bytes left on the stack at epilogue",
                self.depth - base
            );
        }
        self.depth -= i64::from(bytes);
    }

    /// The stack pointer moved down by `bytes` (push, sub sp).
    pub fn grow(&mut self, bytes: u32) {
        self.depth += i64::from(bytes);
    }

    /// The stack pointer moved up by `bytes` (pop, add sp). Panics when
    /// this would pop past the innermost frame base.
    pub fn shrink(&mut self, bytes: u32) {
        self.depth -= i64::from(bytes);
        let base = self.frame_bases.last().copied().unwrap_or(0);
        if self.depth < base {
            panic!(
                "stack imbalance: stack-pointer add drops {} bytes below the frame base",
                base - self.depth
            );
        }
    }

    /// True when every frame has been left and depth is zero.
    pub fn is_balanced(&self) -> bool {
        self.depth == 0 && self.frame_bases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_frame() {
        let mut c = StackChecker::new();
        c.enter_frame(32);
        c.grow(16);
        c.shrink(16);
        c.leave_frame(32);
        assert!(c.is_balanced());
    }

    #[test]
    #[should_panic(expected = "below the frame base")]
    fn test_pop_past_frame_base() {
        let mut c = StackChecker::new();
        c.enter_frame(16);
        c.shrink(8);
    }

    #[test]
    #[should_panic(expected = "left on the stack")]
    fn test_unbalanced_epilogue() {
        let mut c = StackChecker::new();
        c.enter_frame(16);
        c.grow(8);
        c.leave_frame(16);
    }

    #[test]
    fn test_nested_frames() {
        let mut c = StackChecker::new();
        c.enter_frame(16);
        c.enter_frame(48);
        c.grow(16);
        c.shrink(16);
        c.leave_frame(48);
        c.leave_frame(16);
        assert!(c.is_balanced());
    }
}
