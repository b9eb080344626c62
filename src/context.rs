//! Per-resolution bookkeeping
//!
//! A [`ConstructionContext`] lives for exactly one top-level resolution and
//! every nested resolution it triggers. It is threaded explicitly through the
//! resolver rather than kept in thread-local state.

use crate::provider::Binding;
use crate::{DiError, Result};

/// One in-progress construction
struct Frame {
    binding: Binding,
    /// Deepest cache depth among the dependencies consumed so far
    deepest: Option<u32>,
}

/// Cycle guard plus nested-depth accumulator.
#[derive(Default)]
pub(crate) struct ConstructionContext {
    frames: Vec<Frame>,
    /// Set once a cycle is found; every enclosing frame fails with it
    poisoned: Option<DiError>,
}

impl ConstructionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail if `binding` is already being constructed in this chain.
    pub fn check_not_in_progress(&mut self, binding: &Binding) -> Result<()> {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }

        if self.frames.iter().any(|f| &f.binding == binding) {
            return Err(self.fail_cycle(binding, &[]));
        }

        Ok(())
    }

    /// Fail because `binding` waits, through other threads' constructions
    /// waiting on `hops`, on a construction this thread is running.
    pub fn cross_thread_cycle(&mut self, binding: &Binding, hops: &[Binding]) -> DiError {
        if hops.is_empty() {
            // The gate this thread leads is the one it asked for
            return self.fail_cycle(binding, std::slice::from_ref(binding));
        }
        self.fail_cycle(binding, hops)
    }

    /// Adopt a cycle reported by the construction this chain waited on.
    pub fn poison(&mut self, err: DiError) {
        self.poisoned.get_or_insert(err);
    }

    fn fail_cycle(&mut self, binding: &Binding, hops: &[Binding]) -> DiError {
        let path = self
            .frames
            .iter()
            .map(|f| &f.binding)
            .chain(std::iter::once(binding))
            .chain(hops)
            .map(ToString::to_string)
            .collect();

        let err = DiError::CircularDependency { path };
        self.poisoned = Some(err.clone());
        err
    }

    /// Push a frame for `binding`.
    pub fn enter(&mut self, binding: &Binding) -> Result<()> {
        self.check_not_in_progress(binding)?;
        self.frames.push(Frame {
            binding: binding.clone(),
            deepest: None,
        });
        Ok(())
    }

    /// Pop the innermost frame, returning the deepest depth it observed.
    pub fn exit(&mut self) -> Option<u32> {
        self.frames.pop().and_then(|f| f.deepest)
    }

    /// Record that the innermost construction consumed something cached at `depth`.
    ///
    /// `None` carries no signal. Outside any construction this is a no-op.
    pub fn observe(&mut self, depth: Option<u32>) {
        if let (Some(depth), Some(frame)) = (depth, self.frames.last_mut()) {
            frame.deepest = Some(frame.deepest.map_or(depth, |d| d.max(depth)));
        }
    }

    /// The cycle error, once one was detected
    pub fn poisoned(&self) -> Option<DiError> {
        self.poisoned.clone()
    }

    /// Number of constructions currently in progress
    pub fn nesting(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    struct Beta;

    #[test]
    fn test_observe_tracks_maximum() {
        let mut ctx = ConstructionContext::new();
        ctx.enter(&Binding::default_of::<Alpha>()).unwrap();

        ctx.observe(Some(1));
        ctx.observe(None);
        ctx.observe(Some(3));
        ctx.observe(Some(2));

        assert_eq!(ctx.exit(), Some(3));
        assert_eq!(ctx.nesting(), 0);
    }

    #[test]
    fn test_frames_are_independent() {
        let mut ctx = ConstructionContext::new();
        ctx.enter(&Binding::default_of::<Alpha>()).unwrap();
        ctx.observe(Some(1));

        ctx.enter(&Binding::default_of::<Beta>()).unwrap();
        ctx.observe(Some(4));
        assert_eq!(ctx.exit(), Some(4));

        assert_eq!(ctx.exit(), Some(1));
    }

    #[test]
    fn test_no_dependencies_no_depth() {
        let mut ctx = ConstructionContext::new();
        ctx.observe(Some(5));
        ctx.enter(&Binding::default_of::<Alpha>()).unwrap();
        assert_eq!(ctx.exit(), None);
    }

    #[test]
    fn test_cycle_poisons_context() {
        let mut ctx = ConstructionContext::new();
        ctx.enter(&Binding::default_of::<Alpha>()).unwrap();
        ctx.enter(&Binding::default_of::<Beta>()).unwrap();

        let err = ctx.enter(&Binding::default_of::<Alpha>()).unwrap_err();
        match &err {
            DiError::CircularDependency { path } => assert_eq!(path.len(), 3),
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(ctx.poisoned(), Some(err.clone()));
        // unrelated bindings fail too once poisoned
        assert!(ctx.check_not_in_progress(&Binding::of::<Beta>("other")).is_err());
    }

    #[test]
    fn test_cross_thread_cycle_path() {
        let alpha = Binding::default_of::<Alpha>();
        let beta = Binding::default_of::<Beta>();

        let mut ctx = ConstructionContext::new();
        ctx.enter(&beta).unwrap();
        let err = ctx.cross_thread_cycle(&alpha, std::slice::from_ref(&beta));

        match &err {
            DiError::CircularDependency { path } => {
                assert_eq!(path.len(), 3);
                assert_eq!(path[0], path[2]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ctx.poisoned(), Some(err));
    }

    #[test]
    fn test_adopted_cycle_kept_first() {
        let first = DiError::CircularDependency {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        let mut ctx = ConstructionContext::new();
        ctx.poison(first.clone());
        ctx.poison(DiError::CircularDependency { path: Vec::new() });

        assert_eq!(ctx.poisoned(), Some(first));
        assert!(ctx.enter(&Binding::default_of::<Alpha>()).is_err());
    }
}
