//! Functions specialized against bound structural arguments.
//!
//! A [`Snapshot`] owns the non-varying arguments of a step function (model,
//! optimizers, loop length) and records their structural [`Fingerprint`] at
//! build time. Every call compares the live fingerprint against the recorded
//! one first; a difference means the specialization is stale.

use tracing::info;

use crate::core::{Fingerprint, PcError, PcResult, ParamStore};

/// Anything whose structure can be fingerprinted.
pub trait Bound {
    fn fingerprint(&self) -> Fingerprint;
}

impl Bound for ParamStore {
    fn fingerprint(&self) -> Fingerprint {
        ParamStore::fingerprint(self)
    }
}

/// What to do when the bound structure changed since the last build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePolicy {
    /// Fail with `CompilationStale`.
    #[default]
    Error,
    /// Rebuild against the new structure and continue.
    Recompile,
}

/// Step function `f(&mut bound, args)` specialized against `bound`.
pub struct Snapshot<B, F> {
    bound: B,
    f: F,
    compiled: Fingerprint,
    policy: StalePolicy,
    compilations: usize,
}

impl<B: Bound, F> Snapshot<B, F> {
    pub fn new(bound: B, f: F) -> Self {
        let compiled = bound.fingerprint();
        Self {
            bound,
            f,
            compiled,
            policy: StalePolicy::default(),
            compilations: 1,
        }
    }

    pub fn with_policy(mut self, policy: StalePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Invoke the specialized function with the varying arguments only.
    ///
    /// # Errors
    /// `CompilationStale` if the bound structure changed and the policy is
    /// [`StalePolicy::Error`]; otherwise whatever `f` returns.
    pub fn call<A: ?Sized, R>(&mut self, args: &A) -> PcResult<R>
    where
        F: FnMut(&mut B, &A) -> PcResult<R>,
    {
        let live = self.bound.fingerprint();
        if live != self.compiled {
            match self.policy {
                StalePolicy::Error => {
                    return Err(PcError::CompilationStale {
                        expected: self.compiled,
                        found: live,
                    })
                }
                StalePolicy::Recompile => {
                    info!(from = %self.compiled, to = %live, "recompiling stale snapshot");
                    self.rebuild();
                }
            }
        }
        (self.f)(&mut self.bound, args)
    }

    /// Re-specialize against the current structure.
    pub fn rebuild(&mut self) {
        self.compiled = self.bound.fingerprint();
        self.compilations += 1;
    }

    pub fn is_stale(&self) -> bool {
        self.bound.fingerprint() != self.compiled
    }

    /// Number of builds so far, including the initial one.
    pub fn compilations(&self) -> usize {
        self.compilations
    }

    pub fn bound(&self) -> &B {
        &self.bound
    }

    /// Mutable access to the bound arguments. Structural edits made here
    /// surface as staleness on the next call.
    pub fn bound_mut(&mut self) -> &mut B {
        &mut self.bound
    }

    pub fn into_bound(self) -> B {
        self.bound
    }
}
