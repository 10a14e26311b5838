use thiserror::Error;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers all possible error conditions that can occur while ordering, applying,
/// removing, and introspecting detour chains. Each variant provides specific context about
/// the failure mode to enable appropriate error handling.
///
/// # Error Categories
///
/// ## Configuration Errors
/// - [`Error::OrderingCycle`] - Cyclic before/after constraints between detours
///
/// Note that a detour naming the same id in both its before and after sets is *not* an
/// error: the before relation wins and a warning is recorded in the ordering conflict
/// journal of the affected target.
///
/// ## Chain Mutation Errors
/// - [`Error::ChainUpdateReentrancy`] - Rebuild attempted from a thread inside the chain
/// - [`Error::AlreadyApplied`] - Detour added twice without an intervening remove
/// - [`Error::NotApplied`] - Detour removed (or undone) while not applied
///
/// ## Handle Errors
/// - [`Error::HookDisposed`] - Operation on a hook handle after disposal
///
/// ## Collaborator Errors
/// - [`Error::Backend`] - Failure reported by the injected runtime or factory
/// - [`Error::RemovedStub`] - A call reached a stub belonging to a removed detour
///
/// # Examples
///
/// ```rust,no_run
/// use hookchain::{DetourConfig, Error};
///
/// # fn add(_: &DetourConfig) -> Result<(), Error> { Ok(()) }
/// let config = DetourConfig::new("mod.a").add_before("mod.b");
/// match add(&config) {
///     Ok(()) => println!("detour applied"),
///     Err(Error::OrderingCycle { id }) => {
///         eprintln!("cyclic ordering constraint involving '{id}'");
///     }
///     Err(e) => eprintln!("other error: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// A cycle was detected while computing the detour order for a target.
    ///
    /// This error occurs when the transitive before/after constraints of the
    /// detours applied to one target contradict each other, for example A
    /// before B and B before A. A cyclic constraint set is a configuration
    /// bug; the operation that introduced the closing edge fails and the
    /// realized order of the target is unspecified until the offending
    /// detour is removed.
    ///
    /// The associated id names the detour at which the cycle was detected.
    #[error("Cycle detected in detour ordering constraints involving '{id}'")]
    OrderingCycle {
        /// Id of the detour at which the cycle was detected
        id: String,
    },

    /// The detour chain of this target is being updated by the current thread.
    ///
    /// Raised when a chain rebuild is requested from a thread that is itself
    /// still inside a call through that chain, or when a call enters the
    /// chain on the thread that is currently rebuilding it. Blocking would
    /// deadlock, so the situation is reported immediately instead.
    #[error("Detour chain is being updated by the current thread")]
    ChainUpdateReentrancy,

    /// Trying to add a detour which was already added.
    ///
    /// A detour handle may only be applied once at a time. Undo it before
    /// applying it again.
    #[error("Trying to add a detour which was already added")]
    AlreadyApplied,

    /// Trying to remove a detour which wasn't added.
    ///
    /// Raised when undoing a detour that is not currently part of its
    /// target's chain.
    #[error("Trying to remove a detour which wasn't added")]
    NotApplied,

    /// Operation on a disposed hook handle.
    ///
    /// Once a hook has been disposed its trampoline has been surrendered and
    /// it can never be applied again; any further operation on the handle
    /// reports this error.
    #[error("Hook has been disposed")]
    HookDisposed,

    /// Failure reported by an injected collaborator.
    ///
    /// The runtime and detour factory that physically clone method bodies,
    /// materialize stubs, and write redirects are supplied from outside this
    /// crate. Their failures are wrapped in this variant and propagate
    /// uncaught; a failure in the middle of a chain walk may leave the chain
    /// partially re-pointed.
    #[error("{0}")]
    Backend(String),

    /// A call reached the stub of a removed detour.
    ///
    /// Stubs owned by removed detours are re-pointed at a per-signature
    /// raising stub until they are provably unused and can return to the
    /// pool. Observing this error means a stale code path invoked one.
    #[error("Detour has been removed")]
    RemovedStub,
}
