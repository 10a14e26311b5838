//! Immutable ordering configuration for a single detour.

/// Ordering metadata attached to one detour.
///
/// A config names its detour with an [`id`](DetourConfig::id) (not required to be unique,
/// but used by other detours' ordering queries), an optional [`priority`](DetourConfig::priority),
/// and the ids of detours it must run [`before`](DetourConfig::before) or
/// [`after`](DetourConfig::after). An auxiliary [`sub_priority`](DetourConfig::sub_priority)
/// refines ties among detours sharing the same priority; it is an advanced knob and rarely
/// needed.
///
/// Configs are immutable: each `with_*`/`add_*` builder consumes the config and returns a
/// new value, so shared configs are never mutated behind a caller's back.
///
/// Detours registered *without* a config are appended after every configured detour, in an
/// unspecified order among themselves (observably most-recently-added first, but that is
/// not a contract).
///
/// # Examples
///
/// ```rust
/// use hookchain::DetourConfig;
///
/// let base = DetourConfig::new("ui.theme").with_priority(10);
/// let derived = base.clone().add_before("ui.render");
///
/// assert!(base.before().is_empty());
/// assert_eq!(derived.before(), ["ui.render"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetourConfig {
    id: String,
    priority: Option<i32>,
    before: Vec<String>,
    after: Vec<String>,
    sub_priority: i32,
}

impl DetourConfig {
    /// Creates a config with the given id, no priority, and no ordering constraints.
    pub fn new(id: impl Into<String>) -> Self {
        DetourConfig {
            id: id.into(),
            priority: None,
            before: Vec::new(),
            after: Vec::new(),
            sub_priority: 0,
        }
    }

    /// Returns a copy of this config with the given priority.
    ///
    /// Higher priorities run earlier in the chain. Detours without a priority always run
    /// after detours that have one.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Returns a copy of this config with the priority removed.
    #[must_use]
    pub fn without_priority(mut self) -> Self {
        self.priority = None;
        self
    }

    /// Returns a copy of this config with the given sub-priority.
    ///
    /// Sub-priorities only break ties among detours that share the same priority; higher
    /// sub-priorities run earlier within the tie.
    #[must_use]
    pub fn with_sub_priority(mut self, sub_priority: i32) -> Self {
        self.sub_priority = sub_priority;
        self
    }

    /// Returns a copy of this config whose before-set is replaced by `ids`.
    #[must_use]
    pub fn with_before<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.before = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Returns a copy of this config whose after-set is replaced by `ids`.
    #[must_use]
    pub fn with_after<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Returns a copy of this config with `id` appended to the before-set.
    ///
    /// The detour carrying this config will be sequenced ahead of every applied detour
    /// whose config id equals `id`.
    #[must_use]
    pub fn add_before(mut self, id: impl Into<String>) -> Self {
        self.before.push(id.into());
        self
    }

    /// Returns a copy of this config with `id` appended to the after-set.
    ///
    /// The detour carrying this config will be sequenced after every applied detour whose
    /// config id equals `id`.
    #[must_use]
    pub fn add_after(mut self, id: impl Into<String>) -> Self {
        self.after.push(id.into());
        self
    }

    /// The id of the detour this config belongs to.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The priority, if one was assigned.
    #[must_use]
    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    /// Ids this detour must run before.
    #[must_use]
    pub fn before(&self) -> &[String] {
        &self.before
    }

    /// Ids this detour must run after.
    #[must_use]
    pub fn after(&self) -> &[String] {
        &self.after
    }

    /// The tie-breaking sub-priority.
    #[must_use]
    pub fn sub_priority(&self) -> i32 {
        self.sub_priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_has_no_priority_or_constraints() {
        let config = DetourConfig::new("mod.core");
        assert_eq!(config.id(), "mod.core");
        assert_eq!(config.priority(), None);
        assert!(config.before().is_empty());
        assert!(config.after().is_empty());
        assert_eq!(config.sub_priority(), 0);
    }

    #[test]
    fn test_builders_do_not_mutate_source() {
        let base = DetourConfig::new("mod.a").with_priority(5);
        let derived = base
            .clone()
            .with_priority(7)
            .add_before("mod.b")
            .add_after("mod.c")
            .with_sub_priority(-1);

        assert_eq!(base.priority(), Some(5));
        assert!(base.before().is_empty());

        assert_eq!(derived.priority(), Some(7));
        assert_eq!(derived.before(), ["mod.b"]);
        assert_eq!(derived.after(), ["mod.c"]);
        assert_eq!(derived.sub_priority(), -1);
    }

    #[test]
    fn test_with_before_replaces_existing_entries() {
        let config = DetourConfig::new("mod.a")
            .add_before("mod.b")
            .with_before(["mod.c", "mod.d"]);
        assert_eq!(config.before(), ["mod.c", "mod.d"]);
    }

    #[test]
    fn test_without_priority_clears_priority() {
        let config = DetourConfig::new("mod.a").with_priority(42).without_priority();
        assert_eq!(config.priority(), None);
    }
}
