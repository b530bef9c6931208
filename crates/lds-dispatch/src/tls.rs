//! Per-thread `included`/`excluded` key sets that bias kernel selection,
//! plus scoped guards that restore them on every exit path.

use std::cell::Cell;

use lds_core::{DispatchKey, DispatchKeySet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LocalDispatchKeySet {
    pub included: DispatchKeySet,
    pub excluded: DispatchKeySet,
}

impl LocalDispatchKeySet {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            included: DispatchKeySet::EMPTY,
            excluded: DispatchKeySet::EMPTY,
        }
    }

    #[must_use]
    pub const fn with_included(mut self, keys: DispatchKeySet) -> Self {
        self.included = keys;
        self
    }

    #[must_use]
    pub const fn with_excluded(mut self, keys: DispatchKeySet) -> Self {
        self.excluded = keys;
        self
    }
}

thread_local! {
    static LOCAL_DISPATCH_KEY_SET: Cell<LocalDispatchKeySet> =
        const { Cell::new(LocalDispatchKeySet::empty()) };
}

#[must_use]
pub fn tls_local_dispatch_key_set() -> LocalDispatchKeySet {
    LOCAL_DISPATCH_KEY_SET.with(Cell::get)
}

/// Replaces both sets at once. Callers own restoring whatever structure they
/// rely on afterwards; [`LocalDispatchKeySetGuard`] does it on scope exit.
pub fn force_tls_local_dispatch_key_set(state: LocalDispatchKeySet) {
    LOCAL_DISPATCH_KEY_SET.with(|cell| cell.set(state));
}

#[must_use]
pub fn tls_is_dispatch_key_included(key: DispatchKey) -> bool {
    tls_local_dispatch_key_set().included.has(key)
}

#[must_use]
pub fn tls_is_dispatch_key_excluded(key: DispatchKey) -> bool {
    tls_local_dispatch_key_set().excluded.has(key)
}

pub fn tls_set_dispatch_key_included(key: DispatchKey, enabled: bool) {
    LOCAL_DISPATCH_KEY_SET.with(|cell| {
        let mut state = cell.get();
        if enabled {
            state.included.add(key);
        } else {
            state.included.remove(key);
        }
        cell.set(state);
    });
}

pub fn tls_set_dispatch_key_excluded(key: DispatchKey, enabled: bool) {
    LOCAL_DISPATCH_KEY_SET.with(|cell| {
        let mut state = cell.get();
        if enabled {
            state.excluded.add(key);
        } else {
            state.excluded.remove(key);
        }
        cell.set(state);
    });
}

fn set_excluded(keys: DispatchKeySet) {
    LOCAL_DISPATCH_KEY_SET.with(|cell| {
        let state = cell.get();
        cell.set(state.with_excluded(keys));
    });
}

fn set_included(keys: DispatchKeySet) {
    LOCAL_DISPATCH_KEY_SET.with(|cell| {
        let state = cell.get();
        cell.set(state.with_included(keys));
    });
}

/// Unions `keys` into the excluded set; restores the previous excluded set
/// when dropped. Only `excluded` is restored, so included-key toggles made in
/// the scope (layer pushes, for one) survive it.
#[derive(Debug)]
#[must_use = "the exclusion is lifted as soon as the guard is dropped"]
pub struct ExcludeDispatchKeyGuard {
    previous: DispatchKeySet,
}

impl ExcludeDispatchKeyGuard {
    pub fn new(keys: DispatchKeySet) -> Self {
        let previous = tls_local_dispatch_key_set().excluded;
        set_excluded(previous.union(keys));
        Self { previous }
    }

    #[must_use]
    pub fn previous(&self) -> DispatchKeySet {
        self.previous
    }
}

impl Drop for ExcludeDispatchKeyGuard {
    fn drop(&mut self) {
        set_excluded(self.previous);
    }
}

/// Mirror of [`ExcludeDispatchKeyGuard`] for the included set.
#[derive(Debug)]
#[must_use = "the inclusion is lifted as soon as the guard is dropped"]
pub struct IncludeDispatchKeyGuard {
    previous: DispatchKeySet,
}

impl IncludeDispatchKeyGuard {
    pub fn new(keys: DispatchKeySet) -> Self {
        let previous = tls_local_dispatch_key_set().included;
        set_included(previous.union(keys));
        Self { previous }
    }
}

impl Drop for IncludeDispatchKeyGuard {
    fn drop(&mut self) {
        set_included(self.previous);
    }
}

/// Snapshots the whole thread-local state and puts it back when dropped.
#[derive(Debug)]
#[must_use = "the snapshot is restored as soon as the guard is dropped"]
pub struct LocalDispatchKeySetGuard {
    saved: LocalDispatchKeySet,
}

impl LocalDispatchKeySetGuard {
    pub fn new() -> Self {
        Self {
            saved: tls_local_dispatch_key_set(),
        }
    }

    /// Snapshots, then forces `state` for the lifetime of the guard.
    pub fn force(state: LocalDispatchKeySet) -> Self {
        let guard = Self::new();
        force_tls_local_dispatch_key_set(state);
        guard
    }

    #[must_use]
    pub fn saved(&self) -> LocalDispatchKeySet {
        self.saved
    }
}

impl Default for LocalDispatchKeySetGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalDispatchKeySetGuard {
    fn drop(&mut self) {
        force_tls_local_dispatch_key_set(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use lds_core::{DispatchKey, DispatchKeySet};
    use proptest::prelude::*;

    use super::{
        ExcludeDispatchKeyGuard, IncludeDispatchKeyGuard, LocalDispatchKeySet,
        LocalDispatchKeySetGuard, force_tls_local_dispatch_key_set, tls_is_dispatch_key_excluded,
        tls_is_dispatch_key_included, tls_local_dispatch_key_set, tls_set_dispatch_key_excluded,
        tls_set_dispatch_key_included,
    };

    fn keyset_from_mask(mask: u16) -> DispatchKeySet {
        DispatchKey::all()
            .iter()
            .enumerate()
            .filter(|(idx, _)| mask & (1 << idx) != 0)
            .map(|(_, key)| *key)
            .collect()
    }

    fn fail_under_guard() {
        panic!("kernel failure under guard");
    }

    #[test]
    fn fresh_thread_starts_with_empty_state() {
        std::thread::spawn(|| {
            assert_eq!(tls_local_dispatch_key_set(), LocalDispatchKeySet::empty());
        })
        .join()
        .expect("worker thread should not panic");
    }

    #[test]
    fn set_included_toggles_a_single_key() {
        let _restore = LocalDispatchKeySetGuard::new();
        tls_set_dispatch_key_included(DispatchKey::Batched, true);
        assert!(tls_is_dispatch_key_included(DispatchKey::Batched));
        assert!(!tls_is_dispatch_key_included(DispatchKey::CPU));
        tls_set_dispatch_key_included(DispatchKey::Batched, false);
        assert!(!tls_is_dispatch_key_included(DispatchKey::Batched));

        tls_set_dispatch_key_excluded(DispatchKey::CUDA, true);
        assert!(tls_is_dispatch_key_excluded(DispatchKey::CUDA));
    }

    #[test]
    fn exclude_guards_nest_and_restore_in_order() {
        let _restore = LocalDispatchKeySetGuard::new();
        let before = tls_local_dispatch_key_set().excluded;
        {
            let _outer = ExcludeDispatchKeyGuard::new(DispatchKeySet::from_keys(&[DispatchKey::CPU]));
            {
                let inner =
                    ExcludeDispatchKeyGuard::new(DispatchKeySet::from_keys(&[DispatchKey::CUDA]));
                assert!(tls_is_dispatch_key_excluded(DispatchKey::CPU));
                assert!(tls_is_dispatch_key_excluded(DispatchKey::CUDA));
                assert!(inner.previous().has(DispatchKey::CPU));
            }
            assert!(tls_is_dispatch_key_excluded(DispatchKey::CPU));
            assert!(!tls_is_dispatch_key_excluded(DispatchKey::CUDA));
        }
        assert_eq!(tls_local_dispatch_key_set().excluded, before);
    }

    #[test]
    fn exclude_guard_leaves_included_changes_alone() {
        let _restore = LocalDispatchKeySetGuard::new();
        {
            let _guard = ExcludeDispatchKeyGuard::new(DispatchKeySet::FULL);
            tls_set_dispatch_key_included(DispatchKey::DynamicLayerFront, true);
        }
        assert!(tls_is_dispatch_key_included(DispatchKey::DynamicLayerFront));
        assert!(tls_local_dispatch_key_set().excluded.is_empty());
    }

    #[test]
    fn include_guard_restores_previous_included_set() {
        let _restore = LocalDispatchKeySetGuard::new();
        {
            let _guard = IncludeDispatchKeyGuard::new(DispatchKeySet::from_keys(&[
                DispatchKey::DynamicLayerFront,
                DispatchKey::DynamicLayerBack,
            ]));
            assert!(tls_is_dispatch_key_included(DispatchKey::DynamicLayerBack));
        }
        assert!(!tls_is_dispatch_key_included(DispatchKey::DynamicLayerBack));
    }

    #[test]
    fn exclude_guard_restores_on_panic() {
        let _restore = LocalDispatchKeySetGuard::new();
        let before = tls_local_dispatch_key_set();
        let outcome = std::panic::catch_unwind(|| {
            let _guard = ExcludeDispatchKeyGuard::new(DispatchKeySet::FULL);
            fail_under_guard();
        });
        assert!(outcome.is_err());
        assert_eq!(tls_local_dispatch_key_set(), before);
    }

    #[test]
    fn force_guard_replaces_then_restores_everything() {
        let _restore = LocalDispatchKeySetGuard::new();
        tls_set_dispatch_key_included(DispatchKey::Batched, true);
        tls_set_dispatch_key_excluded(DispatchKey::CPU, true);
        let before = tls_local_dispatch_key_set();
        {
            let guard = LocalDispatchKeySetGuard::force(LocalDispatchKeySet::empty());
            assert_eq!(tls_local_dispatch_key_set(), LocalDispatchKeySet::empty());
            assert_eq!(guard.saved(), before);
            force_tls_local_dispatch_key_set(
                LocalDispatchKeySet::empty().with_excluded(DispatchKeySet::FULL),
            );
        }
        assert_eq!(tls_local_dispatch_key_set(), before);
    }

    proptest! {
        #[test]
        fn prop_exclude_guard_restores_prior_excluded(
            initial in 0u16..(1u16 << 13),
            first in 0u16..(1u16 << 13),
            second in 0u16..(1u16 << 13),
        ) {
            let _restore = LocalDispatchKeySetGuard::force(
                LocalDispatchKeySet::empty().with_excluded(keyset_from_mask(initial)),
            );
            let before = tls_local_dispatch_key_set();
            {
                let _a = ExcludeDispatchKeyGuard::new(keyset_from_mask(first));
                let _b = ExcludeDispatchKeyGuard::new(keyset_from_mask(second));
                let now = tls_local_dispatch_key_set().excluded;
                prop_assert!(keyset_from_mask(first).is_subset_of(now));
                prop_assert!(keyset_from_mask(second).is_subset_of(now));
                prop_assert!(before.excluded.is_subset_of(now));
            }
            prop_assert_eq!(tls_local_dispatch_key_set(), before);
        }
    }
}
