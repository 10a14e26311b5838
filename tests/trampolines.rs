//! Integration tests for trampoline pooling and the stolen-stub quarantine.
//!
//! The property under test: no hook churn pattern leaks stubs. Every trampoline rented
//! for a detour either sits in a live chain position, waits in the quarantine of a gate
//! that has not drained yet, or is back in the pool for reuse.

use hookchain::testing::{trace_managed_call, MockRuntime};
use hookchain::{prelude::*, Result};
use proptest::prelude::*;
use std::sync::Arc;

fn sig() -> Signature {
    Signature::new("() -> ()")
}

fn setup() -> (Arc<MockRuntime>, DetourRegistry) {
    let runtime = MockRuntime::new();
    let registry = DetourRegistry::new(runtime.clone(), runtime.clone());
    (runtime, registry)
}

/// Test that apply/undo cycles recycle one stub instead of minting per cycle.
///
/// The first install mints two stubs: the chain's permanent root trampoline and the
/// hook's next-trampoline. Re-applying after an undo and drain rents the same stub
/// back, so the mint counter stays flat no matter how often the hook toggles.
#[test]
fn test_stub_recycled_across_hook_cycles() -> Result<()> {
    let (runtime, registry) = setup();
    let target = CodeRef::new("game::update", sig());
    let pool = registry.trampoline_pool();

    let hook = registry.hook(&target, &CodeRef::new("mod::update", sig()))?;
    assert_eq!(runtime.stubs_minted(), 2);
    assert_eq!(pool.outstanding(), 2);

    for _ in 0..3 {
        hook.undo()?;
        // still quarantined on the gate, not yet reusable
        assert_eq!(pool.pooled(), 0);
        assert_eq!(pool.outstanding(), 2);

        registry.method_info(&target).unwrap().drain_stolen()?;
        assert_eq!(pool.pooled(), 1);
        assert_eq!(pool.outstanding(), 1);

        hook.apply()?;
        assert_eq!(pool.pooled(), 0);
        assert_eq!(pool.outstanding(), 2);
    }
    assert_eq!(runtime.stubs_minted(), 2);
    Ok(())
}

/// Test that a stolen stub stays quarantined while a call is inside the target and is
/// released automatically when the last call exits.
#[test]
fn test_stolen_stub_quarantined_while_call_active() -> Result<()> {
    let (runtime, registry) = setup();
    let target = CodeRef::new("game::render", sig());
    let pool = registry.trampoline_pool();

    let _keep = registry.hook(&target, &CodeRef::new("keep::render", sig()))?;
    let victim = registry.hook(&target, &CodeRef::new("victim::render", sig()))?;
    victim.undo()?;

    // a call is inside; forcing a drain from its own frame is refused
    let proxy = runtime.resolve(&target).unwrap();
    let gate = runtime.proxy_info(&proxy).unwrap().gate;
    let call = gate.enter()?;

    let info = registry.method_info(&target).unwrap();
    assert!(matches!(
        info.drain_stolen(),
        Err(Error::ChainUpdateReentrancy)
    ));
    assert_eq!(pool.pooled(), 0);

    // last call out flushes the quarantine without anyone asking
    drop(call);
    assert_eq!(pool.pooled(), 1);
    info.drain_stolen()?;
    Ok(())
}

/// Test that a failed install hands its freshly rented stub straight back.
#[test]
fn test_failed_install_recycles_stub() -> Result<()> {
    let (runtime, registry) = setup();
    let target = CodeRef::new("game::net", sig());
    let pool = registry.trampoline_pool();

    runtime.fail_next_detour("patch refused");
    assert!(registry.hook(&target, &CodeRef::new("mod::net", sig())).is_err());
    assert_eq!(runtime.stubs_minted(), 2);
    assert_eq!(pool.outstanding(), 1);
    assert_eq!(pool.pooled(), 1);

    let _hook = registry.hook(&target, &CodeRef::new("mod::net", sig()))?;
    assert_eq!(runtime.stubs_minted(), 2);
    assert_eq!(pool.outstanding(), 2);
    assert_eq!(pool.pooled(), 0);
    Ok(())
}

/// Test that stubs pool per signature, so targets of different shapes never swap stubs.
#[test]
fn test_signatures_pool_separately_across_targets() -> Result<()> {
    let (runtime, registry) = setup();
    let unit = CodeRef::new("game::tick", Signature::new("() -> ()"));
    let mapper = CodeRef::new("game::scale", Signature::new("(i32) -> i32"));
    let pool = registry.trampoline_pool();

    let unit_hook = registry.hook(&unit, &CodeRef::new("mod::tick", unit.signature().clone()))?;
    let mapper_hook =
        registry.hook(&mapper, &CodeRef::new("mod::scale", mapper.signature().clone()))?;
    assert_eq!(runtime.stubs_minted(), 4);

    unit_hook.undo()?;
    mapper_hook.undo()?;
    registry.method_info(&unit).unwrap().drain_stolen()?;
    registry.method_info(&mapper).unwrap().drain_stolen()?;
    assert_eq!(pool.pooled(), 2);

    unit_hook.apply()?;
    mapper_hook.apply()?;
    assert_eq!(runtime.stubs_minted(), 4);
    assert_eq!(pool.pooled(), 0);
    Ok(())
}

/// Test that the permanent root trampoline survives empty periods, so re-hooking a
/// fully unhooked target performs no root work.
#[test]
fn test_root_trampoline_kept_across_empty_periods() -> Result<()> {
    let (runtime, registry) = setup();
    let target = CodeRef::new("game::audio", sig());

    let hook = registry.hook(&target, &CodeRef::new("mod::audio", sig()))?;
    hook.undo()?;
    registry.method_info(&target).unwrap().drain_stolen()?;
    assert_eq!(registry.trampoline_pool().outstanding(), 1);

    hook.apply()?;
    let info = registry.method_info(&target).unwrap();
    let names = trace_managed_call(&runtime, &info)?;
    assert_eq!(names, ["mod::audio", info.end_of_chain().name()]);
    Ok(())
}

proptest! {
    /// Any toggle pattern over a set of hooks conserves stubs: after undoing
    /// everything and draining the gate, each minted stub is either the chain's
    /// root trampoline or back in the pool.
    #[test]
    fn prop_hook_churn_conserves_stubs(ops in proptest::collection::vec(0..4usize, 1..40)) {
        let (runtime, registry) = setup();
        let target = CodeRef::new("game::world", sig());

        let mut hooks = Vec::new();
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            let builder = registry.build_hook(&target, &CodeRef::new(format!("{name}::world"), sig()));
            let builder = if i < 2 {
                builder.with_config(DetourConfig::new(*name).with_priority(i as i32))
            } else {
                builder
            };
            hooks.push(builder.install().unwrap());
        }

        for &i in &ops {
            if hooks[i].is_applied() {
                hooks[i].undo().unwrap();
            } else {
                hooks[i].apply().unwrap();
            }
        }

        for hook in &hooks {
            hook.undo().unwrap();
        }
        let info = registry.method_info(&target).unwrap();
        info.drain_stolen().unwrap();
        prop_assert!(!info.is_detoured());

        let pool = registry.trampoline_pool();
        prop_assert_eq!(pool.outstanding(), 1);
        prop_assert_eq!(pool.pooled(), runtime.stubs_minted() - 1);
    }
}
