//! Integration tests for hook handle lifecycle and registry bookkeeping.
//!
//! Covers apply/undo/dispose idempotence, entry redirect engagement, failure recovery,
//! event delivery, ambient context inheritance, and the native hook family.

use hookchain::testing::{trace_managed_call, trace_native_call, MockRuntime};
use hookchain::{prelude::*, Result};
use std::sync::{Arc, Mutex};

fn sig() -> Signature {
    Signature::new("() -> ()")
}

fn setup() -> (Arc<MockRuntime>, DetourRegistry) {
    let runtime = MockRuntime::new();
    let registry = DetourRegistry::new(runtime.clone(), runtime.clone());
    (runtime, registry)
}

/// Test that installing a hook engages the target's entry and shows up in snapshots.
#[test]
fn test_install_applies_and_registers() -> Result<()> {
    let (runtime, registry) = setup();
    let target = CodeRef::new("game::update", sig());
    assert!(registry.method_info(&target).is_none());

    let hook = registry.hook(&target, &CodeRef::new("mod::update", sig()))?;
    assert!(hook.is_applied());
    assert!(!hook.is_disposed());
    assert_eq!(hook.target(), &target);

    let info = registry.method_info(&target).unwrap();
    assert!(info.is_detoured());
    assert_eq!(info.detour_count(), 1);
    assert_eq!(info.detours()[0].entry().name(), "mod::update");
    assert!(runtime.resolve(&target).is_some());
    Ok(())
}

/// Test that undoing the last hook withdraws the entry redirect entirely, so the
/// original body runs with no interposed proxy.
#[test]
fn test_last_undo_withdraws_entry_redirect() -> Result<()> {
    let (runtime, registry) = setup();
    let target = CodeRef::new("game::render", sig());

    let hook = registry.hook(&target, &CodeRef::new("mod::render", sig()))?;
    assert!(runtime.resolve(&target).is_some());

    hook.undo()?;
    assert!(runtime.resolve(&target).is_none());
    let info = registry.method_info(&target).unwrap();
    assert!(!info.is_detoured());
    assert_eq!(trace_managed_call(&runtime, &info)?, Vec::<String>::new());
    Ok(())
}

/// Test that apply and undo are idempotent at the handle level.
#[test]
fn test_apply_and_undo_are_idempotent() -> Result<()> {
    let (_runtime, registry) = setup();
    let target = CodeRef::new("game::tick", sig());
    let hook = registry.hook(&target, &CodeRef::new("mod::tick", sig()))?;

    hook.apply()?;
    hook.apply()?;
    assert_eq!(registry.method_info(&target).unwrap().detour_count(), 1);

    hook.undo()?;
    hook.undo()?;
    assert!(!hook.is_applied());
    assert_eq!(registry.method_info(&target).unwrap().detour_count(), 0);

    hook.apply()?;
    assert!(hook.is_applied());
    assert_eq!(registry.method_info(&target).unwrap().detour_count(), 1);
    Ok(())
}

/// Test that dispose undoes the hook, is idempotent, and permanently retires the handle.
#[test]
fn test_dispose_is_terminal() -> Result<()> {
    let (_runtime, registry) = setup();
    let target = CodeRef::new("game::input", sig());
    let hook = registry.hook(&target, &CodeRef::new("mod::input", sig()))?;

    hook.dispose()?;
    hook.dispose()?;
    assert!(hook.is_disposed());
    assert!(!hook.is_applied());
    assert_eq!(registry.method_info(&target).unwrap().detour_count(), 0);

    assert!(matches!(hook.apply(), Err(Error::HookDisposed)));
    assert!(matches!(hook.undo(), Err(Error::HookDisposed)));
    Ok(())
}

/// Test that a hook built with apply_by_default(false) waits for an explicit apply.
#[test]
fn test_deferred_hook_applies_on_demand() -> Result<()> {
    let (runtime, registry) = setup();
    let target = CodeRef::new("game::audio", sig());

    let hook = registry
        .build_hook(&target, &CodeRef::new("mod::audio", sig()))
        .apply_by_default(false)
        .install()?;
    assert!(!hook.is_applied());
    assert!(hook.detour_info().is_none());
    assert!(runtime.resolve(&target).is_none());

    hook.apply()?;
    assert!(hook.is_applied());
    assert_eq!(hook.detour_info().unwrap().entry().name(), "mod::audio");
    Ok(())
}

/// Test that dropping a hook handle undoes and disposes it.
#[test]
fn test_drop_undoes_the_hook() -> Result<()> {
    let (runtime, registry) = setup();
    let target = CodeRef::new("game::physics", sig());

    let hook = registry.hook(&target, &CodeRef::new("mod::physics", sig()))?;
    assert!(runtime.resolve(&target).is_some());

    drop(hook);
    assert!(runtime.resolve(&target).is_none());
    assert_eq!(registry.method_info(&target).unwrap().detour_count(), 0);
    Ok(())
}

/// Test that a failed apply leaves the target clean and the handle reusable.
#[test]
fn test_failed_apply_leaves_target_clean() -> Result<()> {
    let (runtime, registry) = setup();
    let target = CodeRef::new("game::net", sig());

    runtime.fail_next_detour("flash write failed");
    let failed = registry.hook(&target, &CodeRef::new("mod::net", sig()));
    assert!(matches!(failed, Err(Error::Backend(ref m)) if m == "flash write failed"));

    // membership and entry are as if the add never happened, and the rented
    // trampoline went back to the pool
    let info = registry.method_info(&target).unwrap();
    assert!(!info.is_detoured());
    assert!(runtime.resolve(&target).is_none());
    assert_eq!(registry.trampoline_pool().pooled(), 1);

    let hook = registry.hook(&target, &CodeRef::new("mod::net", sig()))?;
    assert!(hook.is_applied());
    let names = trace_managed_call(&runtime, &registry.method_info(&target).unwrap())?;
    assert_eq!(names[0], "mod::net");
    Ok(())
}

/// Test that a failed undo still detaches the hook and that the next successful
/// rebuild heals the chain linkage.
#[test]
fn test_failed_undo_detaches_and_next_rebuild_heals() -> Result<()> {
    let (runtime, registry) = setup();
    let target = CodeRef::new("game::ai", sig());

    let _a = registry.hook(&target, &CodeRef::new("a::ai", sig()))?;
    let b = registry.hook(&target, &CodeRef::new("b::ai", sig()))?;

    runtime.fail_next_detour("patch site busy");
    assert!(matches!(b.undo(), Err(Error::Backend(_))));
    // the hook counts as undone; membership changed even though the relink failed
    assert!(!b.is_applied());
    assert_eq!(registry.method_info(&target).unwrap().detour_count(), 1);

    // the root link is dangling until the next rebuild re-points it
    let degraded = trace_managed_call(&runtime, &registry.method_info(&target).unwrap());
    assert!(matches!(degraded, Err(Error::Backend(_))));

    let _c = registry.hook(&target, &CodeRef::new("c::ai", sig()))?;
    let info = registry.method_info(&target).unwrap();
    let names = trace_managed_call(&runtime, &info)?;
    assert_eq!(
        names,
        ["c::ai", "a::ai", info.end_of_chain().name()]
    );
    Ok(())
}

/// Test that apply and undo each publish one event carrying the detour's identity.
#[test]
fn test_events_report_apply_and_undo() -> Result<()> {
    let (_runtime, registry) = setup();
    let target = CodeRef::new("game::hud", sig());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let _subscription = registry.on_event(EventMask::ALL, move |event| {
        let line = match event {
            DetourEvent::DetourApplied(e) => format!("+{}", e.entry.name()),
            DetourEvent::DetourUndone(e) => format!("-{}", e.target.name()),
            DetourEvent::NativeDetourApplied(e) => format!("+{}", e.callback.name()),
            DetourEvent::NativeDetourUndone(e) => format!("-{}", e.callback.name()),
        };
        sink.lock().unwrap().push(line);
    });

    let hook = registry
        .build_hook(&target, &CodeRef::new("mod::hud", sig()))
        .with_config(DetourConfig::new("hud"))
        .install()?;
    hook.undo()?;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), ["+mod::hud", "-game::hud"]);
    Ok(())
}

/// Test that the subscription mask filters and that dropping it unsubscribes.
#[test]
fn test_event_mask_and_unsubscribe() -> Result<()> {
    let (_runtime, registry) = setup();
    let target = CodeRef::new("game::menu", sig());
    let undone = Arc::new(Mutex::new(0u32));

    let counter = Arc::clone(&undone);
    let subscription = registry.on_event(EventMask::DETOUR_UNDONE, move |_| {
        *counter.lock().unwrap() += 1;
    });

    let hook = registry.hook(&target, &CodeRef::new("mod::menu", sig()))?;
    hook.undo()?;
    assert_eq!(*undone.lock().unwrap(), 1);

    drop(subscription);
    hook.apply()?;
    hook.undo()?;
    assert_eq!(*undone.lock().unwrap(), 1);
    Ok(())
}

/// Test that hooks inherit the innermost ambient config and that explicit settings
/// take precedence over it.
#[test]
fn test_ambient_config_inheritance() -> Result<()> {
    let (_runtime, registry) = setup();
    let target = CodeRef::new("game::world", sig());

    let scope = DetourContext::new()
        .with_config(DetourConfig::new("ambient.mod"))
        .push();

    let inherited = registry.hook(&target, &CodeRef::new("a::world", sig()))?;
    assert_eq!(inherited.config().unwrap().id(), "ambient.mod");

    let explicit = registry
        .build_hook(&target, &CodeRef::new("b::world", sig()))
        .with_config(DetourConfig::new("explicit.mod"))
        .install()?;
    assert_eq!(explicit.config().unwrap().id(), "explicit.mod");

    let suppressed = registry
        .build_hook(&target, &CodeRef::new("c::world", sig()))
        .without_config()
        .install()?;
    assert!(suppressed.config().is_none());

    drop(scope);
    let plain = registry.hook(&target, &CodeRef::new("d::world", sig()))?;
    assert!(plain.config().is_none());
    Ok(())
}

/// Test the native hook family end to end: apply, walk, undo, re-apply, dispose.
#[test]
fn test_native_hook_lifecycle() -> Result<()> {
    let (runtime, registry) = setup();
    let function = runtime.mint_function();
    assert!(registry.function_info(function).is_none());

    let hook = registry.hook_function(function, &NativeCallback::new("guard", true))?;
    assert!(hook.is_applied());
    assert_eq!(hook.function(), function);
    assert_eq!(hook.callback().name(), "guard");

    let info = registry.function_info(function).unwrap();
    assert!(info.is_detoured());
    let original = format!("orig@{}", runtime.orig_entrypoint_of(function).unwrap());
    assert_eq!(trace_native_call(&runtime, &info)?, ["guard", original.as_str()]);

    hook.undo()?;
    assert!(runtime.resolve_native(function).is_none());
    let info = registry.function_info(function).unwrap();
    assert_eq!(trace_native_call(&runtime, &info)?, Vec::<String>::new());

    hook.apply()?;
    assert!(hook.is_applied());
    hook.dispose()?;
    assert!(hook.is_disposed());
    assert!(matches!(hook.apply(), Err(Error::HookDisposed)));
    assert!(runtime.resolve_native(function).is_none());
    Ok(())
}

/// Test that removing a native callback poisons its continuation cell, so a stale
/// reference raises instead of jumping into a dead chain position.
#[test]
fn test_removed_native_callback_poisons_stale_next() -> Result<()> {
    let (runtime, registry) = setup();
    let function = runtime.mint_function();

    let _outer = registry.hook_function(function, &NativeCallback::new("outer", true))?;
    let inner = registry.hook_function(function, &NativeCallback::new("inner", true))?;

    // snapshot taken while inner is still the chain head
    let stale = registry.function_info(function).unwrap();
    assert_eq!(stale.detours()[0].callback().name(), "inner");

    inner.undo()?;

    // the stale snapshot's continuation now loads the raising removed callback
    let next = stale.detours()[0].next().unwrap();
    assert_eq!(next.name(), "removed");
    assert!(!next.wants_next());

    let fresh = registry.function_info(function).unwrap();
    let original = format!("orig@{}", runtime.orig_entrypoint_of(function).unwrap());
    assert_eq!(trace_native_call(&runtime, &fresh)?, ["outer", original.as_str()]);
    Ok(())
}

/// Test that a native hook's snapshot entry exposes its config and live continuation.
#[test]
fn test_native_detour_info_reflects_chain() -> Result<()> {
    let (runtime, registry) = setup();
    let function = runtime.mint_function();

    let first = registry
        .build_function_hook(function, &NativeCallback::new("first", true))
        .with_config(DetourConfig::new("first").with_priority(5))
        .install()?;
    let _second = registry
        .build_function_hook(function, &NativeCallback::new("second", true))
        .with_config(DetourConfig::new("second").with_priority(1))
        .install()?;

    let info = first.detour_info().unwrap();
    assert_eq!(info.callback().name(), "first");
    assert_eq!(info.config().unwrap().id(), "first");
    assert_eq!(info.next().unwrap().name(), "second");
    Ok(())
}
