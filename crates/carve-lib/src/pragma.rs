//! The standard pragma surface.
//!
//! Pragmas collected by the preprocessor dispatch to handlers before
//! compilation. A handler returns false to reject the value string.
//! Limit pragmas accept non-negative integers where 0 means unlimited.

use carve_core::{BitfieldOrder, Endian};
use carve_vm::{Limits, VirtualMachine};
use indexmap::IndexMap;

use crate::console::LogConsole;

/// Mutable runtime state a pragma handler may adjust.
pub struct PragmaContext<'a> {
    pub vm: &'a mut VirtualMachine,
    pub console: &'a mut LogConsole,
    pub debug: &'a mut bool,
    /// Validator recursion-depth bound, shared with `eval_depth`.
    pub type_depth: &'a mut u64,
}

/// A pragma handler: receives the value string, returns acceptance.
pub type PragmaHandler = Box<dyn FnMut(&mut PragmaContext<'_>, &str) -> bool>;

fn parse_limit(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

fn update_limits(vm: &mut VirtualMachine, update: impl FnOnce(&mut Limits)) {
    let mut limits = vm.limits();
    update(&mut limits);
    vm.set_limits(limits);
}

/// Install the built-in pragma handlers.
pub(crate) fn register_standard(handlers: &mut IndexMap<String, PragmaHandler>) {
    handlers.insert(
        "endian".to_owned(),
        Box::new(|ctx, value| {
            let endian = match value {
                "big" => Endian::Big,
                "little" => Endian::Little,
                "native" => Endian::native(),
                _ => return false,
            };
            ctx.vm.set_default_endian(endian);
            true
        }),
    );

    handlers.insert(
        "eval_depth".to_owned(),
        Box::new(|ctx, value| {
            let Some(limit) = parse_limit(value) else {
                return false;
            };
            update_limits(ctx.vm, |limits| limits.eval_depth = limit);
            *ctx.type_depth = limit;
            true
        }),
    );

    handlers.insert(
        "array_limit".to_owned(),
        Box::new(|ctx, value| {
            let Some(limit) = parse_limit(value) else {
                return false;
            };
            update_limits(ctx.vm, |limits| limits.array_limit = limit);
            true
        }),
    );

    handlers.insert(
        "pattern_limit".to_owned(),
        Box::new(|ctx, value| {
            let Some(limit) = parse_limit(value) else {
                return false;
            };
            update_limits(ctx.vm, |limits| limits.pattern_limit = limit);
            true
        }),
    );

    handlers.insert(
        "loop_limit".to_owned(),
        Box::new(|ctx, value| {
            let Some(limit) = parse_limit(value) else {
                return false;
            };
            update_limits(ctx.vm, |limits| limits.loop_limit = limit);
            true
        }),
    );

    handlers.insert(
        "bitfield_order".to_owned(),
        Box::new(|ctx, value| {
            let order = match value {
                "left_to_right" => BitfieldOrder::LeftToRight,
                "right_to_left" => BitfieldOrder::RightToLeft,
                _ => return false,
            };
            ctx.vm.set_default_bitfield_order(order);
            true
        }),
    );

    handlers.insert(
        "debug".to_owned(),
        Box::new(|ctx, value| {
            if !value.is_empty() {
                return false;
            }
            *ctx.debug = true;
            true
        }),
    );
}
