//! No signal delivery on this platform

use shoal_core::ShoalResult;

use crate::context::WorkerContext;

pub fn install() -> ShoalResult<()> {
    Ok(())
}

pub fn take_pending() -> Option<i32> {
    None
}

pub fn handle_signal(_ctx: &mut WorkerContext, _signo: i32) {}

pub fn signal_end_callback(_ctx: &mut WorkerContext) {}
